use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
  mpsc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use diesel::SqliteConnection;
use diesel::connection::{AnsiTransactionManager, TransactionManager};
use log::{debug, error, warn};

use super::{StorageError, operation_error};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 5);
pub const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared flag raised by an operator interrupt. Guarded transactions check it
/// at every checkpoint and roll back once it is set.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
  cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }
}

/// Background timer. Marks itself expired (and runs `on_expire`) unless it is
/// dropped before `timeout` elapses.
pub struct Watchdog {
  expired: Arc<AtomicBool>,
  disarm: Option<mpsc::Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl Watchdog {
  pub fn arm<F>(timeout: Duration, on_expire: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    debug!("Set timer for {} seconds...", timeout.as_secs_f64());
    let expired = Arc::new(AtomicBool::new(false));
    let (disarm, armed) = mpsc::channel::<()>();
    let flag = Arc::clone(&expired);
    let handle = thread::spawn(move || {
      if let Err(mpsc::RecvTimeoutError::Timeout) = armed.recv_timeout(timeout) {
        flag.store(true, Ordering::SeqCst);
        on_expire();
      }
    });
    Watchdog {
      expired,
      disarm: Some(disarm),
      handle: Some(handle),
    }
  }

  pub fn expired(&self) -> bool {
    self.expired.load(Ordering::SeqCst)
  }
}

impl Drop for Watchdog {
  fn drop(&mut self) {
    // Dropping the sender wakes the timer thread with `Disconnected`.
    drop(self.disarm.take());
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
    debug!("Timer canceled");
  }
}

/// Runs units of work inside a database transaction bounded by a wall-clock
/// timeout and an operator cancellation token.
///
/// Work is cooperative: every access to the connection goes through
/// [`GuardedTransaction::conn`], which fails once the watchdog fired or the
/// token was cancelled. Any error, panic or early return drops the
/// [`GuardedTransaction`], whose destructor rolls the transaction back.
#[derive(Clone, Debug)]
pub struct TransactionGuard {
  timeout: Duration,
  rollback_timeout: Duration,
  cancel: CancellationToken,
}

impl Default for TransactionGuard {
  fn default() -> Self {
    Self::new(DEFAULT_TIMEOUT, DEFAULT_ROLLBACK_TIMEOUT, CancellationToken::new())
  }
}

impl TransactionGuard {
  pub fn new(timeout: Duration, rollback_timeout: Duration, cancel: CancellationToken) -> Self {
    TransactionGuard {
      timeout,
      rollback_timeout,
      cancel,
    }
  }

  pub fn run<T, F>(&self, conn: &mut SqliteConnection, work: F) -> Result<T, StorageError>
  where
    F: FnOnce(&mut GuardedTransaction<'_>) -> Result<T, StorageError>,
  {
    if self.cancel.is_cancelled() {
      return Err(StorageError::Interrupted);
    }

    let timeout = self.timeout;
    let watchdog = Watchdog::arm(timeout, move || {
      warn!(
        "Transaction took more than {} seconds, it will be rolled back.",
        timeout.as_secs()
      );
    });

    AnsiTransactionManager::begin_transaction(conn).map_err(operation_error)?;
    debug!("Open guarded transaction");

    let mut tx = GuardedTransaction {
      conn,
      watchdog: &watchdog,
      cancel: &self.cancel,
      timeout,
      rollback_timeout: self.rollback_timeout,
      open: true,
    };
    let value = work(&mut tx)?;
    tx.commit()?;
    Ok(value)
  }
}

/// An open transaction handed to a unit of work by [`TransactionGuard::run`].
pub struct GuardedTransaction<'a> {
  conn: &'a mut SqliteConnection,
  watchdog: &'a Watchdog,
  cancel: &'a CancellationToken,
  timeout: Duration,
  rollback_timeout: Duration,
  open: bool,
}

impl GuardedTransaction<'_> {
  pub fn checkpoint(&self) -> Result<(), StorageError> {
    if self.watchdog.expired() {
      return Err(StorageError::TransactionTimeout(self.timeout.as_secs()));
    }
    if self.cancel.is_cancelled() {
      return Err(StorageError::Interrupted);
    }
    Ok(())
  }

  /// The underlying connection, available only while the unit is still within bounds.
  pub fn conn(&mut self) -> Result<&mut SqliteConnection, StorageError> {
    self.checkpoint()?;
    Ok(&mut *self.conn)
  }

  /// Runs `work` inside a savepoint: its failure only undoes its own changes.
  pub fn savepoint<T, F>(&mut self, work: F) -> Result<T, StorageError>
  where
    F: FnOnce(&mut Self) -> Result<T, StorageError>,
  {
    AnsiTransactionManager::begin_transaction(self.conn()?).map_err(operation_error)?;
    match work(self) {
      Ok(value) => {
        AnsiTransactionManager::commit_transaction(&mut *self.conn).map_err(operation_error)?;
        Ok(value)
      }
      Err(e) => {
        if let Err(rollback) = AnsiTransactionManager::rollback_transaction(&mut *self.conn) {
          warn!("Could not roll back savepoint: {}", rollback);
        }
        Err(e)
      }
    }
  }

  fn commit(mut self) -> Result<(), StorageError> {
    self.checkpoint()?;
    AnsiTransactionManager::commit_transaction(&mut *self.conn).map_err(operation_error)?;
    self.open = false;
    debug!("Guarded transaction committed");
    Ok(())
  }
}

impl Drop for GuardedTransaction<'_> {
  fn drop(&mut self) {
    if !self.open {
      return;
    }
    warn!("An error occurred during transaction, session is rolled back.");

    let limit = self.rollback_timeout;
    let _abort = Watchdog::arm(limit, move || {
      error!(
        "Rollback did not complete within {} seconds, aborting.",
        limit.as_secs()
      );
      std::process::exit(1);
    });
    // Unwinds savepoints left open by a failed nested unit, then the transaction itself.
    while AnsiTransactionManager::rollback_transaction(&mut *self.conn).is_ok() {}
  }
}
