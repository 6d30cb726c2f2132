pub mod dispatch;
mod local;
mod pbs;
mod slurm;

#[cfg(test)]
mod tests;

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use hashlink::LinkedHashMap;
use log::debug;
use nix::unistd::{User, getuid};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::core::cache::{Memoized, ResultCache};

pub use dispatch::{CommandDispatcher, DispatchError, DispatchRequest, Dispatcher};
pub use pbs::{QstatQueue, array_size_of, parse_qstat};
pub use slurm::{SqueueQueue, parse_squeue};

#[derive(
  Serialize, Deserialize, EnumString, Display, Debug, PartialEq, Eq, Clone, Copy, Default,
)]
#[strum(ascii_case_insensitive)]
pub enum Scheduler {
  Local,
  Slurm,
  #[default]
  Pbs,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
  #[error("Command `{command}` failed ({status}): {stderr}")]
  CommandFailed {
    command: String,
    status: String,
    stderr: String,
  },
  #[error("IO Error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Unexpected scheduler output: {0}")]
  ParseError(String),
  #[error("Invalid array request: {0}")]
  InvalidArrayRequest(String),
  #[error("Could not determine the current user")]
  UnknownUser,
}

/// One job (or job array) currently known to a scheduler.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueEntry {
  pub id: String,
  /// Number of sub-jobs the entry stands for; 1 when it is not an array.
  pub array_size: usize,
  pub attributes: LinkedHashMap<String, String>,
}

pub trait QueueSource {
  /// Entries queued or running, restricted to `username` when given.
  fn entries(&self, username: Option<&str>) -> Result<Vec<QueueEntry>, SchedulerError>;

  fn count_submitted(&self, username: Option<&str>) -> Result<usize, SchedulerError> {
    Ok(self.entries(username)?.iter().map(|entry| entry.array_size).sum())
  }

  /// Forgets anything remembered about the queue.
  fn refresh(&self) {}
}

pub fn get_queue_source(scheduler: Scheduler) -> Arc<dyn QueueSource + Send + Sync> {
  match scheduler {
    Scheduler::Local => Arc::new(local::LocalQueue),
    Scheduler::Slurm => Arc::new(SqueueQueue),
    Scheduler::Pbs => Arc::new(QstatQueue),
  }
}

pub const QUEUE_ENTRIES: &str = "queue_entries";

/// Queue source whose answers are reused for a short while.
pub struct CachedQueueSource {
  entries: Memoized<Option<String>, Vec<QueueEntry>, SchedulerError>,
}

impl CachedQueueSource {
  pub fn new(inner: Arc<dyn QueueSource + Send + Sync>, cache: &Arc<ResultCache>, timeout: Duration) -> Self {
    let entries = cache.memoize(QUEUE_ENTRIES, timeout, move |username: &Option<String>| {
      inner.entries(username.as_deref())
    });
    CachedQueueSource { entries }
  }
}

impl QueueSource for CachedQueueSource {
  fn entries(&self, username: Option<&str>) -> Result<Vec<QueueEntry>, SchedulerError> {
    self.entries.call(&username.map(str::to_string))
  }

  fn refresh(&self) {
    self.entries.invalidate();
  }
}

pub fn current_username() -> Result<String, SchedulerError> {
  match User::from_uid(getuid()) {
    Ok(Some(user)) => return Ok(user.name),
    Ok(None) => debug!("Current uid has no passwd entry"),
    Err(e) => debug!("Could not read passwd entry: {}", e),
  }
  std::env::var("USER").map_err(|_| SchedulerError::UnknownUser)
}

/// Runs a scheduler query tool and returns its standard output.
fn run_command(program: &str, args: &[&str]) -> Result<String, SchedulerError> {
  debug!("Running {} {}", program, args.join(" "));
  let output = Command::new(program).args(args).output()?;
  if !output.status.success() {
    return Err(SchedulerError::CommandFailed {
      command: format!("{} {}", program, args.join(" ")),
      status: output.status.to_string(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
