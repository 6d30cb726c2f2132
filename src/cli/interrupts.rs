
use log::debug;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;

use crate::core::database::guard::CancellationToken;

const INTERRUPTS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

static INTERRUPT_TOKEN: OnceCell<CancellationToken> = OnceCell::new();

extern "C" fn handle_interrupt(_signal: nix::libc::c_int) {
  if let Some(token) = INTERRUPT_TOKEN.get() {
    token.cancel();
  }
  // A second interrupt terminates the process right away.
  for interrupt in INTERRUPTS {
    // SAFETY: restoring the default disposition is async-signal-safe.
    unsafe {
      let _ = signal::signal(interrupt, SigHandler::SigDfl);
    }
  }
}

/// While alive, SIGINT and SIGTERM cancel `token` instead of killing the
/// process, so that open transactions roll back. The previous handlers are
/// restored on drop.
pub struct InterruptScope {
  previous: Vec<(Signal, SigAction)>,
}

impl InterruptScope {
  pub fn install(token: &CancellationToken) -> nix::Result<Self> {
    if INTERRUPT_TOKEN.set(token.clone()).is_err() {
      debug!("Interrupt token already installed");
    }
    let action = SigAction::new(
      SigHandler::Handler(handle_interrupt),
      SaFlags::empty(),
      SigSet::empty(),
    );
    let mut scope = InterruptScope {
      previous: Vec::with_capacity(INTERRUPTS.len()),
    };
    for interrupt in INTERRUPTS {
      // SAFETY: the handler only stores to atomics and resets dispositions.
      let previous = unsafe { signal::sigaction(interrupt, &action) }?;
      scope.previous.push((interrupt, previous));
    }
    Ok(scope)
  }
}

impl Drop for InterruptScope {
  fn drop(&mut self) {
    for (interrupt, previous) in self.previous.drain(..).rev() {
      // SAFETY: reinstalls the disposition that was active before `install`.
      if let Err(e) = unsafe { signal::sigaction(interrupt, &previous) } {
        debug!("Could not restore handler for {}: {}", interrupt, e);
      }
    }
  }
}
