//! Deadline and cancellation checks for a run.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::errors::MigrateError;

/// Checked by the runner before every key and before committing.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Trips the cancel signal of the guard it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl RunGuard {
    /// A guard that never trips.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Attach a cancel signal and return the handle that fires it.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        self.cancel = Some(receiver);
        (self, CancelHandle { sender })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails once cancelled or past the deadline. Cancellation is reported first.
    pub fn check(&self) -> Result<(), MigrateError> {
        if let Some(cancel) = &self.cancel
            && *cancel.borrow()
        {
            return Err(MigrateError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(MigrateError::DeadlineExceeded);
        }
        Ok(())
    }
}
