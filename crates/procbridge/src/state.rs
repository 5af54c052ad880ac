//! State shared between a session and the tasks of its current run.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::control::ProcessControl;
use crate::error::Error;
use crate::multiplexer::Attachment;

/// Handles of the child that is currently alive.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub control: ProcessControl,
    /// Registrations made while the run is active go straight to the
    /// multiplexer.
    pub attach: mpsc::UnboundedSender<Attachment>,
}

/// Outcome bookkeeping of the current (or last) run.
#[derive(Debug, Default)]
pub struct RunRecord {
    /// Last recorded error.
    pub error: Option<Error>,
    pub exit_status: Option<ExitStatus>,
    pub active: Option<ActiveRun>,
    /// Detaches the pipe workers of the last launched run. Outlives
    /// `active`, since teardown continues after the child is reaped.
    pub detach: Option<CancellationToken>,
    /// Set once a child was spawned since the session was (re)initialized.
    pub launched: bool,
    /// Program path followed by its arguments.
    pub command: Vec<String>,
}

/// [`RunRecord`] behind a lock, cloned into every task of a run.
#[derive(Debug, Clone, Default)]
pub struct SharedRecord(Arc<Mutex<RunRecord>>);

impl SharedRecord {
    pub fn lock(&self) -> MutexGuard<'_, RunRecord> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a worker fault unless an earlier error is already recorded.
    pub fn record_first_error(&self, err: Error) {
        let mut record = self.lock();
        if record.error.is_none() {
            record.error = Some(err);
        }
    }

    pub fn set_exit_status(&self, status: ExitStatus) {
        self.lock().exit_status = Some(status);
    }

    /// Forget the live child; lifecycle calls report `NotStarted` from now on.
    pub fn clear_active(&self) {
        self.lock().active = None;
    }

    pub fn active(&self) -> Option<ActiveRun> {
        self.lock().active.clone()
    }
}

/// Runtime toggle for lifecycle diagnostics.
#[derive(Debug, Clone, Default)]
pub struct DebugFlag(Arc<AtomicBool>);

impl DebugFlag {
    pub fn set(&self, on: bool) {
        self.0.store(on, Ordering::Relaxed);
    }

    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let record = SharedRecord::default();
        record.record_first_error(Error::Released);
        record.record_first_error(Error::NotStarted);
        assert!(matches!(record.lock().error, Some(Error::Released)));
    }

    #[test]
    fn debug_flag_is_shared() {
        let flag = DebugFlag::default();
        let copy = flag.clone();
        assert!(!copy.is_on());
        flag.set(true);
        assert!(copy.is_on());
    }
}
