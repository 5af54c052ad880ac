//! Graceful-then-forceful termination used by `reset`.
//!
//! SIGTERM is sent up to `term_attempts` times, then a force kill up to
//! `kill_attempts` times, pausing `interval` after every successful attempt.
//! A phase stops at the first failed attempt (usually "not started", i.e. the
//! child is already gone). If the child is still registered afterwards its
//! handle is released.

use std::future::Future;

use nix::sys::signal::Signal;
use tracing::{debug, warn};

use crate::config::EscalationConfig;
use crate::error::Result;

/// Operations the escalation policy drives.
pub trait Terminate {
    fn is_running(&self) -> bool;
    fn signal(&self, sig: Signal) -> impl Future<Output = Result<()>> + Send;
    fn kill(&self) -> impl Future<Output = Result<()>> + Send;
    fn release(&self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Term,
    Kill,
}

async fn attempt<T: Terminate>(target: &T, phase: Phase, attempts: u32, policy: &EscalationConfig) {
    for n in 1..=attempts {
        if !target.is_running() {
            return;
        }
        let result = match phase {
            Phase::Term => target.signal(Signal::SIGTERM).await,
            Phase::Kill => target.kill().await,
        };
        if let Err(e) = result {
            if !e.is_not_started() {
                warn!(?phase, attempt = n, error = %e, "Termination attempt failed");
            }
            return;
        }
        debug!(?phase, attempt = n, "Termination attempt sent");
        tokio::time::sleep(policy.interval()).await;
    }
}

/// Terminate `target`, escalating as described in the module docs.
pub async fn terminate<T: Terminate>(target: &T, policy: &EscalationConfig) {
    attempt(target, Phase::Term, policy.term_attempts, policy).await;
    attempt(target, Phase::Kill, policy.kill_attempts, policy).await;

    if target.is_running() {
        warn!("Process survived termination, releasing its handle");
        if let Err(e) = target.release().await
            && !e.is_not_started()
        {
            warn!(error = %e, "Failed to release process handle");
        }
    }
}
