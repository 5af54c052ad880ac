//! Exit waiter: owns the child, serves control requests and tears the run
//! down once the child is gone.

use std::process::ExitStatus;

use tokio::process::Child;
use tokio::sync::{OwnedMutexGuard, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::control::{self, Request};
use crate::error::Error;
use crate::pipe::ChildEnds;
use crate::relay;
use crate::state::{DebugFlag, SharedRecord};
use crate::worker::WorkerTokens;

/// Join handles of the relay workers of one run.
pub struct Workers {
    pub writer: JoinHandle<()>,
    pub stdout_reader: JoinHandle<()>,
    pub stderr_reader: JoinHandle<()>,
}

impl Workers {
    /// Wait for every worker, logging the ones that panicked.
    pub async fn join(self) {
        for (worker, handle) in [
            ("stdin writer", self.writer),
            ("stdout reader", self.stdout_reader),
            ("stderr reader", self.stderr_reader),
        ] {
            if let Err(e) = handle.await {
                warn!(worker, error = %e, "Relay worker failed");
            }
        }
    }
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    Released,
}

pub struct ExitWaiter {
    pub child: Child,
    pub pid: u32,
    pub requests: mpsc::Receiver<Request>,
    /// Cancels the multiplexer of this run.
    pub cancel: CancellationToken,
    pub tokens: WorkerTokens,
    pub child_ends: ChildEnds,
    pub workers: Workers,
    pub multiplexer: JoinHandle<()>,
    pub record: SharedRecord,
    pub debug: DebugFlag,
    /// Held until teardown completes; `wait` and `start` synchronize on it.
    pub run_guard: OwnedMutexGuard<()>,
}

impl ExitWaiter {
    pub async fn run(self, started: oneshot::Sender<()>) {
        let Self {
            mut child,
            pid,
            mut requests,
            cancel,
            tokens,
            mut child_ends,
            workers,
            multiplexer,
            record,
            debug,
            run_guard,
        } = self;

        relay::notify(started);
        let exit = wait_for_exit(&mut child, pid, &mut requests).await;
        drop(requests);

        match exit {
            Exit::Exited(Ok(status)) => {
                if debug.is_on() {
                    debug!(pid, %status, "Process exited");
                }
                record.set_exit_status(status);
            }
            Exit::Exited(Err(e)) => {
                warn!(pid, error = %e, "Failed waiting for process");
                record.record_first_error(Error::Wait {
                    pid,
                    source: e.into(),
                });
            }
            Exit::Released => {
                if debug.is_on() {
                    debug!(pid, "Process handle released, not waiting for exit");
                }
                tokens.detach.cancel();
            }
        }
        drop(child);

        cancel.cancel();
        record.clear_active();
        tokens.close_stdin.cancel();
        let closed = child_ends.close();
        if debug.is_on() {
            debug!(pid, closed, "Closed child pipe ends");
        }

        workers.join().await;
        if let Err(e) = multiplexer.await {
            warn!(pid, error = %e, "Multiplexer failed");
        }
        if debug.is_on() {
            debug!(pid, "Run torn down");
        }
        drop(run_guard);
    }
}

async fn wait_for_exit(
    child: &mut Child,
    pid: u32,
    requests: &mut mpsc::Receiver<Request>,
) -> Exit {
    loop {
        tokio::select! {
            status = child.wait() => return Exit::Exited(status),
            request = requests.recv() => match request {
                Some(Request::Signal(sig, reply)) => {
                    let _ = reply.send(control::send_signal(child, pid, sig));
                }
                Some(Request::Kill(reply)) => {
                    let _ = reply.send(control::kill_child(child, pid));
                }
                Some(Request::Release(reply)) => {
                    let _ = reply.send(Ok(()));
                    return Exit::Released;
                }
                None => return Exit::Exited(child.wait().await),
            },
        }
    }
}
