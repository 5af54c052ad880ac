//! Requests against the live child.
//!
//! The exit waiter owns the `tokio::process::Child`; everyone else talks to it
//! through a [`ProcessControl`]. Signals therefore never reach a reused PID:
//! once the waiter has collected the exit status it drops its request queue
//! and every later request fails with [`Error::NotStarted`].

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

type Reply = oneshot::Sender<Result<()>>;

/// Capacity of the request queue; callers wait for their reply anyway.
pub const REQUEST_CAPACITY: usize = 8;

#[derive(Debug)]
pub enum Request {
    Signal(Signal, Reply),
    Kill(Reply),
    /// Give up ownership of the child without waiting for it.
    Release(Reply),
}

/// Cloneable handle to the exit waiter of one run.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    pid: u32,
    requests: mpsc::Sender<Request>,
}

impl ProcessControl {
    pub fn channel(pid: u32) -> (Self, mpsc::Receiver<Request>) {
        let (requests, rx) = mpsc::channel(REQUEST_CAPACITY);
        (Self { pid, requests }, rx)
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Request) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::NotStarted)?;
        reply_rx.await.map_err(|_| Error::NotStarted)?
    }

    pub async fn signal(&self, sig: Signal) -> Result<()> {
        self.request(|reply| Request::Signal(sig, reply)).await
    }

    pub async fn kill(&self) -> Result<()> {
        self.request(Request::Kill).await
    }

    pub async fn release(&self) -> Result<()> {
        self.request(Request::Release).await
    }
}

/// Deliver `sig` to a child that has not been reaped yet.
pub fn send_signal(child: &Child, pid: u32, sig: Signal) -> Result<()> {
    let Some(id) = child.id() else {
        return Err(Error::NotStarted);
    };
    #[allow(clippy::cast_possible_wrap)]
    signal::kill(Pid::from_raw(id as i32), sig).map_err(|source| Error::Signal {
        pid,
        signal: sig,
        source,
    })
}

/// Force-kill a child that has not been reaped yet.
pub fn kill_child(child: &mut Child, pid: u32) -> Result<()> {
    child.start_kill().map_err(|e| Error::Kill {
        pid,
        source: e.into(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requests_after_waiter_is_gone_report_not_started() {
        let (control, rx) = ProcessControl::channel(42);
        drop(rx);
        assert!(control.kill().await.unwrap_err().is_not_started());
        assert!(
            control
                .signal(Signal::SIGTERM)
                .await
                .unwrap_err()
                .is_not_started()
        );
    }

    #[tokio::test]
    async fn replies_are_routed_back() {
        let (control, mut rx) = ProcessControl::channel(7);
        let server = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    Request::Signal(sig, reply) => {
                        let _ = reply.send(Err(Error::Signal {
                            pid: 7,
                            signal: sig,
                            source: nix::errno::Errno::EPERM,
                        }));
                    }
                    Request::Kill(reply) | Request::Release(reply) => {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
        });

        assert_eq!(control.pid(), 7);
        control.kill().await.unwrap();
        let err = control.signal(Signal::SIGHUP).await.unwrap_err();
        assert!(matches!(err, Error::Signal { signal: Signal::SIGHUP, .. }));

        drop(control);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_reply_reports_not_started() {
        let (control, mut rx) = ProcessControl::channel(1);
        tokio::spawn(async move {
            // Drop the request, and with it the reply sender.
            let _ = rx.recv().await;
        });
        assert!(control.release().await.unwrap_err().is_not_started());
    }

    #[tokio::test]
    async fn signals_reach_a_real_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        send_signal(&child, pid, Signal::SIGTERM).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());

        let err = send_signal(&child, pid, Signal::SIGTERM).unwrap_err();
        assert!(err.is_not_started());
    }
}
