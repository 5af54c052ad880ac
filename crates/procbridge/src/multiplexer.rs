//! Central event loop of a run.
//!
//! The multiplexer is the only task that touches the stdout/stderr buffers
//! while a run is live, and the only producer of the stdin queue. It selects
//! over cancellation, the "new stdin data" signal, both output queues, the
//! external stdin source and late registrations.
//!
//! Pending stdin chunks are staged locally and handed to the writer through a
//! reserved slot, so a child that stops reading stdin never stalls output
//! collection. After cancellation input is discarded, but output keeps being
//! drained until both readers have closed their queues. A mirror that is
//! still full at that point is closed rather than waited on.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::control::ProcessControl;
use crate::pipe::Stream;
use crate::relay::{self, Chunk, Outlet, SharedBuffer};
use crate::state::{DebugFlag, SharedRecord};

/// Registration made while a run is active.
#[derive(Debug)]
pub enum Attachment {
    StdoutMirror(mpsc::Sender<Chunk>),
    StderrMirror(mpsc::Sender<Chunk>),
    StdinSource(mpsc::Receiver<Chunk>),
}

/// Session-side buffers a run reads from and appends to.
#[derive(Debug, Clone, Default)]
pub struct Buffers {
    /// Bytes submitted through `stdin` that were not forwarded yet.
    pub stdin: SharedBuffer,
    pub stdout: SharedBuffer,
    pub stderr: SharedBuffer,
}

/// Queue endpoints of one run.
pub struct Queues {
    pub stdin: mpsc::Sender<Chunk>,
    pub stdout: mpsc::Receiver<Chunk>,
    pub stderr: mpsc::Receiver<Chunk>,
    pub wake: mpsc::Receiver<()>,
    pub attach: mpsc::UnboundedReceiver<Attachment>,
    pub stdin_source: Option<mpsc::Receiver<Chunk>>,
    pub stdout_mirror: Option<mpsc::Sender<Chunk>>,
    pub stderr_mirror: Option<mpsc::Sender<Chunk>>,
}

pub struct Multiplexer {
    pub cancel: CancellationToken,
    pub queues: Queues,
    pub buffers: Buffers,
    pub control: ProcessControl,
    pub record: SharedRecord,
    pub chunk_size: usize,
    /// Staged chunks are capped at this many before the external source is
    /// paused.
    pub stage_limit: usize,
    pub debug: DebugFlag,
}

impl Multiplexer {
    #[allow(clippy::too_many_lines)]
    pub async fn run(self, started: tokio::sync::oneshot::Sender<()>) {
        let Self {
            cancel,
            queues,
            buffers,
            control,
            record,
            chunk_size,
            stage_limit,
            debug,
        } = self;
        let Queues {
            stdin,
            stdout: mut stdout_rx,
            stderr: mut stderr_rx,
            mut wake,
            mut attach,
            mut stdin_source,
            stdout_mirror,
            stderr_mirror,
        } = queues;
        let mut stdout_mirror = Outlet::new(stdout_mirror);
        let mut stderr_mirror = Outlet::new(stderr_mirror);
        let mut staged: VecDeque<Chunk> = VecDeque::new();

        let mut cancelled = false;
        let mut stdin_open = true;
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut wake_open = true;
        let mut attach_open = true;

        relay::notify(started);
        if debug.is_on() {
            debug!(pid = control.pid(), "Multiplexer started");
        }

        // Bytes submitted before start are forwarded first.
        stage(&mut staged, buffers.stdin.take(), chunk_size);

        loop {
            let accepts_source = stdin_source.is_some() && !cancelled && staged.len() < stage_limit;
            tokio::select! {
                () = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    staged.clear();
                    stdin_source = None;
                    if debug.is_on() {
                        debug!(pid = control.pid(), "Run cancelled, killing process");
                    }
                    match control.kill().await {
                        Ok(()) => {}
                        Err(e) if e.is_not_started() => {}
                        Err(e) => {
                            warn!(
                                pid = control.pid(),
                                error = %e,
                                "Failed to kill cancelled process"
                            );
                            record.record_first_error(e);
                        }
                    }
                }
                signal = wake.recv(), if wake_open && !cancelled => {
                    if signal.is_none() {
                        wake_open = false;
                    }
                    stage(&mut staged, buffers.stdin.take(), chunk_size);
                }
                permit = stdin.reserve(), if stdin_open && !cancelled && !staged.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(chunk) = staged.pop_front() {
                                permit.send(chunk);
                            }
                        }
                        Err(_) => {
                            warn!(
                                pid = control.pid(),
                                dropped = staged.len(),
                                "Stdin queue closed, dropping pending input"
                            );
                            stdin_open = false;
                            staged.clear();
                        }
                    }
                }
                chunk = stdout_rx.recv(), if stdout_open => match chunk {
                    Some(chunk) => {
                        buffers.stdout.append(&chunk);
                        stdout_mirror.send_until(chunk, &cancel).await;
                    }
                    None => stdout_open = false,
                },
                chunk = stderr_rx.recv(), if stderr_open => match chunk {
                    Some(chunk) => {
                        buffers.stderr.append(&chunk);
                        stderr_mirror.send_until(chunk, &cancel).await;
                    }
                    None => stderr_open = false,
                },
                chunk = recv_source(&mut stdin_source), if accepts_source => {
                    match chunk {
                        Some(chunk) if chunk.is_empty() => {}
                        Some(chunk) => stage(&mut staged, chunk, chunk_size),
                        None => stdin_source = None,
                    }
                }
                registration = attach.recv(), if attach_open => match registration {
                    Some(Attachment::StdoutMirror(tx)) => stdout_mirror.attach(tx),
                    Some(Attachment::StderrMirror(tx)) => stderr_mirror.attach(tx),
                    Some(Attachment::StdinSource(rx)) => {
                        if !cancelled {
                            stdin_source = Some(rx);
                        }
                    }
                    None => attach_open = false,
                },
                else => break,
            }

            if cancelled && !stdout_open && !stderr_open {
                break;
            }
        }

        stdout_mirror.close();
        stderr_mirror.close();
        if debug.is_on() {
            debug!(pid = control.pid(), "Multiplexer finished");
        }
    }
}

fn stage(staged: &mut VecDeque<Chunk>, data: Chunk, chunk_size: usize) {
    staged.extend(relay::split_chunks(data, chunk_size));
}

async fn recv_source(source: &mut Option<mpsc::Receiver<Chunk>>) -> Option<Chunk> {
    match source {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
