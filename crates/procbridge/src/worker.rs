//! Pipe bridge workers.
//!
//! A reader drains a pipe into a bounded queue (stdout/stderr), the writer
//! drains a bounded queue into a pipe (stdin). Each worker owns exactly one
//! pipe end and one queue endpoint, confirms it has started through a
//! one-shot signal, and completes when its task returns.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pipe::Stream;
use crate::relay::{self, Chunk};

/// Cancellation handles a worker observes besides its own queue.
#[derive(Debug, Clone, Default)]
pub struct WorkerTokens {
    /// Closes the stdin queue from the consumer side; buffered chunks are
    /// still written.
    pub close_stdin: CancellationToken,
    /// Abandons the pipe without waiting for end-of-stream (process released
    /// or session reset).
    pub detach: CancellationToken,
}

/// Copy `stream` from `pipe` into `queue` until end-of-stream.
pub async fn read_output(
    stream: Stream,
    mut pipe: pipe::Receiver,
    queue: mpsc::Sender<Chunk>,
    chunk_size: usize,
    detach: CancellationToken,
    started: oneshot::Sender<()>,
) {
    let mut buf = vec![0u8; chunk_size.max(1)];
    relay::notify(started);

    loop {
        let read = tokio::select! {
            biased;
            () = detach.cancelled() => {
                debug!(%stream, "Reader detached before end-of-stream");
                break;
            }
            read = pipe.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                if !relay::forward(&queue, relay::copy_chunk(&buf[..n])).await {
                    warn!(%stream, "Output queue closed, dropping remaining output");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(%stream, error = %e, "Failed to read from pipe");
                break;
            }
        }
    }

    drop(pipe);
    drop(queue);
}

/// Write every chunk from `queue` into the child's stdin `pipe`.
pub async fn write_input(
    mut pipe: pipe::Sender,
    mut queue: mpsc::Receiver<Chunk>,
    tokens: WorkerTokens,
    started: oneshot::Sender<()>,
) {
    let mut closing = false;
    relay::notify(started);

    loop {
        let next = tokio::select! {
            biased;
            () = tokens.detach.cancelled() => break,
            () = tokens.close_stdin.cancelled(), if !closing => {
                // Refuse new chunks but keep draining what is buffered.
                queue.close();
                closing = true;
                continue;
            }
            next = queue.recv() => next,
        };
        let Some(chunk) = next else {
            break;
        };

        tokio::select! {
            biased;
            () = tokens.detach.cancelled() => break,
            result = write_chunk(&mut pipe, &chunk) => {
                if let Err(e) = result {
                    warn!(error = %e, len = chunk.len(), "Failed to write chunk to stdin");
                }
            }
        }
    }

    drop(pipe);
}

/// Write the whole chunk, retrying partial writes.
async fn write_chunk(pipe: &mut pipe::Sender, chunk: &[u8]) -> std::io::Result<()> {
    let mut written = 0;
    while written < chunk.len() {
        match pipe.write(&chunk[written..]).await {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::time::Duration;

    use bytes::Bytes;

    use crate::pipe::PipeSet;
    use crate::relay::spawn_confirmed;

    #[tokio::test]
    async fn reader_forwards_in_order_and_closes_queue() {
        let (session, mut child) = PipeSet::open().unwrap().split();
        let pipes = session.into_async().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut child_out = {
            let stdio = child.stdout.take().unwrap();
            pipe::Sender::from_owned_fd(stdio).unwrap()
        };
        child.close();

        let handle = spawn_confirmed(|s| {
            read_output(Stream::Stdout, pipes.stdout, tx, 4, CancellationToken::new(), s)
        })
        .await;

        child_out.write_all(b"hello world").await.unwrap();
        drop(child_out);

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            assert!(chunk.len() <= 4);
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hello world");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reader_stops_when_detached() {
        let (session, _child) = PipeSet::open().unwrap().split();
        let pipes = session.into_async().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let detach = CancellationToken::new();

        let handle = spawn_confirmed(|s| {
            read_output(Stream::Stderr, pipes.stderr, tx, 16, detach.clone(), s)
        })
        .await;
        detach.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn writer_drains_buffered_chunks_after_close() {
        let (session, mut child) = PipeSet::open().unwrap().split();
        let pipes = session.into_async().unwrap();
        let mut child_in = pipe::Receiver::from_owned_fd(child.stdin.take().unwrap()).unwrap();
        let (tx, rx) = mpsc::channel(8);
        let tokens = WorkerTokens::default();

        tx.send(Bytes::from_static(b"abc")).await.unwrap();
        tx.send(Bytes::from_static(b"def")).await.unwrap();

        let handle = spawn_confirmed(|s| write_input(pipes.stdin, rx, tokens.clone(), s)).await;
        tokens.close_stdin.cancel();
        handle.await.unwrap();

        // Queue is closed for new chunks.
        assert!(tx.send(Bytes::from_static(b"late")).await.is_err());

        let mut out = Vec::new();
        child_in.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
    }
}
