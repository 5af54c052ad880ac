//! Byte relay primitives shared by the workers and the multiplexer.
//!
//! Closing is expressed through ownership: a queue is closed when its last
//! sender is dropped, and every holder keeps its sender in an `Option` so a
//! second close is a no-op.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Chunk of bytes travelling through the relay queues.
pub type Chunk = Bytes;

/// Copy a borrowed slice into a freshly owned chunk.
pub fn copy_chunk(data: &[u8]) -> Chunk {
    Bytes::copy_from_slice(data)
}

/// Split `data` into chunks of at most `chunk_size` bytes without copying.
pub fn split_chunks(data: Bytes, chunk_size: usize) -> impl Iterator<Item = Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut rest = data;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let at = chunk_size.min(rest.len());
        Some(rest.split_to(at))
    })
}

/// Fire a one-shot notification; a receiver that went away is not an error.
pub fn notify(signal: oneshot::Sender<()>) {
    let _ = signal.send(());
}

/// Spawn a task and wait until it confirms it has started.
///
/// The task receives the "started" signal as its argument. A task that ends
/// without confirming still unblocks the caller.
pub async fn spawn_confirmed<F, Fut>(task: F) -> JoinHandle<()>
where
    F: FnOnce(oneshot::Sender<()>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (started_tx, started_rx) = oneshot::channel();
    let handle = tokio::spawn(task(started_tx));
    let _ = started_rx.await;
    handle
}

/// Send into a queue that may already be closed.
///
/// Returns `false` when the receiving side is gone.
pub async fn forward(queue: &mpsc::Sender<Chunk>, chunk: Chunk) -> bool {
    queue.send(chunk).await.is_ok()
}

/// Optional queue endpoint that is closed at most once.
#[derive(Debug)]
pub struct Outlet {
    tx: Option<mpsc::Sender<Chunk>>,
}

impl Outlet {
    pub const fn new(tx: Option<mpsc::Sender<Chunk>>) -> Self {
        Self { tx }
    }

    /// Replace the endpoint; the previous one, if any, is closed.
    pub fn attach(&mut self, tx: mpsc::Sender<Chunk>) {
        self.tx = Some(tx);
    }

    /// Forward a chunk, waiting for room in the queue until `stop` fires.
    ///
    /// Once `stop` has fired a full queue is no longer waited on: the chunk
    /// is dropped and the outlet closed. A vanished receiver closes it too.
    pub async fn send_until(&mut self, chunk: Chunk, stop: &CancellationToken) -> bool {
        let sent = {
            let Some(tx) = &self.tx else {
                return false;
            };
            let permit = tokio::select! {
                biased;
                permit = tx.reserve() => permit.ok(),
                () = stop.cancelled() => tx.try_reserve().ok(),
            };
            match permit {
                Some(permit) => {
                    permit.send(chunk);
                    true
                }
                None => false,
            }
        };
        if !sent {
            self.tx = None;
        }
        sent
    }

    /// Close the endpoint. Returns whether it was open.
    pub fn close(&mut self) -> bool {
        self.tx.take().is_some()
    }
}

/// Accumulation buffer shared between the multiplexer and the session.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<BytesMut>>);

impl SharedBuffer {
    fn lock(&self) -> std::sync::MutexGuard<'_, BytesMut> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, data: &[u8]) {
        self.lock().extend_from_slice(data);
    }

    /// Copy of everything accumulated so far.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock())
    }

    /// Remove and return everything accumulated so far.
    pub fn take(&self) -> Bytes {
        self.lock().split().freeze()
    }

}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_chunk_size() {
        let data = Bytes::from_static(b"abcdefghij");
        let chunks: Vec<Chunk> = split_chunks(data, 4).collect();
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn split_of_empty_is_empty() {
        assert_eq!(split_chunks(Bytes::new(), 4).count(), 0);
    }

    #[test]
    fn copy_chunk_detaches_from_source() {
        let mut buf = vec![1u8, 2, 3];
        let chunk = copy_chunk(&buf[..2]);
        buf[0] = 9;
        assert_eq!(&chunk[..], &[1, 2]);
    }

    #[tokio::test]
    async fn outlet_close_is_idempotent() {
        let stop = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let mut outlet = Outlet::new(Some(tx));
        assert!(outlet.send_until(copy_chunk(b"x"), &stop).await);
        assert!(outlet.close());
        assert!(!outlet.close());
        assert!(!outlet.send_until(copy_chunk(b"y"), &stop).await);

        assert_eq!(rx.recv().await.unwrap(), "x");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn outlet_closes_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let mut outlet = Outlet::new(Some(tx));
        drop(rx);
        assert!(!outlet.send_until(copy_chunk(b"x"), &CancellationToken::new()).await);
        assert!(!outlet.close());
    }

    #[tokio::test]
    async fn full_outlet_is_abandoned_once_stopped() {
        let stop = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let mut outlet = Outlet::new(Some(tx));
        assert!(outlet.send_until(copy_chunk(b"a"), &stop).await);

        let stopper = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stopper.cancel();
        });
        // Blocks on the full queue until the token fires.
        assert!(!outlet.send_until(copy_chunk(b"b"), &stop).await);
        assert!(!outlet.close());

        assert_eq!(rx.recv().await.unwrap(), "a");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stopped_outlet_still_sends_while_there_is_room() {
        let stop = CancellationToken::new();
        stop.cancel();
        let (tx, mut rx) = mpsc::channel(2);
        let mut outlet = Outlet::new(Some(tx));
        assert!(outlet.send_until(copy_chunk(b"a"), &stop).await);
        assert_eq!(rx.recv().await.unwrap(), "a");
    }

    #[test]
    fn shared_buffer_take_empties() {
        let buf = SharedBuffer::default();
        let other = buf.clone();
        buf.append(b"ab");
        other.append(b"cd");
        assert_eq!(buf.snapshot(), "abcd");
        assert_eq!(buf.take(), "abcd");
        assert!(other.snapshot().is_empty());
    }

    #[tokio::test]
    async fn spawn_confirmed_waits_for_start() {
        let (seen_tx, mut seen_rx) = mpsc::channel(1);
        let handle = spawn_confirmed(|started| async move {
            notify(started);
            let _ = seen_tx.send(copy_chunk(b"ran")).await;
        })
        .await;
        handle.await.unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), "ran");
    }

    #[test]
    fn notify_without_receiver_does_not_fault() {
        let (tx, rx) = oneshot::channel::<()>();
        drop(rx);
        notify(tx);
    }
}
