//! Bounded hand-off queue between two stages
//!
//! A full queue blocks the producer in [`StageQueue::push`], which is the only
//! backpressure between stages. Once the producer is done it calls
//! [`StageQueue::seal`]; the consumer sees [`StageQueue::is_exhausted`] after
//! draining whatever is left. A consumer that leaves for good calls
//! [`StageQueue::close`], which also fails producers blocked on a full queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stage queue is sealed")]
pub struct QueueSealed;

pub struct StageQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    pending: AtomicUsize,
    sealed: AtomicBool,
    capacity: usize,
}

impl<T: Send> StageQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue one item, waiting while the queue is full
    pub async fn push(&self, item: T) -> Result<(), QueueSealed> {
        // Count first so a concurrent consumer never sees an empty sealed
        // queue while an accepted item is still in flight
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sealed.load(Ordering::SeqCst) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueSealed);
        }
        if self.tx.send(item).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueSealed);
        }
        Ok(())
    }

    /// Wait up to `timeout` for the next item
    pub async fn wait_event(&self, timeout: Duration) -> Option<T> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(item)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Some(item)
            }
            Ok(None) | Err(_) => None,
        }
    }

    /// Take the next item if one is ready
    pub async fn poll(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        let item = rx.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(item)
    }

    /// Mark the queue permanently closed for new items
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    /// Seal the queue, wake blocked producers with [`QueueSealed`] and drop
    /// whatever is still buffered. Returns the number of dropped items.
    pub async fn close(&self) -> usize {
        self.seal();
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            dropped += 1;
        }
        dropped
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sealed and fully drained
    pub fn is_exhausted(&self) -> bool {
        self.is_sealed() && self.is_empty()
    }
}
