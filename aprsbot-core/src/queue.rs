//! Hand-off from the blocking feed thread to the bridge's async tasks.
//!
//! The producer side blocks an OS thread when the queue is full; the consumer side
//! suspends an async task until an item arrives or the queue is closed.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

/// Default number of frames buffered between the feed thread and the bridge.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Create a bounded queue. `capacity` is clamped to at least 1.
pub fn bridge_queue<T>(capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);
    (
        QueueProducer { tx },
        QueueConsumer {
            rx,
            closed: closed_rx,
            closed_tx,
        },
    )
}

/// Push side, for use from a plain OS thread (never from inside the async runtime).
#[derive(Clone)]
pub struct QueueProducer<T> {
    tx: mpsc::Sender<T>,
}

impl<T> QueueProducer<T> {
    /// Enqueue `item`, blocking while the queue is full. Fails once the consumer closed.
    pub fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        self.tx.blocking_send(item).map_err(|e| QueueClosed(e.0))
    }
}

/// Pop side, owned by the single consuming task.
pub struct QueueConsumer<T> {
    rx: mpsc::Receiver<T>,
    closed: watch::Receiver<bool>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl<T> QueueConsumer<T> {
    /// Next item in FIFO order, or `None` once closed (or every producer is gone).
    pub async fn pop(&mut self) -> Option<T> {
        if *self.closed.borrow() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => None,
            item = self.rx.recv() => item,
        }
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Handle that can close the queue from another task.
    pub fn closer(&self) -> QueueCloser {
        QueueCloser {
            tx: self.closed_tx.clone(),
        }
    }

    /// Refuse further pushes and return whatever was still buffered.
    pub fn drain(mut self) -> Vec<T> {
        self.rx.close();
        let mut rest = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            rest.push(item);
        }
        rest
    }
}

/// Closes a [`QueueConsumer`], waking a pending `pop` with `None`.
#[derive(Clone)]
pub struct QueueCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl QueueCloser {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }
}

/// Returned by [`QueueProducer::push`] after close; carries the rejected item back.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("bridge queue is closed")]
pub struct QueueClosed<T>(pub T);
