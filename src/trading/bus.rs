//! Intent fan-out: one unbounded FIFO queue per bound follower.
//!
//! `broadcast` never blocks on a slow follower. Each queue carries the
//! position mode of its follower and receives intents re-expressed for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error};

use crate::models::{Intent, PositionMode};

/// Lifecycle violations of the bus.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("follower {follower} already has a bound queue with {pending} pending intents")]
    AlreadyBound { follower: i64, pending: usize },

    #[error("follower {0} has no bound queue")]
    NotBound(i64),
}

struct QueueHandle {
    tx: mpsc::UnboundedSender<Intent>,
    mode: PositionMode,
    pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl QueueHandle {
    fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.load(Ordering::SeqCst)
    }
}

/// Receiving end of one follower's queue.
pub struct IntentQueue {
    follower_id: i64,
    rx: mpsc::UnboundedReceiver<Intent>,
    pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl IntentQueue {
    pub fn follower_id(&self) -> i64 {
        self.follower_id
    }

    /// Next intent in FIFO order; `None` once the queue is unbound.
    pub async fn recv(&mut self) -> Option<Intent> {
        let intent = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(intent)
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Broadcast primitive over every bound queue.
#[derive(Default)]
pub struct FanoutBus {
    queues: RwLock<HashMap<i64, QueueHandle>>,
}

impl FanoutBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh queue for a follower.
    ///
    /// An existing empty queue is replaced; a non-empty one is an error.
    pub async fn bind(&self, follower_id: i64, mode: PositionMode) -> Result<IntentQueue, BusError> {
        let mut queues = self.queues.write().await;

        if let Some(existing) = queues.get(&follower_id) {
            let pending = existing.pending.load(Ordering::SeqCst);
            if pending > 0 {
                error!(follower = follower_id, pending, "Bind over a non-empty queue");
                return Err(BusError::AlreadyBound {
                    follower: follower_id,
                    pending,
                });
            }
            existing.close();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        queues.insert(
            follower_id,
            QueueHandle {
                tx,
                mode,
                pending: pending.clone(),
                closed: closed.clone(),
            },
        );
        debug!(follower = follower_id, mode = %mode, "Queue bound");

        Ok(IntentQueue {
            follower_id,
            rx,
            pending,
            closed,
        })
    }

    /// Close and discard a follower's queue, dropping what it still holds.
    ///
    /// Returns the number of intents that were dropped.
    pub async fn unbind(&self, follower_id: i64) -> Result<usize, BusError> {
        let handle = self
            .queues
            .write()
            .await
            .remove(&follower_id)
            .ok_or(BusError::NotBound(follower_id))?;

        let dropped = handle.close();
        debug!(follower = follower_id, dropped, "Queue unbound");
        Ok(dropped)
    }

    /// Push an intent onto every bound queue; returns how many received it.
    pub async fn broadcast(&self, intent: &Intent) -> usize {
        let queues = self.queues.read().await;
        let mut delivered = 0;

        for (follower_id, handle) in queues.iter() {
            handle.pending.fetch_add(1, Ordering::SeqCst);
            if handle.tx.send(intent.for_mode(handle.mode)).is_err() {
                handle.pending.fetch_sub(1, Ordering::SeqCst);
                error!(follower = *follower_id, "Queue receiver gone, intent not delivered");
                continue;
            }
            delivered += 1;
        }

        delivered
    }

    /// Change the representation used for a follower's future intents.
    pub async fn set_mode(&self, follower_id: i64, mode: PositionMode) -> Result<(), BusError> {
        let mut queues = self.queues.write().await;
        let handle = queues
            .get_mut(&follower_id)
            .ok_or(BusError::NotBound(follower_id))?;
        handle.mode = mode;
        Ok(())
    }

    #[cfg(test)]
    pub async fn pending(&self, follower_id: i64) -> Option<usize> {
        self.queues
            .read()
            .await
            .get(&follower_id)
            .map(|h| h.pending.load(Ordering::SeqCst))
    }

    #[cfg(test)]
    pub async fn is_bound(&self, follower_id: i64) -> bool {
        self.queues.read().await.contains_key(&follower_id)
    }

    pub async fn bound(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.queues.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
