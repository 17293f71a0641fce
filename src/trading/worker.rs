//! Follower workers and the pool that supervises them.
//!
//! A worker is the single consumer of one follower's queue and the single
//! writer of that follower's ledger partition. Intents run one at a time in
//! queue order; a panic inside one intent is caught and the worker moves on.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::Intent;

use super::bus::IntentQueue;
use super::executor::ReplicationExecutor;
use super::ledger::SharedBook;
use super::roster::Roster;

/// Consumer of one follower's queue.
pub struct Worker {
    follower_id: i64,
    queue: IntentQueue,
    book: SharedBook,
    roster: Arc<Roster>,
    executor: Arc<ReplicationExecutor>,
}

impl Worker {
    pub fn new(
        queue: IntentQueue,
        book: SharedBook,
        roster: Arc<Roster>,
        executor: Arc<ReplicationExecutor>,
    ) -> Self {
        Self {
            follower_id: queue.follower_id(),
            queue,
            book,
            roster,
            executor,
        }
    }

    pub fn follower_id(&self) -> i64 {
        self.follower_id
    }

    /// Drain the queue until it is unbound.
    pub async fn run(mut self) {
        debug!(follower = self.follower_id, "Worker started");
        while let Some(intent) = self.queue.recv().await {
            self.handle(intent).await;
        }
        debug!(follower = self.follower_id, "Worker stopped");
    }

    async fn handle(&self, intent: Intent) {
        // Current roster copy, so enablement and ratio changes apply immediately
        let Some(follower) = self.roster.get(self.follower_id).await else {
            warn!(follower = self.follower_id, symbol = %intent.symbol, "Follower left the roster, intent dropped");
            return;
        };

        let mut book = self.book.lock().await;
        let result = AssertUnwindSafe(self.executor.execute(&intent, &follower, &mut book))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(
                follower = self.follower_id,
                symbol = %intent.symbol,
                kind = ?intent.kind,
                error = %e,
                "Intent failed"
            ),
            Err(panic) => error!(
                follower = self.follower_id,
                symbol = %intent.symbol,
                kind = ?intent.kind,
                panic = %panic_message(panic.as_ref()),
                "Worker panicked on intent, continuing"
            ),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Running workers by follower.
#[derive(Default)]
pub struct WorkerPool {
    workers: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker. A finished task for the same follower is replaced;
    /// a live one is kept and the new worker is discarded.
    pub async fn start(&self, worker: Worker) -> bool {
        let follower_id = worker.follower_id();
        let mut workers = self.workers.lock().await;

        if let Some(existing) = workers.get(&follower_id) {
            if !existing.is_finished() {
                error!(follower = follower_id, "Worker already running");
                return false;
            }
        }

        workers.insert(follower_id, tokio::spawn(worker.run()));
        info!(follower = follower_id, "Worker started");
        true
    }

    /// Wait for a follower's worker to finish. Its queue must already be
    /// unbound; an in-flight order completes first.
    pub async fn stop(&self, follower_id: i64) -> bool {
        let handle = self.workers.lock().await.remove(&follower_id);
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(follower = follower_id, error = %e, "Worker task ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    /// Followers whose worker task is no longer running.
    pub async fn dead(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .workers
            .lock()
            .await
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    #[cfg(test)]
    pub async fn is_running(&self, follower_id: i64) -> bool {
        self.workers
            .lock()
            .await
            .get(&follower_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Wait for every worker; queues must already be unbound.
    pub async fn shutdown(&self) {
        let handles: Vec<(i64, JoinHandle<()>)> = self.workers.lock().await.drain().collect();
        for (follower_id, handle) in handles {
            if let Err(e) = handle.await {
                error!(follower = follower_id, error = %e, "Worker task ended abnormally");
            }
        }
    }
}
