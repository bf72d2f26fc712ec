//! Pending-request table that turns a pushed instruction into an awaitable reply.
//!
//! Each entry holds the sending half of a oneshot channel. The first
//! `complete` for a request id removes the entry and resolves the waiter;
//! later completions find nothing. Waiters that give up call `remove`, and
//! entries nobody cleans up are dropped by `reap_expired`.
//!
//! Callers that must do work between claiming a request and answering it
//! use `take`, which hands out the waiter so no second reply can claim it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Pending<T> {
    connection_id: String,
    expires_at: Instant,
    tx: oneshot::Sender<T>,
}

/// A claimed waiter, removed from the table.
pub struct PendingReply<T> {
    tx: oneshot::Sender<T>,
}

impl<T> PendingReply<T> {
    /// Hand `value` to the waiter. `false` if it has already given up.
    pub fn deliver(self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }
}

/// Thread-safe map from request id to the waiter for its result.
pub struct CorrelationTable<T> {
    pending: Arc<RwLock<HashMap<String, Pending<T>>>>,
}

impl<T> Clone for CorrelationTable<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pending slot for `request_id` that lives at most `ttl`.
    ///
    /// Register before pushing the instruction so a fast reply cannot be missed.
    pub async fn register(
        &self,
        request_id: String,
        connection_id: String,
        ttl: Duration,
    ) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        let entry = Pending {
            connection_id,
            expires_at: Instant::now() + ttl,
            tx,
        };
        self.pending.write().await.insert(request_id, entry);
        rx
    }

    /// Deliver the result for `request_id`.
    ///
    /// Returns `false` for unknown, expired, or already completed ids; those
    /// calls leave the table untouched.
    pub async fn complete(&self, request_id: &str, value: T) -> bool {
        match self.take(request_id).await {
            Some(reply) => reply.deliver(value),
            None => false,
        }
    }

    /// Claim the waiter for `request_id`, removing the entry.
    ///
    /// `None` for unknown, expired, or already claimed ids.
    pub async fn take(&self, request_id: &str) -> Option<PendingReply<T>> {
        let Some(entry) = self.pending.write().await.remove(request_id) else {
            debug!(request_id = %request_id, "Result for unknown request ignored");
            return None;
        };
        if entry.expires_at <= Instant::now() {
            debug!(request_id = %request_id, "Result for expired request ignored");
            return None;
        }
        Some(PendingReply { tx: entry.tx })
    }

    /// Forget `request_id` without delivering anything.
    pub async fn remove(&self, request_id: &str) -> bool {
        self.pending.write().await.remove(request_id).is_some()
    }

    /// Drop every entry past its expiry. Returns how many were dropped.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|request_id, entry| {
            let keep = entry.expires_at > now;
            if !keep {
                debug!(
                    request_id = %request_id,
                    connection_id = %entry.connection_id,
                    "Reaping expired correlation entry"
                );
            }
            keep
        });
        before - pending.len()
    }

    pub async fn contains(&self, request_id: &str) -> bool {
        self.pending.read().await.contains_key(request_id)
    }

    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }

    /// Reap expired entries every `every` until `shutdown` is cancelled.
    pub async fn run_reaper(self, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // skip first immediate tick
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                _ = interval.tick() => {
                    let removed = self.reap_expired().await;
                    if removed > 0 {
                        info!(removed, "Reaped expired correlation entries");
                    }
                }
            }
        }
    }
}
