//! Background cache invalidation.
//!
//! The write path enqueues namespace clears with `try_send` and moves on.
//! A single worker task drains the bounded queue in order. When the queue
//! is full the request is dropped and counted; the namespace TTL still
//! bounds how long stale entries survive.

use geneweave_storage::TwoTierCache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct InvalidationMetrics {
    /// Requests accepted into the queue
    pub enqueued: AtomicU64,
    /// Requests rejected because the queue was full or closed
    pub dropped: AtomicU64,
    /// Namespaces cleared by the worker
    pub namespaces_cleared: AtomicU64,
    /// Persistent-tier entries removed
    pub entries_removed: AtomicU64,
    pub errors: AtomicU64,
}

impl InvalidationMetrics {
    pub fn snapshot(&self) -> InvalidationSnapshot {
        InvalidationSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            namespaces_cleared: self.namespaces_cleared.load(Ordering::Relaxed),
            entries_removed: self.entries_removed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub namespaces_cleared: u64,
    pub entries_removed: u64,
    pub errors: u64,
}

// ============================================================================
// WORKER
// ============================================================================

enum Message {
    Clear {
        reason: String,
        namespaces: Vec<String>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the invalidation worker. Cheap to clone; every clone feeds the
/// same queue.
#[derive(Clone)]
pub struct InvalidationQueue {
    tx: mpsc::Sender<Message>,
    metrics: Arc<InvalidationMetrics>,
}

impl InvalidationQueue {
    /// Enqueue a clear of `namespaces` without waiting.
    ///
    /// Returns `false` when the request was dropped.
    pub fn enqueue(&self, reason: &str, namespaces: Vec<String>) -> bool {
        let message = Message::Clear {
            reason: reason.to_string(),
            namespaces,
        };
        match self.tx.try_send(message) {
            Ok(()) => {
                self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                let state = match e {
                    mpsc::error::TrySendError::Full(_) => "full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                };
                tracing::warn!(reason, queue = state, "Dropped cache invalidation request");
                false
            }
        }
    }

    /// Wait until every request enqueued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn snapshot(&self) -> InvalidationSnapshot {
        self.metrics.snapshot()
    }
}

impl std::fmt::Debug for InvalidationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationQueue")
            .field("capacity", &self.tx.max_capacity())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

/// Owns the worker task. Dropping it without `shutdown` leaves the task to
/// exit once every queue handle is gone.
pub struct InvalidationWorker {
    queue: InvalidationQueue,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationWorker {
    /// Spawn the worker on the current Tokio runtime.
    pub fn spawn(cache: Arc<TwoTierCache>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(InvalidationMetrics::default());

        let handle = tokio::spawn(invalidation_task(cache, rx, shutdown_rx, metrics.clone()));

        Self {
            queue: InvalidationQueue { tx, metrics },
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn queue(&self) -> InvalidationQueue {
        self.queue.clone()
    }

    pub fn snapshot(&self) -> InvalidationSnapshot {
        self.queue.snapshot()
    }

    /// Drain pending requests, then stop the worker.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Invalidation worker terminated abnormally");
            }
        }
    }
}

impl std::fmt::Debug for InvalidationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationWorker")
            .field("queue", &self.queue)
            .finish()
    }
}

async fn invalidation_task(
    cache: Arc<TwoTierCache>,
    mut rx: mpsc::Receiver<Message>,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<InvalidationMetrics>,
) {
    tracing::debug!("Cache invalidation worker started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            message = rx.recv() => match message {
                Some(message) => handle_message(&cache, &metrics, message).await,
                None => break,
            },
        }
    }

    // Apply whatever was accepted before shutdown.
    while let Ok(message) = rx.try_recv() {
        handle_message(&cache, &metrics, message).await;
    }

    let snapshot = metrics.snapshot();
    tracing::debug!(
        enqueued = snapshot.enqueued,
        dropped = snapshot.dropped,
        namespaces_cleared = snapshot.namespaces_cleared,
        errors = snapshot.errors,
        "Cache invalidation worker stopped"
    );
}

async fn handle_message(cache: &TwoTierCache, metrics: &InvalidationMetrics, message: Message) {
    match message {
        Message::Clear { reason, namespaces } => {
            for namespace in namespaces {
                match cache.clear_namespace(&namespace).await {
                    Ok(removed) => {
                        metrics.namespaces_cleared.fetch_add(1, Ordering::Relaxed);
                        metrics.entries_removed.fetch_add(removed, Ordering::Relaxed);
                        tracing::debug!(%reason, %namespace, removed, "Cleared cache namespace");
                    }
                    Err(e) => {
                        metrics.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(%reason, %namespace, error = %e, "Cache namespace clear failed");
                    }
                }
            }
        }
        Message::Flush(done) => {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geneweave_core::CacheConfig;
    use geneweave_storage::{CacheTtl, InMemoryCacheStore};
    use serde_json::json;

    fn cache() -> (Arc<TwoTierCache>, Arc<InMemoryCacheStore>) {
        let l2 = Arc::new(InMemoryCacheStore::new());
        (Arc::new(TwoTierCache::new(l2.clone(), CacheConfig::default())), l2)
    }

    #[tokio::test]
    async fn test_enqueued_namespaces_are_cleared() {
        let (cache, _) = cache();
        cache.set("BRCA1", json!({"pli": 0.9}), "gnomad", CacheTtl::Never).await;
        cache.set("BRCA1", json!({"ok": true}), "annotations", CacheTtl::Never).await;
        cache.set("BRCA1", json!({"hgnc_id": "HGNC:1100"}), "hgnc", CacheTtl::Never).await;

        let worker = InvalidationWorker::spawn(cache.clone(), 8);
        let queue = worker.queue();
        assert!(queue.enqueue("gnomad", vec!["gnomad".to_string(), "annotations".to_string()]));
        queue.flush().await;

        assert!(cache.get("BRCA1", "gnomad").await.is_none());
        assert!(cache.get("BRCA1", "annotations").await.is_none());
        assert!(cache.get("BRCA1", "hgnc").await.is_some());

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.enqueued, 1);
        assert_eq!(snapshot.namespaces_cleared, 2);
        assert_eq!(snapshot.dropped, 0);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let (cache, _) = cache();
        let worker = InvalidationWorker::spawn(cache, 1);
        let queue = worker.queue();

        // The current-thread runtime cannot run the worker until this task
        // yields, so the second request finds the queue full.
        assert!(queue.enqueue("a", vec!["a".to_string()]));
        assert!(!queue.enqueue("b", vec!["b".to_string()]));

        queue.flush().await;
        let snapshot = worker.snapshot();
        assert_eq!(snapshot.enqueued, 1);
        assert_eq!(snapshot.dropped, 1);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_requests() {
        let (cache, _) = cache();
        cache.set("k", json!(1), "clinvar", CacheTtl::Never).await;
        let worker = InvalidationWorker::spawn(cache.clone(), 4);
        worker.queue().enqueue("clinvar", vec!["clinvar".to_string()]);
        worker.shutdown().await;

        assert!(cache.get("k", "clinvar").await.is_none());
        assert!(!worker.queue().enqueue("late", vec!["x".to_string()]));
    }
}
