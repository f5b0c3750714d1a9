//! Durable offline write queue
//!
//! Mutations that failed on every attempted connector land here and are
//! replayed in FIFO order on a bounded retry schedule. The queue never
//! silently drops a failed write while it still has budget: capacity
//! eviction and retry exhaustion are both counted in metrics, and exhausted
//! items can be handed to a dead-letter callback.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncQueueConfig;
use crate::error::{Error, Result};
use crate::types::{MutationKind, Value};

/// Snapshot format version; bumped on any incompatible layout change.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One pending mutation awaiting replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Generated id
    pub id: Uuid,
    /// Mutation kind
    pub operation: MutationKind,
    /// Target table
    pub table: String,
    /// Original statement text
    pub statement: String,
    /// Original positional parameters
    pub params: Vec<Value>,
    /// Enqueue time, reset on every retry attempt
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed replay attempts so far
    pub retry_count: u32,
}

impl QueueItem {
    /// Create a fresh item for a failed mutation
    pub fn new(
        operation: MutationKind,
        table: impl Into<String>,
        statement: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            table: table.into(),
            statement: statement.into(),
            params,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }

    fn since_last_attempt(&self) -> Duration {
        (Utc::now() - self.enqueued_at).to_std().unwrap_or_default()
    }
}

/// Aggregate queue counters, persisted alongside the items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Items accepted by `enqueue`
    pub enqueued_total: u64,
    /// Items replayed successfully
    pub replayed_total: u64,
    /// Items dropped after exhausting the retry schedule
    pub failed_total: u64,
    /// Items evicted because the queue was at capacity
    pub evicted_total: u64,
}

/// Snapshot of queue contents and counters.
#[derive(Debug, Clone)]
pub struct SyncQueueStatus {
    /// Items currently pending, in FIFO order
    pub items: Vec<QueueItem>,
    /// Pending item count
    pub pending: usize,
    /// Whether a drain pass is currently running
    pub processing: bool,
    /// Aggregate counters
    pub metrics: QueueMetrics,
}

/// Counts for one `process_queue` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Items whose replay was attempted
    pub attempted: usize,
    /// Items replayed and removed
    pub succeeded: usize,
    /// Items that failed and remain queued (retry budget left)
    pub retried: usize,
    /// Items dropped permanently this pass
    pub dropped: usize,
    /// Items skipped because their retry delay had not elapsed
    pub skipped: usize,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    queue: Vec<QueueItem>,
    metrics: QueueMetrics,
    timestamp: DateTime<Utc>,
}

/// Callback receiving items dropped after retry exhaustion.
pub type DeadLetterFn = dyn Fn(QueueItem) + Send + Sync;

/// Size-bounded FIFO of pending mutations with snapshot persistence.
pub struct SyncQueue {
    config: SyncQueueConfig,
    items: Mutex<VecDeque<QueueItem>>,
    metrics: Mutex<QueueMetrics>,
    processing: AtomicBool,
    dead_letter: Option<Arc<DeadLetterFn>>,
}

impl SyncQueue {
    /// Create a queue, reloading a persisted snapshot when one exists.
    pub fn new(config: SyncQueueConfig) -> Self {
        let (items, metrics) = match load_snapshot(&config) {
            Some(snapshot) => {
                info!(
                    pending = snapshot.queue.len(),
                    "restored sync queue snapshot"
                );
                (VecDeque::from(snapshot.queue), snapshot.metrics)
            }
            None => (VecDeque::new(), QueueMetrics::default()),
        };
        Self {
            config,
            items: Mutex::new(items),
            metrics: Mutex::new(metrics),
            processing: AtomicBool::new(false),
            dead_letter: None,
        }
    }

    /// Attach a dead-letter callback for items dropped after exhausting the
    /// retry schedule.
    pub fn with_dead_letter(mut self, callback: Arc<DeadLetterFn>) -> Self {
        self.dead_letter = Some(callback);
        self
    }

    /// Append a pending mutation.
    ///
    /// Errors when the serialized item exceeds the configured per-item size.
    /// At capacity the oldest item is evicted first — bounded memory wins
    /// over completeness under sustained overload, and the eviction is
    /// counted in `evicted_total`.
    pub async fn enqueue(&self, item: QueueItem) -> Result<()> {
        let size = serde_json::to_vec(&item)?.len();
        if size > self.config.max_item_bytes {
            return Err(Error::ItemTooLarge {
                size,
                max: self.config.max_item_bytes,
            });
        }

        {
            let mut items = self.items.lock();
            let mut metrics = self.metrics.lock();
            if items.len() >= self.config.max_queue_size {
                if let Some(evicted) = items.pop_front() {
                    metrics.evicted_total += 1;
                    warn!(
                        id = %evicted.id,
                        table = %evicted.table,
                        "sync queue full, evicting oldest item"
                    );
                }
            }
            metrics.enqueued_total += 1;
            debug!(id = %item.id, table = %item.table, op = %item.operation, "queued mutation");
            items.push_back(item);
        }

        self.persist().await
    }

    /// Replay pending items in FIFO order.
    ///
    /// Reentrant-safe: a second call while a pass is in flight is a no-op
    /// returning zero counts. Items whose retry delay has not elapsed are
    /// skipped in place, preserving relative order for the rest. An item
    /// that fails more times than the schedule has entries is dropped
    /// permanently, counted in `failed_total`, and passed to the dead-letter
    /// callback when one is configured.
    pub async fn process_queue<F, Fut>(&self, replay: F) -> Result<DrainOutcome>
    where
        F: Fn(QueueItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync queue drain already in progress");
            return Ok(DrainOutcome::default());
        }

        let mut outcome = DrainOutcome::default();
        let mut dirty = false;

        let pending_ids: Vec<Uuid> = self.items.lock().iter().map(|i| i.id).collect();

        for id in pending_ids {
            // Clone the item out so the lock is never held across an await
            let Some(item) = self.items.lock().iter().find(|i| i.id == id).cloned() else {
                continue; // removed concurrently
            };

            if item.retry_count > 0 {
                let delay_index = (item.retry_count as usize - 1)
                    .min(self.config.retry_delays.len().saturating_sub(1));
                let delay = self
                    .config
                    .retry_delays
                    .get(delay_index)
                    .copied()
                    .unwrap_or_default();
                if item.since_last_attempt() < delay {
                    outcome.skipped += 1;
                    continue;
                }
            }

            outcome.attempted += 1;
            match replay(item.clone()).await {
                Ok(()) => {
                    self.remove_internal(id);
                    self.metrics.lock().replayed_total += 1;
                    outcome.succeeded += 1;
                    dirty = true;
                    debug!(id = %id, table = %item.table, "replayed queued mutation");
                }
                Err(e) => {
                    let dropped = {
                        let mut items = self.items.lock();
                        match items.iter().position(|i| i.id == id) {
                            Some(index) => {
                                let exhausted = {
                                    let entry = &mut items[index];
                                    entry.retry_count += 1;
                                    entry.enqueued_at = Utc::now();
                                    entry.retry_count as usize > self.config.retry_delays.len()
                                };
                                if exhausted {
                                    items.remove(index)
                                } else {
                                    None
                                }
                            }
                            None => None,
                        }
                    };

                    dirty = true;
                    match dropped {
                        Some(dead) => {
                            self.metrics.lock().failed_total += 1;
                            outcome.dropped += 1;
                            warn!(
                                id = %dead.id,
                                table = %dead.table,
                                retries = dead.retry_count,
                                error = %e,
                                "dropping queued mutation after retry exhaustion"
                            );
                            if let Some(callback) = &self.dead_letter {
                                callback(dead);
                            }
                        }
                        None => {
                            outcome.retried += 1;
                            debug!(id = %id, error = %e, "queued mutation replay failed, will retry");
                        }
                    }
                }
            }
        }

        let result = if dirty { self.persist().await } else { Ok(()) };
        self.processing.store(false, Ordering::SeqCst);
        result?;

        if outcome.attempted > 0 {
            info!(
                attempted = outcome.attempted,
                succeeded = outcome.succeeded,
                dropped = outcome.dropped,
                "sync queue drain pass finished"
            );
        }
        Ok(outcome)
    }

    /// Remove a single item by id. Returns whether it was present.
    pub async fn remove_item(&self, id: Uuid) -> Result<bool> {
        let removed = self.remove_internal(id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    fn remove_internal(&self, id: Uuid) -> Option<QueueItem> {
        let mut items = self.items.lock();
        let index = items.iter().position(|i| i.id == id)?;
        items.remove(index)
    }

    /// Drop every pending item.
    pub async fn clear(&self) -> Result<()> {
        self.items.lock().clear();
        self.persist().await
    }

    /// Snapshot of items, counters, and the processing flag.
    pub fn status(&self) -> SyncQueueStatus {
        let items: Vec<QueueItem> = self.items.lock().iter().cloned().collect();
        SyncQueueStatus {
            pending: items.len(),
            items,
            processing: self.processing.load(Ordering::SeqCst),
            metrics: self.metrics.lock().clone(),
        }
    }

    /// Pending item count.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue has no pending items.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Pending items of one mutation kind, FIFO order.
    pub fn items_by_operation(&self, operation: MutationKind) -> Vec<QueueItem> {
        self.items
            .lock()
            .iter()
            .filter(|i| i.operation == operation)
            .cloned()
            .collect()
    }

    /// Pending items targeting one table, FIFO order.
    pub fn items_by_table(&self, table: &str) -> Vec<QueueItem> {
        self.items
            .lock()
            .iter()
            .filter(|i| i.table == table)
            .cloned()
            .collect()
    }

    /// Histogram of retry-count → pending item count.
    pub fn retry_stats(&self) -> HashMap<u32, usize> {
        let mut stats = HashMap::new();
        for item in self.items.lock().iter() {
            *stats.entry(item.retry_count).or_insert(0) += 1;
        }
        stats
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.config.persist_path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            queue: self.items.lock().iter().cloned().collect(),
            metrics: self.metrics.lock().clone(),
            timestamp: Utc::now(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;

        // Write-then-rename so a crash mid-write never corrupts the snapshot
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Error::persistence(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::persistence(format!("renaming to {}: {e}", path.display())))?;
        Ok(())
    }
}

fn load_snapshot(config: &SyncQueueConfig) -> Option<Snapshot> {
    let path = config.persist_path.as_ref()?;
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice::<Snapshot>(&bytes) {
        Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Some(snapshot),
        Ok(snapshot) => {
            warn!(
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "sync queue snapshot version mismatch, starting empty"
            );
            None
        }
        Err(e) => {
            warn!(error = %e, "failed to parse sync queue snapshot, starting empty");
            None
        }
    }
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("pending", &self.len())
            .field("processing", &self.processing.load(Ordering::SeqCst))
            .finish()
    }
}
