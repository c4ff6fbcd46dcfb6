use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;
use crate::metrics_const::{
    INDEX_APPLY_LAG_GAUGE, INDEX_PUBLISH_DROPPED_COUNTER, INDEX_SIZE_GAUGE,
};

/// One key's entry in the cross-partition index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub fingerprint: Fingerprint,
    /// Wall-clock time the owning partition observed the fingerprint.
    /// Conflicts resolve on this, not on arrival order.
    pub observed_at_ms: i64,
}

/// Eventually-consistent view of key to fingerprint across all partitions.
///
/// Populated asynchronously from accepted output, so it lags the partition
/// stores by the replication delay. It is advisory only: consulted after a
/// local store miss to catch keys first produced elsewhere, never allowed to
/// veto or delay a genuine first sighting.
#[derive(Debug, Default)]
pub struct CrossPartitionIndex {
    entries: DashMap<String, IndexEntry>,
}

impl CrossPartitionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &str) -> Option<Fingerprint> {
        self.entries.get(key).map(|entry| entry.fingerprint)
    }

    /// Applies an update. Idempotent and commutative: the newest observation
    /// wins regardless of the order updates arrive in.
    pub fn apply(&self, key: String, entry: IndexEntry) {
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if entry.observed_at_ms >= existing.get().observed_at_ms {
                    existing.insert(entry);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct IndexUpdate {
    key: String,
    entry: IndexEntry,
}

/// What the processor holds when the index is enabled.
pub struct IndexHandle {
    pub index: Arc<CrossPartitionIndex>,
    pub writer: IndexWriter,
}

/// Publishes accepted fingerprints towards the index without ever blocking
/// the decision path. A full channel drops the update; the local durable
/// store is unaffected and the index simply stays stale for that key.
#[derive(Clone)]
pub struct IndexWriter {
    tx: mpsc::Sender<IndexUpdate>,
}

impl IndexWriter {
    pub fn publish(&self, key: &str, fingerprint: Fingerprint) {
        let update = IndexUpdate {
            key: key.to_string(),
            entry: IndexEntry {
                fingerprint,
                observed_at_ms: Utc::now().timestamp_millis(),
            },
        };
        if self.tx.try_send(update).is_err() {
            metrics::counter!(INDEX_PUBLISH_DROPPED_COUNTER).increment(1);
            debug!(key, "index channel full, dropping advisory update");
        }
    }
}

/// Spawns the replication task draining published updates into the index.
///
/// `lag_tolerance` bounds the apply delay the operator accepts; exceeding it
/// is reported, not acted on.
pub fn spawn_replicator(
    index: Arc<CrossPartitionIndex>,
    channel_capacity: usize,
    lag_tolerance: Duration,
) -> (IndexWriter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<IndexUpdate>(channel_capacity);

    let task = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            let lag_ms = (Utc::now().timestamp_millis() - update.entry.observed_at_ms).max(0);
            metrics::gauge!(INDEX_APPLY_LAG_GAUGE).set(lag_ms as f64);
            if u128::try_from(lag_ms).unwrap_or(0) > lag_tolerance.as_millis() {
                warn!(
                    key = update.key.as_str(),
                    lag_ms, "cross-partition index is lagging past tolerance"
                );
            }
            index.apply(update.key, update.entry);
            metrics::gauge!(INDEX_SIZE_GAUGE).set(index.len() as f64);
        }
        debug!("index replication channel closed, task exiting");
    });

    (IndexWriter { tx }, task)
}
