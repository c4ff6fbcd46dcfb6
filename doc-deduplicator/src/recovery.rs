use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::metrics_const::{
    CHANGELOG_TORN_TAIL_COUNTER, RECOVERY_DURATION_HISTOGRAM, RECOVERY_FAILURES_COUNTER,
    RECOVERY_RECORDS_REPLAYED_COUNTER,
};
use crate::store::ChangeLogError;
use crate::store_manager::PartitionHandle;

/// Where a partition's store stands between creation and serving decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Store exists but its change log has not been replayed yet.
    NotReady,
    /// Replay in flight; decisions wait behind the gate.
    Replaying,
    /// Replay reached the watermark; live decisions may proceed.
    Ready,
    /// Replay hit corruption; the partition serves nothing until an
    /// operator intervenes.
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub records_applied: u64,
    pub keys: usize,
    pub truncated_bytes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("change log replay failed: {0}")]
    ChangeLog(#[from] ChangeLogError),
    #[error("replay cancelled by partition revocation")]
    Cancelled,
}

/// Replays a partition's change log into its store and drives the
/// `NotReady -> Replaying -> Ready` gate the decision path waits on.
///
/// The replay holds the store lock for its whole duration, so no decision
/// can ever observe a partially replayed map. Revocation flips the handle's
/// cancel flag; the replay checks it between batches and abandons the store
/// before it becomes visible as ready.
pub struct RecoveryCoordinator {
    batch_size: usize,
}

impl Default for RecoveryCoordinator {
    fn default() -> Self {
        Self { batch_size: 1024 }
    }
}

impl RecoveryCoordinator {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }

    pub async fn run(&self, handle: Arc<PartitionHandle>) {
        let partition = handle.partition();
        let start = Instant::now();
        handle.set_state(RecoveryState::Replaying);

        match self.replay(&handle).await {
            Ok(summary) => {
                handle.set_state(RecoveryState::Ready);
                handle.health().report_healthy();
                metrics::histogram!(RECOVERY_DURATION_HISTOGRAM)
                    .record(start.elapsed().as_secs_f64());
                metrics::counter!(RECOVERY_RECORDS_REPLAYED_COUNTER)
                    .increment(summary.records_applied);
                info!(
                    partition,
                    records = summary.records_applied,
                    keys = summary.keys,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "change log replay complete, store is ready"
                );
            }
            Err(RecoveryError::Cancelled) => {
                handle.set_state(RecoveryState::NotReady);
                info!(partition, "change log replay cancelled by revocation");
            }
            Err(e) => {
                handle.set_state(RecoveryState::Failed);
                handle
                    .health()
                    .report_status(health::ComponentStatus::Unhealthy);
                metrics::counter!(RECOVERY_FAILURES_COUNTER).increment(1);
                error!(
                    partition,
                    error = ?e,
                    "change log replay failed, partition will not serve decisions"
                );
            }
        }
    }

    async fn replay(&self, handle: &PartitionHandle) -> Result<ReplaySummary, RecoveryError> {
        let mut store = handle.store().lock().await;
        let mut reader = store.replay_reader()?;
        let watermark = store.changelog_end();
        let mut summary = ReplaySummary::default();

        loop {
            if handle.is_cancelled() {
                return Err(RecoveryError::Cancelled);
            }

            let mut in_batch = 0;
            while in_batch < self.batch_size {
                match reader.next_record()? {
                    Some(record) => {
                        store.apply_replayed(record);
                        summary.records_applied += 1;
                        in_batch += 1;
                    }
                    None => {
                        if let Some(valid_end) = reader.torn_tail() {
                            // Debris from an append whose decision was never
                            // reported; dropping it cannot leak a duplicate.
                            summary.truncated_bytes = watermark.saturating_sub(valid_end);
                            store.truncate_changelog(valid_end)?;
                            metrics::counter!(CHANGELOG_TORN_TAIL_COUNTER).increment(1);
                            warn!(
                                partition = handle.partition(),
                                truncated_bytes = summary.truncated_bytes,
                                "truncated torn change log tail"
                            );
                        }
                        summary.keys = store.len();
                        debug_assert!(reader.position() <= watermark);
                        return Ok(summary);
                    }
                }
            }
            // Yield between batches so cancellation and other partitions get a turn.
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{Fingerprint, Fingerprinter, Sha256Fingerprinter};
    use crate::store::{DedupStore, DedupStoreConfig, CHANGELOG_FILE_NAME};
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fp(body: &[u8]) -> Fingerprint {
        Sha256Fingerprinter.fingerprint(body).unwrap()
    }

    fn config(dir: &TempDir) -> DedupStoreConfig {
        DedupStoreConfig {
            path: dir.path().to_path_buf(),
        }
    }

    fn handle_for(dir: &TempDir, partition: i32) -> Arc<PartitionHandle> {
        let registry = health::HealthRegistry::new("readiness");
        let store = DedupStore::open(&config(dir), partition).unwrap();
        let health = registry.register(format!("store-{partition}"), Duration::from_secs(30));
        Arc::new(PartitionHandle::new(partition, store, health))
    }

    fn seed_store(dir: &TempDir, partition: i32) {
        let mut store = DedupStore::open(&config(dir), partition).unwrap();
        store.put("doc-1", fp(b"a"), 1).unwrap();
        store.put("doc-1", fp(b"b"), 2).unwrap();
        store.put("doc-2", fp(b"c"), 3).unwrap();
    }

    #[tokio::test]
    async fn replay_rebuilds_store_and_marks_ready() {
        let dir = TempDir::new().unwrap();
        seed_store(&dir, 0);

        let handle = handle_for(&dir, 0);
        RecoveryCoordinator::default().run(handle.clone()).await;

        assert_eq!(handle.state(), RecoveryState::Ready);
        let store = handle.store().lock().await;
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("doc-1").unwrap().fingerprint, fp(b"b"));
        assert_eq!(store.get("doc-2").unwrap().fingerprint, fp(b"c"));
    }

    #[tokio::test]
    async fn replaying_twice_converges_to_the_same_map() {
        let dir = TempDir::new().unwrap();
        seed_store(&dir, 0);

        let first = handle_for(&dir, 0);
        RecoveryCoordinator::default().run(first.clone()).await;
        let once = first.store().lock().await.snapshot();

        let second = handle_for(&dir, 0);
        RecoveryCoordinator::default().run(second.clone()).await;
        let twice = second.store().lock().await.snapshot();

        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn cancelled_replay_never_becomes_ready() {
        let dir = TempDir::new().unwrap();
        seed_store(&dir, 0);

        let handle = handle_for(&dir, 0);
        handle.cancel();
        RecoveryCoordinator::default().run(handle.clone()).await;

        assert_eq!(handle.state(), RecoveryState::NotReady);
    }

    #[tokio::test]
    async fn corrupt_change_log_marks_partition_failed() {
        let dir = TempDir::new().unwrap();
        seed_store(&dir, 0);

        // Open the store while the header is still valid, then damage the
        // file on disk so the replay reader rejects it.
        let handle = handle_for(&dir, 0);
        corrupt_header(&dir.path().join("0").join(CHANGELOG_FILE_NAME));

        RecoveryCoordinator::default().run(handle.clone()).await;

        assert_eq!(handle.state(), RecoveryState::Failed);
    }

    fn corrupt_header(path: &Path) {
        use std::io::{Seek, SeekFrom};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(b"XXXX").unwrap();
    }

    #[tokio::test]
    async fn torn_tail_is_truncated_during_replay() {
        let dir = TempDir::new().unwrap();
        seed_store(&dir, 0);

        // A crash mid-append leaves a short frame at the end
        let log_path = dir.path().join("0").join(CHANGELOG_FILE_NAME);
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .unwrap();
        file.write_all(&[9u8, 9, 9]).unwrap();
        drop(file);

        let handle = handle_for(&dir, 0);
        RecoveryCoordinator::default().run(handle.clone()).await;

        assert_eq!(handle.state(), RecoveryState::Ready);
        let store = handle.store().lock().await;
        assert_eq!(store.len(), 2);
    }
}
