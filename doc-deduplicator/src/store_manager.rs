use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use health::{HealthHandle, HealthRegistry};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::DedupError;
use crate::metrics_const::{ACTIVE_PARTITION_GAUGE, COMPACTION_BYTES_FREED_HISTOGRAM};
use crate::recovery::{RecoveryCoordinator, RecoveryState};
use crate::store::{DedupStore, DedupStoreConfig};

const STORE_HEALTH_DEADLINE: Duration = Duration::from_secs(60);

fn store_component_name(partition: i32) -> String {
    format!("store-{partition}")
}

/// One partition's store plus the machinery gating decisions on recovery.
pub struct PartitionHandle {
    partition: i32,
    store: Mutex<DedupStore>,
    state: watch::Sender<RecoveryState>,
    cancelled: AtomicBool,
    health: HealthHandle,
}

impl PartitionHandle {
    pub(crate) fn new(partition: i32, store: DedupStore, health: HealthHandle) -> Self {
        let (state, _) = watch::channel(RecoveryState::NotReady);
        Self {
            partition,
            store: Mutex::new(store),
            state,
            cancelled: AtomicBool::new(false),
            health,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn store(&self) -> &Mutex<DedupStore> {
        &self.store
    }

    pub fn state(&self) -> RecoveryState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: RecoveryState) {
        _ = self.state.send_replace(state);
    }

    pub fn health(&self) -> &HealthHandle {
        &self.health
    }

    /// Flags an in-flight replay for abandonment, on revocation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Blocks (bounded) until the store has replayed its change log.
    ///
    /// A decision must never be answered from a partially replayed store, so
    /// callers wait here; on timeout the record is surfaced as retryable
    /// rather than decided against incomplete state.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), DedupError> {
        let mut rx = self.state.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match *rx.borrow_and_update() {
                RecoveryState::Ready => return Ok(()),
                RecoveryState::Failed => return Err(DedupError::RecoveryFailed(self.partition)),
                RecoveryState::NotReady | RecoveryState::Replaying => {}
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(DedupError::StoreUnavailable(self.partition)),
                Err(_) => return Err(DedupError::StoreNotReady(self.partition)),
            }
        }
    }

    /// Refreshes this partition's readiness component while the store is live.
    pub fn refresh_health(&self) {
        if self.state() == RecoveryState::Ready {
            self.health.report_healthy();
        }
    }
}

/// Manages the lifecycle of per-partition stores: atomic get-or-create with
/// recovery kickoff, revocation, compaction and shutdown.
///
/// Store handles reach the decision processor only through this manager,
/// injected at construction time; nothing looks a store up through ambient
/// process state.
pub struct StoreManager {
    partitions: DashMap<i32, Arc<PartitionHandle>>,
    store_config: DedupStoreConfig,
    readiness: HealthRegistry,
}

impl StoreManager {
    pub fn new(store_config: DedupStoreConfig, readiness: HealthRegistry) -> Self {
        Self {
            partitions: DashMap::new(),
            store_config,
            readiness,
        }
    }

    /// Get the store handle for a partition, creating it and kicking off
    /// change log recovery on first sight.
    ///
    /// Creation is atomic: when several callers race on a new partition,
    /// exactly one store is opened and the rest share it.
    pub async fn get_or_create(&self, partition: i32) -> Result<Arc<PartitionHandle>, DedupError> {
        // Fast path: the store already exists
        if let Some(handle) = self.partitions.get(&partition) {
            return Ok(handle.clone());
        }

        let mut created = None;
        let handle = match self.partitions.entry(partition) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let store = DedupStore::open(&self.store_config, partition).map_err(|e| {
                    error!(partition, error = ?e, "failed to open deduplication store");
                    DedupError::StoreUnavailable(partition)
                })?;
                let health = self
                    .readiness
                    .register(store_component_name(partition), STORE_HEALTH_DEADLINE);
                let handle = Arc::new(PartitionHandle::new(partition, store, health));
                entry.insert(handle.clone());
                created = Some(handle.clone());
                handle
            }
        };

        if let Some(handle) = created {
            info!(
                partition,
                "created deduplication store, starting change log recovery"
            );
            metrics::gauge!(ACTIVE_PARTITION_GAUGE).set(self.partitions.len() as f64);
            tokio::spawn(async move {
                RecoveryCoordinator::default().run(handle).await;
            });
        }

        Ok(handle)
    }

    pub fn get(&self, partition: i32) -> Option<Arc<PartitionHandle>> {
        self.partitions.get(&partition).map(|entry| entry.clone())
    }

    /// Revoke a partition: cancel any in-flight replay and drop the store.
    /// Files stay on disk; the next owner replays the change log before it
    /// serves anything.
    pub fn unregister(&self, partition: i32) {
        if let Some((_, handle)) = self.partitions.remove(&partition) {
            handle.cancel();
            self.readiness.deregister(&store_component_name(partition));
            metrics::gauge!(ACTIVE_PARTITION_GAUGE).set(self.partitions.len() as f64);
            info!(partition, "unregistered deduplication store");
        }
    }

    pub fn handles(&self) -> Vec<Arc<PartitionHandle>> {
        self.partitions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn active_partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn base_path(&self) -> &Path {
        &self.store_config.path
    }

    /// Compacts the change logs of every ready partition. Partitions still
    /// replaying are skipped; their log is being read right now.
    pub async fn compact_ready_partitions(&self) -> u64 {
        let mut total_freed = 0u64;
        for handle in self.handles() {
            if handle.state() != RecoveryState::Ready {
                continue;
            }
            let mut store = handle.store().lock().await;
            match store.compact() {
                Ok(freed) => {
                    if freed > 0 {
                        metrics::histogram!(COMPACTION_BYTES_FREED_HISTOGRAM)
                            .record(freed as f64);
                        info!(
                            partition = handle.partition(),
                            bytes_freed = freed,
                            "compacted change log"
                        );
                    }
                    total_freed += freed;
                }
                Err(e) => {
                    warn!(
                        partition = handle.partition(),
                        error = ?e,
                        "change log compaction failed"
                    );
                }
            }
        }
        total_freed
    }

    /// Starts a periodic compaction task in the background.
    /// Returns a handle that can be used to stop the task.
    pub fn start_periodic_compaction(self: Arc<Self>, interval: Duration) -> CompactionTaskHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let manager = self;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(
                "started periodic change log compaction with interval {:?}",
                interval
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let freed = manager.compact_ready_partitions().await;
                        if freed > 0 {
                            info!(bytes_freed = freed, "periodic compaction reclaimed space");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            info!("compaction task shutting down");
        });

        CompactionTaskHandle {
            handle,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Shuts down all stores cleanly: flushes change logs, keeps the files
    /// (they are needed when the service restarts).
    pub async fn shutdown(&self) {
        info!("shutting down all deduplication stores");
        for handle in self.handles() {
            handle.cancel();
            let mut store = handle.store().lock().await;
            if let Err(e) = store.flush() {
                warn!(
                    partition = handle.partition(),
                    error = ?e,
                    "failed to flush change log during shutdown"
                );
            }
        }
        self.partitions.clear();
        info!("all deduplication stores have been closed");
    }
}

/// Handle for the compaction task that allows graceful shutdown
pub struct CompactionTaskHandle {
    handle: JoinHandle<()>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl CompactionTaskHandle {
    /// Stop the compaction task gracefully
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            _ = tx.send(());
        }

        match tokio::time::timeout(Duration::from_secs(5), self.handle).await {
            Ok(Ok(())) => info!("compaction task shut down successfully"),
            Ok(Err(e)) => warn!("compaction task failed: {}", e),
            Err(_) => warn!("compaction task shutdown timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{Fingerprinter, Sha256Fingerprinter};
    use tempfile::TempDir;

    fn manager_for(dir: &TempDir) -> Arc<StoreManager> {
        Arc::new(StoreManager::new(
            DedupStoreConfig {
                path: dir.path().to_path_buf(),
            },
            HealthRegistry::new("readiness"),
        ))
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_store() {
        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir);

        let first = manager.get_or_create(0).await.unwrap();
        let second = manager.get_or_create(0).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.active_partition_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_store_creation() {
        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir);

        let mut handles = vec![];
        for _ in 0..10 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.get_or_create(42).await }));
        }

        let mut stores = vec![];
        for handle in handles {
            stores.push(handle.await.unwrap().unwrap());
        }
        assert!(stores.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(manager.active_partition_count(), 1);
    }

    #[tokio::test]
    async fn new_store_becomes_ready() {
        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir);

        let handle = manager.get_or_create(0).await.unwrap();
        handle.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(handle.state(), RecoveryState::Ready);
    }

    #[tokio::test]
    async fn wait_ready_times_out_on_a_gated_store() {
        let dir = TempDir::new().unwrap();
        let registry = HealthRegistry::new("readiness");
        let store = DedupStore::open(
            &DedupStoreConfig {
                path: dir.path().to_path_buf(),
            },
            0,
        )
        .unwrap();
        let health = registry.register("store-0".to_string(), Duration::from_secs(30));

        // No coordinator runs, so the gate never opens
        let handle = PartitionHandle::new(0, store, health);
        let err = handle.wait_ready(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, DedupError::StoreNotReady(0)));
    }

    #[tokio::test]
    async fn unregister_cancels_and_removes() {
        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir);

        let handle = manager.get_or_create(7).await.unwrap();
        manager.unregister(7);

        assert!(handle.is_cancelled());
        assert!(manager.get(7).is_none());
        assert_eq!(manager.active_partition_count(), 0);
    }

    #[tokio::test]
    async fn revoked_partition_recovers_on_reassignment() {
        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir);

        let handle = manager.get_or_create(3).await.unwrap();
        handle.wait_ready(Duration::from_secs(5)).await.unwrap();
        {
            let mut store = handle.store().lock().await;
            store
                .put(
                    "doc-1",
                    Sha256Fingerprinter.fingerprint(b"a").unwrap(),
                    1,
                )
                .unwrap();
        }
        manager.unregister(3);

        // Reassignment replays the change log before serving
        let reassigned = manager.get_or_create(3).await.unwrap();
        reassigned.wait_ready(Duration::from_secs(5)).await.unwrap();
        let store = reassigned.store().lock().await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_clears_all_stores() {
        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir);

        manager.get_or_create(0).await.unwrap();
        manager.get_or_create(1).await.unwrap();
        manager.shutdown().await;

        assert_eq!(manager.active_partition_count(), 0);
    }
}
