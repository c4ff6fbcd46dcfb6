use std::sync::Arc;

use anyhow::{Context, Result};
use health::HealthRegistry;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::RecencyCache;
use crate::config::Config;
use crate::fingerprint;
use crate::index::{self, CrossPartitionIndex, IndexHandle};
use crate::processor::DedupProcessor;
use crate::sink::{PrintSink, RecordSink};
use crate::store::DedupStoreConfig;
use crate::store_manager::StoreManager;

/// The deduplicator service: wires configuration into the decision processor
/// and owns the background tasks around it.
pub struct DedupService {
    config: Config,
    processor: Arc<DedupProcessor>,
    stores: Arc<StoreManager>,
    readiness: HealthRegistry,
    index_task: Option<JoinHandle<()>>,
}

impl DedupService {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_sink(config, Arc::new(PrintSink {}))
    }

    /// Builds the service around a custom sink, the seam tests use.
    pub fn with_sink(config: Config, sink: Arc<dyn RecordSink + Send + Sync>) -> Result<Self> {
        config
            .validate()
            .context("configuration validation failed")?;

        let readiness = HealthRegistry::new("readiness");
        let fingerprinter = fingerprint::for_algorithm(&config.fingerprint_algorithm)
            .context("unsupported fingerprint algorithm")?;
        let cache = RecencyCache::new(config.cache_max_entries, config.cache_ttl());
        let stores = Arc::new(StoreManager::new(
            DedupStoreConfig {
                path: config.store_path_buf(),
            },
            readiness.clone(),
        ));

        let (index, index_task) = if config.cross_partition_index {
            let shared = Arc::new(CrossPartitionIndex::new());
            let (writer, task) = index::spawn_replicator(
                shared.clone(),
                config.index_channel_capacity,
                config.index_lag_tolerance(),
            );
            (
                Some(IndexHandle {
                    index: shared,
                    writer,
                }),
                Some(task),
            )
        } else {
            (None, None)
        };

        let processor = Arc::new(DedupProcessor::new(
            stores.clone(),
            cache,
            fingerprinter,
            index,
            sink,
            config.recovery_wait_timeout(),
        ));

        Ok(Self {
            config,
            processor,
            stores,
            readiness,
            index_task,
        })
    }

    pub fn processor(&self) -> Arc<DedupProcessor> {
        self.processor.clone()
    }

    pub fn readiness(&self) -> &HealthRegistry {
        &self.readiness
    }

    pub fn store_manager(&self) -> Arc<StoreManager> {
        self.stores.clone()
    }

    /// Runs until shutdown is signalled, then flushes the stores.
    pub async fn run(self) -> Result<()> {
        let refresh = self.spawn_readiness_refresh();
        let compaction = self
            .config
            .compaction_interval()
            .map(|interval| self.stores.clone().start_periodic_compaction(interval));

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutdown signal received");

        refresh.abort();
        if let Some(task) = compaction {
            task.stop().await;
        }
        if let Some(task) = self.index_task {
            task.abort();
        }
        self.stores.shutdown().await;

        Ok(())
    }

    fn spawn_readiness_refresh(&self) -> JoinHandle<()> {
        let stores = self.stores.clone();
        let interval = self.config.readiness_refresh();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for handle in stores.handles() {
                    handle.refresh_health();
                }
            }
        })
    }
}
