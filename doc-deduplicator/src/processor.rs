use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, instrument, warn};

use crate::api::DedupError;
use crate::cache::RecencyCache;
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::index::IndexHandle;
use crate::metrics_const::{
    DECISION_DURATION_HISTOGRAM, FAIL_OPEN_COUNTER, RECORDS_ACCEPTED_COUNTER,
    RECORDS_DROPPED_COUNTER, RECORDS_PASSED_THROUGH_COUNTER, RECORDS_PROCESSED_COUNTER,
    STORE_WRITE_FAILURES_COUNTER,
};
use crate::record::{AcceptedRecord, SourceRecord};
use crate::sink::RecordSink;
use crate::store::DedupStore;
use crate::store_manager::StoreManager;

/// Outcome of a dedup decision for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// First sighting of the key; forwarded.
    New,
    /// Known key with changed content; forwarded.
    Changed,
    /// Same content as the last sighting; suppressed.
    Duplicate(DuplicateSource),
    /// Not a dedup decision at all; the record is forwarded unchanged.
    PassedThrough(PassThroughReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateSource {
    RecencyCache,
    DurableStore,
    CrossPartitionIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThroughReason {
    MissingKey,
    MissingBody,
    /// Fingerprinting failed; forwarding beats stalling the partition.
    FingerprintFailed,
}

impl DedupDecision {
    pub fn is_accept(&self) -> bool {
        !matches!(self, DedupDecision::Duplicate(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, DedupDecision::Duplicate(_))
    }

    pub fn outcome_label(&self) -> &'static str {
        if self.is_accept() {
            "accepted"
        } else {
            "dropped"
        }
    }

    pub fn reason_label(&self) -> &'static str {
        match self {
            DedupDecision::New => "new",
            DedupDecision::Changed => "changed",
            DedupDecision::Duplicate(DuplicateSource::RecencyCache) => "recency_cache",
            DedupDecision::Duplicate(DuplicateSource::DurableStore) => "durable_store",
            DedupDecision::Duplicate(DuplicateSource::CrossPartitionIndex) => {
                "cross_partition_index"
            }
            DedupDecision::PassedThrough(PassThroughReason::MissingKey) => "missing_key",
            DedupDecision::PassedThrough(PassThroughReason::MissingBody) => "missing_body",
            DedupDecision::PassedThrough(PassThroughReason::FingerprintFailed) => {
                "fingerprint_failed"
            }
        }
    }
}

/// Per-record deduplication decision engine.
///
/// Consults the recency cache, then the partition's durable store, then the
/// optional cross-partition index, updating all of them before a decision is
/// returned. The harness delivers records for one partition sequentially in
/// source order; across partitions calls run in parallel.
///
/// Store handles are injected through the manager at construction and scoped
/// to this instance.
pub struct DedupProcessor {
    stores: Arc<StoreManager>,
    cache: RecencyCache,
    fingerprinter: Arc<dyn Fingerprinter>,
    index: Option<IndexHandle>,
    sink: Arc<dyn RecordSink + Send + Sync>,
    recovery_wait_timeout: Duration,
}

impl DedupProcessor {
    pub fn new(
        stores: Arc<StoreManager>,
        cache: RecencyCache,
        fingerprinter: Arc<dyn Fingerprinter>,
        index: Option<IndexHandle>,
        sink: Arc<dyn RecordSink + Send + Sync>,
        recovery_wait_timeout: Duration,
    ) -> Self {
        Self {
            stores,
            cache,
            fingerprinter,
            index,
            sink,
            recovery_wait_timeout,
        }
    }

    pub fn store_manager(&self) -> &Arc<StoreManager> {
        &self.stores
    }

    /// Decides one record. The decision, its change log append and the sink
    /// emission all complete before this returns, so within a partition the
    /// next record for a key always sees this one's update.
    #[instrument(skip_all, fields(partition = record.partition, source_offset = record.source_offset))]
    pub async fn process_record(&self, record: SourceRecord) -> Result<DedupDecision, DedupError> {
        let start = Instant::now();
        metrics::counter!(RECORDS_PROCESSED_COUNTER).increment(1);

        let decision = self.decide(&record).await?;

        if decision.is_accept() {
            // The change log append for this decision is already durable;
            // emitting afterwards bounds the duplicate window on crash to
            // re-delivery of unemitted records.
            self.sink.send(AcceptedRecord::from(&record)).await?;
            metrics::counter!(RECORDS_ACCEPTED_COUNTER, "reason" => decision.reason_label())
                .increment(1);
        } else {
            metrics::counter!(RECORDS_DROPPED_COUNTER, "source" => decision.reason_label())
                .increment(1);
        }

        metrics::histogram!(DECISION_DURATION_HISTOGRAM).record(start.elapsed().as_secs_f64());
        Ok(decision)
    }

    async fn decide(&self, record: &SourceRecord) -> Result<DedupDecision, DedupError> {
        let key = match record.key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => {
                metrics::counter!(RECORDS_PASSED_THROUGH_COUNTER, "reason" => "missing_key")
                    .increment(1);
                return Ok(DedupDecision::PassedThrough(PassThroughReason::MissingKey));
            }
        };
        let body = match record.body.as_deref() {
            Some(body) => body,
            None => {
                metrics::counter!(RECORDS_PASSED_THROUGH_COUNTER, "reason" => "missing_body")
                    .increment(1);
                return Ok(DedupDecision::PassedThrough(PassThroughReason::MissingBody));
            }
        };

        let fingerprint = match self.fingerprinter.fingerprint(body) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                // Fail open: a record we cannot fingerprint is forwarded,
                // not dropped and not allowed to stall the partition.
                warn!(key, error = ?e, "fingerprinting failed, forwarding record unhashed");
                metrics::counter!(FAIL_OPEN_COUNTER, "stage" => "fingerprint").increment(1);
                return Ok(DedupDecision::PassedThrough(
                    PassThroughReason::FingerprintFailed,
                ));
            }
        };

        // Fast path for back-to-back duplicates. A hit with a different
        // fingerprint is not authoritative; the store decides below.
        if let Some(cached) = self.cache.get(record.partition, key) {
            if cached == fingerprint {
                return Ok(DedupDecision::Duplicate(DuplicateSource::RecencyCache));
            }
        }

        let handle = self.stores.get_or_create(record.partition).await?;
        handle.wait_ready(self.recovery_wait_timeout).await?;

        let mut store = handle.store().lock().await;
        let existing = store.get(key).map(|entry| entry.fingerprint);

        let decision = match existing {
            None => {
                if let Some(remote) = self.index_lookup(key) {
                    if remote == fingerprint {
                        // Another partition already produced this content.
                        // Record it locally so the next duplicate is caught
                        // without the index.
                        self.put(&mut store, key, fingerprint, record.source_offset)?;
                        self.cache.put(record.partition, key, fingerprint);
                        return Ok(DedupDecision::Duplicate(
                            DuplicateSource::CrossPartitionIndex,
                        ));
                    }
                }
                self.put(&mut store, key, fingerprint, record.source_offset)?;
                self.cache.put(record.partition, key, fingerprint);
                self.publish_to_index(key, fingerprint);
                DedupDecision::New
            }
            Some(previous) if previous == fingerprint => {
                // Refresh the cache so the next duplicate is caught a tier up
                self.cache.put(record.partition, key, fingerprint);
                DedupDecision::Duplicate(DuplicateSource::DurableStore)
            }
            Some(_) => {
                self.put(&mut store, key, fingerprint, record.source_offset)?;
                self.cache.put(record.partition, key, fingerprint);
                self.publish_to_index(key, fingerprint);
                DedupDecision::Changed
            }
        };

        Ok(decision)
    }

    fn put(
        &self,
        store: &mut DedupStore,
        key: &str,
        fingerprint: Fingerprint,
        source_offset: i64,
    ) -> Result<(), DedupError> {
        store.put(key, fingerprint, source_offset).map_err(|e| {
            // Never accept without persisting; surface as retryable instead
            error!(key, error = ?e, "change log append failed");
            metrics::counter!(STORE_WRITE_FAILURES_COUNTER).increment(1);
            DedupError::StoreWriteFailed
        })
    }

    fn index_lookup(&self, key: &str) -> Option<Fingerprint> {
        self.index
            .as_ref()
            .and_then(|handle| handle.index.lookup(key))
    }

    fn publish_to_index(&self, key: &str, fingerprint: Fingerprint) {
        if let Some(handle) = &self.index {
            handle.writer.publish(key, fingerprint);
        }
    }
}
