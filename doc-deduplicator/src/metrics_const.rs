// Decision path
pub const RECORDS_PROCESSED_COUNTER: &str = "dedup_records_processed_total";
pub const RECORDS_ACCEPTED_COUNTER: &str = "dedup_records_accepted_total";
pub const RECORDS_DROPPED_COUNTER: &str = "dedup_records_dropped_total";
pub const RECORDS_PASSED_THROUGH_COUNTER: &str = "dedup_records_passed_through_total";
pub const FAIL_OPEN_COUNTER: &str = "dedup_fail_open_total";
pub const DECISION_DURATION_HISTOGRAM: &str = "dedup_decision_duration_seconds";

// Durable store and change log
pub const STORE_WRITE_FAILURES_COUNTER: &str = "dedup_store_write_failures_total";
pub const ACTIVE_PARTITION_GAUGE: &str = "dedup_active_partitions";
pub const CHANGELOG_TORN_TAIL_COUNTER: &str = "dedup_changelog_torn_tail_total";
pub const COMPACTION_BYTES_FREED_HISTOGRAM: &str = "dedup_compaction_bytes_freed";

// Recovery
pub const RECOVERY_DURATION_HISTOGRAM: &str = "dedup_recovery_duration_seconds";
pub const RECOVERY_RECORDS_REPLAYED_COUNTER: &str = "dedup_recovery_records_replayed_total";
pub const RECOVERY_FAILURES_COUNTER: &str = "dedup_recovery_failures_total";

// Cross-partition index
pub const INDEX_APPLY_LAG_GAUGE: &str = "dedup_index_apply_lag_ms";
pub const INDEX_SIZE_GAUGE: &str = "dedup_index_size";
pub const INDEX_PUBLISH_DROPPED_COUNTER: &str = "dedup_index_publish_dropped_total";

// Output
pub const SINK_EMITTED_COUNTER: &str = "dedup_sink_records_emitted_total";
