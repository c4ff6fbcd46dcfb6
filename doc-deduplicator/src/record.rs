use bytes::Bytes;

/// A single keyed document delivered by the stream harness.
///
/// The harness guarantees at-least-once delivery and monotonically
/// non-decreasing `source_offset` within a partition across restarts, so a
/// crash may replay a suffix of already-seen offsets. A missing key or body
/// is not an input this engine deduplicates; such records are forwarded
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub partition: i32,
    pub key: Option<String>,
    pub body: Option<Bytes>,
    /// Position of this record in the source log, used for recovery
    /// consistency checks.
    pub source_offset: i64,
}

impl SourceRecord {
    pub fn new(partition: i32, key: &str, body: impl Into<Bytes>, source_offset: i64) -> Self {
        Self {
            partition,
            key: Some(key.to_string()),
            body: Some(body.into()),
            source_offset,
        }
    }
}

/// The output for an accepted record: the original document, unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedRecord {
    pub partition: i32,
    pub key: Option<String>,
    pub body: Option<Bytes>,
}

impl From<&SourceRecord> for AcceptedRecord {
    fn from(record: &SourceRecord) -> Self {
        Self {
            partition: record.partition,
            key: record.key.clone(),
            body: record.body.clone(),
        }
    }
}
