use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use crate::api::DedupError;
use crate::metrics_const::SINK_EMITTED_COUNTER;
use crate::record::AcceptedRecord;

/// Where accepted records go. Transport past this seam belongs to the
/// harness; the engine only guarantees the change log append for a record
/// happened before it is offered here.
#[async_trait]
pub trait RecordSink {
    async fn send(&self, record: AcceptedRecord) -> Result<(), DedupError>;
    async fn send_batch(&self, records: Vec<AcceptedRecord>) -> Result<(), DedupError>;
}

/// Sink for running without a downstream, logs every accepted record.
pub struct PrintSink {}

#[async_trait]
impl RecordSink for PrintSink {
    async fn send(&self, record: AcceptedRecord) -> Result<(), DedupError> {
        info!("accepted record: {:?}", record);
        metrics::counter!(SINK_EMITTED_COUNTER).increment(1);

        Ok(())
    }

    async fn send_batch(&self, records: Vec<AcceptedRecord>) -> Result<(), DedupError> {
        metrics::counter!(SINK_EMITTED_COUNTER).increment(records.len() as u64);
        for record in records {
            info!("accepted record: {:?}", record);
        }

        Ok(())
    }
}

/// In-memory sink capturing forwarded records, for tests.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<AcceptedRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AcceptedRecord> {
        self.records
            .lock()
            .expect("poisoned MemorySink lock")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("poisoned MemorySink lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn send(&self, record: AcceptedRecord) -> Result<(), DedupError> {
        self.records
            .lock()
            .expect("poisoned MemorySink lock")
            .push(record);
        Ok(())
    }

    async fn send_batch(&self, records: Vec<AcceptedRecord>) -> Result<(), DedupError> {
        self.records
            .lock()
            .expect("poisoned MemorySink lock")
            .extend(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn accepted(key: &str) -> AcceptedRecord {
        AcceptedRecord {
            partition: 0,
            key: Some(key.to_string()),
            body: Some(Bytes::from("payload")),
        }
    }

    #[tokio::test]
    async fn memory_sink_captures_in_order() {
        let sink = MemorySink::new();
        sink.send(accepted("doc-1")).await.unwrap();
        sink.send(accepted("doc-2")).await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key.as_deref(), Some("doc-1"));
        assert_eq!(records[1].key.as_deref(), Some("doc-2"));
    }

    #[tokio::test]
    async fn print_sink_accepts_everything() {
        let sink = PrintSink {};
        sink.send(accepted("doc-1")).await.unwrap();
        sink.send_batch(vec![accepted("doc-2"), accepted("doc-3")])
            .await
            .unwrap();
    }
}
