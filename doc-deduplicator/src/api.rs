use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::processor::DedupDecision;
use crate::record::SourceRecord;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupOutcome {
    Accepted,
    Dropped,
}

/// Decision report returned to the harness for each submitted record.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RecordResponse {
    pub outcome: DedupOutcome,
    pub reason: String,
}

impl RecordResponse {
    pub fn from_decision(decision: &DedupDecision) -> Self {
        Self {
            outcome: if decision.is_accept() {
                DedupOutcome::Accepted
            } else {
                DedupOutcome::Dropped
            },
            reason: decision.reason_label().to_string(),
        }
    }
}

/// Wire shape of a record submission.
#[derive(Debug, Deserialize)]
pub struct RecordRequest {
    pub partition: i32,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    pub source_offset: i64,
}

impl RecordRequest {
    pub fn into_record(self) -> Result<SourceRecord, DedupError> {
        if self.partition < 0 {
            return Err(DedupError::InvalidRecord("negative partition".to_string()));
        }
        if self.source_offset < 0 {
            return Err(DedupError::InvalidRecord(
                "negative source offset".to_string(),
            ));
        }
        Ok(SourceRecord {
            partition: self.partition,
            key: self.key,
            body: self.body.map(Bytes::from),
            source_offset: self.source_offset,
        })
    }
}

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("record rejected: {0}")]
    InvalidRecord(String),

    #[error("durable store unavailable for partition {0}")]
    StoreUnavailable(i32),
    #[error("partition {0} is still replaying its change log, retry shortly")]
    StoreNotReady(i32),
    #[error("partition {0} failed change log recovery and cannot serve decisions")]
    RecoveryFailed(i32),
    #[error("change log append failed, decision must be retried")]
    StoreWriteFailed,

    #[error("transient sink error, please retry")]
    RetryableSinkError,
    #[error("invalid record could not be forwarded")]
    NonRetryableSinkError,
}

impl IntoResponse for DedupError {
    fn into_response(self) -> Response {
        match self {
            DedupError::RequestParsingError(_)
            | DedupError::InvalidRecord(_)
            | DedupError::NonRetryableSinkError => (StatusCode::BAD_REQUEST, self.to_string()),

            DedupError::StoreUnavailable(_)
            | DedupError::StoreNotReady(_)
            | DedupError::RecoveryFailed(_)
            | DedupError::StoreWriteFailed
            | DedupError::RetryableSinkError => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}
