//! Per-key document deduplication service.
//!
//! Keyed documents arrive in source order, one logical partition at a time.
//! A document is forwarded to the output sink only if its content fingerprint
//! differs from the last fingerprint recorded for its key; everything else is
//! suppressed. Each partition owns a durable key store materialized from an
//! append-only change log, which is replayed on startup or reassignment
//! before that partition serves any decision.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use
//! formats that keep the full chain visible in logs:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line.
//! - **Structured field:** `error = ?e` for the full chain with `Caused by:` sections.
//!
//! Avoid `{}` / `%e` (Display) for errors, they only show the top-level message.

pub mod api;
pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod index;
pub mod metrics_const;
pub mod processor;
pub mod record;
pub mod recovery;
pub mod router;
pub mod server;
pub mod service;
pub mod sink;
pub mod store;
pub mod store_manager;

// Re-export commonly used types for convenience
pub use fingerprint::{Fingerprint, Fingerprinter};
pub use processor::{DedupDecision, DedupProcessor};
pub use record::SourceRecord;
