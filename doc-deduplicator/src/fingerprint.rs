use std::fmt;
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length in bytes of a content fingerprint (a SHA-256 digest).
pub const FINGERPRINT_LEN: usize = 32;

/// Fixed-length digest of a document body, the unit of content comparison.
///
/// Two documents with equal fingerprints are treated as identical; a digest
/// collision is an accepted, bounded risk rather than a modeled error. The
/// digest of an empty body is well-defined (the empty-input digest), so an
/// empty document is comparable like any other.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Base64 rendering, used anywhere a fingerprint reaches logs or wire formats.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }
}

impl From<[u8; FINGERPRINT_LEN]> for Fingerprint {
    fn from(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Fingerprint(bytes)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_base64())
    }
}

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("unsupported fingerprint algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("fingerprint computation failed: {0}")]
    ComputationFailed(String),
}

/// Computes content fingerprints for document bodies.
///
/// Implementations must be deterministic and stable across process restarts
/// and implementation languages (a fixed digest specification, never a
/// language object hash), pure, and safe under concurrent invocation.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, body: &[u8]) -> Result<Fingerprint, FingerprintError>;
}

/// The production fingerprinter, matching the upstream producers which
/// publish SHA-256 digests of the document body.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Fingerprinter;

impl Fingerprinter for Sha256Fingerprinter {
    fn fingerprint(&self, body: &[u8]) -> Result<Fingerprint, FingerprintError> {
        let digest: [u8; FINGERPRINT_LEN] = Sha256::digest(body).into();
        Ok(Fingerprint(digest))
    }
}

/// Resolve a fingerprinter from its configured algorithm identifier.
/// Unknown identifiers fail here, at configuration time, not per record.
pub fn for_algorithm(id: &str) -> Result<Arc<dyn Fingerprinter>, FingerprintError> {
    match id.to_ascii_lowercase().as_str() {
        "sha-256" | "sha256" => Ok(Arc::new(Sha256Fingerprinter)),
        other => Err(FingerprintError::UnsupportedAlgorithm(other.to_string())),
    }
}
