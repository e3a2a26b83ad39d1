//! Content hashing for change detection.

use sha2::{Digest, Sha256};

/// Computes the stable hex-encoded SHA-256 digest of a file's bytes.
///
/// The digest is stored per URI in the index bookkeeping table and compared
/// against freshly crawled content to decide whether re-extraction is needed.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
