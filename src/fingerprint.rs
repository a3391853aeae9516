//! Content fingerprints (ETags) for plan documents.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Computes the ETag of a document.
///
/// SHA-256 over the compact JSON serialization, base64-encoded and wrapped in
/// double quotes. `serde_json` object maps are key-sorted, so two documents
/// with the same content always serialize to the same bytes regardless of
/// the order their fields were supplied in.
pub fn fingerprint(document: &JsonValue) -> String {
    let canonical = document.to_string();

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    format!("\"{}\"", BASE64.encode(digest))
}
