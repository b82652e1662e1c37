//! Content fingerprints for record identity
//!
//! A fingerprint is a sha256 hex digest over a stable serialization of a
//! record's identifying content. Fingerprints are how consolidation tells
//! "the same record seen again" apart from "a new record" across runs.

use sha2::{Digest, Sha256};

/// Compute the sha256 hex digest of raw bytes
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute a fingerprint over an ordered sequence of string parts
///
/// Parts are length-prefixed before hashing so that `["ab", "c"]` and
/// `["a", "bc"]` produce different digests.
pub fn fingerprint_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}
