//! Integrity: whole-file SHA-256 digests as hex strings.

use sha2::{Digest, Sha256};

/// Hex digest of `bytes`. Upper case, matching the hashes peers already publish.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    finish(hasher)
}

/// Finalize a running hasher into the same form as [`digest`].
pub(crate) fn finish(hasher: Sha256) -> String {
    hex::encode_upper(hasher.finalize())
}

/// Verify `bytes` against an expected hex digest (case-insensitive).
pub fn verify(bytes: &[u8], expected: &str) -> bool {
    same_hash(&digest(bytes), expected)
}

pub fn same_hash(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Canonical key form of a hash.
pub fn normalize_hash(hash: &str) -> String {
    hash.trim().to_ascii_uppercase()
}
