//! Payload checksums and the stable routing hash.
//!
//! Both functions are part of the cross-language contract: producers written
//! in other languages must compute the same values.
//!
//! - Checksum: lowercase hex SHA-256 of the raw payload bytes.
//! - Routing hash: BLAKE3 of the UTF-8 key, first 8 digest bytes read as a
//!   little-endian `u64`. No seed, no per-process randomness.

use sha2::{Digest, Sha256};

/// Compute the checksum a producer attaches to a payload.
pub fn payload_checksum(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// Recompute the checksum of `payload` and compare it to `expected`.
///
/// Hex case is ignored; surrounding whitespace is not tolerated.
pub fn checksum_matches(payload: &[u8], expected: &str) -> bool {
    payload_checksum(payload).eq_ignore_ascii_case(expected)
}

/// Stable 64-bit hash of a routing key.
pub fn stable_hash64(key: &str) -> u64 {
    let digest = blake3::hash(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}
