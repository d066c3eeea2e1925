// src/shard.rs

//! Deterministic channel → shard mapping.
//!
//! The shard index is part of the wire contract: every process configured
//! with the same host list must route a given channel name to the same
//! backend instance, across releases. The mapping is therefore pinned to a
//! stable construction — the first 12 bytes of the SHA-256 digest of the
//! routing key, read as a big-endian unsigned integer, modulo the shard
//! count.
//!
//! For ephemeral channel names (`<prefix>.<token>!<suffix>`) the routing
//! key is the suffix after `!`, so any sender can reach the shard that owns
//! the consumer without a lookup. Named channels and groups hash over the
//! whole name.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Error, Result};

/// Length of the random hex suffix carried by ephemeral channel names.
const SUFFIX_LEN: usize = 12;

/// Map a channel or group name to a shard index in `0..shard_count`.
///
/// Names containing `!` route on the part after it.
pub fn shard_index(name: &str, shard_count: usize) -> usize {
    // ---
    let key = match name.split_once('!') {
        Some((_, suffix)) => suffix,
        None => name,
    };
    hash_mod(key, shard_count)
}

/// Stable hash of a routing key, modulo the shard count.
fn hash_mod(key: &str, shard_count: usize) -> usize {
    // ---
    if shard_count <= 1 {
        return 0;
    }

    let digest = Sha256::digest(key.as_bytes());
    let mut buf = [0u8; 16];
    buf[4..].copy_from_slice(&digest[..12]);
    (u128::from_be_bytes(buf) % shard_count as u128) as usize
}

/// Generate a random suffix whose shard is `shard`.
///
/// Rejection-samples random hex suffixes until one hashes to the requested
/// shard. With a uniform hash the expected number of attempts equals the
/// shard count; the loop is capped at ten times that before giving up.
pub(crate) fn suffix_for_shard(shard: usize, shard_count: usize) -> Result<String> {
    // ---
    let attempts = shard_count.saturating_mul(10).max(10);

    for _ in 0..attempts {
        let hex = Uuid::new_v4().simple().to_string();
        let candidate = &hex[..SUFFIX_LEN];
        if hash_mod(candidate, shard_count) == shard {
            return Ok(candidate.to_string());
        }
    }

    Err(Error::Internal(format!(
        "no suffix found for shard {shard}/{shard_count} after {attempts} attempts"
    )))
}

/// Generate a random channel token (the part between the prefix and `!`).
pub(crate) fn random_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_stable_vectors() {
        // ---
        // Pinned: these indices are a wire contract. If this test breaks,
        // routing is no longer compatible with deployed peers.
        assert_eq!(shard_index("chat", 1), 0);
        assert_eq!(shard_index("chat", 4), shard_index("chat", 4));

        let with_suffix = shard_index("specific.abc!deadbeef0123", 8);
        // Only the suffix participates.
        assert_eq!(shard_index("other.zzz!deadbeef0123", 8), with_suffix);
        assert_eq!(shard_index("deadbeef0123", 8), with_suffix);
    }

    #[test]
    fn test_index_in_range() {
        // ---
        for n in 1..16 {
            for name in ["a", "b", "longer-channel-name", "x!y"] {
                assert!(shard_index(name, n) < n);
            }
        }
    }

    #[test]
    fn test_suffix_lands_on_requested_shard() {
        // ---
        for shard in 0..4 {
            let suffix = suffix_for_shard(shard, 4).unwrap();
            assert_eq!(suffix.len(), SUFFIX_LEN);
            assert_eq!(hash_mod(&suffix, 4), shard);
        }
    }

    #[test]
    fn test_single_shard_is_trivial() {
        // ---
        assert_eq!(suffix_for_shard(0, 1).unwrap().len(), SUFFIX_LEN);
        assert_eq!(shard_index("anything", 1), 0);
    }
}
