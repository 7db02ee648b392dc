//! Content hashing using SHA-256.
//!
//! Every id that crosses a replica boundary (changesets, records) is the
//! hex digest of a canonical JSON encoding, so two replicas holding the
//! same logical value always agree on its id.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of arbitrary bytes, returned as a hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

/// Canonical JSON bytes of a value.
///
/// Only used on plain in-memory types (structs, sorted maps, strings), for
/// which serialization cannot fail.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("canonical serialization should not fail")
}

/// Hash of a value's canonical JSON encoding.
pub fn hash_json<T: Serialize>(value: &T) -> String {
    hash_bytes(&canonical_bytes(value))
}

/// True if `s` looks like a full hex SHA-256 digest.
pub fn is_full_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash_bytes(b"hello world"), hash_bytes(b"hello world"));
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }

    #[test]
    fn test_hash_length() {
        let h = hash_bytes(b"test");
        assert_eq!(h.len(), 64);
        assert!(is_full_hash(&h));
        assert!(!is_full_hash("abc"));
    }

    #[test]
    fn test_hash_json_ignores_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("x", 1);
        a.insert("y", 2);
        let mut b = BTreeMap::new();
        b.insert("y", 2);
        b.insert("x", 1);
        assert_eq!(hash_json(&a), hash_json(&b));
    }
}
