//! Canonical content hashing.
//!
//! `serde_json::Value` objects are backed by a `BTreeMap` (no
//! `preserve_order` feature), so serializing through `Value` yields keys in
//! sorted order and equal documents always produce equal bytes.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the canonical JSON encoding of `value`.
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> String {
    let canonical = match serde_json::to_value(value) {
        Ok(v) => serde_json::to_vec(&v).unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    hash_bytes(&canonical)
}

/// SHA-256 hex digest of raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"b": 1, "a": {"y": true, "x": [1, 2]}});
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a": {"x": [1, 2], "y": true}, "b": 1}"#).unwrap();
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn different_values_differ() {
        assert_ne!(canonical_hash(&json!({"a": 1})), canonical_hash(&json!({"a": 2})));
    }

    #[test]
    fn hex_length_is_64() {
        assert_eq!(canonical_hash(&json!(null)).len(), 64);
    }
}
