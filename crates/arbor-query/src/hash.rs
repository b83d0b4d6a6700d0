// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content hashing of result trees and GetSpecs.
//!
//! Values are encoded as CBOR with object keys sorted, then hashed with
//! blake3. Two JSON values hash equal exactly when they are equal as JSON.
use std::fmt;

use ciborium::value::{Integer, Value as Cbor};
use serde_json::Value;
use thiserror::Error;

/// Canonical encoding failure.
#[derive(Debug, Error)]
#[error("canonical encoding failed: {0}")]
pub struct HashError(String);

/// 32-byte blake3 digest of a canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Canonical CBOR bytes of `value` (object keys sorted).
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, HashError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&to_cbor(value), &mut bytes).map_err(|e| HashError(e.to_string()))?;
    Ok(bytes)
}

/// blake3 hash of the canonical encoding of `value`.
pub fn content_hash(value: &Value) -> Result<ContentHash, HashError> {
    Ok(ContentHash(*blake3::hash(&canonical_bytes(value)?).as_bytes()))
}

fn to_cbor(value: &Value) -> Cbor {
    match value {
        Value::Null => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Cbor::Integer(Integer::from(i))
            } else if let Some(u) = n.as_u64() {
                Cbor::Integer(Integer::from(u))
            } else {
                Cbor::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Cbor::Text(s.clone()),
        Value::Array(items) => Cbor::Array(items.iter().map(to_cbor).collect()),
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Cbor::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (Cbor::Text(k.clone()), to_cbor(v)))
                    .collect(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_values_hash_equal() {
        let a = json!({ "b": 1, "a": [true, null, "x"] });
        let b = json!({ "a": [true, null, "x"], "b": 1 });
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn different_values_hash_differently() {
        let a = json!({ "value": 5 });
        let b = json!({ "value": 6 });
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
        assert_ne!(content_hash(&json!(1)).unwrap(), content_hash(&json!("1")).unwrap());
    }

    #[test]
    fn hex_is_64_chars() {
        let h = content_hash(&json!({})).unwrap();
        assert_eq!(h.to_hex().len(), 64);
        assert_eq!(h.to_string(), h.to_hex());
    }
}
