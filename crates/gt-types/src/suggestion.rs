//! Candidate configurations and their identifiers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Trial identifier minted by a search; unique among that search's live trials.
pub type Tid = u64;

/// A candidate configuration proposed by a search.
///
/// Two suggestions are the same work iff their canonical serialization is
/// byte-identical, see [`Suggestion::canonical_bytes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Suggestion(Value);

impl Suggestion {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Look up a nested field with a JSON pointer (e.g. `/model/alpha`).
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.0.pointer(pointer)
    }

    /// Compact JSON with object keys sorted at every depth.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Serializing a Value cannot fail: keys are always strings.
        serde_json::to_vec(&canonicalize(&self.0)).unwrap_or_default()
    }

    /// Content hash of this suggestion.
    pub fn eid(&self) -> Eid {
        let digest = Sha256::digest(self.canonical_bytes());
        Eid(hex::encode(digest))
    }
}

impl From<Value> for Suggestion {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl fmt::Display for Suggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.canonical_bytes()))
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Evaluation identifier: hex SHA-256 of a suggestion's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Eid(String);

impl Eid {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eid_ignores_key_order() {
        let a = Suggestion::new(json!({"b": 1, "a": {"y": [1, 2], "x": "s"}}));
        let b = Suggestion::new(json!({"a": {"x": "s", "y": [1, 2]}, "b": 1}));
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        assert_eq!(a.eid(), b.eid());
    }

    #[test]
    fn eid_distinguishes_content() {
        let a = Suggestion::new(json!({"x": 5}));
        let b = Suggestion::new(json!({"x": 6}));
        let c = Suggestion::new(json!({"x": 5.0}));
        assert_ne!(a.eid(), b.eid());
        // Int and float render differently, so they are different work.
        assert_ne!(a.eid(), c.eid());
    }

    #[test]
    fn eid_is_hex_sha256() {
        let eid = Suggestion::new(json!({"x": 1})).eid();
        assert_eq!(eid.as_str().len(), 64);
        assert!(eid.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(eid.short().len(), 12);
    }

    #[test]
    fn display_is_canonical() {
        let s = Suggestion::new(json!({"b": true, "a": null}));
        assert_eq!(s.to_string(), r#"{"a":null,"b":true}"#);
    }
}
