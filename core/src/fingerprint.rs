//! Canonical request fingerprints.
//!
//! Two requests under the same idempotency token must carry the same
//! parameters. Parameters arrive as JSON, where object member order carries no
//! meaning, so the fingerprint is the compact JSON serialization with object
//! keys sorted at every depth. Array order is preserved: it is significant.
//!
//! Comparison is byte-exact on the canonical text. A mismatch is a definite
//! conflict, never a warning.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Canonical serialization of a request's parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Canonicalize request parameters.
    #[must_use]
    pub fn from_params(params: &Value) -> Self {
        Self(canonicalize(params).to_string())
    }

    /// Wrap a fingerprint loaded from storage.
    ///
    /// The text is taken as-is; it was canonical when it was written.
    #[must_use]
    pub const fn from_canonical(canonical: String) -> Self {
        Self(canonical)
    }

    /// The canonical text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether an incoming request's fingerprint is identical to this one.
    #[must_use]
    pub fn matches(&self, incoming: &Self) -> bool {
        self.0.as_bytes() == incoming.0.as_bytes()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rebuild `value` with object members inserted in key order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(members) => {
            let mut entries: Vec<(&String, &Value)> = members.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            let mut sorted = Map::with_capacity(entries.len());
            for (key, member) in entries {
                sorted.insert(key.clone(), canonicalize(member));
            }
            Value::Object(sorted)
        },
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        scalar => scalar.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn member_order_does_not_matter() {
        let a = Fingerprint::from_params(&json!({"b": 1, "a": {"y": true, "x": null}}));
        let b = Fingerprint::from_params(&json!({"a": {"x": null, "y": true}, "b": 1}));
        assert!(a.matches(&b));
        assert_eq!(a.as_str(), r#"{"a":{"x":null,"y":true},"b":1}"#);
    }

    #[test]
    fn array_order_matters() {
        let a = Fingerprint::from_params(&json!({"stops": ["A", "B"]}));
        let b = Fingerprint::from_params(&json!({"stops": ["B", "A"]}));
        assert!(!a.matches(&b));
    }

    #[test]
    fn different_values_conflict() {
        let a = Fingerprint::from_params(&json!({"amount": 100}));
        let b = Fingerprint::from_params(&json!({"amount": 101}));
        assert!(!a.matches(&b));
    }

    #[test]
    fn stored_text_roundtrips() {
        let original = Fingerprint::from_params(&json!({"k": [1, 2, {"z": 0, "a": 1}]}));
        let loaded = Fingerprint::from_canonical(original.as_str().to_string());
        assert!(loaded.matches(&original));
    }

    fn object_entries() -> impl Strategy<Value = Vec<(String, i64)>> {
        prop::collection::vec(("[a-z]{1,8}", any::<i64>()), 0..12)
    }

    fn build_object(entries: &[(String, i64)], reverse: bool) -> Value {
        let mut members = Map::new();
        let ordered: Vec<&(String, i64)> = if reverse {
            entries.iter().rev().collect()
        } else {
            entries.iter().collect()
        };
        for (key, value) in ordered {
            members.entry(key.clone()).or_insert_with(|| json!(value));
        }
        Value::Object(members)
    }

    proptest! {
        #[test]
        fn canonical_form_is_order_independent(entries in object_entries()) {
            // Deduplicate keys so both insertion orders keep the same values
            let mut seen = std::collections::HashSet::new();
            let unique: Vec<(String, i64)> = entries
                .into_iter()
                .filter(|(key, _)| seen.insert(key.clone()))
                .collect();

            let forward = Fingerprint::from_params(&json!({"outer": build_object(&unique, false)}));
            let backward = Fingerprint::from_params(&json!({"outer": build_object(&unique, true)}));
            prop_assert!(forward.matches(&backward));
        }

        #[test]
        fn canonicalization_is_idempotent(entries in object_entries()) {
            let first = Fingerprint::from_params(&build_object(&entries, false));
            let reparsed: Value = serde_json::from_str(first.as_str()).unwrap();
            let second = Fingerprint::from_params(&reparsed);
            prop_assert_eq!(first, second);
        }
    }
}
