//! Invocation fingerprinting for consecutive-duplicate detection.
//!
//! A fingerprint is a SHA-256 digest over the plugin id and the canonical
//! form of the invocation input. Canonicalisation sorts object keys
//! recursively, so two inputs that differ only in key order (at any nesting
//! depth) produce equal fingerprints. Plain string equality over serialised
//! JSON would be key-order sensitive; the digest is not.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value in canonical form: object keys sorted
/// lexicographically at every level, no whitespace.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key serialisation cannot fail for a plain string.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a single serde_json rendering.
        other => out.push_str(&other.to_string()),
    }
}

/// Canonical textual form of a JSON value.
pub fn canonical_form(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Fingerprint of one plugin invocation.
pub fn fingerprint(plugin_id: &str, input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plugin_id.as_bytes());
    hasher.update([0]);
    hasher.update(canonical_form(input).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(fingerprint("search", &a), fingerprint("search", &b));
    }

    #[test]
    fn nested_key_order_does_not_matter() {
        let a = json!({"outer": {"x": true, "y": [1, {"p": 1, "q": 2}]}});
        let b = json!({"outer": {"y": [1, {"q": 2, "p": 1}], "x": true}});
        assert_eq!(fingerprint("search", &a), fingerprint("search", &b));
    }

    #[test]
    fn different_inputs_differ() {
        let a = json!({"q": "x"});
        let b = json!({"q": "y"});
        assert_ne!(fingerprint("search", &a), fingerprint("search", &b));
    }

    #[test]
    fn different_plugins_differ() {
        let input = json!({"q": "x"});
        assert_ne!(fingerprint("search", &input), fingerprint("files", &input));
    }

    #[test]
    fn array_order_matters() {
        let a = json!({"items": [1, 2]});
        let b = json!({"items": [2, 1]});
        assert_ne!(fingerprint("search", &a), fingerprint("search", &b));
    }

    #[test]
    fn canonical_form_is_sorted_and_compact() {
        let value = json!({"b": 2, "a": {"d": null, "c": "x"}});
        assert_eq!(canonical_form(&value), r#"{"a":{"c":"x","d":null},"b":2}"#);
    }
}
