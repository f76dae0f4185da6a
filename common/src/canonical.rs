//! Canonical JSON serialization and hashing.
//!
//! Agent configurations are content-addressed: two configs are "the same" iff
//! the SHA-256 of their canonical serialization matches, regardless of the key
//! order the caller happened to send. Canonical form sorts object keys
//! recursively. Absent keys are not serialized at all, so an explicit `null`
//! stays distinguishable from an omitted field.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
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
        other => out.push_str(&other.to_string()),
    }
}

pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 of the canonical serialization, as lowercase hex.
pub fn hash_canonical(value: &Value) -> String {
    sha256_hex(&canonicalize(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively() {
        let a = json!({"b": {"y": 1, "x": 2}, "a": 3});
        let b = json!({"a": 3, "b": {"x": 2, "y": 1}});
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(canonicalize(&a), r#"{"a":3,"b":{"x":2,"y":1}}"#);
    }

    #[test]
    fn hash_stable_under_key_reordering() {
        let a = json!({"name": "analyzer", "image": "docker.io/acme/x:v1"});
        let b = json!({"image": "docker.io/acme/x:v1", "name": "analyzer"});
        assert_eq!(hash_canonical(&a), hash_canonical(&b));
    }

    #[test]
    fn null_differs_from_absent() {
        let with_null = json!({"a": 1, "b": null});
        let absent = json!({"a": 1});
        assert_ne!(hash_canonical(&with_null), hash_canonical(&absent));
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!({"k": [1, 2]});
        let b = json!({"k": [2, 1]});
        assert_ne!(hash_canonical(&a), hash_canonical(&b));
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(canonicalize(&json!("hi")), r#""hi""#);
        assert_eq!(canonicalize(&json!(2.5)), "2.5");
        assert_eq!(canonicalize(&json!(null)), "null");
        assert_eq!(canonicalize(&json!(true)), "true");
    }
}
