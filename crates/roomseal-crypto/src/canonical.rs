//! Canonical JSON encoding for signed payloads
//!
//! Signer and verifier must agree on the exact bytes signed. The canonical
//! form is compact JSON with object keys sorted by their UTF-8 bytes and the
//! top-level `signatures` and `unsigned` members removed.
//!
//! Keys are sorted explicitly rather than relying on the map type inside
//! `serde_json::Value`, which changes when the `preserve_order` feature is
//! enabled anywhere in the dependency graph.

use serde::Serialize;
use serde_json::Value;

use crate::error::CryptoError;

/// Top-level members excluded from the signed bytes.
const UNSIGNED_MEMBERS: [&str; 2] = ["signatures", "unsigned"];

/// Canonical encoding of any serializable value.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let value = serde_json::to_value(value)
        .map_err(|e| CryptoError::Malformed { reason: format!("json: {e}") })?;
    Ok(canonical_json_value(&value))
}

/// Canonical encoding of an already-built JSON value.
pub fn canonical_json_value(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> =
                map.iter().filter(|(k, _)| !UNSIGNED_MEMBERS.contains(&k.as_str())).collect();
            write_object(&mut out, &mut entries);
        },
        other => write_value(&mut out, other),
    }
    out.into_bytes()
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        },
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            write_object(out, &mut entries);
        },
    }
}

fn write_object(out: &mut String, entries: &mut [(&String, &Value)]) {
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    out.push('{');
    for (i, (key, value)) in entries.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, value);
    }
    out.push('}');
}

fn write_string(out: &mut String, s: &str) {
    // serde_json escapes exactly the characters JSON requires and nothing else
    let Ok(escaped) = serde_json::to_string(s) else {
        unreachable!("serializing a str to JSON cannot fail");
    };
    out.push_str(&escaped);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn canonical(value: &Value) -> String {
        String::from_utf8(canonical_json_value(value)).unwrap()
    }

    #[test]
    fn keys_are_sorted_at_every_level() {
        let value = json!({"b": 1, "a": {"z": true, "m": null}});
        assert_eq!(canonical(&value), r#"{"a":{"m":null,"z":true},"b":1}"#);
    }

    #[test]
    fn signatures_and_unsigned_are_dropped_at_top_level_only() {
        let value = json!({
            "key": "abc",
            "signatures": {"@u:x": {"ed25519:D": "sig"}},
            "unsigned": {"age": 5},
            "nested": {"signatures": 1}
        });
        assert_eq!(canonical(&value), r#"{"key":"abc","nested":{"signatures":1}}"#);
    }

    #[test]
    fn arrays_keep_order() {
        let value = json!({"algorithms": ["b", "a"]});
        assert_eq!(canonical(&value), r#"{"algorithms":["b","a"]}"#);
    }

    #[test]
    fn strings_are_escaped() {
        let value = json!({"k": "quote\" slash\\ newline\n é"});
        assert_eq!(canonical(&value), "{\"k\":\"quote\\\" slash\\\\ newline\\n é\"}");
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut first = serde_json::Map::new();
        first.insert("x".into(), json!(1));
        first.insert("a".into(), json!(2));

        let mut second = serde_json::Map::new();
        second.insert("a".into(), json!(2));
        second.insert("x".into(), json!(1));

        assert_eq!(
            canonical_json_value(&Value::Object(first)),
            canonical_json_value(&Value::Object(second))
        );
    }

    #[test]
    fn serializable_structs_encode() {
        #[derive(Serialize)]
        struct Signed {
            key: &'static str,
        }

        assert_eq!(canonical_json(&Signed { key: "abc" }).unwrap(), br#"{"key":"abc"}"#.to_vec());
    }
}
