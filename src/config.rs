//! Flattening of the JSON task configuration into dotted key/value pairs.

use std::collections::BTreeMap;

use serde_json::Value;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("invalid JSON config: {source}"))]
    InvalidJson { source: serde_json::Error },

    #[snafu(display("config root must be a JSON object"))]
    NotAnObject,
}

/// Flattens a JSON document into dotted keys mapped to stringified scalar
/// values. Arrays use numeric indices (`items.0.name`); objects recurse.
pub fn flatten_json(raw: &[u8]) -> Result<BTreeMap<String, String>, ConfigError> {
    let document: Value = serde_json::from_slice(raw).context(InvalidJsonSnafu)?;
    let Value::Object(fields) = document else {
        return NotAnObjectSnafu.fail();
    };

    let mut flat = BTreeMap::new();
    for (key, value) in fields {
        flatten_value(key, value, &mut flat);
    }
    Ok(flat)
}

fn flatten_value(prefix: String, value: Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(fields) => {
            for (key, value) in fields {
                flatten_value(format!("{prefix}.{key}"), value, out);
            }
        }
        Value::Array(items) => {
            for (index, value) in items.into_iter().enumerate() {
                flatten_value(format!("{prefix}.{index}"), value, out);
            }
        }
        Value::String(text) => {
            out.insert(prefix, text);
        }
        Value::Number(number) => {
            out.insert(prefix, number.to_string());
        }
        Value::Bool(flag) => {
            out.insert(prefix, flag.to_string());
        }
        Value::Null => {
            out.insert(prefix, "null".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_nested_objects() {
        let flat = flatten_json(
            br#"{"config": {"interval": "10s", "duration": "20s"}, "debug": true}"#,
        )
        .unwrap();

        assert_eq!(flat.get("config.interval").map(String::as_str), Some("10s"));
        assert_eq!(flat.get("config.duration").map(String::as_str), Some("20s"));
        assert_eq!(flat.get("debug").map(String::as_str), Some("true"));
        assert_eq!(flat.get("config.timeout"), None);
    }

    #[test]
    fn flattens_arrays_with_numeric_indices() {
        let flat = flatten_json(br#"{"items": [{"name": "a"}, {"name": "b"}, 3]}"#).unwrap();

        assert_eq!(flat.get("items.0.name").map(String::as_str), Some("a"));
        assert_eq!(flat.get("items.1.name").map(String::as_str), Some("b"));
        assert_eq!(flat.get("items.2").map(String::as_str), Some("3"));
    }

    #[test]
    fn stringifies_scalars_canonically() {
        let flat =
            flatten_json(br#"{"int": 7, "float": 1.5, "none": null, "flag": false}"#).unwrap();

        assert_eq!(flat.get("int").map(String::as_str), Some("7"));
        assert_eq!(flat.get("float").map(String::as_str), Some("1.5"));
        assert_eq!(flat.get("none").map(String::as_str), Some("null"));
        assert_eq!(flat.get("flag").map(String::as_str), Some("false"));
    }

    #[test]
    fn empty_object_yields_empty_view() {
        assert!(flatten_json(b"{}").unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_documents() {
        assert!(matches!(
            flatten_json(b"{not json"),
            Err(ConfigError::InvalidJson { .. })
        ));
        assert!(matches!(
            flatten_json(b"[1, 2, 3]"),
            Err(ConfigError::NotAnObject)
        ));
    }
}
