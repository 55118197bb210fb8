//! Encoding of the body-change log for the response header.

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;

/// Recorded values longer than this many characters are cut.
const VALUE_LIMIT: usize = 64;
const VALUE_FIELDS: [&str; 3] = ["from", "value", "to"];

/// The change log as header-safe JSON: values clipped, and everything
/// outside printable ASCII written as `\uXXXX`.
pub(crate) fn encode<T: Serialize>(changes: &[T]) -> Option<String> {
    let mut log = serde_json::to_value(changes).ok()?;
    if let Value::Array(entries) = &mut log {
        for entry in entries.iter_mut().filter_map(Value::as_object_mut) {
            for field in VALUE_FIELDS {
                if let Some(value) = entry.get_mut(field) {
                    clip_value(value);
                }
            }
        }
    }
    Some(escape_non_ascii(&log.to_string()))
}

fn clip_value(value: &mut Value) {
    let clipped = match &*value {
        Value::String(text) => clip(text),
        Value::Array(_) | Value::Object(_) => clip(&value.to_string()),
        _ => None,
    };
    if let Some(clipped) = clipped {
        *value = Value::String(clipped);
    }
}

fn clip(text: &str) -> Option<String> {
    let (end, _) = text.char_indices().nth(VALUE_LIMIT)?;
    Some(format!("{}...", &text[..end]))
}

fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() && !ch.is_ascii_control() {
            out.push(ch);
            continue;
        }
        let mut units = [0u16; 2];
        for unit in ch.encode_utf16(&mut units) {
            let _ = write!(out, "\\u{unit:04x}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde_json::json;

    #[test]
    fn non_ascii_values_survive_as_a_header() {
        let changes = vec![
            json!({"op": "drop", "key": "user", "from": "héllo 👋"}),
            json!({"op": "force", "key": "note", "value": "naïve"}),
        ];
        let encoded = encode(&changes).unwrap();
        assert!(encoded.is_ascii());
        assert!(HeaderValue::from_str(&encoded).is_ok());

        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded[0]["from"], "héllo 👋");
        assert_eq!(decoded[1]["value"], "naïve");
    }

    #[test]
    fn long_values_are_clipped() {
        let long = "é".repeat(500);
        let changes = vec![
            json!({"op": "drop", "key": "prompt", "from": long}),
            json!({"op": "clamp", "key": "temperature", "from": 3.5, "to": 2.0}),
            json!({"op": "drop", "key": "tools", "from": [{"name": "x".repeat(200)}]}),
        ];
        let decoded: Value = serde_json::from_str(&encode(&changes).unwrap()).unwrap();

        let from = decoded[0]["from"].as_str().unwrap();
        assert_eq!(from.chars().count(), VALUE_LIMIT + 3);
        assert!(from.ends_with("..."));
        assert_eq!(decoded[0]["key"], "prompt");
        assert_eq!(decoded[1]["from"], 3.5);
        assert!(decoded[2]["from"].as_str().unwrap().starts_with("[{\"name\""));
    }
}
