//! Durable value encoding
//!
//! Every option value crosses the storage boundary as a flat string. Plain
//! strings are written as-is so that hand-edited rows stay readable; anything
//! else is written as compact JSON. A string whose raw text would itself decode
//! as JSON is written as a JSON string literal, so decoding never changes its
//! type (`"123"` stays a string, `123` stays a number).

use serde_json::Value;

/// Encode a value for the durable store.
pub fn encode(value: &Value) -> String {
    match value {
        Value::String(s) if !is_encoded(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decode a stored payload back into a structured value.
pub fn decode(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

/// Whether `raw` would decode as something other than a raw string.
pub fn is_encoded(raw: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(raw).is_ok()
}

/// Loose "falsy" test used where stored values stand in for absent ones.
pub(crate) fn is_false(value: &Value) -> bool {
    matches!(value, Value::Bool(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_strings_are_stored_raw() {
        assert_eq!(encode(&json!("blue")), "blue");
        assert_eq!(encode(&json!("hello world")), "hello world");
        assert_eq!(decode("blue"), json!("blue"));
    }

    #[test]
    fn test_json_looking_strings_are_quoted() {
        assert_eq!(encode(&json!("123")), "\"123\"");
        assert_eq!(encode(&json!("true")), "\"true\"");
        assert_eq!(encode(&json!("{\"a\":1}")), "\"{\\\"a\\\":1}\"");
        assert_eq!(decode(&encode(&json!("123"))), json!("123"));
        assert_eq!(decode(&encode(&json!("\"quoted\""))), json!("\"quoted\""));
    }

    #[test]
    fn test_structured_values() {
        let value = json!({"a": [1, 2, {"b": null}], "c": "d"});
        assert_eq!(decode(&encode(&value)), value);
        assert_eq!(encode(&json!(42)), "42");
        assert_eq!(decode("42"), json!(42));
        assert_eq!(encode(&json!(false)), "false");
        assert_eq!(decode(""), json!(""));
    }

    #[test]
    fn test_is_encoded() {
        assert!(is_encoded("[1,2]"));
        assert!(is_encoded("null"));
        assert!(!is_encoded("plain text"));
        assert!(!is_encoded(""));
    }
}
