//! Lenient extraction of JSON from model output.
//!
//! Chat models wrap JSON in code fences, prefix it with prose, or return an
//! object holding the array that was asked for. Everything here recovers the
//! payload or reports a permanent provider error.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use lore_core::error::{LoreError, Result};

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*(.*?)\s*```").ok())
        .as_ref()
}

/// Parse the first JSON value found in `raw`.
pub fn parse_json(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    let body = fence_regex()
        .and_then(|re| re.captures(trimmed))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Ok(value);
    }
    // Prose around the payload: take the outermost bracketed span.
    for (open, close) in [('[', ']'), ('{', '}')] {
        if let (Some(start), Some(end)) = (body.find(open), body.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<Value>(&body[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }
    Err(malformed(raw))
}

/// Parse a JSON array, unwrapping an object that holds one under `keys`
/// (or, failing that, under any key).
pub fn parse_array(raw: &str, keys: &[&str]) -> Result<Vec<Value>> {
    match parse_json(raw)? {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in keys {
                if let Some(Value::Array(items)) = map.remove(*key) {
                    return Ok(items);
                }
            }
            map.into_iter()
                .find_map(|(_, v)| match v {
                    Value::Array(items) => Some(items),
                    _ => None,
                })
                .ok_or_else(|| malformed(raw))
        }
        _ => Err(malformed(raw)),
    }
}

/// First string field among `keys`.
pub fn str_field<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

/// First numeric field among `keys`. Numeric strings are accepted.
pub fn num_field(obj: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Clamp a provider-reported score into [0, 1]. NaN yields `None`.
pub fn unit_interval(value: f64) -> Option<f64> {
    if value.is_nan() {
        None
    } else {
        Some(value.clamp(0.0, 1.0))
    }
}

fn malformed(raw: &str) -> LoreError {
    let preview: String = raw.chars().take(120).collect();
    LoreError::ProviderPermanent(format!("unparseable model response: {}", preview))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_array() {
        assert_eq!(parse_array(r#"["a", "b"]"#, &[]).unwrap(), vec![json!("a"), json!("b")]);
    }

    #[test]
    fn test_fenced_array() {
        let raw = "```json\n[\"冷静\", \"果断\"]\n```";
        assert_eq!(parse_array(raw, &[]).unwrap().len(), 2);
    }

    #[test]
    fn test_array_inside_prose() {
        let raw = "Here are the tags: [\"brave\"] hope that helps";
        assert_eq!(parse_array(raw, &[]).unwrap(), vec![json!("brave")]);
    }

    #[test]
    fn test_wrapped_array_prefers_named_key() {
        let raw = r#"{"notes": ["x"], "tags": ["brave", "loyal"]}"#;
        assert_eq!(parse_array(raw, &["tags"]).unwrap().len(), 2);
    }

    #[test]
    fn test_garbage_is_permanent_error() {
        let err = parse_array("I cannot help with that.", &[]).unwrap_err();
        assert!(matches!(err, LoreError::ProviderPermanent(_)));
        let err = parse_array("42", &[]).unwrap_err();
        assert!(matches!(err, LoreError::ProviderPermanent(_)));
    }

    #[test]
    fn test_fields() {
        let v = json!({"label": "brave", "score": "0.8"});
        assert_eq!(str_field(&v, &["tag", "label"]), Some("brave"));
        assert_eq!(num_field(&v, &["confidence", "score"]), Some(0.8));
        assert_eq!(unit_interval(1.7), Some(1.0));
        assert_eq!(unit_interval(f64::NAN), None);
    }
}
