//! JSON-path extraction (dotted subset)
//!
//! Extractors accept dotted field names with an optional `$.` prefix and
//! nothing else; there is deliberately no expression language here.

use chrono::{DateTime, Utc};

use edge_model::{Quality, Value};

use crate::error::{AcqError, Result};

/// Validate an extractor path at configuration time
pub fn validate_path(path: &str) -> Result<()> {
    let stripped = path.strip_prefix("$.").unwrap_or(path);
    if stripped.is_empty() {
        return Err(AcqError::config("Empty JSON path".to_string()));
    }
    for segment in stripped.split('.') {
        if segment.is_empty() {
            return Err(AcqError::config(format!("Bad JSON path '{}'", path)));
        }
        if segment
            .chars()
            .any(|c| c == '[' || c == ']' || c == '*' || c.is_whitespace())
        {
            return Err(AcqError::config(format!(
                "Unsupported JSON path syntax '{}'",
                path
            )));
        }
    }
    Ok(())
}

/// Walk a dotted path into a JSON document
pub fn json_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let stripped = path.strip_prefix("$.").unwrap_or(path);
    let mut current = root;
    for segment in stripped.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Interpret an extracted JSON node as a timestamp
///
/// Accepts RFC3339 strings and epoch milliseconds.
pub fn extract_timestamp(node: &serde_json::Value) -> Option<DateTime<Utc>> {
    match node {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let ms = n.as_i64()?;
            DateTime::from_timestamp_millis(ms)
        },
        _ => None,
    }
}

/// Interpret an extracted JSON node as a quality code
pub fn extract_quality(node: &serde_json::Value) -> Option<Quality> {
    node.as_i64().map(Quality::from_code)
}

/// Parse a raw (non-JSON) payload into a value
pub fn parse_raw_value(payload: &[u8]) -> Value {
    let text = String::from_utf8_lossy(payload);
    let trimmed = text.trim();
    if let Ok(number) = trimmed.parse::<i64>() {
        return Value::Int(number);
    }
    if let Ok(number) = trimmed.parse::<f64>() {
        return Value::Float(number);
    }
    match trimmed {
        "true" | "TRUE" | "True" => Value::Bool(true),
        "false" | "FALSE" | "False" => Value::Bool(false),
        _ => Value::Text(trimmed.to_string()),
    }
}
