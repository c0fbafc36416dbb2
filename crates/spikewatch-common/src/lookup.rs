//! Field access on loosely-typed JSON documents.

use crate::types::QueryKey;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Look up `key` in a document, following dotted paths into nested objects.
///
/// A literal key containing dots wins over the nested path. `null` is
/// reported as absent.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use spikewatch_common::lookup::lookup_field;
///
/// let doc = json!({"host": {"name": "web-01"}, "a.b": 1});
/// assert_eq!(lookup_field(&doc, "host.name"), Some(&json!("web-01")));
/// assert_eq!(lookup_field(&doc, "a.b"), Some(&json!(1)));
/// assert_eq!(lookup_field(&doc, "host.ip"), None);
/// ```
pub fn lookup_field<'a>(document: &'a Value, key: &str) -> Option<&'a Value> {
    let found = match document.get(key) {
        Some(value) => Some(value),
        None => {
            let mut current = document;
            for part in key.split('.') {
                current = current.get(part)?;
            }
            Some(current)
        }
    };
    found.filter(|v| !v.is_null())
}

/// Convert a field value into a partition key.
pub fn hashable(value: &Value) -> QueryKey {
    match value {
        Value::String(s) => QueryKey::new(s.as_str()),
        other => QueryKey::new(other.to_string()),
    }
}

/// Parse a document timestamp.
///
/// Accepts RFC 3339 strings, zone-less ISO 8601 strings (read as UTC) and
/// integer epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

pub fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_fields_are_absent() {
        let doc = json!({"qk": null});
        assert_eq!(lookup_field(&doc, "qk"), None);
    }

    #[test]
    fn hashable_renders_non_strings_as_json() {
        assert_eq!(hashable(&json!("a")).as_str(), "a");
        assert_eq!(hashable(&json!(42)).as_str(), "42");
        assert_eq!(hashable(&json!(["a", 1])).as_str(), r#"["a",1]"#);
    }

    #[test]
    fn parses_supported_timestamp_shapes() {
        let expected = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 5).unwrap();
        assert_eq!(parse_timestamp(&json!("2000-01-01T00:00:05Z")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2000-01-01T00:00:05")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2000-01-01 00:00:05")), Some(expected));
        assert_eq!(
            parse_timestamp(&json!(expected.timestamp_millis())),
            Some(expected)
        );
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(true)), None);
    }
}
