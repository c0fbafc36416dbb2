//! Turning raw documents into (timestamp, partition key, value) triples.

use crate::error::ExtractError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use spikewatch_common::lookup::{hashable, lookup_field, parse_timestamp};
use spikewatch_common::types::{EventStub, MatchKey, QueryKey};

/// Strategy deciding how much a single document weighs in a window.
pub trait ValueExtractor: Send + Sync {
    fn extract_value(&self, document: &Value) -> Result<f64, ExtractError>;
}

/// Every document is one occurrence.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventCount;

impl ValueExtractor for EventCount {
    fn extract_value(&self, _document: &Value) -> Result<f64, ExtractError> {
        Ok(1.0)
    }
}

/// A document counts as many times as an integer field says.
///
/// Numeric strings are parsed, floats truncated toward zero.
#[derive(Debug, Clone)]
pub struct IntegerField {
    pub field: String,
    pub allow_zero: bool,
}

impl IntegerField {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            allow_zero: false,
        }
    }
}

impl ValueExtractor for IntegerField {
    fn extract_value(&self, document: &Value) -> Result<f64, ExtractError> {
        let raw = lookup_field(document, &self.field)
            .ok_or_else(|| ExtractError::MissingField(self.field.clone()))?;
        let count = match raw {
            Value::String(s) => s.trim().parse::<i64>().map_err(|_| self.not_numeric(raw))?,
            Value::Number(n) => match n.as_i64() {
                Some(i) => i,
                None => n.as_f64().map(|f| f.trunc() as i64).ok_or_else(|| self.not_numeric(raw))?,
            },
            _ => return Err(self.not_numeric(raw)),
        };
        if count < 0 || (count == 0 && !self.allow_zero) {
            return Err(ExtractError::OutOfRange {
                field: self.field.clone(),
                value: count as f64,
            });
        }
        Ok(count as f64)
    }
}

impl IntegerField {
    fn not_numeric(&self, raw: &Value) -> ExtractError {
        ExtractError::NotNumeric {
            field: self.field.clone(),
            value: raw.to_string(),
        }
    }
}

/// The value of a numeric field, used as is.
///
/// Zero and negative values carry no weight and are rejected.
#[derive(Debug, Clone)]
pub struct NumericField {
    pub field: String,
}

impl NumericField {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl ValueExtractor for NumericField {
    fn extract_value(&self, document: &Value) -> Result<f64, ExtractError> {
        let raw = lookup_field(document, &self.field)
            .ok_or_else(|| ExtractError::MissingField(self.field.clone()))?;
        let value = match raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
        .ok_or_else(|| ExtractError::NotNumeric {
            field: self.field.clone(),
            value: raw.to_string(),
        })?;
        if value <= 0.0 {
            return Err(ExtractError::OutOfRange {
                field: self.field.clone(),
                value,
            });
        }
        Ok(value)
    }
}

/// Resolves the timestamp and partition key of documents for one rule.
#[derive(Debug, Clone)]
pub struct DocumentReader {
    rule_name: String,
    timestamp_field: String,
    query_key: Option<String>,
}

impl DocumentReader {
    pub fn new(rule_name: &str, timestamp_field: &str, query_key: Option<&str>) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            timestamp_field: timestamp_field.to_string(),
            query_key: query_key.map(str::to_string),
        }
    }

    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }

    pub fn timestamp_field(&self) -> &str {
        &self.timestamp_field
    }

    pub fn query_key_field(&self) -> Option<&str> {
        self.query_key.as_deref()
    }

    pub fn timestamp(&self, document: &Value) -> Result<DateTime<Utc>, ExtractError> {
        let raw = lookup_field(document, &self.timestamp_field)
            .ok_or_else(|| ExtractError::MissingField(self.timestamp_field.clone()))?;
        parse_timestamp(raw).ok_or_else(|| ExtractError::NotNumeric {
            field: self.timestamp_field.clone(),
            value: raw.to_string(),
        })
    }

    pub fn query_key(&self, document: &Value) -> QueryKey {
        let Some(field) = &self.query_key else {
            return QueryKey::all();
        };
        match lookup_field(document, field) {
            Some(value) => hashable(value),
            None => {
                tracing::warn!(rule = %self.rule_name, field = %field, "Query key not found in document");
                QueryKey::other()
            }
        }
    }

    /// Extract everything a window needs from one document.
    ///
    /// Problems are logged and the document is skipped.
    pub fn read(&self, document: &Value, extractor: &dyn ValueExtractor) -> Option<(EventStub, QueryKey, f64)> {
        let ts = match self.timestamp(document) {
            Ok(ts) => ts,
            Err(e) => {
                tracing::warn!(rule = %self.rule_name, error = %e, "Skipping document without usable timestamp");
                return None;
            }
        };
        let value = match extractor.extract_value(document) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(rule = %self.rule_name, error = %e, "Skipping document");
                return None;
            }
        };
        let key = self.query_key(document);
        Some((self.stub(ts, &key), key, value))
    }

    pub fn stub(&self, ts: DateTime<Utc>, key: &QueryKey) -> EventStub {
        if key.is_default() {
            EventStub::new(ts)
        } else {
            EventStub::with_key(ts, key.clone())
        }
    }

    /// The partition reported on a match, when it is not the default one.
    pub fn match_key(&self, key: &QueryKey) -> Option<MatchKey> {
        if key.is_default() {
            return None;
        }
        self.query_key.as_ref().map(|field| MatchKey {
            field: field.clone(),
            value: key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_field_coerces_strings_and_floats() {
        let extractor = IntegerField::new("count");
        assert_eq!(extractor.extract_value(&json!({"count": "12"})), Ok(12.0));
        assert_eq!(extractor.extract_value(&json!({"count": 3.9})), Ok(3.0));
        assert_eq!(extractor.extract_value(&json!({"count": 7})), Ok(7.0));
    }

    #[test]
    fn integer_field_rejects_bad_values() {
        let extractor = IntegerField::new("count");
        assert_eq!(
            extractor.extract_value(&json!({})),
            Err(ExtractError::MissingField("count".into()))
        );
        assert!(matches!(
            extractor.extract_value(&json!({"count": "many"})),
            Err(ExtractError::NotNumeric { .. })
        ));
        assert!(matches!(
            extractor.extract_value(&json!({"count": [1]})),
            Err(ExtractError::NotNumeric { .. })
        ));
        assert!(matches!(
            extractor.extract_value(&json!({"count": -1})),
            Err(ExtractError::OutOfRange { .. })
        ));
        assert!(matches!(
            extractor.extract_value(&json!({"count": 0})),
            Err(ExtractError::OutOfRange { .. })
        ));

        let zero_ok = IntegerField {
            field: "count".into(),
            allow_zero: true,
        };
        assert_eq!(zero_ok.extract_value(&json!({"count": 0})), Ok(0.0));
    }

    #[test]
    fn numeric_field_keeps_fractions() {
        let extractor = NumericField::new("cpu");
        assert_eq!(extractor.extract_value(&json!({"cpu": 0.5})), Ok(0.5));
        assert_eq!(extractor.extract_value(&json!({"cpu": "10"})), Ok(10.0));
        assert!(extractor.extract_value(&json!({"cpu": 0})).is_err());
    }

    #[test]
    fn reader_resolves_query_keys() {
        let reader = DocumentReader::new("r", "ts", Some("host"));
        assert_eq!(reader.query_key(&json!({"host": "web-01"})).as_str(), "web-01");
        assert_eq!(reader.query_key(&json!({"host": 7})).as_str(), "7");
        assert_eq!(reader.query_key(&json!({})), QueryKey::other());

        let unkeyed = DocumentReader::new("r", "ts", None);
        assert!(unkeyed.query_key(&json!({"host": "web-01"})).is_default());
    }

    #[test]
    fn reader_skips_documents_without_timestamp() {
        let reader = DocumentReader::new("r", "ts", None);
        assert!(reader.read(&json!({"cpu": 1}), &EventCount).is_none());
        let (stub, key, value) = reader
            .read(&json!({"ts": "2000-01-01T00:00:00Z"}), &EventCount)
            .unwrap();
        assert!(key.is_default());
        assert_eq!(stub.query_key, None);
        assert_eq!(value, 1.0);
    }
}
