//! Unwrapping of bucketed aggregation results into per-bucket checks.
//!
//! A payload maps each query timestamp to one of three shapes: interval
//! buckets (`interval_aggs`), term buckets (`bucket_aggs`, optionally with
//! interval buckets nested in each term), or a flat metric object.

use crate::error::{ExtractError, Result, RuleError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use spikewatch_common::lookup::parse_timestamp_str;
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationType {
    Min,
    Max,
    Avg,
    Sum,
    Cardinality,
    ValueCount,
}

impl FromStr for AggregationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "avg" => Ok(Self::Avg),
            "sum" => Ok(Self::Sum),
            "cardinality" => Ok(Self::Cardinality),
            "value_count" => Ok(Self::ValueCount),
            _ => Err(format!("unknown aggregation type: {s}")),
        }
    }
}

impl std::fmt::Display for AggregationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::Avg => write!(f, "avg"),
            Self::Sum => write!(f, "sum"),
            Self::Cardinality => write!(f, "cardinality"),
            Self::ValueCount => write!(f, "value_count"),
        }
    }
}

/// Name under which an aggregation result appears in a bucket.
///
/// # Examples
///
/// ```
/// use spikewatch_alert::aggregation::{metric_key, AggregationType};
///
/// assert_eq!(metric_key("cpu_pct", AggregationType::Avg), "cpu_pct_avg");
/// ```
pub fn metric_key(agg_key: &str, agg_type: AggregationType) -> String {
    format!("{agg_key}_{agg_type}")
}

/// Read `<metric_key>.value` from a bucket. `Ok(None)` means the bucket had
/// no data (a `null` value).
pub fn metric_value(bucket: &Value, metric_key: &str) -> std::result::Result<Option<f64>, ExtractError> {
    let metric = bucket
        .get(metric_key)
        .ok_or_else(|| ExtractError::MissingField(metric_key.to_string()))?;
    match metric.get("value") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => Err(ExtractError::NotNumeric {
            field: metric_key.to_string(),
            value: other.to_string(),
        }),
    }
}

/// A rule that consumes aggregation buckets.
pub trait AggregationRule {
    fn rule_name(&self) -> &str;

    /// Evaluate one bucket. `query_key` is the enclosing term bucket key, if any.
    fn check_matches(&mut self, timestamp: DateTime<Utc>, query_key: Option<&Value>, bucket: &Value);
}

pub fn add_aggregation_data<R>(rule: &mut R, payload: &BTreeMap<DateTime<Utc>, Value>) -> Result<()>
where
    R: AggregationRule + ?Sized,
{
    for (timestamp, data) in payload {
        if let Some(interval_aggs) = data.get("interval_aggs") {
            unwrap_interval_buckets(rule, None, interval_aggs)?;
        } else if let Some(bucket_aggs) = data.get("bucket_aggs") {
            unwrap_term_buckets(rule, *timestamp, bucket_aggs)?;
        } else {
            rule.check_matches(*timestamp, None, data);
        }
    }
    Ok(())
}

fn buckets<'a, R>(rule: &R, aggs: &'a Value, kind: &str) -> Result<&'a Vec<Value>>
where
    R: AggregationRule + ?Sized,
{
    aggs.get("buckets")
        .and_then(Value::as_array)
        .ok_or_else(|| RuleError::InvalidPayload {
            rule: rule.rule_name().to_string(),
            reason: format!("{kind} without a buckets array"),
        })
}

fn unwrap_interval_buckets<R>(rule: &mut R, query_key: Option<&Value>, interval_aggs: &Value) -> Result<()>
where
    R: AggregationRule + ?Sized,
{
    for bucket in buckets(rule, interval_aggs, "interval_aggs")? {
        // The bucket key is a more precise match timestamp than the query time.
        let Some(ts) = bucket
            .get("key_as_string")
            .and_then(Value::as_str)
            .and_then(parse_timestamp_str)
        else {
            tracing::warn!(rule = %rule.rule_name(), "Skipping interval bucket without a usable key_as_string");
            continue;
        };
        rule.check_matches(ts, query_key, bucket);
    }
    Ok(())
}

fn unwrap_term_buckets<R>(rule: &mut R, timestamp: DateTime<Utc>, bucket_aggs: &Value) -> Result<()>
where
    R: AggregationRule + ?Sized,
{
    for term in buckets(rule, bucket_aggs, "bucket_aggs")? {
        let key = term.get("key");
        match term.get("interval_aggs") {
            Some(interval_aggs) => unwrap_interval_buckets(rule, key, interval_aggs)?,
            None => rule.check_matches(timestamp, key, term),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<(DateTime<Utc>, Option<Value>, Value)>,
    }

    impl AggregationRule for Recorder {
        fn rule_name(&self) -> &str {
            "recorder"
        }

        fn check_matches(&mut self, timestamp: DateTime<Utc>, query_key: Option<&Value>, bucket: &Value) {
            self.seen.push((timestamp, query_key.cloned(), bucket.clone()));
        }
    }

    fn query_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2000, 1, 1, 1, 0, 0).unwrap()
    }

    #[test]
    fn flat_payload_uses_query_timestamp() {
        let mut rec = Recorder::default();
        let payload = BTreeMap::from([(query_ts(), json!({"cpu_avg": {"value": 0.5}}))]);
        add_aggregation_data(&mut rec, &payload).unwrap();
        assert_eq!(rec.seen.len(), 1);
        assert_eq!(rec.seen[0].0, query_ts());
        assert_eq!(rec.seen[0].1, None);
    }

    #[test]
    fn term_buckets_with_nested_intervals_unwrap_twice() {
        let mut rec = Recorder::default();
        let payload = BTreeMap::from([(
            query_ts(),
            json!({"bucket_aggs": {"buckets": [
                {"key": "web-01", "interval_aggs": {"buckets": [
                    {"key_as_string": "2000-01-01T00:00:00Z", "cpu_avg": {"value": 1.0}},
                    {"key_as_string": "2000-01-01T00:01:00Z", "cpu_avg": {"value": 2.0}}
                ]}},
                {"key": "web-02", "cpu_avg": {"value": 3.0}}
            ]}}),
        )]);
        add_aggregation_data(&mut rec, &payload).unwrap();

        assert_eq!(rec.seen.len(), 3);
        assert_eq!(rec.seen[0].0, Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(rec.seen[0].1, Some(json!("web-01")));
        assert_eq!(rec.seen[1].0, Utc.with_ymd_and_hms(2000, 1, 1, 0, 1, 0).unwrap());
        assert_eq!(rec.seen[2].0, query_ts());
        assert_eq!(rec.seen[2].1, Some(json!("web-02")));
    }

    #[test]
    fn interval_buckets_without_key_are_skipped() {
        let mut rec = Recorder::default();
        let payload = BTreeMap::from([(
            query_ts(),
            json!({"interval_aggs": {"buckets": [
                {"cpu_avg": {"value": 1.0}},
                {"key_as_string": "2000-01-01T00:00:30Z", "cpu_avg": {"value": 1.0}}
            ]}}),
        )]);
        add_aggregation_data(&mut rec, &payload).unwrap();
        assert_eq!(rec.seen.len(), 1);
    }

    #[test]
    fn missing_buckets_array_is_an_error() {
        let mut rec = Recorder::default();
        let payload = BTreeMap::from([(query_ts(), json!({"interval_aggs": {}}))]);
        assert!(matches!(
            add_aggregation_data(&mut rec, &payload),
            Err(RuleError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn metric_value_distinguishes_null_from_missing() {
        assert_eq!(metric_value(&json!({"m": {"value": 2}}), "m"), Ok(Some(2.0)));
        assert_eq!(metric_value(&json!({"m": {"value": null}}), "m"), Ok(None));
        assert!(metric_value(&json!({}), "m").is_err());
        assert!(metric_value(&json!({"m": {"value": "x"}}), "m").is_err());
    }
}
