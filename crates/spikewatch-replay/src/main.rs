mod config;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use config::InputFormat;
use serde::Deserialize;
use serde_json::Value;
use spikewatch_alert::builder::build_rule;
use spikewatch_alert::engine::{Alert, AlertEngine, MatchSink};
use spikewatch_alert::RuleType;
use spikewatch_common::lookup::{lookup_field, parse_timestamp};
use std::collections::BTreeMap;
use tracing_subscriber::EnvFilter;

/// Prints each alert as its JSON record followed by the match summary.
struct StdoutSink;

impl MatchSink for StdoutSink {
    fn deliver(&mut self, alert: Alert) {
        println!("{}", alert.record);
        print!("{}", alert.message);
    }
}

/// Garbage-collection ticks laid out on a fixed period of document time.
struct GcSchedule {
    interval: Duration,
    next: Option<DateTime<Utc>>,
}

impl GcSchedule {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: None,
        }
    }

    /// Ticks that fall due at or before `ts`, oldest first.
    fn due(&mut self, ts: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut ticks = Vec::new();
        let Some(mut next) = self.next.or_else(|| ts.checked_add_signed(self.interval)) else {
            return ticks;
        };
        while next <= ts {
            ticks.push(next);
            next = match next.checked_add_signed(self.interval) {
                Some(following) => following,
                None => DateTime::<Utc>::MAX_UTC,
            };
        }
        self.next = Some(next);
        ticks
    }
}

/// One replayed input line.
#[derive(Debug, Clone, PartialEq)]
enum Record {
    Document(Value),
    Aggregation(BTreeMap<DateTime<Utc>, Value>),
}

/// Line shape of `input = "aggregation"` files.
#[derive(Debug, Deserialize)]
struct AggregationLine {
    timestamp: DateTime<Utc>,
    payload: Value,
}

impl Record {
    fn parse(line: &str, input: InputFormat, timestamp_field: &str) -> Result<(Option<DateTime<Utc>>, Self)> {
        match input {
            InputFormat::Documents => {
                let doc: Value = serde_json::from_str(line)?;
                let ts = lookup_field(&doc, timestamp_field).and_then(parse_timestamp);
                Ok((ts, Record::Document(doc)))
            }
            InputFormat::Aggregation => {
                let line: AggregationLine = serde_json::from_str(line)?;
                let payload = BTreeMap::from([(line.timestamp, line.payload)]);
                Ok((Some(line.timestamp), Record::Aggregation(payload)))
            }
        }
    }
}

fn read_records(
    path: &str,
    input: InputFormat,
    timestamp_field: &str,
) -> Result<Vec<(Option<DateTime<Utc>>, Record)>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match Record::parse(line, input, timestamp_field) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(line = index + 1, error = %e, "Skipping malformed line");
            }
        }
    }
    // Stable: records sharing a timestamp keep file order.
    records.sort_by_key(|(ts, _)| *ts);
    Ok(records)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("spikewatch=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/replay.toml".to_string());

    let config = config::ReplayConfig::load(&config_path)
        .with_context(|| format!("loading {config_path}"))?;
    let rule = build_rule(&config.rule)?;
    tracing::info!(
        rule = %rule.name(),
        rule_type = %config.rule.rule_type,
        documents = %config.documents,
        input = ?config.input,
        "spikewatch-replay starting"
    );

    let records = read_records(&config.documents, config.input, rule.timestamp_field())?;
    let mut engine = AlertEngine::new(vec![rule]);
    let mut schedule = match config.gc_interval.filter(|span| !span.is_zero()) {
        Some(span) => Some(GcSchedule::new(
            span.to_duration().context("gc_interval out of range")?,
        )),
        None => None,
    };
    let mut sink = StdoutSink;
    let mut alerts = 0;

    for (ts, record) in &records {
        if let (Some(schedule), Some(ts)) = (schedule.as_mut(), ts) {
            for tick in schedule.due(*ts) {
                engine.tick(tick);
            }
        }
        match record {
            Record::Document(doc) => engine.ingest(std::slice::from_ref(doc)),
            Record::Aggregation(payload) => engine.ingest_aggregation(payload),
        }
        alerts += engine.flush(&mut sink);
    }

    tracing::info!(records = records.len(), alerts, "Replay finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn gc_schedule_catches_up_on_gaps() {
        let base = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let mut schedule = GcSchedule::new(Duration::seconds(60));

        assert!(schedule.due(base).is_empty());
        assert!(schedule.due(base + Duration::seconds(59)).is_empty());
        assert_eq!(schedule.due(base + Duration::seconds(60)), vec![base + Duration::seconds(60)]);
        assert_eq!(
            schedule.due(base + Duration::seconds(200)),
            vec![base + Duration::seconds(120), base + Duration::seconds(180)]
        );
    }

    #[test]
    fn gc_schedule_stops_at_the_end_of_time() {
        let mut schedule = GcSchedule::new(Duration::days(365));
        let end = DateTime::<Utc>::MAX_UTC;

        assert!(schedule.due(end).is_empty());
        assert!(schedule.due(end).is_empty());
    }

    #[test]
    fn aggregation_lines_become_payloads() {
        let line = r#"{"timestamp": "2000-01-01T00:05:00Z", "payload": {"cpu_avg": {"value": 0.9}}}"#;
        let (ts, record) = Record::parse(line, InputFormat::Aggregation, "@timestamp").unwrap();

        let expected_ts = Utc.with_ymd_and_hms(2000, 1, 1, 0, 5, 0).unwrap();
        assert_eq!(ts, Some(expected_ts));
        assert_eq!(
            record,
            Record::Aggregation(BTreeMap::from([(expected_ts, json!({"cpu_avg": {"value": 0.9}}))]))
        );
        assert!(Record::parse(r#"{"payload": {}}"#, InputFormat::Aggregation, "@timestamp").is_err());
    }

    #[test]
    fn document_lines_keep_their_timestamp() {
        let (ts, record) =
            Record::parse(r#"{"ts": 946684800000, "user": "alice"}"#, InputFormat::Documents, "ts").unwrap();
        assert_eq!(ts, Some(Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()));
        assert!(matches!(record, Record::Document(_)));
    }
}
