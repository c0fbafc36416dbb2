//! Alert rule types that detect spikes, dips and threshold breaches in
//! streams of time-stamped documents.
//!
//! Spike rules keep, per partition key, a current window whose evictions
//! feed a reference window, and compare the two once enough history has
//! been seen. Threshold rules check each aggregated metric value on its own.
//! Rules are driven by a host through the [`RuleType`] entry points and
//! hand their matches to a [`engine::MatchSink`].

pub mod aggregation;
pub mod builder;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod extract;
pub mod rules;
pub mod window;


use chrono::{DateTime, Utc};
use error::{Result, RuleError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spikewatch_common::types::Match;
use std::collections::BTreeMap;

/// One term bucket of a terms query: a key and how many documents it saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermsBucket {
    pub key: Value,
    pub doc_count: u64,
}

/// A configured rule as seen by the host framework.
///
/// Hosts deliver data in non-decreasing timestamp order through whichever
/// entry points the rule supports, call [`RuleType::garbage_collect`] on a
/// periodic tick, and drain the produced matches. Entry points a rule does
/// not support return [`RuleError::Unsupported`].
pub trait RuleType: Send {
    /// Rule name from configuration.
    fn name(&self) -> &str;

    /// Document field holding the event timestamp.
    fn timestamp_field(&self) -> &str;

    /// Raw documents.
    fn add_data(&mut self, _documents: &[Value]) -> Result<()> {
        Err(self.unsupported("add_data"))
    }

    /// A single `{timestamp: count}` pair from a count query.
    fn add_count_data(&mut self, _counts: &BTreeMap<DateTime<Utc>, u64>) -> Result<()> {
        Err(self.unsupported("add_count_data"))
    }

    /// Term buckets per query timestamp.
    fn add_terms_data(&mut self, _terms: &BTreeMap<DateTime<Utc>, Vec<TermsBucket>>) -> Result<()> {
        Err(self.unsupported("add_terms_data"))
    }

    /// Aggregation results per query timestamp.
    fn add_aggregation_data(&mut self, _payload: &BTreeMap<DateTime<Utc>, Value>) -> Result<()> {
        Err(self.unsupported("add_aggregation_data"))
    }

    /// Periodic housekeeping at time `ts`.
    fn garbage_collect(&mut self, _ts: DateTime<Utc>) {}

    /// Matches produced so far, oldest first.
    fn matches(&self) -> &[Match];

    fn drain_matches(&mut self) -> Vec<Match>;

    /// Short human-readable description of a match.
    fn get_match_str(&self, m: &Match) -> String;

    fn unsupported(&self, operation: &'static str) -> RuleError {
        RuleError::Unsupported {
            rule: self.name().to_string(),
            operation,
        }
    }
}

/// Reject count payloads carrying more than one timestamp.
pub(crate) fn single_count(counts: &BTreeMap<DateTime<Utc>, u64>) -> Result<Option<(DateTime<Utc>, u64)>> {
    if counts.len() > 1 {
        return Err(RuleError::MultipleCounts(counts.len()));
    }
    Ok(counts.iter().next().map(|(ts, count)| (*ts, *count)))
}
