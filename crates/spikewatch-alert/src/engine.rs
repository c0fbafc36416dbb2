use crate::error::RuleError;
use crate::{RuleType, TermsBucket};
use chrono::{DateTime, Utc};
use serde_json::Value;
use spikewatch_common::types::Match;
use std::collections::BTreeMap;

/// A match ready for delivery: the rule it came from, its summary text and
/// the flat record rendered under the rule's timestamp field.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub rule_name: String,
    pub message: String,
    pub record: Value,
    pub matched: Match,
}

/// Receives finalized alerts for downstream delivery.
pub trait MatchSink {
    fn deliver(&mut self, alert: Alert);
}

/// Collects alerts in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub alerts: Vec<Alert>,
}

impl MatchSink for VecSink {
    fn deliver(&mut self, alert: Alert) {
        self.alerts.push(alert);
    }
}

pub struct AlertEngine {
    rules: Vec<Box<dyn RuleType>>,
}

impl AlertEngine {
    pub fn new(rules: Vec<Box<dyn RuleType>>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Box<dyn RuleType>] {
        &self.rules
    }

    /// Get a rule by its name.
    pub fn get_rule(&self, name: &str) -> Option<&dyn RuleType> {
        self.rules.iter().find(|r| r.name() == name).map(|r| r.as_ref())
    }

    /// Add a new rule at runtime.
    pub fn add_rule(&mut self, rule: Box<dyn RuleType>) {
        self.rules.push(rule);
    }

    /// Remove a rule by name. Returns true if found and removed.
    pub fn remove_rule(&mut self, name: &str) -> bool {
        let len_before = self.rules.len();
        self.rules.retain(|r| r.name() != name);
        self.rules.len() < len_before
    }

    /// Replace all rules with a new set. State of the old rules is dropped.
    pub fn replace_rules(&mut self, rules: Vec<Box<dyn RuleType>>) {
        self.rules = rules;
    }

    /// Feed raw documents to every rule.
    pub fn ingest(&mut self, documents: &[Value]) {
        for rule in &mut self.rules {
            let result = rule.add_data(documents);
            report(&**rule, result);
        }
    }

    pub fn ingest_counts(&mut self, counts: &BTreeMap<DateTime<Utc>, u64>) {
        for rule in &mut self.rules {
            let result = rule.add_count_data(counts);
            report(&**rule, result);
        }
    }

    pub fn ingest_terms(&mut self, terms: &BTreeMap<DateTime<Utc>, Vec<TermsBucket>>) {
        for rule in &mut self.rules {
            let result = rule.add_terms_data(terms);
            report(&**rule, result);
        }
    }

    pub fn ingest_aggregation(&mut self, payload: &BTreeMap<DateTime<Utc>, Value>) {
        for rule in &mut self.rules {
            let result = rule.add_aggregation_data(payload);
            report(&**rule, result);
        }
    }

    /// Forward a garbage-collection tick to every rule.
    pub fn tick(&mut self, ts: DateTime<Utc>) {
        tracing::debug!(%ts, rule_count = self.rules.len(), "Garbage collection tick");
        for rule in &mut self.rules {
            rule.garbage_collect(ts);
        }
    }

    /// Drain every rule's matches into `sink`, rule by rule, oldest first.
    /// Returns the number of alerts delivered.
    pub fn flush(&mut self, sink: &mut dyn MatchSink) -> usize {
        let mut delivered = 0;
        for rule in &mut self.rules {
            for matched in rule.drain_matches() {
                let alert = Alert {
                    rule_name: rule.name().to_string(),
                    message: rule.get_match_str(&matched),
                    record: matched.to_document(rule.timestamp_field()),
                    matched,
                };
                sink.deliver(alert);
                delivered += 1;
            }
        }
        delivered
    }
}

fn report(rule: &dyn RuleType, result: crate::error::Result<()>) {
    match result {
        Ok(()) => {}
        Err(RuleError::Unsupported { operation, .. }) => {
            tracing::debug!(rule = %rule.name(), operation, "Entry point not supported by rule");
        }
        Err(e) => {
            tracing::warn!(rule = %rule.name(), error = %e, "Rule rejected input");
        }
    }
}
