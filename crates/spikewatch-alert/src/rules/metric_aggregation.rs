use crate::aggregation::{self, metric_value, AggregationRule, AggregationType};
use crate::config::RuleConfig;
use crate::error::{Result, RuleError};
use crate::rules::bound;
use crate::RuleType;
use chrono::{DateTime, Utc};
use serde_json::Value;
use spikewatch_common::lookup::hashable;
use spikewatch_common::types::{Match, MatchKey, MatchStats};
use std::collections::BTreeMap;

/// Matches every aggregated metric value outside `[min_threshold, max_threshold]`.
///
/// No windows, warm-up or cooldown: each crossing bucket is its own match.
pub struct MetricAggregationRule {
    name: String,
    timestamp_field: String,
    query_key: Option<String>,
    agg_key: String,
    agg_type: AggregationType,
    metric_key: String,
    min_threshold: Option<f64>,
    max_threshold: Option<f64>,
    matches: Vec<Match>,
}

impl MetricAggregationRule {
    pub fn new(config: &RuleConfig) -> Result<Self> {
        if config.min_threshold.is_none() && config.max_threshold.is_none() {
            return Err(RuleError::MissingThreshold {
                rule: config.name.clone(),
            });
        }
        let (agg_key, agg_type, metric_key) = config.aggregation()?;
        Ok(Self {
            name: config.name.clone(),
            timestamp_field: config.timestamp_field.clone(),
            query_key: config.query_key.clone(),
            agg_key,
            agg_type,
            metric_key,
            min_threshold: config.min_threshold,
            max_threshold: config.max_threshold,
            matches: Vec::new(),
        })
    }

    pub fn metric_key(&self) -> &str {
        &self.metric_key
    }

    /// A missing value is never a crossing.
    pub fn crossed_thresholds(&self, value: Option<f64>) -> bool {
        let Some(value) = value else {
            return false;
        };
        self.max_threshold.is_some_and(|max| value > max)
            || self.min_threshold.is_some_and(|min| value < min)
    }
}

impl AggregationRule for MetricAggregationRule {
    fn rule_name(&self) -> &str {
        &self.name
    }

    fn check_matches(&mut self, timestamp: DateTime<Utc>, query_key: Option<&Value>, bucket: &Value) {
        let value = match metric_value(bucket, &self.metric_key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(rule = %self.name, %timestamp, error = %e, "Skipping bucket");
                return;
            }
        };
        if !self.crossed_thresholds(value) {
            return;
        }
        let Some(value) = value else {
            return;
        };

        let query_key = match (&self.query_key, query_key) {
            (Some(field), Some(key)) => Some(MatchKey {
                field: field.clone(),
                value: hashable(key),
            }),
            _ => None,
        };
        tracing::info!(rule = %self.name, %timestamp, value, "Threshold crossed");
        self.matches.push(Match {
            rule_name: self.name.clone(),
            timestamp,
            query_key,
            stats: MatchStats::Threshold {
                metric_key: self.metric_key.clone(),
                value,
            },
        });
    }
}

impl RuleType for MetricAggregationRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn timestamp_field(&self) -> &str {
        &self.timestamp_field
    }

    fn add_aggregation_data(&mut self, payload: &BTreeMap<DateTime<Utc>, Value>) -> Result<()> {
        aggregation::add_aggregation_data(self, payload)
    }

    fn matches(&self) -> &[Match] {
        &self.matches
    }

    fn drain_matches(&mut self) -> Vec<Match> {
        std::mem::take(&mut self.matches)
    }

    fn get_match_str(&self, m: &Match) -> String {
        let value = m
            .stats
            .fields()
            .first()
            .map_or_else(|| "None".to_string(), |(_, v)| v.to_string());
        format!(
            "Threshold violation, {}:{} {} (min: {} max : {}) \n\n",
            self.agg_type,
            self.agg_key,
            value,
            bound(self.min_threshold),
            bound(self.max_threshold),
        )
    }
}
