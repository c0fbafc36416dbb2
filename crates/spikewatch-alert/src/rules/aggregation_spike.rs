use crate::aggregation::{self, metric_value, AggregationRule, AggregationType};
use crate::config::RuleConfig;
use crate::detector::{Mean, SpikeDetector, SpikeMatch};
use crate::error::Result;
use crate::extract::DocumentReader;
use crate::rules::{stats_message, whole};
use crate::RuleType;
use chrono::{DateTime, Utc};
use serde_json::Value;
use spikewatch_common::lookup::hashable;
use spikewatch_common::time::{format_timeframe, pretty_ts};
use spikewatch_common::types::{Match, MatchStats, QueryKey};
use std::collections::BTreeMap;

/// Spike rule over pre-aggregated metric values.
///
/// Each bucket's metric value is one window entry; windows are compared by
/// their mean value. Term bucket keys become partition keys.
pub struct SpikeAggregationRule {
    reader: DocumentReader,
    agg_key: String,
    agg_type: AggregationType,
    metric_key: String,
    detector: SpikeDetector<Mean>,
    use_local_time: bool,
    matches: Vec<Match>,
}

impl SpikeAggregationRule {
    pub fn new(config: &RuleConfig) -> Result<Self> {
        let settings = config.spike_settings()?;
        let (agg_key, agg_type, metric_key) = config.aggregation()?;
        Ok(Self {
            reader: DocumentReader::new(&config.name, &config.timestamp_field, config.query_key.as_deref()),
            agg_key,
            agg_type,
            metric_key,
            detector: SpikeDetector::new(settings, Mean),
            use_local_time: config.use_local_time,
            matches: Vec::new(),
        })
    }

    pub fn metric_key(&self) -> &str {
        &self.metric_key
    }

    pub fn detector(&self) -> &SpikeDetector<Mean> {
        &self.detector
    }

    fn add_match(&mut self, m: SpikeMatch) {
        self.matches.push(Match {
            rule_name: self.reader.rule_name().to_string(),
            timestamp: m.event.timestamp,
            query_key: self.reader.match_key(&m.query_key),
            stats: m.stats,
        });
    }
}

impl AggregationRule for SpikeAggregationRule {
    fn rule_name(&self) -> &str {
        self.reader.rule_name()
    }

    fn check_matches(&mut self, timestamp: DateTime<Utc>, query_key: Option<&Value>, bucket: &Value) {
        let value = match metric_value(bucket, &self.metric_key) {
            Ok(Some(value)) => value,
            Ok(None) => {
                tracing::debug!(rule = %self.reader.rule_name(), %timestamp, "Bucket without data");
                return;
            }
            Err(e) => {
                tracing::warn!(rule = %self.reader.rule_name(), %timestamp, error = %e, "Skipping bucket");
                return;
            }
        };

        let key = query_key.map_or_else(QueryKey::all, hashable);
        let event = self.reader.stub(timestamp, &key);
        if let Some(m) = self.detector.handle_event(event, value, &key) {
            self.add_match(m);
        }
    }
}

impl RuleType for SpikeAggregationRule {
    fn name(&self) -> &str {
        self.reader.rule_name()
    }

    fn timestamp_field(&self) -> &str {
        self.reader.timestamp_field()
    }

    fn add_aggregation_data(&mut self, payload: &BTreeMap<DateTime<Utc>, Value>) -> Result<()> {
        aggregation::add_aggregation_data(self, payload)
    }

    fn garbage_collect(&mut self, ts: DateTime<Utc>) {
        for m in self.detector.garbage_collect(ts) {
            self.add_match(m);
        }
    }

    fn matches(&self) -> &[Match] {
        &self.matches
    }

    fn drain_matches(&mut self) -> Vec<Match> {
        std::mem::take(&mut self.matches)
    }

    fn get_match_str(&self, m: &Match) -> String {
        let (current, reference) = match &m.stats {
            MatchStats::AggregationSpike {
                spike_value,
                reference_value,
            } => (*spike_value, *reference_value),
            _ => return stats_message(m, self.use_local_time),
        };
        format!(
            "An abnormal value of {} occurred around {} for {}:{}.\n\
             Preceding that time, there were only {} events within {}\n\n",
            whole(current),
            pretty_ts(m.timestamp, self.use_local_time),
            self.agg_type,
            self.agg_key,
            whole(reference),
            format_timeframe(self.detector.settings().timeframe),
        )
    }
}
