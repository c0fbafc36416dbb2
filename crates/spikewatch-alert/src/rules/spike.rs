use crate::config::RuleConfig;
use crate::detector::{Count, Measure, Percentile, SpikeDetector, SpikeMatch};
use crate::error::Result;
use crate::extract::{DocumentReader, EventCount, IntegerField, NumericField, ValueExtractor};
use crate::rules::{stats_message, whole};
use crate::{single_count, RuleType, TermsBucket};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use spikewatch_common::lookup::hashable;
use spikewatch_common::time::{format_timeframe, pretty_ts};
use spikewatch_common::types::{EventStub, Match, MatchStats, QueryKey};
use std::collections::BTreeMap;

/// Spike rule over the configured percentile of a numeric field.
pub type PercentileSpikeRule = SpikeRule<Percentile>;

/// Compares event volume (or another window statistic) between the most
/// recent timeframe and the one before it.
///
/// The detector variant is chosen by the [`Measure`]; how much each document
/// weighs is chosen by the [`ValueExtractor`].
pub struct SpikeRule<M: Measure = Count> {
    reader: DocumentReader,
    extractor: Box<dyn ValueExtractor>,
    detector: SpikeDetector<M>,
    use_local_time: bool,
    matches: Vec<Match>,
}

impl SpikeRule<Count> {
    /// Every document counts once.
    pub fn new(config: &RuleConfig) -> Result<Self> {
        Self::with_extractor(config, Count, Box::new(EventCount))
    }

    /// Every document counts as many times as its `target_field` says.
    pub fn sum_of_field(config: &RuleConfig) -> Result<Self> {
        let extractor = IntegerField::new(config.target_field()?);
        Self::with_extractor(config, Count, Box::new(extractor))
    }
}

impl SpikeRule<Percentile> {
    /// Windows summarized by the `percentile_value` percentile of `target_field`.
    pub fn percentile(config: &RuleConfig) -> Result<Self> {
        let measure = Percentile {
            percentile: config.percentile()?,
        };
        let extractor = NumericField::new(config.target_field()?);
        Self::with_extractor(config, measure, Box::new(extractor))
    }
}

impl<M: Measure> SpikeRule<M> {
    pub fn with_extractor(config: &RuleConfig, measure: M, extractor: Box<dyn ValueExtractor>) -> Result<Self> {
        let settings = config.spike_settings()?;
        Ok(Self {
            reader: DocumentReader::new(&config.name, &config.timestamp_field, config.query_key.as_deref()),
            extractor,
            detector: SpikeDetector::new(settings, measure),
            use_local_time: config.use_local_time,
            matches: Vec::new(),
        })
    }

    pub fn detector(&self) -> &SpikeDetector<M> {
        &self.detector
    }

    pub fn handle_event(&mut self, event: EventStub, value: f64, key: &QueryKey) {
        if let Some(m) = self.detector.handle_event(event, value, key) {
            self.add_match(m);
        }
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

impl<M> RuleType for SpikeRule<M>
where
    M: Measure + Send,
    M::Window: Send,
{
    fn name(&self) -> &str {
        self.reader.rule_name()
    }

    fn timestamp_field(&self) -> &str {
        self.reader.timestamp_field()
    }

    fn add_data(&mut self, documents: &[Value]) -> Result<()> {
        for document in documents {
            if let Some((event, key, value)) = self.reader.read(document, self.extractor.as_ref()) {
                self.handle_event(event, value, &key);
            }
        }
        Ok(())
    }

    fn add_count_data(&mut self, counts: &BTreeMap<DateTime<Utc>, u64>) -> Result<()> {
        if let Some((ts, count)) = single_count(counts)? {
            self.handle_event(EventStub::new(ts), count as f64, &QueryKey::all());
        }
        Ok(())
    }

    fn add_terms_data(&mut self, terms: &BTreeMap<DateTime<Utc>, Vec<TermsBucket>>) -> Result<()> {
        for (ts, buckets) in terms {
            for bucket in buckets {
                let key = hashable(&bucket.key);
                let event = self.reader.stub(*ts, &key);
                self.handle_event(event, bucket.doc_count as f64, &key);
            }
        }
        Ok(())
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
        spike_message(m, self.detector.settings().timeframe, self.use_local_time)
    }
}

fn spike_message(m: &Match, timeframe: Duration, use_local_time: bool) -> String {
    let (current, reference) = match &m.stats {
        MatchStats::Spike {
            spike_count,
            reference_count,
        } => (*spike_count, *reference_count),
        MatchStats::Percentile {
            current_count,
            reference_count,
        } => (*current_count, *reference_count),
        _ => return stats_message(m, use_local_time),
    };

    format!(
        "An abnormal number ({}) of events occurred around {}.\n\
         Preceding that time, there were only {} events within {}\n\n",
        whole(current),
        pretty_ts(m.timestamp, use_local_time),
        whole(reference),
        format_timeframe(timeframe),
    )
}
