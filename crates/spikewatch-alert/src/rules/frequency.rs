use crate::config::RuleConfig;
use crate::error::Result;
use crate::extract::{DocumentReader, EventCount, IntegerField, ValueExtractor};
use crate::window::{EventWindow, TimeWindow, WindowEntry};
use crate::{single_count, RuleType, TermsBucket};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use spikewatch_common::lookup::hashable;
use spikewatch_common::time::pretty_ts;
use spikewatch_common::types::{EventStub, Match, MatchStats, QueryKey};
use std::collections::{BTreeMap, HashMap};

/// Matches when at least `num_events` occurrences fall within one timeframe.
pub struct FrequencyRule {
    reader: DocumentReader,
    extractor: Box<dyn ValueExtractor>,
    timeframe: Duration,
    num_events: u64,
    occurrences: HashMap<QueryKey, TimeWindow>,
    use_local_time: bool,
    matches: Vec<Match>,
}

impl FrequencyRule {
    pub fn new(config: &RuleConfig) -> Result<Self> {
        Self::with_extractor(config, Box::new(EventCount))
    }

    /// Occurrences are read from the integer `target_field` of each document.
    pub fn sum_of_field(config: &RuleConfig) -> Result<Self> {
        let extractor = IntegerField::new(config.target_field()?);
        Self::with_extractor(config, Box::new(extractor))
    }

    pub fn with_extractor(config: &RuleConfig, extractor: Box<dyn ValueExtractor>) -> Result<Self> {
        Ok(Self {
            reader: DocumentReader::new(&config.name, &config.timestamp_field, config.query_key.as_deref()),
            extractor,
            timeframe: config.timeframe()?,
            num_events: config.num_events()?,
            occurrences: HashMap::new(),
            use_local_time: config.use_local_time,
            matches: Vec::new(),
        })
    }

    pub fn tracked_keys(&self) -> usize {
        self.occurrences.len()
    }

    fn handle_event(&mut self, event: EventStub, value: f64, key: QueryKey) {
        let window = self
            .occurrences
            .entry(key.clone())
            .or_insert_with(|| TimeWindow::new(self.timeframe));
        window.append(WindowEntry::new(event, value));

        if window.total() < self.num_events as f64 {
            return;
        }
        let hits = window.total();
        let Some(newest) = window.newest().map(|e| e.event.timestamp) else {
            return;
        };
        self.occurrences.remove(&key);

        tracing::info!(rule = %self.reader.rule_name(), query_key = %key, hits, "Frequency threshold reached");
        self.matches.push(Match {
            rule_name: self.reader.rule_name().to_string(),
            timestamp: newest,
            query_key: self.reader.match_key(&key),
            stats: MatchStats::Frequency { num_hits: hits },
        });
    }
}

impl RuleType for FrequencyRule {
    fn name(&self) -> &str {
        self.reader.rule_name()
    }

    fn timestamp_field(&self) -> &str {
        self.reader.timestamp_field()
    }

    fn add_data(&mut self, documents: &[Value]) -> Result<()> {
        for document in documents {
            if let Some((event, key, value)) = self.reader.read(document, self.extractor.as_ref()) {
                self.handle_event(event, value, key);
            }
        }
        Ok(())
    }

    fn add_count_data(&mut self, counts: &BTreeMap<DateTime<Utc>, u64>) -> Result<()> {
        if let Some((ts, count)) = single_count(counts)? {
            self.handle_event(EventStub::new(ts), count as f64, QueryKey::all());
        }
        Ok(())
    }

    fn add_terms_data(&mut self, terms: &BTreeMap<DateTime<Utc>, Vec<TermsBucket>>) -> Result<()> {
        for (ts, buckets) in terms {
            for bucket in buckets {
                let key = hashable(&bucket.key);
                let event = self.reader.stub(*ts, &key);
                self.handle_event(event, bucket.doc_count as f64, key);
            }
        }
        Ok(())
    }

    /// Forget keys whose newest occurrence is more than a timeframe old.
    fn garbage_collect(&mut self, ts: DateTime<Utc>) {
        let timeframe = self.timeframe;
        self.occurrences.retain(|_, window| {
            window
                .newest()
                .is_some_and(|e| ts - e.timestamp() <= timeframe)
        });
    }

    fn matches(&self) -> &[Match] {
        &self.matches
    }

    fn drain_matches(&mut self) -> Vec<Match> {
        std::mem::take(&mut self.matches)
    }

    fn get_match_str(&self, m: &Match) -> String {
        let start = m
            .timestamp
            .checked_sub_signed(self.timeframe)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        format!(
            "At least {} events occurred between {} and {}\n\n",
            self.num_events,
            pretty_ts(start, self.use_local_time),
            pretty_ts(m.timestamp, self.use_local_time),
        )
    }
}
