use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Partition key grouping events into independent detector state.
///
/// Rules without a configured `query_key` put every event under the
/// default key `"all"`. Rules with one fall back to `"other"` when the
/// field cannot be resolved on a document.
///
/// # Examples
///
/// ```
/// use spikewatch_common::types::QueryKey;
///
/// assert!(QueryKey::all().is_default());
/// assert!(!QueryKey::other().is_default());
/// assert_eq!(QueryKey::from("web-01").to_string(), "web-01");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(String);

impl QueryKey {
    pub const DEFAULT: &'static str = "all";
    pub const OTHER: &'static str = "other";

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn all() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn other() -> Self {
        Self(Self::OTHER.to_string())
    }

    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for QueryKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// The projection of a document kept inside a window entry.
///
/// Full documents are dropped after extraction; only the timestamp and the
/// partition key needed to report a match survive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStub {
    pub timestamp: DateTime<Utc>,
    pub query_key: Option<QueryKey>,
}

impl EventStub {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            query_key: None,
        }
    }

    pub fn with_key(timestamp: DateTime<Utc>, query_key: QueryKey) -> Self {
        Self {
            timestamp,
            query_key: Some(query_key),
        }
    }
}

/// Window statistics attached to a match, one variant per rule family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchStats {
    Spike {
        spike_count: f64,
        reference_count: f64,
    },
    Percentile {
        current_count: f64,
        reference_count: f64,
    },
    AggregationSpike {
        spike_value: f64,
        reference_value: f64,
    },
    Threshold {
        metric_key: String,
        value: f64,
    },
    Frequency {
        num_hits: f64,
    },
}

impl MatchStats {
    /// Named statistics in the order they are rendered into a match record.
    pub fn fields(&self) -> Vec<(&str, f64)> {
        match self {
            MatchStats::Spike {
                spike_count,
                reference_count,
            } => vec![
                ("spike_count", *spike_count),
                ("reference_count", *reference_count),
            ],
            MatchStats::Percentile {
                current_count,
                reference_count,
            } => vec![
                ("current_count", *current_count),
                ("reference_count", *reference_count),
            ],
            MatchStats::AggregationSpike {
                spike_value,
                reference_value,
            } => vec![
                ("spike_value", *spike_value),
                ("reference_value", *reference_value),
            ],
            MatchStats::Threshold { metric_key, value } => vec![(metric_key.as_str(), *value)],
            MatchStats::Frequency { num_hits } => vec![("num_hits", *num_hits)],
        }
    }
}

/// The partition a match belongs to, with the document field it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchKey {
    pub field: String,
    pub value: QueryKey,
}

/// A finalized match produced by a rule. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub rule_name: String,
    pub timestamp: DateTime<Utc>,
    /// Only present for non-default partition keys.
    pub query_key: Option<MatchKey>,
    pub stats: MatchStats,
}

impl Match {
    /// Render the flat record handed to alert delivery.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{TimeZone, Utc};
    /// use spikewatch_common::types::{Match, MatchStats};
    ///
    /// let m = Match {
    ///     rule_name: "login-spike".into(),
    ///     timestamp: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
    ///     query_key: None,
    ///     stats: MatchStats::Spike { spike_count: 20.0, reference_count: 10.0 },
    /// };
    /// let doc = m.to_document("@timestamp");
    /// assert_eq!(doc["@timestamp"], "2000-01-01T00:00:00Z");
    /// assert_eq!(doc["spike_count"], 20.0);
    /// ```
    pub fn to_document(&self, timestamp_field: &str) -> Value {
        let mut doc = Map::new();
        doc.insert(
            timestamp_field.to_string(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        for (name, value) in self.stats.fields() {
            doc.insert(name.to_string(), Value::from(value));
        }
        if let Some(key) = &self.query_key {
            doc.insert(key.field.clone(), Value::String(key.value.to_string()));
        }
        Value::Object(doc)
    }
}
