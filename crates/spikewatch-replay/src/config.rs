use serde::Deserialize;
use spikewatch_alert::config::RuleConfig;
use spikewatch_common::time::TimeSpan;

/// What each line of the replayed file holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// A raw document, fed through `add_data`.
    #[default]
    Documents,
    /// `{"timestamp": ..., "payload": {...}}`, fed through
    /// `add_aggregation_data`. Needed by `spike_aggregation` and
    /// `metric_aggregation` rules.
    Aggregation,
}

#[derive(Debug, Deserialize)]
pub struct ReplayConfig {
    /// Newline-delimited JSON file, one record per line.
    pub documents: String,
    #[serde(default)]
    pub input: InputFormat,
    /// Garbage-collection tick period in document time. No ticks when unset.
    pub gc_interval: Option<TimeSpan>,
    pub rule: RuleConfig,
}

impl ReplayConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}
