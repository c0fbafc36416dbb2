use crate::aggregation::{metric_key, AggregationType};
use crate::detector::{SpikeSettings, SpikeType};
use crate::error::{Result, RuleError};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use spikewatch_common::time::TimeSpan;
use std::str::FromStr;

/// Upper bound on `timeframe`; warm-up and cooldown span twice this.
pub const MAX_TIMEFRAME_DAYS: i64 = 36_500;

/// Rule type names accepted in the `type` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Spike,
    SumOfFieldSpike,
    PercentileSpike,
    SpikeAggregation,
    MetricAggregation,
    Frequency,
    SumOfFieldFrequency,
}

impl FromStr for RuleKind {
    type Err = RuleError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "spike" => Ok(Self::Spike),
            "sum_of_field_spike" => Ok(Self::SumOfFieldSpike),
            "percentile_spike" => Ok(Self::PercentileSpike),
            "spike_aggregation" => Ok(Self::SpikeAggregation),
            "metric_aggregation" => Ok(Self::MetricAggregation),
            "frequency" => Ok(Self::Frequency),
            "sum_of_field_frequency" => Ok(Self::SumOfFieldFrequency),
            other => Err(RuleError::UnknownRuleType(other.to_string())),
        }
    }
}

/// Options of one configured rule, as loaded by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub timeframe: Option<TimeSpan>,
    pub spike_height: Option<f64>,
    pub spike_type: Option<String>,
    /// Minimum current-window statistic before a spike can match.
    #[serde(default)]
    pub threshold_cur: f64,
    /// Minimum reference-window statistic before a spike can match.
    #[serde(default)]
    pub threshold_ref: f64,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    pub query_key: Option<String>,
    #[serde(default)]
    pub alert_on_new_data: bool,
    #[serde(default)]
    pub use_local_time: bool,
    pub target_field: Option<String>,
    pub percentile_value: Option<f64>,
    pub metric_agg_key: Option<String>,
    pub metric_agg_type: Option<String>,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
    pub num_events: Option<u64>,
    pub bucket_interval: Option<TimeSpan>,
    pub buffer_time: Option<TimeSpan>,
    pub run_every: Option<TimeSpan>,
    #[serde(default)]
    pub use_run_every_query_size: bool,
}

fn default_timestamp_field() -> String {
    "@timestamp".to_string()
}

impl RuleConfig {
    /// Minimal config with only a name and type; everything else defaulted.
    pub fn new(name: impl Into<String>, rule_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rule_type: rule_type.into(),
            timeframe: None,
            spike_height: None,
            spike_type: None,
            threshold_cur: 0.0,
            threshold_ref: 0.0,
            timestamp_field: default_timestamp_field(),
            query_key: None,
            alert_on_new_data: false,
            use_local_time: false,
            target_field: None,
            percentile_value: None,
            metric_agg_key: None,
            metric_agg_type: None,
            min_threshold: None,
            max_threshold: None,
            num_events: None,
            bucket_interval: None,
            buffer_time: None,
            run_every: None,
            use_run_every_query_size: false,
        }
    }

    pub fn kind(&self) -> Result<RuleKind> {
        self.rule_type.parse()
    }

    /// Check every option the configured rule type needs.
    pub fn validate(&self) -> Result<RuleKind> {
        let kind = self.kind()?;
        match kind {
            RuleKind::Spike => {
                self.spike_settings()?;
            }
            RuleKind::SumOfFieldSpike => {
                self.spike_settings()?;
                self.target_field()?;
            }
            RuleKind::PercentileSpike => {
                self.spike_settings()?;
                self.target_field()?;
                self.percentile()?;
            }
            RuleKind::SpikeAggregation => {
                self.spike_settings()?;
                self.aggregation()?;
                self.check_bucket_interval()?;
            }
            RuleKind::MetricAggregation => {
                self.aggregation()?;
                if self.min_threshold.is_none() && self.max_threshold.is_none() {
                    return Err(RuleError::MissingThreshold {
                        rule: self.name.clone(),
                    });
                }
                self.check_bucket_interval()?;
            }
            RuleKind::Frequency => {
                self.timeframe()?;
                self.num_events()?;
            }
            RuleKind::SumOfFieldFrequency => {
                self.timeframe()?;
                self.num_events()?;
                self.target_field()?;
            }
        }
        Ok(kind)
    }

    pub fn timeframe(&self) -> Result<Duration> {
        let span = self.timeframe.ok_or_else(|| self.missing("timeframe"))?;
        let timeframe = self.duration("timeframe", span)?;
        if timeframe <= Duration::zero() {
            return Err(self.invalid("timeframe", "must be longer than zero".to_string()));
        }
        if timeframe > Duration::days(MAX_TIMEFRAME_DAYS) {
            return Err(self.invalid(
                "timeframe",
                format!("must not exceed {MAX_TIMEFRAME_DAYS} days"),
            ));
        }
        Ok(timeframe)
    }

    pub fn spike_settings(&self) -> Result<SpikeSettings> {
        let timeframe = self.timeframe()?;
        let spike_height = self.spike_height.ok_or_else(|| self.missing("spike_height"))?;
        if spike_height.is_nan() || spike_height <= 1.0 {
            return Err(self.invalid("spike_height", format!("must be greater than 1 (got {spike_height})")));
        }
        let spike_type: SpikeType = self
            .spike_type
            .as_deref()
            .ok_or_else(|| self.missing("spike_type"))?
            .parse()
            .map_err(|e: String| self.invalid("spike_type", e))?;
        Ok(SpikeSettings {
            timeframe,
            spike_height,
            spike_type,
            threshold_cur: self.threshold_cur,
            threshold_ref: self.threshold_ref,
            alert_on_new_data: self.query_key.is_some() && self.alert_on_new_data,
        })
    }

    pub fn target_field(&self) -> Result<&str> {
        self.target_field
            .as_deref()
            .ok_or_else(|| self.missing("target_field"))
    }

    pub fn percentile(&self) -> Result<f64> {
        let value = self
            .percentile_value
            .ok_or_else(|| self.missing("percentile_value"))?;
        if !(0.0..=100.0).contains(&value) {
            return Err(self.invalid("percentile_value", format!("must be within 0..=100 (got {value})")));
        }
        Ok(value)
    }

    pub fn num_events(&self) -> Result<u64> {
        match self.num_events {
            Some(0) => Err(self.invalid("num_events", "must be at least 1".to_string())),
            Some(n) => Ok(n),
            None => Err(self.missing("num_events")),
        }
    }

    /// The aggregated field, the aggregation and the payload key they combine into.
    pub fn aggregation(&self) -> Result<(String, AggregationType, String)> {
        let agg_key = self
            .metric_agg_key
            .clone()
            .ok_or_else(|| self.missing("metric_agg_key"))?;
        let raw_type = self
            .metric_agg_type
            .as_deref()
            .ok_or_else(|| self.missing("metric_agg_type"))?;
        let agg_type: AggregationType =
            raw_type
                .parse()
                .map_err(|_| RuleError::InvalidAggregationType {
                    rule: self.name.clone(),
                    value: raw_type.to_string(),
                })?;
        let key = metric_key(&agg_key, agg_type);
        Ok((agg_key, agg_type, key))
    }

    /// Bucketed queries must tile the query span exactly.
    fn check_bucket_interval(&self) -> Result<()> {
        let Some(interval) = self.bucket_interval else {
            return Ok(());
        };
        let interval_ms = self.duration("bucket_interval", interval)?.num_milliseconds();
        if interval_ms <= 0 {
            return Err(self.invalid("bucket_interval", "must be longer than zero".to_string()));
        }
        let (option, span) = if self.use_run_every_query_size {
            ("run_every", self.run_every)
        } else {
            ("buffer_time", self.buffer_time)
        };
        let span = span.ok_or_else(|| self.missing(option))?;
        if self.duration(option, span)?.num_milliseconds() % interval_ms != 0 {
            return Err(self.invalid(option, "must be evenly divisible by bucket_interval".to_string()));
        }
        Ok(())
    }

    fn duration(&self, option: &'static str, span: TimeSpan) -> Result<Duration> {
        span.to_duration()
            .ok_or_else(|| self.invalid(option, "duration out of range".to_string()))
    }

    fn missing(&self, option: &'static str) -> RuleError {
        RuleError::MissingOption {
            rule: self.name.clone(),
            option,
        }
    }

    fn invalid(&self, option: &'static str, reason: String) -> RuleError {
        RuleError::InvalidOption {
            rule: self.name.clone(),
            option,
            reason,
        }
    }
}
