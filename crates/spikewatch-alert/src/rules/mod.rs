pub mod aggregation_spike;
pub mod frequency;
pub mod metric_aggregation;
pub mod spike;

use spikewatch_common::time::pretty_ts;
use spikewatch_common::types::Match;

/// Generic rendering for statistics a rule's own message does not cover.
pub(crate) fn stats_message(m: &Match, use_local_time: bool) -> String {
    let fields: Vec<String> = m
        .stats
        .fields()
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    format!(
        "Match around {}: {}\n\n",
        pretty_ts(m.timestamp, use_local_time),
        fields.join(", ")
    )
}

/// Integer rendering of a statistic, truncating any fraction.
pub(crate) fn whole(value: f64) -> String {
    format!("{}", value.trunc() as i64)
}

/// Threshold rendering where an unset bound reads `None`.
pub(crate) fn bound(value: Option<f64>) -> String {
    value.map_or_else(|| "None".to_string(), |v| v.to_string())
}
