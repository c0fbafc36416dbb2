use crate::config::{RuleConfig, RuleKind};
use crate::error::Result;
use crate::rules::aggregation_spike::SpikeAggregationRule;
use crate::rules::frequency::FrequencyRule;
use crate::rules::metric_aggregation::MetricAggregationRule;
use crate::rules::spike::{PercentileSpikeRule, SpikeRule};
use crate::RuleType;

/// Convert a single `RuleConfig` into a `Box<dyn RuleType>`.
///
/// The whole config is validated first so that a bad rule fails at load time
/// rather than on the first document.
pub fn build_rule(config: &RuleConfig) -> Result<Box<dyn RuleType>> {
    let rule: Box<dyn RuleType> = match config.validate()? {
        RuleKind::Spike => Box::new(SpikeRule::new(config)?),
        RuleKind::SumOfFieldSpike => Box::new(SpikeRule::sum_of_field(config)?),
        RuleKind::PercentileSpike => Box::new(PercentileSpikeRule::percentile(config)?),
        RuleKind::SpikeAggregation => Box::new(SpikeAggregationRule::new(config)?),
        RuleKind::MetricAggregation => Box::new(MetricAggregationRule::new(config)?),
        RuleKind::Frequency => Box::new(FrequencyRule::new(config)?),
        RuleKind::SumOfFieldFrequency => Box::new(FrequencyRule::sum_of_field(config)?),
    };
    Ok(rule)
}

/// Convert multiple configs into trait objects, skipping invalid ones with warnings.
pub fn build_rules(configs: &[RuleConfig]) -> Vec<Box<dyn RuleType>> {
    let mut rules = Vec::with_capacity(configs.len());
    for config in configs {
        match build_rule(config) {
            Ok(rule) => rules.push(rule),
            Err(e) => {
                tracing::warn!(
                    rule_name = %config.name,
                    rule_type = %config.rule_type,
                    error = %e,
                    "Skipping invalid alert rule"
                );
            }
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuleError;
    use spikewatch_common::time::TimeSpan;

    #[test]
    fn builds_every_valid_kind() {
        let mut spike = RuleConfig::new("spike", "spike");
        spike.timeframe = Some(TimeSpan::minutes(5));
        spike.spike_height = Some(2.0);
        spike.spike_type = Some("up".into());

        let mut freq = RuleConfig::new("freq", "frequency");
        freq.timeframe = Some(TimeSpan::minutes(5));
        freq.num_events = Some(3);

        let rules = build_rules(&[spike, freq]);
        let names: Vec<&str> = rules.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["spike", "freq"]);
    }

    #[test]
    fn invalid_rules_are_skipped() {
        let unknown = RuleConfig::new("bogus", "does_not_exist");
        let mut missing = RuleConfig::new("incomplete", "spike");
        missing.timeframe = Some(TimeSpan::minutes(5));

        assert!(matches!(
            build_rule(&unknown),
            Err(RuleError::UnknownRuleType(t)) if t == "does_not_exist"
        ));
        assert!(matches!(
            build_rule(&missing),
            Err(RuleError::MissingOption { option: "spike_height", .. })
        ));
        assert!(build_rules(&[unknown, missing]).is_empty());
    }
}
