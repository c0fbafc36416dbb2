/// Errors raised by rule construction and rule entry points.
///
/// Configuration variants are fatal to rule construction and never retried.
/// Per-document problems are not errors at this level: they surface as
/// [`ExtractError`], get logged and the document is skipped.
///
/// # Examples
///
/// ```rust
/// use spikewatch_alert::error::RuleError;
///
/// let err = RuleError::MissingOption {
///     rule: "cpu-spike".to_string(),
///     option: "timeframe",
/// };
/// assert!(err.to_string().contains("timeframe"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// A required option is absent for the configured rule type.
    #[error("Rule {rule}: missing required option '{option}'")]
    MissingOption { rule: String, option: &'static str },

    /// An option is present but its value is not acceptable.
    #[error("Rule {rule}: invalid value for '{option}': {reason}")]
    InvalidOption {
        rule: String,
        option: &'static str,
        reason: String,
    },

    /// `metric_agg_type` is not one of the supported aggregations.
    #[error("Rule {rule}: metric_agg_type must be one of min, max, avg, sum, cardinality, value_count (got '{value}')")]
    InvalidAggregationType { rule: String, value: String },

    /// A threshold rule configured with neither bound.
    #[error("Rule {rule}: at least one of max_threshold or min_threshold is required")]
    MissingThreshold { rule: String },

    /// The rule type name in configuration is not known.
    #[error("unknown rule type: {0}")]
    UnknownRuleType(String),

    /// `add_count_data` accepts exactly one timestamp/count pair per call.
    #[error("add_count_data can only accept one count at a time (got {0})")]
    MultipleCounts(usize),

    /// The rule type does not implement this ingestion entry point.
    #[error("Rule {rule}: {operation} is not supported by this rule type")]
    Unsupported {
        rule: String,
        operation: &'static str,
    },

    /// An aggregation payload does not have a recognized shape.
    #[error("Rule {rule}: malformed aggregation payload: {reason}")]
    InvalidPayload { rule: String, reason: String },

    #[error(transparent)]
    Window(#[from] WindowError),
}

/// Misuse of a window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    /// A percentile or mean was requested on a window holding no entries.
    #[error("statistic requested on an empty window")]
    Empty,
}

/// Why a single document could not be turned into a window value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractError {
    /// The timestamp or target field is missing.
    #[error("field '{0}' not found in document")]
    MissingField(String),

    /// The field holds something that cannot be read as a number.
    #[error("field '{field}' is not numeric: {value}")]
    NotNumeric { field: String, value: String },

    /// The value is negative, or zero where zero carries no weight.
    #[error("field '{field}' is out of range: {value}")]
    OutOfRange { field: String, value: f64 },
}

/// Convenience `Result` alias for rule operations.
pub type Result<T> = std::result::Result<T, RuleError>;
