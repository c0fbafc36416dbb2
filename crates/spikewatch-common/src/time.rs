use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};

/// A duration written as a table of units in rule configuration,
/// e.g. `timeframe = { minutes = 5 }`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeSpan {
    pub weeks: u64,
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
    pub milliseconds: u64,
}

impl TimeSpan {
    pub fn seconds(seconds: u64) -> Self {
        Self {
            seconds,
            ..Self::default()
        }
    }

    pub fn minutes(minutes: u64) -> Self {
        Self {
            minutes,
            ..Self::default()
        }
    }

    /// The span as a chrono duration, `None` when it does not fit.
    pub fn to_duration(&self) -> Option<Duration> {
        let parts = [
            Duration::try_weeks(i64::try_from(self.weeks).ok()?)?,
            Duration::try_days(i64::try_from(self.days).ok()?)?,
            Duration::try_hours(i64::try_from(self.hours).ok()?)?,
            Duration::try_minutes(i64::try_from(self.minutes).ok()?)?,
            Duration::try_seconds(i64::try_from(self.seconds).ok()?)?,
            Duration::try_milliseconds(i64::try_from(self.milliseconds).ok()?)?,
        ];
        parts
            .iter()
            .try_fold(Duration::zero(), |total, part| total.checked_add(part))
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Human-readable timestamp used in match messages.
pub fn pretty_ts(ts: DateTime<Utc>, use_local_time: bool) -> String {
    if use_local_time {
        ts.with_timezone(&Local).format("%Y-%m-%d %H:%M %Z").to_string()
    } else {
        ts.format("%Y-%m-%d %H:%M %Z").to_string()
    }
}

/// Render a duration as `H:MM:SS`, prefixed with a day count when needed.
///
/// # Examples
///
/// ```
/// use chrono::Duration;
/// use spikewatch_common::time::format_timeframe;
///
/// assert_eq!(format_timeframe(Duration::seconds(5)), "0:00:05");
/// assert_eq!(format_timeframe(Duration::minutes(90)), "1:30:00");
/// assert_eq!(format_timeframe(Duration::hours(49)), "2 days, 1:00:00");
/// ```
pub fn format_timeframe(duration: Duration) -> String {
    let total_ms = duration.num_milliseconds();
    let days = total_ms.div_euclid(86_400_000);
    let rest = total_ms.rem_euclid(86_400_000);
    let (hours, rest) = (rest / 3_600_000, rest % 3_600_000);
    let (minutes, rest) = (rest / 60_000, rest % 60_000);
    let (seconds, millis) = (rest / 1000, rest % 1000);

    let mut out = match days {
        0 => String::new(),
        1 | -1 => format!("{days} day, "),
        _ => format!("{days} days, "),
    };
    out.push_str(&format!("{hours}:{minutes:02}:{seconds:02}"));
    if millis != 0 {
        out.push_str(&format!(".{:06}", millis * 1000));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_span_sums_units() {
        let span = TimeSpan {
            minutes: 1,
            seconds: 30,
            ..TimeSpan::default()
        };
        assert_eq!(span.to_duration(), Some(Duration::seconds(90)));
        assert!(TimeSpan::default().is_zero());
    }

    #[test]
    fn time_span_out_of_range_is_none() {
        let huge = TimeSpan {
            weeks: 1 << 60,
            ..TimeSpan::default()
        };
        assert_eq!(huge.to_duration(), None);
        assert_eq!(TimeSpan::seconds(u64::MAX).to_duration(), None);

        let sum_overflows = TimeSpan {
            weeks: 15_000_000_000_000,
            days: 10_000_000_000,
            ..TimeSpan::default()
        };
        assert_eq!(sum_overflows.to_duration(), None);
    }

    #[test]
    fn time_span_deserializes_from_table() {
        let span: TimeSpan = serde_json::from_str(r#"{"hours": 1}"#).unwrap();
        assert_eq!(span.to_duration(), Some(Duration::hours(1)));
        assert!(serde_json::from_str::<TimeSpan>(r#"{"fortnights": 1}"#).is_err());
    }

    #[test]
    fn pretty_ts_utc() {
        let ts = Utc.with_ymd_and_hms(2000, 1, 1, 13, 5, 59).unwrap();
        assert_eq!(pretty_ts(ts, false), "2000-01-01 13:05 UTC");
    }

    #[test]
    fn format_timeframe_fractional_seconds() {
        assert_eq!(format_timeframe(Duration::milliseconds(1500)), "0:00:01.500000");
    }
}
