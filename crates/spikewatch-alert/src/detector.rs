//! Reference/current window pairs per partition key and the spike decision.
//!
//! A [`SpikeDetector`] keeps, for every partition key, a current window
//! whose evictions feed a reference window of the same timeframe. Once a key
//! has seen two full timeframes of data the current statistic is compared
//! with the reference statistic; a match clears both windows and starts a
//! cooldown of two timeframes. How a window is summarized is the job of a
//! [`Measure`].

use crate::error::WindowError;
use crate::window::{EventWindow, PercentileWindow, TimeWindow, WindowEntry};
use chrono::{DateTime, Duration, Utc};
use spikewatch_common::types::{EventStub, MatchStats, QueryKey};
use std::collections::HashMap;
use std::str::FromStr;

/// Which direction of change counts as a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpikeType {
    Up,
    Down,
    Both,
}

impl FromStr for SpikeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "both" => Ok(Self::Both),
            _ => Err(format!("unknown spike type: {s}")),
        }
    }
}

impl std::fmt::Display for SpikeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Both => write!(f, "both"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpikeSettings {
    pub timeframe: Duration,
    pub spike_height: f64,
    pub spike_type: SpikeType,
    pub threshold_cur: f64,
    pub threshold_ref: f64,
    /// Set only when a query key is configured together with
    /// `alert_on_new_data`; lets keys alert before their own warm-up ends.
    pub alert_on_new_data: bool,
}

impl SpikeSettings {
    /// Length of warm-up and cooldown: two timeframes. `None` when that
    /// does not fit in a duration, in which case keys never leave warm-up.
    pub fn cycle(&self) -> Option<Duration> {
        self.timeframe.checked_add(&self.timeframe)
    }

    /// Whether `current` is a spike (or dip) relative to `reference`.
    ///
    /// Statistics below the absolute thresholds never match.
    pub fn is_spike(&self, reference: f64, current: f64) -> bool {
        if current < self.threshold_cur || reference < self.threshold_ref {
            return false;
        }

        let spike_down = current <= reference / self.spike_height;
        let spike_up = current >= reference * self.spike_height;

        match self.spike_type {
            SpikeType::Up => spike_up,
            SpikeType::Down => spike_down,
            SpikeType::Both => spike_up || spike_down,
        }
    }
}

/// How the windows of a detector are built and summarized.
pub trait Measure {
    type Window: EventWindow;

    fn new_window(&self, timeframe: Duration) -> Self::Window;

    fn measure(&self, window: &Self::Window) -> Result<f64, WindowError>;

    fn stats(&self, current: f64, reference: f64) -> MatchStats;

    /// Whether garbage collection ages windows with zero-valued placeholders.
    fn ages_with_placeholders(&self) -> bool {
        true
    }
}

/// Running count (or sum of counts) of events.
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl Measure for Count {
    type Window = TimeWindow;

    fn new_window(&self, timeframe: Duration) -> TimeWindow {
        TimeWindow::new(timeframe)
    }

    fn measure(&self, window: &TimeWindow) -> Result<f64, WindowError> {
        window.statistic()
    }

    fn stats(&self, current: f64, reference: f64) -> MatchStats {
        MatchStats::Spike {
            spike_count: current,
            reference_count: reference,
        }
    }
}

/// Nearest-rank percentile of window values.
#[derive(Debug, Clone, Copy)]
pub struct Percentile {
    pub percentile: f64,
}

impl Measure for Percentile {
    type Window = PercentileWindow;

    fn new_window(&self, timeframe: Duration) -> PercentileWindow {
        PercentileWindow::new(timeframe, self.percentile)
    }

    fn measure(&self, window: &PercentileWindow) -> Result<f64, WindowError> {
        window.statistic()
    }

    fn stats(&self, current: f64, reference: f64) -> MatchStats {
        MatchStats::Percentile {
            current_count: current,
            reference_count: reference,
        }
    }
}

/// Mean of pre-aggregated values, computed at comparison time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mean;

impl Measure for Mean {
    type Window = TimeWindow;

    fn new_window(&self, timeframe: Duration) -> TimeWindow {
        TimeWindow::new(timeframe)
    }

    fn measure(&self, window: &TimeWindow) -> Result<f64, WindowError> {
        window.mean()
    }

    fn stats(&self, current: f64, reference: f64) -> MatchStats {
        MatchStats::AggregationSpike {
            spike_value: current,
            reference_value: reference,
        }
    }

    /// A zero placeholder would count as a bucket and drag the mean down.
    fn ages_with_placeholders(&self) -> bool {
        false
    }
}

/// Where a partition key stands in its warm-up/cooldown cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Uninitialized,
    WarmingUp,
    Active,
    Cooldown,
}

/// Windows and timers of one partition key. Always created and dropped as a unit.
#[derive(Debug, Clone)]
struct KeyState<W> {
    reference: W,
    current: W,
    first_event: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
}

/// A spike found by [`SpikeDetector::handle_event`], before decoration.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeMatch {
    /// First non-placeholder entry of the current window.
    pub event: EventStub,
    pub query_key: QueryKey,
    pub current: f64,
    pub reference: f64,
    pub stats: MatchStats,
}

pub struct SpikeDetector<M: Measure> {
    settings: SpikeSettings,
    measure: M,
    states: HashMap<QueryKey, KeyState<M::Window>>,
    ref_window_filled_once: bool,
}

impl<M: Measure> SpikeDetector<M> {
    pub fn new(settings: SpikeSettings, measure: M) -> Self {
        Self {
            settings,
            measure,
            states: HashMap::new(),
            ref_window_filled_once: false,
        }
    }

    pub fn settings(&self) -> &SpikeSettings {
        &self.settings
    }

    /// True once any key has completed two full timeframes.
    pub fn ref_window_filled_once(&self) -> bool {
        self.ref_window_filled_once
    }

    pub fn tracks(&self, key: &QueryKey) -> bool {
        self.states.contains_key(key)
    }

    pub fn tracked_keys(&self) -> usize {
        self.states.len()
    }

    pub fn cooldown_until(&self, key: &QueryKey) -> Option<DateTime<Utc>> {
        self.states.get(key).and_then(|s| s.cooldown_until)
    }

    /// Entry counts of the (reference, current) windows of a key.
    pub fn window_lens(&self, key: &QueryKey) -> Option<(usize, usize)> {
        self.states
            .get(key)
            .map(|s| (s.reference.len(), s.current.len()))
    }

    pub fn phase(&self, key: &QueryKey, now: DateTime<Utc>) -> KeyPhase {
        let Some(state) = self.states.get(key) else {
            return KeyPhase::Uninitialized;
        };
        if state.cooldown_until.is_some_and(|until| now < until) {
            return KeyPhase::Cooldown;
        }
        match state.first_event {
            None => KeyPhase::Uninitialized,
            Some(first) if self.settings.cycle().map_or(true, |cycle| now - first < cycle) => {
                KeyPhase::WarmingUp
            }
            Some(_) => KeyPhase::Active,
        }
    }

    /// Feed one value for a key and evaluate the key's windows.
    ///
    /// The value is always appended before any statistic is computed.
    pub fn handle_event(&mut self, event: EventStub, value: f64, key: &QueryKey) -> Option<SpikeMatch> {
        let timeframe = self.settings.timeframe;
        let cycle = self.settings.cycle();
        let measure = &self.measure;
        let state = self.states.entry(key.clone()).or_insert_with(|| KeyState {
            reference: measure.new_window(timeframe),
            current: measure.new_window(timeframe),
            first_event: None,
            cooldown_until: None,
        });

        let ts = event.timestamp;
        let first_event = *state.first_event.get_or_insert(ts);

        let reference = &mut state.reference;
        state
            .current
            .append_with(WindowEntry::new(event, value), |evicted| reference.append(evicted));

        if cycle.map_or(true, |cycle| ts - first_event < cycle) {
            if !self.ref_window_filled_once {
                return None;
            }
            if !self.settings.alert_on_new_data {
                return None;
            }
            if state.cooldown_until.is_some_and(|until| ts < until) {
                tracing::debug!(query_key = %key, until = ?state.cooldown_until, "Spike check suppressed (cooldown)");
                return None;
            }
        } else {
            self.ref_window_filled_once = true;
        }

        let (current, reference) = match (
            self.measure.measure(&state.current),
            self.measure.measure(&state.reference),
        ) {
            (Ok(current), Ok(reference)) => (current, reference),
            (Err(e), _) | (_, Err(e)) => {
                tracing::debug!(query_key = %key, error = %e, "Spike check skipped");
                return None;
            }
        };

        if !self.settings.is_spike(reference, current) {
            return None;
        }

        // Placeholders injected by garbage collection carry a zero value.
        let representative = state
            .current
            .entries()
            .iter()
            .find(|e| e.value != 0.0)
            .or_else(|| state.current.entries().back())
            .map(|e| e.event.clone())
            .unwrap_or_else(|| EventStub::new(ts));

        state.current.clear();
        state.reference.clear();
        state.first_event = None;
        state.cooldown_until = Some(
            cycle
                .and_then(|cycle| representative.timestamp.checked_add_signed(cycle))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );

        tracing::info!(
            query_key = %key,
            current,
            reference,
            at = %representative.timestamp,
            "Spike detected"
        );

        Some(SpikeMatch {
            event: representative,
            query_key: key.clone(),
            current,
            reference,
            stats: self.measure.stats(current, reference),
        })
    }

    /// Periodic sweep at time `ts`.
    ///
    /// Non-default keys with nothing left in either window are forgotten;
    /// every other key receives a zero-valued placeholder so its windows age
    /// even without traffic. Placeholders go through [`Self::handle_event`] and
    /// may themselves produce matches, which are returned. Measures that
    /// opt out of placeholders only have idle keys forgotten.
    pub fn garbage_collect(&mut self, ts: DateTime<Utc>) -> Vec<SpikeMatch> {
        let mut keys: Vec<QueryKey> = self.states.keys().cloned().collect();
        keys.sort();

        let mut matches = Vec::new();
        for key in keys {
            let idle = self
                .states
                .get(&key)
                .is_some_and(|s| self.is_idle(&s.reference) && self.is_idle(&s.current));
            if !key.is_default() && idle {
                self.states.remove(&key);
                tracing::debug!(query_key = %key, "Forgetting idle partition key");
                continue;
            }
            if !self.measure.ages_with_placeholders() {
                continue;
            }

            let placeholder = if key.is_default() {
                EventStub::new(ts)
            } else {
                EventStub::with_key(ts, key.clone())
            };
            if let Some(m) = self.handle_event(placeholder, 0.0, &key) {
                matches.push(m);
            }
        }
        matches
    }

    fn is_idle(&self, window: &M::Window) -> bool {
        window.is_empty() || self.measure.measure(window).map_or(true, |v| v == 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn settings(spike_type: SpikeType, spike_height: f64) -> SpikeSettings {
        SpikeSettings {
            timeframe: Duration::seconds(10),
            spike_height,
            spike_type,
            threshold_cur: 0.0,
            threshold_ref: 0.0,
            alert_on_new_data: false,
        }
    }

    #[test]
    fn spike_direction_and_thresholds() {
        let mut s = settings(SpikeType::Both, 2.0);
        assert!(s.is_spike(10.0, 20.0));
        assert!(s.is_spike(10.0, 5.0));
        assert!(!s.is_spike(10.0, 15.0));

        s.spike_type = SpikeType::Up;
        assert!(!s.is_spike(10.0, 5.0));

        s.threshold_ref = 11.0;
        assert!(!s.is_spike(10.0, 100.0), "reference below threshold_ref");
        s.threshold_ref = 0.0;
        s.threshold_cur = 50.0;
        assert!(!s.is_spike(10.0, 40.0), "current below threshold_cur");
    }

    #[test]
    fn key_phases_follow_first_event() {
        let mut detector = SpikeDetector::new(settings(SpikeType::Up, 2.0), Count);
        let key = QueryKey::all();
        assert_eq!(detector.phase(&key, at(0)), KeyPhase::Uninitialized);

        assert!(detector.handle_event(EventStub::new(at(0)), 1.0, &key).is_none());
        assert_eq!(detector.phase(&key, at(5)), KeyPhase::WarmingUp);
        assert_eq!(detector.phase(&key, at(20)), KeyPhase::Active);
        assert!(!detector.ref_window_filled_once());
    }

    #[test]
    fn match_skips_placeholder_entries_and_starts_cooldown() {
        let mut detector = SpikeDetector::new(settings(SpikeType::Down, 3.0), Count);
        let key = QueryKey::all();
        for s in 0..40 {
            assert!(detector.handle_event(EventStub::new(at(s)), 1.0, &key).is_none());
        }
        assert!(detector.garbage_collect(at(45)).is_empty());

        let m = detector
            .handle_event(EventStub::new(at(54)), 1.0, &key)
            .expect("drop to a tenth of the reference");
        assert_eq!(m.event.timestamp, at(54));
        assert_eq!(m.current, 1.0);
        assert_eq!(m.reference, 10.0);
        assert_eq!(detector.window_lens(&key), Some((0, 0)));
        assert_eq!(detector.cooldown_until(&key), Some(at(74)));
        assert_eq!(detector.phase(&key, at(60)), KeyPhase::Cooldown);
    }

    #[test]
    fn empty_reference_skips_mean_comparison() {
        let mut s = settings(SpikeType::Up, 2.0);
        s.alert_on_new_data = true;
        let mut detector = SpikeDetector::new(s, Mean);
        let web = QueryKey::from("web-01");
        for s in 0..25 {
            detector.handle_event(EventStub::new(at(s)), 1.0, &web);
        }
        assert!(detector.ref_window_filled_once());

        // A brand-new key evaluates during warm-up but has no reference yet.
        let db = QueryKey::from("db-01");
        assert!(detector.handle_event(EventStub::new(at(25)), 50.0, &db).is_none());
        assert_eq!(detector.window_lens(&db), Some((0, 1)));
    }

    #[test]
    fn mean_windows_take_no_placeholders() {
        let web = QueryKey::from("web-01");
        let mut mean = SpikeDetector::new(settings(SpikeType::Up, 2.0), Mean);
        let mut count = SpikeDetector::new(settings(SpikeType::Up, 2.0), Count);
        for s in 0..6 {
            mean.handle_event(EventStub::with_key(at(s), web.clone()), 2.0, &web);
            count.handle_event(EventStub::with_key(at(s), web.clone()), 1.0, &web);
        }

        assert!(mean.garbage_collect(at(30)).is_empty());
        assert!(count.garbage_collect(at(30)).is_empty());
        assert_eq!(mean.window_lens(&web), Some((0, 6)));
        assert_eq!(count.window_lens(&web), Some((6, 1)));
    }

    #[test]
    fn unbounded_cycle_keeps_key_warming_up() {
        let mut s = settings(SpikeType::Up, 2.0);
        s.timeframe = Duration::milliseconds(i64::MAX / 2 + 1);
        assert_eq!(s.cycle(), None);

        let mut detector = SpikeDetector::new(s, Count);
        let key = QueryKey::all();
        for s in 0..10 {
            assert!(detector.handle_event(EventStub::new(at(s * 86_400)), 1.0, &key).is_none());
        }
        assert_eq!(detector.phase(&key, at(10 * 86_400)), KeyPhase::WarmingUp);
        assert!(!detector.ref_window_filled_once());
    }
}
