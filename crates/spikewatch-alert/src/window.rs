use crate::error::WindowError;
use chrono::{DateTime, Duration, Utc};
use spikewatch_common::types::EventStub;
use std::collections::VecDeque;

/// One observation held by a window: the event projection and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEntry {
    pub event: EventStub,
    pub value: f64,
}

impl WindowEntry {
    pub fn new(event: EventStub, value: f64) -> Self {
        Self { event, value }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.event.timestamp
    }
}

/// Time-bounded, timestamp-ordered buffer of entries.
///
/// After every append the span between the oldest and newest entry is
/// strictly less than the window's timeframe. Entries pushed out to restore
/// that are handed, oldest first and one at a time, to the caller's eviction
/// callback; this is how a current window feeds its reference window.
pub trait EventWindow {
    fn append_with<F>(&mut self, entry: WindowEntry, on_evicted: F)
    where
        F: FnMut(WindowEntry);

    fn append(&mut self, entry: WindowEntry) {
        self.append_with(entry, |_| {});
    }

    /// Empty the window without reporting evictions.
    fn clear(&mut self);

    fn entries(&self) -> &VecDeque<WindowEntry>;

    /// Scalar summary of the window contents.
    fn statistic(&self) -> Result<f64, WindowError>;

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

const TOTAL_EPSILON: f64 = 1e-9;

/// Window whose statistic is the running total of its entry values.
///
/// With one-per-document values (and zero-valued placeholders) the total is
/// the number of non-zero entries. Aggregation rules divide it by the entry
/// count to get a mean.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    timeframe: Duration,
    data: VecDeque<WindowEntry>,
    running_total: f64,
}

impl TimeWindow {
    pub fn new(timeframe: Duration) -> Self {
        Self {
            timeframe,
            data: VecDeque::new(),
            running_total: 0.0,
        }
    }

    pub fn timeframe(&self) -> Duration {
        self.timeframe
    }

    /// Span between the oldest and newest entry; zero when empty.
    pub fn duration(&self) -> Duration {
        match (self.data.front(), self.data.back()) {
            (Some(oldest), Some(newest)) => newest.timestamp() - oldest.timestamp(),
            _ => Duration::zero(),
        }
    }

    pub fn total(&self) -> f64 {
        self.running_total
    }

    pub fn newest(&self) -> Option<&WindowEntry> {
        self.data.back()
    }

    /// Mean entry value, undefined on an empty window.
    ///
    /// Summed afresh from the entries rather than from the running total.
    pub fn mean(&self) -> Result<f64, WindowError> {
        if self.data.is_empty() {
            return Err(WindowError::Empty);
        }
        let sum: f64 = self.data.iter().map(|e| e.value).sum();
        Ok(sum / self.data.len() as f64)
    }

    fn insert_ordered(&mut self, entry: WindowEntry) {
        // Equal timestamps keep arrival order.
        let ts = entry.timestamp();
        let pos = self.data.partition_point(|e| e.timestamp() <= ts);
        self.running_total += entry.value;
        self.data.insert(pos, entry);
    }
}

impl EventWindow for TimeWindow {
    fn append_with<F>(&mut self, entry: WindowEntry, mut on_evicted: F)
    where
        F: FnMut(WindowEntry),
    {
        self.insert_ordered(entry);

        while self.duration() >= self.timeframe {
            let Some(oldest) = self.data.pop_front() else {
                break;
            };
            self.running_total -= oldest.value;
            on_evicted(oldest);
        }

        // Subtracting fractional values leaves rounding residue.
        if self.data.is_empty() || self.running_total.abs() < TOTAL_EPSILON {
            self.running_total = 0.0;
        }
    }

    fn clear(&mut self) {
        self.data.clear();
        self.running_total = 0.0;
    }

    fn entries(&self) -> &VecDeque<WindowEntry> {
        &self.data
    }

    fn statistic(&self) -> Result<f64, WindowError> {
        Ok(self.running_total)
    }
}

/// Time window whose statistic is a nearest-rank percentile of its values.
///
/// Values are sorted ascending and the entry at rank
/// `floor(len * percentile / 100)` (clamped to the last index) is returned.
/// No interpolation between ranks.
#[derive(Debug, Clone)]
pub struct PercentileWindow {
    window: TimeWindow,
    percentile: f64,
}

impl PercentileWindow {
    pub fn new(timeframe: Duration, percentile: f64) -> Self {
        Self {
            window: TimeWindow::new(timeframe),
            percentile,
        }
    }

    pub fn percentile(&self) -> f64 {
        self.percentile
    }
}

impl EventWindow for PercentileWindow {
    fn append_with<F>(&mut self, entry: WindowEntry, on_evicted: F)
    where
        F: FnMut(WindowEntry),
    {
        self.window.append_with(entry, on_evicted);
    }

    fn clear(&mut self) {
        self.window.clear();
    }

    fn entries(&self) -> &VecDeque<WindowEntry> {
        self.window.entries()
    }

    fn statistic(&self) -> Result<f64, WindowError> {
        let mut values: Vec<f64> = self.window.entries().iter().map(|e| e.value).collect();
        if values.is_empty() {
            return Err(WindowError::Empty);
        }
        values.sort_by(f64::total_cmp);
        let rank = (values.len() as f64 * self.percentile / 100.0).floor() as usize;
        Ok(values[rank.min(values.len() - 1)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
    }

    fn entry(secs: i64, value: f64) -> WindowEntry {
        WindowEntry::new(EventStub::new(base() + Duration::seconds(secs)), value)
    }

    #[test]
    fn evicts_oldest_first_into_callback() {
        let mut window = TimeWindow::new(Duration::seconds(5));
        let mut evicted = Vec::new();
        for secs in 0..8 {
            window.append_with(entry(secs, 1.0), |e| evicted.push(e.timestamp()));
        }
        let evicted_secs: Vec<i64> = evicted.iter().map(|ts| (*ts - base()).num_seconds()).collect();
        assert_eq!(evicted_secs, vec![0, 1, 2]);
        assert_eq!(window.len(), 5);
        assert_eq!(window.statistic(), Ok(5.0));
    }

    #[test]
    fn out_of_order_append_is_reordered() {
        let mut window = TimeWindow::new(Duration::seconds(60));
        window.append(entry(10, 1.0));
        window.append(entry(5, 1.0));
        window.append(entry(7, 1.0));
        let secs: Vec<i64> = window
            .entries()
            .iter()
            .map(|e| (e.timestamp() - base()).num_seconds())
            .collect();
        assert_eq!(secs, vec![5, 7, 10]);
    }

    #[test]
    fn chained_windows_preserve_arrival_order() {
        let mut reference = TimeWindow::new(Duration::seconds(3));
        let mut current = TimeWindow::new(Duration::seconds(3));
        for secs in 0..10 {
            current.append_with(entry(secs, 1.0), |e| reference.append(e));
        }
        let ref_secs: Vec<i64> = reference
            .entries()
            .iter()
            .map(|e| (e.timestamp() - base()).num_seconds())
            .collect();
        assert_eq!(ref_secs, vec![4, 5, 6]);
        assert_eq!(current.len(), 3);
    }

    #[test]
    fn clear_does_not_report_evictions() {
        let mut window = TimeWindow::new(Duration::seconds(5));
        window.append(entry(0, 3.0));
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.statistic(), Ok(0.0));
        assert_eq!(window.mean(), Err(WindowError::Empty));
    }

    #[test]
    fn fractional_totals_settle_at_zero() {
        let mut window = TimeWindow::new(Duration::seconds(10));
        for (secs, value) in [(0, 0.1), (1, 0.2), (2, 0.7), (3, 0.3)] {
            window.append(entry(secs, value));
        }
        window.append(entry(20, 0.0));

        assert_eq!(window.len(), 1);
        assert_eq!(window.statistic(), Ok(0.0));
        assert_eq!(window.mean(), Ok(0.0));
    }

    #[test]
    fn zero_valued_entries_do_not_count() {
        let mut window = TimeWindow::new(Duration::seconds(10));
        window.append(entry(0, 1.0));
        window.append(entry(1, 0.0));
        window.append(entry(2, 1.0));
        assert_eq!(window.statistic(), Ok(2.0));
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let mut window = PercentileWindow::new(Duration::seconds(60), 90.0);
        for (i, v) in [10.0, 10.0, 10.0, 10.0, 10.0, 20.0].into_iter().enumerate() {
            window.append(entry(i as i64, v));
        }
        // floor(6 * 90 / 100) = 5
        assert_eq!(window.statistic(), Ok(20.0));

        let mut window = PercentileWindow::new(Duration::seconds(60), 50.0);
        for (i, v) in [4.0, 1.0, 3.0, 2.0].into_iter().enumerate() {
            window.append(entry(i as i64, v));
        }
        // floor(4 * 50 / 100) = 2 -> sorted [1, 2, 3, 4]
        assert_eq!(window.statistic(), Ok(3.0));
    }

    #[test]
    fn percentile_rank_is_clamped() {
        let mut window = PercentileWindow::new(Duration::seconds(60), 100.0);
        window.append(entry(0, 1.0));
        window.append(entry(1, 7.0));
        assert_eq!(window.statistic(), Ok(7.0));
    }

    #[test]
    fn percentile_of_empty_window_fails() {
        let window = PercentileWindow::new(Duration::seconds(60), 90.0);
        assert_eq!(window.statistic(), Err(WindowError::Empty));
    }

    proptest! {
        #[test]
        fn span_stays_below_timeframe(
            timeframe in 1i64..30,
            offsets in prop::collection::vec(0i64..5, 1..200),
        ) {
            let mut window = TimeWindow::new(Duration::seconds(timeframe));
            let mut secs = 0;
            for step in offsets {
                secs += step;
                window.append(entry(secs, 1.0));
                prop_assert!(window.duration() < Duration::seconds(timeframe));
            }
        }

        #[test]
        fn percentile_ignores_insertion_order(
            values in prop::collection::vec(0u32..1000, 1..50),
            percentile in 0u32..=100,
        ) {
            let mut forward = PercentileWindow::new(Duration::seconds(3600), percentile as f64);
            let mut backward = PercentileWindow::new(Duration::seconds(3600), percentile as f64);
            for (i, v) in values.iter().enumerate() {
                forward.append(entry(i as i64, *v as f64));
            }
            for (i, v) in values.iter().enumerate().rev() {
                backward.append(entry(i as i64, *v as f64));
            }
            prop_assert_eq!(forward.statistic(), backward.statistic());
        }
    }
}
