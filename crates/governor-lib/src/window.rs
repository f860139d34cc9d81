//! Windowed CPU usage statistics
//!
//! Averages the samples of a trailing window after raising each one to the
//! minimum-load floor, so the average never understates the baseline load
//! the governor guarantees.

use crate::models::Sample;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Outcome of a window computation
#[derive(Debug, Clone, PartialEq)]
pub enum WindowResult {
    Ready(WindowSummary),
    /// No samples in the window. Callers degrade; this is never "zero usage".
    InsufficientData,
}

impl WindowResult {
    pub fn summary(&self) -> Option<&WindowSummary> {
        match self {
            WindowResult::Ready(summary) => Some(summary),
            WindowResult::InsufficientData => None,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.summary().map(|s| s.sample_count).unwrap_or(0)
    }
}

/// Floored average over the samples inside a window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSummary {
    pub average_percent: f64,
    pub sample_count: usize,
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

/// Compute the floored average of samples with
/// `as_of - window_length <= timestamp <= as_of`
pub fn compute_window(
    samples: &[Sample],
    as_of: DateTime<Utc>,
    window_length: Duration,
    min_load_percent: f64,
) -> WindowResult {
    let since = window_start(as_of, window_length);
    let selected = select_range(samples, since, as_of);

    match summarize(&selected, min_load_percent) {
        Some(summary) => WindowResult::Ready(summary),
        None => WindowResult::InsufficientData,
    }
}

/// Floored average of an already-selected, time-ordered slice
pub(crate) fn summarize(selected: &[&Sample], min_load_percent: f64) -> Option<WindowSummary> {
    let first = selected.first()?;
    let last = selected.last()?;

    let total: f64 = selected
        .iter()
        .map(|s| floored(s.cpu_percent, min_load_percent))
        .sum();

    Some(WindowSummary {
        average_percent: total / selected.len() as f64,
        sample_count: selected.len(),
        earliest: first.timestamp,
        latest: last.timestamp,
    })
}

/// Samples with `since <= timestamp <= until`, ascending by timestamp.
/// Non-finite readings are dropped.
pub(crate) fn select_range(
    samples: &[Sample],
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Vec<&Sample> {
    let mut selected: Vec<&Sample> = samples
        .iter()
        .filter(|s| s.timestamp >= since && s.timestamp <= until && s.cpu_percent.is_finite())
        .collect();

    let ordered = selected
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp);
    if !ordered {
        selected.sort_by_key(|s| s.timestamp);
    }

    selected
}

/// Apply the minimum-load floor to a single reading
pub fn floored(value: f64, min_load_percent: f64) -> f64 {
    value.max(min_load_percent)
}

/// `as_of - length`, saturating at the earliest representable instant
pub(crate) fn window_start(as_of: DateTime<Utc>, length: Duration) -> DateTime<Utc> {
    as_of
        .checked_sub_signed(to_chrono(length))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    let millis = duration.as_millis().min(i64::MAX as u128 / 2) as i64;
    chrono::Duration::milliseconds(millis)
}

/// Minutes from `from` to `to`, never negative
pub(crate) fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 60_000.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minute)
    }

    fn samples(values: &[(i64, f64)]) -> Vec<Sample> {
        values.iter().map(|&(m, v)| Sample::new(at(m), v)).collect()
    }

    #[test]
    fn test_average_applies_minimum_floor() {
        let data = samples(&[(0, 2.0), (1, 20.0), (2, 5.0), (3, 40.0)]);
        let result = compute_window(&data, at(3), Duration::from_secs(3600), 10.0);

        let summary = result.summary().unwrap();
        assert_eq!(summary.sample_count, 4);
        // 10 + 20 + 10 + 40
        assert!((summary.average_percent - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window_is_insufficient_data() {
        let data = samples(&[(0, 50.0)]);
        let result = compute_window(&data, at(120), Duration::from_secs(3600), 10.0);

        assert_eq!(result, WindowResult::InsufficientData);
        assert_eq!(result.sample_count(), 0);
    }

    #[test]
    fn test_window_bounds_are_inclusive() {
        let data = samples(&[(-61, 90.0), (-60, 30.0), (0, 30.0), (1, 90.0)]);
        let result = compute_window(&data, at(0), Duration::from_secs(3600), 0.0);

        let summary = result.summary().unwrap();
        assert_eq!(summary.sample_count, 2);
        assert_eq!(summary.earliest, at(-60));
        assert_eq!(summary.latest, at(0));
        assert!((summary.average_percent - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_unordered_samples_are_sorted() {
        let data = samples(&[(5, 30.0), (1, 10.0), (3, 20.0), (3, 20.0)]);
        let result = compute_window(&data, at(10), Duration::from_secs(3600), 0.0);

        let summary = result.summary().unwrap();
        assert_eq!(summary.sample_count, 4);
        assert_eq!(summary.earliest, at(1));
        assert_eq!(summary.latest, at(5));
    }

    #[test]
    fn test_non_finite_readings_are_dropped() {
        let data = samples(&[(0, f64::NAN), (1, 40.0)]);
        let result = compute_window(&data, at(1), Duration::from_secs(3600), 0.0);

        assert_eq!(result.sample_count(), 1);
    }

    #[test]
    fn test_average_never_below_floor() {
        for floor in [0.0, 5.0, 10.0, 35.0, 100.0] {
            let data = samples(&[(0, 0.0), (1, 3.0), (2, 12.5), (3, 99.0)]);
            let result = compute_window(&data, at(3), Duration::from_secs(600), floor);
            let average = result.summary().unwrap().average_percent;
            assert!(average >= floor, "average {} below floor {}", average, floor);
        }
    }

    #[test]
    fn test_minutes_between_never_negative() {
        assert_eq!(minutes_between(at(10), at(5)), 0.0);
        assert!((minutes_between(at(0), at(90)) - 90.0).abs() < 1e-9);
    }
}
