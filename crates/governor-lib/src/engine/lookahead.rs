//! Sliding-window look-ahead
//!
//! Simulates the window after it slides forward by one step:
//! new window = [T - W + S, T + S], new quota = Q_remaining + X * S.
//! Keeping the new average at or below the target gives
//! X <= (target * W - Q_remaining) / S.

use crate::config::WindowConfig;
use crate::models::Sample;
use crate::window::{minutes_between, summarize, to_chrono, window_start};
use chrono::{DateTime, Utc};

/// Intermediate values of a look-ahead evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct LookAheadDetail {
    /// Samples older than this were slid out of the window
    pub cutoff: DateTime<Utc>,
    pub remaining_samples: usize,
    /// Floored average of the samples that survive the slide
    pub remaining_average_percent: f64,
    /// Minutes of history the surviving samples stand for
    pub covered_minutes: f64,
    /// Quota already committed inside the post-slide window (percent·minutes)
    pub q_remaining: f64,
    /// Largest percentage usable during the next step, before safety and clamping
    pub max_next_step_percent: f64,
    pub safety_factor: f64,
}

/// Run the look-ahead over time-ordered window samples.
///
/// Returns `None` when no sample survives the slide. The surviving samples
/// are treated as evenly spread over the span from the slide cutoff (or the
/// earliest data, if later) to `as_of`.
pub(super) fn compute(
    in_window: &[&Sample],
    window_earliest: DateTime<Utc>,
    as_of: DateTime<Utc>,
    config: &WindowConfig,
    safety_factor: f64,
) -> Option<LookAheadDetail> {
    let window_start = window_start(as_of, config.window_length());
    let cutoff = window_start
        .checked_add_signed(to_chrono(config.step_length()))
        .unwrap_or(as_of);

    let remaining: Vec<&Sample> = in_window
        .iter()
        .copied()
        .filter(|s| s.timestamp >= cutoff)
        .collect();
    let summary = summarize(&remaining, config.min_load_percent)?;

    let coverage_start = cutoff.max(window_earliest);
    let covered_minutes = minutes_between(coverage_start, as_of);
    let q_remaining = summary.average_percent * covered_minutes;

    let max_next_step_percent = (config.target_average_limit_percent * config.window_minutes()
        - q_remaining)
        / config.step_minutes();

    Some(LookAheadDetail {
        cutoff,
        remaining_samples: summary.sample_count,
        remaining_average_percent: summary.average_percent,
        covered_minutes,
        q_remaining,
        max_next_step_percent,
        safety_factor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn config() -> WindowConfig {
        WindowConfig {
            window_length_secs: 3600,
            step_length_secs: 600,
            min_load_percent: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_oldest_step_is_slid_out() {
        let samples: Vec<Sample> = (0..=6)
            .map(|i| Sample::new(now() - chrono::Duration::minutes(60 - i * 10), 20.0 + i as f64))
            .collect();
        let refs: Vec<&Sample> = samples.iter().collect();

        let detail = compute(&refs, samples[0].timestamp, now(), &config(), 0.9).unwrap();

        // the sample at -60 is gone; -50 sits exactly on the cutoff and stays
        assert_eq!(detail.cutoff, now() - chrono::Duration::minutes(50));
        assert_eq!(detail.remaining_samples, 6);
        assert!((detail.covered_minutes - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_history_only_covers_its_own_span() {
        let samples = vec![
            Sample::new(now() - chrono::Duration::minutes(20), 40.0),
            Sample::new(now(), 40.0),
        ];
        let refs: Vec<&Sample> = samples.iter().collect();

        let detail = compute(&refs, samples[0].timestamp, now(), &config(), 0.9).unwrap();

        assert!((detail.covered_minutes - 20.0).abs() < 1e-9);
        assert!((detail.q_remaining - 800.0).abs() < 1e-9);
        // (30 * 60 - 800) / 10
        assert!((detail.max_next_step_percent - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_floor_raises_committed_quota() {
        let samples = vec![
            Sample::new(now() - chrono::Duration::minutes(30), 0.0),
            Sample::new(now(), 0.0),
        ];
        let refs: Vec<&Sample> = samples.iter().collect();

        let detail = compute(&refs, samples[0].timestamp, now(), &config(), 0.9).unwrap();

        assert_eq!(detail.remaining_average_percent, 10.0);
        assert!((detail.q_remaining - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_returns_none_when_everything_is_slid_out() {
        let samples = vec![
            Sample::new(now() - chrono::Duration::minutes(59), 40.0),
            Sample::new(now() - chrono::Duration::minutes(51), 40.0),
        ];
        let refs: Vec<&Sample> = samples.iter().collect();

        assert!(compute(&refs, samples[0].timestamp, now(), &config(), 0.9).is_none());
    }
}
