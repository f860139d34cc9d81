//! Limit decision engine
//!
//! `decide` picks one of two algorithms per cycle and returns the choice as a
//! tagged `DecisionPath`:
//! - look-ahead: the largest CPU percentage the next step may use without the
//!   window average breaching the target once the window slides forward
//! - fallback: the remaining dynamic quota spread over the rest of the window
//!
//! The engine holds no state between cycles.

mod fallback;
mod lookahead;

pub use fallback::FallbackDetail;
pub use lookahead::LookAheadDetail;

use crate::config::WindowConfig;
use crate::models::{Algorithm, DegradeReason, QuotaState, RiskLevel, Sample};
use crate::window::{minutes_between, select_range, summarize, window_start};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Which algorithm ran, with its intermediate values
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionPath {
    LookAhead(LookAheadDetail),
    Fallback {
        reason: DegradeReason,
        detail: FallbackDetail,
    },
}

/// Output of one engine evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub quota: QuotaState,
    pub path: DecisionPath,
    /// Recommendation before clamping to `[min_load, max_load]`
    pub unclamped_limit: f64,
    pub safety_factor: f64,
    pub risk_level: RiskLevel,
    pub sample_count: usize,
}

impl Decision {
    pub fn algorithm(&self) -> Algorithm {
        self.quota.algorithm_used
    }

    pub fn recommended(&self) -> f64 {
        self.quota.recommended_limit_percent
    }

    pub fn degrade_reason(&self) -> Option<DegradeReason> {
        match &self.path {
            DecisionPath::LookAhead(_) => None,
            DecisionPath::Fallback { reason, .. } => Some(*reason),
        }
    }
}

/// Evaluate the next-step CPU limit from one consistent sample snapshot
pub fn decide(samples: &[Sample], as_of: DateTime<Utc>, config: &WindowConfig) -> Decision {
    let min_load = config.min_load_percent;
    let window_minutes = config.window_minutes();

    let since = window_start(as_of, config.window_length());
    let in_window = select_range(samples, since, as_of);
    let summary = summarize(&in_window, min_load);

    // With no data the floor is the only thing known about usage
    let (windowed_average, earliest, elapsed_minutes) = match &summary {
        Some(s) => (
            s.average_percent,
            Some(s.earliest),
            minutes_between(s.earliest, as_of).min(window_minutes),
        ),
        None => (min_load, None, 0.0),
    };

    let is_startup_period =
        elapsed_minutes < config.startup_data_threshold_fraction * window_minutes;
    let safety_factor = select_safety_factor(config, is_startup_period);

    let mut reason = degrade_reason(config, in_window.len(), is_startup_period);
    let mut lookahead_detail = None;

    if reason.is_none() {
        // earliest is always present once the window holds two samples
        let window_earliest = earliest.unwrap_or(as_of);
        match lookahead::compute(&in_window, window_earliest, as_of, config, safety_factor) {
            Some(detail) => lookahead_detail = Some(detail),
            None => reason = Some(DegradeReason::NothingAfterSlide),
        }
    }

    let (path, unclamped_limit, recommended) = match (lookahead_detail, reason) {
        (Some(detail), _) => {
            let unclamped = detail.max_next_step_percent * safety_factor;
            let recommended = clamp_percent(unclamped, min_load, config.max_load_percent);
            (DecisionPath::LookAhead(detail), unclamped, recommended)
        }
        (None, reason) => {
            let detail = fallback::compute(windowed_average, elapsed_minutes, config, safety_factor);
            let unclamped = min_load + detail.dynamic_limit;
            let recommended = clamp_percent(
                min_load + detail.dynamic_limit.max(0.0),
                min_load,
                config.max_load_percent,
            );
            let reason = reason.unwrap_or(DegradeReason::TooFewSamples);
            (DecisionPath::Fallback { reason, detail }, unclamped, recommended)
        }
    };

    let algorithm = match path {
        DecisionPath::LookAhead(_) => Algorithm::LookAhead,
        DecisionPath::Fallback { .. } => Algorithm::Fallback,
    };

    let quota = quota_state(
        windowed_average,
        elapsed_minutes,
        config,
        recommended,
        is_startup_period,
        algorithm,
    );

    debug!(
        algorithm = algorithm.as_str(),
        samples = in_window.len(),
        windowed_average = windowed_average,
        elapsed_minutes = elapsed_minutes,
        startup = is_startup_period,
        safety_factor = safety_factor,
        unclamped_limit = unclamped_limit,
        recommended = recommended,
        "Evaluated CPU limit"
    );

    Decision {
        quota,
        path,
        unclamped_limit,
        safety_factor,
        risk_level: RiskLevel::from_consumption(
            windowed_average,
            config.target_average_limit_percent,
        ),
        sample_count: in_window.len(),
    }
}

/// First degrade condition that holds before the look-ahead slide is tried
fn degrade_reason(
    config: &WindowConfig,
    samples_in_window: usize,
    is_startup_period: bool,
) -> Option<DegradeReason> {
    if config.step_length_secs >= config.window_length_secs {
        Some(DegradeReason::StepNotShorterThanWindow)
    } else if samples_in_window < 2 {
        Some(DegradeReason::TooFewSamples)
    } else if is_startup_period && !config.allow_lookahead_during_startup {
        Some(DegradeReason::StartupPeriod)
    } else {
        None
    }
}

/// Startup factor while history is short, the regular factor otherwise
pub fn select_safety_factor(config: &WindowConfig, is_startup_period: bool) -> f64 {
    if is_startup_period {
        config.startup_safety_factor
    } else {
        config.safety_factor
    }
}

/// Clamp into `[min, max]` without panicking on inverted or non-finite bounds.
/// Inverted bounds collapse to `min`; NaN values map to `min`.
pub fn clamp_percent(value: f64, min: f64, max: f64) -> f64 {
    let lo = if min.is_finite() { min.clamp(0.0, 100.0) } else { 0.0 };
    let hi = if max.is_finite() { max.clamp(lo, 100.0) } else { 100.0 };

    if value.is_nan() {
        return lo;
    }
    value.max(lo).min(hi)
}

fn quota_state(
    windowed_average: f64,
    elapsed_minutes: f64,
    config: &WindowConfig,
    recommended: f64,
    is_startup_period: bool,
    algorithm: Algorithm,
) -> QuotaState {
    let window_minutes = config.window_minutes();
    let target = config.target_average_limit_percent;

    let total_quota = target * window_minutes;
    let used_quota = windowed_average * elapsed_minutes;
    let remaining_quota = total_quota - used_quota;
    let remaining_minutes = (window_minutes - elapsed_minutes).max(0.0);

    let target_cpu_percent = if remaining_minutes > 0.0 {
        (remaining_quota / remaining_minutes).clamp(0.0, 100.0)
    } else if remaining_quota >= 0.0 {
        target
    } else {
        0.0
    };

    QuotaState {
        windowed_average_percent: windowed_average,
        total_quota,
        used_quota,
        remaining_quota,
        elapsed_minutes,
        remaining_minutes,
        target_cpu_percent,
        recommended_limit_percent: recommended,
        is_startup_period,
        algorithm_used: algorithm,
    }
}
