//! Remaining-quota fallback
//!
//! The minimum load is reserved for the whole window. Only the quota above
//! it is spread evenly over the minutes the window still has to run.

use crate::config::WindowConfig;

/// Intermediate values of a fallback evaluation (percent·minutes unless noted)
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackDetail {
    pub total_quota: f64,
    pub reserved_quota: f64,
    pub dynamic_quota: f64,
    pub used_total: f64,
    pub used_dynamic: f64,
    pub remaining_dynamic: f64,
    /// Minutes left before the window is full
    pub remaining_minutes: f64,
    /// Percentage available above the minimum load, after the safety factor
    pub dynamic_limit: f64,
}

pub(super) fn compute(
    windowed_average: f64,
    elapsed_minutes: f64,
    config: &WindowConfig,
    safety_factor: f64,
) -> FallbackDetail {
    let window_minutes = config.window_minutes();
    let min_load = config.min_load_percent;

    let total_quota = config.target_average_limit_percent * window_minutes;
    let reserved_quota = min_load * window_minutes;
    let dynamic_quota = total_quota - reserved_quota;

    let used_total = windowed_average * elapsed_minutes;
    let used_reserved = min_load * elapsed_minutes;
    let used_dynamic = (used_total - used_reserved).max(0.0);
    let remaining_dynamic = dynamic_quota - used_dynamic;
    let remaining_minutes = window_minutes - elapsed_minutes;
    let dynamic_limit = if remaining_minutes <= 0.0 {
        0.0
    } else {
        remaining_dynamic / remaining_minutes * safety_factor
    };

    FallbackDetail {
        total_quota,
        reserved_quota,
        dynamic_quota,
        used_total,
        used_dynamic,
        remaining_dynamic,
        remaining_minutes: remaining_minutes.max(0.0),
        dynamic_limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_below_floor_does_not_refund_dynamic_quota() {
        let config = WindowConfig::default();

        let detail = compute(10.0, 600.0, &config, 0.9);

        assert_eq!(detail.used_dynamic, 0.0);
        assert_eq!(detail.remaining_dynamic, detail.dynamic_quota);
    }

    #[test]
    fn test_overspent_window_goes_negative() {
        let config = WindowConfig::default();

        let detail = compute(60.0, 1000.0, &config, 0.9);

        // used 60000 of 43200; 50000 of it dynamic against 28800 available
        assert!((detail.remaining_dynamic - (28800.0 - 50000.0)).abs() < 1e-9);
        assert!(detail.dynamic_limit < 0.0);
    }

    #[test]
    fn test_full_window_leaves_no_dynamic_allowance() {
        let config = WindowConfig::default();

        let detail = compute(20.0, 1440.0, &config, 1.0);

        assert_eq!(detail.remaining_minutes, 0.0);
        assert_eq!(detail.dynamic_limit, 0.0);
        // 28800 - (28800 - 14400)
        assert!((detail.remaining_dynamic - 14400.0).abs() < 1e-9);
    }
}
