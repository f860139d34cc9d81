//! Governor configuration
//!
//! Window and time-slot settings are validated here; the decision engine
//! assumes validated input.

mod persist;
mod store;

pub use persist::SettingsFile;
pub use store::ConfigStore;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Rejected configuration values
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("load bounds must satisfy 0 <= min ({min}) <= max ({max}) <= 100")]
    InvalidLoadBounds { min: f64, max: f64 },

    #[error("target average limit must be in (0, 100], got {0}")]
    InvalidTarget(f64),

    #[error("{field} must be in (0, 1], got {value}")]
    InvalidSafetyFactor { field: &'static str, value: f64 },

    #[error("startup data threshold fraction must be in [0, 1], got {0}")]
    InvalidStartupThreshold(f64),

    #[error("time slot '{name}': {reason}")]
    InvalidTimeSlot { name: String, reason: String },

    #[error("invalid window update: {0}")]
    InvalidPatch(String),
}

/// Parameters of the windowed average and the limit decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Trailing window the average must respect (seconds)
    pub window_length_secs: u64,
    /// Adjustment cadence and look-ahead step (seconds)
    pub step_length_secs: u64,
    /// Guaranteed baseline; the floor of every recommendation
    pub min_load_percent: f64,
    /// Upper bound of every recommendation
    pub max_load_percent: f64,
    /// Hard ceiling on the windowed average
    pub target_average_limit_percent: f64,
    pub safety_factor: f64,
    /// Used instead of `safety_factor` while history is short
    pub startup_safety_factor: f64,
    /// Fraction of the window that must be covered by data before the
    /// startup period ends
    pub startup_data_threshold_fraction: f64,
    /// Permit the look-ahead algorithm during the startup period. When `true`,
    /// look-ahead runs from the second sample on with `startup_safety_factor`;
    /// when `false`, startup cycles use remaining-quota distribution.
    pub allow_lookahead_during_startup: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_length_secs: 24 * 60 * 60,
            step_length_secs: 15,
            min_load_percent: 10.0,
            max_load_percent: 90.0,
            target_average_limit_percent: 30.0,
            safety_factor: 0.9,
            startup_safety_factor: 0.7,
            startup_data_threshold_fraction: 0.1,
            allow_lookahead_during_startup: false,
        }
    }
}

impl WindowConfig {
    pub fn window_length(&self) -> Duration {
        Duration::from_secs(self.window_length_secs)
    }

    pub fn step_length(&self) -> Duration {
        Duration::from_secs(self.step_length_secs)
    }

    pub fn window_minutes(&self) -> f64 {
        self.window_length_secs as f64 / 60.0
    }

    pub fn step_minutes(&self) -> f64 {
        self.step_length_secs as f64 / 60.0
    }

    /// Check every invariant of the window configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_length_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "window_length_secs",
            });
        }
        if self.step_length_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "step_length_secs",
            });
        }

        let (min, max) = (self.min_load_percent, self.max_load_percent);
        let bounds_ok = min.is_finite() && max.is_finite() && 0.0 <= min && min <= max && max <= 100.0;
        if !bounds_ok {
            return Err(ConfigError::InvalidLoadBounds { min, max });
        }

        let target = self.target_average_limit_percent;
        if !(target.is_finite() && target > 0.0 && target <= 100.0) {
            return Err(ConfigError::InvalidTarget(target));
        }

        check_factor("safety_factor", self.safety_factor)?;
        check_factor("startup_safety_factor", self.startup_safety_factor)?;

        let threshold = self.startup_data_threshold_fraction;
        if !(threshold.is_finite() && (0.0..=1.0).contains(&threshold)) {
            return Err(ConfigError::InvalidStartupThreshold(threshold));
        }

        Ok(())
    }
}

fn check_factor(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidSafetyFactor { field, value })
    }
}

/// A daily interval that requires a guaranteed load
///
/// `end < start` means the slot crosses midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSlotReservation {
    #[serde(default)]
    pub name: String,
    #[serde(with = "time_of_day")]
    pub start: NaiveTime,
    #[serde(with = "time_of_day")]
    pub end: NaiveTime,
    pub required_load_percent: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TimeSlotReservation {
    pub fn new(
        name: impl Into<String>,
        start: NaiveTime,
        end: NaiveTime,
        required_load_percent: f64,
    ) -> Self {
        Self {
            name: name.into(),
            start,
            end,
            required_load_percent,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let load = self.required_load_percent;
        if !(load.is_finite() && (0.0..=100.0).contains(&load)) {
            return Err(ConfigError::InvalidTimeSlot {
                name: self.name.clone(),
                reason: format!("required load must be in [0, 100], got {}", load),
            });
        }
        if self.start == self.end {
            return Err(ConfigError::InvalidTimeSlot {
                name: self.name.clone(),
                reason: "start and end are identical".to_string(),
            });
        }
        Ok(())
    }
}

/// Immutable snapshot read by the control loop at the start of each cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GovernorSettings {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub time_slots: Vec<TimeSlotReservation>,
}

impl GovernorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window.validate()?;
        for slot in &self.time_slots {
            slot.validate()?;
        }
        Ok(())
    }
}

/// `HH:MM` (or `HH:MM:SS`) time-of-day encoding
mod time_of_day {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(|e| de::Error::custom(format!("invalid time of day '{}': {}", raw, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_window_config_is_valid() {
        let config = WindowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_minutes(), 1440.0);
        assert_eq!(config.step_minutes(), 0.25);
    }

    #[test]
    fn test_rejects_min_above_max() {
        let config = WindowConfig {
            min_load_percent: 60.0,
            max_load_percent: 40.0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLoadBounds {
                min: 60.0,
                max: 40.0
            })
        );
    }

    #[test]
    fn test_rejects_bad_safety_factors() {
        let zero = WindowConfig {
            safety_factor: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(ConfigError::InvalidSafetyFactor {
                field: "safety_factor",
                ..
            })
        ));

        let above_one = WindowConfig {
            startup_safety_factor: 1.2,
            ..Default::default()
        };
        assert!(matches!(
            above_one.validate(),
            Err(ConfigError::InvalidSafetyFactor {
                field: "startup_safety_factor",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_zero_durations() {
        let config = WindowConfig {
            step_length_secs: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                field: "step_length_secs"
            })
        );
    }

    #[test]
    fn test_time_slot_deserializes_short_times() {
        let json = r#"{"name": "batch", "start": "22:00", "end": "02:30", "required_load_percent": 40}"#;
        let slot: TimeSlotReservation = serde_json::from_str(json).unwrap();

        assert_eq!(slot.start, NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        assert_eq!(slot.end, NaiveTime::from_hms_opt(2, 30, 0).unwrap());
        assert!(slot.enabled);
        assert!(slot.validate().is_ok());

        let back = serde_json::to_value(&slot).unwrap();
        assert_eq!(back["start"], "22:00");
    }

    #[test]
    fn test_time_slot_rejects_out_of_range_load() {
        let slot = TimeSlotReservation::new(
            "bad",
            NaiveTime::from_hms_opt(1, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            140.0,
        );
        assert!(matches!(
            slot.validate(),
            Err(ConfigError::InvalidTimeSlot { .. })
        ));
    }
}
