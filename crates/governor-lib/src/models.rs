//! Core data models for the quota governor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single resource sample recorded by the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    /// Machine-wide CPU usage, 0-100
    pub cpu_percent: f64,
    /// Ancillary metrics (memory, io, ...). Never read by the decision engine.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aux: BTreeMap<String, f64>,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, cpu_percent: f64) -> Self {
        Self {
            timestamp,
            cpu_percent,
            aux: BTreeMap::new(),
        }
    }

    /// Attach an ancillary metric
    pub fn with_aux(mut self, name: impl Into<String>, value: f64) -> Self {
        self.aux.insert(name.into(), value);
        self
    }
}

/// Which limit algorithm produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Sliding-window look-ahead over the next step
    LookAhead,
    /// Remaining-quota distribution over the rest of the window
    Fallback,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::LookAhead => "look_ahead",
            Algorithm::Fallback => "fallback",
        }
    }
}

/// Why the look-ahead algorithm was not used for a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    /// The step is as long as (or longer than) the window
    StepNotShorterThanWindow,
    /// Fewer than two samples in the full window
    TooFewSamples,
    /// Not enough history yet to trust a look-ahead projection
    StartupPeriod,
    /// Nothing left after sliding the window forward by one step
    NothingAfterSlide,
}

impl DegradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradeReason::StepNotShorterThanWindow => "step_not_shorter_than_window",
            DegradeReason::TooFewSamples => "too_few_samples",
            DegradeReason::StartupPeriod => "startup_period",
            DegradeReason::NothingAfterSlide => "nothing_after_slide",
        }
    }
}

/// How close the windowed average sits to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Classify by the fraction of the average budget already consumed
    pub fn from_consumption(windowed_average: f64, target: f64) -> Self {
        if target <= 0.0 || !windowed_average.is_finite() {
            return RiskLevel::Critical;
        }

        let consumed = windowed_average / target;
        if consumed < 0.7 {
            RiskLevel::Low
        } else if consumed < 0.9 {
            RiskLevel::Medium
        } else if consumed < 1.0 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

/// Quota accounting recomputed every adjustment cycle (percent·minutes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaState {
    pub windowed_average_percent: f64,
    pub total_quota: f64,
    pub used_quota: f64,
    pub remaining_quota: f64,
    pub elapsed_minutes: f64,
    pub remaining_minutes: f64,
    /// Average that the rest of the window may run at without breaching the target
    pub target_cpu_percent: f64,
    pub recommended_limit_percent: f64,
    pub is_startup_period: bool,
    pub algorithm_used: Algorithm,
}

/// The limit most recently handed to the resource controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedLimit {
    pub percent: f64,
    pub applied_at: DateTime<Utc>,
    /// False when the limit is advisory only (monitor-only mode)
    pub enforcing: bool,
}

/// Scheduler log categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    LimitAdjustment,
    ProcessSync,
    System,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::LimitAdjustment => "limit_adjustment",
            LogCategory::ProcessSync => "process_sync",
            LogCategory::System => "system",
        }
    }
}

/// Scheduler log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Decision record handed to the log sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerLogEntry {
    pub timestamp: DateTime<Utc>,
    pub category: LogCategory,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_before: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_after: Option<f64>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl SchedulerLogEntry {
    pub fn new(category: LogCategory, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            level,
            message: message.into(),
            limit_before: None,
            limit_after: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_limits(mut self, before: Option<f64>, after: Option<f64>) -> Self {
        self.limit_before = before;
        self.limit_after = after;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Read-only status published after every adjustment cycle
///
/// `recommended_limit` and `applied_limit` diverge in monitor-only mode;
/// `is_enforcing` and `monitor_reason` make that visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorStatus {
    /// Most recent sample, if any
    pub current_percent: Option<f64>,
    pub windowed_average_percent: f64,
    /// Engine output before reservations
    pub recommended_limit: f64,
    /// Limit after reservations, handed to the controller
    pub final_limit: f64,
    pub applied_limit: Option<AppliedLimit>,
    pub is_enforcing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_reason: Option<String>,
    pub remaining_quota: f64,
    pub reserved_percent: f64,
    pub risk_level: RiskLevel,
    pub algorithm_used: Algorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degrade_reason: Option<DegradeReason>,
    pub is_startup_period: bool,
    pub updated_at: DateTime<Utc>,
}
