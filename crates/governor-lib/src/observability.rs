//! Observability for the governor
//!
//! Provides:
//! - Prometheus metrics (limits, window average, cycle outcomes, cycle latency)
//! - Structured JSON logging with tracing

use crate::controller::ControllerMode;
use crate::models::Algorithm;
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for adjustment cycle latency (in seconds)
const CYCLE_LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<GovernorMetricsInner> = OnceLock::new();

struct GovernorMetricsInner {
    recommended_limit_percent: Gauge,
    final_limit_percent: Gauge,
    applied_limit_percent: Gauge,
    window_average_percent: Gauge,
    reserved_percent: Gauge,
    remaining_quota: Gauge,
    enforcing: IntGauge,
    cycles_total: IntCounterVec,
    skipped_cycles_total: IntCounterVec,
    apply_failures_total: IntCounter,
    processes_assimilated_total: IntCounter,
    samples_collected_total: IntCounter,
    cycle_latency_seconds: Histogram,
}

impl GovernorMetricsInner {
    fn new() -> Self {
        Self {
            recommended_limit_percent: register_gauge!(
                "quota_governor_recommended_limit_percent",
                "CPU limit recommended by the decision engine"
            )
            .expect("Failed to register recommended_limit_percent"),

            final_limit_percent: register_gauge!(
                "quota_governor_final_limit_percent",
                "CPU limit after time-slot reservations"
            )
            .expect("Failed to register final_limit_percent"),

            applied_limit_percent: register_gauge!(
                "quota_governor_applied_limit_percent",
                "CPU limit currently held by the resource controller"
            )
            .expect("Failed to register applied_limit_percent"),

            window_average_percent: register_gauge!(
                "quota_governor_window_average_percent",
                "Floored average CPU usage over the trailing window"
            )
            .expect("Failed to register window_average_percent"),

            reserved_percent: register_gauge!(
                "quota_governor_reserved_percent",
                "CPU percentage withheld for upcoming time slots"
            )
            .expect("Failed to register reserved_percent"),

            remaining_quota: register_gauge!(
                "quota_governor_remaining_quota",
                "Quota left in the current window (percent-minutes)"
            )
            .expect("Failed to register remaining_quota"),

            enforcing: register_int_gauge!(
                "quota_governor_enforcing",
                "1 when limits are written to the kernel, 0 in monitor-only mode"
            )
            .expect("Failed to register enforcing"),

            cycles_total: register_int_counter_vec!(
                "quota_governor_cycles_total",
                "Completed adjustment cycles by algorithm",
                &["algorithm"]
            )
            .expect("Failed to register cycles_total"),

            skipped_cycles_total: register_int_counter_vec!(
                "quota_governor_skipped_cycles_total",
                "Adjustment cycles skipped before a decision",
                &["reason"]
            )
            .expect("Failed to register skipped_cycles_total"),

            apply_failures_total: register_int_counter!(
                "quota_governor_apply_failures_total",
                "Failed attempts to apply a CPU limit"
            )
            .expect("Failed to register apply_failures_total"),

            processes_assimilated_total: register_int_counter!(
                "quota_governor_processes_assimilated_total",
                "Processes moved into the governed group"
            )
            .expect("Failed to register processes_assimilated_total"),

            samples_collected_total: register_int_counter!(
                "quota_governor_samples_collected_total",
                "Host CPU samples recorded"
            )
            .expect("Failed to register samples_collected_total"),

            cycle_latency_seconds: register_histogram!(
                "quota_governor_cycle_latency_seconds",
                "Time spent in one adjustment cycle",
                CYCLE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),
        }
    }
}

/// Handle to the global governor metrics; clones share the same metrics
#[derive(Clone)]
pub struct GovernorMetrics {
    _private: (),
}

impl Default for GovernorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GovernorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(GovernorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &GovernorMetricsInner {
        GLOBAL_METRICS.get_or_init(GovernorMetricsInner::new)
    }

    /// Record the outcome of a completed adjustment cycle
    pub fn record_cycle(
        &self,
        algorithm: Algorithm,
        recommended: f64,
        final_limit: f64,
        window_average: f64,
        reserved: f64,
        remaining_quota: f64,
        duration_secs: f64,
    ) {
        let inner = self.inner();
        inner
            .cycles_total
            .with_label_values(&[algorithm.as_str()])
            .inc();
        inner.recommended_limit_percent.set(recommended);
        inner.final_limit_percent.set(final_limit);
        inner.window_average_percent.set(window_average);
        inner.reserved_percent.set(reserved);
        inner.remaining_quota.set(remaining_quota);
        inner.cycle_latency_seconds.observe(duration_secs);
    }

    pub fn set_applied_limit(&self, percent: f64) {
        self.inner().applied_limit_percent.set(percent);
    }

    pub fn set_enforcing(&self, enforcing: bool) {
        self.inner().enforcing.set(i64::from(enforcing));
    }

    pub fn inc_skipped_cycle(&self, reason: &str) {
        self.inner()
            .skipped_cycles_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_apply_failures(&self) {
        self.inner().apply_failures_total.inc();
    }

    pub fn add_processes_assimilated(&self, count: u64) {
        self.inner().processes_assimilated_total.inc_by(count);
    }

    pub fn inc_samples_collected(&self) {
        self.inner().samples_collected_total.inc();
    }
}

/// Structured logger for governor lifecycle events
#[derive(Clone)]
pub struct GovernorLogger {
    node_name: String,
}

impl GovernorLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_startup(&self, version: &str, window_secs: u64, target_percent: f64) {
        info!(
            event = "governor_started",
            node = %self.node_name,
            governor_version = %version,
            window_secs = window_secs,
            target_percent = target_percent,
            "Quota governor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "governor_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Quota governor shutting down, leaving the applied limit in place"
        );
    }

    pub fn log_mode(&self, mode: &ControllerMode) {
        match mode {
            ControllerMode::Enforcing => info!(
                event = "controller_mode",
                node = %self.node_name,
                enforcing = true,
                "CPU limits are enforced"
            ),
            ControllerMode::MonitorOnly { reason } => warn!(
                event = "controller_mode",
                node = %self.node_name,
                enforcing = false,
                reason = %reason,
                "Running monitor-only, limits are advisory"
            ),
        }
    }

    pub fn log_skipped_cycle(&self, reason: &str, error: &str) {
        warn!(
            event = "cycle_skipped",
            node = %self.node_name,
            reason = %reason,
            error = %error,
            "Adjustment cycle skipped, previous limit retained"
        );
    }

    pub fn log_config_reload(&self, source: &str, error: Option<&str>) {
        match error {
            None => info!(
                event = "config_reloaded",
                node = %self.node_name,
                source = %source,
                "Configuration reloaded"
            ),
            Some(error) => warn!(
                event = "config_rejected",
                node = %self.node_name,
                source = %source,
                error = %error,
                "Configuration rejected, previous settings stay in force"
            ),
        }
    }
}
