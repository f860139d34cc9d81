//! Governor control loop
//!
//! Two independent timers drive the governor:
//! - adjustment, every `step_length`: snapshot the configuration, read the
//!   window's samples, decide, subtract reservations, apply, then publish
//!   status, log entry, metrics and health
//! - process sync, every `process_sync_interval`: move new processes into
//!   the governed group
//!
//! A failed query or kernel write skips that cycle's apply; the previously
//! applied limit stays in force. Shutdown leaves the applied limit in place.


use crate::config::ConfigStore;
use crate::controller::{ApplyOutcome, ControllerError, ControllerMode, ResourceController, SyncReport};
use crate::engine::{self, Decision};
use crate::health::{components, HealthRegistry};
use crate::models::{GovernorStatus, LogCategory, LogLevel, SchedulerLogEntry};
use crate::observability::{GovernorLogger, GovernorMetrics};
use crate::reservation;
use crate::sink::LogSink;
use crate::store::SampleStore;
use crate::window::window_start;
use anyhow::Result;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timing of the control loop
#[derive(Debug, Clone)]
pub struct ControlLoopConfig {
    /// Process membership pass cadence (default: 60 seconds)
    pub process_sync_interval: Duration,
    /// Bound on each sample store query (default: 2 seconds)
    pub query_timeout: Duration,
    /// How long shutdown waits for the timers before aborting them
    pub shutdown_grace: Duration,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            process_sync_interval: Duration::from_secs(60),
            query_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Why an adjustment cycle ended before a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    QueryTimeout,
    QueryFailed(String),
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::QueryTimeout => "query_timeout",
            SkipReason::QueryFailed(_) => "query_failed",
        }
    }
}

/// Result of one adjustment cycle
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// A limit was decided and applied (or recorded, or already in force)
    Completed(Box<GovernorStatus>),
    /// The limit was decided but the kernel write failed
    ApplyFailed {
        status: Box<GovernorStatus>,
        error: String,
    },
    Skipped(SkipReason),
}

impl CycleOutcome {
    pub fn status(&self) -> Option<&GovernorStatus> {
        match self {
            CycleOutcome::Completed(status) | CycleOutcome::ApplyFailed { status, .. } => {
                Some(status)
            }
            CycleOutcome::Skipped(_) => None,
        }
    }
}

struct ControlInner {
    config: ConfigStore,
    samples: Arc<dyn SampleStore>,
    controller: Arc<dyn ResourceController>,
    sink: Arc<dyn LogSink>,
    health: HealthRegistry,
    metrics: GovernorMetrics,
    logger: GovernorLogger,
    timing: ControlLoopConfig,
    status_tx: watch::Sender<Option<GovernorStatus>>,
}

/// Handle to the control loop; clones share the same state
#[derive(Clone)]
pub struct ControlLoop {
    inner: Arc<ControlInner>,
}

impl ControlLoop {
    pub fn builder() -> ControlLoopBuilder {
        ControlLoopBuilder::new()
    }

    /// Latest published status, `None` before the first completed cycle
    pub fn latest_status(&self) -> Option<GovernorStatus> {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Option<GovernorStatus>> {
        self.inner.status_tx.subscribe()
    }

    /// Set up the controller and report its mode. Idempotent.
    pub async fn start(&self) -> ControllerMode {
        let inner = &self.inner;
        for name in components::ALL {
            if inner.health.get(name).await.is_none() {
                inner.health.register(name).await;
            }
        }

        let mode = inner.controller.setup().await;
        match &mode {
            ControllerMode::Enforcing => inner.health.set_healthy(components::CONTROLLER).await,
            ControllerMode::MonitorOnly { reason } => {
                inner
                    .health
                    .set_degraded(components::CONTROLLER, format!("monitor-only: {}", reason))
                    .await
            }
        }
        inner.metrics.set_enforcing(mode.is_enforcing());
        inner.logger.log_mode(&mode);

        inner.sink.append(
            SchedulerLogEntry::new(
                LogCategory::System,
                if mode.is_enforcing() {
                    LogLevel::Info
                } else {
                    LogLevel::Warning
                },
                match &mode {
                    ControllerMode::Enforcing => "CPU limits are enforced".to_string(),
                    ControllerMode::MonitorOnly { reason } => {
                        format!("Running monitor-only: {}", reason)
                    }
                },
            )
            .with_details(json!({ "mode": mode })),
        );

        inner.health.set_ready(true).await;
        mode
    }

    /// Run both timers until `shutdown` fires, then stop them within the
    /// grace period
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        self.start().await;

        let adjustment = tokio::spawn(self.clone().adjustment_task(shutdown.resubscribe()));
        let process_sync = tokio::spawn(self.clone().sync_task(shutdown.resubscribe()));

        // a closed channel means the owner is gone; stop as well
        let _ = shutdown.recv().await;
        self.inner.logger.log_shutdown("shutdown signal received");
        self.inner.health.set_ready(false).await;

        self.join_within_grace("adjustment", adjustment).await;
        self.join_within_grace("process_sync", process_sync).await;
    }

    async fn join_within_grace(&self, task: &str, handle: JoinHandle<()>) {
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.inner.timing.shutdown_grace, handle).await {
            Ok(Ok(())) => debug!(task, "Task stopped"),
            Ok(Err(e)) => warn!(task, error = %e, "Task ended abnormally"),
            Err(_) => {
                warn!(task, "Task did not stop within the grace period, aborting");
                abort.abort();
            }
        }
    }

    async fn adjustment_task(self, mut shutdown: broadcast::Receiver<()>) {
        let mut step = self.inner.config.snapshot().window.step_length();
        info!(step_secs = step.as_secs(), "Starting adjustment loop");

        let mut ticker = interval(step);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_adjustment_cycle().await;

                    let next = self.inner.config.snapshot().window.step_length();
                    if next != step {
                        info!(
                            old_step_secs = step.as_secs(),
                            new_step_secs = next.as_secs(),
                            "Step length changed, re-arming adjustment timer"
                        );
                        step = next;
                        ticker = interval_at(Instant::now() + step, step);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down adjustment loop");
                    break;
                }
            }
        }
    }

    async fn sync_task(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.inner.timing.process_sync_interval;
        info!(interval_secs = period.as_secs(), "Starting process sync loop");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.run_sync_cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down process sync loop");
                    break;
                }
            }
        }
    }

    /// One adjustment cycle at the current time
    pub async fn run_adjustment_cycle(&self) -> CycleOutcome {
        self.adjust_at(Utc::now(), Local::now().naive_local()).await
    }

    /// One adjustment cycle. `now` anchors the window; `local_now` is the
    /// wall-clock time reservations are matched against.
    pub(crate) async fn adjust_at(&self, now: DateTime<Utc>, local_now: NaiveDateTime) -> CycleOutcome {
        let inner = &self.inner;
        let started = Instant::now();
        let settings = inner.config.snapshot();
        let window = &settings.window;

        let since = window_start(now, window.window_length());
        let query = tokio::time::timeout(inner.timing.query_timeout, inner.samples.query(since, now));
        let samples = match query.await {
            Ok(Ok(samples)) => samples,
            Ok(Err(e)) => return self.skip(SkipReason::QueryFailed(format!("{:#}", e))).await,
            Err(_) => return self.skip(SkipReason::QueryTimeout).await,
        };

        let decision = engine::decide(&samples, now, window);
        let reserved = reservation::resolve(local_now, &settings.time_slots, window.window_length());
        let final_limit = reservation::apply_reservation(
            decision.recommended(),
            reserved,
            window.min_load_percent,
            window.max_load_percent,
        );

        let limit_before = inner.controller.applied_limit().await.map(|l| l.percent);
        let applied = inner.controller.apply_limit(final_limit).await;

        let mode = inner.controller.mode().await;
        let status = GovernorStatus {
            current_percent: samples.last().map(|s| s.cpu_percent),
            windowed_average_percent: decision.quota.windowed_average_percent,
            recommended_limit: decision.recommended(),
            final_limit,
            applied_limit: inner.controller.applied_limit().await,
            is_enforcing: inner.controller.is_enforcing(),
            monitor_reason: mode.monitor_reason().map(str::to_string),
            remaining_quota: decision.quota.remaining_quota,
            reserved_percent: reserved,
            risk_level: decision.risk_level,
            algorithm_used: decision.algorithm(),
            degrade_reason: decision.degrade_reason(),
            is_startup_period: decision.quota.is_startup_period,
            updated_at: now,
        };

        let details = decision_details(&decision, reserved, final_limit, status.is_enforcing);
        let outcome = match applied {
            Ok(result) => {
                let (level, message) = match &result {
                    ApplyOutcome::Unchanged(_) => (LogLevel::Debug, "CPU limit unchanged"),
                    ApplyOutcome::Applied(_) => (LogLevel::Info, "CPU limit adjusted"),
                    ApplyOutcome::Advisory(_) => {
                        (LogLevel::Info, "CPU limit recorded (monitor-only)")
                    }
                };
                inner.sink.append(
                    SchedulerLogEntry::new(LogCategory::LimitAdjustment, level, message)
                        .with_limits(limit_before, Some(result.limit().percent))
                        .with_details(details),
                );
                inner.metrics.set_applied_limit(result.limit().percent);
                inner.health.set_healthy(components::ADJUSTMENT).await;
                CycleOutcome::Completed(Box::new(status.clone()))
            }
            Err(e) => {
                let error = e.to_string();
                inner.metrics.inc_apply_failures();
                inner.sink.append(
                    SchedulerLogEntry::new(
                        LogCategory::LimitAdjustment,
                        LogLevel::Error,
                        format!("Failed to apply CPU limit: {}", error),
                    )
                    .with_limits(limit_before, limit_before)
                    .with_details(details),
                );
                inner
                    .health
                    .set_degraded(components::ADJUSTMENT, format!("apply failed: {}", error))
                    .await;
                CycleOutcome::ApplyFailed {
                    status: Box::new(status.clone()),
                    error,
                }
            }
        };

        inner.metrics.record_cycle(
            decision.algorithm(),
            decision.recommended(),
            final_limit,
            decision.quota.windowed_average_percent,
            reserved,
            decision.quota.remaining_quota,
            started.elapsed().as_secs_f64(),
        );
        inner.status_tx.send_replace(Some(status));

        outcome
    }

    async fn skip(&self, reason: SkipReason) -> CycleOutcome {
        let inner = &self.inner;
        let error = match &reason {
            SkipReason::QueryTimeout => format!(
                "sample query exceeded {}ms",
                inner.timing.query_timeout.as_millis()
            ),
            SkipReason::QueryFailed(e) => e.clone(),
        };

        inner.logger.log_skipped_cycle(reason.as_str(), &error);
        inner.metrics.inc_skipped_cycle(reason.as_str());
        inner
            .health
            .set_degraded(components::ADJUSTMENT, format!("cycle skipped: {}", error))
            .await;

        CycleOutcome::Skipped(reason)
    }

    /// One process membership pass
    pub async fn run_sync_cycle(&self) -> Result<SyncReport, ControllerError> {
        let inner = &self.inner;
        match inner.controller.sync_processes().await {
            Ok(report) => {
                if report.is_notable() {
                    let level = if report.rejected > 0 {
                        LogLevel::Warning
                    } else {
                        LogLevel::Info
                    };
                    inner.sink.append(
                        SchedulerLogEntry::new(
                            LogCategory::ProcessSync,
                            level,
                            format!(
                                "Moved {} process(es) into the governed group, {} rejected",
                                report.assimilated, report.rejected
                            ),
                        )
                        .with_details(json!(report)),
                    );
                }
                inner
                    .metrics
                    .add_processes_assimilated(report.assimilated as u64);
                inner.health.set_healthy(components::PROCESS_SYNC).await;
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "Process sync failed");
                inner.sink.append(SchedulerLogEntry::new(
                    LogCategory::ProcessSync,
                    LogLevel::Error,
                    format!("Process sync failed: {}", e),
                ));
                inner
                    .health
                    .set_degraded(components::PROCESS_SYNC, e.to_string())
                    .await;
                Err(e)
            }
        }
    }
}

fn decision_details(
    decision: &Decision,
    reserved: f64,
    final_limit: f64,
    enforcing: bool,
) -> serde_json::Value {
    json!({
        "algorithm": decision.algorithm(),
        "degrade_reason": decision.degrade_reason(),
        "unclamped_limit": decision.unclamped_limit,
        "recommended_limit": decision.recommended(),
        "reserved_percent": reserved,
        "final_limit": final_limit,
        "windowed_average_percent": decision.quota.windowed_average_percent,
        "remaining_quota": decision.quota.remaining_quota,
        "sample_count": decision.sample_count,
        "safety_factor": decision.safety_factor,
        "is_startup_period": decision.quota.is_startup_period,
        "risk_level": decision.risk_level,
        "enforcing": enforcing,
    })
}

/// Builder for the control loop
pub struct ControlLoopBuilder {
    config: Option<ConfigStore>,
    samples: Option<Arc<dyn SampleStore>>,
    controller: Option<Arc<dyn ResourceController>>,
    sink: Option<Arc<dyn LogSink>>,
    health: HealthRegistry,
    node_name: String,
    timing: ControlLoopConfig,
}

impl Default for ControlLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlLoopBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            samples: None,
            controller: None,
            sink: None,
            health: HealthRegistry::new(),
            node_name: "localhost".to_string(),
            timing: ControlLoopConfig::default(),
        }
    }

    pub fn config(mut self, config: ConfigStore) -> Self {
        self.config = Some(config);
        self
    }

    pub fn sample_store(mut self, samples: Arc<dyn SampleStore>) -> Self {
        self.samples = Some(samples);
        self
    }

    pub fn controller(mut self, controller: Arc<dyn ResourceController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn process_sync_interval(mut self, period: Duration) -> Self {
        self.timing.process_sync_interval = period;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.timing.query_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.timing.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> Result<ControlLoop> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("Config store is required"))?;
        let samples = self
            .samples
            .ok_or_else(|| anyhow::anyhow!("Sample store is required"))?;
        let controller = self
            .controller
            .ok_or_else(|| anyhow::anyhow!("Resource controller is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Log sink is required"))?;

        if self.timing.process_sync_interval.is_zero() {
            anyhow::bail!("Process sync interval must be greater than zero");
        }

        let (status_tx, _) = watch::channel(None);
        Ok(ControlLoop {
            inner: Arc::new(ControlInner {
                config,
                samples,
                controller,
                sink,
                health: self.health,
                metrics: GovernorMetrics::new(),
                logger: GovernorLogger::new(self.node_name),
                timing: self.timing,
                status_tx,
            }),
        })
    }
}
