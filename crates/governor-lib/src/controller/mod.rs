//! Kernel resource control
//!
//! The control loop talks to the kernel only through `ResourceController`.
//! `CgroupController` enforces limits with a cgroup v2 `cpu.max`; when the
//! host does not allow that it stays in monitor-only mode and keeps the
//! bookkeeping without writing anything.

mod cgroup_v2;


pub use cgroup_v2::{CgroupController, CpuMax, DEFAULT_PERIOD_US, MIN_QUOTA_US};

use crate::models::AppliedLimit;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Limits closer than this to the applied one are not rewritten
pub const LIMIT_EPSILON: f64 = 0.01;

/// Failures of the kernel boundary
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("CPU limit must be a finite percentage, got {0}")]
    InvalidLimit(f64),

    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed cpu.max value '{0}'")]
    MalformedCpuMax(String),

    #[error("cpu.max reads '{found}' after writing '{expected}'")]
    VerificationFailed { expected: String, found: String },
}

impl ControllerError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Whether limits reach the kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ControllerMode {
    Enforcing,
    MonitorOnly { reason: String },
}

impl ControllerMode {
    pub fn is_enforcing(&self) -> bool {
        matches!(self, ControllerMode::Enforcing)
    }

    pub fn monitor_reason(&self) -> Option<&str> {
        match self {
            ControllerMode::Enforcing => None,
            ControllerMode::MonitorOnly { reason } => Some(reason),
        }
    }
}

/// Result of a successful `apply_limit`
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Written to the kernel and verified
    Applied(AppliedLimit),
    /// Within `LIMIT_EPSILON` of the current limit, nothing written
    Unchanged(AppliedLimit),
    /// Monitor-only mode: recorded without a kernel write
    Advisory(AppliedLimit),
}

impl ApplyOutcome {
    pub fn limit(&self) -> &AppliedLimit {
        match self {
            ApplyOutcome::Applied(limit)
            | ApplyOutcome::Unchanged(limit)
            | ApplyOutcome::Advisory(limit) => limit,
        }
    }

    pub fn changed(&self) -> bool {
        !matches!(self, ApplyOutcome::Unchanged(_))
    }
}

/// Counts from one process membership pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub scanned: usize,
    pub already_member: usize,
    pub assimilated: usize,
    /// Exited between enumeration and the membership write
    pub vanished: usize,
    /// Refused by the kernel
    pub rejected: usize,
    pub kernel_threads: usize,
}

impl SyncReport {
    /// Anything worth a process-sync log entry
    pub fn is_notable(&self) -> bool {
        self.assimilated > 0 || self.rejected > 0
    }
}

/// Narrow interface the control loop drives
#[async_trait]
pub trait ResourceController: Send + Sync {
    /// Prepare enforcement. Any failure settles on monitor-only mode; the
    /// returned mode holds for the lifetime of the controller.
    async fn setup(&self) -> ControllerMode;

    /// Move every eligible host process into the controlled group
    async fn sync_processes(&self) -> Result<SyncReport, ControllerError>;

    /// Enforce (or, in monitor-only mode, record) a CPU limit in percent
    async fn apply_limit(&self, percent: f64) -> Result<ApplyOutcome, ControllerError>;

    fn is_enforcing(&self) -> bool;

    async fn applied_limit(&self) -> Option<AppliedLimit>;

    async fn mode(&self) -> ControllerMode;
}
