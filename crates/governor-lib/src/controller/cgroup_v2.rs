//! cgroup v2 CPU enforcement
//!
//! Works on the unified hierarchy:
//! - cgroup.controllers / cgroup.subtree_control at the root to enable `cpu`
//! - cpu.max in the governed group, `"<quota_us> <period_us>"` or `"max <period_us>"`
//! - cgroup.procs in the governed group for process membership

use super::{ApplyOutcome, ControllerError, ControllerMode, ResourceController, SyncReport, LIMIT_EPSILON};
use crate::models::AppliedLimit;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Fixed CFS period (100ms)
pub const DEFAULT_PERIOD_US: u64 = 100_000;

/// Smallest quota written; the kernel rejects values below 1ms
pub const MIN_QUOTA_US: u64 = 1_000;

const ESRCH: i32 = 3;

/// Parsed `cpu.max` contents. `quota_us == None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMax {
    pub quota_us: Option<u64>,
    pub period_us: u64,
}

impl CpuMax {
    /// Quota for `percent` of `cpu_cores` cores at the default period
    pub fn from_percent(percent: f64, cpu_cores: u32) -> Self {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let cores = cpu_cores.max(1) as f64;
        let quota = (percent / 100.0 * DEFAULT_PERIOD_US as f64 * cores).round() as u64;

        Self {
            quota_us: Some(quota.max(MIN_QUOTA_US)),
            period_us: DEFAULT_PERIOD_US,
        }
    }

    pub fn parse(content: &str) -> Result<Self, ControllerError> {
        let malformed = || ControllerError::MalformedCpuMax(content.trim().to_string());

        let mut parts = content.split_whitespace();
        let quota = parts.next().ok_or_else(malformed)?;
        let period_us = match parts.next() {
            Some(p) => p.parse::<u64>().map_err(|_| malformed())?,
            None => DEFAULT_PERIOD_US,
        };
        if parts.next().is_some() || period_us == 0 {
            return Err(malformed());
        }

        let quota_us = match quota {
            "max" => None,
            q => Some(q.parse::<u64>().map_err(|_| malformed())?),
        };

        Ok(Self {
            quota_us,
            period_us,
        })
    }

    /// Share of `cpu_cores` cores this value allows, in percent
    pub fn percent(&self, cpu_cores: u32) -> f64 {
        match self.quota_us {
            None => 100.0,
            Some(quota) => {
                let capacity = self.period_us as f64 * cpu_cores.max(1) as f64;
                (quota as f64 / capacity * 100.0).min(100.0)
            }
        }
    }
}

impl fmt::Display for CpuMax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.quota_us {
            Some(quota) => write!(f, "{} {}", quota, self.period_us),
            None => write!(f, "max {}", self.period_us),
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    mode: Option<ControllerMode>,
    applied: Option<AppliedLimit>,
}

/// Enforces CPU limits on a dedicated cgroup v2 group
pub struct CgroupController {
    cgroup_root: PathBuf,
    group_path: PathBuf,
    proc_root: PathBuf,
    cpu_cores: u32,
    /// Bookkeeping only; never held across an await
    state: Mutex<ControllerState>,
    /// Held around each kernel write, never around /proc scans
    write_lock: tokio::sync::Mutex<()>,
    enforcing: AtomicBool,
}

impl CgroupController {
    /// Controller for the group `name` under `cgroup_root`
    pub fn new(cgroup_root: impl Into<PathBuf>, name: &str) -> Self {
        let cgroup_root = cgroup_root.into();
        Self {
            group_path: cgroup_root.join(name.trim_matches('/')),
            cgroup_root,
            proc_root: PathBuf::from("/proc"),
            cpu_cores: 1,
            state: Mutex::new(ControllerState::default()),
            write_lock: tokio::sync::Mutex::new(()),
            enforcing: AtomicBool::new(false),
        }
    }

    /// Use a custom proc path (for testing)
    pub fn with_proc_path(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    /// Scale quotas by the number of cores a 100% limit stands for
    pub fn with_cpu_cores(mut self, cpu_cores: u32) -> Self {
        self.cpu_cores = cpu_cores.max(1);
        self
    }

    pub fn group_path(&self) -> &Path {
        &self.group_path
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Limit currently in force according to the kernel
    pub async fn read_cpu_max(&self) -> Result<f64, ControllerError> {
        let path = self.group_path.join("cpu.max");
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ControllerError::io("read", &path, e))?;
        Ok(CpuMax::parse(&content)?.percent(self.cpu_cores))
    }

    /// Steps that must all succeed for enforcement; the error is the reason
    /// recorded for monitor-only mode
    async fn prepare(&self) -> Result<(), String> {
        let controllers_file = self.cgroup_root.join("cgroup.controllers");
        let controllers = fs::read_to_string(&controllers_file).await.map_err(|e| {
            format!(
                "cgroup v2 not available at {}: {}",
                self.cgroup_root.display(),
                e
            )
        })?;
        if !has_controller(&controllers, "cpu") {
            return Err("cpu controller is not available in cgroup.controllers".to_string());
        }

        fs::create_dir_all(&self.group_path).await.map_err(|e| {
            format!("cannot create {}: {}", self.group_path.display(), e)
        })?;

        let subtree_file = self.cgroup_root.join("cgroup.subtree_control");
        let subtree = fs::read_to_string(&subtree_file)
            .await
            .map_err(|e| format!("cannot read {}: {}", subtree_file.display(), e))?;
        if !has_controller(&subtree, "cpu") {
            fs::write(&subtree_file, "+cpu")
                .await
                .map_err(|e| format!("cannot enable cpu controller: {}", e))?;
            info!(path = %subtree_file.display(), "Enabled cpu controller for child groups");
        }

        let cpu_max = self.group_path.join("cpu.max");
        if fs::metadata(&cpu_max).await.is_err() {
            return Err(format!("{} is missing", cpu_max.display()));
        }

        Ok(())
    }

    async fn member_pids(&self) -> Result<HashSet<u32>, ControllerError> {
        let path = self.group_path.join("cgroup.procs");
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(content
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashSet::new()),
            Err(e) => Err(ControllerError::io("read", &path, e)),
        }
    }

    async fn write_cpu_max(&self, value: CpuMax) -> Result<(), ControllerError> {
        let path = self.group_path.join("cpu.max");
        let expected = value.to_string();

        fs::write(&path, format!("{}\n", expected))
            .await
            .map_err(|e| ControllerError::io("write", &path, e))?;

        let found = fs::read_to_string(&path)
            .await
            .map_err(|e| ControllerError::io("read back", &path, e))?;
        let matches = CpuMax::parse(&found).map(|v| v == value).unwrap_or(false);
        if !matches {
            return Err(ControllerError::VerificationFailed {
                expected,
                found: found.trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl ResourceController for CgroupController {
    async fn setup(&self) -> ControllerMode {
        let _write = self.write_lock.lock().await;
        let settled = self.state().mode.clone();
        if let Some(mode) = settled {
            return mode;
        }

        let mode = match self.prepare().await {
            Ok(()) => {
                info!(
                    group = %self.group_path.display(),
                    cpu_cores = self.cpu_cores,
                    "cgroup v2 CPU enforcement ready"
                );
                ControllerMode::Enforcing
            }
            Err(reason) => {
                warn!(
                    group = %self.group_path.display(),
                    reason = %reason,
                    "CPU limits cannot be enforced, running monitor-only"
                );
                ControllerMode::MonitorOnly { reason }
            }
        };

        self.enforcing.store(mode.is_enforcing(), Ordering::SeqCst);
        self.state().mode = Some(mode.clone());
        mode
    }

    async fn sync_processes(&self) -> Result<SyncReport, ControllerError> {
        if !self.is_enforcing() {
            return Ok(SyncReport::default());
        }

        let members = self.member_pids().await?;
        let procs_file = self.group_path.join("cgroup.procs");

        let mut entries = fs::read_dir(&self.proc_root)
            .await
            .map_err(|e| ControllerError::io("list", &self.proc_root, e))?;

        let mut report = SyncReport::default();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(ControllerError::io("list", &self.proc_root, e)),
            };
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };

            report.scanned += 1;
            if members.contains(&pid) {
                report.already_member += 1;
                continue;
            }

            match fs::read(entry.path().join("cmdline")).await {
                Ok(cmdline) if cmdline.is_empty() => {
                    report.kernel_threads += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) if is_vanished(&e) => {
                    report.vanished += 1;
                    continue;
                }
                Err(e) => {
                    debug!(pid, error = %e, "Cannot inspect process");
                    report.rejected += 1;
                    continue;
                }
            }

            let written = {
                let _write = self.write_lock.lock().await;
                write_pid(&procs_file, pid).await
            };
            match written {
                Ok(()) => report.assimilated += 1,
                Err(e) if is_vanished(&e) => report.vanished += 1,
                Err(e) => {
                    debug!(pid, error = %e, "Kernel refused process move");
                    report.rejected += 1;
                }
            }
        }

        Ok(report)
    }

    async fn apply_limit(&self, percent: f64) -> Result<ApplyOutcome, ControllerError> {
        if !percent.is_finite() {
            return Err(ControllerError::InvalidLimit(percent));
        }
        let percent = percent.clamp(0.0, 100.0);

        // serializes concurrent applies so the epsilon check sees the last write
        let _write = self.write_lock.lock().await;
        let current = self.state().applied.clone();
        if let Some(current) = current {
            if (current.percent - percent).abs() < LIMIT_EPSILON {
                return Ok(ApplyOutcome::Unchanged(current));
            }
        }

        if !self.is_enforcing() {
            let limit = AppliedLimit {
                percent,
                applied_at: Utc::now(),
                enforcing: false,
            };
            self.state().applied = Some(limit.clone());
            return Ok(ApplyOutcome::Advisory(limit));
        }

        let value = CpuMax::from_percent(percent, self.cpu_cores);
        self.write_cpu_max(value).await?;

        let limit = AppliedLimit {
            percent,
            applied_at: Utc::now(),
            enforcing: true,
        };
        debug!(cpu_max = %value, percent = percent, "Wrote cpu.max");
        self.state().applied = Some(limit.clone());
        Ok(ApplyOutcome::Applied(limit))
    }

    fn is_enforcing(&self) -> bool {
        self.enforcing.load(Ordering::SeqCst)
    }

    async fn applied_limit(&self) -> Option<AppliedLimit> {
        self.state().applied.clone()
    }

    async fn mode(&self) -> ControllerMode {
        self.state()
            .mode
            .clone()
            .unwrap_or_else(|| ControllerMode::MonitorOnly {
                reason: "controller has not been set up".to_string(),
            })
    }
}

fn has_controller(list: &str, name: &str) -> bool {
    list.split_whitespace()
        .any(|c| c.trim_start_matches('+') == name)
}

fn is_vanished(error: &std::io::Error) -> bool {
    error.kind() == ErrorKind::NotFound || error.raw_os_error() == Some(ESRCH)
}

async fn write_pid(procs_file: &Path, pid: u32) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().append(true).open(procs_file).await?;
    file.write_all(format!("{}\n", pid).as_bytes()).await?;
    file.flush().await
}
