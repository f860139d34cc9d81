//! /proc based host sampler
//!
//! Reads:
//! - /proc/stat aggregate `cpu` line; usage is the busy share of the delta
//!   between two readings
//! - /proc/meminfo for `memory_percent` (ancillary)

use super::CpuSampler;
use crate::models::Sample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// Aggregate CPU times from the first line of /proc/stat (clock ticks)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn parse(content: &str) -> Result<Self> {
        let line = content
            .lines()
            .find(|l| l.starts_with("cpu "))
            .context("no aggregate cpu line in /proc/stat")?;

        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .map(|f| f.parse::<u64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("malformed cpu line '{}'", line))?;
        if fields.len() < 4 {
            anyhow::bail!("cpu line has {} fields, expected at least 4", fields.len());
        }

        let field = |i: usize| fields.get(i).copied().unwrap_or(0);
        Ok(Self {
            user: field(0),
            nice: field(1),
            system: field(2),
            idle: field(3),
            iowait: field(4),
            irq: field(5),
            softirq: field(6),
            steal: field(7),
        })
    }

    /// Guest time is already included in user/nice
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_time(&self) -> u64 {
        self.idle + self.iowait
    }

    /// Busy percentage between `previous` and `self`. `None` when no time
    /// passed or the counters went backwards.
    pub fn busy_percent_since(&self, previous: &CpuTimes) -> Option<f64> {
        let total = self.total().checked_sub(previous.total())?;
        let idle = self.idle_time().checked_sub(previous.idle_time())?;
        if total == 0 {
            return None;
        }
        let busy = total.saturating_sub(idle);
        Some((busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
    }
}

/// Memory totals from /proc/meminfo (kB)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemInfo {
    pub fn parse(content: &str) -> Option<Self> {
        let mut total = None;
        let mut available = None;
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next().and_then(|v| v.parse::<u64>().ok())) {
                (Some("MemTotal:"), Some(v)) => total = Some(v),
                (Some("MemAvailable:"), Some(v)) => available = Some(v),
                _ => {}
            }
        }
        Some(Self {
            total_kb: total?,
            available_kb: available?,
        })
    }

    pub fn used_percent(&self) -> Option<f64> {
        if self.total_kb == 0 {
            return None;
        }
        let used = self.total_kb.saturating_sub(self.available_kb);
        Some(used as f64 / self.total_kb as f64 * 100.0)
    }
}

/// Samples host CPU usage from /proc
pub struct ProcStatSampler {
    proc_root: PathBuf,
    previous: Mutex<Option<CpuTimes>>,
}

impl Default for ProcStatSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcStatSampler {
    pub fn new() -> Self {
        Self::with_proc_path("/proc")
    }

    /// Create sampler with custom proc path (for testing)
    pub fn with_proc_path(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            previous: Mutex::new(None),
        }
    }

    async fn read_memory_percent(&self) -> Option<f64> {
        let content = fs::read_to_string(self.proc_root.join("meminfo")).await.ok()?;
        MemInfo::parse(&content)?.used_percent()
    }
}

#[async_trait]
impl CpuSampler for ProcStatSampler {
    async fn sample(&self) -> Result<Option<Sample>> {
        let path = self.proc_root.join("stat");
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let current = CpuTimes::parse(&content)?;

        let previous = self.previous.lock().await.replace(current);
        let Some(previous) = previous else {
            debug!("Established /proc/stat baseline");
            return Ok(None);
        };
        let Some(cpu_percent) = current.busy_percent_since(&previous) else {
            return Ok(None);
        };

        let mut sample = Sample::new(Utc::now(), cpu_percent);
        if let Some(memory) = self.read_memory_percent().await {
            sample = sample.with_aux("memory_percent", memory);
        }
        Ok(Some(sample))
    }
}
