//! Host CPU sampling
//!
//! A `CpuSampler` turns kernel counters into `Sample`s; the `SamplingLoop`
//! feeds them into the sample store the control loop reads.

mod proc_stat;
mod r#loop;

pub use proc_stat::{CpuTimes, MemInfo, ProcStatSampler};
pub use r#loop::SamplingLoop;

use crate::models::Sample;
use anyhow::Result;
use async_trait::async_trait;

/// Source of machine-wide CPU samples
#[async_trait]
pub trait CpuSampler: Send + Sync {
    /// Take a reading. Delta-based samplers return `None` for the first
    /// reading, which only establishes the baseline.
    async fn sample(&self) -> Result<Option<Sample>>;
}
