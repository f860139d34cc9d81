//! Scheduler log sinks
//!
//! Decision and process-sync records are handed to a `LogSink`. Appending
//! never blocks on I/O and never fails; the control loop does not wait on it.

use crate::models::{LogCategory, LogLevel, SchedulerLogEntry};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Default number of entries kept by `MemoryLogSink`
pub const DEFAULT_LOG_CAPACITY: usize = 500;

pub trait LogSink: Send + Sync {
    fn append(&self, entry: SchedulerLogEntry);
}

/// Renders entries as tracing events at the entry's level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn append(&self, entry: SchedulerLogEntry) {
        let category = entry.category.as_str();
        let details = entry.details.to_string();
        macro_rules! emit {
            ($level:ident) => {
                $level!(
                    event = "scheduler_log",
                    category = category,
                    limit_before = entry.limit_before,
                    limit_after = entry.limit_after,
                    details = %details,
                    "{}",
                    entry.message
                )
            };
        }
        match entry.level {
            LogLevel::Debug => emit!(debug),
            LogLevel::Info => emit!(info),
            LogLevel::Warning => emit!(warn),
            LogLevel::Error => emit!(error),
        }
    }
}

/// Bounded in-memory history, newest last
#[derive(Debug)]
pub struct MemoryLogSink {
    entries: Mutex<VecDeque<SchedulerLogEntry>>,
    capacity: usize,
}

impl Default for MemoryLogSink {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl MemoryLogSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Up to `limit` most recent entries, newest first, optionally filtered
    pub fn recent(&self, limit: usize, category: Option<LogCategory>) -> Vec<SchedulerLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .rev()
            .filter(|e| category.map_or(true, |c| e.category == c))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, entry: SchedulerLogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Forwards every entry to each inner sink
#[derive(Clone, Default)]
pub struct FanoutLogSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutLogSink {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl LogSink for FanoutLogSink {
    fn append(&self, entry: SchedulerLogEntry) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.append(entry.clone());
            }
            last.append(entry);
        }
    }
}
