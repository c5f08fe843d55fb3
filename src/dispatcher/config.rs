//! Dispatcher configuration.
//!
//! Every config derives `Deserialize` with `#[serde(default)]`, so a partial
//! document only overrides what it names:
//!
//! ```json
//! { "kind": "tricky", "threads": 6, "aging_threshold_ms": 20 }
//! ```

use super::{DispatcherKind, Priority};
use crate::framework::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Maximum messages per burst. `None` runs until the mailbox is empty.
    pub burst_limit: Option<usize>,
    /// Worker thread name prefix. Defaults to the dispatcher name.
    pub thread_name: Option<String>,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            burst_limit: None,
            thread_name: None,
        }
    }
}

impl ThreadPoolConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_burst_limit(mut self, limit: usize) -> Self {
        self.burst_limit = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(DispatchError::InvalidConfig(
                "thread pool needs at least one thread".into(),
            ));
        }
        if self.burst_limit == Some(0) {
            return Err(DispatchError::InvalidConfig(
                "burst_limit must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrickyConfig {
    /// Number of pool workers (exclusive threads come on top).
    pub threads: usize,
    /// Number of priority lanes.
    pub lanes: usize,
    /// Lane used for `BindPolicy::Default`.
    pub default_priority: u8,
    /// A queued agent gains one lane of rank per threshold waited. 0 disables aging.
    pub aging_threshold_ms: u64,
    pub burst_limit: Option<usize>,
    /// Migrate a pinned agent when its worker's queue exceeds the least loaded
    /// worker's by more than this. `None` disables migration.
    pub migration_threshold: Option<usize>,
    pub thread_name: Option<String>,
}

impl Default for TrickyConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            lanes: 2,
            default_priority: 0,
            aging_threshold_ms: 100,
            burst_limit: Some(16),
            migration_threshold: Some(2),
            thread_name: None,
        }
    }
}

impl TrickyConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    pub fn with_aging_threshold(mut self, threshold: Duration) -> Self {
        self.aging_threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_burst_limit(mut self, limit: Option<usize>) -> Self {
        self.burst_limit = limit;
        self
    }

    pub fn with_migration_threshold(mut self, threshold: Option<usize>) -> Self {
        self.migration_threshold = threshold;
        self
    }

    pub fn aging_threshold(&self) -> Duration {
        Duration::from_millis(self.aging_threshold_ms)
    }

    pub fn default_priority(&self) -> Priority {
        Priority(self.default_priority)
    }

    /// Most urgent lane.
    pub fn top_priority(&self) -> Priority {
        Priority(self.lanes.saturating_sub(1) as u8)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(DispatchError::InvalidConfig(
                "tricky dispatcher needs at least one pool thread".into(),
            ));
        }
        if self.lanes == 0 || self.lanes > u8::MAX as usize {
            return Err(DispatchError::InvalidConfig(format!(
                "lanes must be within 1..=255, got {}",
                self.lanes
            )));
        }
        if self.default_priority as usize >= self.lanes {
            return Err(DispatchError::InvalidConfig(format!(
                "default_priority {} out of range for {} lanes",
                self.default_priority, self.lanes
            )));
        }
        if self.burst_limit == Some(0) {
            return Err(DispatchError::InvalidConfig(
                "burst_limit must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of either dispatcher kind, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatcherConfig {
    ThreadPool(ThreadPoolConfig),
    Tricky(TrickyConfig),
}

impl DispatcherConfig {
    pub fn kind(&self) -> DispatcherKind {
        match self {
            DispatcherConfig::ThreadPool(_) => DispatcherKind::ThreadPool,
            DispatcherConfig::Tricky(_) => DispatcherKind::Tricky,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            DispatcherConfig::ThreadPool(cfg) => cfg.validate(),
            DispatcherConfig::Tricky(cfg) => cfg.validate(),
        }
    }
}

impl From<ThreadPoolConfig> for DispatcherConfig {
    fn from(cfg: ThreadPoolConfig) -> Self {
        DispatcherConfig::ThreadPool(cfg)
    }
}

impl From<TrickyConfig> for DispatcherConfig {
    fn from(cfg: TrickyConfig) -> Self {
        DispatcherConfig::Tricky(cfg)
    }
}
