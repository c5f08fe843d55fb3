use crate::framework::{DispatchError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Parameters of the device simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of simulated devices.
    pub device_count: u64,
    /// Worker threads of the dispatcher running the device managers.
    pub thread_pool_size: usize,
    /// Device manager agents; device `i` belongs to manager `i % managers`.
    pub managers: usize,
    /// Upper bound of IO operations between two reinits.
    pub io_ops_before_reinit: u32,
    /// Upper bound of reinits before a device is recreated.
    pub reinits_before_recreate: u32,
    pub io_period_min_ms: u64,
    pub io_period_max_ms: u64,
    pub device_init_time_ms: u64,
    pub io_op_time_ms: u64,
    /// How often the dashboard prints its statistics.
    pub stats_period_ms: u64,
    /// How long the simulation runs before shutdown.
    pub run_for_ms: u64,
    pub shutdown_deadline_ms: u64,
    /// Optional CSV file receiving one line of per-slot averages per report.
    pub csv_path: Option<PathBuf>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            device_count: 100,
            thread_pool_size: 4,
            managers: 16,
            io_ops_before_reinit: 100,
            reinits_before_recreate: 10,
            io_period_min_ms: 100,
            io_period_max_ms: 300,
            device_init_time_ms: 1250,
            io_op_time_ms: 50,
            stats_period_ms: 5_000,
            run_for_ms: 30_000,
            shutdown_deadline_ms: 2_000,
            csv_path: None,
        }
    }
}

impl DemoConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(DispatchError::InvalidConfig(msg.to_string()));
        if self.thread_pool_size == 0 {
            return fail("thread_pool_size must be positive");
        }
        if self.managers == 0 {
            return fail("managers must be positive");
        }
        if self.io_ops_before_reinit == 0 || self.reinits_before_recreate == 0 {
            return fail("io_ops_before_reinit and reinits_before_recreate must be positive");
        }
        if self.io_period_min_ms > self.io_period_max_ms {
            return fail("io period range is empty");
        }
        if self.stats_period_ms == 0 {
            return fail("stats_period_ms must be positive");
        }
        Ok(())
    }

    pub fn device_init_time(&self) -> Duration {
        Duration::from_millis(self.device_init_time_ms)
    }

    /// Reinitialization takes two thirds of an init.
    pub fn device_reinit_time(&self) -> Duration {
        Duration::from_millis(self.device_init_time_ms / 3 * 2)
    }

    pub fn io_op_time(&self) -> Duration {
        Duration::from_millis(self.io_op_time_ms)
    }

    pub fn stats_period(&self) -> Duration {
        Duration::from_millis(self.stats_period_ms)
    }

    pub fn run_for(&self) -> Duration {
        Duration::from_millis(self.run_for_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub(crate) fn random_io_period(&self, rng: &mut impl Rng) -> Duration {
        Duration::from_millis(rng.random_range(self.io_period_min_ms..=self.io_period_max_ms))
    }

    pub(crate) fn random_io_ops(&self, rng: &mut impl Rng) -> u32 {
        rng.random_range(1..=self.io_ops_before_reinit)
    }

    pub(crate) fn random_reinits(&self, rng: &mut impl Rng) -> u32 {
        rng.random_range(1..=self.reinits_before_recreate)
    }
}
