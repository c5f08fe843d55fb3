//! Simulated device manager.
//!
//! Each device cycles through `init → io … io → reinit → io … → recreate`.
//! Every step blocks the worker for the configured time, which is what makes
//! this workload a useful stress test for dispatchers: slow inits compete with
//! frequent short IO operations for the same threads.

use super::config::DemoConfig;
use super::dashboard::{DelayInfo, OpType};
use super::delay_line::DelayLine;
use crate::framework::{AgentRef, Behavior, BehaviorError, BurstContext, Message};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: u64,
    pub io_period: Duration,
    pub remaining_io_ops: u32,
    pub remaining_reinits: u32,
}

/// What a device does after an IO operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Io,
    Reinit,
    Recreate,
}

impl Device {
    pub fn complete_io(&mut self) -> NextStep {
        self.remaining_io_ops = self.remaining_io_ops.saturating_sub(1);
        if self.remaining_io_ops > 0 {
            NextStep::Io
        } else if self.remaining_reinits == 0 {
            NextStep::Recreate
        } else {
            NextStep::Reinit
        }
    }
}

#[derive(Debug)]
pub struct InitDevice {
    pub id: u64,
    pub expected: Instant,
}

impl InitDevice {
    pub fn now(id: u64) -> Self {
        Self {
            id,
            expected: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub struct ReinitDevice {
    pub device: Device,
    pub expected: Instant,
}

#[derive(Debug)]
pub struct PerformIo {
    pub device: Device,
    pub expected: Instant,
}

/// Counters kept by each manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerCounters {
    pub inits: u64,
    pub reinits: u64,
    pub io_ops: u64,
}

pub struct DeviceManager {
    config: Arc<DemoConfig>,
    dashboard: AgentRef,
    delays: DelayLine,
}

impl DeviceManager {
    pub fn new(config: Arc<DemoConfig>, dashboard: AgentRef, delays: DelayLine) -> Self {
        Self {
            config,
            dashboard,
            delays,
        }
    }

    fn report_delay(&self, op: OpType, expected: Instant, ctx: &mut BurstContext) {
        let delay = Instant::now().saturating_duration_since(expected);
        ctx.send(&self.dashboard, DelayInfo { op, delay });
    }

    fn schedule_io(&self, device: Device, ctx: &BurstContext) {
        let period = device.io_period;
        self.delays.send_after(
            ctx.myself(),
            period,
            PerformIo {
                device,
                expected: Instant::now() + period,
            },
        );
    }

    fn on_init(&self, counters: &mut ManagerCounters, cmd: InitDevice, ctx: &mut BurstContext) {
        self.report_delay(OpType::Init, cmd.expected, ctx);
        let mut rng = rand::rng();
        let device = Device {
            id: cmd.id,
            io_period: self.config.random_io_period(&mut rng),
            remaining_io_ops: self.config.random_io_ops(&mut rng),
            remaining_reinits: self.config.random_reinits(&mut rng),
        };
        std::thread::sleep(self.config.device_init_time());
        counters.inits += 1;
        trace!(device = device.id, ?device.io_period, "Device initialized");
        self.schedule_io(device, ctx);
    }

    fn on_reinit(&self, counters: &mut ManagerCounters, cmd: ReinitDevice, ctx: &mut BurstContext) {
        self.report_delay(OpType::Reinit, cmd.expected, ctx);
        let mut device = cmd.device;
        let mut rng = rand::rng();
        device.io_period = self.config.random_io_period(&mut rng);
        device.remaining_io_ops = self.config.random_io_ops(&mut rng);
        device.remaining_reinits = device.remaining_reinits.saturating_sub(1);
        std::thread::sleep(self.config.device_reinit_time());
        counters.reinits += 1;
        self.schedule_io(device, ctx);
    }

    fn on_perform_io(&self, counters: &mut ManagerCounters, cmd: PerformIo, ctx: &mut BurstContext) {
        self.report_delay(OpType::IoOp, cmd.expected, ctx);
        std::thread::sleep(self.config.io_op_time());
        counters.io_ops += 1;
        let mut device = cmd.device;
        match device.complete_io() {
            NextStep::Io => self.schedule_io(device, ctx),
            NextStep::Reinit => ctx.send_self(ReinitDevice {
                device,
                expected: Instant::now(),
            }),
            NextStep::Recreate => {
                trace!(device = device.id, "Device recreated");
                ctx.send_self(InitDevice::now(device.id));
            }
        }
    }
}

impl Behavior for DeviceManager {
    type State = ManagerCounters;

    fn handle(
        &mut self,
        counters: &mut ManagerCounters,
        message: Message,
        ctx: &mut BurstContext,
    ) -> Result<(), BehaviorError> {
        let message = match message.downcast::<InitDevice>() {
            Ok(cmd) => {
                self.on_init(counters, cmd, ctx);
                return Ok(());
            }
            Err(message) => message,
        };
        let message = match message.downcast::<ReinitDevice>() {
            Ok(cmd) => {
                self.on_reinit(counters, cmd, ctx);
                return Ok(());
            }
            Err(message) => message,
        };
        match message.downcast::<PerformIo>() {
            Ok(cmd) => {
                self.on_perform_io(counters, cmd, ctx);
                Ok(())
            }
            Err(message) => Err(format!("device manager cannot handle {}", message.tag()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(io: u32, reinits: u32) -> Device {
        Device {
            id: 1,
            io_period: Duration::from_millis(1),
            remaining_io_ops: io,
            remaining_reinits: reinits,
        }
    }

    #[test]
    fn io_countdown_leads_to_reinit_then_recreate() {
        let mut d = device(2, 1);
        assert_eq!(d.complete_io(), NextStep::Io);
        assert_eq!(d.complete_io(), NextStep::Reinit);

        let mut last = device(1, 0);
        assert_eq!(last.complete_io(), NextStep::Recreate);
    }
}
