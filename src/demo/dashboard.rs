//! Collects message delivery delays reported by device managers.

use crate::framework::{Behavior, BehaviorError, BurstContext, Message};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Operation a delay sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpType {
    Init,
    IoOp,
    Reinit,
}

impl OpType {
    const ALL: [OpType; 3] = [OpType::Init, OpType::Reinit, OpType::IoOp];

    fn index(self) -> usize {
        match self {
            OpType::Init => 0,
            OpType::IoOp => 1,
            OpType::Reinit => 2,
        }
    }

    fn label(self) -> &'static str {
        match self {
            OpType::Init => "init",
            OpType::IoOp => "io_op",
            OpType::Reinit => "reinit",
        }
    }
}

/// How late a message was handled compared to when it was due.
#[derive(Debug, Clone, Copy)]
pub struct DelayInfo {
    pub op: OpType,
    pub delay: Duration,
}

/// Asks the dashboard to report and start a new time slot.
#[derive(Debug, Clone, Copy)]
pub struct ShowStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeSlot {
    pub total: Duration,
    pub events: u64,
}

impl TimeSlot {
    fn add(&mut self, delay: Duration) {
        self.total += delay;
        self.events += 1;
    }

    pub fn avg(&self) -> Duration {
        match u32::try_from(self.events) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_nanos((self.total.as_nanos() / self.events as u128) as u64),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpStats {
    pub total: TimeSlot,
    pub last_slot: TimeSlot,
}

/// Delay statistics per operation type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub ops: [OpStats; 3],
    /// Number of reports produced so far.
    pub reports: u64,
}

impl DashboardStats {
    pub fn record(&mut self, info: DelayInfo) {
        let stats = &mut self.ops[info.op.index()];
        stats.total.add(info.delay);
        stats.last_slot.add(info.delay);
    }

    pub fn get(&self, op: OpType) -> &OpStats {
        &self.ops[op.index()]
    }

    /// Starts a new slot, returning the one that just ended.
    fn rotate(&mut self) -> [OpStats; 3] {
        let ended = self.ops;
        for stats in &mut self.ops {
            stats.last_slot = TimeSlot::default();
        }
        self.reports += 1;
        ended
    }
}

/// Dashboard behavior. Its state is shared so the caller can inspect the
/// totals after the run.
pub struct Dashboard {
    stats: Arc<Mutex<DashboardStats>>,
    csv: Option<BufWriter<File>>,
}

impl Dashboard {
    pub fn new(stats: Arc<Mutex<DashboardStats>>) -> Self {
        Self { stats, csv: None }
    }

    /// Appends one line per report to `file`, after writing the header.
    pub fn with_csv(mut self, file: File) -> std::io::Result<Self> {
        let mut writer = BufWriter::new(file);
        writeln!(writer, "Init-Avg;Init-Cnt;Reinit-Avg;Reinit-Cnt;IO-Avg;IO-Cnt")?;
        writer.flush()?;
        self.csv = Some(writer);
        Ok(self)
    }

    fn show_stats(&mut self) -> Result<(), BehaviorError> {
        let (report, slot) = {
            let mut stats = self.stats.lock();
            let report = stats.reports;
            (report, stats.rotate())
        };

        if let Some(csv) = self.csv.as_mut() {
            let [init, io, reinit] = slot.map(|s| s.last_slot);
            writeln!(
                csv,
                "{};{};{};{};{};{}",
                init.avg().as_millis(),
                init.events,
                reinit.avg().as_millis(),
                reinit.events,
                io.avg().as_millis(),
                io.events
            )?;
            csv.flush()?;
        }

        for op in OpType::ALL {
            let s = slot[op.index()];
            info!(
                report,
                op = op.label(),
                total_avg_ms = millis(s.total.avg()),
                total_events = s.total.events,
                last_avg_ms = millis(s.last_slot.avg()),
                last_events = s.last_slot.events,
                "Delay stats"
            );
        }
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Behavior for Dashboard {
    type State = ();

    fn handle(
        &mut self,
        _state: &mut (),
        message: Message,
        _ctx: &mut BurstContext,
    ) -> Result<(), BehaviorError> {
        if let Some(info) = message.downcast_ref::<DelayInfo>() {
            self.stats.lock().record(*info);
            return Ok(());
        }
        if message.is::<ShowStats>() {
            return self.show_stats();
        }
        Err(format!("dashboard cannot handle {}", message.tag()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn slots_average_and_rotate() {
        let mut stats = DashboardStats::default();
        stats.record(DelayInfo { op: OpType::IoOp, delay: ms(10) });
        stats.record(DelayInfo { op: OpType::IoOp, delay: ms(30) });
        stats.record(DelayInfo { op: OpType::Init, delay: ms(5) });
        assert_eq!(stats.get(OpType::IoOp).last_slot.avg(), ms(20));
        assert_eq!(stats.get(OpType::Reinit).total.avg(), Duration::ZERO);

        let ended = stats.rotate();
        assert_eq!(ended[OpType::IoOp.index()].last_slot.events, 2);
        assert_eq!(stats.get(OpType::IoOp).last_slot.events, 0);
        assert_eq!(stats.get(OpType::IoOp).total.events, 2);
        assert_eq!(stats.reports, 1);
    }
}
