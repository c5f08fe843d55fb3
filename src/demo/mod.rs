//! # Device Simulation
//!
//! A workload for comparing dispatchers. A set of [`DeviceManager`] agents
//! drive simulated devices through slow inits and frequent short IO
//! operations; every handled message reports how late it was to a
//! [`Dashboard`], which prints per-operation delay averages periodically.
//!
//! Two layouts are provided, one per binary:
//!
//! - [`thread_pool_case`]: managers on a thread pool, the dashboard on a
//!   single-thread pool of its own.
//! - [`tricky_case`]: everything on one tricky dispatcher, managers in the
//!   high lane and the dashboard in the low lane. The dashboard only gets a
//!   turn thanks to aging.
//!
//! Timers (periodic `ShowStats`, delayed IO) run on tokio; the agents
//! themselves run on dispatcher threads.

pub mod config;
pub mod dashboard;
pub mod delay_line;
pub mod device_manager;

pub use config::DemoConfig;
pub use dashboard::{Dashboard, DashboardStats, DelayInfo, OpType, ShowStats};
pub use delay_line::DelayLine;
pub use device_manager::{Device, DeviceManager, InitDevice, ManagerCounters, PerformIo, ReinitDevice};

use crate::dispatcher::{BindPolicy, DispatchEvent, Priority, ThreadPoolConfig, TrickyConfig};
use crate::framework::{AgentRef, DispatchError, Result, ShutdownReport};
use crate::lifecycle::{AgentOptions, Supervisor};
use parking_lot::Mutex;
use std::fs::File;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Where the demo agents go.
#[derive(Debug, Clone)]
pub struct Layout {
    pub managers_on: String,
    pub manager_policy: BindPolicy,
    pub dashboard_on: String,
    pub dashboard_policy: BindPolicy,
}

/// What a finished run produced.
#[derive(Debug)]
pub struct DemoOutcome {
    pub report: ShutdownReport,
    pub stats: DashboardStats,
}

/// Creates and starts the dispatchers of the thread-pool case.
pub fn thread_pool_case(supervisor: &Supervisor, config: &DemoConfig) -> Result<Layout> {
    supervisor.create_dispatcher(
        "devices",
        ThreadPoolConfig::default().with_threads(config.thread_pool_size),
    )?;
    supervisor.create_dispatcher("dashboard", ThreadPoolConfig::default().with_threads(1))?;
    supervisor.start("devices")?;
    supervisor.start("dashboard")?;
    Ok(Layout {
        managers_on: "devices".into(),
        manager_policy: BindPolicy::Default,
        dashboard_on: "dashboard".into(),
        dashboard_policy: BindPolicy::Default,
    })
}

/// Creates and starts the dispatcher of the tricky case.
pub fn tricky_case(supervisor: &Supervisor, config: &DemoConfig) -> Result<Layout> {
    let tricky = TrickyConfig::default()
        .with_threads(config.thread_pool_size)
        .with_lanes(2);
    supervisor.create_dispatcher("tricky", tricky)?;
    supervisor.start("tricky")?;
    Ok(Layout {
        managers_on: "tricky".into(),
        manager_policy: BindPolicy::Priority(Priority(1)),
        dashboard_on: "tricky".into(),
        dashboard_policy: BindPolicy::Priority(Priority::LOW),
    })
}

/// Runs the simulation for `config.run_for()`, then shuts the supervisor down.
///
/// Must be called from a multi-threaded tokio runtime: shutdown blocks while
/// dispatchers drain.
pub async fn run(supervisor: Arc<Supervisor>, layout: Layout, config: DemoConfig) -> Result<DemoOutcome> {
    config.validate()?;
    let config = Arc::new(config);
    let stats = Arc::new(Mutex::new(DashboardStats::default()));

    let mut dashboard = Dashboard::new(stats.clone());
    if let Some(path) = &config.csv_path {
        dashboard = File::create(path)
            .and_then(|file| dashboard.with_csv(file))
            .map_err(|e| DispatchError::InvalidConfig(format!("csv file {}: {e}", path.display())))?;
    }
    let dashboard = supervisor.create_agent_with(
        &layout.dashboard_on,
        AgentOptions::named("Dashboard").with_policy(layout.dashboard_policy),
        (),
        dashboard,
    )?;

    let delays = DelayLine::current();
    let managers = (0..config.managers)
        .map(|i| {
            supervisor.create_agent_with(
                &layout.managers_on,
                AgentOptions::named(format!("DeviceManager-{i}")).with_policy(layout.manager_policy),
                ManagerCounters::default(),
                DeviceManager::new(config.clone(), dashboard.clone(), delays.clone()),
            )
        })
        .collect::<Result<Vec<AgentRef>>>()?;
    for id in 0..config.device_count {
        let manager = &managers[(id % managers.len() as u64) as usize];
        manager.send(InitDevice::now(id))?;
    }
    info!(devices = config.device_count, managers = managers.len(), dispatcher = %layout.managers_on, "Simulation started");

    let ticker = {
        let dashboard = dashboard.clone();
        let period = config.stats_period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if dashboard.send(ShowStats).is_err() {
                    break;
                }
            }
        })
    };
    let logger = tokio::spawn(log_events(supervisor.clone()));

    tokio::time::sleep(config.run_for()).await;
    ticker.abort();
    // Final report for the last partial slot.
    dashboard.send(ShowStats)?;

    let deadline = config.shutdown_deadline();
    let report = tokio::task::block_in_place(|| supervisor.shutdown(deadline));
    logger.abort();

    let stats = stats.lock().clone();
    Ok(DemoOutcome { report, stats })
}

async fn log_events(supervisor: Arc<Supervisor>) {
    let mut events = supervisor.subscribe();
    drop(supervisor);
    loop {
        match events.recv().await {
            Ok(DispatchEvent::AgentFailed(failure)) => warn!(%failure, "Agent failure"),
            Ok(DispatchEvent::Undrained(undrained)) => {
                warn!(dispatcher = %undrained.dispatcher, agents = undrained.agents.len(), pending = undrained.pending_messages(), "Agents left undrained")
            }
            Ok(DispatchEvent::LifecycleChanged { dispatcher, lifecycle }) => {
                info!(%dispatcher, %lifecycle, "Dispatcher lifecycle")
            }
            Ok(DispatchEvent::AgentDisposed { .. }) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
