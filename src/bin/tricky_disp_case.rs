//! # Tricky Dispatcher Case
//!
//! Device managers in the high lane of a tricky dispatcher, the dashboard in
//! its low lane. Watch the dashboard's reports keep coming despite the load:
//! aging promotes it once it has waited long enough.
//!
//! ```bash
//! RUST_LOG=info cargo run --bin tricky_disp_case
//! ```

use actor_dispatch::demo::{self, DemoConfig};
use actor_dispatch::lifecycle::{setup_tracing, Supervisor, SupervisorConfig};
use std::sync::Arc;
use tracing::{info, warn, Instrument};

#[tokio::main]
async fn main() -> Result<(), String> {
    setup_tracing();

    let config = DemoConfig::default();
    info!(?config, "Starting tricky dispatcher case");

    let supervisor = Arc::new(Supervisor::new(SupervisorConfig::default()).map_err(|e| e.to_string())?);
    let layout = demo::tricky_case(&supervisor, &config).map_err(|e| e.to_string())?;

    let span = tracing::info_span!("tricky_disp_case");
    let outcome = demo::run(supervisor.clone(), layout, config)
        .instrument(span)
        .await
        .map_err(|e| e.to_string())?;

    for stats in supervisor.stats() {
        info!(dispatcher = %stats.name, lanes = ?stats.lane_depths, workers = ?stats.worker_queue_depths, "Final queue depths");
    }
    for undrained in outcome.report.undrained() {
        warn!(dispatcher = %undrained.dispatcher, pending = undrained.pending_messages(), "Left undrained");
    }
    info!(
        failures = outcome.report.failures().count(),
        reports = outcome.stats.reports,
        "Tricky dispatcher case finished"
    );
    Ok(())
}
