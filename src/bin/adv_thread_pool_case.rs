//! # Thread-Pool Case
//!
//! Device managers on a thread-pool dispatcher, the dashboard on a
//! single-thread pool of its own.
//!
//! ```bash
//! RUST_LOG=info cargo run --bin adv_thread_pool_case
//! ```

use actor_dispatch::demo::{self, DemoConfig};
use actor_dispatch::lifecycle::{setup_tracing, Supervisor, SupervisorConfig};
use std::sync::Arc;
use tracing::{info, warn, Instrument};

#[tokio::main]
async fn main() -> Result<(), String> {
    setup_tracing();

    let config = DemoConfig::default();
    info!(?config, "Starting thread-pool case");

    let supervisor = Arc::new(Supervisor::new(SupervisorConfig::default()).map_err(|e| e.to_string())?);
    let layout = demo::thread_pool_case(&supervisor, &config).map_err(|e| e.to_string())?;

    let span = tracing::info_span!("adv_thread_pool_case");
    let outcome = demo::run(supervisor, layout, config)
        .instrument(span)
        .await
        .map_err(|e| e.to_string())?;

    for undrained in outcome.report.undrained() {
        warn!(dispatcher = %undrained.dispatcher, pending = undrained.pending_messages(), "Left undrained");
    }
    info!(
        failures = outcome.report.failures().count(),
        reports = outcome.stats.reports,
        "Thread-pool case finished"
    );
    Ok(())
}
