//! # Observability & Tracing
//!
//! The [`setup_tracing`] function initializes structured logging with the `tracing` crate.
//! Every component logs with structured fields instead of formatted strings, so output can
//! be filtered on `dispatcher`, `agent`, `worker` or `slot`.
//!
//! ## Configuration
//!
//! The compact format hides the crate/module prefix (`with_target(false)`); the fields
//! already say where a line comes from.
//!
//! - **Configurable log levels** via the `RUST_LOG` environment variable
//! - **Compact format** optimized for development
//!
//! ## What Gets Traced
//!
//! | Level   | Events                                                                   |
//! |---------|--------------------------------------------------------------------------|
//! | `info`  | Dispatcher start, drain, stop and resize; worker start/exit; bind/unbind |
//! | `debug` | Admissions, releases, route changes, disposals                           |
//! | `trace` | Burst start/end and stale tickets                                        |
//! | `warn`  | Behavior failures, undeliverable messages, undrained agents              |
//!
//! ## Usage Examples
//!
//! ```bash
//! # Lifecycle only
//! RUST_LOG=info cargo run --bin adv_thread_pool_case
//!
//! # Watch bindings move around
//! RUST_LOG=debug cargo run --bin tricky_disp_case
//!
//! # Every burst
//! RUST_LOG=trace cargo run --bin tricky_disp_case
//!
//! # Only the dispatcher internals
//! RUST_LOG=actor_dispatch::dispatcher=debug cargo run --bin tricky_disp_case
//! ```
//!
//! ## Example Output
//!
//! **With `RUST_LOG=info`**:
//!
//! ```text
//! INFO Dispatcher created dispatcher="tricky" kind=Tricky
//! INFO Worker started dispatcher=tricky worker=0
//! INFO Tricky dispatcher started dispatcher=tricky workers=4 lanes=2
//! INFO Bound agent=#1 name="Dashboard" dispatcher="tricky" policy=Priority(Priority(0))
//! INFO Pinned agent migrated dispatcher=tricky agent=#17 from=2 to=0 load_from=3 load_to=0
//! INFO Draining dispatcher=tricky queued=12 running=4 deadline=2s
//! INFO Tricky dispatcher stopped dispatcher=tricky
//! ```
//!
//! Failures carry the agent and the message that triggered them:
//!
//! ```text
//! WARN Behavior failed agent=#7 name="DeviceManager" error=error: unknown device tag="demo::PerformIo"
//! ```
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false) // Fields identify the component; module paths are noise.
        .compact()
        .init();
}
