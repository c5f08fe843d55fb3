#![doc(html_logo_url = "https://www.rust-lang.org/logos/rust-logo-128x128.png")]
#![doc(html_favicon_url = "https://www.rust-lang.org/favicon.ico")]
//! # Actor Dispatch
//!
//! > **Agents, mailboxes and the dispatchers that run them on OS threads.**
//!
//! Application code writes [`Behavior`](framework::Behavior)s. Each agent owns
//! one behavior, its state and a FIFO mailbox. A dispatcher decides which
//! worker thread runs which agent, and when. The same agent can be moved
//! between dispatchers while messages keep flowing, and nothing is lost or
//! reordered along the way.
//!
//! ## 🏗️ Design Philosophy
//!
//! ### Sequential agents, parallel system
//! An agent handles one message at a time, so its state needs no locks. Many
//! agents run in parallel on a dispatcher's workers. The rule that makes this
//! safe is simple: an agent is claimed by at most one worker at a time, and a
//! claimed agent drains a *burst* of messages before handing itself back.
//!
//! ### Dispatchers are pluggable
//! Every dispatcher implements [`Dispatcher`](dispatcher::Dispatcher). The
//! binding table and the supervisor only ever talk to that trait, so adding a
//! dispatcher kind never touches agent code.
//!
//! ### Failures are data
//! A behavior that returns an error or panics produces an
//! [`AgentFailure`](framework::AgentFailure). Workers never die from it; the
//! failure is reported through the event bus and collected in drain reports.
//!
//! ## 🗺️ Module Tour
//!
//! ### 1. The Agent ([`framework`])
//! Messages, mailboxes, behaviors and the [`AgentRef`](framework::AgentRef)
//! handle with its run-state machine.
//! - **Key items**: [`Behavior`](framework::Behavior), [`AgentRef`](framework::AgentRef),
//!   [`DispatchError`](framework::DispatchError).
//!
//! ### 2. The Dispatchers ([`dispatcher`])
//! - [`ThreadPoolDispatcher`](dispatcher::ThreadPoolDispatcher): N resizable
//!   workers sharing one FIFO ready-queue.
//! - [`TrickyDispatcher`](dispatcher::TrickyDispatcher): priority lanes with
//!   aging, exclusive threads and pinned workers with migration.
//! - [`BindingTable`](dispatcher::BindingTable): which agent is bound where.
//!
//! ### 3. The Orchestrator ([`lifecycle`])
//! The [`Supervisor`](lifecycle::Supervisor) names dispatchers, creates agents,
//! and drains everything within one deadline on shutdown.
//!
//! ### 4. The Workload ([`demo`])
//! A device simulation used by the two binaries to compare dispatchers under
//! load.
//!
//! ## 🚀 Quick Start
//!
//! ```no_run
//! use actor_dispatch::dispatcher::ThreadPoolConfig;
//! use actor_dispatch::framework::{from_fn, BurstContext, Message};
//! use actor_dispatch::lifecycle::Supervisor;
//! use std::time::Duration;
//!
//! let supervisor = Supervisor::default();
//! supervisor.create_dispatcher("pool", ThreadPoolConfig::default().with_threads(2))?;
//! supervisor.start("pool")?;
//!
//! let counter = supervisor.create_agent(
//!     "pool",
//!     0u64,
//!     from_fn(|count: &mut u64, msg: Message, _ctx: &mut BurstContext| {
//!         *count += msg.downcast::<u64>().unwrap_or(0);
//!         Ok(())
//!     }),
//! )?;
//! counter.send(5u64)?;
//!
//! let report = supervisor.shutdown(Duration::from_secs(1));
//! assert!(report.is_clean());
//! # Ok::<(), actor_dispatch::framework::DispatchError>(())
//! ```
//!
//! ### Running the Demo
//!
//! ```bash
//! RUST_LOG=info cargo run --bin adv_thread_pool_case
//! RUST_LOG=info cargo run --bin tricky_disp_case
//! ```
//!
//! ### Running Tests
//!
//! ```bash
//! cargo test
//! ```

pub mod demo;
pub mod dispatcher;
pub mod framework;
pub mod lifecycle;
