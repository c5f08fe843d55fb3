//! # Dispatchers
//!
//! A dispatcher owns worker threads and the ready-queue(s) that surface
//! runnable agents to them. Two kinds are provided:
//!
//! - [`ThreadPoolDispatcher`]: N resizable workers sharing one FIFO queue.
//! - [`TrickyDispatcher`]: priority lanes with aging, exclusive threads and
//!   pinned workers with migration under load.
//!
//! Both implement the [`Dispatcher`] trait, which is what the supervisor and
//! the binding table talk to. Agents never see a dispatcher directly: a bound
//! agent holds a [`Route`] whose [`Scheduler`] receives a ticket whenever the
//! agent becomes runnable.

pub mod binding;
pub mod config;
pub mod events;
pub mod thread_pool;
pub mod tricky;
pub(crate) mod worker;

pub use binding::{Binding, BindingTable};
pub use config::{DispatcherConfig, ThreadPoolConfig, TrickyConfig};
pub use events::{DispatchEvent, EventBus};
pub use thread_pool::ThreadPoolDispatcher;
pub use tricky::TrickyDispatcher;

use crate::framework::{AgentId, AgentRef, DrainReport, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Created,
    Started,
    Draining,
    Stopped,
}

impl Lifecycle {
    /// Whether new agents may be bound.
    pub fn accepts_bindings(self) -> bool {
        matches!(self, Lifecycle::Created | Lifecycle::Started)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Created => "created",
            Lifecycle::Started => "started",
            Lifecycle::Draining => "draining",
            Lifecycle::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherKind {
    ThreadPool,
    Tricky,
}

/// Priority lane index. Higher values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Priority = Priority(0);

    pub fn lane(self) -> usize {
        self.0 as usize
    }
}

/// How an agent wants to be bound to a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BindPolicy {
    /// Whatever the dispatcher does by default.
    #[default]
    Default,
    /// A priority lane (tricky dispatcher).
    Priority(Priority),
    /// A specific pool worker, or the least loaded one (tricky dispatcher).
    /// Pinned agents may migrate between bursts when their worker is overloaded.
    Pinned(Option<usize>),
    /// A dedicated thread serving only this agent (tricky dispatcher).
    Exclusive,
}

/// Where inside a dispatcher an agent's tickets go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Shared,
    Lane(usize),
    Worker(usize),
    Exclusive(usize),
}

/// Receives tickets for agents that became runnable.
pub(crate) trait Scheduler: Send + Sync {
    /// Enqueues a ticket. Returns `false` if the dispatcher no longer runs
    /// agents; the caller then keeps the agent idle with its mailbox intact.
    fn schedule(&self, agent: &AgentRef, placement: Placement, generation: u64) -> bool;

    /// Whether the dispatcher has stopped. A running burst checks this before
    /// each message and hands the agent back once it holds.
    fn is_stopped(&self) -> bool;

    /// Forgets an agent that was disposed outside a burst. Idempotent.
    fn release(&self, agent: AgentId);
}

/// An agent's live connection to the dispatcher it is bound to.
#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) dispatcher: Arc<str>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) placement: Placement,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("dispatcher", &self.dispatcher)
            .field("placement", &self.placement)
            .finish()
    }
}

/// Point-in-time counters of one dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub name: String,
    pub kind: DispatcherKind,
    pub lifecycle: Lifecycle,
    pub live_workers: usize,
    /// Ready-queue entries across all queues.
    pub queued: usize,
    /// Agents inside a burst right now.
    pub running: usize,
    pub bound_agents: usize,
    /// Depth of each priority lane (empty for the thread pool).
    pub lane_depths: Vec<usize>,
    /// Depth of each worker's private queue (empty for the thread pool).
    pub worker_queue_depths: Vec<usize>,
}

/// The contract every dispatcher kind fulfils.
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> DispatcherKind;

    fn lifecycle(&self) -> Lifecycle;

    /// Spawns the worker threads. Starting twice is a no-op.
    fn start(&self) -> Result<()>;

    /// Accepts `agent` under `policy` and returns the route it should use.
    /// Called by the binding table for bind and rebind (also when the agent
    /// is already bound here with a different placement).
    fn admit(&self, agent: &AgentRef, policy: BindPolicy) -> Result<Route>;

    /// Forgets `agent`. Idempotent.
    fn release(&self, agent: AgentId);

    /// Stops admitting agents, processes queued work until it is empty or
    /// `deadline` passes, then stops and joins every worker.
    fn drain(&self, deadline: Duration) -> DrainReport;

    /// Stops immediately (a zero-deadline drain) if not already stopped.
    fn stop(&self) -> DrainReport {
        self.drain(Duration::ZERO)
    }

    /// Changes the number of pool workers.
    fn resize(&self, _threads: usize) -> Result<()> {
        Err(crate::framework::DispatchError::Unsupported {
            dispatcher: self.name().to_string(),
            operation: "resize",
        })
    }

    fn stats(&self) -> DispatcherStats;
}

/// Builds a dispatcher from its configuration.
pub fn build(
    name: &str,
    config: DispatcherConfig,
    events: EventBus,
) -> Result<Arc<dyn Dispatcher>> {
    config.validate()?;
    Ok(match config {
        DispatcherConfig::ThreadPool(cfg) => {
            Arc::new(ThreadPoolDispatcher::new(name, cfg, events)) as Arc<dyn Dispatcher>
        }
        DispatcherConfig::Tricky(cfg) => Arc::new(TrickyDispatcher::new(name, cfg, events)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_created_and_started_accept_bindings() {
        assert!(Lifecycle::Created.accepts_bindings());
        assert!(Lifecycle::Started.accepts_bindings());
        assert!(!Lifecycle::Draining.accepts_bindings());
        assert!(!Lifecycle::Stopped.accepts_bindings());
    }
}
