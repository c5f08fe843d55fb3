//! # Dispatcher Errors and Reports
//!
//! Two families live here:
//!
//! - [`DispatchError`]: structural misuse (double bind, unbind of an absent
//!   binding, sending to a disposed agent, unknown dispatcher names). These are
//!   returned synchronously to the caller.
//! - Reports ([`AgentFailure`], [`UndrainedAgents`], [`DrainReport`]): runtime
//!   outcomes that are recovered locally by a dispatcher and reported upward.
//!   They are plain data, cloneable so they can travel on the event stream.

use super::agent::AgentId;
use crate::dispatcher::Lifecycle;
use serde::Serialize;
use std::fmt;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error type returned by behavior functions.
pub type BehaviorError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the dispatcher core itself.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Agent {agent} is already bound to dispatcher '{dispatcher}'")]
    AlreadyBound { agent: AgentId, dispatcher: String },
    #[error("Agent {0} is not bound")]
    NotBound(AgentId),
    #[error("Agent {0} is disposed")]
    AgentDisposed(AgentId),
    #[error("Mailbox of agent {agent} is full (capacity {capacity})")]
    MailboxFull { agent: AgentId, capacity: usize },
    #[error("Dispatcher not found: {0}")]
    DispatcherNotFound(String),
    #[error("Dispatcher already exists: {0}")]
    DispatcherExists(String),
    #[error("Dispatcher '{dispatcher}' is {state} and does not accept new agents")]
    NotAccepting { dispatcher: String, state: Lifecycle },
    #[error("Invalid binding policy for dispatcher '{dispatcher}': {reason}")]
    InvalidPolicy { dispatcher: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Dispatcher '{dispatcher}' does not support {operation}")]
    Unsupported {
        dispatcher: String,
        operation: &'static str,
    },
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Identifies the message a behavior was handling when it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageInfo {
    /// Type tag of the message.
    pub tag: &'static str,
    /// Position of the message in the agent's mailbox history.
    pub seq: u64,
}

/// Why a behavior invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureCause {
    /// The behavior returned `Err`.
    Error(String),
    /// The behavior panicked.
    Panic(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Error(e) => write!(f, "error: {e}"),
            FailureCause::Panic(p) => write!(f, "panic: {p}"),
        }
    }
}

/// A behavior failure caught at the burst boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentFailure {
    pub agent: AgentId,
    pub name: String,
    pub message: MessageInfo,
    pub cause: FailureCause,
}

impl fmt::Display for AgentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agent {} ({}) failed on {}#{}: {}",
            self.agent, self.name, self.message.tag, self.message.seq, self.cause
        )
    }
}

/// One agent left with pending work when a drain deadline expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UndrainedAgent {
    pub agent: AgentId,
    pub name: String,
    pub pending: usize,
}

/// Agents abandoned by a drain that ran out of time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UndrainedAgents {
    pub dispatcher: String,
    pub agents: Vec<UndrainedAgent>,
}

impl UndrainedAgents {
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn pending_messages(&self) -> usize {
        self.agents.iter().map(|a| a.pending).sum()
    }
}

/// Outcome of draining (and stopping) one dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub dispatcher: String,
    /// `None` when every queued agent was processed before the deadline.
    pub undrained: Option<UndrainedAgents>,
    /// Behavior failures recorded since the previous report.
    pub failures: Vec<AgentFailure>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.undrained.is_none() && self.failures.is_empty()
    }
}

/// Aggregated outcome of a supervisor shutdown, in dispatcher creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub dispatchers: Vec<DrainReport>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.dispatchers.iter().all(DrainReport::is_clean)
    }

    pub fn undrained(&self) -> impl Iterator<Item = &UndrainedAgents> {
        self.dispatchers.iter().filter_map(|r| r.undrained.as_ref())
    }

    pub fn failures(&self) -> impl Iterator<Item = &AgentFailure> {
        self.dispatchers.iter().flat_map(|r| r.failures.iter())
    }
}
