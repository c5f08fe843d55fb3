//! Agent-side building blocks of the dispatcher core.
//!
//! # Main Components
//!
//! - [`Message`] / [`Mailbox`] - type-tagged payloads and the per-agent FIFO
//! - [`Behavior`] - the trait application code implements
//! - [`AgentRef`] - handle used to send to (and observe) an agent
//! - [`DispatchError`] and the report types ([`AgentFailure`], [`UndrainedAgents`])
//!
//! # Testing
//!
//! See [`mock`] for recording behaviors and probes used by the test suites.

pub mod agent;
pub mod behavior;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod mock;

pub use agent::{AgentId, AgentRef, Disposal, FailurePolicy, RunState};
pub use behavior::{from_fn, Behavior, BurstContext, FnBehavior};
pub use error::*;
pub use mailbox::Mailbox;
pub use message::{Envelope, Message};
