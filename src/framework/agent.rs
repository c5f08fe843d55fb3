//! # Agents
//!
//! An agent is a mailbox plus a behavior and its state. It is shared between
//! the application (which sends to it through an [`AgentRef`]) and whichever
//! worker thread is currently running it.
//!
//! ## Run states
//!
//! ```text
//!            send (bound)         claim              burst done, mailbox empty
//!   Idle ───────────────▶ Runnable ─────▶ Running ─────────────────────────▶ Idle
//!                            ▲                │ burst done, more pending
//!                            └────────────────┘
//!   dispose while Running: Running ─▶ Finishing ─▶ Disposed (after the burst)
//!   dispose otherwise:     * ─▶ Disposed
//! ```
//!
//! Mutual exclusion comes from the claim: a worker may only move an agent from
//! `Runnable` to `Running` when the ticket it popped carries the agent's current
//! binding generation. Rebinding bumps the generation, so a ticket left behind
//! in the old dispatcher's queue can never start a second burst.

use super::behavior::{BurstContext, ErasedBehavior};
use super::error::{AgentFailure, DispatchError, FailureCause, MessageInfo, Result};
use super::mailbox::Mailbox;
use super::message::Message;
use crate::dispatcher::Route;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Opaque agent identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Runnable,
    Running,
    Finishing,
    Disposed,
}

/// What happens to an agent whose behavior fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Report the failure and continue with the next message.
    #[default]
    SkipMessage,
    /// Report the failure, end the burst and dispose the agent.
    StopAgent,
}

/// Result of [`AgentRef::dispose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    /// The agent was not running and is now disposed.
    Immediate { discarded: usize },
    /// The agent is mid-burst; it becomes disposed when the burst returns.
    Deferred,
    /// The agent was already disposed or finishing.
    AlreadyDisposed,
}

/// What one burst did, as seen by the worker that ran it.
#[derive(Debug, Default)]
pub(crate) struct BurstReport {
    pub(crate) processed: usize,
    pub(crate) failures: Vec<AgentFailure>,
    pub(crate) undeliverable: usize,
    /// Set when the agent ended the burst disposed; holds discarded messages.
    pub(crate) disposed: Option<usize>,
    /// Still has pending messages and was handed back to its scheduler.
    pub(crate) rescheduled: bool,
}

struct Inner {
    mailbox: Mailbox,
    state: RunState,
    route: Option<Route>,
    generation: u64,
}

struct AgentCell {
    id: AgentId,
    name: String,
    failure_policy: FailurePolicy,
    inner: Mutex<Inner>,
    // Only locked by the worker holding the agent in Running.
    core: Mutex<Box<dyn ErasedBehavior>>,
}

/// Cloneable handle to an agent.
#[derive(Clone)]
pub struct AgentRef {
    cell: Arc<AgentCell>,
}

impl AgentRef {
    pub(crate) fn new(
        id: AgentId,
        name: String,
        failure_policy: FailurePolicy,
        mailbox_capacity: Option<usize>,
        core: Box<dyn ErasedBehavior>,
    ) -> Self {
        Self {
            cell: Arc::new(AgentCell {
                id,
                name,
                failure_policy,
                inner: Mutex::new(Inner {
                    mailbox: Mailbox::new(mailbox_capacity),
                    state: RunState::Idle,
                    route: None,
                    generation: 0,
                }),
                core: Mutex::new(core),
            }),
        }
    }

    pub fn id(&self) -> AgentId {
        self.cell.id
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.cell.failure_policy
    }

    pub fn run_state(&self) -> RunState {
        self.cell.inner.lock().state
    }

    pub fn mailbox_depth(&self) -> usize {
        self.cell.inner.lock().mailbox.len()
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.run_state(), RunState::Disposed | RunState::Finishing)
    }

    /// Name of the dispatcher the agent is currently routed to.
    pub fn dispatcher(&self) -> Option<String> {
        self.cell
            .inner
            .lock()
            .route
            .as_ref()
            .map(|r| r.dispatcher.to_string())
    }

    /// Sends a payload to this agent.
    pub fn send<T: std::any::Any + Send>(&self, payload: T) -> Result<()> {
        self.send_message(Message::new(payload))
    }

    /// Appends `message` to the mailbox. An idle, bound agent becomes runnable
    /// and is handed to its dispatcher. Never waits for a running burst.
    pub fn send_message(&self, message: Message) -> Result<()> {
        let mut inner = self.cell.inner.lock();
        if matches!(inner.state, RunState::Disposed | RunState::Finishing) {
            return Err(DispatchError::AgentDisposed(self.id()));
        }
        if inner.mailbox.push(message).is_err() {
            return Err(DispatchError::MailboxFull {
                agent: self.id(),
                capacity: inner.mailbox.capacity().unwrap_or_default(),
            });
        }
        if inner.state == RunState::Idle {
            self.schedule_locked(&mut inner);
        }
        Ok(())
    }

    /// Moves an idle agent with pending mail to Runnable and enqueues it.
    fn schedule_locked(&self, inner: &mut Inner) {
        let Some(route) = inner.route.as_ref() else {
            return;
        };
        if route.scheduler.schedule(self, route.placement, inner.generation) {
            inner.state = RunState::Runnable;
        } else {
            inner.state = RunState::Idle;
        }
    }

    /// Installs a new route, invalidating tickets issued under the old one.
    /// Messages queued meanwhile become visible under the new route.
    pub(crate) fn attach(&self, route: Route) -> Result<()> {
        let mut inner = self.cell.inner.lock();
        if matches!(inner.state, RunState::Disposed | RunState::Finishing) {
            return Err(DispatchError::AgentDisposed(self.id()));
        }
        inner.generation += 1;
        debug!(agent = %self.id(), dispatcher = %route.dispatcher, placement = ?route.placement, generation = inner.generation, "Route attached");
        inner.route = Some(route);
        match inner.state {
            RunState::Runnable => self.schedule_locked(&mut inner),
            RunState::Idle if !inner.mailbox.is_empty() => self.schedule_locked(&mut inner),
            // A running agent is rescheduled through the new route when its burst ends.
            _ => {}
        }
        Ok(())
    }

    /// Swaps the route between bursts if the binding is still at `generation`.
    /// Used by dispatchers that move agents internally; a concurrent rebind
    /// or disposal wins.
    pub(crate) fn migrate(&self, route: Route, generation: u64) -> bool {
        let mut inner = self.cell.inner.lock();
        if inner.generation != generation
            || !matches!(inner.state, RunState::Idle | RunState::Runnable)
        {
            return false;
        }
        inner.generation += 1;
        debug!(agent = %self.id(), placement = ?route.placement, generation = inner.generation, "Route migrated");
        inner.route = Some(route);
        if inner.state == RunState::Runnable || !inner.mailbox.is_empty() {
            self.schedule_locked(&mut inner);
        }
        true
    }

    /// Removes the route. Pending messages stay in the mailbox.
    pub(crate) fn detach(&self) {
        let mut inner = self.cell.inner.lock();
        inner.generation += 1;
        inner.route = None;
        if inner.state == RunState::Runnable {
            inner.state = RunState::Idle;
        }
    }

    /// Returns a runnable agent whose ticket was abandoned to Idle.
    pub(crate) fn abandon(&self, generation: u64) {
        let mut inner = self.cell.inner.lock();
        if inner.state == RunState::Runnable && inner.generation == generation {
            inner.state = RunState::Idle;
        }
    }

    /// Disposes the agent. A running agent finishes its current message first.
    ///
    /// An idle agent is released from its dispatcher right away; a running
    /// one is released by its worker when the burst returns.
    pub fn dispose(&self) -> Disposal {
        let (discarded, route) = {
            let mut inner = self.cell.inner.lock();
            match inner.state {
                RunState::Disposed | RunState::Finishing => return Disposal::AlreadyDisposed,
                RunState::Running => {
                    inner.state = RunState::Finishing;
                    debug!(agent = %self.id(), "Dispose deferred until burst ends");
                    return Disposal::Deferred;
                }
                RunState::Idle | RunState::Runnable => {
                    inner.state = RunState::Disposed;
                    inner.generation += 1;
                    (inner.mailbox.clear(), inner.route.take())
                }
            }
        };
        if let Some(route) = route {
            route.scheduler.release(self.id());
        }
        debug!(agent = %self.id(), discarded, "Disposed");
        Disposal::Immediate { discarded }
    }

    /// Runs one burst of at most `limit` messages if the ticket is still valid.
    ///
    /// Returns `None` when the claim fails (stale ticket, disposed agent or an
    /// agent already running elsewhere).
    pub(crate) fn run_burst(&self, generation: u64, limit: Option<usize>) -> Option<BurstReport> {
        {
            let mut inner = self.cell.inner.lock();
            if inner.state != RunState::Runnable || inner.generation != generation {
                trace!(agent = %self.id(), state = ?inner.state, generation, current = inner.generation, "Stale ticket");
                return None;
            }
            inner.state = RunState::Running;
        }

        let mut report = BurstReport::default();
        let mut stop = false;
        let mut core = self.cell.core.lock();
        trace!(agent = %self.id(), ?limit, "Burst started");

        while limit.map_or(true, |max| report.processed + report.failures.len() < max) {
            let envelope = {
                let mut inner = self.cell.inner.lock();
                if inner.state == RunState::Finishing {
                    break;
                }
                // Rebound or migrated: the rest of the mailbox belongs to the new route.
                if inner.generation != generation {
                    break;
                }
                if inner.route.as_ref().is_some_and(|r| r.scheduler.is_stopped()) {
                    break;
                }
                match inner.mailbox.pop() {
                    Some(env) => env,
                    None => break,
                }
            };
            let info = MessageInfo {
                tag: envelope.message.tag(),
                seq: envelope.seq,
            };

            let mut ctx = BurstContext::new(self.clone());
            let outcome = catch_unwind(AssertUnwindSafe(|| core.handle(envelope.message, &mut ctx)));
            report.undeliverable += self.deliver(ctx.take_outgoing());

            let cause = match outcome {
                Ok(Ok(())) => {
                    report.processed += 1;
                    continue;
                }
                Ok(Err(e)) => FailureCause::Error(e.to_string()),
                Err(panic) => FailureCause::Panic(panic_message(panic.as_ref())),
            };
            let failure = AgentFailure {
                agent: self.id(),
                name: self.name().to_string(),
                message: info,
                cause,
            };
            warn!(agent = %self.id(), name = self.name(), error = %failure.cause, tag = failure.message.tag, "Behavior failed");
            report.failures.push(failure);
            if self.cell.failure_policy == FailurePolicy::StopAgent {
                stop = true;
                break;
            }
        }
        drop(core);

        self.finish_burst(stop, &mut report);
        trace!(agent = %self.id(), processed = report.processed, rescheduled = report.rescheduled, "Burst finished");
        Some(report)
    }

    fn finish_burst(&self, stop: bool, report: &mut BurstReport) {
        let mut inner = self.cell.inner.lock();
        if stop || inner.state == RunState::Finishing {
            inner.state = RunState::Disposed;
            inner.generation += 1;
            inner.route = None;
            report.disposed = Some(inner.mailbox.clear());
            return;
        }
        inner.state = RunState::Idle;
        if !inner.mailbox.is_empty() {
            self.schedule_locked(&mut inner);
            report.rescheduled = inner.state == RunState::Runnable;
        }
    }

    /// Delivers outgoing messages, returning how many could not be delivered.
    fn deliver(&self, outgoing: Vec<(AgentRef, Message)>) -> usize {
        let mut failed = 0;
        for (target, message) in outgoing {
            let tag = message.short_tag();
            if let Err(e) = target.send_message(message) {
                warn!(from = %self.id(), to = %target.id(), tag, error = %e, "Outgoing message undeliverable");
                failed += 1;
            }
        }
        failed
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl PartialEq for AgentRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for AgentRef {}

impl fmt::Debug for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRef")
            .field("id", &self.cell.id)
            .field("name", &self.cell.name)
            .finish()
    }
}
