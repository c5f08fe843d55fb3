//! Pieces shared by every dispatcher kind: tickets, the worker thread set and
//! the failure reporter.

use super::events::{DispatchEvent, EventBus};
use crate::framework::agent::BurstReport;
use crate::framework::{AgentFailure, AgentRef, UndrainedAgent, UndrainedAgents};
use parking_lot::Mutex;
use std::io;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Ready-queue entry: an agent plus the binding generation it was queued under.
#[derive(Debug, Clone)]
pub(crate) struct Ticket {
    pub(crate) agent: AgentRef,
    pub(crate) generation: u64,
}

/// Join handles of a dispatcher's threads.
#[derive(Default)]
pub(crate) struct WorkerThreads {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerThreads {
    pub(crate) fn spawn<F>(&self, name: String, body: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name).spawn(body)?;
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Joins every thread spawned so far, including ones that already exited.
    pub(crate) fn join_all(&self, dispatcher: &str) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let thread = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                warn!(dispatcher, thread, "Worker thread panicked");
            }
        }
    }
}

/// Records burst failures and disposals for one dispatcher.
pub(crate) struct Reporter {
    dispatcher: String,
    failures: Mutex<Vec<AgentFailure>>,
    events: EventBus,
}

impl Reporter {
    pub(crate) fn new(dispatcher: &str, events: EventBus) -> Self {
        Self {
            dispatcher: dispatcher.to_string(),
            failures: Mutex::new(Vec::new()),
            events,
        }
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    /// Publishes what a burst produced. Returns `true` if the agent ended disposed.
    pub(crate) fn record(&self, agent: &AgentRef, report: BurstReport) -> bool {
        if !report.failures.is_empty() {
            for failure in &report.failures {
                self.events
                    .publish(DispatchEvent::AgentFailed(failure.clone()));
            }
            self.failures.lock().extend(report.failures);
        }
        match report.disposed {
            Some(discarded) => {
                info!(dispatcher = %self.dispatcher, agent = %agent.id(), discarded, "Agent disposed after burst");
                self.events.publish(DispatchEvent::AgentDisposed {
                    dispatcher: self.dispatcher.clone(),
                    agent: agent.id(),
                    discarded,
                });
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_failures(&self) -> Vec<AgentFailure> {
        std::mem::take(&mut *self.failures.lock())
    }
}

/// Agents that still hold messages once every worker has been joined.
pub(crate) fn undrained(dispatcher: &str, bound: Vec<AgentRef>) -> Option<UndrainedAgents> {
    let mut agents: Vec<UndrainedAgent> = bound
        .into_iter()
        .filter_map(|agent| {
            let pending = agent.mailbox_depth();
            (pending > 0).then(|| UndrainedAgent {
                agent: agent.id(),
                name: agent.name().to_string(),
                pending,
            })
        })
        .collect();
    if agents.is_empty() {
        return None;
    }
    agents.sort_by_key(|a| a.agent);
    Some(UndrainedAgents {
        dispatcher: dispatcher.to_string(),
        agents,
    })
}
