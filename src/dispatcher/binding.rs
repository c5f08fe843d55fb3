//! # Binding Table
//!
//! Maps every bound agent to the dispatcher (and policy) allowed to run it.
//!
//! All binding changes go through this table. An operation holds the table
//! lock for its whole duration, asks the dispatcher to admit the agent, then
//! installs the resulting route on the agent. Installing a route bumps the
//! agent's generation, which is what makes rebinding atomic with respect to
//! delivery: a ticket queued under the old route can no longer be claimed, and
//! messages sent in between are picked up under the new route.
//!
//! Lock order is table → agent → dispatcher state; dispatchers never call back
//! into the table.

use super::{BindPolicy, Dispatcher};
use crate::framework::{AgentId, AgentRef, DispatchError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Public view of one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub dispatcher: String,
    pub policy: BindPolicy,
}

struct Entry {
    agent: AgentRef,
    dispatcher: Arc<dyn Dispatcher>,
    policy: BindPolicy,
}

impl Entry {
    fn view(&self) -> Binding {
        Binding {
            dispatcher: self.dispatcher.name().to_string(),
            policy: self.policy,
        }
    }
}

#[derive(Default)]
pub struct BindingTable {
    entries: Mutex<HashMap<AgentId, Entry>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds an unbound agent.
    pub fn bind(
        &self,
        agent: &AgentRef,
        dispatcher: &Arc<dyn Dispatcher>,
        policy: BindPolicy,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        prune(&mut entries, agent.id());
        if let Some(existing) = entries.get(&agent.id()) {
            return Err(DispatchError::AlreadyBound {
                agent: agent.id(),
                dispatcher: existing.dispatcher.name().to_string(),
            });
        }
        if agent.is_disposed() {
            return Err(DispatchError::AgentDisposed(agent.id()));
        }

        let route = dispatcher.admit(agent, policy)?;
        if let Err(e) = agent.attach(route) {
            dispatcher.release(agent.id());
            return Err(e);
        }
        entries.insert(
            agent.id(),
            Entry {
                agent: agent.clone(),
                dispatcher: dispatcher.clone(),
                policy,
            },
        );
        info!(agent = %agent.id(), name = agent.name(), dispatcher = dispatcher.name(), ?policy, "Bound");
        Ok(())
    }

    /// Moves a bound agent to `dispatcher` (possibly the same one with a new
    /// policy). No message is lost or run twice.
    pub fn rebind(
        &self,
        agent: &AgentRef,
        dispatcher: &Arc<dyn Dispatcher>,
        policy: BindPolicy,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        if prune(&mut entries, agent.id()) {
            return Err(DispatchError::AgentDisposed(agent.id()));
        }
        let Some(old) = entries.get(&agent.id()) else {
            return Err(DispatchError::NotBound(agent.id()));
        };
        let same = Arc::ptr_eq(&old.dispatcher, dispatcher);
        let old_dispatcher = old.dispatcher.clone();

        let route = dispatcher.admit(agent, policy)?;
        if let Err(e) = agent.attach(route) {
            if !same {
                dispatcher.release(agent.id());
            }
            return Err(e);
        }
        if !same {
            old_dispatcher.release(agent.id());
        }
        entries.insert(
            agent.id(),
            Entry {
                agent: agent.clone(),
                dispatcher: dispatcher.clone(),
                policy,
            },
        );
        info!(agent = %agent.id(), from = old_dispatcher.name(), to = dispatcher.name(), ?policy, "Rebound");
        Ok(())
    }

    /// Removes the binding. The mailbox is left as is.
    pub fn unbind(&self, agent: &AgentRef) -> Result<()> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.remove(&agent.id()) else {
            return Err(DispatchError::NotBound(agent.id()));
        };
        agent.detach();
        entry.dispatcher.release(agent.id());
        info!(agent = %agent.id(), dispatcher = entry.dispatcher.name(), pending = agent.mailbox_depth(), "Unbound");
        Ok(())
    }

    /// Drops the entry of a disposed agent.
    pub fn remove(&self, agent: AgentId) -> Option<Binding> {
        let entry = self.entries.lock().remove(&agent)?;
        entry.dispatcher.release(agent);
        debug!(%agent, dispatcher = entry.dispatcher.name(), "Binding removed");
        Some(entry.view())
    }

    /// Unbinds every agent of `dispatcher`, returning them.
    pub fn remove_dispatcher(&self, dispatcher: &str) -> Vec<AgentRef> {
        let mut entries = self.entries.lock();
        let ids: Vec<AgentId> = entries
            .iter()
            .filter(|(_, e)| e.dispatcher.name() == dispatcher)
            .map(|(id, _)| *id)
            .collect();
        let mut agents = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = entries.remove(&id) {
                entry.agent.detach();
                entry.dispatcher.release(id);
                agents.push(entry.agent);
            }
        }
        debug!(dispatcher, agents = agents.len(), "Bindings dropped");
        agents
    }

    pub fn binding_of(&self, agent: AgentId) -> Option<Binding> {
        let mut entries = self.entries.lock();
        prune(&mut entries, agent);
        entries.get(&agent).map(Entry::view)
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|id, e| {
            let disposed = e.agent.is_disposed();
            if disposed {
                e.dispatcher.release(*id);
            }
            !disposed
        });
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the entry of `agent` if it has been disposed. Returns whether it did.
fn prune(entries: &mut HashMap<AgentId, Entry>, agent: AgentId) -> bool {
    let disposed = entries
        .get(&agent)
        .is_some_and(|e| e.agent.is_disposed());
    if disposed {
        if let Some(entry) = entries.remove(&agent) {
            entry.dispatcher.release(agent);
        }
    }
    disposed
}
