use crate::dispatcher::{
    self, BindPolicy, Binding, BindingTable, DispatchEvent, Dispatcher, DispatcherConfig,
    DispatcherStats, EventBus, Lifecycle,
};
use crate::framework::behavior::{behavior_name, StatefulBehavior};
use crate::framework::{
    AgentId, AgentRef, Behavior, DispatchError, Disposal, DrainReport, FailurePolicy, Result,
    ShutdownReport,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Supervisor-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Deadline used by [`Supervisor::destroy`] and when the supervisor is dropped.
    pub drain_deadline_ms: u64,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Default mailbox capacity for new agents. `None` means unbounded.
    pub mailbox_capacity: Option<usize>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            drain_deadline_ms: 5_000,
            event_capacity: 1024,
            mailbox_capacity: None,
        }
    }
}

impl SupervisorConfig {
    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(DispatchError::InvalidConfig(
                "event_capacity must be positive".into(),
            ));
        }
        if self.mailbox_capacity == Some(0) {
            return Err(DispatchError::InvalidConfig(
                "mailbox_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Per-agent options for [`Supervisor::create_agent_with`].
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    /// Display name. Defaults to the behavior's type name.
    pub name: Option<String>,
    pub policy: BindPolicy,
    pub failure_policy: FailurePolicy,
    /// Overrides [`SupervisorConfig::mailbox_capacity`].
    pub mailbox_capacity: Option<usize>,
}

impl AgentOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: BindPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = Some(capacity);
        self
    }
}

/// Owner of every dispatcher and the binding table.
///
/// `Supervisor` is responsible for:
/// - **Registry**: Named dispatchers, kept in creation order
/// - **Agent Creation**: Building agents and binding them in one step
/// - **Routing**: Bind, rebind and unbind through a single [`BindingTable`]
/// - **Shutdown**: Draining every dispatcher and collecting what was left behind
///
/// # Example
///
/// ```ignore
/// let supervisor = Supervisor::new(SupervisorConfig::default())?;
/// supervisor.create_dispatcher("pool", ThreadPoolConfig::default().with_threads(2))?;
/// supervisor.start("pool")?;
///
/// let counter = supervisor.create_agent("pool", 0u64, from_fn(|n: &mut u64, _msg, _ctx| {
///     *n += 1;
///     Ok(())
/// }))?;
/// counter.send(())?;
///
/// let report = supervisor.shutdown(Duration::from_secs(1));
/// assert!(report.is_clean());
/// ```
pub struct Supervisor {
    config: SupervisorConfig,
    dispatchers: Mutex<Vec<(String, Arc<dyn Dispatcher>)>>,
    bindings: BindingTable,
    events: EventBus,
    next_agent: AtomicU64,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            events: EventBus::new(config.event_capacity),
            config,
            dispatchers: Mutex::new(Vec::new()),
            bindings: BindingTable::new(),
            next_agent: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    // =========================================================================
    // Dispatcher registry
    // =========================================================================

    /// Creates a dispatcher. It accepts bindings right away but runs nothing
    /// until [`start`](Self::start).
    pub fn create_dispatcher(
        &self,
        name: &str,
        config: impl Into<DispatcherConfig>,
    ) -> Result<Arc<dyn Dispatcher>> {
        let config = config.into();
        let mut dispatchers = self.dispatchers.lock();
        if dispatchers.iter().any(|(n, _)| n == name) {
            return Err(DispatchError::DispatcherExists(name.to_string()));
        }
        let kind = config.kind();
        let dispatcher = dispatcher::build(name, config, self.events.clone())?;
        dispatchers.push((name.to_string(), dispatcher.clone()));
        info!(dispatcher = name, ?kind, "Dispatcher created");
        Ok(dispatcher)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Dispatcher>> {
        self.dispatchers
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| DispatchError::DispatcherNotFound(name.to_string()))
    }

    /// Drains the dispatcher with the default deadline, drops the bindings of
    /// its agents and removes it from the registry. Agents keep their mailboxes
    /// and can be bound elsewhere.
    pub fn destroy(&self, name: &str) -> Result<DrainReport> {
        let dispatcher = {
            let mut dispatchers = self.dispatchers.lock();
            let index = dispatchers
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| DispatchError::DispatcherNotFound(name.to_string()))?;
            dispatchers.remove(index).1
        };
        let report = dispatcher.drain(self.config.drain_deadline());
        let orphans = self.bindings.remove_dispatcher(name);
        info!(dispatcher = name, unbound = orphans.len(), clean = report.is_clean(), "Dispatcher destroyed");
        Ok(report)
    }

    /// Dispatcher names in creation order.
    pub fn dispatcher_names(&self) -> Vec<String> {
        self.dispatchers
            .lock()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    // =========================================================================
    // Agents
    // =========================================================================

    /// Creates an agent and binds it to `dispatcher` with the default policy.
    pub fn create_agent<B: Behavior>(
        &self,
        dispatcher: &str,
        state: B::State,
        behavior: B,
    ) -> Result<AgentRef> {
        self.create_agent_with(dispatcher, AgentOptions::default(), state, behavior)
    }

    pub fn create_agent_with<B: Behavior>(
        &self,
        dispatcher: &str,
        options: AgentOptions,
        state: B::State,
        behavior: B,
    ) -> Result<AgentRef> {
        let target = self.lookup(dispatcher)?;
        let id = AgentId(self.next_agent.fetch_add(1, Ordering::Relaxed));
        let name = options.name.unwrap_or_else(behavior_name::<B>);
        let agent = AgentRef::new(
            id,
            name,
            options.failure_policy,
            options.mailbox_capacity.or(self.config.mailbox_capacity),
            Box::new(StatefulBehavior { behavior, state }),
        );
        self.bindings.bind(&agent, &target, options.policy)?;
        Ok(agent)
    }

    pub fn bind(&self, agent: &AgentRef, dispatcher: &str, policy: BindPolicy) -> Result<()> {
        let target = self.lookup(dispatcher)?;
        self.bindings.bind(agent, &target, policy)
    }

    pub fn rebind(&self, agent: &AgentRef, dispatcher: &str, policy: BindPolicy) -> Result<()> {
        let target = self.lookup(dispatcher)?;
        self.bindings.rebind(agent, &target, policy)
    }

    pub fn unbind(&self, agent: &AgentRef) -> Result<()> {
        self.bindings.unbind(agent)
    }

    pub fn binding_of(&self, agent: AgentId) -> Option<Binding> {
        self.bindings.binding_of(agent)
    }

    pub fn send<T: std::any::Any + Send>(&self, agent: &AgentRef, payload: T) -> Result<()> {
        agent.send(payload)
    }

    /// Disposes an agent. A running agent finishes its in-flight message first
    /// and its dispatcher reports the disposal when the burst ends.
    pub fn dispose(&self, agent: &AgentRef) -> Disposal {
        let disposal = agent.dispose();
        if let Disposal::Immediate { discarded } = disposal {
            if let Some(binding) = self.bindings.remove(agent.id()) {
                self.events.publish(DispatchEvent::AgentDisposed {
                    dispatcher: binding.dispatcher,
                    agent: agent.id(),
                    discarded,
                });
            }
        }
        info!(agent = %agent.id(), name = agent.name(), ?disposal, "Dispose requested");
        disposal
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn start(&self, name: &str) -> Result<()> {
        self.lookup(name)?.start()
    }

    pub fn drain(&self, name: &str, deadline: Duration) -> Result<DrainReport> {
        Ok(self.lookup(name)?.drain(deadline))
    }

    pub fn stop(&self, name: &str) -> Result<DrainReport> {
        Ok(self.lookup(name)?.stop())
    }

    pub fn resize(&self, name: &str, threads: usize) -> Result<()> {
        self.lookup(name)?.resize(threads)
    }

    /// Drains every live dispatcher in creation order within one overall
    /// deadline and stops them.
    ///
    /// # Shutdown Process
    ///
    /// Each dispatcher gets whatever is left of `deadline` when its turn
    /// comes; once it is spent the remaining ones are stopped immediately.
    /// Nothing is dropped silently: agents left with mail show up in
    /// [`ShutdownReport::undrained`], behavior failures in
    /// [`ShutdownReport::failures`].
    pub fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        info!(?deadline, "Shutting down supervisor...");
        let started = Instant::now();
        let dispatchers: Vec<Arc<dyn Dispatcher>> = self
            .dispatchers
            .lock()
            .iter()
            .map(|(_, d)| d.clone())
            .collect();

        let mut report = ShutdownReport::default();
        for dispatcher in dispatchers {
            if dispatcher.lifecycle() == Lifecycle::Stopped {
                continue;
            }
            let remaining = deadline.saturating_sub(started.elapsed());
            report.dispatchers.push(dispatcher.drain(remaining));
        }

        for undrained in report.undrained() {
            warn!(dispatcher = %undrained.dispatcher, agents = undrained.agents.len(), pending = undrained.pending_messages(), "Undrained agents at shutdown");
        }
        info!(
            dispatchers = report.dispatchers.len(),
            failures = report.failures().count(),
            clean = report.is_clean(),
            "Supervisor shutdown complete."
        );
        report
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Counters of every dispatcher, in creation order.
    pub fn stats(&self) -> Vec<DispatcherStats> {
        let dispatchers: Vec<Arc<dyn Dispatcher>> = self
            .dispatchers
            .lock()
            .iter()
            .map(|(_, d)| d.clone())
            .collect();
        dispatchers.iter().map(|d| d.stats()).collect()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            events: EventBus::default(),
            config: SupervisorConfig::default(),
            dispatchers: Mutex::new(Vec::new()),
            bindings: BindingTable::new(),
            next_agent: AtomicU64::new(1),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for (name, dispatcher) in self.dispatchers.get_mut().iter() {
            if dispatcher.lifecycle() != Lifecycle::Stopped {
                let report = dispatcher.stop();
                if !report.is_clean() {
                    warn!(dispatcher = %name, "Dispatcher stopped on drop with leftovers");
                }
            }
        }
    }
}
