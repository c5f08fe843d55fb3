//! # Thread-Pool Dispatcher
//!
//! N worker threads share one FIFO ready-queue of agents.
//!
//! ## Worker loop
//!
//! 1. Block on the queue while it is empty.
//! 2. Pop the head ticket and try to claim its agent (`Runnable` → `Running`).
//!    A stale ticket (the agent was rebound or disposed meanwhile) is dropped.
//! 3. Run one burst of at most `burst_limit` messages.
//! 4. If the agent still has mail it goes back to the *tail* of the queue, so an
//!    agent with an endless mailbox cannot starve the others.
//!
//! Ordering between different agents is only queue-position ordering; per-agent
//! message order is the mailbox order.
//!
//! ## Resizing
//!
//! Growing spawns workers that join the same loop. Shrinking raises a retire
//! count; the next workers to reach the top of their loop exit. A worker never
//! exits mid-burst and never touches an agent it does not hold.

use super::config::ThreadPoolConfig;
use super::events::{DispatchEvent, EventBus};
use super::worker::{self, Reporter, Ticket, WorkerThreads};
use super::{
    BindPolicy, Dispatcher, DispatcherKind, DispatcherStats, Lifecycle, Placement, Route, Scheduler,
};
use crate::framework::{AgentId, AgentRef, DispatchError, DrainReport, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct PoolState {
    lifecycle: Lifecycle,
    queue: VecDeque<Ticket>,
    running: usize,
    live: usize,
    target: usize,
    retiring: usize,
    next_worker: usize,
    bound: HashMap<AgentId, AgentRef>,
}

struct PoolShared {
    name: Arc<str>,
    config: ThreadPoolConfig,
    state: Mutex<PoolState>,
    /// Workers wait here for tickets.
    work: Condvar,
    /// Drain waits here for the queue to empty.
    idle: Condvar,
    /// Mirrors `lifecycle == Stopped` for bursts, which read it per message.
    stopped: AtomicBool,
    reporter: Reporter,
}

impl Scheduler for PoolShared {
    fn schedule(&self, agent: &AgentRef, _placement: Placement, generation: u64) -> bool {
        let mut st = self.state.lock();
        if st.lifecycle == Lifecycle::Stopped {
            return false;
        }
        st.queue.push_back(Ticket {
            agent: agent.clone(),
            generation,
        });
        drop(st);
        self.work.notify_one();
        true
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn release(&self, agent: AgentId) {
        if self.state.lock().bound.remove(&agent).is_some() {
            debug!(dispatcher = %self.name, %agent, "Agent released");
        }
    }
}

impl PoolShared {
    fn worker_loop(self: Arc<Self>, worker: usize) {
        info!(dispatcher = %self.name, worker, "Worker started");
        loop {
            let ticket = {
                let mut st = self.state.lock();
                loop {
                    if st.lifecycle == Lifecycle::Stopped {
                        break None;
                    }
                    if st.retiring > 0 {
                        st.retiring -= 1;
                        break None;
                    }
                    if let Some(ticket) = st.queue.pop_front() {
                        st.running += 1;
                        break Some(ticket);
                    }
                    self.work.wait(&mut st);
                }
            };
            let Some(ticket) = ticket else { break };

            if let Some(report) = ticket
                .agent
                .run_burst(ticket.generation, self.config.burst_limit)
            {
                if self.reporter.record(&ticket.agent, report) {
                    self.state.lock().bound.remove(&ticket.agent.id());
                }
            }

            let mut st = self.state.lock();
            st.running -= 1;
            if st.running == 0 && st.queue.is_empty() {
                self.idle.notify_all();
            }
        }

        self.state.lock().live -= 1;
        self.idle.notify_all();
        info!(dispatcher = %self.name, worker, "Worker exited");
    }
}

/// Dispatcher running agents on a resizable pool of OS threads.
pub struct ThreadPoolDispatcher {
    shared: Arc<PoolShared>,
    threads: WorkerThreads,
}

impl ThreadPoolDispatcher {
    pub fn new(name: &str, config: ThreadPoolConfig, events: EventBus) -> Self {
        let target = config.threads;
        Self {
            shared: Arc::new(PoolShared {
                name: Arc::from(name),
                stopped: AtomicBool::new(false),
                reporter: Reporter::new(name, events),
                config,
                state: Mutex::new(PoolState {
                    lifecycle: Lifecycle::Created,
                    queue: VecDeque::new(),
                    running: 0,
                    live: 0,
                    target,
                    retiring: 0,
                    next_worker: 0,
                    bound: HashMap::new(),
                }),
                work: Condvar::new(),
                idle: Condvar::new(),
            }),
            threads: WorkerThreads::default(),
        }
    }

    fn thread_prefix(&self) -> &str {
        self.shared
            .config
            .thread_name
            .as_deref()
            .unwrap_or(&*self.shared.name)
    }

    fn spawn_workers(&self, count: usize) -> std::io::Result<()> {
        for _ in 0..count {
            let id = {
                let mut st = self.shared.state.lock();
                st.live += 1;
                st.next_worker += 1;
                st.next_worker - 1
            };
            let shared = self.shared.clone();
            let name = format!("{}-worker-{}", self.thread_prefix(), id);
            if let Err(e) = self.threads.spawn(name, move || shared.worker_loop(id)) {
                self.shared.state.lock().live -= 1;
                return Err(e);
            }
        }
        Ok(())
    }

    fn set_lifecycle(&self, st: &mut PoolState, lifecycle: Lifecycle) {
        st.lifecycle = lifecycle;
        self.shared
            .stopped
            .store(lifecycle == Lifecycle::Stopped, Ordering::Release);
        self.shared
            .reporter
            .events()
            .publish(DispatchEvent::LifecycleChanged {
                dispatcher: self.shared.name.to_string(),
                lifecycle,
            });
    }

    /// Threads currently alive.
    pub fn live_workers(&self) -> usize {
        self.shared.state.lock().live
    }
}

impl Dispatcher for ThreadPoolDispatcher {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn kind(&self) -> DispatcherKind {
        DispatcherKind::ThreadPool
    }

    fn lifecycle(&self) -> Lifecycle {
        self.shared.state.lock().lifecycle
    }

    fn start(&self) -> Result<()> {
        let count = {
            let mut st = self.shared.state.lock();
            match st.lifecycle {
                Lifecycle::Created => {}
                Lifecycle::Started => return Ok(()),
                state => {
                    return Err(DispatchError::NotAccepting {
                        dispatcher: self.name().to_string(),
                        state,
                    })
                }
            }
            self.set_lifecycle(&mut st, Lifecycle::Started);
            st.target
        };

        if let Err(e) = self.spawn_workers(count) {
            warn!(dispatcher = %self.shared.name, error = %e, "Worker spawn failed, stopping started workers");
            self.stop();
            return Err(DispatchError::Spawn(e));
        }
        info!(dispatcher = %self.shared.name, threads = count, "Thread pool started");
        Ok(())
    }

    fn admit(&self, agent: &AgentRef, policy: BindPolicy) -> Result<Route> {
        if policy != BindPolicy::Default {
            return Err(DispatchError::InvalidPolicy {
                dispatcher: self.name().to_string(),
                reason: format!("{policy:?} is not supported by a thread pool"),
            });
        }
        let mut st = self.shared.state.lock();
        if !st.lifecycle.accepts_bindings() {
            return Err(DispatchError::NotAccepting {
                dispatcher: self.name().to_string(),
                state: st.lifecycle,
            });
        }
        st.bound.insert(agent.id(), agent.clone());
        debug!(dispatcher = %self.shared.name, agent = %agent.id(), bound = st.bound.len(), "Agent admitted");
        Ok(Route {
            dispatcher: self.shared.name.clone(),
            scheduler: self.shared.clone(),
            placement: Placement::Shared,
        })
    }

    fn release(&self, agent: AgentId) {
        self.shared.release(agent);
    }

    fn drain(&self, deadline: Duration) -> DrainReport {
        let shared = &self.shared;
        let deadline_at = Instant::now().checked_add(deadline);
        let leftovers: Vec<Ticket> = {
            let mut st = shared.state.lock();
            if st.lifecycle == Lifecycle::Stopped {
                return DrainReport {
                    dispatcher: self.name().to_string(),
                    undrained: None,
                    failures: shared.reporter.take_failures(),
                };
            }
            if st.lifecycle == Lifecycle::Draining {
                // The caller already draining reports the leftovers.
                while st.lifecycle != Lifecycle::Stopped {
                    shared.idle.wait(&mut st);
                }
                return DrainReport {
                    dispatcher: self.name().to_string(),
                    undrained: None,
                    failures: Vec::new(),
                };
            }
            let was_started = st.lifecycle == Lifecycle::Started;
            self.set_lifecycle(&mut st, Lifecycle::Draining);
            info!(dispatcher = %shared.name, queued = st.queue.len(), running = st.running, ?deadline, "Draining");

            if was_started {
                while st.live > 0 && !(st.queue.is_empty() && st.running == 0) {
                    match deadline_at {
                        Some(at) => {
                            if shared.idle.wait_until(&mut st, at).timed_out() {
                                break;
                            }
                        }
                        None => shared.idle.wait(&mut st),
                    }
                }
            }
            let leftovers = st.queue.drain(..).collect();
            self.set_lifecycle(&mut st, Lifecycle::Stopped);
            leftovers
        };
        shared.work.notify_all();
        shared.idle.notify_all();
        self.threads.join_all(&shared.name);

        for ticket in &leftovers {
            ticket.agent.abandon(ticket.generation);
        }
        let bound: Vec<AgentRef> = shared.state.lock().bound.values().cloned().collect();
        let undrained = worker::undrained(&shared.name, bound);
        if let Some(report) = &undrained {
            warn!(dispatcher = %shared.name, agents = report.agents.len(), pending = report.pending_messages(), "Drain deadline left agents undrained");
            shared
                .reporter
                .events()
                .publish(DispatchEvent::Undrained(report.clone()));
        }
        info!(dispatcher = %shared.name, "Thread pool stopped");
        DrainReport {
            dispatcher: self.name().to_string(),
            undrained,
            failures: shared.reporter.take_failures(),
        }
    }

    fn resize(&self, threads: usize) -> Result<()> {
        if threads == 0 {
            return Err(DispatchError::InvalidConfig(
                "thread pool needs at least one thread".into(),
            ));
        }
        let spawn = {
            let mut st = self.shared.state.lock();
            let current = st.target;
            match st.lifecycle {
                Lifecycle::Created => {
                    st.target = threads;
                    return Ok(());
                }
                Lifecycle::Started => {}
                state => {
                    return Err(DispatchError::NotAccepting {
                        dispatcher: self.name().to_string(),
                        state,
                    })
                }
            }
            st.target = threads;
            info!(dispatcher = %self.shared.name, from = current, to = threads, "Resizing");
            if threads >= current {
                let grow = threads - current;
                let cancelled = grow.min(st.retiring);
                st.retiring -= cancelled;
                grow - cancelled
            } else {
                st.retiring += current - threads;
                drop(st);
                self.shared.work.notify_all();
                0
            }
        };
        self.spawn_workers(spawn)?;
        Ok(())
    }

    fn stats(&self) -> DispatcherStats {
        let st = self.shared.state.lock();
        DispatcherStats {
            name: self.name().to_string(),
            kind: DispatcherKind::ThreadPool,
            lifecycle: st.lifecycle,
            live_workers: st.live,
            queued: st.queue.len(),
            running: st.running,
            bound_agents: st.bound.len(),
            lane_depths: Vec::new(),
            worker_queue_depths: Vec::new(),
        }
    }
}

impl Drop for ThreadPoolDispatcher {
    fn drop(&mut self) {
        if self.lifecycle() != Lifecycle::Stopped {
            self.stop();
        }
    }
}
