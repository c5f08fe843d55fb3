//! # Tricky Dispatcher
//!
//! A dispatcher built to exercise the awkward corners of the dispatcher
//! contract. It combines three placements on one set of queues:
//!
//! | Policy              | Placement            | Served by                         |
//! |---------------------|----------------------|-----------------------------------|
//! | `Default`           | default lane         | any pool worker                   |
//! | `Priority(p)`       | lane `p`             | any pool worker                   |
//! | `Pinned(i)`         | private queue of `i` | pool worker `i` only              |
//! | `Exclusive`         | exclusive slot       | a thread dedicated to that agent  |
//!
//! ## Lanes and aging
//!
//! Pool workers look at their private queue first, then at the lane heads. A
//! lane head's rank is its lane index plus one for every `aging_threshold` it
//! has waited, capped at the top lane. The best rank wins; on a tie the entry
//! that has waited longest goes first. A low-priority agent therefore waits at
//! most `lanes × aging_threshold` behind a stream of urgent ones.
//!
//! ## Migration
//!
//! After a burst of a pinned agent its worker compares private queue lengths.
//! If its own queue is longer than the shortest one by more than
//! `migration_threshold`, the agent is re-pinned there. The swap bumps the
//! agent's generation like a rebind does, so the ticket left in the old queue
//! is dropped on claim.

use super::config::TrickyConfig;
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

struct LaneEntry {
    ticket: Ticket,
    enqueued: Instant,
}

struct ExclusiveSlot {
    queue: VecDeque<Ticket>,
    spawned: bool,
}

struct BoundAgent {
    agent: AgentRef,
    placement: Placement,
}

struct TrickyState {
    lifecycle: Lifecycle,
    lanes: Vec<VecDeque<LaneEntry>>,
    private: Vec<VecDeque<Ticket>>,
    exclusive: HashMap<usize, ExclusiveSlot>,
    next_slot: usize,
    running: usize,
    live: usize,
    bound: HashMap<AgentId, BoundAgent>,
}

impl TrickyState {
    fn queued(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum::<usize>()
            + self.private.iter().map(VecDeque::len).sum::<usize>()
            + self.exclusive.values().map(|s| s.queue.len()).sum::<usize>()
    }

    fn is_idle(&self) -> bool {
        self.running == 0 && self.queued() == 0
    }

    /// Pops the lane head with the best effective rank.
    fn pick_lane(&mut self, now: Instant, aging: Duration) -> Option<Ticket> {
        let top = self.lanes.len().saturating_sub(1);
        let mut best: Option<(usize, Instant, usize)> = None;
        for (lane, queue) in self.lanes.iter().enumerate() {
            let Some(head) = queue.front() else { continue };
            let rank = effective_rank(lane, now.saturating_duration_since(head.enqueued), aging, top);
            let better = match best {
                None => true,
                Some((best_rank, best_enqueued, _)) => {
                    rank > best_rank || (rank == best_rank && head.enqueued < best_enqueued)
                }
            };
            if better {
                best = Some((rank, head.enqueued, lane));
            }
        }
        let (_, _, lane) = best?;
        self.lanes[lane].pop_front().map(|e| e.ticket)
    }

    /// Worker with the shortest private queue (lowest index on ties).
    fn least_loaded(&self) -> (usize, usize) {
        self.private
            .iter()
            .enumerate()
            .map(|(i, q)| (i, q.len()))
            .min_by_key(|&(i, len)| (len, i))
            .unwrap_or((0, 0))
    }

    fn drain_tickets(&mut self) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = Vec::new();
        for lane in &mut self.lanes {
            tickets.extend(lane.drain(..).map(|e| e.ticket));
        }
        for queue in &mut self.private {
            tickets.extend(queue.drain(..));
        }
        for slot in self.exclusive.values_mut() {
            tickets.extend(slot.queue.drain(..));
        }
        tickets
    }

    /// Forgets the agent's placement, closing its exclusive slot if it had one.
    fn forget(&mut self, agent: AgentId) -> Option<BoundAgent> {
        let bound = self.bound.remove(&agent)?;
        if let Placement::Exclusive(slot) = bound.placement {
            self.exclusive.remove(&slot);
        }
        Some(bound)
    }
}

/// `lane + floor(waited / aging)`, capped at `top`. A zero threshold disables aging.
fn effective_rank(lane: usize, waited: Duration, aging: Duration, top: usize) -> usize {
    if aging.is_zero() {
        return lane;
    }
    let boost = (waited.as_nanos() / aging.as_nanos()).min(usize::MAX as u128) as usize;
    lane.saturating_add(boost).min(top)
}

struct TrickyShared {
    name: Arc<str>,
    config: TrickyConfig,
    default_lane: usize,
    state: Mutex<TrickyState>,
    work: Condvar,
    idle: Condvar,
    stopped: AtomicBool,
    reporter: Reporter,
}

impl Scheduler for TrickyShared {
    fn schedule(&self, agent: &AgentRef, placement: Placement, generation: u64) -> bool {
        let mut st = self.state.lock();
        if st.lifecycle == Lifecycle::Stopped {
            return false;
        }
        let ticket = Ticket {
            agent: agent.clone(),
            generation,
        };
        match placement {
            Placement::Lane(lane) => st.lanes[lane].push_back(LaneEntry {
                ticket,
                enqueued: Instant::now(),
            }),
            Placement::Shared => st.lanes[self.default_lane].push_back(LaneEntry {
                ticket,
                enqueued: Instant::now(),
            }),
            Placement::Worker(worker) => st.private[worker].push_back(ticket),
            Placement::Exclusive(slot) => match st.exclusive.get_mut(&slot) {
                Some(slot) => slot.queue.push_back(ticket),
                None => return false,
            },
        }
        drop(st);
        // Queues are targeted, so every waiter has to look.
        self.work.notify_all();
        true
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn release(&self, agent: AgentId) {
        let released = self.state.lock().forget(agent);
        if let Some(bound) = released {
            if let Placement::Exclusive(slot) = bound.placement {
                self.work.notify_all();
                debug!(dispatcher = %self.name, %agent, slot, "Exclusive slot closed");
            }
            debug!(dispatcher = %self.name, %agent, "Agent released");
        }
    }
}

enum Source {
    Pool(usize),
    Exclusive(usize),
}

impl TrickyShared {
    fn next_ticket(&self, source: &Source) -> Option<Ticket> {
        let mut st = self.state.lock();
        loop {
            if st.lifecycle == Lifecycle::Stopped {
                return None;
            }
            let ticket = match *source {
                Source::Pool(worker) => match st.private[worker].pop_front() {
                    Some(ticket) => Some(ticket),
                    None => st.pick_lane(Instant::now(), self.config.aging_threshold()),
                },
                Source::Exclusive(slot) => match st.exclusive.get_mut(&slot) {
                    Some(slot) => slot.queue.pop_front(),
                    None => return None,
                },
            };
            if let Some(ticket) = ticket {
                st.running += 1;
                return Some(ticket);
            }
            self.work.wait(&mut st);
        }
    }

    fn run_loop(self: Arc<Self>, source: Source) {
        match source {
            Source::Pool(worker) => info!(dispatcher = %self.name, worker, "Worker started"),
            Source::Exclusive(slot) => info!(dispatcher = %self.name, slot, "Exclusive thread started"),
        }
        while let Some(ticket) = self.next_ticket(&source) {
            let ran = match ticket
                .agent
                .run_burst(ticket.generation, self.config.burst_limit)
            {
                Some(report) => {
                    if self.reporter.record(&ticket.agent, report) {
                        self.state.lock().forget(ticket.agent.id());
                        false
                    } else {
                        true
                    }
                }
                None => false,
            };
            if let (true, Source::Pool(worker)) = (ran, &source) {
                self.maybe_migrate(&ticket, *worker);
            }

            let mut st = self.state.lock();
            st.running -= 1;
            if st.is_idle() {
                self.idle.notify_all();
            }
        }

        self.state.lock().live -= 1;
        self.idle.notify_all();
        match source {
            Source::Pool(worker) => info!(dispatcher = %self.name, worker, "Worker exited"),
            Source::Exclusive(slot) => info!(dispatcher = %self.name, slot, "Exclusive thread exited"),
        }
    }

    /// Re-pins an agent that just ran on worker `from` if `from` is overloaded.
    fn maybe_migrate(self: &Arc<Self>, ticket: &Ticket, from: usize) {
        let Some(threshold) = self.config.migration_threshold else {
            return;
        };
        let id = ticket.agent.id();
        let (to, load_from, load_to) = {
            let st = self.state.lock();
            let pinned_here = st
                .bound
                .get(&id)
                .is_some_and(|b| b.placement == Placement::Worker(from));
            if !pinned_here || st.lifecycle == Lifecycle::Stopped {
                return;
            }
            let (to, min) = st.least_loaded();
            let load = st.private[from].len();
            if to == from || load <= min.saturating_add(threshold) {
                return;
            }
            (to, load, min)
        };

        let route = Route {
            dispatcher: self.name.clone(),
            scheduler: self.clone(),
            placement: Placement::Worker(to),
        };
        if ticket.agent.migrate(route, ticket.generation) {
            let mut st = self.state.lock();
            if let Some(bound) = st.bound.get_mut(&id) {
                if bound.placement == Placement::Worker(from) {
                    bound.placement = Placement::Worker(to);
                }
            }
            info!(dispatcher = %self.name, agent = %id, from, to, load_from, load_to, "Pinned agent migrated");
        }
    }
}

/// Dispatcher with priority lanes, pinned workers and exclusive threads.
pub struct TrickyDispatcher {
    shared: Arc<TrickyShared>,
    threads: WorkerThreads,
}

impl TrickyDispatcher {
    pub fn new(name: &str, config: TrickyConfig, events: EventBus) -> Self {
        let lanes = config.lanes.max(1);
        let state = TrickyState {
            lifecycle: Lifecycle::Created,
            lanes: (0..lanes).map(|_| VecDeque::new()).collect(),
            private: (0..config.threads.max(1)).map(|_| VecDeque::new()).collect(),
            exclusive: HashMap::new(),
            next_slot: 0,
            running: 0,
            live: 0,
            bound: HashMap::new(),
        };
        Self {
            shared: Arc::new(TrickyShared {
                name: Arc::from(name),
                reporter: Reporter::new(name, events),
                default_lane: config.default_priority().lane().min(lanes - 1),
                config,
                state: Mutex::new(state),
                work: Condvar::new(),
                idle: Condvar::new(),
                stopped: AtomicBool::new(false),
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

    fn spawn(&self, source: Source) -> std::io::Result<()> {
        let name = match source {
            Source::Pool(worker) => format!("{}-worker-{}", self.thread_prefix(), worker),
            Source::Exclusive(slot) => format!("{}-exclusive-{}", self.thread_prefix(), slot),
        };
        self.shared.state.lock().live += 1;
        let shared = self.shared.clone();
        if let Err(e) = self.threads.spawn(name, move || shared.run_loop(source)) {
            self.shared.state.lock().live -= 1;
            return Err(e);
        }
        Ok(())
    }

    fn set_lifecycle(&self, st: &mut TrickyState, lifecycle: Lifecycle) {
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

    fn placement_for(&self, st: &TrickyState, agent: AgentId, policy: BindPolicy) -> Result<Placement> {
        let invalid = |reason: String| DispatchError::InvalidPolicy {
            dispatcher: self.name().to_string(),
            reason,
        };
        Ok(match policy {
            BindPolicy::Default => Placement::Lane(self.shared.default_lane),
            BindPolicy::Priority(p) if p.lane() < st.lanes.len() => Placement::Lane(p.lane()),
            BindPolicy::Priority(p) => {
                return Err(invalid(format!(
                    "priority {} out of range for {} lanes",
                    p.0,
                    st.lanes.len()
                )))
            }
            BindPolicy::Pinned(Some(worker)) if worker < st.private.len() => {
                Placement::Worker(worker)
            }
            BindPolicy::Pinned(Some(worker)) => {
                return Err(invalid(format!(
                    "worker {worker} out of range for {} workers",
                    st.private.len()
                )))
            }
            BindPolicy::Pinned(None) => {
                let mut pinned = vec![0usize; st.private.len()];
                for (id, bound) in &st.bound {
                    if *id == agent {
                        continue;
                    }
                    if let Placement::Worker(w) = bound.placement {
                        pinned[w] += 1;
                    }
                }
                let worker = (0..st.private.len())
                    .min_by_key(|&w| (st.private[w].len(), pinned[w], w))
                    .unwrap_or(0);
                Placement::Worker(worker)
            }
            BindPolicy::Exclusive => Placement::Exclusive(st.next_slot),
        })
    }

    /// Threads currently alive, pool workers and exclusive threads together.
    pub fn live_threads(&self) -> usize {
        self.shared.state.lock().live
    }
}

impl Dispatcher for TrickyDispatcher {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn kind(&self) -> DispatcherKind {
        DispatcherKind::Tricky
    }

    fn lifecycle(&self) -> Lifecycle {
        self.shared.state.lock().lifecycle
    }

    fn start(&self) -> Result<()> {
        let (workers, slots) = {
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
            let mut slots: Vec<usize> = Vec::new();
            for (slot, entry) in st.exclusive.iter_mut() {
                if !entry.spawned {
                    entry.spawned = true;
                    slots.push(*slot);
                }
            }
            (st.private.len(), slots)
        };

        let spawned = (0..workers)
            .map(Source::Pool)
            .chain(slots.into_iter().map(Source::Exclusive))
            .try_for_each(|source| self.spawn(source));
        if let Err(e) = spawned {
            warn!(dispatcher = %self.shared.name, error = %e, "Thread spawn failed, stopping started threads");
            self.stop();
            return Err(DispatchError::Spawn(e));
        }
        info!(dispatcher = %self.shared.name, workers, lanes = self.shared.config.lanes, "Tricky dispatcher started");
        Ok(())
    }

    fn admit(&self, agent: &AgentRef, policy: BindPolicy) -> Result<Route> {
        let (placement, spawn_slot) = {
            let mut st = self.shared.state.lock();
            if !st.lifecycle.accepts_bindings() {
                return Err(DispatchError::NotAccepting {
                    dispatcher: self.name().to_string(),
                    state: st.lifecycle,
                });
            }
            let placement = self.placement_for(&st, agent.id(), policy)?;
            // Re-admission within this dispatcher replaces the old placement.
            st.forget(agent.id());
            let mut spawn_slot = None;
            if let Placement::Exclusive(slot) = placement {
                st.next_slot += 1;
                let started = st.lifecycle == Lifecycle::Started;
                st.exclusive.insert(
                    slot,
                    ExclusiveSlot {
                        queue: VecDeque::new(),
                        spawned: started,
                    },
                );
                if started {
                    spawn_slot = Some(slot);
                }
            }
            st.bound.insert(
                agent.id(),
                BoundAgent {
                    agent: agent.clone(),
                    placement,
                },
            );
            (placement, spawn_slot)
        };
        self.shared.work.notify_all();

        if let Some(slot) = spawn_slot {
            if let Err(e) = self.spawn(Source::Exclusive(slot)) {
                self.shared.state.lock().forget(agent.id());
                return Err(DispatchError::Spawn(e));
            }
        }
        debug!(dispatcher = %self.shared.name, agent = %agent.id(), ?placement, "Agent admitted");
        Ok(Route {
            dispatcher: self.shared.name.clone(),
            scheduler: self.shared.clone(),
            placement,
        })
    }

    fn release(&self, agent: AgentId) {
        self.shared.release(agent);
    }

    fn drain(&self, deadline: Duration) -> DrainReport {
        let shared = &self.shared;
        let deadline_at = Instant::now().checked_add(deadline);
        let leftovers = {
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
            info!(dispatcher = %shared.name, queued = st.queued(), running = st.running, ?deadline, "Draining");

            if was_started {
                while st.live > 0 && !st.is_idle() {
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
            let leftovers = st.drain_tickets();
            self.set_lifecycle(&mut st, Lifecycle::Stopped);
            leftovers
        };
        shared.work.notify_all();
        shared.idle.notify_all();
        self.threads.join_all(&shared.name);

        for ticket in &leftovers {
            ticket.agent.abandon(ticket.generation);
        }
        let bound: Vec<AgentRef> = shared
            .state
            .lock()
            .bound
            .values()
            .map(|b| b.agent.clone())
            .collect();
        let undrained = worker::undrained(&shared.name, bound);
        if let Some(report) = &undrained {
            warn!(dispatcher = %shared.name, agents = report.agents.len(), pending = report.pending_messages(), "Drain deadline left agents undrained");
            shared
                .reporter
                .events()
                .publish(DispatchEvent::Undrained(report.clone()));
        }
        info!(dispatcher = %shared.name, "Tricky dispatcher stopped");
        DrainReport {
            dispatcher: self.name().to_string(),
            undrained,
            failures: shared.reporter.take_failures(),
        }
    }

    fn stats(&self) -> DispatcherStats {
        let st = self.shared.state.lock();
        DispatcherStats {
            name: self.name().to_string(),
            kind: DispatcherKind::Tricky,
            lifecycle: st.lifecycle,
            live_workers: st.live,
            queued: st.queued(),
            running: st.running,
            bound_agents: st.bound.len(),
            lane_depths: st.lanes.iter().map(VecDeque::len).collect(),
            worker_queue_depths: st.private.iter().map(VecDeque::len).collect(),
        }
    }
}

impl Drop for TrickyDispatcher {
    fn drop(&mut self) {
        if self.lifecycle() != Lifecycle::Stopped {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Priority;
    use crate::framework::behavior::StatefulBehavior;
    use crate::framework::mock::{wait_until, Gate, Journal, Observation, RecordingBehavior};
    use crate::framework::{from_fn, BurstContext, Disposal, FailurePolicy, Message, RunState};

    const WAIT: Duration = Duration::from_secs(5);

    fn tricky(config: TrickyConfig) -> TrickyDispatcher {
        let d = TrickyDispatcher::new("tricky", config, EventBus::default());
        d.start().unwrap();
        d
    }

    fn recorder(id: u64, journal: &Journal<Observation>) -> AgentRef {
        AgentRef::new(
            AgentId(id),
            format!("recorder-{id}"),
            FailurePolicy::SkipMessage,
            None,
            Box::new(StatefulBehavior {
                behavior: RecordingBehavior::new(journal.clone()),
                state: (),
            }),
        )
    }

    /// Agent that signals `entered`, then blocks on `gate` for every message.
    fn blocker(id: u64, entered: &Gate, gate: &Gate) -> AgentRef {
        let entered = entered.clone();
        let gate = gate.clone();
        AgentRef::new(
            AgentId(id),
            "blocker".into(),
            FailurePolicy::SkipMessage,
            None,
            Box::new(StatefulBehavior {
                behavior: from_fn(move |_: &mut (), _msg: Message, _ctx: &mut BurstContext| {
                    entered.open();
                    gate.wait(WAIT);
                    Ok(())
                }),
                state: (),
            }),
        )
    }

    fn bind(d: &TrickyDispatcher, agent: &AgentRef, policy: BindPolicy) {
        let route = d.admit(agent, policy).unwrap();
        agent.attach(route).unwrap();
    }

    #[test]
    fn effective_rank_ages_and_caps() {
        let aging = Duration::from_millis(10);
        assert_eq!(effective_rank(0, Duration::from_millis(9), aging, 2), 0);
        assert_eq!(effective_rank(0, Duration::from_millis(10), aging, 2), 1);
        assert_eq!(effective_rank(0, Duration::from_secs(60), aging, 2), 2);
        assert_eq!(effective_rank(1, Duration::from_secs(60), Duration::ZERO, 2), 1);
    }

    fn aging_scenario(aging: Duration) -> Vec<AgentId> {
        let d = tricky(
            TrickyConfig::default()
                .with_threads(1)
                .with_lanes(2)
                .with_aging_threshold(aging),
        );
        let entered = Gate::new();
        let gate = Gate::new();
        let journal = Journal::new();
        let a = blocker(1, &entered, &gate);
        let b = recorder(2, &journal);
        let c = recorder(3, &journal);
        bind(&d, &a, BindPolicy::Priority(Priority(1)));
        bind(&d, &b, BindPolicy::Priority(Priority(0)));
        bind(&d, &c, BindPolicy::Priority(Priority(1)));

        a.send(()).unwrap();
        assert!(entered.wait(WAIT));
        b.send(1u64).unwrap();
        std::thread::sleep(Duration::from_millis(120));
        c.send(1u64).unwrap();
        gate.open();

        assert!(wait_until(WAIT, || journal.len() == 2));
        d.stop();
        journal.snapshot().into_iter().map(|o| o.agent).collect()
    }

    #[test]
    fn aged_low_priority_agent_runs_before_fresh_high_priority_one() {
        let order = aging_scenario(Duration::from_millis(50));
        assert_eq!(order, vec![AgentId(2), AgentId(3)]);
    }

    #[test]
    fn without_aging_high_priority_goes_first() {
        let order = aging_scenario(Duration::ZERO);
        assert_eq!(order, vec![AgentId(3), AgentId(2)]);
    }

    #[test]
    fn exclusive_agent_gets_its_own_thread() {
        let d = tricky(TrickyConfig::default().with_threads(2));
        assert!(wait_until(WAIT, || d.live_threads() == 2));
        let journal = Journal::new();
        let agent = recorder(1, &journal);
        bind(&d, &agent, BindPolicy::Exclusive);
        assert!(wait_until(WAIT, || d.live_threads() == 3));

        for n in 0..3u64 {
            agent.send(n).unwrap();
        }
        assert!(wait_until(WAIT, || journal.len() == 3));
        assert!(journal
            .snapshot()
            .iter()
            .all(|o| o.thread == "tricky-exclusive-0"));

        agent.detach();
        d.release(agent.id());
        assert!(wait_until(WAIT, || d.live_threads() == 2));
        assert!(d.drain(WAIT).is_clean());
    }

    #[test]
    fn disposing_exclusive_agent_closes_its_thread() {
        let d = tricky(TrickyConfig::default().with_threads(1));
        let agent = recorder(1, &Journal::new());
        bind(&d, &agent, BindPolicy::Exclusive);
        assert!(wait_until(WAIT, || d.live_threads() == 2));

        assert_eq!(agent.dispose(), Disposal::Immediate { discarded: 0 });
        assert!(wait_until(WAIT, || d.live_threads() == 1));
        assert_eq!(d.stats().bound_agents, 0);
    }

    #[test]
    fn zero_deadline_drain_stops_busy_exclusive_thread() {
        let d = tricky(TrickyConfig::default().with_threads(1).with_burst_limit(None));
        let handled = Journal::new();
        let echo = {
            let handled = handled.clone();
            AgentRef::new(
                AgentId(1),
                "echo".into(),
                FailurePolicy::SkipMessage,
                None,
                Box::new(StatefulBehavior {
                    behavior: from_fn(move |_: &mut (), _msg: Message, ctx: &mut BurstContext| {
                        handled.push(());
                        ctx.send_self(());
                        std::thread::sleep(Duration::from_micros(200));
                        Ok(())
                    }),
                    state: (),
                }),
            )
        };
        bind(&d, &echo, BindPolicy::Exclusive);
        echo.send(()).unwrap();
        assert!(wait_until(WAIT, || handled.len() > 10));

        let report = d.drain(Duration::ZERO);
        assert_eq!(d.live_threads(), 0);
        let undrained = report.undrained.expect("busy agent must be reported");
        assert_eq!(undrained.agents[0].agent, AgentId(1));
        assert_eq!(undrained.agents[0].pending, 1);
    }

    #[test]
    fn exclusive_binding_before_start_spawns_on_start() {
        let d = TrickyDispatcher::new("tricky", TrickyConfig::default().with_threads(1), EventBus::default());
        let journal = Journal::new();
        let agent = recorder(1, &journal);
        bind(&d, &agent, BindPolicy::Exclusive);
        agent.send(5u64).unwrap();
        d.start().unwrap();
        assert!(wait_until(WAIT, || journal.len() == 1));
        assert_eq!(journal.snapshot()[0].thread, "tricky-exclusive-0");
    }

    #[test]
    fn overloaded_pinned_agent_migrates() {
        let d = tricky(
            TrickyConfig::default()
                .with_threads(2)
                .with_burst_limit(Some(1))
                .with_migration_threshold(Some(0)),
        );
        let journal = Journal::new();
        let entered = Gate::new();
        let gate = Gate::new();

        // The first message to `p` blocks worker 0; the rest are recorded.
        let p = {
            let journal = journal.clone();
            let entered = entered.clone();
            let gate = gate.clone();
            let mut first = true;
            AgentRef::new(
                AgentId(1),
                "pinned".into(),
                FailurePolicy::SkipMessage,
                None,
                Box::new(StatefulBehavior {
                    behavior: from_fn(move |_: &mut (), msg: Message, ctx: &mut BurstContext| {
                        if std::mem::take(&mut first) {
                            entered.open();
                            gate.wait(WAIT);
                            return Ok(());
                        }
                        let value = msg.downcast::<u64>().map_err(|_| "not a u64")?;
                        journal.push(Observation {
                            agent: ctx.myself().id(),
                            value,
                            thread: std::thread::current().name().unwrap_or("").to_string(),
                        });
                        Ok(())
                    }),
                    state: (),
                }),
            )
        };
        let q = recorder(2, &journal);
        bind(&d, &p, BindPolicy::Pinned(Some(0)));
        bind(&d, &q, BindPolicy::Pinned(Some(0)));

        p.send(0u64).unwrap();
        assert!(entered.wait(WAIT));
        q.send(10u64).unwrap();
        p.send(1u64).unwrap();
        assert_eq!(d.stats().worker_queue_depths, vec![1, 0]);
        gate.open();

        assert!(wait_until(WAIT, || journal.len() == 2));
        let moved = journal
            .snapshot()
            .into_iter()
            .find(|o| o.agent == AgentId(1))
            .unwrap();
        assert_eq!(moved.value, 1);
        assert_eq!(moved.thread, "tricky-worker-1");
    }

    #[test]
    fn dispose_during_burst_finishes_in_flight_message() {
        let d = tricky(TrickyConfig::default().with_threads(2));
        let sink_journal = Journal::new();
        let sink = recorder(2, &sink_journal);
        bind(&d, &sink, BindPolicy::Default);

        let entered = Gate::new();
        let gate = Gate::new();
        let handled = Journal::new();
        let target = {
            let entered = entered.clone();
            let gate = gate.clone();
            let handled = handled.clone();
            let sink = sink.clone();
            AgentRef::new(
                AgentId(1),
                "target".into(),
                FailurePolicy::SkipMessage,
                None,
                Box::new(StatefulBehavior {
                    behavior: from_fn(move |_: &mut (), msg: Message, ctx: &mut BurstContext| {
                        let n = msg.downcast::<u64>().map_err(|_| "not a u64")?;
                        ctx.send(&sink, n * 100);
                        entered.open();
                        gate.wait(WAIT);
                        handled.push(n);
                        Ok(())
                    }),
                    state: (),
                }),
            )
        };
        bind(&d, &target, BindPolicy::Default);
        let mut events = d.shared.reporter.events().subscribe();

        target.send(1u64).unwrap();
        target.send(2u64).unwrap();
        assert!(entered.wait(WAIT));
        assert_eq!(target.dispose(), Disposal::Deferred);
        assert!(matches!(
            target.send(3u64),
            Err(DispatchError::AgentDisposed(_))
        ));
        gate.open();

        assert!(wait_until(WAIT, || target.run_state() == RunState::Disposed));
        assert_eq!(handled.snapshot(), vec![1]);
        assert!(wait_until(WAIT, || sink_journal.len() == 1));
        assert_eq!(sink_journal.snapshot()[0].value, 100);
        assert!(wait_until(WAIT, || d.stats().bound_agents == 1));

        let disposed = std::iter::from_fn(|| events.try_recv().ok()).find(|e| {
            matches!(e, DispatchEvent::AgentDisposed { agent, .. } if *agent == AgentId(1))
        });
        assert_eq!(
            disposed,
            Some(DispatchEvent::AgentDisposed {
                dispatcher: "tricky".into(),
                agent: AgentId(1),
                discarded: 1,
            })
        );
    }

    #[test]
    fn out_of_range_policies_are_refused() {
        let d = TrickyDispatcher::new("tricky", TrickyConfig::default().with_threads(2), EventBus::default());
        let agent = recorder(1, &Journal::new());
        assert!(matches!(
            d.admit(&agent, BindPolicy::Priority(Priority(7))),
            Err(DispatchError::InvalidPolicy { .. })
        ));
        assert!(matches!(
            d.admit(&agent, BindPolicy::Pinned(Some(2))),
            Err(DispatchError::InvalidPolicy { .. })
        ));
        assert_eq!(d.stats().bound_agents, 0);
    }

    #[test]
    fn pinned_none_picks_least_loaded_worker() {
        let d = TrickyDispatcher::new("tricky", TrickyConfig::default().with_threads(3), EventBus::default());
        let first = recorder(1, &Journal::new());
        let second = recorder(2, &Journal::new());
        assert_eq!(
            d.admit(&first, BindPolicy::Pinned(None)).unwrap().placement,
            Placement::Worker(0)
        );
        assert_eq!(
            d.admit(&second, BindPolicy::Pinned(None)).unwrap().placement,
            Placement::Worker(1)
        );
    }
}
