use actor_dispatch::dispatcher::{
    BindPolicy, DispatchEvent, Lifecycle, Priority, ThreadPoolConfig, TrickyConfig,
};
use actor_dispatch::framework::mock::{wait_until, Gate, Journal, Observation, OverlapProbe, RecordingBehavior};
use actor_dispatch::framework::{
    from_fn, AgentId, AgentRef, BurstContext, DispatchError, Disposal, DrainReport, Message, RunState,
};
use actor_dispatch::lifecycle::{AgentOptions, Supervisor};
use std::sync::{mpsc, Arc};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Kicks off a self-sending agent.
struct Kick;

fn supervisor_with_pool(threads: usize) -> Supervisor {
    let supervisor = Supervisor::default();
    supervisor
        .create_dispatcher("pool", ThreadPoolConfig::default().with_threads(threads))
        .expect("Failed to create pool");
    supervisor.start("pool").expect("Failed to start pool");
    supervisor
}

/// Agent that signals `entered`, then blocks on `gate` for every message.
fn blocker(supervisor: &Supervisor, dispatcher: &str, policy: BindPolicy, entered: &Gate, gate: &Gate) -> AgentRef {
    let entered = entered.clone();
    let gate = gate.clone();
    supervisor
        .create_agent_with(
            dispatcher,
            AgentOptions::named("blocker").with_policy(policy),
            (),
            from_fn(move |_: &mut (), _msg: Message, _ctx: &mut BurstContext| {
                entered.open();
                gate.wait(WAIT);
                Ok(())
            }),
        )
        .expect("Failed to create blocker")
}

/// Agent that sends itself another message for every one it handles,
/// recording the thread that handled each.
fn echo(supervisor: &Supervisor, dispatcher: &str, policy: BindPolicy, threads: &Journal<String>) -> AgentRef {
    let threads = threads.clone();
    supervisor
        .create_agent_with(
            dispatcher,
            AgentOptions::named("echo").with_policy(policy),
            (),
            from_fn(move |_: &mut (), _msg: Message, ctx: &mut BurstContext| {
                threads.push(std::thread::current().name().unwrap_or("unnamed").to_string());
                ctx.send_self(());
                std::thread::sleep(Duration::from_micros(200));
                Ok(())
            }),
        )
        .expect("Failed to create echo agent")
}

fn handled_on(threads: &Journal<String>, prefix: &str) -> usize {
    threads.snapshot().iter().filter(|t| t.starts_with(prefix)).count()
}

/// Runs `drain` on a helper thread and fails the test if it does not return in time.
fn drain_within(supervisor: Arc<Supervisor>, dispatcher: &'static str) -> DrainReport {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(supervisor.drain(dispatcher, Duration::ZERO));
    });
    rx.recv_timeout(WAIT)
        .expect("drain did not return before the timeout")
        .expect("dispatcher exists")
}

fn values(journal: &Journal<Observation>) -> Vec<u64> {
    journal.snapshot().into_iter().map(|o| o.value).collect()
}

/// An agent sending itself five messages sees each exactly once, in order.
#[test]
fn test_self_send_is_processed_once_in_order() {
    let supervisor = supervisor_with_pool(2);
    let log = Journal::new();
    let agent = {
        let log = log.clone();
        supervisor
            .create_agent(
                "pool",
                (),
                from_fn(move |_: &mut (), msg: Message, ctx: &mut BurstContext| {
                    if msg.is::<Kick>() {
                        for n in 1..=5u64 {
                            ctx.send_self(n);
                        }
                        return Ok(());
                    }
                    let n = msg.downcast::<u64>().map_err(|m| format!("unexpected {}", m.tag()))?;
                    log.push(n);
                    Ok(())
                }),
            )
            .expect("Failed to create agent")
    };

    agent.send(Kick).unwrap();
    assert!(wait_until(WAIT, || log.len() == 5));
    // Nothing else shows up later.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(log.snapshot(), vec![1, 2, 3, 4, 5]);

    let report = supervisor.shutdown(WAIT);
    assert!(report.is_clean());
}

/// Messages sent while the agent hops between dispatchers are neither lost,
/// duplicated nor reordered, and the agent never runs on two threads at once.
#[test]
fn test_rebind_mid_stream_keeps_exactly_once_order() {
    let supervisor = supervisor_with_pool(3);
    supervisor
        .create_dispatcher("tricky", TrickyConfig::default().with_threads(2))
        .unwrap();
    supervisor.start("tricky").unwrap();

    let journal = Journal::new();
    let probe = OverlapProbe::new();
    let agent = supervisor
        .create_agent(
            "pool",
            (),
            RecordingBehavior::new(journal.clone())
                .with_probe(probe.clone())
                .with_delay(Duration::from_micros(50)),
        )
        .unwrap();

    let sender = {
        let agent = agent.clone();
        std::thread::spawn(move || {
            for n in 0..2_000u64 {
                agent.send(n).expect("send failed");
            }
        })
    };
    let targets = [
        ("tricky", BindPolicy::Priority(Priority(1))),
        ("pool", BindPolicy::Default),
        ("tricky", BindPolicy::Pinned(None)),
        ("tricky", BindPolicy::Exclusive),
        ("pool", BindPolicy::Default),
    ];
    for (dispatcher, policy) in targets {
        std::thread::sleep(Duration::from_millis(5));
        supervisor.rebind(&agent, dispatcher, policy).unwrap();
    }
    sender.join().unwrap();

    assert!(wait_until(WAIT, || journal.len() == 2_000));
    assert_eq!(values(&journal), (0..2_000).collect::<Vec<_>>());
    assert_eq!(probe.violations(), 0);
    assert_eq!(agent.dispatcher().as_deref(), Some("pool"));
}

/// Disposing a running agent lets the in-flight message finish, keeps the
/// messages it sent, and discards the rest of its mailbox.
#[test]
fn test_dispose_mid_burst() {
    let supervisor = supervisor_with_pool(2);
    let mut events = supervisor.subscribe();
    let sink_journal = Journal::new();
    let sink = supervisor
        .create_agent("pool", (), RecordingBehavior::new(sink_journal.clone()))
        .unwrap();

    let entered = Gate::new();
    let gate = Gate::new();
    let handled = Journal::new();
    let target = {
        let (entered, gate, handled, sink) = (entered.clone(), gate.clone(), handled.clone(), sink.clone());
        supervisor
            .create_agent(
                "pool",
                (),
                from_fn(move |_: &mut (), msg: Message, ctx: &mut BurstContext| {
                    let n = msg.downcast::<u64>().map_err(|_| "not a u64")?;
                    ctx.send(&sink, n * 10);
                    entered.open();
                    gate.wait(WAIT);
                    handled.push(n);
                    Ok(())
                }),
            )
            .unwrap()
    };

    for n in 1..=3u64 {
        target.send(n).unwrap();
    }
    assert!(entered.wait(WAIT));
    assert_eq!(supervisor.dispose(&target), Disposal::Deferred);
    assert!(matches!(target.send(4u64), Err(DispatchError::AgentDisposed(_))));
    gate.open();

    assert!(wait_until(WAIT, || target.run_state() == RunState::Disposed));
    assert_eq!(handled.snapshot(), vec![1]);
    assert!(wait_until(WAIT, || sink_journal.len() == 1));
    assert_eq!(values(&sink_journal), vec![10]);
    assert!(supervisor.binding_of(target.id()).is_none());

    let disposed = std::iter::from_fn(|| events.try_recv().ok()).find(|e| {
        matches!(e, DispatchEvent::AgentDisposed { agent, .. } if *agent == target.id())
    });
    assert_eq!(
        disposed,
        Some(DispatchEvent::AgentDisposed {
            dispatcher: "pool".into(),
            agent: target.id(),
            discarded: 2,
        })
    );
}

/// A zero-deadline drain stops right after in-flight bursts and reports
/// every agent still holding mail, without dropping any of it.
#[test]
fn test_zero_deadline_drain_reports_undrained_agents() {
    let supervisor = supervisor_with_pool(1);
    let mut events = supervisor.subscribe();
    let entered = Gate::new();
    let gate = Gate::new();
    let busy = blocker(&supervisor, "pool", BindPolicy::Default, &entered, &gate);
    busy.send(()).unwrap();
    assert!(entered.wait(WAIT));

    let journal = Journal::new();
    let waiting = supervisor
        .create_agent("pool", (), RecordingBehavior::new(journal.clone()))
        .unwrap();
    for n in 0..3u64 {
        waiting.send(n).unwrap();
    }

    let opener = {
        let gate = gate.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            gate.open();
        })
    };
    let report = supervisor.drain("pool", Duration::ZERO).unwrap();
    opener.join().unwrap();

    let undrained = report.undrained.expect("waiting agent must be reported");
    assert_eq!(undrained.dispatcher, "pool");
    assert_eq!(undrained.agents.len(), 1);
    assert_eq!(undrained.agents[0].agent, waiting.id());
    assert_eq!(undrained.agents[0].pending, 3);
    assert!(journal.is_empty());
    assert_eq!(waiting.mailbox_depth(), 3);
    assert!(std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e, DispatchEvent::Undrained(u) if u.agents.len() == 1)));

    let stats = supervisor.stats();
    assert_eq!(stats[0].lifecycle, Lifecycle::Stopped);
    assert_eq!(stats[0].live_workers, 0);
    // Still accepted, but a stopped dispatcher never runs it.
    waiting.send(9u64).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert!(journal.is_empty());
}

/// Growing and shrinking the pool while agents are busy keeps per-agent
/// ordering and never runs one agent on two workers.
#[test]
fn test_resize_under_load_keeps_order() {
    let supervisor = supervisor_with_pool(1);
    let probe = OverlapProbe::new();
    let journals: Vec<Journal<Observation>> = (0..4).map(|_| Journal::new()).collect();
    let agents: Vec<AgentRef> = journals
        .iter()
        .map(|journal| {
            supervisor
                .create_agent(
                    "pool",
                    (),
                    RecordingBehavior::new(journal.clone()).with_probe(probe.clone()),
                )
                .unwrap()
        })
        .collect();

    for n in 0..500u64 {
        for agent in &agents {
            agent.send(n).unwrap();
        }
        match n {
            100 => supervisor.resize("pool", 4).unwrap(),
            250 => supervisor.resize("pool", 2).unwrap(),
            400 => supervisor.resize("pool", 3).unwrap(),
            _ => {}
        }
    }

    assert!(wait_until(WAIT, || journals.iter().all(|j| j.len() == 500)));
    for journal in &journals {
        assert_eq!(values(journal), (0..500).collect::<Vec<_>>());
    }
    assert_eq!(probe.violations(), 0);
    assert!(wait_until(WAIT, || supervisor.stats()[0].live_workers == 3));
    assert!(matches!(
        supervisor.resize("pool", 0),
        Err(DispatchError::InvalidConfig(_))
    ));
}

/// A low-priority agent that waited past the aging threshold runs before a
/// high-priority agent that just arrived.
#[test]
fn test_aging_promotes_waiting_low_priority_agent() {
    let supervisor = Supervisor::default();
    supervisor
        .create_dispatcher(
            "tricky",
            TrickyConfig::default()
                .with_threads(1)
                .with_lanes(2)
                .with_aging_threshold(Duration::from_millis(50)),
        )
        .unwrap();
    supervisor.start("tricky").unwrap();

    let entered = Gate::new();
    let gate = Gate::new();
    let high = BindPolicy::Priority(Priority(1));
    let low = BindPolicy::Priority(Priority::LOW);
    let a = blocker(&supervisor, "tricky", high, &entered, &gate);
    let journal = Journal::new();
    let b = supervisor
        .create_agent_with("tricky", AgentOptions::named("B").with_policy(low), (), RecordingBehavior::new(journal.clone()))
        .unwrap();
    let c = supervisor
        .create_agent_with("tricky", AgentOptions::named("C").with_policy(high), (), RecordingBehavior::new(journal.clone()))
        .unwrap();

    a.send(()).unwrap();
    assert!(entered.wait(WAIT));
    for n in 0..3u64 {
        b.send(n).unwrap();
    }
    std::thread::sleep(Duration::from_millis(120));
    c.send(100u64).unwrap();
    gate.open();

    assert!(wait_until(WAIT, || journal.len() == 4));
    let order: Vec<AgentId> = journal.snapshot().into_iter().map(|o| o.agent).collect();
    assert_eq!(order[0], b.id());
    assert!(order.contains(&c.id()));

    let report = supervisor.shutdown(WAIT);
    assert!(report.is_clean());
}

/// An agent that keeps its own mailbox full moves to the new dispatcher's
/// threads as soon as it is rebound.
#[test]
fn test_rebind_moves_busy_self_sending_agent() {
    let supervisor = Supervisor::default();
    for name in ["a", "b"] {
        supervisor
            .create_dispatcher(name, ThreadPoolConfig::default().with_threads(1))
            .unwrap();
        supervisor.start(name).unwrap();
    }
    let threads = Journal::new();
    let agent = echo(&supervisor, "a", BindPolicy::Default, &threads);
    agent.send(()).unwrap();
    assert!(wait_until(WAIT, || handled_on(&threads, "a-worker") > 10));

    supervisor.rebind(&agent, "b", BindPolicy::Default).unwrap();
    assert!(wait_until(WAIT, || handled_on(&threads, "b-worker") > 10));
    let on_a = handled_on(&threads, "a-worker");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(handled_on(&threads, "a-worker"), on_a);

    supervisor.dispose(&agent);
    assert!(wait_until(WAIT, || agent.run_state() == RunState::Disposed));
}

/// A zero-deadline drain returns even while an agent keeps sending to
/// itself; the agent is reported with its pending message.
#[test]
fn test_zero_deadline_drain_interrupts_busy_agent() {
    let supervisor = Arc::new(supervisor_with_pool(1));
    let threads = Journal::new();
    let agent = echo(&supervisor, "pool", BindPolicy::Default, &threads);
    agent.send(()).unwrap();
    assert!(wait_until(WAIT, || threads.len() > 10));

    let report = drain_within(supervisor.clone(), "pool");
    let undrained = report.undrained.expect("busy agent must be reported");
    assert_eq!(undrained.agents.len(), 1);
    assert_eq!(undrained.agents[0].agent, agent.id());
    assert_eq!(undrained.agents[0].pending, 1);
    assert_eq!(agent.mailbox_depth(), 1);

    let stats = supervisor.stats();
    assert_eq!(stats[0].lifecycle, Lifecycle::Stopped);
    assert_eq!(stats[0].live_workers, 0);
}

/// Same for the tricky dispatcher, with busy agents on a lane, a pinned
/// worker and an exclusive thread.
#[test]
fn test_tricky_zero_deadline_drain_with_exclusive_thread() {
    let supervisor = Arc::new(Supervisor::default());
    supervisor
        .create_dispatcher(
            "tricky",
            TrickyConfig::default().with_threads(2).with_burst_limit(None),
        )
        .unwrap();
    supervisor.start("tricky").unwrap();
    let threads = Journal::new();
    let agents = [
        echo(&supervisor, "tricky", BindPolicy::Priority(Priority(1)), &threads),
        echo(&supervisor, "tricky", BindPolicy::Pinned(Some(1)), &threads),
        echo(&supervisor, "tricky", BindPolicy::Exclusive, &threads),
    ];
    for agent in &agents {
        agent.send(()).unwrap();
    }
    assert!(wait_until(WAIT, || handled_on(&threads, "tricky-exclusive") > 10));
    assert!(wait_until(WAIT, || supervisor.stats()[0].live_workers == 3));

    let report = drain_within(supervisor.clone(), "tricky");
    let undrained = report.undrained.expect("busy agents must be reported");
    let mut reported: Vec<AgentId> = undrained.agents.iter().map(|a| a.agent).collect();
    reported.sort();
    let mut expected: Vec<AgentId> = agents.iter().map(AgentRef::id).collect();
    expected.sort();
    assert_eq!(reported, expected);
    assert!(undrained.agents.iter().all(|a| a.pending == 1));

    let stats = supervisor.stats();
    assert_eq!(stats[0].lifecycle, Lifecycle::Stopped);
    assert_eq!(stats[0].live_workers, 0);
}
