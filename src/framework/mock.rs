//! # Test Doubles
//!
//! Utilities for observing agents from tests without writing a behavior per
//! test case.
//!
//! - [`Journal`]: thread-safe append-only log shared between behaviors and the test.
//! - [`OverlapProbe`]: detects an agent running on two workers at once.
//! - [`Gate`]: blocks a behavior until the test opens it.
//! - [`RecordingBehavior`]: records every `u64` it receives along with the
//!   worker thread that handled it.
//! - [`wait_until`]: polls a condition with a timeout.
//!
//! # Example
//! ```ignore
//! let journal = Journal::new();
//! let agent = supervisor.create_agent("pool", (), RecordingBehavior::new(journal.clone()))?;
//! agent.send(1u64)?;
//! assert!(wait_until(Duration::from_secs(1), || journal.len() == 1));
//! ```

use super::agent::AgentId;
use super::behavior::{Behavior, BurstContext};
use super::error::BehaviorError;
use super::message::Message;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared append-only log.
pub struct Journal<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Journal<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T> Default for Journal<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Journal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: T) {
        self.entries.lock().push(entry);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Counts concurrent entries per agent and remembers any overlap.
#[derive(Clone, Default)]
pub struct OverlapProbe {
    active: Arc<Mutex<HashMap<AgentId, usize>>>,
    violations: Arc<AtomicUsize>,
}

/// Leaves the probe when dropped.
pub struct ProbeGuard {
    probe: OverlapProbe,
    agent: AgentId,
}

impl OverlapProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, agent: AgentId) -> ProbeGuard {
        let mut active = self.active.lock();
        let count = active.entry(agent).or_insert(0);
        *count += 1;
        if *count > 1 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        ProbeGuard {
            probe: self.clone(),
            agent,
        }
    }

    /// Number of times an agent was entered while already active.
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    pub fn is_active(&self, agent: AgentId) -> bool {
        self.active.lock().get(&agent).copied().unwrap_or(0) > 0
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if let Some(count) = self.probe.active.lock().get_mut(&self.agent) {
            *count -= 1;
        }
    }
}

/// One-shot gate a behavior can block on.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (lock, cv) = &*self.inner;
        *lock.lock() = true;
        cv.notify_all();
    }

    /// Blocks until opened or `timeout` elapses. Returns whether it was opened.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cv) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut open = lock.lock();
        while !*open {
            if cv.wait_until(&mut open, deadline).timed_out() {
                return *open;
            }
        }
        true
    }
}

/// What a [`RecordingBehavior`] saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub agent: AgentId,
    pub value: u64,
    pub thread: String,
}

/// Records every `u64` message. Other message types are reported as errors.
pub struct RecordingBehavior {
    journal: Journal<Observation>,
    probe: Option<OverlapProbe>,
    delay: Duration,
}

impl RecordingBehavior {
    pub fn new(journal: Journal<Observation>) -> Self {
        Self {
            journal,
            probe: None,
            delay: Duration::ZERO,
        }
    }

    pub fn with_probe(mut self, probe: OverlapProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Sleeps this long per message, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Behavior for RecordingBehavior {
    type State = ();

    fn handle(
        &mut self,
        _state: &mut (),
        message: Message,
        ctx: &mut BurstContext,
    ) -> Result<(), BehaviorError> {
        let agent = ctx.myself().id();
        let _guard = self.probe.as_ref().map(|p| p.enter(agent));
        let value = message
            .downcast::<u64>()
            .map_err(|m| format!("unexpected message {}", m.tag()))?;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.journal.push(Observation {
            agent,
            value,
            thread: std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string(),
        });
        Ok(())
    }
}

/// Polls `condition` every millisecond until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
