//! # Behavior Trait
//!
//! The [`Behavior`] trait is the contract application code implements to run on
//! a dispatcher. It plays the same role for agents that an entity trait plays
//! for a resource actor: the dispatcher writes the claim/burst/reschedule loop
//! once and every agent plugs its logic in here.
//!
//! A behavior maps `(state, message)` to a new state (mutated in place) plus
//! optional outgoing messages, queued on the [`BurstContext`]. Outgoing messages
//! are delivered by the burst runner right after the handler returns, so they
//! re-enter the regular `send` path (including sends to the agent itself).
//!
//! Behaviors run on OS worker threads and are therefore synchronous. Blocking
//! inside a handler blocks that worker only.

use super::agent::AgentRef;
use super::error::BehaviorError;
use super::message::Message;
use std::any::Any;

/// Application logic of an agent.
pub trait Behavior: Send + 'static {
    /// State owned by the agent and only touched by the worker running it.
    type State: Send + 'static;

    /// Handles one message. Returning `Err` (or panicking) produces an
    /// `AgentFailure`; what happens next depends on the agent's failure policy.
    fn handle(
        &mut self,
        state: &mut Self::State,
        message: Message,
        ctx: &mut BurstContext,
    ) -> Result<(), BehaviorError>;
}

/// Behavior built from a closure. See [`from_fn`].
pub struct FnBehavior<S, F> {
    f: F,
    _state: std::marker::PhantomData<fn() -> S>,
}

/// Builds a behavior from a closure `|state, message, ctx| -> Result<(), _>`.
pub fn from_fn<S, F>(f: F) -> FnBehavior<S, F>
where
    S: Send + 'static,
    F: FnMut(&mut S, Message, &mut BurstContext) -> Result<(), BehaviorError> + Send + 'static,
{
    FnBehavior {
        f,
        _state: std::marker::PhantomData,
    }
}

impl<S, F> Behavior for FnBehavior<S, F>
where
    S: Send + 'static,
    F: FnMut(&mut S, Message, &mut BurstContext) -> Result<(), BehaviorError> + Send + 'static,
{
    type State = S;

    fn handle(
        &mut self,
        state: &mut S,
        message: Message,
        ctx: &mut BurstContext,
    ) -> Result<(), BehaviorError> {
        (self.f)(state, message, ctx)
    }
}

/// Handle given to a behavior while it processes one message.
pub struct BurstContext {
    myself: AgentRef,
    outgoing: Vec<(AgentRef, Message)>,
}

impl BurstContext {
    pub(crate) fn new(myself: AgentRef) -> Self {
        Self {
            myself,
            outgoing: Vec::new(),
        }
    }

    /// The agent currently being run.
    pub fn myself(&self) -> &AgentRef {
        &self.myself
    }

    /// Queues `payload` for `target`. Delivered once the handler returns.
    pub fn send<T: Any + Send>(&mut self, target: &AgentRef, payload: T) {
        self.outgoing.push((target.clone(), Message::new(payload)));
    }

    /// Queues an already built message.
    pub fn send_message(&mut self, target: &AgentRef, message: Message) {
        self.outgoing.push((target.clone(), message));
    }

    /// Queues `payload` for the running agent itself.
    pub fn send_self<T: Any + Send>(&mut self, payload: T) {
        let me = self.myself.clone();
        self.send(&me, payload);
    }

    pub(crate) fn take_outgoing(&mut self) -> Vec<(AgentRef, Message)> {
        std::mem::take(&mut self.outgoing)
    }
}

/// Object-safe pairing of a behavior with its state, stored inside an agent.
pub(crate) trait ErasedBehavior: Send {
    fn handle(&mut self, message: Message, ctx: &mut BurstContext) -> Result<(), BehaviorError>;
}

pub(crate) struct StatefulBehavior<B: Behavior> {
    pub(crate) behavior: B,
    pub(crate) state: B::State,
}

impl<B: Behavior> ErasedBehavior for StatefulBehavior<B> {
    fn handle(&mut self, message: Message, ctx: &mut BurstContext) -> Result<(), BehaviorError> {
        self.behavior.handle(&mut self.state, message, ctx)
    }
}

/// Short display name for a behavior type, e.g. `DeviceManager`.
pub(crate) fn behavior_name<B>() -> String {
    let full = std::any::type_name::<B>();
    // Strip generic arguments before taking the last path segment.
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or("Unknown").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    #[test]
    fn behavior_name_strips_path_and_generics() {
        assert_eq!(behavior_name::<Counter>(), "Counter");
        assert_eq!(behavior_name::<Vec<u8>>(), "Vec");
    }
}
