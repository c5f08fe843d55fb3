//! Event stream consumed by logging and metrics collaborators.
//!
//! Dispatchers publish from their worker threads; subscribers usually live in
//! async code, so the bus is a `tokio::sync::broadcast` channel. Publishing
//! never blocks and is a no-op without subscribers.

use super::Lifecycle;
use crate::framework::{AgentFailure, AgentId, UndrainedAgents};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    LifecycleChanged {
        dispatcher: String,
        lifecycle: Lifecycle,
    },
    AgentFailed(AgentFailure),
    AgentDisposed {
        dispatcher: String,
        agent: AgentId,
        discarded: usize,
    },
    Undrained(UndrainedAgents),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: DispatchEvent) {
        // An error only means nobody is listening.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        bus.publish(DispatchEvent::LifecycleChanged {
            dispatcher: "lost".into(),
            lifecycle: Lifecycle::Started,
        });
        let mut rx = bus.subscribe();
        bus.publish(DispatchEvent::LifecycleChanged {
            dispatcher: "pool".into(),
            lifecycle: Lifecycle::Stopped,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            DispatchEvent::LifecycleChanged {
                dispatcher: "pool".into(),
                lifecycle: Lifecycle::Stopped,
            }
        );
    }
}
