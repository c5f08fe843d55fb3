use crate::framework::{AgentRef, Message};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;

/// Delivers messages after a delay using tokio timers.
///
/// Behaviors run on dispatcher threads outside the runtime, so the line keeps
/// a runtime [`Handle`] and spawns one timer task per delayed message.
#[derive(Clone)]
pub struct DelayLine {
    runtime: Handle,
}

impl DelayLine {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Uses the runtime the caller is running in. Panics outside a runtime,
    /// like `tokio::spawn`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn send_after<T: std::any::Any + Send>(&self, target: &AgentRef, delay: Duration, payload: T) {
        self.send_message_after(target, delay, Message::new(payload));
    }

    pub fn send_message_after(&self, target: &AgentRef, delay: Duration, message: Message) {
        let target = target.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let tag = message.short_tag();
            if let Err(e) = target.send_message(message) {
                // Expected while shutting down.
                debug!(agent = %target.id(), tag, error = %e, "Delayed message dropped");
            }
        });
    }
}
