//! # Messages
//!
//! A [`Message`] is an immutable, type-tagged payload. Ownership moves from the
//! sender into the receiving mailbox on `send`; afterwards the payload is only
//! ever read through a shared reference or consumed whole by the behavior via
//! [`Message::downcast`].

use std::any::{Any, TypeId};
use std::fmt;

/// Type-erased message payload plus its type tag.
pub struct Message {
    tag: &'static str,
    type_id: TypeId,
    payload: Box<dyn Any + Send>,
}

impl Message {
    /// Wraps `payload`, tagging it with its type name.
    pub fn new<T: Any + Send>(payload: T) -> Self {
        Self {
            tag: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            payload: Box::new(payload),
        }
    }

    /// Full type name of the payload.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Type name without its module path (e.g. `Ping` instead of `my_app::Ping`).
    pub fn short_tag(&self) -> &'static str {
        self.tag.rsplit("::").next().unwrap_or(self.tag)
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Consumes the message, returning the payload when the type matches.
    /// On mismatch the message is handed back untouched.
    pub fn downcast<T: Any>(self) -> Result<T, Message> {
        if !self.is::<T>() {
            return Err(self);
        }
        let Message {
            tag,
            type_id,
            payload,
        } = self;
        payload
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|payload| Message {
                tag,
                type_id,
                payload,
            })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message").field("tag", &self.tag).finish()
    }
}

/// A message together with its per-agent sequence number.
#[derive(Debug)]
pub struct Envelope {
    pub seq: u64,
    pub message: Message,
}
