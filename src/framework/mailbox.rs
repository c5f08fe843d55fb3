//! Per-agent FIFO message queue.

use super::message::{Envelope, Message};
use std::collections::VecDeque;

/// Ordered queue of pending messages for exactly one agent.
///
/// Unbounded unless a capacity is given, in which case [`Mailbox::push`]
/// rejects the message instead of growing past it.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: VecDeque<Envelope>,
    capacity: Option<usize>,
    next_seq: u64,
}

impl Mailbox {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
            next_seq: 1,
        }
    }

    /// Appends a message, assigning it the next sequence number.
    /// Hands the message back if the mailbox is at capacity.
    pub fn push(&mut self, message: Message) -> Result<u64, Message> {
        if let Some(cap) = self.capacity {
            if self.queue.len() >= cap {
                return Err(message);
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(Envelope { seq, message });
        Ok(seq)
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Drops every pending message, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }
}
