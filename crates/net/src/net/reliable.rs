use std::collections::{HashMap, VecDeque};

use super::protocol::command_hash;
use crate::error::PacketError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutReliableCommand {
    pub id: u32,
    pub type_tag: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{unacknowledged} reliable commands awaiting acknowledgment (limit {limit})")]
pub struct QueueOverflow {
    pub unacknowledged: u32,
    pub limit: u32,
}

/// Outbound reliable commands awaiting acknowledgment from the server. The
/// whole queue is retransmitted on every send until acknowledged.
#[derive(Debug)]
pub struct ReliableCommandQueue {
    pending: VecDeque<OutReliableCommand>,
    sequence: u32,
    acknowledged: u32,
    max_unacknowledged: u32,
}

impl ReliableCommandQueue {
    pub fn new(max_unacknowledged: u32) -> Self {
        Self {
            pending: VecDeque::new(),
            sequence: 0,
            acknowledged: 0,
            max_unacknowledged,
        }
    }

    pub fn enqueue(&mut self, type_tag: u32, payload: Vec<u8>) -> Result<u32, QueueOverflow> {
        let unacknowledged = self.unacknowledged();
        if unacknowledged >= self.max_unacknowledged {
            return Err(QueueOverflow {
                unacknowledged,
                limit: self.max_unacknowledged,
            });
        }

        self.sequence += 1;
        self.pending.push_back(OutReliableCommand {
            id: self.sequence,
            type_tag,
            payload,
        });

        Ok(self.sequence)
    }

    /// Drops every command with an id at or below `ack`. Returns the number of
    /// commands removed. Acks that do not move the watermark forward are
    /// ignored, as are acks for ids never assigned.
    pub fn acknowledge(&mut self, ack: u32) -> usize {
        let ack = ack.min(self.sequence);
        if ack <= self.acknowledged {
            return 0;
        }

        let before = self.pending.len();
        self.pending.retain(|command| command.id > ack);
        self.acknowledged = ack;

        before - self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &OutReliableCommand> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn acknowledged(&self) -> u32 {
        self.acknowledged
    }

    pub fn unacknowledged(&self) -> u32 {
        self.sequence - self.acknowledged
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.sequence = 0;
        self.acknowledged = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Fresh,
    Duplicate,
}

/// Tracks the highest inbound reliable command executed and the window of ids
/// accepted beyond it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveWindow {
    last_received: u32,
    size: u32,
}

impl ReceiveWindow {
    pub fn new(size: u32) -> Self {
        Self {
            last_received: 0,
            size,
        }
    }

    pub fn last_received(&self) -> u32 {
        self.last_received
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn admit(&self, id: u32) -> Result<Admission, PacketError> {
        if id > self.last_received.saturating_add(self.size) {
            return Err(PacketError::OutOfWindow {
                id,
                last: self.last_received,
            });
        }
        if id <= self.last_received {
            Ok(Admission::Duplicate)
        } else {
            Ok(Admission::Fresh)
        }
    }

    pub fn advance(&mut self, id: u32) {
        self.last_received = self.last_received.max(id);
    }

    pub fn reset(&mut self) {
        self.last_received = 0;
    }
}

pub type ReliableHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Handlers keyed by command type hash. A type may have several handlers; all
/// of them run, in registration order.
#[derive(Default)]
pub struct ReliableHandlers {
    handlers: HashMap<u32, Vec<ReliableHandler>>,
}

impl ReliableHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, type_name: &str, handler: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.handlers
            .entry(command_hash(type_name))
            .or_default()
            .push(Box::new(handler));
    }

    /// Returns how many handlers ran.
    pub fn dispatch(&mut self, type_tag: u32, payload: &[u8]) -> usize {
        match self.handlers.get_mut(&type_tag) {
            Some(handlers) => {
                for handler in handlers.iter_mut() {
                    handler(payload);
                }
                handlers.len()
            }
            None => 0,
        }
    }
}
