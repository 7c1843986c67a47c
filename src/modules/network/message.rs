use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::modules::common::{NodeId, Order, OrderMatrix, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Payload {
    /// `round` is 0 for the originator and counts up along reply chains
    Bid { order: Order, cost_ms: u64, round: u32 },
    Sync { orders: OrderMatrix, restore_cab: bool },
}

/// Everything sent on the bidding/sync port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: NodeId,
    pub counter: u64,
    pub payload: Payload,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Lamport counter stamped on outgoing envelopes.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: u64,
}

impl LamportClock {
    pub fn now(&self) -> u64 {
        self.counter
    }

    /// Advances the clock for a send and returns the stamp to use.
    pub fn tick(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    pub fn observe(&mut self, received: u64) {
        self.counter = self.counter.max(received) + 1;
    }
}

/// Highest counter accepted from each sender. Anything at or below the mark
/// is a repeat or arrived out of order, and is dropped.
#[derive(Debug, Default)]
pub struct FreshnessFilter {
    marks: HashMap<NodeId, u64>,
}

impl FreshnessFilter {
    pub fn accept(&mut self, sender: NodeId, counter: u64) -> bool {
        match self.marks.get(&sender) {
            Some(&mark) if counter <= mark => false,
            _ => {
                self.marks.insert(sender, counter);
                true
            }
        }
    }

    /// Forget `sender`, e.g. because it restarted and its counter did too.
    pub fn forget(&mut self, sender: NodeId) {
        self.marks.remove(&sender);
    }
}
