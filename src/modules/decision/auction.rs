//! Bid records for in-flight hall orders.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::modules::common::{NodeId, Order};

/// Cheapest bid wins, ties go to the smallest node id.
pub fn select_winner<I>(costs: I) -> Option<NodeId>
where
    I: IntoIterator<Item = (NodeId, Duration)>,
{
    costs
        .into_iter()
        .min_by_key(|&(node, cost)| (cost, node))
        .map(|(node, _)| node)
}

/// One pending hall order: at most one cost per node, and the timer that
/// forces resolution.
#[derive(Debug)]
pub struct Auction {
    pub costs: BTreeMap<NodeId, Duration>,
    pub generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Auction {
    /// Whether every node in `live` has bid.
    pub fn complete(&self, live: &BTreeSet<NodeId>) -> bool {
        live.iter().all(|node| self.costs.contains_key(node))
    }

    /// Winner among the bids from `live` nodes.
    pub fn winner(&self, live: &BTreeSet<NodeId>) -> Option<NodeId> {
        select_winner(
            self.costs
                .iter()
                .filter(|(node, _)| live.contains(node))
                .map(|(&node, &cost)| (node, cost)),
        )
    }
}

impl Drop for Auction {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Default)]
pub struct AuctionBook {
    pending: BTreeMap<Order, Auction>,
    resolved: HashMap<Order, Instant>,
    next_generation: u64,
}

impl AuctionBook {
    pub fn is_pending(&self, order: Order) -> bool {
        self.pending.contains_key(&order)
    }

    pub fn pending_orders(&self) -> Vec<Order> {
        self.pending.keys().copied().collect()
    }

    pub fn get(&self, order: Order) -> Option<&Auction> {
        self.pending.get(&order)
    }

    /// Whether `order` was resolved less than `memory` ago.
    pub fn recently_resolved(&self, order: Order, now: Instant, memory: Duration) -> bool {
        self.resolved
            .get(&order)
            .is_some_and(|&at| now.duration_since(at) < memory)
    }

    /// Opens an auction with our own cost and returns its generation.
    pub fn open(&mut self, order: Order, me: NodeId, cost: Duration) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.resolved.remove(&order);
        self.pending.insert(
            order,
            Auction {
                costs: BTreeMap::from([(me, cost)]),
                generation,
                timer: None,
            },
        );
        generation
    }

    pub fn set_timer(&mut self, order: Order, timer: JoinHandle<()>) {
        match self.pending.get_mut(&order) {
            Some(auction) => {
                if let Some(old) = auction.timer.replace(timer) {
                    old.abort();
                }
            }
            None => timer.abort(),
        }
    }

    /// Stores a bid. A repeated bid from the same node replaces the earlier one.
    pub fn record(&mut self, order: Order, node: NodeId, cost: Duration) -> bool {
        match self.pending.get_mut(&order) {
            Some(auction) => {
                auction.costs.insert(node, cost);
                true
            }
            None => false,
        }
    }

    /// Removes the auction, stopping its timer.
    pub fn close(&mut self, order: Order, now: Instant) -> Option<Auction> {
        let auction = self.pending.remove(&order)?;
        self.resolved.insert(order, now);
        Some(auction)
    }

    pub fn forget_resolved(&mut self, now: Instant, memory: Duration) {
        self.resolved.retain(|_, &mut at| now.duration_since(at) < memory);
    }
}
