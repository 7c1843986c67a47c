//! Heartbeat-based peer liveness.
//!
//! Every node broadcasts its id as plain text on the peer port. A peer is
//! live from the first token seen until no token has arrived for
//! `peer_timeout`. Membership changes are reported as `PeerEvent`s.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::modules::common::{NodeId, Result};
use crate::modules::config::Timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    New(NodeId),
    Lost(NodeId),
}

pub struct PeerTracker {
    me: NodeId,
    num_nodes: usize,
    timeout: Duration,
    last_seen: BTreeMap<NodeId, Instant>,
}

impl PeerTracker {
    pub fn new(me: NodeId, num_nodes: usize, timeout: Duration) -> Self {
        PeerTracker {
            me,
            num_nodes,
            timeout,
            last_seen: BTreeMap::new(),
        }
    }

    /// Records a heartbeat. Returns `New` the first time a peer is seen.
    pub fn observe(&mut self, id: NodeId, now: Instant) -> Option<PeerEvent> {
        if id == self.me || id as usize >= self.num_nodes {
            return None;
        }
        match self.last_seen.insert(id, now) {
            None => Some(PeerEvent::New(id)),
            Some(_) => None,
        }
    }

    /// Drops peers not heard from within the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<PeerEvent> {
        let timeout = self.timeout;
        let lost: Vec<NodeId> = self
            .last_seen
            .iter()
            .filter(|(_, &seen)| now.duration_since(seen) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in &lost {
            self.last_seen.remove(id);
        }
        lost.into_iter().map(PeerEvent::Lost).collect()
    }

    pub fn live(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.last_seen.keys().copied()
    }
}

fn parse_token(bytes: &[u8]) -> Option<NodeId> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

pub async fn heartbeat_sender(socket: UdpSocket, target: SocketAddr, me: NodeId, timing: Timing) -> Result<()> {
    let token = me.to_string();
    let mut ticker = interval(timing.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(token.as_bytes(), target).await {
            debug!("Heartbeat to {target} failed: {e}");
        }
    }
}

pub async fn heartbeat_receiver(
    socket: UdpSocket,
    me: NodeId,
    num_nodes: usize,
    timing: Timing,
    peer_tx: mpsc::Sender<PeerEvent>,
) -> Result<()> {
    let mut tracker = PeerTracker::new(me, num_nodes, timing.peer_timeout);
    let mut sweep = interval(timing.heartbeat_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buffer = [0u8; 64];

    loop {
        let events: Vec<PeerEvent> = tokio::select! {
            received = socket.recv_from(&mut buffer) => match received {
                Ok((size, source)) => match parse_token(&buffer[..size]) {
                    Some(id) => tracker.observe(id, Instant::now()).into_iter().collect(),
                    None => {
                        debug!("Ignoring malformed heartbeat from {source}");
                        Vec::new()
                    }
                },
                Err(e) => {
                    warn!("Heartbeat receive failed: {e}");
                    Vec::new()
                }
            },
            _ = sweep.tick() => tracker.expire(Instant::now()),
        };

        for event in events {
            match event {
                PeerEvent::New(id) => info!("Peer {id} is alive"),
                PeerEvent::Lost(id) => info!("Peer {id} lost"),
            }
            if peer_tx.send(event).await.is_err() {
                info!("Decision loop gone, stopping heartbeat receiver");
                return Ok(());
            }
        }
    }
}
