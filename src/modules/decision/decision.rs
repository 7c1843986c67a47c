//! The bidding and order event loop.
//!
//! `Decision` serialises everything that touches the auction table: hall
//! requests and order changes from the controller, envelopes from the
//! network, membership changes from the peer monitor and bid timeouts from
//! the per-auction timer tasks. It never writes the order matrix itself; it
//! tells the controller what to apply.

use std::collections::BTreeSet;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};

use super::auction::AuctionBook;
use crate::modules::common::{ElevatorState, FleetError, NodeId, Order, OrderMatrix, Result};
use crate::modules::config::{Config, Timing};
use crate::modules::cost::time_to_serve;
use crate::modules::elevator::{ControllerCommand, ControllerEvent};
use crate::modules::network::{Envelope, FreshnessFilter, LamportClock, Payload};
use crate::modules::peers::PeerEvent;

/// Fired by an auction's timer task. Ignored unless `generation` still
/// matches the pending auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BidTimeout {
    pub order: Order,
    pub generation: u64,
}

pub struct Decision {
    me: NodeId,
    num_nodes: usize,
    num_floors: u8,
    timing: Timing,
    clock: LamportClock,
    freshness: FreshnessFilter,
    live_peers: BTreeSet<NodeId>,
    auctions: AuctionBook,
    /// A fresh node keeps its (empty) matrix to itself until this passes or
    /// a sync arrives.
    joining_until: Option<Instant>,
    /// Order changes were kept back while joining and still need a sync.
    held_back: bool,

    elevator_state_rx: watch::Receiver<ElevatorState>,
    controller_event_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    controller_command_tx: mpsc::UnboundedSender<ControllerCommand>,
    network_to_decision_rx: mpsc::Receiver<Envelope>,
    decision_to_network_tx: mpsc::Sender<Envelope>,
    peer_rx: mpsc::Receiver<PeerEvent>,
    timeout_tx: mpsc::UnboundedSender<BidTimeout>,
    timeout_rx: mpsc::UnboundedReceiver<BidTimeout>,
}

fn millis(cost: Duration) -> u64 {
    u64::try_from(cost.as_millis()).unwrap_or(u64::MAX)
}

async fn join_deadline(until: Option<Instant>) {
    match until {
        Some(until) => sleep_until(until).await,
        None => std::future::pending().await,
    }
}

impl Decision {
    pub fn new(
        config: &Config,
        elevator_state_rx: watch::Receiver<ElevatorState>,
        controller_event_rx: mpsc::UnboundedReceiver<ControllerEvent>,
        controller_command_tx: mpsc::UnboundedSender<ControllerCommand>,
        network_to_decision_rx: mpsc::Receiver<Envelope>,
        decision_to_network_tx: mpsc::Sender<Envelope>,
        peer_rx: mpsc::Receiver<PeerEvent>,
    ) -> Self {
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        Decision {
            me: config.node_id,
            num_nodes: config.num_nodes,
            num_floors: config.num_floors,
            timing: config.timing.clone(),
            clock: LamportClock::default(),
            freshness: FreshnessFilter::default(),
            live_peers: BTreeSet::new(),
            auctions: AuctionBook::default(),
            joining_until: Some(Instant::now() + config.timing.join_grace()),
            held_back: false,

            elevator_state_rx,
            controller_event_rx,
            controller_command_tx,
            network_to_decision_rx,
            decision_to_network_tx,
            peer_rx,
            timeout_tx,
            timeout_rx,
        }
    }

    /// Self plus every peer currently considered live.
    pub fn live_nodes(&self) -> BTreeSet<NodeId> {
        let mut live = self.live_peers.clone();
        live.insert(self.me);
        live
    }

    pub fn pending_auctions(&self) -> Vec<Order> {
        self.auctions.pending_orders()
    }

    pub fn is_joining(&self) -> bool {
        self.joining_until.is_some_and(|until| Instant::now() < until)
    }

    pub async fn step(&mut self) -> Result<()> {
        tokio::select! {
            event = self.controller_event_rx.recv() => match event {
                Some(event) => self.handle_controller_event(event),
                None => return Err(FleetError::ChannelClosed("controller events")),
            },
            envelope = self.network_to_decision_rx.recv() => match envelope {
                Some(envelope) => self.handle_envelope(envelope),
                None => return Err(FleetError::ChannelClosed("network inbox")),
            },
            peer = self.peer_rx.recv() => match peer {
                Some(event) => self.handle_peer_event(event),
                None => return Err(FleetError::ChannelClosed("peer events")),
            },
            Some(timeout) = self.timeout_rx.recv() => self.handle_bid_timeout(timeout),
            _ = join_deadline(self.joining_until) => self.on_join_window_closed(),
        }
        Ok(())
    }

    //---------HELPERS--------------------//

    /// Our cost at the precision peers see it on the wire.
    fn own_cost(&self, order: Order) -> Duration {
        let cost = time_to_serve(&self.elevator_state_rx.borrow(), order, &self.timing);
        Duration::from_millis(millis(cost))
    }

    /// Whether a live node already holds `order` in its row.
    fn held_by_live_node(&self, order: Order) -> bool {
        let live = self.live_nodes();
        self.elevator_state_rx
            .borrow()
            .orders
            .hall_assigned(order, live.iter().copied())
    }

    fn command(&self, command: ControllerCommand) {
        if self.controller_command_tx.send(command).is_err() {
            warn!("Controller gone, dropping command");
        }
    }

    fn broadcast(&mut self, payload: Payload) {
        let envelope = Envelope {
            sender: self.me,
            counter: self.clock.tick(),
            payload,
        };
        match self.decision_to_network_tx.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => warn!("Network sender backed up, dropping message"),
            Err(mpsc::error::TrySendError::Closed(_)) => warn!("Network sender gone, dropping message"),
        }
    }

    fn broadcast_orders(&mut self, restore_cab: bool) {
        let orders = self.elevator_state_rx.borrow().orders.clone();
        self.broadcast(Payload::Sync { orders, restore_cab });
    }

    fn arm_timer(&mut self, order: Order, generation: u64) {
        let timeout_tx = self.timeout_tx.clone();
        let delay = self.timing.bid_timeout;
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            let _ = timeout_tx.send(BidTimeout { order, generation });
        });
        self.auctions.set_timer(order, timer);
    }

    //---------AUCTIONS--------------------//

    fn start_auction(&mut self, order: Order) {
        if self.live_peers.is_empty() {
            info!("Alone, taking {:?} at floor {} without an auction", order.button, order.floor);
            self.command(ControllerCommand::AssignHall { node: self.me, order });
            return;
        }

        let cost = self.own_cost(order);
        let generation = self.auctions.open(order, self.me, cost);
        self.arm_timer(order, generation);
        info!(
            "Opening auction for {:?} at floor {}, own cost {:?}",
            order.button, order.floor, cost
        );
        self.broadcast(Payload::Bid {
            order,
            cost_ms: millis(cost),
            round: 0,
        });
    }

    fn try_resolve(&mut self, order: Order) {
        let live = self.live_nodes();
        if self.auctions.get(order).is_some_and(|auction| auction.complete(&live)) {
            self.resolve(order, "all bids in");
        }
    }

    fn resolve(&mut self, order: Order, reason: &str) {
        let Some(auction) = self.auctions.close(order, Instant::now()) else {
            return;
        };
        // No live bids at all: serve it ourselves.
        let winner = auction.winner(&self.live_nodes()).unwrap_or(self.me);
        info!(
            "Node {} wins {:?} at floor {} ({}, {} bids)",
            winner,
            order.button,
            order.floor,
            reason,
            auction.costs.len()
        );
        self.command(ControllerCommand::AssignHall { node: winner, order });
    }

    fn handle_bid_timeout(&mut self, timeout: BidTimeout) {
        match self.auctions.get(timeout.order) {
            Some(auction) if auction.generation == timeout.generation => self.resolve(timeout.order, "timed out"),
            _ => debug!("Ignoring timer for already resolved {:?}", timeout.order),
        }
    }

    fn on_hall_request(&mut self, order: Order) {
        let now = Instant::now();
        if self.auctions.is_pending(order)
            || self
                .auctions
                .recently_resolved(order, now, self.timing.resolved_memory())
        {
            debug!("Already bidding on {order:?}");
            return;
        }
        if self.held_by_live_node(order) {
            debug!("{order:?} is already assigned");
            return;
        }
        self.start_auction(order);
    }

    fn on_bid(&mut self, sender: NodeId, order: Order, cost: Duration, round: u32) {
        if !order.button.is_hall() || order.floor >= self.num_floors {
            warn!("Ignoring bid for invalid order {order:?} from node {sender}");
            return;
        }
        let now = Instant::now();
        self.auctions.forget_resolved(now, self.timing.resolved_memory());

        if self.auctions.record(order, sender, cost) {
            debug!("Bid {cost:?} from node {sender} for {order:?}");
            self.try_resolve(order);
            return;
        }
        // Round 0 opens a new auction (a takeover); only replies can be late.
        if round > 0
            && self
                .auctions
                .recently_resolved(order, now, self.timing.resolved_memory())
        {
            debug!("Late bid from node {sender} for resolved {order:?}");
            return;
        }
        if self.held_by_live_node(order) {
            debug!("Bid from node {sender} for {order:?}, which is already assigned");
            return;
        }

        let own = self.own_cost(order);
        let generation = self.auctions.open(order, self.me, own);
        self.auctions.record(order, sender, cost);
        self.arm_timer(order, generation);
        debug!("Joining auction for {order:?} opened by node {sender}, own cost {own:?}");
        self.broadcast(Payload::Bid {
            order,
            cost_ms: millis(own),
            round: round.saturating_add(1),
        });
        self.try_resolve(order);
    }

    //---------EVENTS--------------------//

    fn handle_controller_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::HallRequest(order) => self.on_hall_request(order),
            ControllerEvent::OrdersChanged(orders) => {
                if self.is_joining() {
                    debug!("Still joining, holding back sync");
                    self.held_back = true;
                    return;
                }
                self.broadcast(Payload::Sync {
                    orders,
                    restore_cab: false,
                });
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        self.clock.observe(envelope.counter);
        let sender = envelope.sender;
        if sender == self.me || sender as usize >= self.num_nodes {
            debug!("Ignoring message claiming to be from node {sender}");
            return;
        }
        if !self.freshness.accept(sender, envelope.counter) {
            debug!("Discarding stale message {} from node {sender}", envelope.counter);
            return;
        }

        match envelope.payload {
            Payload::Bid { order, cost_ms, round } => {
                self.on_bid(sender, order, Duration::from_millis(cost_ms), round)
            }
            Payload::Sync { orders, restore_cab } => self.on_sync(sender, orders, restore_cab),
        }
    }

    fn on_sync(&mut self, sender: NodeId, orders: OrderMatrix, restore_cab: bool) {
        if !OrderMatrix::new(self.num_nodes, self.num_floors).same_shape(&orders) {
            warn!("Dropping sync with wrong dimensions from node {sender}");
            return;
        }
        if self.is_joining() {
            info!("Joined the fleet with state from node {sender}");
        }
        self.joining_until = None;
        self.held_back = false;
        debug!("Sync from node {sender} (restore cab: {restore_cab})");
        self.command(ControllerCommand::ApplySync { orders, restore_cab });
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::New(peer) => {
                if peer == self.me || peer as usize >= self.num_nodes || !self.live_peers.insert(peer) {
                    return;
                }
                info!("Node {peer} joined");
                self.freshness.forget(peer);
                // While joining our view is only worth sharing if we already
                // serve hall orders nobody else knows about.
                let holds_hall_orders =
                    !self.elevator_state_rx.borrow().orders.hall_orders(self.me).is_empty();
                if self.is_joining() && !holds_hall_orders {
                    return;
                }
                self.broadcast_orders(true);
            }
            PeerEvent::Lost(peer) => {
                if !self.live_peers.remove(&peer) {
                    return;
                }
                let orphaned = self.elevator_state_rx.borrow().orders.hall_orders(peer);
                info!("Node {peer} lost, holding {} hall orders", orphaned.len());
                self.command(ControllerCommand::ReleasePeer(peer));

                for order in self.auctions.pending_orders() {
                    self.try_resolve(order);
                }
                if self.live_nodes().first() == Some(&self.me) {
                    for order in orphaned {
                        self.take_over(order);
                    }
                }
            }
        }
    }

    fn on_join_window_closed(&mut self) {
        self.joining_until = None;
        if std::mem::take(&mut self.held_back) {
            info!("Joining window over, sending held back orders");
            self.broadcast_orders(false);
        } else {
            debug!("Joining window over");
        }
    }

    fn take_over(&mut self, order: Order) {
        if self.auctions.is_pending(order) || self.held_by_live_node(order) {
            return;
        }
        info!("Taking over {:?} at floor {}", order.button, order.floor);
        self.start_auction(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::common::ButtonType;

    struct Harness {
        decision: Decision,
        state_tx: watch::Sender<ElevatorState>,
        event_tx: mpsc::UnboundedSender<ControllerEvent>,
        command_rx: mpsc::UnboundedReceiver<ControllerCommand>,
        inbox_tx: mpsc::Sender<Envelope>,
        outbox_rx: mpsc::Receiver<Envelope>,
        peer_tx: mpsc::Sender<PeerEvent>,
        counter: u64,
    }

    fn harness(me: NodeId) -> Harness {
        harness_with(Config::new(me, 3, 4))
    }

    fn harness_with(config: Config) -> Harness {
        let me = config.node_id;
        let (state_tx, state_rx) = watch::channel(ElevatorState::new(me, 3, 4));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::channel(16);
        let (outbox_tx, outbox_rx) = mpsc::channel(16);
        let (peer_tx, peer_rx) = mpsc::channel(16);
        let decision = Decision::new(&config, state_rx, event_rx, command_tx, inbox_rx, outbox_tx, peer_rx);
        Harness {
            decision,
            state_tx,
            event_tx,
            command_rx,
            inbox_tx,
            outbox_rx,
            peer_tx,
            counter: 0,
        }
    }

    impl Harness {
        async fn controller(&mut self, event: ControllerEvent) {
            self.event_tx.send(event).unwrap();
            self.decision.step().await.unwrap();
        }

        async fn peer(&mut self, event: PeerEvent) {
            self.peer_tx.send(event).await.unwrap();
            self.decision.step().await.unwrap();
        }

        async fn deliver(&mut self, envelope: Envelope) {
            self.inbox_tx.send(envelope).await.unwrap();
            self.decision.step().await.unwrap();
        }

        async fn remote(&mut self, sender: NodeId, payload: Payload) {
            self.counter += 1;
            let envelope = Envelope {
                sender,
                counter: self.counter,
                payload,
            };
            self.deliver(envelope).await;
        }

        /// Lets the joining window run out and handles its closing.
        async fn finish_joining(&mut self) {
            sleep(Timing::default().join_grace() + Duration::from_millis(1)).await;
            self.decision.step().await.unwrap();
            assert!(!self.decision.is_joining());
        }

        fn sent(&mut self) -> Vec<Payload> {
            let mut sent = Vec::new();
            while let Ok(envelope) = self.outbox_rx.try_recv() {
                sent.push(envelope.payload);
            }
            sent
        }

        fn commands(&mut self) -> Vec<ControllerCommand> {
            let mut commands = Vec::new();
            while let Ok(command) = self.command_rx.try_recv() {
                commands.push(command);
            }
            commands
        }

        fn hold(&self, node: NodeId, order: Order) {
            self.state_tx.send_modify(|state| {
                state.orders.set(node, order.floor, order.button, true);
            });
        }
    }

    fn bid(order: Order, cost_ms: u64, round: u32) -> Payload {
        Payload::Bid { order, cost_ms, round }
    }

    fn assign(node: NodeId, order: Order) -> ControllerCommand {
        ControllerCommand::AssignHall { node, order }
    }

    #[tokio::test(start_paused = true)]
    async fn alone_takes_the_order_without_an_auction() {
        let mut h = harness(0);
        let order = Order::new(1, ButtonType::HallUp);
        h.controller(ControllerEvent::HallRequest(order)).await;
        assert_eq!(h.commands(), vec![assign(0, order)]);
        assert!(h.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cheaper_peer_wins() {
        let mut h = harness(0);
        let order = Order::new(3, ButtonType::HallDown);
        h.peer(PeerEvent::New(1)).await;
        assert!(h.sent().is_empty());

        h.controller(ControllerEvent::HallRequest(order)).await;
        // Three floors at 2.5 s plus one door cycle.
        assert_eq!(h.sent(), vec![bid(order, 10_500, 0)]);
        assert!(h.commands().is_empty());

        h.remote(1, bid(order, 4_000, 1)).await;
        assert_eq!(h.commands(), vec![assign(1, order)]);
        assert!(h.decision.pending_auctions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tie_goes_to_the_smaller_id_on_both_sides() {
        let order = Order::new(0, ButtonType::HallUp);

        let mut replier = harness(1);
        replier.peer(PeerEvent::New(0)).await;
        replier.remote(0, bid(order, 0, 0)).await;
        assert_eq!(replier.sent(), vec![bid(order, 0, 1)]);
        assert_eq!(replier.commands(), vec![assign(0, order)]);

        let mut originator = harness(0);
        originator.peer(PeerEvent::New(1)).await;
        originator.controller(ControllerEvent::HallRequest(order)).await;
        originator.remote(1, bid(order, 0, 1)).await;
        assert_eq!(originator.commands(), vec![assign(0, order)]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_bids_count_once_and_timeout_resolves() {
        let mut h = harness(0);
        let order = Order::new(3, ButtonType::HallDown);
        h.peer(PeerEvent::New(1)).await;
        h.peer(PeerEvent::New(2)).await;
        h.controller(ControllerEvent::HallRequest(order)).await;

        let envelope = Envelope {
            sender: 1,
            counter: 9,
            payload: bid(order, 4_000, 1),
        };
        h.deliver(envelope.clone()).await;
        h.deliver(envelope).await;
        assert!(h.commands().is_empty());

        let opened = Instant::now();
        h.decision.step().await.unwrap();
        assert!(Instant::now() - opened >= Timing::default().bid_timeout);
        assert_eq!(h.commands(), vec![assign(1, order)]);
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_auction_timer_never_fires() {
        let mut h = harness(0);
        let order = Order::new(2, ButtonType::HallUp);
        h.peer(PeerEvent::New(1)).await;
        h.controller(ControllerEvent::HallRequest(order)).await;
        h.remote(1, bid(order, 1_000, 1)).await;
        assert_eq!(h.commands().len(), 1);

        let run = async {
            loop {
                h.decision.step().await.unwrap();
            }
        };
        let quiet = tokio::time::timeout(Duration::from_secs(5), run).await;
        assert!(quiet.is_err());
        assert!(h.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_and_repeated_syncs_are_discarded() {
        let mut h = harness(0);
        let sync = |counter| Envelope {
            sender: 1,
            counter,
            payload: Payload::Sync {
                orders: OrderMatrix::new(3, 4),
                restore_cab: false,
            },
        };
        h.deliver(sync(5)).await;
        assert_eq!(h.commands().len(), 1);
        h.deliver(sync(5)).await;
        h.deliver(sync(4)).await;
        assert!(h.commands().is_empty());
        h.deliver(sync(6)).await;
        assert_eq!(h.commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_peer_is_heard_again() {
        let mut h = harness(0);
        let sync = |counter| Envelope {
            sender: 1,
            counter,
            payload: Payload::Sync {
                orders: OrderMatrix::new(3, 4),
                restore_cab: false,
            },
        };
        h.peer(PeerEvent::New(1)).await;
        h.deliver(sync(50)).await;
        h.peer(PeerEvent::Lost(1)).await;
        h.peer(PeerEvent::New(1)).await;
        h.commands();

        h.deliver(sync(1)).await;
        assert_eq!(h.commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_bid_does_not_reopen_the_auction() {
        let mut h = harness(0);
        let order = Order::new(3, ButtonType::HallDown);
        h.peer(PeerEvent::New(1)).await;
        h.controller(ControllerEvent::HallRequest(order)).await;
        h.remote(1, bid(order, 4_000, 1)).await;
        h.sent();
        h.commands();

        h.remote(1, bid(order, 4_000, 2)).await;
        assert!(h.sent().is_empty());
        assert!(h.commands().is_empty());
        assert!(h.decision.pending_auctions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_right_after_resolution_is_joined() {
        let mut h = harness(2);
        let order = Order::new(2, ButtonType::HallUp);
        h.peer(PeerEvent::New(0)).await;
        h.peer(PeerEvent::New(1)).await;
        h.remote(0, bid(order, 5_000, 0)).await;
        h.remote(1, bid(order, 4_000, 1)).await;
        assert_eq!(h.commands(), vec![assign(1, order)]);
        h.sent();

        h.peer(PeerEvent::Lost(1)).await;
        h.commands();
        h.remote(0, bid(order, 5_000, 0)).await;
        assert_eq!(h.sent(), vec![bid(order, 8_000, 1)]);
        assert_eq!(h.commands(), vec![assign(0, order)]);
    }

    #[tokio::test(start_paused = true)]
    async fn bid_for_an_order_a_live_node_holds_is_ignored() {
        let mut h = harness(0);
        let order = Order::new(2, ButtonType::HallUp);
        h.peer(PeerEvent::New(1)).await;
        h.hold(1, order);

        h.remote(1, bid(order, 1_000, 0)).await;
        assert!(h.sent().is_empty());
        assert!(h.decision.pending_auctions().is_empty());

        h.controller(ControllerEvent::HallRequest(order)).await;
        assert!(h.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn smallest_survivor_reauctions_lost_orders_once() {
        let order = Order::new(2, ButtonType::HallUp);

        let mut h = harness(0);
        h.peer(PeerEvent::New(1)).await;
        h.peer(PeerEvent::New(2)).await;
        h.hold(1, order);
        h.peer(PeerEvent::Lost(1)).await;
        assert_eq!(h.commands(), vec![ControllerCommand::ReleasePeer(1)]);
        assert_eq!(h.sent(), vec![bid(order, 8_000, 0)]);
        assert_eq!(h.decision.pending_auctions(), vec![order]);

        h.peer(PeerEvent::Lost(1)).await;
        assert!(h.sent().is_empty());

        let mut other = harness(2);
        other.peer(PeerEvent::New(0)).await;
        other.peer(PeerEvent::New(1)).await;
        other.hold(1, order);
        other.peer(PeerEvent::Lost(1)).await;
        assert_eq!(other.commands(), vec![ControllerCommand::ReleasePeer(1)]);
        assert!(other.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn last_survivor_takes_lost_orders_directly() {
        let order = Order::new(2, ButtonType::HallUp);
        let mut h = harness(1);
        h.peer(PeerEvent::New(0)).await;
        h.hold(0, order);
        h.peer(PeerEvent::Lost(0)).await;
        assert_eq!(
            h.commands(),
            vec![ControllerCommand::ReleasePeer(0), assign(1, order)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn losing_a_silent_peer_completes_the_auction() {
        let mut h = harness(0);
        let order = Order::new(3, ButtonType::HallDown);
        h.peer(PeerEvent::New(1)).await;
        h.peer(PeerEvent::New(2)).await;
        h.controller(ControllerEvent::HallRequest(order)).await;
        h.remote(1, bid(order, 4_000, 1)).await;
        assert!(h.commands().is_empty());

        h.peer(PeerEvent::Lost(2)).await;
        assert_eq!(
            h.commands(),
            vec![ControllerCommand::ReleasePeer(2), assign(1, order)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_peer_gets_a_restoring_sync() {
        let mut h = harness(0);
        h.finish_joining().await;
        h.hold(0, Order::new(1, ButtonType::HallDown));

        h.peer(PeerEvent::New(1)).await;
        match h.sent().as_slice() {
            [Payload::Sync { orders, restore_cab }] => {
                assert!(*restore_cab);
                assert!(orders.get(0, 1, ButtonType::HallDown));
            }
            other => panic!("expected one sync, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn joining_node_stays_quiet_until_it_hears_from_the_fleet() {
        let mut h = harness(2);
        let mut orders = OrderMatrix::new(3, 4);
        orders.set(2, 0, ButtonType::Cab, true);

        h.controller(ControllerEvent::OrdersChanged(orders.clone())).await;
        h.peer(PeerEvent::New(0)).await;
        assert!(h.sent().is_empty());

        h.remote(0, Payload::Sync {
            orders: OrderMatrix::new(3, 4),
            restore_cab: true,
        }).await;
        assert!(matches!(
            h.commands().as_slice(),
            [ControllerCommand::ApplySync { restore_cab: true, .. }]
        ));

        h.controller(ControllerEvent::OrdersChanged(orders.clone())).await;
        assert_eq!(
            h.sent(),
            vec![Payload::Sync {
                orders,
                restore_cab: false
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn changes_held_back_while_joining_go_out_when_the_window_closes() {
        let mut h = harness(1);
        h.peer(PeerEvent::New(0)).await;
        h.hold(1, Order::new(0, ButtonType::HallUp));
        h.controller(ControllerEvent::OrdersChanged(OrderMatrix::new(3, 4))).await;
        assert!(h.sent().is_empty());

        h.state_tx.send_modify(|state| {
            state.orders.set(1, 0, ButtonType::HallUp, false);
        });
        h.finish_joining().await;
        match h.sent().as_slice() {
            [Payload::Sync { orders, restore_cab }] => {
                assert!(!*restore_cab);
                assert!(!orders.has_any(1));
            }
            other => panic!("expected one sync, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_window_ends_without_a_sync_when_nothing_changed() {
        let mut h = harness(1);
        h.peer(PeerEvent::New(0)).await;
        h.finish_joining().await;
        assert!(h.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn joining_node_holding_hall_orders_answers_a_new_peer() {
        let mut h = harness(0);
        let order = Order::new(3, ButtonType::HallDown);
        h.controller(ControllerEvent::HallRequest(order)).await;
        assert_eq!(h.commands(), vec![assign(0, order)]);
        h.hold(0, order);
        assert!(h.decision.is_joining());

        h.peer(PeerEvent::New(1)).await;
        match h.sent().as_slice() {
            [Payload::Sync { orders, restore_cab }] => {
                assert!(*restore_cab);
                assert!(orders.get(0, 3, ButtonType::HallDown));
            }
            other => panic!("expected one sync, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn own_cost_is_compared_at_wire_precision() {
        let mut config = Config::new(0, 3, 4);
        config.timing.travel_per_floor = Duration::from_micros(2_500_500);
        let mut h = harness_with(config);
        let order = Order::new(1, ButtonType::HallUp);
        h.peer(PeerEvent::New(1)).await;

        h.controller(ControllerEvent::HallRequest(order)).await;
        assert_eq!(h.sent(), vec![bid(order, 5_500, 0)]);
        // Equal on the wire, so both sides pick the smaller id.
        h.remote(1, bid(order, 5_500, 1)).await;
        assert_eq!(h.commands(), vec![assign(0, order)]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_network_queue_does_not_stall_the_loop() {
        let mut h = harness(0);
        h.finish_joining().await;
        for _ in 0..20 {
            let handled = tokio::time::timeout(
                Duration::from_secs(1),
                h.controller(ControllerEvent::OrdersChanged(OrderMatrix::new(3, 4))),
            )
            .await;
            assert!(handled.is_ok());
        }
        assert_eq!(h.sent().len(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_sync_is_dropped() {
        let mut h = harness(0);
        h.remote(1, Payload::Sync {
            orders: OrderMatrix::new(2, 4),
            restore_cab: false,
        }).await;
        assert!(h.commands().is_empty());
        assert!(h.decision.is_joining());
    }
}
