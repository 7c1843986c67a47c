//! The per-node elevator state machine.
//!
//! `ElevatorController` is the single owner of this node's `ElevatorState`,
//! including the local replica of the order matrix. Everything else talks to
//! it through `ControllerCommand`s and reads snapshots from the watch channel.

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use super::requests::{choose_direction, clear_at_current_floor, on_arrival, orders_here, Arrival};
use crate::modules::common::{
    Behaviour, ButtonType, Direction, ElevatorState, FleetError, NodeId, Order, OrderMatrix, Result, NUM_BUTTONS,
};
use crate::modules::config::{Config, Timing};
use crate::modules::hardware::{ElevatorIo, HardwareEvent};
use crate::modules::sync::{merge_sync, SyncOutcome};

/// Updates to the order matrix, sent by the decision loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCommand {
    /// An auction resolved and `node` now holds `order`
    AssignHall { node: NodeId, order: Order },
    ApplySync { orders: OrderMatrix, restore_cab: bool },
    /// `node` was declared lost; its hall orders are up for takeover
    ReleasePeer(NodeId),
}

/// Things the controller reports back to the decision loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    HallRequest(Order),
    /// Local order state changed; carries the full matrix for a sync
    OrdersChanged(OrderMatrix),
}

pub struct ElevatorController<I: ElevatorIo> {
    io: I,
    state: ElevatorState,
    timing: Timing,
    /// False while the car is in the shaft between two floors
    at_floor: bool,
    homing: bool,
    door_deadline: Option<Instant>,

    hardware_rx: mpsc::Receiver<HardwareEvent>,
    command_rx: mpsc::UnboundedReceiver<ControllerCommand>,
    event_tx: mpsc::UnboundedSender<ControllerEvent>,
    elevator_state_tx: watch::Sender<ElevatorState>,
}

async fn door_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<I: ElevatorIo> ElevatorController<I> {
    /// `start_floor` is what the floor sensor reads at start; `None` means
    /// between floors, in which case the car first drives down to a floor.
    pub fn new(
        config: &Config,
        io: I,
        start_floor: Option<u8>,
        hardware_rx: mpsc::Receiver<HardwareEvent>,
        command_rx: mpsc::UnboundedReceiver<ControllerCommand>,
        event_tx: mpsc::UnboundedSender<ControllerEvent>,
        elevator_state_tx: watch::Sender<ElevatorState>,
    ) -> Self {
        let mut state = ElevatorState::new(config.node_id, config.num_nodes, config.num_floors);

        for floor in 0..config.num_floors {
            for button in ButtonType::ALL {
                io.button_lamp(floor, button, false);
            }
        }
        io.door_lamp(false);
        io.stop_lamp(false);

        let homing = match start_floor {
            Some(floor) if floor < config.num_floors => {
                state.floor = floor;
                io.floor_indicator(floor);
                false
            }
            _ => {
                info!("Started between floors, homing down");
                state.direction = Direction::Down;
                state.behaviour = Behaviour::Moving;
                io.motor_direction(Direction::Down);
                true
            }
        };

        let controller = ElevatorController {
            io,
            state,
            timing: config.timing.clone(),
            at_floor: !homing,
            homing,
            door_deadline: None,
            hardware_rx,
            command_rx,
            event_tx,
            elevator_state_tx,
        };
        controller.publish();
        controller
    }

    pub fn state(&self) -> &ElevatorState {
        &self.state
    }

    pub async fn step(&mut self) -> Result<()> {
        tokio::select! {
            event = self.hardware_rx.recv() => match event {
                Some(event) => self.handle_hardware(event),
                None => return Err(FleetError::ChannelClosed("hardware events")),
            },
            command = self.command_rx.recv() => match command {
                Some(command) => self.handle_command(command),
                None => return Err(FleetError::ChannelClosed("controller commands")),
            },
            _ = door_timer(self.door_deadline) => self.on_door_timeout(),
        }
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        let state = &self.state;
        self.elevator_state_tx.send_if_modified(|current| {
            if current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
    }

    fn emit(&self, event: ControllerEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("Decision loop gone, dropping controller event");
        }
    }

    fn emit_orders_changed(&self) {
        self.emit(ControllerEvent::OrdersChanged(self.state.orders.clone()));
    }

    //---------HARDWARE--------------------//

    fn handle_hardware(&mut self, event: HardwareEvent) {
        match event {
            HardwareEvent::Button { floor, .. } if floor >= self.state.num_floors() => {
                warn!("Button press at unknown floor {floor}");
            }
            HardwareEvent::Button {
                floor,
                button: ButtonType::Cab,
            } => self.on_cab_request(floor),
            HardwareEvent::Button { floor, button } => {
                debug!("Hall call {button:?} at floor {floor}");
                self.emit(ControllerEvent::HallRequest(Order::new(floor, button)));
            }
            HardwareEvent::FloorArrival(floor) => self.on_floor_arrival(floor),
            HardwareEvent::StopButton(pressed) => {
                info!("Stop button {}", if pressed { "pressed" } else { "released" });
                self.io.stop_lamp(pressed);
            }
            HardwareEvent::Obstruction(obstructed) => self.on_obstruction(obstructed),
        }
    }

    fn on_cab_request(&mut self, floor: u8) {
        let me = self.state.node_id;
        if floor == self.state.floor && self.at_floor && self.state.behaviour != Behaviour::Moving {
            debug!("Cab call at current floor {floor}, opening door");
            self.open_door(Direction::Stop);
            return;
        }
        if self.update_orders(|orders| orders.set(me, floor, ButtonType::Cab, true)) {
            info!("Cab order at floor {floor}");
            self.emit_orders_changed();
        }
        self.on_orders_updated();
    }

    fn on_floor_arrival(&mut self, floor: u8) {
        if floor >= self.state.num_floors() {
            warn!("Floor sensor reported unknown floor {floor}");
            return;
        }
        self.state.floor = floor;
        self.io.floor_indicator(floor);

        if self.homing {
            info!("Homed at floor {floor}");
            self.homing = false;
            self.halt();
            self.resume_if_idle();
            return;
        }
        if self.state.behaviour != Behaviour::Moving {
            return;
        }

        match on_arrival(&self.state) {
            Arrival::Continue => debug!("Passing floor {floor}"),
            Arrival::Turn(dirn) => {
                debug!("Nothing ahead at floor {floor}, turning {dirn:?}");
                self.state.direction = dirn;
                self.io.motor_direction(dirn);
            }
            Arrival::Halt => {
                debug!("No orders left, stopping at floor {floor}");
                self.halt();
            }
            Arrival::Stop => {
                let travel = self.state.direction;
                self.open_door(travel);
            }
        }
    }

    fn on_obstruction(&mut self, obstructed: bool) {
        info!("Obstruction {}", if obstructed { "on" } else { "off" });
        self.state.obstructed = obstructed;

        // A moving car is always in the shaft: arrivals either stop it or
        // are passed straight through.
        if obstructed {
            if self.state.behaviour == Behaviour::Moving {
                self.io.motor_direction(Direction::Stop);
                // Keep the travel direction so the car knows which way it was heading.
                self.state.behaviour = Behaviour::Idle;
            }
        } else if self.homing {
            self.start_moving(Direction::Down);
        } else if self.state.behaviour == Behaviour::Idle {
            self.resume_if_idle();
        }
    }

    //---------DOOR AND MOTION--------------------//

    fn restart_door_timer(&mut self) {
        self.door_deadline = Some(Instant::now() + self.timing.door_open);
    }

    fn open_door(&mut self, travel: Direction) {
        if self.state.behaviour == Behaviour::Moving {
            self.io.motor_direction(Direction::Stop);
        }
        self.at_floor = true;
        self.clear_here(travel);
        self.state.direction = Direction::Stop;
        self.state.behaviour = Behaviour::DoorOpen;
        self.io.door_lamp(true);
        self.restart_door_timer();
    }

    fn halt(&mut self) {
        self.io.motor_direction(Direction::Stop);
        self.at_floor = true;
        self.state.direction = Direction::Stop;
        self.state.behaviour = Behaviour::Idle;
    }

    fn start_moving(&mut self, dirn: Direction) {
        debug!("Departing floor {} going {dirn:?}", self.state.floor);
        self.at_floor = false;
        self.state.direction = dirn;
        self.state.behaviour = Behaviour::Moving;
        self.io.motor_direction(dirn);
    }

    fn on_door_timeout(&mut self) {
        self.door_deadline = None;
        if self.state.behaviour != Behaviour::DoorOpen {
            return;
        }
        if self.state.obstructed {
            debug!("Door obstructed, keeping it open");
            self.restart_door_timer();
            return;
        }

        match choose_direction(&self.state) {
            (_, Behaviour::DoorOpen) => {
                self.clear_here(Direction::Stop);
                self.restart_door_timer();
            }
            (dirn, Behaviour::Moving) => {
                self.io.door_lamp(false);
                self.start_moving(dirn);
            }
            (_, Behaviour::Idle) => {
                self.io.door_lamp(false);
                self.state.direction = Direction::Stop;
                self.state.behaviour = Behaviour::Idle;
            }
        }
    }

    /// Picks up work when idle: serves the current floor or departs.
    fn resume_if_idle(&mut self) {
        if self.state.behaviour != Behaviour::Idle || self.state.obstructed || self.homing {
            return;
        }
        if self.at_floor && orders_here(&self.state) {
            self.open_door(Direction::Stop);
            return;
        }

        let dirn = match choose_direction(&self.state) {
            (dirn, Behaviour::Moving) => dirn,
            // Halted in the shaft with work only at the last floor passed:
            // run on to the next floor and come back from there.
            (_, Behaviour::DoorOpen) if !self.at_floor && self.state.direction != Direction::Stop => {
                self.state.direction
            }
            _ => return,
        };
        self.start_moving(dirn);
    }

    //---------ORDERS--------------------//

    fn lamps(&self) -> Vec<[bool; NUM_BUTTONS]> {
        self.state.orders.lamps(self.state.node_id)
    }

    fn sync_lamps(&self, before: &[[bool; NUM_BUTTONS]]) {
        let after = self.lamps();
        for (floor, (old, new)) in before.iter().zip(&after).enumerate() {
            for button in ButtonType::ALL {
                let i = button.index();
                if old[i] != new[i] {
                    self.io.button_lamp(floor as u8, button, new[i]);
                }
            }
        }
    }

    fn update_orders(&mut self, update: impl FnOnce(&mut OrderMatrix) -> bool) -> bool {
        let before = self.lamps();
        let changed = update(&mut self.state.orders);
        if changed {
            self.sync_lamps(&before);
        }
        changed
    }

    fn clear_here(&mut self, travel: Direction) {
        let before = self.lamps();
        let served = clear_at_current_floor(&mut self.state, travel);
        if served.is_empty() {
            return;
        }
        self.sync_lamps(&before);
        info!("Served {:?} at floor {}", served, self.state.floor);
        self.emit_orders_changed();
    }

    fn on_orders_updated(&mut self) {
        match self.state.behaviour {
            Behaviour::Idle => self.resume_if_idle(),
            Behaviour::DoorOpen if orders_here(&self.state) => {
                self.clear_here(Direction::Stop);
                self.restart_door_timer();
            }
            _ => {}
        }
    }

    fn handle_command(&mut self, command: ControllerCommand) {
        let me = self.state.node_id;
        match command {
            ControllerCommand::AssignHall { node, order } => {
                if !order.button.is_hall() || order.floor >= self.state.num_floors() {
                    warn!("Ignoring malformed hall assignment {order:?}");
                    return;
                }
                let changed = self.update_orders(|orders| orders.set(node, order.floor, order.button, true));
                if changed && node == me {
                    info!("Took hall order {:?} at floor {}", order.button, order.floor);
                    self.emit_orders_changed();
                }
                self.on_orders_updated();
            }
            ControllerCommand::ApplySync { orders, restore_cab } => {
                let floor = self.state.floor;
                let mut outcome = SyncOutcome::default();
                self.update_orders(|local| {
                    outcome = merge_sync(local, &orders, me, floor, restore_cab);
                    outcome.changed
                });
                if !outcome.restored.is_empty() {
                    info!("Restored cab orders {:?}", outcome.restored);
                }
                if outcome.changed {
                    self.on_orders_updated();
                }
            }
            ControllerCommand::ReleasePeer(node) if node != me => {
                if self.update_orders(|orders| orders.clear_hall_row(node)) {
                    info!("Released hall orders of lost node {node}");
                }
            }
            ControllerCommand::ReleasePeer(_) => {}
        }
    }
}
