//! Direction algorithm, stop predicate and clearing policy.
//!
//! All functions look only at the car's own row of the order matrix and are
//! shared between the live controller and the cost simulation.

use crate::modules::common::{Behaviour, ButtonType, Direction, ElevatorState, Order};

fn any_order_at(state: &ElevatorState, floor: u8) -> bool {
    ButtonType::ALL
        .iter()
        .any(|&button| state.orders.get(state.node_id, floor, button))
}

pub fn orders_above(state: &ElevatorState) -> bool {
    (state.floor.saturating_add(1)..state.num_floors()).any(|floor| any_order_at(state, floor))
}

pub fn orders_below(state: &ElevatorState) -> bool {
    (0..state.floor).any(|floor| any_order_at(state, floor))
}

pub fn orders_here(state: &ElevatorState) -> bool {
    any_order_at(state, state.floor)
}

fn orders_ahead(state: &ElevatorState, dirn: Direction) -> bool {
    match dirn {
        Direction::Up => orders_above(state),
        Direction::Down => orders_below(state),
        Direction::Stop => false,
    }
}

pub fn is_terminal(state: &ElevatorState) -> bool {
    state.floor == 0 || state.floor >= state.top_floor()
}

/// Next `(direction, behaviour)` for a car at rest at `state.floor`, given the
/// direction it was last heading in. Never yields `Moving` with `Stop`, and
/// `DoorOpen` always comes with `Stop`.
pub fn choose_direction(state: &ElevatorState) -> (Direction, Behaviour) {
    match state.direction {
        Direction::Stop => {
            if orders_above(state) {
                (Direction::Up, Behaviour::Moving)
            } else if orders_below(state) {
                (Direction::Down, Behaviour::Moving)
            } else if orders_here(state) {
                (Direction::Stop, Behaviour::DoorOpen)
            } else {
                (Direction::Stop, Behaviour::Idle)
            }
        }
        dirn => {
            if orders_ahead(state, dirn) {
                (dirn, Behaviour::Moving)
            } else if orders_here(state) {
                (Direction::Stop, Behaviour::DoorOpen)
            } else if orders_ahead(state, dirn.opposite()) {
                (dirn.opposite(), Behaviour::Moving)
            } else {
                (Direction::Stop, Behaviour::Idle)
            }
        }
    }
}

/// Whether a car passing `state.floor` heading `state.direction` must stop.
pub fn should_stop(state: &ElevatorState) -> bool {
    if is_terminal(state) {
        return true;
    }
    let me = state.node_id;
    if state.orders.get(me, state.floor, ButtonType::Cab) {
        return true;
    }
    match state.direction.hall_button() {
        Some(button) => state.orders.get(me, state.floor, button),
        None => ButtonType::HALL
            .iter()
            .any(|&button| state.orders.get(me, state.floor, button)),
    }
}

/// What a moving car does on reaching `state.floor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    Continue,
    /// Halt and open the door here
    Stop,
    /// Nothing left ahead, head back the other way without opening
    Turn(Direction),
    /// Nothing left at all
    Halt,
}

pub fn on_arrival(state: &ElevatorState) -> Arrival {
    if should_stop(state) {
        return Arrival::Stop;
    }
    match choose_direction(state) {
        (dirn, Behaviour::Moving) if dirn == state.direction => Arrival::Continue,
        (dirn, Behaviour::Moving) => Arrival::Turn(dirn),
        (_, Behaviour::DoorOpen) => Arrival::Stop,
        (_, Behaviour::Idle) => Arrival::Halt,
    }
}

/// Orders in the own row that a stop at `state.floor`, arriving while heading
/// `travel`, takes care of.
pub fn orders_served_here(state: &ElevatorState, travel: Direction) -> Vec<Order> {
    let floor = state.floor;
    let mut buttons = vec![ButtonType::Cab];
    match travel.hall_button() {
        Some(_) if is_terminal(state) => buttons.extend(ButtonType::HALL),
        Some(with) => {
            buttons.push(with);
            if !orders_ahead(state, travel) {
                buttons.push(travel.opposite().hall_button().unwrap_or(with));
            }
        }
        None => buttons.extend(ButtonType::HALL),
    }
    buttons
        .into_iter()
        .map(|button| Order::new(floor, button))
        .filter(|&order| state.has_order(order))
        .collect()
}

/// Clears what a stop here serves and returns the cleared orders.
pub fn clear_at_current_floor(state: &mut ElevatorState, travel: Direction) -> Vec<Order> {
    let served = orders_served_here(state, travel);
    for order in &served {
        state.orders.set(state.node_id, order.floor, order.button, false);
    }
    served
}
