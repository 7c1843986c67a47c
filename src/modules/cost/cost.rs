//! Time-to-serve estimate used as a bid.
//!
//! The estimate runs the car forward on a copy of its state, using the same
//! direction, stop and clearing rules as the live controller, until the
//! candidate order would be cleared.

use std::time::Duration;

use crate::modules::common::{Behaviour, Direction, ElevatorState, Order};
use crate::modules::config::Timing;
use crate::modules::elevator::requests::{choose_direction, clear_at_current_floor, on_arrival, Arrival};

/// Bid for a car that cannot serve anything, e.g. while obstructed.
pub const NEVER: Duration = Duration::from_secs(24 * 60 * 60);

fn step(floor: u8, dirn: Direction, num_floors: u8) -> Option<u8> {
    match dirn {
        Direction::Up if floor + 1 < num_floors => Some(floor + 1),
        Direction::Down if floor > 0 => Some(floor - 1),
        _ => None,
    }
}

/// Estimated time for `elevator` to serve `order` if it were given the order now.
pub fn time_to_serve(elevator: &ElevatorState, order: Order, timing: &Timing) -> Duration {
    if elevator.obstructed || order.floor >= elevator.num_floors() {
        return NEVER;
    }

    let mut sim = elevator.clone();
    sim.orders.set(sim.node_id, order.floor, order.button, true);
    let door_open_at_start = sim.behaviour == Behaviour::DoorOpen;
    let mut duration = Duration::ZERO;

    match sim.behaviour {
        Behaviour::Idle => {
            if sim.floor == order.floor {
                return Duration::ZERO;
            }
            let (dirn, _) = choose_direction(&sim);
            if dirn == Direction::Stop {
                return Duration::ZERO;
            }
            sim.direction = dirn;
        }
        Behaviour::DoorOpen => {
            if sim.floor == order.floor {
                return timing.door_open / 2;
            }
            duration += timing.door_open / 2;
            let (dirn, _) = choose_direction(&sim);
            if dirn == Direction::Stop {
                return duration;
            }
            sim.direction = dirn;
        }
        Behaviour::Moving => {}
    }

    // A car can not need more than a few sweeps of the shaft.
    let max_steps = 4 * sim.num_floors() as usize + 4;
    for _ in 0..max_steps {
        let Some(next) = step(sim.floor, sim.direction, sim.num_floors()) else {
            return NEVER;
        };
        sim.floor = next;
        duration += timing.travel_per_floor;

        match on_arrival(&sim) {
            Arrival::Continue => {}
            Arrival::Turn(dirn) => sim.direction = dirn,
            Arrival::Halt => return NEVER,
            Arrival::Stop => {
                let travel = sim.direction;
                let served = clear_at_current_floor(&mut sim, travel);
                if served.contains(&order) {
                    let door = if door_open_at_start {
                        timing.door_open / 2
                    } else {
                        timing.door_open
                    };
                    return duration + door;
                }
                duration += timing.door_open;

                match choose_direction(&sim) {
                    (dirn, Behaviour::Moving) => sim.direction = dirn,
                    _ => return NEVER,
                }
            }
        }
    }
    NEVER
}
