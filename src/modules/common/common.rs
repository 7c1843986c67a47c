use serde::{Deserialize, Serialize};

use super::orders::OrderMatrix;

/// Index of a car in the fleet. Also the row index into the order matrix.
pub type NodeId = u8;

pub const NUM_BUTTONS: usize = 3;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ButtonType {
    HallUp,
    HallDown,
    Cab,
}

impl ButtonType {
    pub const ALL: [ButtonType; NUM_BUTTONS] = [ButtonType::HallUp, ButtonType::HallDown, ButtonType::Cab];
    pub const HALL: [ButtonType; 2] = [ButtonType::HallUp, ButtonType::HallDown];

    pub fn index(self) -> usize {
        match self {
            ButtonType::HallUp => 0,
            ButtonType::HallDown => 1,
            ButtonType::Cab => 2,
        }
    }

    /// Maps the driver's call code (0 up, 1 down, 2 cab) to a button.
    pub fn from_call(call: u8) -> Option<Self> {
        match call {
            0 => Some(ButtonType::HallUp),
            1 => Some(ButtonType::HallDown),
            2 => Some(ButtonType::Cab),
            _ => None,
        }
    }

    pub fn is_hall(self) -> bool {
        self != ButtonType::Cab
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Stop,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Stop => Direction::Stop,
        }
    }

    /// Hall button a passenger travelling this way would have pressed.
    pub fn hall_button(self) -> Option<ButtonType> {
        match self {
            Direction::Up => Some(ButtonType::HallUp),
            Direction::Down => Some(ButtonType::HallDown),
            Direction::Stop => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Idle,
    Moving,
    DoorOpen,
}

/// One hall or cab call at a floor.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Order {
    pub floor: u8,
    pub button: ButtonType,
}

impl Order {
    pub fn new(floor: u8, button: ButtonType) -> Self {
        Order { floor, button }
    }
}

/// Snapshot of one car. Owned and written only by the `ElevatorController`;
/// everyone else sees clones published on a watch channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ElevatorState {
    pub node_id: NodeId,
    pub floor: u8,
    pub direction: Direction,
    pub behaviour: Behaviour,
    pub obstructed: bool,
    pub orders: OrderMatrix,
}

impl ElevatorState {
    pub fn new(node_id: NodeId, num_nodes: usize, num_floors: u8) -> Self {
        ElevatorState {
            node_id,
            floor: 0,
            direction: Direction::Stop,
            behaviour: Behaviour::Idle,
            obstructed: false,
            orders: OrderMatrix::new(num_nodes, num_floors),
        }
    }

    pub fn num_floors(&self) -> u8 {
        self.orders.num_floors()
    }

    pub fn top_floor(&self) -> u8 {
        self.num_floors().saturating_sub(1)
    }

    /// Whether this car's own row holds `order`.
    pub fn has_order(&self, order: Order) -> bool {
        self.orders.get(self.node_id, order.floor, order.button)
    }
}
