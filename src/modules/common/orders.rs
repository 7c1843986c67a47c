use serde::{Deserialize, Serialize};

use super::common::{ButtonType, NodeId, Order, NUM_BUTTONS};

/// Local replica of the fleet-wide order grid, indexed `[node][floor][button]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OrderMatrix {
    cells: Vec<Vec<[bool; NUM_BUTTONS]>>,
}

impl OrderMatrix {
    pub fn new(num_nodes: usize, num_floors: u8) -> Self {
        OrderMatrix {
            cells: vec![vec![[false; NUM_BUTTONS]; num_floors as usize]; num_nodes],
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.cells.len()
    }

    pub fn num_floors(&self) -> u8 {
        self.cells.first().map_or(0, |row| row.len() as u8)
    }

    /// A payload from the wire is only usable if every row has the same length
    /// and the dimensions match our own.
    pub fn same_shape(&self, other: &OrderMatrix) -> bool {
        self.num_nodes() == other.num_nodes()
            && other
                .cells
                .iter()
                .all(|row| row.len() == self.num_floors() as usize)
    }

    pub fn get(&self, node: NodeId, floor: u8, button: ButtonType) -> bool {
        self.cells
            .get(node as usize)
            .and_then(|row| row.get(floor as usize))
            .is_some_and(|cell| cell[button.index()])
    }

    /// Writes one cell and reports whether it changed. Out-of-range writes are ignored.
    pub fn set(&mut self, node: NodeId, floor: u8, button: ButtonType, value: bool) -> bool {
        match self
            .cells
            .get_mut(node as usize)
            .and_then(|row| row.get_mut(floor as usize))
        {
            Some(cell) if cell[button.index()] != value => {
                cell[button.index()] = value;
                true
            }
            _ => false,
        }
    }

    /// Every hall order held in `node`'s row.
    pub fn hall_orders(&self, node: NodeId) -> Vec<Order> {
        let mut orders = Vec::new();
        for floor in 0..self.num_floors() {
            for button in ButtonType::HALL {
                if self.get(node, floor, button) {
                    orders.push(Order::new(floor, button));
                }
            }
        }
        orders
    }

    /// Whether any of `nodes` already holds the hall order.
    pub fn hall_assigned<I>(&self, order: Order, nodes: I) -> bool
    where
        I: IntoIterator<Item = NodeId>,
    {
        nodes
            .into_iter()
            .any(|node| self.get(node, order.floor, order.button))
    }

    pub fn clear_hall_row(&mut self, node: NodeId) -> bool {
        let mut changed = false;
        for floor in 0..self.num_floors() {
            for button in ButtonType::HALL {
                changed |= self.set(node, floor, button, false);
            }
        }
        changed
    }

    /// Lamp picture for `me`: hall lamps show every row, cab lamps only our own.
    pub fn lamps(&self, me: NodeId) -> Vec<[bool; NUM_BUTTONS]> {
        (0..self.num_floors())
            .map(|floor| {
                let mut lamps = [false; NUM_BUTTONS];
                for button in ButtonType::HALL {
                    lamps[button.index()] = (0..self.num_nodes() as NodeId)
                        .any(|node| self.get(node, floor, button));
                }
                lamps[ButtonType::Cab.index()] = self.get(me, floor, ButtonType::Cab);
                lamps
            })
            .collect()
    }

    pub fn has_any(&self, node: NodeId) -> bool {
        self.cells
            .get(node as usize)
            .is_some_and(|row| row.iter().any(|cell| cell.iter().any(|&set| set)))
    }
}
