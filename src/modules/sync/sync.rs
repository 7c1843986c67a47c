//! Merging an incoming order-matrix sync into the local replica.
//!
//! Hall cells are shared truth and are overwritten. A peer's cab row is
//! owned by that peer and is overwritten too. Our own cab row is never
//! cleared by a peer; cells are only added back from a restoring sync, and
//! never at the floor the car is standing at.

use crate::modules::common::{ButtonType, NodeId, Order, OrderMatrix};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub changed: bool,
    /// Own cab orders brought back from a peer's copy
    pub restored: Vec<Order>,
}

/// Applies `incoming` onto `local`. Payloads of a different shape are ignored.
pub fn merge_sync(
    local: &mut OrderMatrix,
    incoming: &OrderMatrix,
    me: NodeId,
    current_floor: u8,
    restore_cab: bool,
) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();
    if !local.same_shape(incoming) {
        return outcome;
    }

    for node in 0..local.num_nodes() as NodeId {
        for floor in 0..local.num_floors() {
            for button in ButtonType::ALL {
                let remote = incoming.get(node, floor, button);
                match button {
                    ButtonType::Cab if node == me => {
                        if restore_cab && remote && floor != current_floor && local.set(node, floor, button, true) {
                            outcome.changed = true;
                            outcome.restored.push(Order::new(floor, button));
                        }
                    }
                    _ => outcome.changed |= local.set(node, floor, button, remote),
                }
            }
        }
    }
    outcome
}
