//! Resource reservation planner.
//!
//! Binds every process instance of a cluster request to exactly one node,
//! first-fit in registry order. A process never spans nodes, so mixed
//! templates such as "2 gpus + 1 cpu" always land on one machine.
//!
//! Planning is pure: it reads the fleet and returns reservations, or `None`
//! if any instance cannot be placed. Slots are only claimed later, by the
//! caller, under the scheduler lock.

use pit_id::NodeId;
use tracing::trace;

use crate::registry::{Fleet, Node, NodeState};
use crate::request::{ClusterRequest, ResourceRequirement};

/// Slots claimed on one node for one process instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub node: NodeId,
    /// Indices into the node's slot list, in claim order.
    pub resources: Vec<usize>,
}

impl Reservation {
    fn holds(&self, node: &NodeId, index: usize) -> bool {
        &self.node == node && self.resources.contains(&index)
    }
}

/// Reserve the whole request on nodes with state at least `min_state`.
///
/// Returns one reservation per process instance, in request order, or `None`
/// when any instance cannot be placed.
pub fn reserve(
    fleet: &Fleet,
    request: &ClusterRequest,
    min_state: NodeState,
) -> Option<Vec<Reservation>> {
    let mut reservations = Vec::with_capacity(request.instance_count());
    for (group, process) in request.groups().iter().enumerate() {
        for replica in 0..process.count {
            let Some(reservation) = reserve_process(fleet, &reservations, &process.process, min_state)
            else {
                trace!(group, replica, %min_state, "process instance does not fit");
                return None;
            };
            reservations.push(reservation);
        }
    }
    Some(reservations)
}

fn reserve_process(
    fleet: &Fleet,
    reservations: &[Reservation],
    template: &[ResourceRequirement],
    min_state: NodeState,
) -> Option<Reservation> {
    fleet
        .nodes
        .iter()
        .filter(|node| node.state >= min_state)
        .find_map(|node| reserve_process_on_node(fleet, node, reservations, template))
}

fn reserve_process_on_node(
    fleet: &Fleet,
    node: &Node,
    reservations: &[Reservation],
    template: &[ResourceRequirement],
) -> Option<Reservation> {
    let mut claimed: Vec<usize> = Vec::new();
    for requirement in template {
        let name = fleet.resolve(&requirement.name);
        let mut remaining = requirement.count;
        for (index, slot) in node.resources.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if slot.name == name
                && slot.is_free()
                && !claimed.contains(&index)
                && !reservations.iter().any(|r| r.holds(&node.id, index))
            {
                claimed.push(index);
                remaining -= 1;
            }
        }
        if remaining > 0 {
            return None;
        }
    }
    Some(Reservation {
        node: node.id.clone(),
        resources: claimed,
    })
}
