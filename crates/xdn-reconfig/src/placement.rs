//! Deterministic placement of service names onto node pools.
//!
//! Every name has a preference order over a pool: the pool's sorted nodes,
//! rotated to start at `crc32(name) mod |pool|`. New names take the head of
//! that order; replacements for departing members take the first nodes of
//! the order that are not already members. Any coordinator computing
//! placement over the same pool arrives at the same answer.

use xdn_types::{Epoch, NodeId, NodeSet, ServiceName};

/// Returns the pool in `name`'s preference order.
pub fn preference_order(name: &ServiceName, pool: &NodeSet) -> Vec<NodeId> {
    if pool.is_empty() {
        return Vec::new();
    }
    let start = crc32fast::hash(name.as_str().as_bytes()) as usize % pool.len();
    pool.iter()
        .cycle()
        .skip(start)
        .take(pool.len())
        .cloned()
        .collect()
}

/// Chooses up to `count` nodes for a new name.
///
/// Returns fewer than `count` nodes only when the pool is smaller.
pub fn place(name: &ServiceName, pool: &NodeSet, count: usize) -> NodeSet {
    preference_order(name, pool).into_iter().take(count).collect()
}

/// Chooses up to `count` nodes from `pool` that are not in `current`.
pub fn replacements(
    name: &ServiceName,
    pool: &NodeSet,
    current: &NodeSet,
    count: usize,
) -> NodeSet {
    preference_order(name, pool)
        .into_iter()
        .filter(|node| !current.contains(node))
        .take(count)
        .collect()
}

/// The reconfigurator that stamps a name's acknowledgments at `epoch`.
///
/// Rotates through the sorted reconfigurator set by epoch. Returns `None`
/// only for an empty set.
pub fn stamping_node(reconfigurators: &NodeSet, epoch: Epoch) -> Option<&NodeId> {
    if reconfigurators.is_empty() {
        return None;
    }
    let index = (epoch.as_u64() % reconfigurators.len() as u64) as usize;
    reconfigurators.iter().nth(index)
}
