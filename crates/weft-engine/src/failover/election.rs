//! Primary election and target selection
//!
//! Election is deterministic: every node evaluates the same predicate over
//! the alive roster, so at most one node believes it should promote. The
//! compare-and-set on the primary key settles races.

use std::cmp::Ordering;

use weft_core::model::NodeInfo;

/// The node that should be primary: highest `(priority, -load, node_id)`
pub fn elect(alive: &[NodeInfo]) -> Option<&NodeInfo> {
    alive.iter().max_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.load.partial_cmp(&a.load).unwrap_or(Ordering::Equal))
            .then_with(|| a.node_id.cmp(&b.node_id))
    })
}

/// Reassignment target: least-loaded alive node whose capabilities cover
/// every required task type. Ties break on node id for determinism.
pub fn select_target<'a>(alive: &'a [NodeInfo], required: &[String]) -> Option<&'a NodeInfo> {
    alive
        .iter()
        .filter(|n| n.covers(required))
        .min_by(|a, b| {
            a.load
                .partial_cmp(&b.load)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        })
}
