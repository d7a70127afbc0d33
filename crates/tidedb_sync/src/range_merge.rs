//! Applying server range merges to a cached node.
//!
//! A range merge replaces every path strictly after `start` and at or
//! before `end` (in depth-first path order) with the corresponding content
//! of the update node, leaving paths outside the range untouched. The
//! server sends these on resubscribe when a compound hash shows only some
//! ranges of the cache are stale.

use tidedb_core::Node;
use tidedb_wire::RangeMergeUpdate;

/// Applies one range merge to `old`, returning the merged node.
pub fn apply_range_merge(old: &Node, update: &RangeMergeUpdate) -> Node {
    merge_range(
        old,
        &update.node,
        update
            .start
            .as_ref()
            .map(|p| p.iter().collect())
            .unwrap_or_default(),
        update
            .end
            .as_ref()
            .map(|p| p.iter().collect())
            .unwrap_or_default(),
    )
}

/// Applies a sequence of range merges in order.
pub fn apply_range_merges(old: &Node, updates: &[RangeMergeUpdate]) -> Node {
    updates
        .iter()
        .fold(old.clone(), |node, update| apply_range_merge(&node, update))
}

fn merge_range(old: &Node, new: &Node, start: Vec<&str>, end: Vec<&str>) -> Node {
    if start.is_empty() && end.is_empty() {
        return new.clone();
    }
    let start_key = start.first().copied();
    let end_key = end.first().copied();
    let mut keys: Vec<&str> = old.children_iter().map(|(k, _)| k).collect();
    for (k, _) in new.children_iter() {
        if !keys.contains(&k) {
            keys.push(k);
        }
    }
    // Every key in the union is reassigned below; the base only
    // contributes its own value and priority.
    let mut result = if start.is_empty() {
        new.clone()
    } else {
        old.clone()
    };
    for key in keys {
        let within_start = match start_key {
            Some(s) => key > s,
            None => true,
        };
        let at_start = start_key == Some(key);
        let within_end = match end_key {
            Some(e) => key < e,
            None => true,
        };
        let at_end = end_key == Some(key);
        let child = if at_start || at_end {
            // Boundary child: recurse with the popped boundary paths.
            let child_start = if at_start { start[1..].to_vec() } else { Vec::new() };
            let child_end = if at_end { end[1..].to_vec() } else { Vec::new() };
            // An exhausted start boundary means the whole child is inside.
            if at_start && child_start.is_empty() {
                old.immediate_child(key)
            } else {
                merge_range(
                    &old.immediate_child(key),
                    &new.immediate_child(key),
                    child_start,
                    child_end,
                )
            }
        } else if within_start && within_end {
            new.immediate_child(key)
        } else {
            old.immediate_child(key)
        };
        result = result.update_immediate_child(key, child);
    }
    result
}
