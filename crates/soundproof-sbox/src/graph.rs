//! Local device processing order.
//!
//! A sandbox processes its devices in topological order over the
//! intra-sandbox connection graph: every device runs before the devices it
//! feeds. Cycles are forbidden by construction upstream, but a cycle that
//! sneaks in must still yield a valid order that visits each node exactly
//! once, so the sort falls back to insertion order for whatever remains.

use soundproof_core::ids::DeviceId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Compute the processing order.
///
/// `insertion` lists every device in creation order and doubles as the
/// deterministic tie-break; `edges` are `(source, destination)` pairs.
/// Edges touching unknown devices are ignored.
///
/// Uses Kahn's algorithm with a min-heap over insertion indices, so equal
/// candidates always order the same way. O((V + E) log V).
pub fn processing_order(insertion: &[DeviceId], edges: &[(DeviceId, DeviceId)]) -> Vec<DeviceId> {
    let index_of: HashMap<DeviceId, usize> =
        insertion.iter().enumerate().map(|(i, &dev)| (dev, i)).collect();

    let mut in_degree: HashMap<DeviceId, usize> =
        insertion.iter().map(|&dev| (dev, 0)).collect();
    let mut adjacency: HashMap<DeviceId, Vec<DeviceId>> = HashMap::with_capacity(insertion.len());
    for &(from, to) in edges {
        if !index_of.contains_key(&from) || !index_of.contains_key(&to) {
            continue;
        }
        *in_degree.entry(to).or_insert(0) += 1;
        adjacency.entry(from).or_default().push(to);
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(dev, _)| Reverse(index_of[dev]))
        .collect();

    let mut order = Vec::with_capacity(insertion.len());
    while let Some(Reverse(index)) = ready.pop() {
        let dev = insertion[index];
        order.push(dev);
        if let Some(outgoing) = adjacency.get(&dev) {
            for &to in outgoing {
                let degree = in_degree.get_mut(&to).expect("edge endpoints verified above");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(index_of[&to]));
                }
            }
        }
    }

    if order.len() < insertion.len() {
        // Cycle: append the leftovers in insertion order.
        let placed: HashSet<DeviceId> = order.iter().copied().collect();
        order.extend(insertion.iter().copied().filter(|dev| !placed.contains(dev)));
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devs(n: i64) -> Vec<DeviceId> {
        (0..n).map(DeviceId).collect()
    }

    fn position(order: &[DeviceId], dev: i64) -> usize {
        order.iter().position(|&d| d == DeviceId(dev)).unwrap()
    }

    #[test]
    fn test_empty() {
        assert!(processing_order(&[], &[]).is_empty());
    }

    #[test]
    fn test_linear_chain() {
        let insertion = devs(4);
        let edges = [
            (DeviceId(0), DeviceId(1)),
            (DeviceId(1), DeviceId(2)),
            (DeviceId(2), DeviceId(3)),
        ];
        let order = processing_order(&insertion, &edges);
        assert_eq!(order, devs(4));
    }

    #[test]
    fn test_chain_declared_backwards() {
        // Connections in reverse of insertion order still sort correctly.
        let insertion = devs(3);
        let edges = [(DeviceId(2), DeviceId(1)), (DeviceId(1), DeviceId(0))];
        let order = processing_order(&insertion, &edges);
        assert!(position(&order, 2) < position(&order, 1));
        assert!(position(&order, 1) < position(&order, 0));
    }

    #[test]
    fn test_diamond() {
        let insertion = devs(4);
        let edges = [
            (DeviceId(0), DeviceId(1)),
            (DeviceId(0), DeviceId(2)),
            (DeviceId(1), DeviceId(3)),
            (DeviceId(2), DeviceId(3)),
        ];
        let order = processing_order(&insertion, &edges);
        assert_eq!(order.len(), 4);
        assert!(position(&order, 0) < position(&order, 1));
        assert!(position(&order, 0) < position(&order, 2));
        assert!(position(&order, 1) < position(&order, 3));
        assert!(position(&order, 2) < position(&order, 3));
    }

    #[test]
    fn test_disconnected_devices_keep_insertion_order() {
        let insertion = vec![DeviceId(5), DeviceId(1), DeviceId(9)];
        let order = processing_order(&insertion, &[]);
        assert_eq!(order, insertion);
    }

    #[test]
    fn test_cycle_visits_every_node_once() {
        let insertion = devs(3);
        let edges = [
            (DeviceId(0), DeviceId(1)),
            (DeviceId(1), DeviceId(2)),
            (DeviceId(2), DeviceId(0)),
        ];
        let order = processing_order(&insertion, &edges);
        assert_eq!(order.len(), 3);
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, devs(3));
    }

    #[test]
    fn test_partial_cycle_orders_acyclic_part() {
        // 0 -> 1 <-> 2, plus free-standing 3.
        let insertion = devs(4);
        let edges = [
            (DeviceId(0), DeviceId(1)),
            (DeviceId(1), DeviceId(2)),
            (DeviceId(2), DeviceId(1)),
        ];
        let order = processing_order(&insertion, &edges);
        assert_eq!(order.len(), 4);
        assert!(position(&order, 0) < position(&order, 1));
        assert!(position(&order, 0) < position(&order, 2));
    }

    #[test]
    fn test_edges_to_unknown_devices_are_ignored() {
        let insertion = devs(2);
        let edges = [(DeviceId(0), DeviceId(77)), (DeviceId(66), DeviceId(1))];
        let order = processing_order(&insertion, &edges);
        assert_eq!(order, devs(2));
    }
}
