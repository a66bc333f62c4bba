//! Bounded list of the nearest known successors on the ring.

use crate::common::{Distance, Id, NodeReference};

/// Successors ordered by ring distance from the owning node, closest first.
///
/// The owning node itself is always the final fallback element, so the list
/// never yields empty and never exceeds `bound + 1` entries.
#[derive(Debug, Clone)]
pub struct SuccessorList {
    self_ref: NodeReference,
    self_id: Id,
    bound: usize,
    nodes: Vec<NodeReference>,
}

impl SuccessorList {
    pub fn new(self_ref: NodeReference, bound: usize) -> SuccessorList {
        let self_id = self_ref
            .id()
            .cloned()
            .unwrap_or_else(|| Id::from_uint(0, crate::common::DEFAULT_ID_SIZE));

        SuccessorList {
            self_ref,
            self_id,
            bound,
            nodes: Vec::with_capacity(bound),
        }
    }

    // === Getters ===

    /// The current successor: the closest known node, or self when nothing
    /// is known yet.
    pub fn first(&self) -> &NodeReference {
        self.nodes.first().unwrap_or(&self.self_ref)
    }

    /// All entries, closest first, always ending with self.
    pub fn nodes(&self) -> Vec<NodeReference> {
        let mut out = self.nodes.clone();
        out.push(self.self_ref.clone());
        out
    }

    /// Entries other than self.
    pub fn others(&self) -> &[NodeReference] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, node: &NodeReference) -> bool {
        node == &self.self_ref || self.nodes.contains(node)
    }

    // === Public Methods ===

    /// Insert a candidate, keeping distance order and the length bound.
    /// Returns `true` if the set of entries changed.
    pub fn add(&mut self, node: &NodeReference) -> bool {
        let Some(id) = node.id() else {
            return false;
        };
        if id == &self.self_id {
            return false;
        }

        let key = id.distance(&self.self_id);
        let pos = match self.nodes.binary_search_by(|probe| {
            probe
                .id()
                .map(|pid| pid.distance(&self.self_id))
                .unwrap_or_else(|| Distance::full(self.self_id.size()))
                .cmp(&key)
        }) {
            // Already present at this distance.
            Ok(_) => return false,
            Err(pos) => pos,
        };

        if pos >= self.bound {
            return false;
        }

        self.nodes.insert(pos, node.clone());
        self.nodes.truncate(self.bound);
        true
    }

    /// Drop a confirmed-dead node. Self can never be removed.
    pub fn remove(&mut self, node: &NodeReference) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n != node);
        self.nodes.len() != before
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(id: u128) -> NodeReference {
        NodeReference::new(
            Id::from_uint(id, 2),
            std::net::SocketAddr::from(([127, 0, 0, 1], id as u16 + 1)),
        )
    }

    #[test]
    fn never_empty_never_over_bound() {
        let mut list = SuccessorList::new(node(100), 4);

        // Arbitrary add/remove churn.
        for i in 0..50u128 {
            list.add(&node(i * 7 % 200));
            if i % 3 == 0 {
                list.remove(&node(i * 5 % 200));
            }

            assert!(!list.nodes().is_empty());
            assert!(list.nodes().len() <= 5);
            assert_eq!(list.nodes().last(), Some(&node(100)));
        }

        list.clear();
        assert_eq!(list.nodes(), vec![node(100)]);
        assert_eq!(list.first(), &node(100));
    }

    #[test]
    fn orders_by_distance_from_self() {
        let mut list = SuccessorList::new(node(100), 8);

        for id in [99, 150, 101, 5, 120] {
            list.add(&node(id));
        }

        // Clockwise from 100: 101, 120, 150, then wrapping 5 and 99.
        let ids: Vec<u128> = list
            .others()
            .iter()
            .map(|n| {
                let b = n.id().unwrap().as_bytes();
                ((b[0] as u128) << 8) | b[1] as u128
            })
            .collect();
        assert_eq!(ids, vec![101, 120, 150, 5, 99]);
        assert_eq!(list.first(), &node(101));
    }

    #[test]
    fn rejects_self_and_duplicates() {
        let mut list = SuccessorList::new(node(1), 4);

        assert!(!list.add(&node(1)));
        assert!(list.add(&node(2)));
        assert!(!list.add(&node(2)));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn keeps_closest_when_full() {
        let mut list = SuccessorList::new(node(0), 2);

        list.add(&node(50));
        list.add(&node(60));
        assert!(list.add(&node(10)));
        assert!(!list.add(&node(70)));

        assert_eq!(list.others(), &[node(10), node(50)]);
    }
}
