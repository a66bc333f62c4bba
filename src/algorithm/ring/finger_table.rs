//! Finger table: slot `i` points toward the owner of `self + 2^i`.

use crate::common::{Id, NodeReference};

/// Per-node finger table with one slot per identifier bit.
///
/// Every slot always resolves to some node (initialized to self) even
/// before any routing information is learned.
#[derive(Debug, Clone)]
pub struct FingerTable {
    self_ref: NodeReference,
    self_id: Id,
    slots: Vec<NodeReference>,
}

impl FingerTable {
    pub fn new(self_ref: NodeReference, self_id: Id) -> FingerTable {
        let slots = vec![self_ref.clone(); self_id.bits()];

        FingerTable {
            self_ref,
            self_id,
            slots,
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The identifier slot `exp` routes toward: `self + 2^exp`.
    pub fn target(&self, exp: usize) -> Id {
        self.self_id.add_pow2(exp)
    }

    pub fn slot(&self, exp: usize) -> &NodeReference {
        &self.slots[exp]
    }

    /// Slots holding a node other than self, highest first, deduplicated
    /// against their successor slot. This is the scan order `closest_to`
    /// merges from.
    pub fn populated(&self) -> impl Iterator<Item = (usize, &NodeReference)> {
        self.slots
            .iter()
            .enumerate()
            .rev()
            .filter(move |(_, node)| *node != &self.self_ref)
    }

    // === Public Methods ===

    /// Force a slot, as aggressive join does after resolving its target.
    pub fn set(&mut self, exp: usize, node: NodeReference) {
        self.slots[exp] = node;
    }

    /// Offer a live candidate to every slot it improves. Returns `true` if
    /// any slot changed.
    pub fn update(&mut self, node: &NodeReference) -> bool {
        let mut changed = false;
        for exp in 0..self.slots.len() {
            changed |= self.update_slot(exp, node);
        }
        changed
    }

    /// Offer a candidate to one named slot: `node` takes it when it is a
    /// closer successor of the slot's target than the current entry.
    /// Returns `true` if the slot changed.
    pub fn update_slot(&mut self, exp: usize, node: &NodeReference) -> bool {
        let Some(id) = node.id() else {
            return false;
        };
        if id == &self.self_id || exp >= self.slots.len() {
            return false;
        }

        let target = self.target(exp);
        let candidate = id.distance(&target);

        // Self competes at its true distance like any other candidate, so
        // a node on the wrong side of the target never wins a slot.
        let current = match self.slots[exp].id() {
            Some(cur) => cur.distance(&target),
            None => crate::common::Distance::full(self.self_id.size()),
        };

        if candidate < current {
            self.slots[exp] = node.clone();
            return true;
        }
        false
    }

    /// Reset every slot held by a confirmed-dead node back to self.
    pub fn forget(&mut self, node: &NodeReference) -> bool {
        let mut changed = false;
        for slot in self.slots.iter_mut() {
            if slot == node {
                *slot = self.self_ref.clone();
                changed = true;
            }
        }
        changed
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = self.self_ref.clone();
        }
    }
}
