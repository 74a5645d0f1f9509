//! Node arena
//!
//! Nodes live in slots addressed by index; a removed node leaves a tombstone
//! that the next insert reuses. Iteration follows slot order, which gives
//! round-robin a stable cycle while the membership is stable.

use std::collections::HashMap;
use std::sync::Arc;

use super::node::ClusterNode;

#[derive(Debug, Default)]
pub(crate) struct NodeTable {
    slots: Vec<Option<Arc<ClusterNode>>>,
    index: HashMap<String, usize>,
    free: Vec<usize>,
}

impl NodeTable {
    pub(crate) fn get(&self, id: &str) -> Option<Arc<ClusterNode>> {
        self.index
            .get(id)
            .and_then(|&slot| self.slots[slot].clone())
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Insert unless a node with the same id is present.
    pub(crate) fn insert(&mut self, node: Arc<ClusterNode>) -> bool {
        if self.index.contains_key(node.id()) {
            return false;
        }
        let id = node.id().to_string();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        true
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Arc<ClusterNode>> {
        let slot = self.index.remove(id)?;
        self.free.push(slot);
        self.slots[slot].take()
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<ClusterNode>> {
        self.slots.iter().flatten()
    }

    pub(crate) fn healthy(&self) -> Vec<Arc<ClusterNode>> {
        self.iter().filter(|n| n.is_healthy()).cloned().collect()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.iter().map(|n| n.id().to_string()).collect()
    }

    pub(crate) fn nodes(&self) -> Vec<Arc<ClusterNode>> {
        self.iter().cloned().collect()
    }
}
