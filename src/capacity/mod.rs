//! Per-node attachment slot accounting.
//!
//! The registry is shared between reconcilers through an `Arc` and guarded by
//! a single mutex that is never held across an await point.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Slot accounting for one node. `remaining <= limit` always holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeSlots {
    /// Maximum number of attachments the node accepts.
    pub limit: u32,
    /// Slots not yet reserved.
    pub remaining: u32,
}

impl NodeSlots {
    /// Returns a fully free node with the given limit.
    #[must_use]
    pub const fn free(limit: u32) -> Self {
        Self {
            limit,
            remaining: limit,
        }
    }
}

/// Errors raised by [`NodeCapacityRegistry`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CapacityError {
    /// Raised when the node has never been registered.
    #[error("node {node} has no registered capacity")]
    UnknownNode {
        /// Node name.
        node: String,
    },
    /// Raised when the node has no free slot.
    #[error("node {node} has no free attachment slot")]
    Exhausted {
        /// Node name.
        node: String,
    },
}

/// Process-wide table of remaining attachment slots per node.
#[derive(Debug, Default)]
pub struct NodeCapacityRegistry {
    nodes: Mutex<BTreeMap<String, NodeSlots>>,
}

impl NodeCapacityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or resizes a node.
    ///
    /// Slots already reserved stay reserved: `remaining` shrinks or grows by
    /// the change in `limit`, clamped to `0..=limit`.
    pub fn set_capacity(&self, node: &str, limit: u32) {
        self.nodes
            .lock()
            .entry(node.to_owned())
            .and_modify(|slots| {
                let reserved = slots.limit.saturating_sub(slots.remaining);
                slots.limit = limit;
                slots.remaining = limit.saturating_sub(reserved);
            })
            .or_insert_with(|| NodeSlots::free(limit));
    }

    /// Restores a node's exact accounting, clamping `remaining` to `limit`.
    pub fn set_slots(&self, node: &str, slots: NodeSlots) {
        let clamped = NodeSlots {
            limit: slots.limit,
            remaining: slots.remaining.min(slots.limit),
        };
        self.nodes.lock().insert(node.to_owned(), clamped);
    }

    /// Takes one slot on `node`.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError::UnknownNode`] for unregistered nodes and
    /// [`CapacityError::Exhausted`] when no slot is free.
    pub fn reserve(&self, node: &str) -> Result<(), CapacityError> {
        let mut nodes = self.nodes.lock();
        let slots = nodes.get_mut(node).ok_or_else(|| CapacityError::UnknownNode {
            node: node.to_owned(),
        })?;
        if slots.remaining == 0 {
            return Err(CapacityError::Exhausted {
                node: node.to_owned(),
            });
        }
        slots.remaining -= 1;
        Ok(())
    }

    /// Returns one slot to `node`; never exceeds the node's limit.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError::UnknownNode`] for unregistered nodes.
    pub fn release(&self, node: &str) -> Result<(), CapacityError> {
        let mut nodes = self.nodes.lock();
        let slots = nodes.get_mut(node).ok_or_else(|| CapacityError::UnknownNode {
            node: node.to_owned(),
        })?;
        slots.remaining = slots.remaining.saturating_add(1).min(slots.limit);
        Ok(())
    }

    /// Returns the free slots on `node`, or `None` when unregistered.
    #[must_use]
    pub fn remaining(&self, node: &str) -> Option<u32> {
        self.nodes.lock().get(node).map(|slots| slots.remaining)
    }

    /// Reserves a slot on the first candidate that has one.
    ///
    /// Selection and decrement happen under one lock acquisition, so two
    /// callers can never both take the last slot of a node.
    #[must_use]
    pub fn reserve_first<'a, I>(&self, candidates: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut nodes = self.nodes.lock();
        for candidate in candidates {
            if let Some(slots) = nodes.get_mut(candidate)
                && slots.remaining > 0
            {
                slots.remaining -= 1;
                return Some(candidate.to_owned());
            }
        }
        None
    }

    /// Returns a copy of the whole table, ordered by node name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, NodeSlots> {
        self.nodes.lock().clone()
    }
}
