//! Replica placement: picking a node for a new replica attachment.
//!
//! A candidate node must be ready and schedulable, satisfy the node
//! selector of every pod that mounts the volume, and not already host an
//! attachment for the volume. Candidates are ranked by free slots (most
//! first) and then by name, and the winning slot is reserved in the
//! [`NodeCapacityRegistry`] before the attachment is created. The created
//! attachment carries [`CAPACITY_FINALIZER`] so the slot can be returned
//! when it is deleted.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capacity::NodeCapacityRegistry;
use crate::classify::{Classify, Retriability};
use crate::model::{CAPACITY_FINALIZER, ObjectKey, VolumeAttachment};
use crate::store::{AttachmentStore, StoreError};

/// Errors raised while placing a replica.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PlacementError {
    /// Raised when no node satisfies the placement constraints.
    #[error("no eligible node with free capacity for volume {volume}")]
    NoEligibleNode {
        /// Volume key.
        volume: String,
    },
    /// Raised when the store call fails.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for PlacementError {
    fn retriability(&self) -> Retriability {
        match self {
            Self::NoEligibleNode { .. } => Retriability::Retriable,
            Self::Store(err) => err.retriability(),
        }
    }
}

/// Result of [`ReplicaPlacer::place_replica`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PlacementOutcome {
    /// A new replica attachment was created.
    Created(VolumeAttachment),
    /// An attachment with the chosen name already existed; nothing was
    /// created and the reservation was returned.
    AlreadyPresent(ObjectKey),
}

/// Chooses nodes for replicas and creates the attachments.
#[derive(Debug)]
pub struct ReplicaPlacer<S: ?Sized> {
    store: Arc<S>,
    capacity: Arc<NodeCapacityRegistry>,
}

impl<S: ?Sized> Clone for ReplicaPlacer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            capacity: Arc::clone(&self.capacity),
        }
    }
}

impl<S: AttachmentStore + ?Sized> ReplicaPlacer<S> {
    /// Creates a placer over the given store and registry.
    #[must_use]
    pub const fn new(store: Arc<S>, capacity: Arc<NodeCapacityRegistry>) -> Self {
        Self { store, capacity }
    }

    /// Returns the nodes a replica of `volume` could land on, best first.
    ///
    /// Nodes in `exclude` and nodes without registered capacity are left
    /// out. The ranking reads a capacity snapshot; reservation happens
    /// separately in [`Self::select_node`].
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::Store`] when nodes or pods cannot be listed.
    pub async fn eligible_nodes(
        &self,
        volume: &ObjectKey,
        exclude: &BTreeSet<String>,
    ) -> Result<Vec<String>, PlacementError> {
        let nodes = self.store.list_nodes().await?;
        let pods = self.store.list_pods(&volume.namespace).await?;
        let workloads: Vec<_> = pods
            .iter()
            .filter(|pod| pod.mounts(&volume.name))
            .collect();
        let slots = self.capacity.snapshot();

        let mut ranked: Vec<(u32, String)> = nodes
            .into_iter()
            .filter(|node| node.is_schedulable())
            .filter(|node| !exclude.contains(&node.name))
            .filter(|node| workloads.iter().all(|pod| pod.fits(node)))
            .filter_map(|node| {
                slots
                    .get(&node.name)
                    .map(|free| (free.remaining, node.name))
            })
            .collect();
        ranked.sort_by(|left, right| {
            (Reverse(left.0), &left.1).cmp(&(Reverse(right.0), &right.1))
        });
        Ok(ranked.into_iter().map(|(_, name)| name).collect())
    }

    /// Picks a node for a new replica and reserves one of its slots.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::NoEligibleNode`] when no candidate has a
    /// free slot, or [`PlacementError::Store`] when listing fails.
    pub async fn select_node(
        &self,
        volume: &ObjectKey,
        exclude: &BTreeSet<String>,
    ) -> Result<String, PlacementError> {
        let candidates = self.eligible_nodes(volume, exclude).await?;
        debug!(%volume, ?candidates, "ranked replica candidates");
        self.capacity
            .reserve_first(candidates.iter().map(String::as_str))
            .ok_or_else(|| PlacementError::NoEligibleNode {
                volume: volume.to_string(),
            })
    }

    /// Selects a node and creates a Replica attachment on it.
    ///
    /// The reservation is returned to the registry when creation fails or
    /// the attachment already exists.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError`] when no node is eligible or the store
    /// rejects the create for any reason other than a name collision.
    pub async fn place_replica(
        &self,
        volume: &ObjectKey,
        exclude: &BTreeSet<String>,
    ) -> Result<PlacementOutcome, PlacementError> {
        let node = self.select_node(volume, exclude).await?;
        let mut replica = VolumeAttachment::new_replica(&volume.namespace, &volume.name, &node);
        replica
            .metadata
            .finalizers
            .push(CAPACITY_FINALIZER.to_owned());
        let key = replica.key();
        match self.store.create_attachment(replica).await {
            Ok(created) => {
                info!(%volume, node = %node, attachment = %key, "created replica attachment");
                Ok(PlacementOutcome::Created(created))
            }
            Err(StoreError::AlreadyExists { .. }) => {
                self.return_slot(&node);
                debug!(%volume, attachment = %key, "replica attachment already exists");
                Ok(PlacementOutcome::AlreadyPresent(key))
            }
            Err(err) => {
                self.return_slot(&node);
                Err(err.into())
            }
        }
    }

    fn return_slot(&self, node: &str) {
        if let Err(err) = self.capacity.release(node) {
            warn!(node, error = %err, "could not return reserved slot");
        }
    }
}
