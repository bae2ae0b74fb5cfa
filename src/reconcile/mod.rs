//! Replica-attachment reconciliation.
//!
//! [`ReplicaReconciler::reconcile`] is invoked with an attachment key every
//! time the attachment (or one of its siblings) changes. It re-reads the
//! object under the volume's lock, classifies it with [`decide`], and
//! applies the resulting [`Decision`]. Every write is skipped when the
//! stored object already has the desired content, so reconciling an
//! unchanged key is free of side effects.
//!
//! Replicas created here carry [`CAPACITY_FINALIZER`]. Once such a replica
//! is being deleted, whoever deleted it, the reconciler removes the
//! finalizer and returns the node's slot; only the write that removed the
//! finalizer releases, so a slot goes back exactly once.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::backoff::RetryPolicy;
use crate::capacity::NodeCapacityRegistry;
use crate::classify::{Classify, Retriability};
use crate::gc::{GcError, GcScheduler, GcSettings};
use crate::model::{
    AttachmentState, CAPACITY_FINALIZER, ObjectKey, ROLE_CHANGE_LABEL, Role, RoleChange, Volume,
    VolumeAttachment,
};
use crate::placement::{PlacementError, PlacementOutcome, ReplicaPlacer};
use crate::store::{
    AttachmentSelector, AttachmentStore, StoreError, UpdateOutcome, update_attachment_with_retry,
};

mod decision;
mod locks;

pub use decision::{Decision, decide};
use locks::VolumeLocks;

/// Errors returned by [`ReplicaReconciler::reconcile`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReconcileError {
    /// Raised when a store call fails.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised when the cluster state contradicts itself.
    #[error("volume {volume} is inconsistent: {reason}")]
    Inconsistent {
        /// Volume key.
        volume: String,
        /// What is wrong.
        reason: String,
    },
    /// Raised when a replacement replica cannot be placed.
    #[error(transparent)]
    Placement(#[from] PlacementError),
    /// Raised when cleanup cannot be scheduled.
    #[error(transparent)]
    Gc(#[from] GcError),
}

impl Classify for ReconcileError {
    fn retriability(&self) -> Retriability {
        match self {
            Self::Store(err) => err.retriability(),
            Self::Placement(err) => err.retriability(),
            Self::Inconsistent { .. } | Self::Gc(GcError::NoRuntime) => Retriability::NonRetriable,
            Self::Gc(GcError::Store(err)) => err.retriability(),
        }
    }
}

impl ReconcileError {
    /// Returns `true` when retrying this attempt cannot help.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.retriability().is_retriable()
    }
}

/// What the caller should do after a successful reconcile.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Settled: wait for the next change event.
    #[must_use]
    pub const fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Reconcile the key again after `delay`.
    #[must_use]
    pub const fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    /// Delay before the key should be reconciled again, if any.
    #[must_use]
    pub const fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }

    /// Returns `true` when no requeue was asked for.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.requeue_after.is_none()
    }
}

/// Tunables for [`ReplicaReconciler`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconcilerSettings {
    /// Delay before deferred replica cleanup fires.
    pub gc_delay: Duration,
    /// Requeue delay for attachments that failed transiently.
    pub failed_attachment_retry: Duration,
    /// Retry policy for optimistic-concurrency conflicts.
    pub conflict_retry: RetryPolicy,
    /// Settings handed to the GC scheduler.
    pub gc: GcSettings,
}

/// Drives replica attachments toward their desired state.
#[derive(Debug)]
pub struct ReplicaReconciler<S: ?Sized> {
    store: Arc<S>,
    capacity: Arc<NodeCapacityRegistry>,
    placer: ReplicaPlacer<S>,
    gc: GcScheduler<S>,
    locks: VolumeLocks,
    settings: ReconcilerSettings,
}

impl<S: AttachmentStore + ?Sized + 'static> ReplicaReconciler<S> {
    /// Wires a reconciler to a store and a shared capacity registry.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        capacity: Arc<NodeCapacityRegistry>,
        settings: ReconcilerSettings,
    ) -> Self {
        let placer = ReplicaPlacer::new(Arc::clone(&store), Arc::clone(&capacity));
        let gc = GcScheduler::new(Arc::clone(&store), settings.gc.clone());
        Self {
            store,
            capacity,
            placer,
            gc,
            locks: VolumeLocks::default(),
            settings,
        }
    }

    /// The scheduler that runs deferred cleanup.
    #[must_use]
    pub const fn gc(&self) -> &GcScheduler<S> {
        &self.gc
    }

    /// Reconciles the attachment identified by `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when a store call fails, the volume is
    /// missing or unprovisioned, no node can take a replacement replica, or
    /// cleanup cannot be scheduled. Use [`ReconcileError::is_terminal`] to
    /// decide whether to retry.
    #[instrument(skip_all, fields(attachment = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(observed) = self.store.get_attachment(key).await? else {
            debug!("attachment gone");
            return Ok(Action::await_change());
        };
        let volume_key = observed.volume_key();
        let _guard = self.locks.acquire(&volume_key).await;

        let Some(attachment) = self.store.get_attachment(key).await? else {
            debug!("attachment gone");
            return Ok(Action::await_change());
        };
        let decision = decide(&attachment);
        debug!(?decision, state = ?attachment.status.state, "classified attachment");

        let action = self.apply(decision, &attachment).await?;
        if attachment.deletion_requested() && attachment.holds_capacity_slot() {
            self.release_slot(&attachment).await?;
        }
        Ok(action)
    }

    async fn apply(
        &self,
        decision: Decision,
        attachment: &VolumeAttachment,
    ) -> Result<Action, ReconcileError> {
        let key = attachment.key();
        let volume_key = attachment.volume_key();
        match decision {
            Decision::Settled => Ok(Action::await_change()),
            Decision::ForceDetach => {
                self.force_detach(&key, AttachmentState::DetachmentFailed)
                    .await
            }
            Decision::EscalatePrimary => {
                self.force_detach(&key, AttachmentState::AttachmentFailed)
                    .await
            }
            Decision::ScheduleGc => self.schedule_gc(&volume_key),
            Decision::RetryLater => {
                debug!(delay = ?self.settings.failed_attachment_retry, "transient failure; requeueing");
                Ok(Action::requeue(self.settings.failed_attachment_retry))
            }
            Decision::CompletePromotion => self.complete_promotion(attachment).await,
            Decision::EnsureReplicas => {
                let volume = self.load_volume(&volume_key).await?;
                self.ensure_replicas(&volume, None).await?;
                Ok(Action::await_change())
            }
            Decision::DeleteAndReplace => self.delete_and_replace(attachment).await,
        }
    }

    async fn force_detach(
        &self,
        key: &ObjectKey,
        from: AttachmentState,
    ) -> Result<Action, ReconcileError> {
        let outcome = update_attachment_with_retry(
            &*self.store,
            key,
            &self.settings.conflict_retry,
            |current| {
                if current.status.state != from {
                    return false;
                }
                current.status.state = AttachmentState::ForceDetachPending;
                true
            },
        )
        .await?;
        if matches!(outcome, UpdateOutcome::Updated(_)) {
            info!(?from, "escalated to forced detach");
        }
        Ok(Action::await_change())
    }

    fn schedule_gc(&self, volume: &ObjectKey) -> Result<Action, ReconcileError> {
        let outcome = self.gc.schedule(volume, self.settings.gc_delay)?;
        if outcome.is_new() {
            info!(%volume, delay = ?self.settings.gc_delay, "deferred replica cleanup");
        }
        Ok(Action::await_change())
    }

    async fn complete_promotion(
        &self,
        attachment: &VolumeAttachment,
    ) -> Result<Action, ReconcileError> {
        let volume_key = attachment.volume_key();
        let volume = self.load_volume(&volume_key).await?;
        let outcome = update_attachment_with_retry(
            &*self.store,
            &attachment.key(),
            &self.settings.conflict_retry,
            |current| {
                let promoted = current.status.role == Some(Role::Primary)
                    && current.status.previous_role == Some(Role::Replica)
                    && current.role_change() == Some(RoleChange::Promoted);
                if promoted
                    || current.labeled_role() != Role::Primary
                    || current.spec.requested_role != Role::Primary
                {
                    return false;
                }
                current.status.previous_role = Some(Role::Replica);
                current.status.role = Some(Role::Primary);
                current.metadata.labels.insert(
                    ROLE_CHANGE_LABEL.to_owned(),
                    RoleChange::Promoted.as_str().to_owned(),
                );
                true
            },
        )
        .await?;
        if matches!(outcome, UpdateOutcome::Updated(_)) {
            info!("recorded replica promotion");
        }
        self.ensure_replicas(&volume, None).await?;
        Ok(Action::await_change())
    }

    async fn delete_and_replace(
        &self,
        attachment: &VolumeAttachment,
    ) -> Result<Action, ReconcileError> {
        let volume = self.load_volume(&attachment.volume_key()).await?;
        let key = attachment.key();
        let node = attachment.spec.node_name.as_str();
        match self.store.delete_attachment(&key).await {
            Ok(outcome) if outcome.initiated() => info!(node, ?outcome, "deleted failed replica"),
            Ok(outcome) => debug!(node, ?outcome, "failed replica already being deleted"),
            Err(StoreError::NotFound { .. }) => debug!("failed replica already removed"),
            Err(err) => return Err(err.into()),
        }
        if attachment.holds_capacity_slot() {
            self.release_slot(attachment).await?;
        }
        self.ensure_replicas(&volume, Some(node)).await?;
        Ok(Action::await_change())
    }

    /// Drops [`CAPACITY_FINALIZER`] from a deleted replica and returns its
    /// slot. Nothing is released unless this call removed the finalizer.
    async fn release_slot(&self, attachment: &VolumeAttachment) -> Result<(), ReconcileError> {
        let node = attachment.spec.node_name.as_str();
        let outcome = update_attachment_with_retry(
            &*self.store,
            &attachment.key(),
            &self.settings.conflict_retry,
            |current| {
                if !current.holds_capacity_slot() {
                    return false;
                }
                current
                    .metadata
                    .finalizers
                    .retain(|finalizer| finalizer != CAPACITY_FINALIZER);
                true
            },
        )
        .await?;
        if matches!(outcome, UpdateOutcome::Updated(_)) {
            match self.capacity.release(node) {
                Ok(()) => info!(node, "released capacity of deleted replica"),
                Err(err) => {
                    warn!(node, error = %err, "could not release capacity of deleted replica");
                }
            }
        }
        Ok(())
    }

    async fn load_volume(&self, key: &ObjectKey) -> Result<Volume, ReconcileError> {
        let volume = self
            .store
            .get_volume(key)
            .await?
            .ok_or_else(|| inconsistent(key, "volume not found"))?;
        if volume.disk_uri.as_deref().is_none_or(str::is_empty) {
            return Err(inconsistent(key, "volume has no backend disk reference"));
        }
        Ok(volume)
    }

    /// Creates one replica when the volume has fewer active replicas than it
    /// wants. Must be called with the volume's lock held.
    async fn ensure_replicas(
        &self,
        volume: &Volume,
        failed_node: Option<&str>,
    ) -> Result<Option<PlacementOutcome>, ReconcileError> {
        let volume_key = volume.key();
        let siblings = self
            .store
            .list_attachments(
                &volume_key.namespace,
                &AttachmentSelector::for_volume(volume_key.name.clone()),
            )
            .await?;
        let active = siblings
            .iter()
            .filter(|sibling| sibling.is_active_replica())
            .count();
        let desired = usize::try_from(volume.max_mount_replica_count).unwrap_or(usize::MAX);
        if active >= desired {
            debug!(active, desired, "volume has enough replicas");
            return Ok(None);
        }

        let mut exclude: BTreeSet<String> = siblings
            .into_iter()
            .map(|sibling| sibling.spec.node_name)
            .collect();
        exclude.extend(failed_node.map(str::to_owned));
        let outcome = self.placer.place_replica(&volume_key, &exclude).await?;
        Ok(Some(outcome))
    }
}

fn inconsistent(volume: &ObjectKey, reason: &str) -> ReconcileError {
    ReconcileError::Inconsistent {
        volume: volume.to_string(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests;
