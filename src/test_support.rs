//! Test support utilities shared across unit and integration tests.
//!
//! Builders produce attachments shaped like the ones the attach/detach
//! executor writes, and [`TestCluster`] wires a seeded [`InMemoryStore`],
//! capacity registry, and reconciler together.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backoff::{Backoff, RetryPolicy};
use crate::capacity::NodeCapacityRegistry;
use crate::gc::GcSettings;
use crate::model::{
    AttachmentState, BackendFailure, Node, ObjectKey, ObjectMeta, Pod, ROLE_CHANGE_LABEL,
    ROLE_LABEL, Role, RoleChange, VOLUME_DETACH_REQUEST_ANNOTATION, Volume, VolumeAttachment,
};
use crate::reconcile::{ReconcilerSettings, ReplicaReconciler};
use crate::store::InMemoryStore;

/// Namespace used by every builder in this module.
pub const TEST_NAMESPACE: &str = "azure-disk-csi";

/// GC delay used by the reconcile scenarios.
pub const TEST_GC_DELAY: Duration = Duration::from_secs(30);

/// Finalizer attached by [`AttachmentBuilder::deleting`].
pub const TEST_FINALIZER: &str = "disk.csi.azure.com/attachment-finalizer";

/// Fluent builder for [`VolumeAttachment`] fixtures.
#[derive(Clone, Debug)]
pub struct AttachmentBuilder {
    attachment: VolumeAttachment,
}

impl AttachmentBuilder {
    /// An attached replica of `volume` on `node`.
    #[must_use]
    pub fn replica(volume: &str, node: &str) -> Self {
        let mut attachment = VolumeAttachment::new_replica(TEST_NAMESPACE, volume, node);
        attachment.status.role = Some(Role::Replica);
        attachment.status.state = AttachmentState::Attached;
        Self { attachment }
    }

    /// An attached primary of `volume` on `node`.
    #[must_use]
    pub fn primary(volume: &str, node: &str) -> Self {
        Self::replica(volume, node)
            .role_label(Role::Primary)
            .requested_role(Role::Primary)
            .observed_role(Some(Role::Primary))
    }

    /// Sets the lifecycle state.
    #[must_use]
    pub const fn state(mut self, state: AttachmentState) -> Self {
        self.attachment.status.state = state;
        self
    }

    /// Sets the Role label.
    #[must_use]
    pub fn role_label(mut self, role: Role) -> Self {
        self.attachment
            .metadata
            .labels
            .insert(ROLE_LABEL.to_owned(), role.as_str().to_owned());
        self
    }

    /// Sets `spec.requested_role`.
    #[must_use]
    pub const fn requested_role(mut self, role: Role) -> Self {
        self.attachment.spec.requested_role = role;
        self
    }

    /// Sets `status.role`.
    #[must_use]
    pub const fn observed_role(mut self, role: Option<Role>) -> Self {
        self.attachment.status.role = role;
        self
    }

    /// Sets `status.previous_role`.
    #[must_use]
    pub const fn previous_role(mut self, role: Option<Role>) -> Self {
        self.attachment.status.previous_role = role;
        self
    }

    /// Sets the role-change label.
    #[must_use]
    pub fn role_change(mut self, change: RoleChange) -> Self {
        self.attachment
            .metadata
            .labels
            .insert(ROLE_CHANGE_LABEL.to_owned(), change.as_str().to_owned());
        self
    }

    /// Marks the attachment as a primary that has been demoted.
    #[must_use]
    pub fn demoted(self) -> Self {
        self.role_label(Role::Replica)
            .requested_role(Role::Replica)
            .role_change(RoleChange::Demoted)
            .previous_role(Some(Role::Primary))
    }

    /// Sets the detach-request annotation.
    #[must_use]
    pub fn detach_requested(mut self, value: &str) -> Self {
        self.attachment
            .metadata
            .annotations
            .insert(VOLUME_DETACH_REQUEST_ANNOTATION.to_owned(), value.to_owned());
        self
    }

    /// Adds a finalizer.
    #[must_use]
    pub fn finalizer(mut self, name: &str) -> Self {
        self.attachment.metadata.finalizers.push(name.to_owned());
        self
    }

    /// Marks the attachment as being deleted; a finalizer keeps it visible.
    #[must_use]
    pub fn deleting(mut self) -> Self {
        self.attachment.metadata.deletion_timestamp = Some(Utc::now());
        if self.attachment.metadata.finalizers.is_empty() {
            self.attachment
                .metadata
                .finalizers
                .push(TEST_FINALIZER.to_owned());
        }
        self
    }

    /// Records a failed attach with the given provider code.
    #[must_use]
    pub fn attach_failed(mut self, code: &str) -> Self {
        self.attachment.status.state = AttachmentState::AttachmentFailed;
        self.attachment.status.error = Some(BackendFailure::new(code, "attach failed"));
        self
    }

    /// Sets the creation timestamp.
    #[must_use]
    pub const fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.attachment.metadata.creation_timestamp = Some(at);
        self
    }

    /// Returns the attachment.
    #[must_use]
    pub fn build(self) -> VolumeAttachment {
        self.attachment
    }
}

/// A provisioned volume wanting `replicas` replica attachments.
#[must_use]
pub fn volume(name: &str, replicas: u32) -> Volume {
    Volume {
        metadata: ObjectMeta::named(TEST_NAMESPACE, name),
        disk_uri: Some(format!(
            "/subscriptions/test/resourceGroups/test/providers/Microsoft.Compute/disks/{name}"
        )),
        max_mount_replica_count: replicas,
    }
}

/// A pod mounting `volume`, without node selector.
#[must_use]
pub fn pod(name: &str, volume: &str) -> Pod {
    Pod {
        metadata: ObjectMeta::named(TEST_NAMESPACE, name),
        node_name: None,
        node_selector: std::collections::BTreeMap::new(),
        volumes: vec![volume.to_owned()],
    }
}

/// Key of an attachment in [`TEST_NAMESPACE`].
#[must_use]
pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(TEST_NAMESPACE, name)
}

/// Settings with the scenario GC delay and millisecond retries.
#[must_use]
pub fn test_settings() -> ReconcilerSettings {
    let retry = RetryPolicy::new(
        3,
        Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
    );
    ReconcilerSettings {
        gc_delay: TEST_GC_DELAY,
        failed_attachment_retry: Duration::from_secs(30),
        conflict_retry: retry,
        gc: GcSettings {
            annotation_value: String::from("replica-controller"),
            conflict_retry: retry,
            run_retry: retry,
        },
    }
}

/// Seeded store, registry, and reconciler for one test.
#[derive(Clone, Debug)]
pub struct TestCluster {
    /// Backing store.
    pub store: Arc<InMemoryStore>,
    /// Shared slot registry.
    pub capacity: Arc<NodeCapacityRegistry>,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            capacity: Arc::new(NodeCapacityRegistry::new()),
        }
    }

    /// Adds ready nodes, each with `slots` attachment slots.
    #[must_use]
    pub fn with_nodes(self, names: &[&str], slots: u32) -> Self {
        for name in names {
            self.store.insert_node(Node::new(*name));
            self.capacity.set_capacity(name, slots);
        }
        self
    }

    /// Adds a volume.
    #[must_use]
    pub fn with_volume(self, volume: Volume) -> Self {
        self.store.insert_volume(volume);
        self
    }

    /// Adds a pod.
    #[must_use]
    pub fn with_pod(self, pod: Pod) -> Self {
        self.store.insert_pod(pod);
        self
    }

    /// Adds an attachment.
    #[must_use]
    pub fn with_attachment(self, attachment: VolumeAttachment) -> Self {
        self.store.insert_attachment(attachment);
        self
    }

    /// Builds a reconciler over this cluster with [`test_settings`].
    #[must_use]
    pub fn reconciler(&self) -> ReplicaReconciler<InMemoryStore> {
        ReplicaReconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.capacity),
            test_settings(),
        )
    }

    /// Replica-labeled attachments currently stored, ordered by key.
    #[must_use]
    pub fn replicas(&self) -> Vec<VolumeAttachment> {
        self.store
            .attachments()
            .into_iter()
            .filter(|attachment| attachment.labeled_role() == Role::Replica)
            .collect()
    }

    /// Fetches one stored attachment by name.
    #[must_use]
    pub fn attachment(&self, name: &str) -> Option<VolumeAttachment> {
        let wanted = key(name);
        self.store
            .attachments()
            .into_iter()
            .find(|attachment| attachment.key() == wanted)
    }
}
