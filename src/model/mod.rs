//! Cluster object model for volume attachments.
//!
//! The types mirror the subset of the cluster API objects the replica
//! controller reads and writes: volumes, attachments, nodes, and pods. Label
//! and annotation keys defined here are an external contract shared with the
//! attach/detach executor and must not change.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::classify::{Classify, Retriability};

/// Label carrying the role an attachment is meant to serve.
pub const ROLE_LABEL: &str = "disk.csi.azure.com/requested-role";

/// Label marking an in-flight role transition.
pub const ROLE_CHANGE_LABEL: &str = "disk.csi.azure.com/role-change";

/// Annotation requesting teardown of an attachment regardless of its role.
pub const VOLUME_DETACH_REQUEST_ANNOTATION: &str = "disk.csi.azure.com/volume-detach-request";

/// Finalizer placed on replicas whose node slot this controller reserved.
/// Removing it is what releases the slot, so it can only happen once.
pub const CAPACITY_FINALIZER: &str = "disk.csi.azure.com/replica-capacity";

/// Namespace used when a snapshot or CLI key omits one.
pub const DEFAULT_NAMESPACE: &str = "azure-disk-csi";

/// Errors raised while parsing model values from strings.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ModelError {
    /// Raised when a role label holds an unrecognised value.
    #[error("unknown attachment role: {0}")]
    UnknownRole(String),
    /// Raised when a role-change label holds an unrecognised value.
    #[error("unknown role change: {0}")]
    UnknownRoleChange(String),
    /// Raised when an object key is not of the form `namespace/name`.
    #[error("invalid object key '{0}': expected <namespace>/<name> or <name>")]
    InvalidKey(String),
}

/// Function an attachment serves for its volume.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Role {
    /// Authoritative mount point for the volume.
    Primary,
    /// Standby attachment that can be promoted.
    Replica,
}

impl Role {
    /// Returns the label value for this role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "Primary",
            Self::Replica => "Replica",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Primary" => Ok(Self::Primary),
            "Replica" => Ok(Self::Replica),
            other => Err(ModelError::UnknownRole(other.to_owned())),
        }
    }
}

/// Role transition recorded in the role-change label.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoleChange {
    /// A primary is being turned into a replica.
    Demoted,
    /// A replica has been turned into the primary.
    Promoted,
}

impl RoleChange {
    /// Returns the label value for this transition.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Demoted => "demoted",
            Self::Promoted => "promoted",
        }
    }
}

impl FromStr for RoleChange {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "demoted" => Ok(Self::Demoted),
            "promoted" => Ok(Self::Promoted),
            other => Err(ModelError::UnknownRoleChange(other.to_owned())),
        }
    }
}

/// Lifecycle state of an attachment.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum AttachmentState {
    /// Created but not yet picked up by the executor.
    #[default]
    Pending,
    /// Attach call in flight.
    Attaching,
    /// Volume is attached to the node.
    Attached,
    /// Detach call in flight.
    Detaching,
    /// Volume has been detached.
    Detached,
    /// The backend rejected or failed the attach call.
    AttachmentFailed,
    /// The backend rejected or failed the detach call.
    DetachmentFailed,
    /// Escalated: the executor must force the detach.
    ForceDetachPending,
}

impl AttachmentState {
    /// Returns `true` for states in which the volume is being, or has been,
    /// torn down.
    #[must_use]
    pub const fn is_teardown(self) -> bool {
        matches!(
            self,
            Self::Detaching | Self::Detached | Self::DetachmentFailed | Self::ForceDetachPending
        )
    }
}

/// Namespaced identity of a cluster object.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace holding the object.
    pub namespace: String,
    /// Object name, unique within the namespace.
    pub name: String,
}

impl ObjectKey {
    /// Builds a key from its parts.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let invalid = || ModelError::InvalidKey(value.to_owned());
        match trimmed.split_once('/') {
            Some((namespace, name)) => {
                if namespace.is_empty() || name.is_empty() || name.contains('/') {
                    return Err(invalid());
                }
                Ok(Self::new(namespace, name))
            }
            None if trimmed.is_empty() => Err(invalid()),
            None => Ok(Self::new(DEFAULT_NAMESPACE, trimmed)),
        }
    }
}

/// Object metadata shared by every stored kind.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name.
    pub name: String,
    /// Object namespace.
    #[serde(default)]
    pub namespace: String,
    /// Identifier assigned by the store on creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,
    /// Selector-visible labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Out-of-band signals.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Finalizers that keep a deleted object visible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Time the store accepted the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set when deletion has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token; bumped on every write.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    /// Builds metadata for a new object.
    #[must_use]
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Returns the object's key.
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Logical disk managed by the provisioner.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Backend disk reference; `None` until provisioned.
    #[serde(default)]
    pub disk_uri: Option<String>,
    /// Number of replica attachments the volume should carry.
    #[serde(default)]
    pub max_mount_replica_count: u32,
}

impl Volume {
    /// Returns the volume's key.
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}

/// Cluster node that can host attachments.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Node name.
    pub name: String,
    /// Whether the node reports ready.
    #[serde(default = "default_true")]
    pub ready: bool,
    /// Whether the node is cordoned.
    #[serde(default)]
    pub unschedulable: bool,
    /// Node labels, matched against pod node selectors.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Node {
    /// Builds a ready, schedulable node without labels.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ready: true,
            unschedulable: false,
            labels: BTreeMap::new(),
        }
    }

    /// Returns `true` when new attachments may be placed on the node.
    #[must_use]
    pub const fn is_schedulable(&self) -> bool {
        self.ready && !self.unschedulable
    }
}

const fn default_true() -> bool {
    true
}

/// Workload pod, read to constrain replica placement.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Node the pod is bound to, if scheduled.
    #[serde(default)]
    pub node_name: Option<String>,
    /// Labels a node must carry to run the pod.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Names of the volumes the pod mounts.
    #[serde(default)]
    pub volumes: Vec<String>,
}

impl Pod {
    /// Returns `true` when the pod mounts the named volume.
    #[must_use]
    pub fn mounts(&self, volume_name: &str) -> bool {
        self.volumes.iter().any(|name| name == volume_name)
    }

    /// Returns `true` when the node satisfies the pod's node selector.
    #[must_use]
    pub fn fits(&self, node: &Node) -> bool {
        self.node_selector
            .iter()
            .all(|(key, value)| node.labels.get(key) == Some(value))
    }
}

/// Failure recorded by the attach/detach executor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BackendFailure {
    /// Provider error code (for example `ResourceNotFound`).
    pub code: String,
    /// Human-readable provider message.
    #[serde(default)]
    pub message: String,
}

impl BackendFailure {
    /// Builds a failure record.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Desired attachment parameters.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentSpec {
    /// Volume being attached.
    pub volume_name: String,
    /// Node the volume is attached to.
    pub node_name: String,
    /// Role requested by the promotion/demotion decision.
    pub requested_role: Role,
}

/// Observed attachment state.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentStatus {
    /// Role the attachment currently serves.
    #[serde(default)]
    pub role: Option<Role>,
    /// Role held before the last transition.
    #[serde(default)]
    pub previous_role: Option<Role>,
    /// Lifecycle state.
    #[serde(default)]
    pub state: AttachmentState,
    /// Last backend failure, present in failure states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BackendFailure>,
}

/// Association of a volume with a node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Desired parameters.
    pub spec: AttachmentSpec,
    /// Observed state.
    #[serde(default)]
    pub status: AttachmentStatus,
}

/// Returns the deterministic attachment name for a volume/node pair.
#[must_use]
pub fn attachment_name(volume_name: &str, node_name: &str) -> String {
    format!("{volume_name}-{node_name}-attachment")
}

impl VolumeAttachment {
    /// Builds a fresh replica attachment ready for creation.
    #[must_use]
    pub fn new_replica(namespace: &str, volume_name: &str, node_name: &str) -> Self {
        let mut metadata = ObjectMeta::named(namespace, attachment_name(volume_name, node_name));
        metadata
            .labels
            .insert(ROLE_LABEL.to_owned(), Role::Replica.as_str().to_owned());
        Self {
            metadata,
            spec: AttachmentSpec {
                volume_name: volume_name.to_owned(),
                node_name: node_name.to_owned(),
                requested_role: Role::Replica,
            },
            status: AttachmentStatus::default(),
        }
    }

    /// Returns the attachment's key.
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Returns the key of the owning volume.
    #[must_use]
    pub fn volume_key(&self) -> ObjectKey {
        ObjectKey::new(self.metadata.namespace.clone(), self.spec.volume_name.clone())
    }

    /// Role advertised by the role label, falling back to the requested role
    /// when the label is absent or unreadable.
    #[must_use]
    pub fn labeled_role(&self) -> Role {
        self.metadata
            .labels
            .get(ROLE_LABEL)
            .and_then(|value| value.parse().ok())
            .unwrap_or(self.spec.requested_role)
    }

    /// Role transition recorded in the role-change label.
    #[must_use]
    pub fn role_change(&self) -> Option<RoleChange> {
        self.metadata
            .labels
            .get(ROLE_CHANGE_LABEL)
            .and_then(|value| value.parse().ok())
    }

    /// Returns `true` when the detach-request annotation is present.
    #[must_use]
    pub fn detach_requested(&self) -> bool {
        self.metadata
            .annotations
            .contains_key(VOLUME_DETACH_REQUEST_ANNOTATION)
    }

    /// Returns `true` once deletion has been requested.
    #[must_use]
    pub const fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns `true` for a primary that is neither leaving nor asked to.
    #[must_use]
    pub fn is_authoritative_primary(&self) -> bool {
        self.labeled_role() == Role::Primary
            && !self.deletion_requested()
            && !self.detach_requested()
    }

    /// Returns `true` for a replica that counts toward the desired count.
    #[must_use]
    pub fn is_active_replica(&self) -> bool {
        self.labeled_role() == Role::Replica
            && !self.deletion_requested()
            && !self.detach_requested()
            && self.role_change() != Some(RoleChange::Demoted)
            && !self.status.state.is_teardown()
            && (self.status.state != AttachmentState::AttachmentFailed
                || self.failure_retriability().is_retriable())
    }

    /// Retriability of the recorded attach failure. A failure without a
    /// recorded error has nothing to retry against.
    #[must_use]
    pub fn failure_retriability(&self) -> Retriability {
        self.status
            .error
            .as_ref()
            .map_or(Retriability::NonRetriable, Classify::retriability)
    }

    /// Returns `true` while the capacity finalizer is present.
    #[must_use]
    pub fn holds_capacity_slot(&self) -> bool {
        self.metadata
            .finalizers
            .iter()
            .any(|finalizer| finalizer == CAPACITY_FINALIZER)
    }
}
