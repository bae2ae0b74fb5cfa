//! Object-store facade consumed by the replica controller.
//!
//! The controller never talks to the cluster API directly. It goes through
//! [`AttachmentStore`], which mirrors the handful of verbs it needs: CRUD on
//! attachments plus read access to volumes, nodes, and pods. Updates carry
//! the observed `resource_version` and fail with [`StoreError::Conflict`]
//! when someone else wrote first; [`update_attachment_with_retry`] wraps the
//! re-fetch-and-retry loop.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::model::{Node, ObjectKey, Pod, Role, Volume, VolumeAttachment};

mod memory;
mod retry;

pub use memory::{InMemoryStore, StoreOperation};
pub use retry::{UpdateOutcome, update_attachment_with_retry};

/// Errors returned by store implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when the addressed object does not exist.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Object kind (for example `attachment`).
        kind: String,
        /// Object key.
        key: String,
    },
    /// Raised when creating an object whose key is taken.
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: String,
        /// Object key.
        key: String,
    },
    /// Raised when an update carries a stale resource version.
    #[error("conflict updating {key}: expected version {expected}, found {found}")]
    Conflict {
        /// Object key.
        key: String,
        /// Version the writer observed.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },
    /// Raised when a call exceeds its deadline.
    #[error("timed out during {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },
    /// Raised when the store rate-limits the caller.
    #[error("throttled during {operation}")]
    Throttled {
        /// Operation that was throttled.
        operation: String,
    },
    /// Raised when the store cannot be reached.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Transport or server message.
        message: String,
    },
    /// Raised when the caller is not allowed to perform the operation.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Server message.
        message: String,
    },
    /// Raised when the store rejects a malformed object.
    #[error("invalid object: {message}")]
    Invalid {
        /// Validation message.
        message: String,
    },
}

impl StoreError {
    pub(crate) fn not_found(kind: &str, key: &ObjectKey) -> Self {
        Self::NotFound {
            kind: kind.to_owned(),
            key: key.to_string(),
        }
    }
}

/// Label-selector subset used to list attachments.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttachmentSelector {
    volume_name: Option<String>,
    role: Option<Role>,
}

impl AttachmentSelector {
    /// Selects every attachment in the namespace.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Selects the attachments of one volume.
    #[must_use]
    pub fn for_volume(volume_name: impl Into<String>) -> Self {
        Self {
            volume_name: Some(volume_name.into()),
            role: None,
        }
    }

    /// Narrows the selection to a Role label value.
    #[must_use]
    pub const fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Returns `true` when the attachment matches every constraint.
    #[must_use]
    pub fn matches(&self, attachment: &VolumeAttachment) -> bool {
        let volume_matches = self
            .volume_name
            .as_deref()
            .is_none_or(|name| attachment.spec.volume_name == name);
        let role_matches = self
            .role
            .is_none_or(|role| attachment.labeled_role() == role);
        volume_matches && role_matches
    }
}

/// Result of a delete call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeleteOutcome {
    /// The object was removed.
    Removed,
    /// The object carries finalizers and is now marked for deletion.
    Finalizing,
    /// The object was already marked for deletion by an earlier call.
    AlreadyDeleting,
}

impl DeleteOutcome {
    /// Returns `true` when this call initiated the deletion.
    #[must_use]
    pub const fn initiated(self) -> bool {
        matches!(self, Self::Removed | Self::Finalizing)
    }
}

/// Future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Operations the controller needs from the cluster object store.
pub trait AttachmentStore: Send + Sync {
    /// Fetches an attachment; `Ok(None)` when it does not exist.
    fn get_attachment<'a>(&'a self, key: &'a ObjectKey)
    -> StoreFuture<'a, Option<VolumeAttachment>>;

    /// Lists attachments in a namespace matching the selector.
    fn list_attachments<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a AttachmentSelector,
    ) -> StoreFuture<'a, Vec<VolumeAttachment>>;

    /// Creates an attachment and returns the stored copy.
    fn create_attachment(&self, attachment: VolumeAttachment)
    -> StoreFuture<'_, VolumeAttachment>;

    /// Replaces an attachment; fails on a stale resource version.
    fn update_attachment(&self, attachment: VolumeAttachment)
    -> StoreFuture<'_, VolumeAttachment>;

    /// Requests deletion of an attachment.
    fn delete_attachment<'a>(&'a self, key: &'a ObjectKey) -> StoreFuture<'a, DeleteOutcome>;

    /// Fetches a volume; `Ok(None)` when it does not exist.
    fn get_volume<'a>(&'a self, key: &'a ObjectKey) -> StoreFuture<'a, Option<Volume>>;

    /// Lists every node.
    fn list_nodes(&self) -> StoreFuture<'_, Vec<Node>>;

    /// Lists the pods of a namespace.
    fn list_pods<'a>(&'a self, namespace: &'a str) -> StoreFuture<'a, Vec<Pod>>;
}
