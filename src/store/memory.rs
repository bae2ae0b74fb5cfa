//! In-memory [`AttachmentStore`] used by tests and the offline replay tool.
//!
//! Semantics follow the cluster API closely enough for the controller to be
//! exercised end to end: resource versions are bumped on every write, stale
//! updates conflict, deletes of objects carrying finalizers only set a
//! deletion timestamp, and failures can be injected per operation.

use std::collections::{BTreeMap, VecDeque};

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{AttachmentSelector, AttachmentStore, DeleteOutcome, StoreError, StoreFuture};
use crate::model::{Node, ObjectKey, Pod, Volume, VolumeAttachment};

const ATTACHMENT_KIND: &str = "attachment";

/// Store verbs that can be scripted to fail.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum StoreOperation {
    /// [`AttachmentStore::get_attachment`].
    GetAttachment,
    /// [`AttachmentStore::list_attachments`].
    ListAttachments,
    /// [`AttachmentStore::create_attachment`].
    CreateAttachment,
    /// [`AttachmentStore::update_attachment`].
    UpdateAttachment,
    /// [`AttachmentStore::delete_attachment`].
    DeleteAttachment,
    /// [`AttachmentStore::get_volume`].
    GetVolume,
    /// [`AttachmentStore::list_nodes`].
    ListNodes,
    /// [`AttachmentStore::list_pods`].
    ListPods,
}

#[derive(Debug, Default)]
struct State {
    attachments: BTreeMap<ObjectKey, VolumeAttachment>,
    volumes: BTreeMap<ObjectKey, Volume>,
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<ObjectKey, Pod>,
    mutations: u64,
}

/// Thread-safe in-memory object store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    faults: Mutex<BTreeMap<StoreOperation, VecDeque<StoreError>>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a volume.
    pub fn insert_volume(&self, volume: Volume) {
        self.state.lock().volumes.insert(volume.key(), volume);
    }

    /// Seeds a node.
    pub fn insert_node(&self, node: Node) {
        self.state.lock().nodes.insert(node.name.clone(), node);
    }

    /// Seeds a pod.
    pub fn insert_pod(&self, pod: Pod) {
        self.state.lock().pods.insert(pod.metadata.key(), pod);
    }

    /// Seeds an attachment as-is, assigning identity fields that are unset.
    ///
    /// Unlike [`AttachmentStore::create_attachment`] this overwrites existing
    /// objects, keeps deletion timestamps, and does not count as a mutation.
    pub fn insert_attachment(&self, mut attachment: VolumeAttachment) {
        stamp_identity(&mut attachment);
        self.state
            .lock()
            .attachments
            .insert(attachment.key(), attachment);
    }

    /// Removes an attachment immediately, bypassing finalizers.
    ///
    /// Returns the removed object when one existed.
    pub fn purge_attachment(&self, key: &ObjectKey) -> Option<VolumeAttachment> {
        self.state.lock().attachments.remove(key)
    }

    /// Returns a copy of every stored attachment, ordered by key.
    #[must_use]
    pub fn attachments(&self) -> Vec<VolumeAttachment> {
        self.state.lock().attachments.values().cloned().collect()
    }

    /// Returns a copy of every stored volume, ordered by key.
    #[must_use]
    pub fn volumes(&self) -> Vec<Volume> {
        self.state.lock().volumes.values().cloned().collect()
    }

    /// Returns a copy of every stored node, ordered by name.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.state.lock().nodes.values().cloned().collect()
    }

    /// Returns a copy of every stored pod, ordered by key.
    #[must_use]
    pub fn pods(&self) -> Vec<Pod> {
        self.state.lock().pods.values().cloned().collect()
    }

    /// Number of successful create, update, and delete calls so far.
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.state.lock().mutations
    }

    /// Makes the next call of `operation` fail with `error`.
    ///
    /// Repeated calls queue further failures in FIFO order.
    pub fn fail_next(&self, operation: StoreOperation, error: StoreError) {
        self.faults
            .lock()
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    fn take_fault(&self, operation: StoreOperation) -> Result<(), StoreError> {
        self.faults
            .lock()
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
            .map_or(Ok(()), Err)
    }

    fn get_attachment_now(&self, key: &ObjectKey) -> Result<Option<VolumeAttachment>, StoreError> {
        self.take_fault(StoreOperation::GetAttachment)?;
        Ok(self.state.lock().attachments.get(key).cloned())
    }

    fn list_attachments_now(
        &self,
        namespace: &str,
        selector: &AttachmentSelector,
    ) -> Result<Vec<VolumeAttachment>, StoreError> {
        self.take_fault(StoreOperation::ListAttachments)?;
        Ok(self
            .state
            .lock()
            .attachments
            .values()
            .filter(|attachment| attachment.metadata.namespace == namespace)
            .filter(|attachment| selector.matches(attachment))
            .cloned()
            .collect())
    }

    fn create_attachment_now(
        &self,
        mut attachment: VolumeAttachment,
    ) -> Result<VolumeAttachment, StoreError> {
        self.take_fault(StoreOperation::CreateAttachment)?;
        let key = attachment.key();
        let mut state = self.state.lock();
        if state.attachments.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: ATTACHMENT_KIND.to_owned(),
                key: key.to_string(),
            });
        }
        attachment.metadata.uid = Some(Uuid::new_v4());
        attachment.metadata.creation_timestamp = Some(Utc::now());
        attachment.metadata.deletion_timestamp = None;
        attachment.metadata.resource_version = 1;
        state.attachments.insert(key, attachment.clone());
        state.mutations = state.mutations.saturating_add(1);
        Ok(attachment)
    }

    fn update_attachment_now(
        &self,
        mut attachment: VolumeAttachment,
    ) -> Result<VolumeAttachment, StoreError> {
        self.take_fault(StoreOperation::UpdateAttachment)?;
        let key = attachment.key();
        let mut state = self.state.lock();
        let Some(stored) = state.attachments.get(&key) else {
            return Err(StoreError::not_found(ATTACHMENT_KIND, &key));
        };
        if stored.metadata.resource_version != attachment.metadata.resource_version {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: attachment.metadata.resource_version,
                found: stored.metadata.resource_version,
            });
        }
        attachment.metadata.uid = stored.metadata.uid;
        attachment.metadata.creation_timestamp = stored.metadata.creation_timestamp;
        attachment.metadata.deletion_timestamp = stored.metadata.deletion_timestamp;
        attachment.metadata.resource_version = stored.metadata.resource_version.saturating_add(1);
        state.mutations = state.mutations.saturating_add(1);
        if attachment.deletion_requested() && attachment.metadata.finalizers.is_empty() {
            state.attachments.remove(&key);
        } else {
            state.attachments.insert(key, attachment.clone());
        }
        Ok(attachment)
    }

    fn delete_attachment_now(&self, key: &ObjectKey) -> Result<DeleteOutcome, StoreError> {
        self.take_fault(StoreOperation::DeleteAttachment)?;
        let mut state = self.state.lock();
        let Some(stored) = state.attachments.get_mut(key) else {
            return Err(StoreError::not_found(ATTACHMENT_KIND, key));
        };
        let was_deleting = stored.deletion_requested();
        let outcome = if !stored.metadata.finalizers.is_empty() {
            if was_deleting {
                return Ok(DeleteOutcome::AlreadyDeleting);
            }
            stored.metadata.deletion_timestamp = Some(Utc::now());
            stored.metadata.resource_version = stored.metadata.resource_version.saturating_add(1);
            DeleteOutcome::Finalizing
        } else if was_deleting {
            state.attachments.remove(key);
            DeleteOutcome::AlreadyDeleting
        } else {
            state.attachments.remove(key);
            DeleteOutcome::Removed
        };
        state.mutations = state.mutations.saturating_add(1);
        Ok(outcome)
    }
}

fn stamp_identity(attachment: &mut VolumeAttachment) {
    if attachment.metadata.uid.is_none() {
        attachment.metadata.uid = Some(Uuid::new_v4());
    }
    if attachment.metadata.creation_timestamp.is_none() {
        attachment.metadata.creation_timestamp = Some(Utc::now());
    }
    if attachment.metadata.resource_version == 0 {
        attachment.metadata.resource_version = 1;
    }
}

impl AttachmentStore for InMemoryStore {
    fn get_attachment<'a>(
        &'a self,
        key: &'a ObjectKey,
    ) -> StoreFuture<'a, Option<VolumeAttachment>> {
        Box::pin(async move { self.get_attachment_now(key) })
    }

    fn list_attachments<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a AttachmentSelector,
    ) -> StoreFuture<'a, Vec<VolumeAttachment>> {
        Box::pin(async move { self.list_attachments_now(namespace, selector) })
    }

    fn create_attachment(
        &self,
        attachment: VolumeAttachment,
    ) -> StoreFuture<'_, VolumeAttachment> {
        Box::pin(async move { self.create_attachment_now(attachment) })
    }

    fn update_attachment(
        &self,
        attachment: VolumeAttachment,
    ) -> StoreFuture<'_, VolumeAttachment> {
        Box::pin(async move { self.update_attachment_now(attachment) })
    }

    fn delete_attachment<'a>(&'a self, key: &'a ObjectKey) -> StoreFuture<'a, DeleteOutcome> {
        Box::pin(async move { self.delete_attachment_now(key) })
    }

    fn get_volume<'a>(&'a self, key: &'a ObjectKey) -> StoreFuture<'a, Option<Volume>> {
        Box::pin(async move {
            self.take_fault(StoreOperation::GetVolume)?;
            Ok(self.state.lock().volumes.get(key).cloned())
        })
    }

    fn list_nodes(&self) -> StoreFuture<'_, Vec<Node>> {
        Box::pin(async move {
            self.take_fault(StoreOperation::ListNodes)?;
            Ok(self.state.lock().nodes.values().cloned().collect())
        })
    }

    fn list_pods<'a>(&'a self, namespace: &'a str) -> StoreFuture<'a, Vec<Pod>> {
        Box::pin(async move {
            self.take_fault(StoreOperation::ListPods)?;
            Ok(self
                .state
                .lock()
                .pods
                .values()
                .filter(|pod| pod.metadata.namespace == namespace)
                .cloned()
                .collect())
        })
    }
}
