//! JSON snapshots of cluster state for the offline replay tool.
//!
//! A snapshot lists volumes, nodes, pods, attachments, and node capacity.
//! [`ClusterSnapshot::seed`] turns one into a populated [`InMemoryStore`]
//! and [`NodeCapacityRegistry`]; [`ClusterSnapshot::capture`] reads them
//! back after reconciliation.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capacity::{NodeCapacityRegistry, NodeSlots};
use crate::model::{DEFAULT_NAMESPACE, Node, ObjectKey, ObjectMeta, Pod, Volume, VolumeAttachment};
use crate::store::InMemoryStore;

/// Errors raised while reading or writing snapshots.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SnapshotError {
    /// Raised when the snapshot path has no file name.
    #[error("snapshot path {path} is missing a filename")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// Raised when file system access fails.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the JSON document cannot be decoded.
    #[error("failed to parse snapshot: {message}")]
    Parse {
        /// Decoder message.
        message: String,
    },
    /// Raised when the snapshot cannot be encoded.
    #[error("failed to render snapshot: {message}")]
    Render {
        /// Encoder message.
        message: String,
    },
}

/// Serializable view of the cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    /// Volumes.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Nodes.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Pods.
    #[serde(default)]
    pub pods: Vec<Pod>,
    /// Volume attachments.
    #[serde(default)]
    pub attachments: Vec<VolumeAttachment>,
    /// Attachment slots per node. Nodes without an entry take no replicas.
    #[serde(default)]
    pub capacity: BTreeMap<String, NodeSlots>,
}

impl ClusterSnapshot {
    /// Decodes a snapshot from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Parse`] when the document is malformed.
    pub fn from_json(contents: &str) -> Result<Self, SnapshotError> {
        serde_json::from_str(contents).map_err(|err| SnapshotError::Parse {
            message: err.to_string(),
        })
    }

    /// Encodes the snapshot as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Render`] when encoding fails.
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        serde_json::to_string_pretty(self).map_err(|err| SnapshotError::Render {
            message: err.to_string(),
        })
    }

    /// Reads and decodes a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] when the file cannot be read or decoded.
    pub fn load(path: &Utf8Path) -> Result<Self, SnapshotError> {
        let (dir, file_name) = open_parent(path)?;
        let contents = dir
            .read_to_string(file_name)
            .map_err(|err| SnapshotError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        Self::from_json(&contents)
    }

    /// Encodes the snapshot and writes it to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] when encoding or writing fails.
    pub fn save(&self, path: &Utf8Path) -> Result<(), SnapshotError> {
        let rendered = self.to_json()?;
        let (dir, file_name) = open_parent(path)?;
        dir.write(file_name, rendered)
            .map_err(|err| SnapshotError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
    }

    /// Builds a store and capacity registry holding this snapshot.
    ///
    /// Objects without a namespace land in [`DEFAULT_NAMESPACE`].
    #[must_use]
    pub fn seed(&self) -> (InMemoryStore, NodeCapacityRegistry) {
        let store = InMemoryStore::new();
        for volume in &self.volumes {
            let mut seeded = volume.clone();
            default_namespace(&mut seeded.metadata);
            store.insert_volume(seeded);
        }
        for node in &self.nodes {
            store.insert_node(node.clone());
        }
        for pod in &self.pods {
            let mut seeded = pod.clone();
            default_namespace(&mut seeded.metadata);
            store.insert_pod(seeded);
        }
        for attachment in &self.attachments {
            let mut seeded = attachment.clone();
            default_namespace(&mut seeded.metadata);
            store.insert_attachment(seeded);
        }

        let registry = NodeCapacityRegistry::new();
        for (node, slots) in &self.capacity {
            registry.set_slots(node, *slots);
        }
        (store, registry)
    }

    /// Reads the current contents of a store and registry.
    #[must_use]
    pub fn capture(store: &InMemoryStore, registry: &NodeCapacityRegistry) -> Self {
        Self {
            volumes: store.volumes(),
            nodes: store.nodes(),
            pods: store.pods(),
            attachments: store.attachments(),
            capacity: registry.snapshot(),
        }
    }

    /// Keys of every attachment in the snapshot, after namespace defaulting.
    #[must_use]
    pub fn attachment_keys(&self) -> Vec<ObjectKey> {
        self.attachments
            .iter()
            .map(|attachment| {
                let mut metadata = attachment.metadata.clone();
                default_namespace(&mut metadata);
                metadata.key()
            })
            .collect()
    }
}

fn default_namespace(metadata: &mut ObjectMeta) {
    if metadata.namespace.is_empty() {
        DEFAULT_NAMESPACE.clone_into(&mut metadata.namespace);
    }
}

fn open_parent(path: &Utf8Path) -> Result<(Dir, &str), SnapshotError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| SnapshotError::InvalidPath {
        path: path.to_path_buf(),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| SnapshotError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok((dir, file_name))
}
