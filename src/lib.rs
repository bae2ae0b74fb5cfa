//! Replica volume-attachment reconciliation.
//!
//! A shared disk is attached to one node as the Primary and to a number of
//! other nodes as Replicas. This crate keeps the replica set healthy: it
//! replaces replicas whose attachment failed for good, tops up the replica
//! count after a promotion, escalates stuck detaches, and, once a volume has
//! lost its primary, asks the executor to detach the leftover replicas after
//! a grace period.
//!
//! The cluster is reached through the [`AttachmentStore`] trait;
//! [`InMemoryStore`] implements it for tests and the offline replay tool.

pub mod backoff;
pub mod capacity;
pub mod classify;
pub mod config;
pub mod gc;
pub mod model;
pub mod placement;
pub mod reconcile;
pub mod runner;
pub mod snapshot;
pub mod store;
pub mod test_support;

pub use backoff::{Backoff, RetryPolicy};
pub use capacity::{CapacityError, NodeCapacityRegistry, NodeSlots};
pub use classify::{Classify, FailureKind, Retriability, classify};
pub use config::{ConfigError, ControllerConfig};
pub use gc::{GcError, GcReport, GcScheduler, GcSettings, ScheduleOutcome};
pub use model::{
    AttachmentState, DEFAULT_NAMESPACE, ModelError, Node, ObjectKey, ObjectMeta, Pod, Role,
    RoleChange, Volume, VolumeAttachment,
};
pub use placement::{PlacementError, PlacementOutcome, ReplicaPlacer};
pub use reconcile::{
    Action, Decision, ReconcileError, ReconcilerSettings, ReplicaReconciler, decide,
};
pub use runner::{RunOutcome, RunReport, Runner};
pub use snapshot::{ClusterSnapshot, SnapshotError};
pub use store::{
    AttachmentSelector, AttachmentStore, DeleteOutcome, InMemoryStore, StoreError,
    StoreOperation,
};
