//! Shared fixtures and helpers for cleanup scenarios.

use std::sync::Arc;

use replica_controller::model::attachment_name;
use replica_controller::test_support::{TestCluster, key};
use replica_controller::{InMemoryStore, ObjectKey, ReplicaReconciler, VolumeAttachment};
use rstest::fixture;
use tokio::runtime::{Builder, Runtime};

/// Volume every scenario works on.
pub const VOLUME: &str = "vol-0";

/// Nodes registered in every scenario.
pub const NODES: [&str; 4] = ["node-0", "node-1", "node-2", "node-3"];

#[derive(Clone, Debug)]
pub struct GcContext {
    pub runtime: Arc<Runtime>,
    pub cluster: TestCluster,
    pub reconciler: Arc<ReplicaReconciler<InMemoryStore>>,
}

impl GcContext {
    pub fn attachment_on(&self, node: &str) -> Option<VolumeAttachment> {
        self.cluster.attachment(&attachment_name(VOLUME, node))
    }
}

#[fixture]
pub fn gc_context() -> GcContext {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap_or_else(|err| panic!("paused runtime: {err}"));
    let cluster = TestCluster::new().with_nodes(&NODES, 4);
    let reconciler = Arc::new(cluster.reconciler());
    GcContext {
        runtime: Arc::new(runtime),
        cluster,
        reconciler,
    }
}

pub fn attachment_key(node: &str) -> ObjectKey {
    key(&attachment_name(VOLUME, node))
}

pub fn volume_key() -> ObjectKey {
    key(VOLUME)
}
