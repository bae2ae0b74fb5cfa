//! Unit tests for the reconcile decision table and its side effects.

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::model::{AttachmentState, CAPACITY_FINALIZER, Node, Role, RoleChange};
use crate::store::{InMemoryStore, StoreOperation};
use crate::test_support::{AttachmentBuilder, TEST_FINALIZER, TestCluster, key, pod, volume};
use rstest::{fixture, rstest};

#[rstest]
#[case::failed_detach_requested(
    AttachmentBuilder::replica("vol-0", "node-1")
        .state(AttachmentState::DetachmentFailed)
        .detach_requested("true"),
    Decision::ForceDetach
)]
#[case::failed_detach_without_request(
    AttachmentBuilder::replica("vol-0", "node-1").state(AttachmentState::DetachmentFailed),
    Decision::Settled
)]
#[case::primary_leaving_with_detach(
    AttachmentBuilder::primary("vol-0", "node-0").deleting().detach_requested("true"),
    Decision::ScheduleGc
)]
#[case::primary_leaving_quietly(
    AttachmentBuilder::primary("vol-0", "node-0").deleting(),
    Decision::Settled
)]
#[case::primary_failed_for_good(
    AttachmentBuilder::primary("vol-0", "node-0").attach_failed("AuthorizationFailed"),
    Decision::EscalatePrimary
)]
#[case::primary_failed_transiently(
    AttachmentBuilder::primary("vol-0", "node-0").attach_failed("TooManyRequests"),
    Decision::RetryLater
)]
#[case::promotion_observed(
    AttachmentBuilder::primary("vol-0", "node-1").observed_role(Some(Role::Replica)),
    Decision::CompletePromotion
)]
#[case::promotion_recorded(
    AttachmentBuilder::primary("vol-0", "node-1").previous_role(Some(Role::Replica)),
    Decision::EnsureReplicas
)]
#[case::steady_primary(AttachmentBuilder::primary("vol-0", "node-0"), Decision::EnsureReplicas)]
#[case::primary_asked_to_detach(
    AttachmentBuilder::primary("vol-0", "node-0").detach_requested("true"),
    Decision::Settled
)]
#[case::primary_still_attaching(
    AttachmentBuilder::primary("vol-0", "node-0").state(AttachmentState::Attaching),
    Decision::Settled
)]
#[case::demoted_primary(
    AttachmentBuilder::primary("vol-0", "node-0").demoted(),
    Decision::ScheduleGc
)]
#[case::replica_leaving(
    AttachmentBuilder::replica("vol-0", "node-1").deleting(),
    Decision::Settled
)]
#[case::replica_failed_for_good(
    AttachmentBuilder::replica("vol-0", "node-1").attach_failed("DiskNotFound"),
    Decision::DeleteAndReplace
)]
#[case::replica_failed_without_error(
    AttachmentBuilder::replica("vol-0", "node-1").state(AttachmentState::AttachmentFailed),
    Decision::DeleteAndReplace
)]
#[case::replica_failed_transiently(
    AttachmentBuilder::replica("vol-0", "node-1").attach_failed("ServerBusy"),
    Decision::RetryLater
)]
#[case::steady_replica(AttachmentBuilder::replica("vol-0", "node-1"), Decision::Settled)]
fn decision_table(#[case] builder: AttachmentBuilder, #[case] expected: Decision) {
    assert_eq!(decide(&builder.build()), expected);
}

#[rstest]
fn role_label_wins_over_requested_role() {
    let attachment = AttachmentBuilder::replica("vol-0", "node-1")
        .requested_role(Role::Primary)
        .role_change(RoleChange::Demoted)
        .build();
    assert_eq!(decide(&attachment), Decision::ScheduleGc);
}

#[fixture]
fn base() -> TestCluster {
    TestCluster::new()
        .with_nodes(&["node-0", "node-1", "node-2"], 4)
        .with_volume(volume("vol-0", 1))
        .with_pod(pod("pod-0", "vol-0"))
}

#[rstest]
#[tokio::test]
async fn missing_attachment_is_settled(base: TestCluster) {
    let action = base
        .reconciler()
        .reconcile(&key("nope"))
        .await
        .expect("reconcile");
    assert!(action.is_settled());
}

#[rstest]
#[tokio::test]
async fn transient_failure_requeues(base: TestCluster) {
    let cluster = base.with_attachment(
        AttachmentBuilder::replica("vol-0", "node-1")
            .attach_failed("OperationPreempted")
            .build(),
    );
    let action = cluster
        .reconciler()
        .reconcile(&key("vol-0-node-1-attachment"))
        .await
        .expect("reconcile");
    assert_eq!(action.requeue_after(), Some(Duration::from_secs(30)));
    assert_eq!(cluster.store.mutation_count(), 0);
}

#[rstest]
#[tokio::test]
async fn non_retriable_primary_failure_forces_detach(base: TestCluster) {
    let cluster = base.with_attachment(
        AttachmentBuilder::primary("vol-0", "node-0")
            .attach_failed("InvalidParameter")
            .build(),
    );
    let reconciler = cluster.reconciler();
    let target = key("vol-0-node-0-attachment");

    reconciler.reconcile(&target).await.expect("reconcile");
    reconciler.reconcile(&target).await.expect("reconcile again");

    let stored = cluster
        .attachment("vol-0-node-0-attachment")
        .expect("primary");
    assert_eq!(stored.status.state, AttachmentState::ForceDetachPending);
    assert_eq!(cluster.store.mutation_count(), 1);
}

#[rstest]
#[case::missing_volume(None)]
#[case::unprovisioned_volume(Some(crate::model::Volume {
    disk_uri: None,
    ..volume("vol-0", 1)
}))]
#[tokio::test]
async fn replacement_requires_a_provisioned_volume(
    #[case] stored_volume: Option<crate::model::Volume>,
) {
    let cluster = TestCluster::new()
        .with_nodes(&["node-0", "node-1"], 4)
        .with_attachment(
            AttachmentBuilder::replica("vol-0", "node-1")
                .attach_failed("DiskNotFound")
                .build(),
        );
    if let Some(found) = stored_volume {
        cluster.store.insert_volume(found);
    }

    let err = cluster
        .reconciler()
        .reconcile(&key("vol-0-node-1-attachment"))
        .await
        .expect_err("volume problems are terminal");

    assert!(matches!(err, ReconcileError::Inconsistent { .. }));
    assert!(err.is_terminal());
    assert!(cluster.attachment("vol-0-node-1-attachment").is_some());
}

#[rstest]
#[tokio::test]
async fn failed_replica_releases_capacity_once(base: TestCluster) {
    base.capacity.reserve("node-1").expect("slot held by replica");
    let cluster = base.with_attachment(
        AttachmentBuilder::replica("vol-0", "node-1")
            .attach_failed("DiskNotFound")
            .finalizer(CAPACITY_FINALIZER)
            .finalizer(TEST_FINALIZER)
            .build(),
    );
    let reconciler = cluster.reconciler();
    let target = key("vol-0-node-1-attachment");

    reconciler.reconcile(&target).await.expect("reconcile");
    reconciler.reconcile(&target).await.expect("reconcile again");

    assert_eq!(cluster.capacity.remaining("node-1"), Some(4));
    let replacements: Vec<_> = cluster
        .replicas()
        .into_iter()
        .filter(|replica| !replica.deletion_requested())
        .collect();
    assert_eq!(replacements.len(), 1);
    assert!(
        replacements
            .iter()
            .all(|replica| replica.spec.node_name != "node-1")
    );
}

#[rstest]
#[tokio::test]
async fn placement_exhaustion_is_retriable(base: TestCluster) {
    let cluster = base.with_attachment(
        AttachmentBuilder::primary("vol-0", "node-0")
            .previous_role(Some(Role::Replica))
            .build(),
    );
    cluster.capacity.set_capacity("node-1", 0);
    cluster.capacity.set_capacity("node-2", 0);

    let err = cluster
        .reconciler()
        .reconcile(&key("vol-0-node-0-attachment"))
        .await
        .expect_err("no node has room");

    assert!(matches!(
        err,
        ReconcileError::Placement(PlacementError::NoEligibleNode { .. })
    ));
    assert!(!err.is_terminal());
}

#[rstest]
#[tokio::test]
async fn replica_deficit_recovers_once_a_node_frees() {
    let cluster = TestCluster::new()
        .with_nodes(&["node-0", "node-1"], 4)
        .with_volume(volume("vol-0", 1))
        .with_pod(pod("pod-0", "vol-0"))
        .with_attachment(AttachmentBuilder::primary("vol-0", "node-0").build())
        .with_attachment(
            AttachmentBuilder::replica("vol-0", "node-1")
                .attach_failed("DiskNotFound")
                .build(),
        );
    let reconciler = cluster.reconciler();
    let failed = key("vol-0-node-1-attachment");

    let err = reconciler
        .reconcile(&failed)
        .await
        .expect_err("no node can take the replacement");
    assert!(matches!(
        err,
        ReconcileError::Placement(PlacementError::NoEligibleNode { .. })
    ));
    assert!(cluster.replicas().is_empty());

    cluster.store.insert_node(Node::new("node-2"));
    cluster.capacity.set_capacity("node-2", 4);
    reconciler
        .reconcile(&failed)
        .await
        .expect("failed replica is gone");
    reconciler
        .reconcile(&key("vol-0-node-0-attachment"))
        .await
        .expect("primary tops up");

    let replicas = cluster.replicas();
    assert_eq!(replicas.len(), 1);
    assert!(
        replicas
            .iter()
            .all(|replica| replica.spec.node_name == "node-2")
    );
    assert_eq!(cluster.capacity.remaining("node-2"), Some(3));
}

#[rstest]
#[tokio::test]
async fn retrying_replica_is_not_replaced(base: TestCluster) {
    let cluster = base
        .with_attachment(AttachmentBuilder::primary("vol-0", "node-0").build())
        .with_attachment(
            AttachmentBuilder::replica("vol-0", "node-1")
                .attach_failed("ServerBusy")
                .build(),
        );

    cluster
        .reconciler()
        .reconcile(&key("vol-0-node-0-attachment"))
        .await
        .expect("reconcile");

    assert_eq!(cluster.replicas().len(), 1);
    assert_eq!(cluster.store.mutation_count(), 0);
}

#[rstest]
#[case::executor_still_detaching(true)]
#[case::nothing_else_holds_it(false)]
#[tokio::test]
async fn replica_deleted_elsewhere_returns_its_slot_once(
    base: TestCluster,
    #[case] executor_finalizer: bool,
) {
    let cluster = base.with_attachment(
        AttachmentBuilder::primary("vol-0", "node-0")
            .previous_role(Some(Role::Replica))
            .build(),
    );
    let reconciler = cluster.reconciler();
    reconciler
        .reconcile(&key("vol-0-node-0-attachment"))
        .await
        .expect("top up");
    let mut placed = cluster.replicas().into_iter().next().expect("placed replica");
    let node = placed.spec.node_name.clone();
    let target = placed.key();
    assert!(placed.holds_capacity_slot());
    assert_eq!(cluster.capacity.remaining(&node), Some(3));

    if executor_finalizer {
        placed.metadata.finalizers.push(TEST_FINALIZER.to_owned());
        cluster.store.insert_attachment(placed);
    }
    cluster
        .store
        .delete_attachment(&target)
        .await
        .expect("external delete");

    reconciler.reconcile(&target).await.expect("deleting replica");
    reconciler.reconcile(&target).await.expect("redelivery");
    assert_eq!(cluster.capacity.remaining(&node), Some(4));

    let leftover = cluster.store.get_attachment(&target).await.expect("get");
    assert_eq!(leftover.is_some(), executor_finalizer);
    assert!(leftover.is_none_or(|attachment| !attachment.holds_capacity_slot()));

    cluster.store.purge_attachment(&target);
    reconciler.reconcile(&target).await.expect("after purge");
    assert_eq!(cluster.capacity.remaining(&node), Some(4));
}

#[rstest]
#[tokio::test]
async fn replica_without_capacity_finalizer_releases_nothing(base: TestCluster) {
    base.capacity.reserve("node-1").expect("slot held elsewhere");
    let cluster = base.with_attachment(
        AttachmentBuilder::replica("vol-0", "node-1")
            .deleting()
            .build(),
    );

    cluster
        .reconciler()
        .reconcile(&key("vol-0-node-1-attachment"))
        .await
        .expect("reconcile");

    assert_eq!(cluster.capacity.remaining("node-1"), Some(3));
    assert_eq!(cluster.store.mutation_count(), 0);
}

#[rstest]
#[tokio::test]
async fn store_outage_is_retriable(base: TestCluster) {
    base.store.fail_next(
        StoreOperation::GetAttachment,
        StoreError::Timeout {
            operation: String::from("get attachment"),
        },
    );
    let err = base
        .reconciler()
        .reconcile(&key("vol-0-node-1-attachment"))
        .await
        .expect_err("get fails");
    assert!(!err.is_terminal());
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_create_one_replacement(base: TestCluster) {
    let cluster = base.with_attachment(
        AttachmentBuilder::primary("vol-0", "node-0")
            .previous_role(Some(Role::Replica))
            .build(),
    );
    let reconciler: Arc<ReplicaReconciler<InMemoryStore>> = Arc::new(cluster.reconciler());
    let target = key("vol-0-node-0-attachment");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let shared = Arc::clone(&reconciler);
            let delivered = target.clone();
            tokio::spawn(async move { shared.reconcile(&delivered).await })
        })
        .collect();
    for handle in handles {
        handle
            .await
            .expect("task should not panic")
            .expect("reconcile");
    }

    assert_eq!(cluster.replicas().len(), 1);
}
