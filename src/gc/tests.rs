//! Unit tests for the GC scheduler.

use std::time::Duration;

use super::*;
use crate::model::AttachmentState;
use crate::store::{InMemoryStore, StoreOperation};
use crate::test_support::{AttachmentBuilder, TestCluster, key, test_settings};
use rstest::{fixture, rstest};
use tokio::time::sleep;

fn volume_key() -> ObjectKey {
    key("vol-0")
}

fn annotated(cluster: &TestCluster, name: &str) -> bool {
    cluster
        .attachment(name)
        .is_some_and(|attachment| attachment.detach_requested())
}

#[fixture]
fn orphaned() -> TestCluster {
    TestCluster::new()
        .with_attachment(
            AttachmentBuilder::primary("vol-0", "node-0")
                .deleting()
                .detach_requested("true")
                .build(),
        )
        .with_attachment(AttachmentBuilder::replica("vol-0", "node-1").build())
}

fn scheduler(cluster: &TestCluster) -> GcScheduler<InMemoryStore> {
    GcScheduler::new(Arc::clone(&cluster.store), test_settings().gc)
}

#[rstest]
#[tokio::test]
async fn collect_cancels_when_primary_is_authoritative() {
    let cluster = TestCluster::new()
        .with_attachment(AttachmentBuilder::primary("vol-0", "node-0").build())
        .with_attachment(AttachmentBuilder::replica("vol-0", "node-1").build());
    let gc = scheduler(&cluster);

    let report = gc.collect(&volume_key()).await.expect("collect");

    assert_eq!(
        report,
        GcReport::Cancelled {
            primary: key("vol-0-node-0-attachment")
        }
    );
    assert_eq!(cluster.store.mutation_count(), 0);
}

#[rstest]
#[tokio::test]
async fn collect_annotates_live_unannotated_replicas_only(orphaned: TestCluster) {
    let cluster = orphaned
        .with_attachment(
            AttachmentBuilder::replica("vol-0", "node-2")
                .deleting()
                .build(),
        )
        .with_attachment(
            AttachmentBuilder::replica("vol-0", "node-3")
                .detach_requested("someone-else")
                .build(),
        )
        .with_attachment(AttachmentBuilder::replica("vol-1", "node-1").build());
    let gc = scheduler(&cluster);

    let report = gc.collect(&volume_key()).await.expect("collect");

    assert_eq!(
        report,
        GcReport::Collected {
            annotated: vec![key("vol-0-node-1-attachment")]
        }
    );
    let replica = cluster
        .attachment("vol-0-node-1-attachment")
        .expect("replica");
    assert_eq!(
        replica
            .metadata
            .annotations
            .get(VOLUME_DETACH_REQUEST_ANNOTATION)
            .map(String::as_str),
        Some("replica-controller")
    );
    assert!(!annotated(&cluster, "vol-0-node-2-attachment"));
    assert!(!annotated(&cluster, "vol-1-node-1-attachment"));
    assert_eq!(cluster.store.mutation_count(), 1);
}

#[rstest]
#[tokio::test]
async fn collect_annotates_a_demoted_primary() {
    let cluster = TestCluster::new()
        .with_attachment(AttachmentBuilder::primary("vol-0", "node-0").demoted().build())
        .with_attachment(
            AttachmentBuilder::replica("vol-0", "node-1")
                .state(AttachmentState::Attaching)
                .build(),
        );
    let gc = scheduler(&cluster);

    let report = gc.collect(&volume_key()).await.expect("collect");

    let GcReport::Collected { annotated: keys } = report else {
        panic!("expected collection, got {report:?}");
    };
    assert_eq!(keys.len(), 2);
}

#[rstest]
fn schedule_requires_a_runtime(orphaned: TestCluster) {
    let gc = scheduler(&orphaned);
    let err = gc
        .schedule(&volume_key(), Duration::from_secs(1))
        .expect_err("no runtime");
    assert_eq!(err, GcError::NoRuntime);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn schedule_is_debounced_earliest_wins(orphaned: TestCluster) {
    let gc = scheduler(&orphaned);
    let volume = volume_key();

    let first = gc
        .schedule(&volume, Duration::from_secs(30))
        .expect("schedule");
    let second = gc
        .schedule(&volume, Duration::from_secs(5))
        .expect("schedule");
    assert_eq!(first, ScheduleOutcome::Scheduled);
    assert_eq!(second, ScheduleOutcome::AlreadyPending);
    assert!(gc.pending(&volume));

    sleep(Duration::from_secs(10)).await;
    assert!(!annotated(&orphaned, "vol-0-node-1-attachment"));

    sleep(Duration::from_secs(21)).await;
    assert!(annotated(&orphaned, "vol-0-node-1-attachment"));
    assert!(!gc.pending(&volume));
    assert_eq!(gc.pending_count(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_run_is_retried_with_backoff(orphaned: TestCluster) {
    orphaned.store.fail_next(
        StoreOperation::ListAttachments,
        StoreError::Unavailable {
            message: String::from("connection reset"),
        },
    );
    let gc = scheduler(&orphaned);

    gc.schedule(&volume_key(), Duration::from_secs(30))
        .expect("schedule");
    sleep(Duration::from_secs(31)).await;

    assert!(annotated(&orphaned, "vol-0-node-1-attachment"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn request_during_run_rearms_the_job(orphaned: TestCluster) {
    orphaned.store.fail_next(
        StoreOperation::ListAttachments,
        StoreError::Unavailable {
            message: String::from("connection reset"),
        },
    );
    let gc = scheduler(&orphaned);
    let volume = volume_key();

    gc.schedule(&volume, Duration::from_secs(30))
        .expect("schedule");
    sleep(Duration::from_millis(30_005)).await;
    assert!(!gc.pending(&volume), "job should be running its retry");
    assert_eq!(gc.pending_count(), 0);

    let outcome = gc
        .schedule(&volume, Duration::from_secs(30))
        .expect("schedule");
    assert_eq!(outcome, ScheduleOutcome::Rearmed);
    assert!(gc.pending(&volume));
    assert_eq!(gc.pending_count(), 1);

    sleep(Duration::from_secs(1)).await;
    assert!(annotated(&orphaned, "vol-0-node-1-attachment"));
    assert!(gc.pending(&volume));

    sleep(Duration::from_secs(30)).await;
    assert_eq!(gc.pending_count(), 0);
}
