//! BDD step definitions for deferred replica cleanup.

use std::time::Duration;

use replica_controller::model::VOLUME_DETACH_REQUEST_ANNOTATION;
use replica_controller::test_support::{AttachmentBuilder, TEST_GC_DELAY, volume};
use replica_controller::{Role, VolumeAttachment};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{GcContext, VOLUME, attachment_key, volume_key};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("reconcile failed: {0}")]
    Reconcile(#[from] replica_controller::ReconcileError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn annotated(attachment: &VolumeAttachment) -> bool {
    attachment
        .metadata
        .annotations
        .contains_key(VOLUME_DETACH_REQUEST_ANNOTATION)
}

#[given("a volume wanting {count:u32} replicas")]
fn volume_wanting(gc_context: GcContext, count: u32) -> GcContext {
    gc_context.cluster.store.insert_volume(volume(VOLUME, count));
    gc_context
}

#[given("a replica attachment on \"{node}\"")]
fn replica_on(gc_context: GcContext, node: String) -> GcContext {
    gc_context
        .cluster
        .store
        .insert_attachment(AttachmentBuilder::replica(VOLUME, node.trim()).build());
    gc_context
}

#[given("the primary on \"{node}\" is being deleted with a detach request")]
fn leaving_primary_on(gc_context: GcContext, node: String) -> GcContext {
    gc_context.cluster.store.insert_attachment(
        AttachmentBuilder::primary(VOLUME, node.trim())
            .deleting()
            .detach_requested("true")
            .build(),
    );
    gc_context
}

#[given("a demoted primary on \"{node}\"")]
fn demoted_primary_on(gc_context: GcContext, node: String) -> GcContext {
    gc_context
        .cluster
        .store
        .insert_attachment(AttachmentBuilder::primary(VOLUME, node.trim()).demoted().build());
    gc_context
}

#[given("the replica on \"{node}\" is being deleted")]
fn leaving_replica_on(gc_context: GcContext, node: String) -> GcContext {
    gc_context
        .cluster
        .store
        .insert_attachment(AttachmentBuilder::replica(VOLUME, node.trim()).deleting().build());
    gc_context
}

#[when("the attachment on \"{node}\" is reconciled")]
fn reconcile_on(gc_context: GcContext, node: String) -> Result<GcContext, StepError> {
    let target = attachment_key(node.trim());
    let reconciler = gc_context.reconciler.clone();
    gc_context
        .runtime
        .block_on(async move { reconciler.reconcile(&target).await })?;
    Ok(gc_context)
}

#[when("the replica on \"{node}\" is promoted")]
fn promote_replica_on(gc_context: GcContext, node: String) -> GcContext {
    gc_context.cluster.store.insert_attachment(
        AttachmentBuilder::replica(VOLUME, node.trim())
            .role_label(Role::Primary)
            .requested_role(Role::Primary)
            .build(),
    );
    gc_context
}

#[when("the cleanup delay elapses")]
fn cleanup_delay_elapses(gc_context: GcContext) -> GcContext {
    let wait = TEST_GC_DELAY.saturating_add(Duration::from_secs(60));
    gc_context.runtime.block_on(tokio::time::sleep(wait));
    gc_context
}

#[then("the attachment on \"{node}\" carries the detach request")]
fn carries_request(gc_context: &GcContext, node: String) -> Result<(), StepError> {
    let attachment = gc_context
        .attachment_on(node.trim())
        .ok_or_else(|| StepError::Assertion(format!("no attachment on {node}")))?;
    if annotated(&attachment) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a detach request on {node}, got {:?}",
            attachment.metadata.annotations
        )))
    }
}

#[then("the attachment on \"{node}\" carries no detach request")]
fn carries_no_request(gc_context: &GcContext, node: String) -> Result<(), StepError> {
    let attachment = gc_context
        .attachment_on(node.trim())
        .ok_or_else(|| StepError::Assertion(format!("no attachment on {node}")))?;
    if annotated(&attachment) {
        Err(StepError::Assertion(format!(
            "unexpected detach request on {node}"
        )))
    } else {
        Ok(())
    }
}

#[then("no replica carries the detach request")]
fn no_replica_annotated(gc_context: &GcContext) -> Result<(), StepError> {
    let flagged: Vec<_> = gc_context
        .cluster
        .replicas()
        .into_iter()
        .filter(annotated)
        .map(|attachment| attachment.metadata.name)
        .collect();
    if flagged.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected detach requests on {flagged:?}"
        )))
    }
}

#[then("{count:usize} replica remains for the volume")]
fn replica_count(gc_context: &GcContext, count: usize) -> Result<(), StepError> {
    let replicas = gc_context.cluster.replicas();
    if replicas.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} replicas, got {}",
            replicas.len()
        )))
    }
}

#[then("a cleanup is pending")]
fn cleanup_pending(gc_context: &GcContext) -> Result<(), StepError> {
    let gc = gc_context.reconciler.gc();
    if gc.pending(&volume_key()) && gc.pending_count() == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one pending cleanup, got {}",
            gc.pending_count()
        )))
    }
}

#[then("no cleanup is pending")]
fn no_cleanup_pending(gc_context: &GcContext) -> Result<(), StepError> {
    let pending = gc_context.reconciler.gc().pending_count();
    if pending == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no pending cleanup, got {pending}"
        )))
    }
}
