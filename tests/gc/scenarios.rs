//! BDD scenarios for deferred replica cleanup.

use rstest_bdd_macros::scenario;

use super::test_helpers::{GcContext, gc_context};

#[scenario(
    path = "tests/features/gc.feature",
    name = "Replicas are asked to detach once the primary is gone"
)]
fn scenario_detach_after_primary_loss(gc_context: GcContext) {
    drop(gc_context);
}

#[scenario(
    path = "tests/features/gc.feature",
    name = "A promotion before the delay cancels cleanup"
)]
fn scenario_promotion_cancels_cleanup(gc_context: GcContext) {
    drop(gc_context);
}

#[scenario(
    path = "tests/features/gc.feature",
    name = "A demoted primary is cleaned up with its siblings"
)]
fn scenario_demoted_primary(gc_context: GcContext) {
    drop(gc_context);
}

#[scenario(
    path = "tests/features/gc.feature",
    name = "Repeated cleanup requests share one job"
)]
fn scenario_single_pending_job(gc_context: GcContext) {
    drop(gc_context);
}

#[scenario(
    path = "tests/features/gc.feature",
    name = "Replicas already leaving are left alone"
)]
fn scenario_leaving_replicas_untouched(gc_context: GcContext) {
    drop(gc_context);
}
