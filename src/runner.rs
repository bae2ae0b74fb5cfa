//! Drives keys through the reconciler until they settle.
//!
//! The runner stands in for a work queue: it honours `requeue_after`,
//! backs off exponentially on retriable errors, and gives up on terminal
//! errors or once the attempt budget is spent.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::model::ObjectKey;
use crate::reconcile::{ReconcileError, ReplicaReconciler};
use crate::store::AttachmentStore;

/// How a key's run ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// The reconciler reported the key as settled.
    Settled,
    /// The reconciler returned a terminal error.
    Terminal(ReconcileError),
    /// The attempt budget ran out; carries the last error, if the last
    /// attempt failed.
    Exhausted(Option<ReconcileError>),
}

/// Summary of one key's run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunReport {
    /// Reconciled key.
    pub key: ObjectKey,
    /// Number of reconcile calls made.
    pub attempts: u32,
    /// Final outcome.
    pub outcome: RunOutcome,
}

impl RunReport {
    /// Returns `true` when the key settled.
    #[must_use]
    pub const fn settled(&self) -> bool {
        matches!(self.outcome, RunOutcome::Settled)
    }
}

/// Bounded retry loop around [`ReplicaReconciler::reconcile`].
#[derive(Debug)]
pub struct Runner<S: ?Sized> {
    reconciler: Arc<ReplicaReconciler<S>>,
    backoff: Backoff,
    max_attempts: u32,
}

impl<S: ?Sized> Clone for Runner<S> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            backoff: self.backoff,
            max_attempts: self.max_attempts,
        }
    }
}

impl<S: AttachmentStore + ?Sized + 'static> Runner<S> {
    /// Creates a runner; at least one attempt is always made.
    #[must_use]
    pub fn new(reconciler: Arc<ReplicaReconciler<S>>, backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            reconciler,
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    /// The wrapped reconciler.
    #[must_use]
    pub fn reconciler(&self) -> &ReplicaReconciler<S> {
        &self.reconciler
    }

    /// Reconciles `key` until it settles, fails terminally, or runs out of
    /// attempts.
    pub async fn drive(&self, key: ObjectKey) -> RunReport {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = self.reconciler.reconcile(&key).await;
            let delay = match result {
                Ok(action) => match action.requeue_after() {
                    None => return report(key, attempts, RunOutcome::Settled),
                    Some(_) if attempts >= self.max_attempts => {
                        return report(key, attempts, RunOutcome::Exhausted(None));
                    }
                    Some(delay) => delay,
                },
                Err(err) if err.is_terminal() => {
                    error!(%key, error = %err, "reconcile failed terminally");
                    return report(key, attempts, RunOutcome::Terminal(err));
                }
                Err(err) if attempts >= self.max_attempts => {
                    warn!(%key, error = %err, attempts, "giving up on key");
                    return report(key, attempts, RunOutcome::Exhausted(Some(err)));
                }
                Err(err) => {
                    let delay = self.backoff.delay(attempts - 1);
                    debug!(%key, error = %err, ?delay, "reconcile failed; backing off");
                    delay
                }
            };
            sleep(delay).await;
        }
    }

    /// Drives every key concurrently and returns the reports ordered by key.
    pub async fn drive_all(&self, keys: Vec<ObjectKey>) -> Vec<RunReport> {
        let mut tasks = JoinSet::new();
        for key in keys {
            let runner = self.clone();
            tasks.spawn(async move { runner.drive(key).await });
        }
        let mut reports = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(run) => reports.push(run),
                Err(err) => error!(error = %err, "reconcile task aborted"),
            }
        }
        reports.sort_by(|left, right| left.key.cmp(&right.key));
        let settled = reports.iter().filter(|run| run.settled()).count();
        info!(keys = reports.len(), settled, "reconcile pass finished");
        reports
    }
}

const fn report(key: ObjectKey, attempts: u32, outcome: RunOutcome) -> RunReport {
    RunReport {
        key,
        attempts,
        outcome,
    }
}
