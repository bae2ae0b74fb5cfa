//! Deferred, cancelable cleanup of replica attachments.
//!
//! When a primary leaves or is demoted, the replicas of its volume must be
//! detached, but only if no new primary shows up in the meantime. The
//! scheduler keeps at most one job per volume: the first request fixes the
//! due time (earliest wins) and later requests are absorbed. A request that
//! arrives while the job runs is remembered and re-arms the job once the run
//! finishes, so no request is lost and runs never overlap.
//!
//! Cancellation is implicit: when the job fires it re-reads the volume's
//! attachments and does nothing if an authoritative primary exists.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::sleep;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::backoff::RetryPolicy;
use crate::model::{ObjectKey, Role, VOLUME_DETACH_REQUEST_ANNOTATION, VolumeAttachment};
use crate::store::{
    AttachmentSelector, AttachmentStore, StoreError, UpdateOutcome, update_attachment_with_retry,
};

/// Errors raised by the GC scheduler.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GcError {
    /// Raised when `schedule` is called outside a tokio runtime.
    #[error("garbage collection requires a running tokio runtime")]
    NoRuntime,
    /// Raised when a store call fails during a run.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Knobs for GC runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GcSettings {
    /// Value written into the detach-request annotation.
    pub annotation_value: String,
    /// Retry policy for each annotation write.
    pub conflict_retry: RetryPolicy,
    /// Retry policy for a whole failed run.
    pub run_retry: RetryPolicy,
}

/// Result of [`GcScheduler::schedule`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScheduleOutcome {
    /// A new job was registered.
    Scheduled,
    /// A job is already waiting; its due time is unchanged.
    AlreadyPending,
    /// A job is running; it will run once more after finishing.
    Rearmed,
}

impl ScheduleOutcome {
    /// Returns `true` when the request registered new work.
    #[must_use]
    pub const fn is_new(self) -> bool {
        matches!(self, Self::Scheduled | Self::Rearmed)
    }
}

/// What a GC run did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GcReport {
    /// An authoritative primary exists; nothing was touched.
    Cancelled {
        /// The primary that cancelled the run.
        primary: ObjectKey,
    },
    /// Replicas were annotated for detach.
    Collected {
        /// Attachments annotated by this run.
        annotated: Vec<ObjectKey>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum JobState {
    Waiting,
    Running { rearm: Option<Duration> },
}

const fn is_pending(job: JobState) -> bool {
    matches!(
        job,
        JobState::Waiting | JobState::Running { rearm: Some(_) }
    )
}

#[derive(Debug)]
struct Inner<S: ?Sized> {
    store: Arc<S>,
    settings: GcSettings,
    jobs: Mutex<BTreeMap<ObjectKey, JobState>>,
}

/// Per-volume deferred cleanup scheduler.
#[derive(Debug)]
pub struct GcScheduler<S: ?Sized> {
    inner: Arc<Inner<S>>,
}

impl<S: ?Sized> Clone for GcScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: AttachmentStore + ?Sized + 'static> GcScheduler<S> {
    /// Creates a scheduler over `store`.
    #[must_use]
    pub fn new(store: Arc<S>, settings: GcSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                settings,
                jobs: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Registers a cleanup of `volume` to fire after `delay`.
    ///
    /// The job is spawned on the current tokio runtime and never blocks the
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::NoRuntime`] when called outside a tokio runtime.
    pub fn schedule(
        &self,
        volume: &ObjectKey,
        delay: Duration,
    ) -> Result<ScheduleOutcome, GcError> {
        let handle = Handle::try_current().map_err(|_| GcError::NoRuntime)?;
        {
            let mut jobs = self.inner.jobs.lock();
            match jobs.get_mut(volume) {
                Some(JobState::Waiting) => return Ok(ScheduleOutcome::AlreadyPending),
                Some(JobState::Running { rearm: Some(_) }) => {
                    return Ok(ScheduleOutcome::AlreadyPending);
                }
                Some(JobState::Running { rearm }) => {
                    *rearm = Some(delay);
                    return Ok(ScheduleOutcome::Rearmed);
                }
                None => {
                    jobs.insert(volume.clone(), JobState::Waiting);
                }
            }
        }
        let scheduler = self.clone();
        let span = info_span!("gc_job", volume = %volume);
        handle.spawn(scheduler.run_job(volume.clone(), delay).instrument(span));
        debug!(%volume, ?delay, "scheduled garbage collection");
        Ok(ScheduleOutcome::Scheduled)
    }

    /// Returns `true` while a job for `volume` waits to fire.
    #[must_use]
    pub fn pending(&self, volume: &ObjectKey) -> bool {
        self.inner
            .jobs
            .lock()
            .get(volume)
            .is_some_and(|job| is_pending(*job))
    }

    /// Number of volumes for which [`Self::pending`] holds. A run already in
    /// progress with no re-arm queued is not counted.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .values()
            .filter(|job| is_pending(**job))
            .count()
    }

    async fn run_job(self, volume: ObjectKey, first_delay: Duration) {
        let mut delay = first_delay;
        loop {
            sleep(delay).await;
            self.inner
                .jobs
                .lock()
                .insert(volume.clone(), JobState::Running { rearm: None });
            self.run_with_retry(&volume).await;

            let rearmed = {
                let mut jobs = self.inner.jobs.lock();
                if let Some(JobState::Running { rearm: Some(next) }) = jobs.get(&volume).copied() {
                    jobs.insert(volume.clone(), JobState::Waiting);
                    Some(next)
                } else {
                    jobs.remove(&volume);
                    None
                }
            };
            let Some(next_delay) = rearmed else {
                return;
            };
            debug!(?next_delay, "re-arming garbage collection");
            delay = next_delay;
        }
    }

    async fn run_with_retry(&self, volume: &ObjectKey) {
        let policy = self.inner.settings.run_retry;
        let mut attempt = 0;
        loop {
            match self.collect(volume).await {
                Ok(report) => {
                    debug!(?report, "garbage collection finished");
                    return;
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= policy.attempts {
                        warn!(error = %err, attempt, "garbage collection failed; giving up");
                        return;
                    }
                    let backoff = policy.backoff.delay(attempt - 1);
                    warn!(error = %err, attempt, ?backoff, "garbage collection failed; retrying");
                    sleep(backoff).await;
                }
            }
        }
    }

    /// Runs one cleanup pass for `volume` immediately.
    ///
    /// Does nothing when an authoritative primary exists. Otherwise every
    /// Replica-labeled attachment that is neither being deleted nor already
    /// annotated gets the detach-request annotation.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::Store`] when listing or updating fails.
    #[instrument(skip_all, fields(volume = %volume))]
    pub async fn collect(&self, volume: &ObjectKey) -> Result<GcReport, GcError> {
        let store = &*self.inner.store;
        let attachments = store
            .list_attachments(
                &volume.namespace,
                &AttachmentSelector::for_volume(volume.name.clone()),
            )
            .await?;

        if let Some(primary) = attachments
            .iter()
            .find(|attachment| attachment.is_authoritative_primary())
        {
            info!(primary = %primary.key(), "primary present; garbage collection cancelled");
            return Ok(GcReport::Cancelled {
                primary: primary.key(),
            });
        }

        let value = &self.inner.settings.annotation_value;
        let mut annotated = Vec::new();
        for candidate in attachments.iter().filter(|attachment| needs_detach(attachment)) {
            let key = candidate.key();
            let outcome = update_attachment_with_retry(
                store,
                &key,
                &self.inner.settings.conflict_retry,
                |current| {
                    if !needs_detach(current) {
                        return false;
                    }
                    current
                        .metadata
                        .annotations
                        .insert(VOLUME_DETACH_REQUEST_ANNOTATION.to_owned(), value.clone());
                    true
                },
            )
            .await?;
            if matches!(outcome, UpdateOutcome::Updated(_)) {
                annotated.push(key);
            }
        }
        info!(annotated = annotated.len(), "requested replica detach");
        Ok(GcReport::Collected { annotated })
    }
}

fn needs_detach(attachment: &VolumeAttachment) -> bool {
    attachment.labeled_role() == Role::Replica
        && !attachment.deletion_requested()
        && !attachment.detach_requested()
}

#[cfg(test)]
mod tests;
