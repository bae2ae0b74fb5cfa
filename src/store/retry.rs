//! Re-fetch-and-retry loop for optimistic-concurrency updates.

use tokio::time::sleep;
use tracing::debug;

use super::{AttachmentStore, StoreError};
use crate::backoff::RetryPolicy;
use crate::model::{ObjectKey, VolumeAttachment};

/// Result of [`update_attachment_with_retry`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// The mutation changed the object and was written.
    Updated(VolumeAttachment),
    /// The object already had the desired content; nothing was written.
    Unchanged(VolumeAttachment),
    /// The object no longer exists.
    Gone,
}

/// Applies `mutate` to the freshest copy of an attachment and writes it.
///
/// `mutate` returns `false` when the object already has the desired
/// content, in which case no write is issued. Conflicts re-fetch the object
/// and try again, sleeping according to the policy's backoff.
///
/// # Errors
///
/// Returns the store error when a call fails for any reason other than a
/// conflict, or the last conflict once the policy's attempts are spent.
pub async fn update_attachment_with_retry<S, F>(
    store: &S,
    key: &ObjectKey,
    policy: &RetryPolicy,
    mut mutate: F,
) -> Result<UpdateOutcome, StoreError>
where
    S: AttachmentStore + ?Sized,
    F: FnMut(&mut VolumeAttachment) -> bool,
{
    let mut attempt = 0;
    loop {
        let Some(mut attachment) = store.get_attachment(key).await? else {
            return Ok(UpdateOutcome::Gone);
        };
        if !mutate(&mut attachment) {
            return Ok(UpdateOutcome::Unchanged(attachment));
        }
        match store.update_attachment(attachment).await {
            Ok(stored) => return Ok(UpdateOutcome::Updated(stored)),
            Err(StoreError::NotFound { .. }) => return Ok(UpdateOutcome::Gone),
            Err(err @ StoreError::Conflict { .. }) => {
                attempt += 1;
                if attempt >= policy.attempts {
                    return Err(err);
                }
                let delay = policy.backoff.delay(attempt - 1);
                debug!(%key, attempt, ?delay, "update conflicted; retrying");
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
