//! Pure classification of an attachment into the action it needs.

use crate::classify::Retriability;
use crate::model::{AttachmentState, Role, RoleChange, VolumeAttachment};

/// Action the reconciler takes for one attachment.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Decision {
    /// Nothing to do until the object changes.
    Settled,
    /// A failed detach was explicitly requested: escalate to a forced detach.
    ForceDetach,
    /// Defer replica cleanup for the volume through the GC scheduler.
    ScheduleGc,
    /// A primary failed to attach for good: force it off the node.
    EscalatePrimary,
    /// The failure is transient: look again later.
    RetryLater,
    /// A promoted replica is attached: record the new role and replace it.
    CompletePromotion,
    /// An attached primary: make sure the volume is not short.
    EnsureReplicas,
    /// A replica failed for good: delete it and place a new one.
    DeleteAndReplace,
}

/// Returns the decision for `attachment` as currently stored.
///
/// Rules are evaluated top to bottom; the first match wins.
#[must_use]
pub fn decide(attachment: &VolumeAttachment) -> Decision {
    if attachment.status.state == AttachmentState::DetachmentFailed
        && attachment.detach_requested()
    {
        return Decision::ForceDetach;
    }
    match attachment.labeled_role() {
        Role::Primary => decide_primary(attachment),
        Role::Replica => decide_replica(attachment),
    }
}

fn decide_primary(attachment: &VolumeAttachment) -> Decision {
    let status = &attachment.status;
    if attachment.deletion_requested() {
        return if attachment.detach_requested() {
            Decision::ScheduleGc
        } else {
            Decision::Settled
        };
    }
    match status.state {
        AttachmentState::AttachmentFailed => match attachment.failure_retriability() {
            Retriability::NonRetriable => Decision::EscalatePrimary,
            Retriability::Retriable => Decision::RetryLater,
        },
        AttachmentState::Attached => {
            if status.role == Some(Role::Replica) && attachment.spec.requested_role == Role::Primary
            {
                Decision::CompletePromotion
            } else if attachment.is_authoritative_primary() {
                Decision::EnsureReplicas
            } else {
                Decision::Settled
            }
        }
        AttachmentState::Pending
        | AttachmentState::Attaching
        | AttachmentState::Detaching
        | AttachmentState::Detached
        | AttachmentState::DetachmentFailed
        | AttachmentState::ForceDetachPending => Decision::Settled,
    }
}

fn decide_replica(attachment: &VolumeAttachment) -> Decision {
    if attachment.role_change() == Some(RoleChange::Demoted) {
        return Decision::ScheduleGc;
    }
    if attachment.deletion_requested() {
        return Decision::Settled;
    }
    match attachment.status.state {
        AttachmentState::AttachmentFailed => match attachment.failure_retriability() {
            Retriability::NonRetriable => Decision::DeleteAndReplace,
            Retriability::Retriable => Decision::RetryLater,
        },
        AttachmentState::Pending
        | AttachmentState::Attaching
        | AttachmentState::Attached
        | AttachmentState::Detaching
        | AttachmentState::Detached
        | AttachmentState::DetachmentFailed
        | AttachmentState::ForceDetachPending => Decision::Settled,
    }
}
