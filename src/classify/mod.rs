//! Retriable vs non-retriable classification of failures.
//!
//! Backend failures arrive as provider error codes recorded on the
//! attachment status; store failures arrive as [`StoreError`]. Both are
//! folded into a [`Retriability`] so the reconciler can decide between
//! waiting and replacing.

use crate::model::BackendFailure;
use crate::store::StoreError;

/// Whether retrying the failed operation can succeed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Retriability {
    /// The failure is transient; retry later.
    Retriable,
    /// Retrying will fail the same way.
    NonRetriable,
}

impl Retriability {
    /// Returns `true` for [`Retriability::Retriable`].
    #[must_use]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Retriable)
    }
}

/// Implemented by failures the controller needs to triage.
pub trait Classify {
    /// Returns whether the failed operation is worth retrying.
    fn retriability(&self) -> Retriability;
}

/// Classifies any failure implementing [`Classify`].
#[must_use]
pub fn classify<E: Classify + ?Sized>(failure: &E) -> Retriability {
    failure.retriability()
}

/// Coarse category of a provider error code.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FailureKind {
    /// The call did not finish in time or was preempted.
    Timeout,
    /// Another writer changed the resource concurrently.
    Conflict,
    /// The provider rate-limited the caller.
    Throttled,
    /// The provider is temporarily unable to serve.
    Unavailable,
    /// The disk or node referenced by the call does not exist.
    NotFound,
    /// The controller identity lacks permission.
    Unauthorized,
    /// The request is malformed or the disk is misconfigured.
    InvalidConfiguration,
    /// The provider does not support the operation for this disk.
    Unsupported,
    /// Any code not listed above.
    Unknown,
}

impl FailureKind {
    /// Maps a provider error code, ignoring ASCII case.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        let normalised = code.trim().to_ascii_lowercase();
        match normalised.as_str() {
            "timeout" | "operationtimedout" | "operationpreempted" | "gatewaytimeout" => {
                Self::Timeout
            }
            "conflict" | "conflictingoperation" | "attachdiskwhilebeingdetached" => Self::Conflict,
            "toomanyrequests" | "throttled" | "subscriptionrequeststhrottled" => Self::Throttled,
            "serverbusy" | "internalerror" | "serviceunavailable" | "internalexecutionerror" => {
                Self::Unavailable
            }
            "notfound" | "resourcenotfound" | "disknotfound" | "nodenotfound"
            | "resourcegroupnotfound" => Self::NotFound,
            "forbidden" | "authorizationfailed" | "linkedauthorizationfailed" | "unauthorized" => {
                Self::Unauthorized
            }
            "badrequest" | "invalidparameter" | "invalidconfiguration" | "invaliddiskuri"
            | "maxdatadiskcountexceeded" => Self::InvalidConfiguration,
            "operationnotallowed" | "unsupported" | "notsupported" => Self::Unsupported,
            _ => Self::Unknown,
        }
    }
}

impl Classify for FailureKind {
    fn retriability(&self) -> Retriability {
        match self {
            Self::Timeout | Self::Conflict | Self::Throttled | Self::Unavailable | Self::Unknown => {
                Retriability::Retriable
            }
            Self::NotFound | Self::Unauthorized | Self::InvalidConfiguration | Self::Unsupported => {
                Retriability::NonRetriable
            }
        }
    }
}

impl Classify for BackendFailure {
    fn retriability(&self) -> Retriability {
        FailureKind::from_code(&self.code).retriability()
    }
}

impl Classify for StoreError {
    fn retriability(&self) -> Retriability {
        match self {
            Self::Conflict { .. }
            | Self::Timeout { .. }
            | Self::Throttled { .. }
            | Self::Unavailable { .. }
            | Self::NotFound { .. }
            | Self::AlreadyExists { .. } => Retriability::Retriable,
            Self::Forbidden { .. } | Self::Invalid { .. } => Retriability::NonRetriable,
        }
    }
}
