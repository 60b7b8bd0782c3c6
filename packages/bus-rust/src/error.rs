//! Error types shared across the dispatch pipeline.

use courier_core::{CodecError, CorrelationId};

use crate::saga::store::{StoreError, VersionToken};
use crate::transport::TransportError;

/// Failure while building the filter chain for a message type.
///
/// Never cached by the dispatcher: the next dispatch of the same type retries
/// construction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainBuildError {
    #[error("no consumer is configured for message type {message_type}")]
    NoConsumer { message_type: String },
    #[error("message type {message_type} already has consumer {existing}")]
    DuplicateConsumer {
        message_type: String,
        existing: String,
    },
    #[error("stage {stage} failed to build for {message_type}: {reason}")]
    Stage {
        stage: &'static str,
        message_type: String,
        reason: String,
    },
}

/// Errors returned by a dispatch through the filter chain.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("message type {message_type} is not registered with this dispatcher")]
    UnregisteredMessageType { message_type: String },
    #[error(transparent)]
    ChainBuild(#[from] ChainBuildError),
    #[error("saga {saga}: {matches} instances matched the correlation of {message_type}")]
    AmbiguousCorrelation {
        saga: String,
        message_type: String,
        matches: usize,
    },
    #[error("{message_type} carries no correlation id")]
    MissingCorrelationId { message_type: String },
    #[error("saga {saga}: no instance found for {message_type}")]
    NoInstanceFound { saga: String, message_type: String },
    #[error("saga {saga}: event {event} is not handled in state {state}")]
    UnhandledEvent {
        saga: String,
        event: String,
        state: String,
    },
    #[error("saga instance {correlation_id} was modified concurrently (expected version {expected})")]
    Conflict {
        correlation_id: CorrelationId,
        expected: VersionToken,
    },
    #[error("row lock for {correlation_id} not acquired within {timeout_ms}ms")]
    LockUnavailable {
        correlation_id: CorrelationId,
        timeout_ms: u64,
    },
    #[error("dispatch timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("endpoint overloaded, try again later")]
    Overloaded,
    #[error("dispatch cancelled")]
    Cancelled,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("handler failed: {0}")]
    Handler(#[from] anyhow::Error),
}

impl DispatchError {
    /// Whether the failure is worth retrying: a lost optimistic race, a row lock
    /// that could not be taken in time, or a saturated endpoint.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::LockUnavailable { .. } | Self::Overloaded
        )
    }

    /// Short machine-friendly label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnregisteredMessageType { .. } => "unregistered_message_type",
            Self::ChainBuild(_) => "chain_build",
            Self::AmbiguousCorrelation { .. } => "ambiguous_correlation",
            Self::MissingCorrelationId { .. } => "missing_correlation_id",
            Self::NoInstanceFound { .. } => "no_instance_found",
            Self::UnhandledEvent { .. } => "unhandled_event",
            Self::Conflict { .. } => "conflict",
            Self::LockUnavailable { .. } => "lock_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Overloaded => "overloaded",
            Self::Cancelled => "cancelled",
            Self::Codec(_) => "codec",
            Self::Store(_) => "store",
            Self::Transport(_) => "transport",
            Self::Handler(_) => "handler",
        }
    }
}
