//! Error types for clinhub.

use thiserror::Error;

use crate::event::EnvelopeError;
use crate::subsystem::Subsystem;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in clinhub operations.
///
/// Only permanent validation failures ([`Error::MalformedEnvelope`],
/// [`Error::UnknownIdentity`]) are meant to reach an ingesting caller.
/// Rejected transitions, exhausted deliveries and timeouts are recorded
/// outcomes, not errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The inbound envelope failed shape validation. Nothing was persisted.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] EnvelopeError),

    /// No canonical identity is mapped to the local identifier and
    /// auto-provisioning is disabled.
    #[error("unknown identity: {subsystem}/{local_id}")]
    UnknownIdentity {
        /// The subsystem that owns the local identifier.
        subsystem: Subsystem,
        /// The subsystem-local patient identifier.
        local_id: String,
    },

    /// A canonical identity id that does not exist.
    #[error("unknown canonical identity: {0}")]
    UnknownCanonicalIdentity(String),

    /// A local identifier is already mapped to a different canonical identity.
    #[error("local identifier {subsystem}/{local_id} is already linked to {existing}")]
    IdentityConflict {
        subsystem: Subsystem,
        local_id: String,
        existing: String,
    },

    /// A merge kept losing optimistic version checks.
    #[error("merge of {left} and {right} conflicted after {attempts} attempts")]
    MergeConflict {
        left: String,
        right: String,
        attempts: u32,
    },

    /// A supersede chain did not terminate.
    #[error("supersede chain starting at {0} is too long")]
    SupersedeChainTooLong(String),

    /// Failed to serialize or deserialize stored data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to deserialize a workflow event during replay.
    ///
    /// Includes the workflow type, the instance id and the event's
    /// 0-indexed position in the instance history.
    #[error(
        "failed to deserialize event at sequence {sequence} for {workflow_type}:{workflow_id}: {source}"
    )]
    EventDeserialization {
        workflow_type: &'static str,
        workflow_id: String,
        sequence: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Workflow type was not registered.
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Workflow type was registered more than once.
    #[error("duplicate workflow type registration: {0}")]
    DuplicateWorkflowType(String),

    /// The workflow type does not support operator cancellation.
    #[error("workflow type {0} does not accept cancellation requests")]
    CancellationUnsupported(String),

    /// A queried record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// An outbound transport or sink could not be constructed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The dispatcher is no longer accepting events (runtime shut down).
    #[error("dispatcher is closed")]
    DispatcherClosed,

    /// A shard queue is full and no shard task is draining it yet.
    #[error("dispatch shard {shard} is full")]
    DispatcherFull { shard: usize },

    /// PostgreSQL storage error.
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Failed to apply database migrations.
    #[cfg(feature = "postgres")]
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Stored data could not be mapped back into domain types.
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

impl Error {
    /// Create an event deserialization error with context.
    pub fn event_deserialization(
        workflow_type: &'static str,
        workflow_id: impl Into<String>,
        sequence: usize,
        source: serde_json::Error,
    ) -> Self {
        Error::EventDeserialization {
            workflow_type,
            workflow_id: workflow_id.into(),
            sequence,
            source,
        }
    }

    /// Create a not-found error.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable reason code, returned to ingesting callers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::MalformedEnvelope(_) => "malformed_envelope",
            Error::UnknownIdentity { .. } | Error::UnknownCanonicalIdentity(_) => {
                "unknown_identity"
            }
            Error::IdentityConflict { .. } => "identity_conflict",
            Error::MergeConflict { .. } => "merge_conflict",
            Error::UnknownWorkflowType(_) => "unknown_workflow_type",
            Error::CancellationUnsupported(_) => "cancellation_unsupported",
            Error::NotFound { .. } => "not_found",
            Error::DispatcherClosed => "unavailable",
            Error::DispatcherFull { .. } => "dispatcher_full",
            _ => "internal",
        }
    }

    /// Returns `true` for permanent validation failures that a caller must fix.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::MalformedEnvelope(_) | Error::UnknownIdentity { .. }
        )
    }
}
