//! Structured error taxonomy for the coordination core.
//!
//! Every collaborator boundary (retriever, workflow agent, LLM) translates its
//! failure into one of these variants rather than leaking its own error type
//! across the core.

use thiserror::Error;

/// Node-failure error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Timeout,
    NetworkError,
    RateLimited,
    ResourceExhausted,
    ValidationFailed,
    PermissionDenied,
    InternalError,
    DependencyFailed,
    DataMissing,
}

impl ErrorCode {
    /// Fixed retryable classification: timeouts and transient network/rate/
    /// resource errors are retryable, everything else is not.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout
                | ErrorCode::NetworkError
                | ErrorCode::RateLimited
                | ErrorCode::ResourceExhausted
        )
    }

    /// VALIDATION and PERMISSION require user intervention.
    pub fn requires_user_intervention(self) -> bool {
        matches!(self, ErrorCode::ValidationFailed | ErrorCode::PermissionDenied)
    }
}

/// Conversation-agent error-recovery taxonomy. Distinct from
/// [`ErrorCode`] — this classifies *why the conversation loop should recover*,
/// not why a workflow node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryErrorKind {
    Timeout,
    ApiFailure,
    RateLimited,
    DataMissing,
    ValidationError,
    PermissionDenied,
    ResourceExhausted,
    Unknown,
}

impl RecoveryErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RecoveryErrorKind::Timeout | RecoveryErrorKind::ApiFailure | RecoveryErrorKind::RateLimited
        )
    }

    pub fn requires_user_intervention(self) -> bool {
        matches!(
            self,
            RecoveryErrorKind::DataMissing
                | RecoveryErrorKind::ValidationError
                | RecoveryErrorKind::PermissionDenied
                | RecoveryErrorKind::Unknown
        )
    }
}

/// Raised by the Coordinator Policy Chain when a supervised decision fails
/// validation, or when fail-closed triggers because no coordinator/bus is
/// configured.
#[derive(Debug, Error, Clone)]
#[error("coordinator rejected decision {decision_type} (correlation_id={correlation_id}): {}", .errors.join("; "))]
pub struct CoordinatorRejected {
    pub decision_type: String,
    pub correlation_id: String,
    pub original_decision_id: String,
    pub errors: Vec<String>,
}

/// Raised by the Conversation-agent state machine on an illegal transition.
/// Never caught internally — bubbles to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid state transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: crate::conversation_state::ConversationAgentState,
    pub to: crate::conversation_state::ConversationAgentState,
}

/// Errors surfaced by the Snapshot Manager / Coordinator state queries.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error(transparent)]
    CoordinatorRejected(#[from] CoordinatorRejected),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("collaborator failure: {0}")]
    Collaborator(String),
}
