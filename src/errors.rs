// Error types shared across the core
//
// Library-level failures are typed enums; application glue (config loading,
// tool executors) uses anyhow like the rest of the crate.

use thiserror::Error;

use crate::toolcall::ToolCallState;

/// A rejected tool call state transition.
///
/// Returned on every illegal call so that correct call sequences can assert
/// they never see one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The call already reached a terminal state; nothing may leave it.
    #[error("tool call {id} is already terminal ({state})")]
    AlreadyTerminal { id: String, state: ToolCallState },

    /// The call is live but the requested edge does not exist.
    #[error("tool call {id}: invalid transition {from} -> {to}")]
    Invalid {
        id: String,
        from: ToolCallState,
        to: ToolCallState,
    },
}

impl TransitionError {
    /// True when the loser of a race hit an already-finished call.
    pub fn is_already_terminal(&self) -> bool {
        matches!(self, TransitionError::AlreadyTerminal { .. })
    }
}

/// Structured error reported by an LLM provider or a tool transport.
///
/// Carrying the HTTP status lets the scheduler classify without parsing
/// message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", display_provider_error(.status, .message))]
pub struct ProviderError {
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

fn display_provider_error(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("provider error ({}): {}", code, message),
        None => format!("provider error: {}", message),
    }
}

/// Failures that originate before a tool ever runs. Never worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Tool '{0}' not found")]
    NotFound(String),

    #[error("invalid input for tool '{tool}': {reason}")]
    InvalidInput { tool: String, reason: String },
}

/// Errors surfaced by a single agent turn.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The provider stream reported an error before completing.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A transition the loop relies on was rejected.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// A tool use block could not be assembled from the stream.
    #[error("malformed tool use {id}: {reason}")]
    MalformedToolUse { id: String, reason: String },

    /// The provider stream ended without a completion event.
    #[error("provider stream ended before completion")]
    StreamEnded,

    /// No active tool call has this id.
    #[error("no active tool call with id {id}")]
    UnknownToolCall { id: String },
}
