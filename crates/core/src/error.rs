//! Error types for the Agora domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each boundary has its own error enum; [`Error`] is the union the
//! orchestrator surfaces to its caller.

use crate::quota::QuotaKind;
use thiserror::Error;

/// The top-level error type for all Agora operations.
///
/// Tool failures never appear here: they are fed back to the model as
/// tool results.
#[derive(Debug, Error)]
pub enum Error {
    /// Upstream LLM failure, never retried here.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Conversation context has no messages")]
    EmptyConversation,
}

// --- Boundary errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms of script time")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Quota exceeded in {tool_name}: {quota} ({detail})")]
    QuotaExceeded {
        tool_name: String,
        quota: QuotaKind,
        detail: String,
    },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool invocation cancelled: {tool_name}")]
    Cancelled { tool_name: String },
}

#[derive(Debug, Clone, Error)]
pub enum ForumError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Similarity search failed: {0}")]
    SearchFailed(String),
}
