//! Caller-facing output of a reply.
//!
//! [`ReplyUpdate`]s are pushed through the [`UpdateCallback`] while the
//! reply runs; [`ReplyEntry`]s are returned at the end and mirror exactly
//! what was streamed.

use std::sync::Arc;

use agora_core::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incremental output, tagged by kind:
/// - `text`          : a text delta from the model
/// - `thinking`      : a thinking delta, never shown as normal text
/// - `tool_started`  : a finalized tool call is about to run
/// - `tool_progress` : a partial render or progress line from a tool
/// - `tool_finished` : a tool returned; carries its human-visible output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyUpdate {
    Text {
        text: String,
    },

    Thinking {
        text: String,
        partial: bool,
    },

    ToolStarted {
        call_id: String,
        tool_name: String,
        placeholder: String,
    },

    ToolProgress {
        call_id: String,
        tool_name: String,
        text: String,
    },

    ToolFinished {
        call_id: String,
        tool_name: String,
        success: bool,
        /// The tool's `custom_raw` rendering, if any
        rendered: Option<String>,
    },
}

impl ReplyUpdate {
    /// Tag naming the kind of update.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Thinking { .. } => "thinking",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolProgress { .. } => "tool_progress",
            Self::ToolFinished { .. } => "tool_finished",
        }
    }

    /// The text carried by the update, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::Thinking { text, .. } | Self::ToolProgress { text, .. } => {
                Some(text)
            }
            Self::ToolFinished { rendered, .. } => rendered.as_deref(),
            Self::ToolStarted { .. } => None,
        }
    }

    /// The rendered placeholder for a starting tool.
    pub fn placeholder(&self) -> Option<&str> {
        match self {
            Self::ToolStarted { placeholder, .. } => Some(placeholder),
            _ => None,
        }
    }
}

/// Receives updates. Must hand off quickly; it runs on the reply task.
pub type UpdateCallback = Arc<dyn Fn(ReplyUpdate) + Send + Sync>;

/// A callback that discards every update.
pub fn noop_callback() -> UpdateCallback {
    Arc::new(|_| {})
}

/// Placeholder streamed while a tool runs.
pub(crate) fn tool_placeholder(call: &ToolCall) -> String {
    format!("[{}]", call.name)
}

/// One item of a finished reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyEntry {
    Text {
        text: String,
    },

    Thinking {
        text: String,
    },

    ToolCall {
        call: ToolCall,
    },

    ToolResult {
        call_id: String,
        tool_name: String,
        result: Value,
        custom_raw: Option<String>,
    },

    /// The reply stopped because the conversation was cancelled.
    Cancelled,
}

impl ReplyEntry {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
