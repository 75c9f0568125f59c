//! LLM client boundary: the abstraction over streaming completion backends.
//!
//! A client receives a fully assembled [`Prompt`] and answers with a stream of
//! [`CompletionEvent`]s: text deltas, thinking segments and tool calls (partial
//! while their arguments are still arriving, then finalized once).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::Message;
use crate::tool::{ToolCall, ToolSignature};

/// A structured prompt: system instructions, history and offered tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prompt {
    /// System instructions (placeholders already substituted)
    pub system: String,

    /// Example exchanges followed by the live history
    pub messages: Vec<Message>,

    /// Tools the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSignature>,
}

impl Prompt {
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }
}

/// Which tool, if any, the model must call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides
    #[default]
    Auto,
    /// No tool calls allowed; the response is plain text
    None,
    /// The model must call this tool
    Tool(String),
}

/// Per-request generation options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub tool_choice: ToolChoice,

    /// JSON schema the response must follow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,

    /// Metering tag
    #[serde(default)]
    pub feature_name: String,

    /// Clients should stop streaming once this is cancelled.
    #[serde(skip)]
    pub cancel: CancellationToken,
}

/// Token usage information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A single event in a completion stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionEvent {
    /// Text delta, forwarded verbatim
    Text { text: String },

    /// Reasoning delta (`partial`) or a finalized reasoning segment
    Thinking { text: String, partial: bool },

    /// Tool call; `call.partial` marks arguments still streaming in
    ToolCall { call: ToolCall },

    /// Usage report, typically the last event
    Usage { usage: Usage },
}

impl CompletionEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self::ToolCall { call }
    }
}

/// Receiving half of a completion stream.
pub type CompletionStream = mpsc::Receiver<std::result::Result<CompletionEvent, ProviderError>>;

/// The LLM client trait.
///
/// Implementations own the wire protocol; this crate only consumes the
/// event stream. Upstream failures are returned, never retried here.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// A human-readable name for this client.
    fn name(&self) -> &str;

    /// Start a streaming completion.
    async fn generate(
        &self,
        prompt: Prompt,
        options: GenerateOptions,
    ) -> std::result::Result<CompletionStream, ProviderError>;

    /// Run a completion and concatenate its text deltas.
    ///
    /// Used for sub-completions requested by tools.
    async fn generate_text(
        &self,
        prompt: Prompt,
        options: GenerateOptions,
    ) -> std::result::Result<String, ProviderError> {
        let mut rx = self.generate(prompt, options).await?;
        let mut out = String::new();
        while let Some(event) = rx.recv().await {
            if let CompletionEvent::Text { text } = event? {
                out.push_str(&text);
            }
        }
        Ok(out)
    }
}
