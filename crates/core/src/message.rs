//! Message and conversation context domain types.
//!
//! A [`ConversationContext`] is what the embedding application hands to the
//! orchestrator for one reply: the role-tagged history plus the opaque
//! forum identifiers, the acting user, and a cancellation handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::tool::ToolCall;

/// Unique identifier for a conversation, used for log correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of entry in a conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A forum user
    User,
    /// Text produced by the model
    Model,
    /// A tool invocation requested by the model
    ToolCall,
    /// The machine-readable result of a tool invocation
    ToolResult,
    /// A finalized reasoning segment (never shown as normal text)
    Thinking,
}

/// A single entry in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// What kind of entry this is
    pub role: Role,

    /// Text content; JSON for tool calls and tool results
    pub content: String,

    /// Username for user messages, tool name for tool calls/results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// For tool calls and results, the call this entry belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a user message attributed to a username.
    pub fn user_named(username: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::User, content);
        msg.name = Some(username.into());
        msg
    }

    /// Create a new model message.
    pub fn model(content: impl Into<String>) -> Self {
        Self::with_role(Role::Model, content)
    }

    /// Create a finalized thinking entry.
    pub fn thinking(content: impl Into<String>) -> Self {
        Self::with_role(Role::Thinking, content)
    }

    /// Record a finalized tool call; the arguments are stored as JSON.
    pub fn tool_call(call: &ToolCall) -> Self {
        let content = serde_json::Value::Object(call.arguments.clone()).to_string();
        let mut msg = Self::with_role(Role::ToolCall, content);
        msg.name = Some(call.name.clone());
        msg.tool_call_id = Some(call.id.clone());
        msg
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::with_role(Role::ToolResult, content);
        msg.name = Some(tool_name.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }
}

/// The user on whose behalf the bot acts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
    pub username: String,
}

/// Output formatting the reader expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Formatting {
    #[default]
    Markdown,
    PlainText,
}

/// Site-level values available to prompt placeholders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteInfo {
    pub url: String,
    pub title: String,
    pub description: String,
}

/// Everything the orchestrator needs to produce one reply.
///
/// Owned by the caller; the orchestrator appends the entries it produces
/// to `messages` while a reply runs.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub id: ConversationId,
    pub messages: Vec<Message>,
    pub post_id: Option<i64>,
    pub topic_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub user: Option<UserRef>,
    pub cancel: CancellationToken,
    /// Tag used for metering and telemetry.
    pub feature_name: String,
    pub user_language: Option<String>,
    pub formatting: Formatting,
    pub site: SiteInfo,
    pub participants: Vec<String>,
    /// Captured once so every placeholder in a reply sees the same clock.
    pub time: DateTime<Utc>,
}

impl ConversationContext {
    /// Create a context over the given history.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            id: ConversationId::new(),
            messages,
            post_id: None,
            topic_id: None,
            channel_id: None,
            user: None,
            cancel: CancellationToken::new(),
            feature_name: "bot".into(),
            user_language: None,
            formatting: Formatting::default(),
            site: SiteInfo::default(),
            participants: Vec::new(),
            time: Utc::now(),
        }
    }

    pub fn with_user(mut self, user: UserRef) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_topic(mut self, topic_id: i64, post_id: Option<i64>) -> Self {
        self.topic_id = Some(topic_id);
        self.post_id = post_id;
        self
    }

    pub fn with_feature_name(mut self, feature_name: impl Into<String>) -> Self {
        self.feature_name = feature_name.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_site(mut self, site: SiteInfo) -> Self {
        self.site = site;
        self
    }

    /// Number of user messages in the history.
    pub fn user_turns(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }

    /// The most recent user message, if any.
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}
