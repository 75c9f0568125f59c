//! # Agora Core
//!
//! Domain types, traits, and error definitions for the Agora conversational
//! agent runtime. This crate has **no runtime machinery of its own**: it
//! defines the model that the sandbox, the orchestrator, and the embedding
//! application implement against.
//!
//! ## Boundaries
//!
//! Every external collaborator is a trait here:
//! - [`LlmClient`]: streaming completions (text, thinking, tool-call deltas)
//! - [`ForumRepository`]: posts, topics, users and uploads
//! - [`Retriever`]: embedding + similarity search for persona guidance
//! - [`Tool`]: the contract every tool implements, resolved by name through
//!   the [`ToolRegistry`]

pub mod error;
pub mod event;
pub mod forum;
pub mod message;
pub mod persona;
pub mod provider;
pub mod quota;
pub mod retrieval;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ForumError, ProviderError, RetrievalError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use forum::{
    ForumAction, ForumRepository, NewPost, NewTopic, NewUpload, Post, SearchHit, Topic, Upload,
    User,
};
pub use message::{
    ConversationContext, ConversationId, Formatting, Message, Role, SiteInfo, UserRef,
};
pub use persona::{ExampleExchange, Persona};
pub use provider::{
    CompletionEvent, CompletionStream, GenerateOptions, LlmClient, Prompt, ToolChoice, Usage,
};
pub use quota::{ExecutionQuota, HostCapability, QuotaKind};
pub use retrieval::{Fragment, Retriever};
pub use tool::{
    ParameterType, ProgressReporter, Tool, ToolCall, ToolContext, ToolInstance, ToolOption,
    ToolOptionKind, ToolOutput, ToolParameter, ToolParams, ToolRegistry, ToolSignature,
    resolve_options,
};

pub use tokio_util::sync::CancellationToken;
