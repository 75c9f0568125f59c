//! Token estimation.
//!
//! Character heuristic: ~4 characters per token, rounded up.

use agora_core::{Message, ToolSignature};

/// Per-message overhead for role and delimiters.
const MESSAGE_OVERHEAD: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    MESSAGE_OVERHEAD + estimate_tokens(&message.content)
}

pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Tokens taken by a tool signature rendered as JSON schema.
pub fn estimate_signature_tokens(signature: &ToolSignature) -> usize {
    estimate_tokens(&signature.json_schema().to_string())
}
