//! The conversation orchestrator.
//!
//! A [`Bot`] answers one conversation turn at a time:
//!
//! 1. **Assemble** the prompt from the persona and conversation context
//! 2. **Request** a streaming completion, forcing a tool when the persona
//!    requires one
//! 3. **Stream** text and thinking deltas to the caller as they arrive
//! 4. **Execute** finalized tool calls in order and append their results
//! 5. **Chain** another completion while tools ran and all of them asked
//!    for one, up to the completion limit
//!
//! The loop stops early, keeping what was already produced, when the
//! conversation's cancellation token fires.

pub mod bot;
pub mod chain;
pub mod prompt;
pub mod update;

#[cfg(test)]
mod test_helpers;

pub use bot::Bot;
pub use chain::ChainState;
pub use prompt::{AssembledPrompt, AssemblyMetadata, PromptAssembler, PromptBudget};
pub use update::{ReplyEntry, ReplyUpdate, UpdateCallback, noop_callback};
