//! Prompt assembly: persona template, guidance, examples and history.

pub mod assembler;
pub mod placeholders;
pub mod token;

pub use assembler::{AssembledPrompt, AssemblyMetadata, PromptAssembler, PromptBudget};
