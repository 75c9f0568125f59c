//! Prompt assembly.
//!
//! Builds the [`Prompt`] for one completion from four parts, in order:
//!
//! 1. **System**: the persona template with placeholders substituted, plus
//!    a formatting note when the caller wants plain text
//! 2. **Guidance**: retrieved reference fragments, within their own budget
//! 3. **Examples**: the persona's example exchanges, always included
//! 4. **History**: the conversation, oldest messages dropped first to fit
//!    `max_prompt_tokens`; the newest message is always kept
//!
//! [`PromptAssembler::assemble`] is pure. Retrieval happens separately in
//! [`PromptAssembler::guidance`] so its failures never block a reply.

use std::sync::Arc;

use agora_config::PromptConfig;
use agora_core::{
    ConversationContext, Formatting, Fragment, Message, Persona, Prompt, RetrievalError,
    Retriever, ToolSignature,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::prompt::placeholders;
use crate::prompt::token;

/// Token limits applied during assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptBudget {
    pub max_prompt_tokens: usize,
    pub guidance_fragment_limit: usize,
    pub guidance_token_budget: usize,
}

impl Default for PromptBudget {
    fn default() -> Self {
        Self::from(&PromptConfig::default())
    }
}

impl From<&PromptConfig> for PromptBudget {
    fn from(config: &PromptConfig) -> Self {
        Self {
            max_prompt_tokens: config.max_prompt_tokens,
            guidance_fragment_limit: config.guidance_fragment_limit,
            guidance_token_budget: config.guidance_token_budget,
        }
    }
}

/// What assembly kept and dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    pub system_tokens: usize,
    pub tool_tokens: usize,
    pub history_tokens: usize,
    pub guidance_fragments: usize,
    pub dropped_fragments: usize,
    pub dropped_messages: usize,
}

/// An assembled prompt ready for the LLM client.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub prompt: Prompt,
    pub metadata: AssemblyMetadata,
}

const PLAIN_TEXT_NOTE: &str = "Reply in plain text. Do not use Markdown formatting.";

/// Stateless prompt builder; create one and reuse it.
#[derive(Clone, Default)]
pub struct PromptAssembler {
    budget: PromptBudget,
    retriever: Option<Arc<dyn Retriever>>,
}

impl std::fmt::Debug for PromptAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptAssembler")
            .field("budget", &self.budget)
            .field("retriever", &self.retriever.is_some())
            .finish()
    }
}

impl PromptAssembler {
    pub fn new(budget: PromptBudget) -> Self {
        Self {
            budget,
            retriever: None,
        }
    }

    /// Attach the similarity search used for guidance.
    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_budget(mut self, budget: PromptBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> PromptBudget {
        self.budget
    }

    /// Retrieve guidance fragments for the last user message.
    ///
    /// Returns nothing when the persona has no reference documents, no
    /// retriever is attached, or retrieval fails (logged).
    pub async fn guidance(&self, persona: &Persona, ctx: &ConversationContext) -> Vec<Fragment> {
        let Some(retriever) = &self.retriever else {
            return Vec::new();
        };
        if persona.reference_documents.is_empty() || self.budget.guidance_fragment_limit == 0 {
            return Vec::new();
        }
        let Some(query) = ctx.last_user_message() else {
            return Vec::new();
        };

        match self.retrieve(retriever.as_ref(), persona, &query.content).await {
            Ok(fragments) => {
                debug!(persona = %persona.name, fragments = fragments.len(), "Retrieved guidance");
                fragments
            }
            Err(e) => {
                warn!(persona = %persona.name, error = %e, "Guidance retrieval failed, continuing without it");
                Vec::new()
            }
        }
    }

    async fn retrieve(
        &self,
        retriever: &dyn Retriever,
        persona: &Persona,
        query: &str,
    ) -> Result<Vec<Fragment>, RetrievalError> {
        let vector = retriever.embed(query).await?;
        let ids = retriever
            .search(
                &vector,
                &persona.reference_documents,
                self.budget.guidance_fragment_limit,
            )
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        retriever.fragments(&ids).await
    }

    /// Retrieve guidance, then assemble.
    pub async fn build(
        &self,
        persona: &Persona,
        ctx: &ConversationContext,
        tools: Vec<ToolSignature>,
    ) -> AssembledPrompt {
        let guidance = self.guidance(persona, ctx).await;
        self.assemble(persona, ctx, tools, &guidance)
    }

    /// Assemble a prompt. Pure: the same inputs always give the same prompt.
    pub fn assemble(
        &self,
        persona: &Persona,
        ctx: &ConversationContext,
        tools: Vec<ToolSignature>,
        guidance: &[Fragment],
    ) -> AssembledPrompt {
        let mut metadata = AssemblyMetadata::default();

        let mut sections = vec![placeholders::substitute(&persona.system_prompt, ctx).into_owned()];
        if ctx.formatting == Formatting::PlainText {
            sections.push(PLAIN_TEXT_NOTE.to_string());
        }
        let (guidance_block, included, dropped) = self.render_guidance(guidance);
        metadata.guidance_fragments = included;
        metadata.dropped_fragments = dropped;
        if let Some(block) = guidance_block {
            sections.push(block);
        }
        let system = sections.join("\n\n");
        metadata.system_tokens = token::estimate_tokens(&system);
        metadata.tool_tokens = tools.iter().map(token::estimate_signature_tokens).sum();

        let examples: Vec<Message> = persona
            .examples
            .iter()
            .flat_map(|ex| [Message::user(&ex.user), Message::model(&ex.model)])
            .collect();
        let reserved =
            metadata.system_tokens + metadata.tool_tokens + token::estimate_messages_tokens(&examples);
        let available = self.budget.max_prompt_tokens.saturating_sub(reserved);

        let (history, history_tokens, dropped) = Self::trim_history(&ctx.messages, available);
        metadata.history_tokens = history_tokens;
        metadata.dropped_messages = dropped;
        if dropped > 0 {
            debug!(
                conversation_id = %ctx.id,
                dropped,
                kept = history.len(),
                "Trimmed conversation history to fit the prompt budget"
            );
        }

        let mut messages = examples;
        messages.extend(history);

        AssembledPrompt {
            prompt: Prompt {
                system,
                messages,
                tools,
            },
            metadata,
        }
    }

    /// Render the `<guidance>` block, most relevant fragments first.
    fn render_guidance(&self, fragments: &[Fragment]) -> (Option<String>, usize, usize) {
        if fragments.is_empty() {
            return (None, 0, 0);
        }
        let open = "<guidance>\n";
        let close = "</guidance>";
        let mut used = token::estimate_tokens(open) + token::estimate_tokens(close);
        let mut lines = Vec::new();

        for fragment in fragments.iter().take(self.budget.guidance_fragment_limit) {
            let line = format!("[{}] {}\n", fragment.document, fragment.content.trim());
            let cost = token::estimate_tokens(&line);
            if used + cost > self.budget.guidance_token_budget {
                break;
            }
            used += cost;
            lines.push(line);
        }

        let included = lines.len();
        let dropped = fragments.len() - included;
        if lines.is_empty() {
            return (None, 0, dropped);
        }
        (Some(format!("{open}{}{close}", lines.concat())), included, dropped)
    }

    /// Keep the newest messages that fit in `budget` tokens.
    ///
    /// Stops at the first message that does not fit, so the kept history is
    /// always a contiguous suffix. The newest message is kept regardless.
    fn trim_history(messages: &[Message], budget: usize) -> (Vec<Message>, usize, usize) {
        let mut used = 0;
        let mut keep = 0;
        for (i, message) in messages.iter().rev().enumerate() {
            let cost = token::estimate_message_tokens(message);
            if i > 0 && used + cost > budget {
                break;
            }
            used += cost;
            keep += 1;
        }
        let start = messages.len() - keep;
        (messages[start..].to_vec(), used, start)
    }
}
