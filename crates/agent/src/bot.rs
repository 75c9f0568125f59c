//! The Conversation Orchestrator.
//!
//! [`Bot::reply`] drives one reply: assemble the prompt, request a streaming
//! completion, forward deltas to the caller, run finalized tool calls and
//! feed their results back, then decide whether to request another
//! completion. Tool calls within a completion run sequentially in the
//! order they were finalized.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use agora_config::AppConfig;
use agora_core::{
    CompletionEvent, CompletionStream, ConversationContext, DomainEvent, Error, EventBus,
    ForumRepository, GenerateOptions, LlmClient, Message, Persona, ProgressReporter, Prompt,
    Retriever, ToolCall, ToolChoice, ToolContext, ToolInstance, ToolRegistry,
};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::chain::ChainState;
use crate::prompt::{PromptAssembler, PromptBudget};
use crate::update::{ReplyEntry, ReplyUpdate, UpdateCallback, tool_placeholder};

/// A persona bound to an LLM and a tool registry.
///
/// A `Bot` holds no per-conversation state, so one instance can serve
/// any number of concurrent replies.
pub struct Bot {
    /// Default LLM for completions and for tools without an LLM reference
    llm: Arc<dyn LlmClient>,

    /// Named LLMs selectable through llm-reference tool options
    llms: HashMap<String, Arc<dyn LlmClient>>,

    tools: Arc<ToolRegistry>,
    persona: Persona,
    assembler: PromptAssembler,
    forum: Option<Arc<dyn ForumRepository>>,
    event_bus: Option<Arc<EventBus>>,

    /// Completion requests allowed per reply
    max_completions: u32,

    /// Finalized tool calls executed per completion; the rest are dropped
    max_tools_per_completion: u32,

    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
}

/// What one completion did, used to decide whether to chain.
struct CompletionOutcome {
    tools_invoked: u32,
    chain: bool,
    cancelled: bool,
}

/// Mutable state of one running reply.
struct ReplyRun<'a> {
    ctx: &'a mut ConversationContext,
    prompt: Prompt,
    chain: ChainState,
    entries: Vec<ReplyEntry>,
    on_update: UpdateCallback,
    offered: HashSet<String>,
    tool_ctx: ToolContext,
    text: String,
    thinking: String,
}

impl ReplyRun<'_> {
    fn emit(&self, update: ReplyUpdate) {
        (self.on_update)(update);
    }

    /// Record a produced message in both the conversation and the live prompt.
    fn append(&mut self, message: Message) {
        self.prompt.push(message.clone());
        self.ctx.push(message);
    }

    fn flush_text(&mut self) {
        if self.text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text);
        self.append(Message::model(&text));
        self.entries.push(ReplyEntry::Text { text });
    }

    /// Close the current reasoning segment. A non-empty `segment` is the
    /// complete text and replaces the buffered deltas.
    fn finish_thinking(&mut self, segment: String) {
        let buffered = std::mem::take(&mut self.thinking);
        let text = if segment.is_empty() { buffered } else { segment };
        if text.is_empty() {
            return;
        }
        self.flush_text();
        self.emit(ReplyUpdate::Thinking {
            text: text.clone(),
            partial: false,
        });
        self.append(Message::thinking(&text));
        self.entries.push(ReplyEntry::Thinking { text });
    }

    /// Record whatever text and reasoning this completion streamed so far.
    fn flush_pending(&mut self) {
        self.flush_text();
        if !self.thinking.is_empty() {
            self.finish_thinking(String::new());
        }
    }
}

impl Bot {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>, persona: Persona) -> Self {
        Self {
            llm,
            llms: HashMap::new(),
            tools,
            persona,
            assembler: PromptAssembler::default(),
            forum: None,
            event_bus: None,
            max_completions: 5,
            max_tools_per_completion: 5,
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }

    /// Apply sampling, chaining and prompt limits from configuration.
    pub fn with_config(mut self, config: &AppConfig) -> Self {
        self.temperature = Some(config.llm.temperature);
        self.top_p = config.llm.top_p;
        self.max_tokens = config.llm.max_tokens;
        self.max_completions = config.bot.max_completions.max(1);
        self.max_tools_per_completion = config.bot.max_tools_per_completion;
        self.assembler = self
            .assembler
            .with_budget(PromptBudget::from(&config.prompt));
        self
    }

    /// Register a named LLM for tools with an llm-reference option.
    pub fn with_llm(mut self, name: impl Into<String>, llm: Arc<dyn LlmClient>) -> Self {
        self.llms.insert(name.into(), llm);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.assembler = self.assembler.with_retriever(retriever);
        self
    }

    pub fn with_forum(mut self, forum: Arc<dyn ForumRepository>) -> Self {
        self.forum = Some(forum);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_max_completions(mut self, max: u32) -> Self {
        self.max_completions = max.max(1);
        self
    }

    pub fn with_max_tools_per_completion(mut self, max: u32) -> Self {
        self.max_tools_per_completion = max;
        self
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Produce a reply to the conversation.
    ///
    /// Produced messages are appended to `ctx`. Every entry in the returned
    /// list was streamed through `on_update` first. Cancellation is not an
    /// error: the entries end with [`ReplyEntry::Cancelled`]. Upstream LLM
    /// failures are returned as [`Error::Provider`] and never retried here.
    pub async fn reply(
        &self,
        ctx: &mut ConversationContext,
        on_update: UpdateCallback,
    ) -> Result<Vec<ReplyEntry>, Error> {
        if ctx.messages.is_empty() {
            return Err(Error::EmptyConversation);
        }

        let signatures = self.tools.signatures_for(&self.persona.tools);
        let offered: HashSet<String> = signatures.iter().map(|s| s.name.clone()).collect();
        let assembled = self.assembler.build(&self.persona, ctx, signatures).await;
        let chain = ChainState::new(&self.persona, ctx.user_turns(), &offered);

        info!(
            conversation_id = %ctx.id,
            persona = %self.persona.name,
            feature = %ctx.feature_name,
            messages = ctx.messages.len(),
            tools = offered.len(),
            dropped_messages = assembled.metadata.dropped_messages,
            "Starting reply"
        );

        let tool_ctx = self.tool_context(ctx);
        let mut run = ReplyRun {
            ctx,
            prompt: assembled.prompt,
            chain,
            entries: Vec::new(),
            on_update,
            offered,
            tool_ctx,
            text: String::new(),
            thinking: String::new(),
        };

        let cancelled = loop {
            if run.ctx.cancel.is_cancelled() {
                break true;
            }

            let tool_choice = run.chain.next_tool_choice(self.max_completions);
            let completion = run.chain.completions() + 1;
            debug!(
                conversation_id = %run.ctx.id,
                completion,
                tool_choice = ?tool_choice,
                "Requesting completion"
            );
            self.publish(DomainEvent::CompletionRequested {
                feature_name: run.ctx.feature_name.clone(),
                conversation_id: run.ctx.id.to_string(),
                completion,
                tool_choice: tool_choice.clone(),
                timestamp: Utc::now(),
            });

            let options = self.generate_options(run.ctx, tool_choice.clone());
            let stream = self.llm.generate(run.prompt.clone(), options).await?;
            run.chain.record_completion();

            let outcome = self.run_completion(&mut run, stream, &tool_choice).await?;
            if outcome.cancelled {
                break true;
            }
            if outcome.tools_invoked == 0 || !outcome.chain {
                break false;
            }
            if run.chain.completions() >= self.max_completions {
                break false;
            }
        };

        if cancelled {
            info!(conversation_id = %run.ctx.id, "Reply cancelled");
            run.entries.push(ReplyEntry::Cancelled);
        }

        self.publish(DomainEvent::ReplyFinished {
            feature_name: run.ctx.feature_name.clone(),
            conversation_id: run.ctx.id.to_string(),
            completions: run.chain.completions(),
            tools_executed: run.chain.tools_executed(),
            cancelled,
            timestamp: Utc::now(),
        });
        info!(
            conversation_id = %run.ctx.id,
            completions = run.chain.completions(),
            tools_executed = run.chain.tools_executed(),
            entries = run.entries.len(),
            "Reply finished"
        );

        Ok(run.entries)
    }

    /// Consume one completion stream.
    async fn run_completion(
        &self,
        run: &mut ReplyRun<'_>,
        mut stream: CompletionStream,
        tool_choice: &ToolChoice,
    ) -> Result<CompletionOutcome, Error> {
        let cancel = run.ctx.cancel.clone();
        let mut outcome = CompletionOutcome {
            tools_invoked: 0,
            chain: true,
            cancelled: false,
        };
        let mut accepted = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = stream.recv() => Some(event),
            };
            let Some(event) = next else {
                outcome.cancelled = true;
                break;
            };
            let Some(event) = event else {
                break;
            };

            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    // Already streamed to the caller; keep it in the history.
                    run.flush_pending();
                    warn!(conversation_id = %run.ctx.id, error = %e, "Completion stream failed");
                    return Err(e.into());
                }
            };

            match event {
                CompletionEvent::Text { text } => {
                    run.emit(ReplyUpdate::Text { text: text.clone() });
                    run.text.push_str(&text);
                }
                CompletionEvent::Thinking {
                    text,
                    partial: true,
                } => {
                    run.emit(ReplyUpdate::Thinking {
                        text: text.clone(),
                        partial: true,
                    });
                    run.thinking.push_str(&text);
                }
                CompletionEvent::Thinking {
                    text,
                    partial: false,
                } => run.finish_thinking(text),
                CompletionEvent::ToolCall { call } if call.partial => {
                    if *tool_choice != ToolChoice::None {
                        self.render_partial(run, &call).await;
                    }
                }
                CompletionEvent::ToolCall { call } => {
                    let Some(chain) = self.execute_call(run, call, tool_choice, &mut accepted).await
                    else {
                        continue;
                    };
                    outcome.tools_invoked += 1;
                    outcome.chain &= chain;
                    // The in-flight tool finished; nothing else starts.
                    if cancel.is_cancelled() {
                        outcome.cancelled = true;
                        break;
                    }
                }
                CompletionEvent::Usage { usage } => {
                    debug!(
                        conversation_id = %run.ctx.id,
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        "Completion usage"
                    );
                }
            }
        }

        run.flush_pending();
        Ok(outcome)
    }

    /// Render progress for a call whose arguments are still arriving.
    async fn render_partial(&self, run: &ReplyRun<'_>, call: &ToolCall) {
        if !run.offered.contains(&call.name) {
            return;
        }
        let instance = match self.tools.resolve(
            call,
            &run.tool_ctx,
            self.persona.tool_options_for(&call.name),
        ) {
            Ok(instance) => instance,
            Err(e) => {
                debug!(tool = %call.name, call_id = %call.id, error = %e, "Partial call not renderable");
                return;
            }
        };
        if let Some(text) = instance.render_partial().await {
            run.emit(ReplyUpdate::ToolProgress {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                text,
            });
        }
    }

    /// Resolve and run a finalized call.
    ///
    /// Returns the tool's chain decision, or `None` when the call was
    /// dropped without running.
    async fn execute_call(
        &self,
        run: &mut ReplyRun<'_>,
        call: ToolCall,
        tool_choice: &ToolChoice,
        accepted: &mut u32,
    ) -> Option<bool> {
        if *tool_choice == ToolChoice::None {
            self.drop_call(run, &call, "tool calls are disabled for the final completion");
            return None;
        }
        if !run.chain.try_resolve(&call) {
            debug!(tool = %call.name, call_id = %call.id, "Duplicate tool call ignored");
            return None;
        }
        if !run.offered.contains(&call.name) {
            self.drop_call(run, &call, "unknown tool");
            return None;
        }
        if *accepted >= self.max_tools_per_completion {
            self.drop_call(run, &call, "too many tool calls in one completion");
            return None;
        }
        *accepted += 1;

        run.flush_text();
        run.emit(ReplyUpdate::ToolStarted {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            placeholder: tool_placeholder(&call),
        });
        run.append(Message::tool_call(&call));
        run.entries.push(ReplyEntry::ToolCall { call: call.clone() });

        let started = Instant::now();
        let resolved = self.tools.resolve(
            &call,
            &run.tool_ctx,
            self.persona.tool_options_for(&call.name),
        );
        let (outcome, custom_raw, chain) = match resolved {
            Ok(mut instance) => {
                self.bind_llm(&mut instance);
                let on_update = run.on_update.clone();
                let (call_id, tool_name) = (call.id.clone(), call.name.clone());
                instance.set_progress(ProgressReporter::new(move |text| {
                    on_update(ReplyUpdate::ToolProgress {
                        call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                        text,
                    })
                }));
                match instance.invoke().await {
                    Ok(result) => (
                        Ok(result),
                        instance.custom_raw().map(str::to_string),
                        instance.chain_next_response(),
                    ),
                    Err(e) => (Err(e), None, true),
                }
            }
            Err(e) => (Err(e), None, true),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let success = outcome.is_ok();
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool failed");
                json!({ "error": e.to_string() })
            }
        };
        debug!(tool = %call.name, call_id = %call.id, success, duration_ms, chain, "Tool finished");

        run.chain.record_tool(&call.name);
        run.append(Message::tool_result(
            &call.id,
            &call.name,
            result_content(&result),
        ));
        run.entries.push(ReplyEntry::ToolResult {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result,
            custom_raw: custom_raw.clone(),
        });
        run.emit(ReplyUpdate::ToolFinished {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success,
            rendered: custom_raw,
        });
        self.publish(DomainEvent::ToolExecuted {
            feature_name: run.ctx.feature_name.clone(),
            tool_name: call.name,
            call_id: call.id,
            success,
            duration_ms,
            timestamp: Utc::now(),
        });

        Some(chain)
    }

    fn drop_call(&self, run: &ReplyRun<'_>, call: &ToolCall, reason: &str) {
        warn!(
            conversation_id = %run.ctx.id,
            tool = %call.name,
            call_id = %call.id,
            reason,
            "Dropping tool call"
        );
        self.publish(DomainEvent::ToolDropped {
            feature_name: run.ctx.feature_name.clone(),
            tool_name: call.name.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Swap in the LLM named by the tool's llm-reference option, if any.
    fn bind_llm(&self, instance: &mut ToolInstance) {
        let Some(name) = instance.llm_reference().map(str::to_string) else {
            return;
        };
        match self.llms.get(&name) {
            Some(llm) => instance.bind_llm(llm.clone()),
            None => warn!(tool = %instance.name(), llm = %name, "Unknown LLM reference, using the default"),
        }
    }

    fn tool_context(&self, ctx: &ConversationContext) -> ToolContext {
        ToolContext {
            llm: Some(self.llm.clone()),
            forum: self.forum.clone(),
            acting_user: ctx.user.clone(),
            cancel: ctx.cancel.clone(),
            feature_name: ctx.feature_name.clone(),
            ..Default::default()
        }
    }

    fn generate_options(&self, ctx: &ConversationContext, tool_choice: ToolChoice) -> GenerateOptions {
        GenerateOptions {
            temperature: self.persona.temperature.or(self.temperature),
            top_p: self.persona.top_p.or(self.top_p),
            max_tokens: self.max_tokens,
            tool_choice,
            response_format: self.persona.response_format.clone(),
            feature_name: ctx.feature_name.clone(),
            cancel: ctx.cancel.clone(),
        }
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// Serialized form of a tool result as the model sees it.
fn result_content(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
