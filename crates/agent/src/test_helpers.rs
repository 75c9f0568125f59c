//! Shared test helpers for orchestrator tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use agora_core::{
    CompletionEvent, CompletionStream, GenerateOptions, LlmClient, ParameterType, Prompt,
    ProviderError, Tool, ToolCall, ToolContext, ToolError, ToolOption, ToolOutput, ToolParameter,
    ToolParams, ToolSignature,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::update::{ReplyUpdate, UpdateCallback};

/// An LLM client that replays scripted completions in order.
///
/// Each `generate` call streams the next scripted turn. Once the script is
/// exhausted, `generate` fails with an API error.
pub struct ScriptedLlm {
    name: String,
    turns: Mutex<VecDeque<Vec<CompletionEvent>>>,
    ends: Mutex<VecDeque<StreamEnd>>,
    held: Mutex<Vec<mpsc::Sender<Result<CompletionEvent, ProviderError>>>>,
    requests: Mutex<Vec<(Prompt, GenerateOptions)>>,
}

/// How a scripted completion stream ends once its events are sent.
pub enum StreamEnd {
    Close,
    Fail(ProviderError),
    /// Keep the sender alive so the stream never finishes on its own.
    HoldOpen,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<Vec<CompletionEvent>>) -> Arc<Self> {
        Self::named("scripted", turns)
    }

    pub fn named(name: &str, turns: Vec<Vec<CompletionEvent>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            turns: Mutex::new(turns.into()),
            ends: Mutex::new(VecDeque::new()),
            held: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Script how each turn's stream ends, in order. Turns past the list
    /// close normally.
    pub fn with_ends(turns: Vec<Vec<CompletionEvent>>, ends: Vec<StreamEnd>) -> Arc<Self> {
        let llm = Self::named("scripted", turns);
        *llm.ends.lock().unwrap() = ends.into();
        llm
    }

    pub fn requests(&self) -> Vec<(Prompt, GenerateOptions)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        prompt: Prompt,
        options: GenerateOptions,
    ) -> Result<CompletionStream, ProviderError> {
        self.requests.lock().unwrap().push((prompt, options));
        let Some(events) = self.turns.lock().unwrap().pop_front() else {
            return Err(ProviderError::ApiError {
                status_code: 500,
                message: "no scripted completion left".into(),
            });
        };
        let (tx, rx) = mpsc::channel(events.len() + 1);
        for event in events {
            tx.try_send(Ok(event)).unwrap();
        }
        match self.ends.lock().unwrap().pop_front().unwrap_or(StreamEnd::Close) {
            StreamEnd::Close => {}
            StreamEnd::Fail(e) => tx.try_send(Err(e)).unwrap(),
            StreamEnd::HoldOpen => self.held.lock().unwrap().push(tx),
        }
        Ok(rx)
    }
}

pub fn text(text: &str) -> CompletionEvent {
    CompletionEvent::text(text)
}

pub fn thinking(text: &str, partial: bool) -> CompletionEvent {
    CompletionEvent::Thinking {
        text: text.into(),
        partial,
    }
}

pub fn call(id: &str, name: &str, args: Value) -> CompletionEvent {
    CompletionEvent::tool_call(ToolCall {
        id: id.into(),
        name: name.into(),
        arguments: args.as_object().cloned().unwrap_or_default(),
        partial: false,
    })
}

pub fn partial_call(id: &str, name: &str, args: Value) -> CompletionEvent {
    CompletionEvent::tool_call(ToolCall {
        id: id.into(),
        name: name.into(),
        arguments: args.as_object().cloned().unwrap_or_default(),
        partial: true,
    })
}

/// Shared, ordered log of what tools did.
pub type ToolLog = Arc<Mutex<Vec<String>>>;

pub fn tool_log() -> ToolLog {
    Arc::new(Mutex::new(Vec::new()))
}

type InvokeHook = Box<dyn Fn(&ToolContext) + Send + Sync>;

/// A configurable tool that records its invocations.
pub struct RecordingTool {
    signature: ToolSignature,
    options: Vec<ToolOption>,
    chain: bool,
    allow_partial: bool,
    fail: bool,
    record_llm: bool,
    custom_raw: Option<String>,
    log: ToolLog,
    hook: Option<InvokeHook>,
}

impl RecordingTool {
    pub fn new(name: &str, log: &ToolLog) -> Self {
        Self {
            signature: ToolSignature::new(name, format!("The {name} tool"))
                .param(ToolParameter::new("query", ParameterType::String)),
            options: Vec::new(),
            chain: true,
            allow_partial: false,
            fail: false,
            record_llm: false,
            custom_raw: None,
            log: log.clone(),
            hook: None,
        }
    }

    pub fn no_chain(mut self) -> Self {
        self.chain = false;
        self
    }

    pub fn partial(mut self) -> Self {
        self.allow_partial = true;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn recording_llm(mut self) -> Self {
        self.record_llm = true;
        self
    }

    pub fn with_custom_raw(mut self, raw: &str) -> Self {
        self.custom_raw = Some(raw.into());
        self
    }

    pub fn with_option(mut self, option: ToolOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn on_invoke(mut self, hook: impl Fn(&ToolContext) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn into_arc(self) -> Arc<dyn Tool> {
        Arc::new(self)
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn signature(&self) -> &ToolSignature {
        &self.signature
    }

    fn options(&self) -> &[ToolOption] {
        &self.options
    }

    fn allow_partial_tool_calls(&self) -> bool {
        self.allow_partial
    }

    fn chain_next_response(&self, _params: &ToolParams, _output: &ToolOutput) -> bool {
        self.chain
    }

    async fn invoke(&self, params: &ToolParams, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let name = self.name().to_string();
        self.log.lock().unwrap().push(format!("invoke:{name}"));
        if self.record_llm {
            let llm = ctx.llm.as_ref().map(|l| l.name().to_string()).unwrap_or_default();
            self.log.lock().unwrap().push(format!("llm:{llm}"));
        }
        if let Some(hook) = &self.hook {
            hook(ctx);
        }
        ctx.progress.report(format!("{name} working"));

        if self.fail {
            return Err(ToolError::ExecutionFailed {
                tool_name: name,
                reason: "backend unavailable".into(),
            });
        }
        let output = ToolOutput::new(json!({ "tool": name, "params": params }));
        Ok(match &self.custom_raw {
            Some(raw) => output.with_custom_raw(raw.clone()),
            None => output,
        })
    }

    async fn partial_invoke(&self, params: &ToolParams, _ctx: &ToolContext) -> Option<String> {
        self.log.lock().unwrap().push(format!("partial:{}", self.name()));
        let query = params.get("query").and_then(Value::as_str).unwrap_or_default();
        Some(format!("{} preparing '{query}'", self.name()))
    }
}

/// A callback collecting every update.
pub fn collecting_callback() -> (UpdateCallback, Arc<Mutex<Vec<ReplyUpdate>>>) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let callback: UpdateCallback = Arc::new(move |update: ReplyUpdate| sink.lock().unwrap().push(update));
    (callback, updates)
}
