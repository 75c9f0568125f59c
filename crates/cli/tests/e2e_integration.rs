//! End-to-end integration tests for the Agora runtime.
//!
//! These tests drive `Bot::reply` through the whole stack: prompt assembly,
//! a scripted streaming LLM, tool resolution and real WebAssembly script
//! tools running under sandbox quotas.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use agora_agent::{Bot, ReplyEntry, ReplyUpdate, UpdateCallback, noop_callback};
use agora_config::AppConfig;
use agora_core::{
    CompletionEvent, CompletionStream, ConversationContext, EventBus, ExecutionQuota,
    GenerateOptions, LlmClient, Message, Persona, Prompt, ProviderError, Role, ToolCall,
    ToolChoice, ToolRegistry,
};
use agora_sandbox::{
    HttpClient, HttpRequest, HttpResponse, SandboxPolicy, ScriptTool, load_script_tools_from_dir,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

// ── Scripted LLM ─────────────────────────────────────────────────────────

/// Streams one scripted completion per `generate` call.
struct ScriptedLlm {
    turns: Mutex<VecDeque<Vec<CompletionEvent>>>,
    prompts: Mutex<Vec<(Prompt, GenerateOptions)>>,
}

impl ScriptedLlm {
    fn new(turns: Vec<Vec<CompletionEvent>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<(Prompt, GenerateOptions)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedLlm {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn generate(
        &self,
        prompt: Prompt,
        options: GenerateOptions,
    ) -> Result<CompletionStream, ProviderError> {
        self.prompts.lock().unwrap().push((prompt, options));
        let events = self.turns.lock().unwrap().pop_front().unwrap_or_else(|| {
            panic!("ScriptedLlm exhausted");
        });
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.send(Ok(event)).await.unwrap();
        }
        Ok(rx)
    }
}

fn text(t: &str) -> CompletionEvent {
    CompletionEvent::text(t)
}

fn call(id: &str, name: &str, args: Value) -> CompletionEvent {
    CompletionEvent::tool_call(ToolCall {
        id: id.into(),
        name: name.into(),
        arguments: args.as_object().cloned().unwrap_or_default(),
        partial: false,
    })
}

// ── Mock HTTP ────────────────────────────────────────────────────────────

struct MockHttp {
    calls: AtomicU32,
}

impl MockHttp {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait::async_trait]
impl HttpClient for MockHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(HttpResponse {
            status: 200,
            headers: Default::default(),
            body: format!("fetched {}", request.url),
        })
    }
}

// ── Scripts ──────────────────────────────────────────────────────────────

const PRELUDE: &str = r#"
    (import "agora" "host_call" (func $host_call (param i32 i32) (result i32)))
    (import "agora" "progress" (func $progress (param i32 i32)))
    (memory (export "memory") 1)
    (global $next (mut i32) (i32.const 4096))
    (func $alloc (export "alloc") (param $n i32) (result i32)
        (local $p i32)
        (local.set $p (global.get $next))
        (global.set $next (i32.add (global.get $next) (local.get $n)))
        (local.get $p))
    (data (i32.const 0) "{\"op\":\"http.get\",\"url\":\"https://x.test/\"}")
    (data (i32.const 100) "fetching")
"#;

/// Issues `n` HTTP calls and returns the last reply.
fn fetch_script(n: u32) -> Vec<u8> {
    wat::parse_str(format!(
        r#"(module {PRELUDE}
            (func (export "invoke") (param i32 i32) (result i32)
                (local $i i32) (local $reply i32)
                (call $progress (i32.const 100) (i32.const 8))
                (block $done
                    (loop $next
                        (br_if $done (i32.ge_u (local.get $i) (i32.const {n})))
                        (local.set $reply (call $host_call (i32.const 0) (i32.const 41)))
                        (local.set $i (i32.add (local.get $i) (i32.const 1)))
                        (br $next)))
                (local.get $reply)))"#
    ))
    .unwrap()
}

fn spin_script() -> Vec<u8> {
    wat::parse_str(format!(
        r#"(module {PRELUDE}
            (func (export "invoke") (param i32 i32) (result i32)
                (loop $forever (br $forever))
                (i32.const 0)))"#
    ))
    .unwrap()
}

fn write_tool(dir: &Path, name: &str, wasm: &[u8], quota: Option<Value>) {
    let mut manifest = json!({
        "name": name,
        "description": format!("The {name} script"),
        "parameters": [{"name": "url", "type": "string"}],
        "script_path": format!("{name}.wasm"),
        "capabilities": ["http"],
    });
    if let Some(quota) = quota {
        manifest["quota"] = quota;
    }
    std::fs::write(dir.join(format!("{name}.wasm")), wasm).unwrap();
    std::fs::write(
        dir.join(format!("{name}.tool.json")),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
}

fn load_tools(dir: &Path, http: Arc<MockHttp>) -> Arc<ToolRegistry> {
    let config = AppConfig::default();
    let policy = SandboxPolicy::from_config(&config.sandbox);
    let mut registry = ToolRegistry::new();
    for tool in load_script_tools_from_dir(dir, &policy, &config.sandbox.default_quota, Some(http)) {
        registry.register(Arc::new(tool));
    }
    Arc::new(registry)
}

fn persona(tools: &[&str]) -> Persona {
    Persona::new("researcher", "You research things for {username}.").with_tools(tools)
}

fn conversation() -> ConversationContext {
    ConversationContext::new(vec![Message::user("What does x.test say?")])
}

fn collecting() -> (UpdateCallback, Arc<Mutex<Vec<ReplyUpdate>>>) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let callback: UpdateCallback = Arc::new(move |u: ReplyUpdate| sink.lock().unwrap().push(u));
    (callback, updates)
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn e2e_script_tool_result_feeds_next_completion() {
    let dir = tempfile::tempdir().unwrap();
    write_tool(dir.path(), "fetch", &fetch_script(1), None);
    let http = MockHttp::new();
    let tools = load_tools(dir.path(), http.clone());
    assert!(tools.contains("fetch"));

    let llm = ScriptedLlm::new(vec![
        vec![
            text("Checking."),
            call("call_1", "fetch", json!({"url": "https://x.test/"})),
        ],
        vec![text("It says hello.")],
    ]);
    let bot = Bot::new(llm.clone(), tools, persona(&["fetch"])).with_config(&AppConfig::default());
    let (callback, updates) = collecting();
    let mut ctx = conversation();

    let entries = bot.reply(&mut ctx, callback).await.unwrap();

    assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    let ReplyEntry::ToolResult { result, .. } = &entries[2] else {
        panic!("expected a tool result, got {:?}", entries[2]);
    };
    assert_eq!(result["ok"]["status"], 200);
    assert_eq!(result["ok"]["body"], "fetched https://x.test/");

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].0.tool_names().collect::<Vec<_>>(), vec!["fetch"]);
    let fed_back = requests[1].0.messages.last().unwrap();
    assert_eq!(fed_back.role, Role::ToolResult);
    assert!(fed_back.content.contains("fetched https://x.test/"));

    assert!(updates.lock().unwrap().iter().any(|u| matches!(
        u,
        ReplyUpdate::ToolProgress { text, .. } if text == "fetching"
    )));
    assert_eq!(ctx.messages.last().unwrap().content, "It says hello.");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn e2e_quota_violation_is_fed_back_to_the_model() {
    let dir = tempfile::tempdir().unwrap();
    write_tool(
        dir.path(),
        "crawler",
        &fetch_script(3),
        Some(json!({"max_http_calls": 2})),
    );
    let http = MockHttp::new();
    let tools = load_tools(dir.path(), http.clone());

    let llm = ScriptedLlm::new(vec![
        vec![call("call_1", "crawler", json!({}))],
        vec![text("The crawler hit its limit.")],
    ]);
    let bot = Bot::new(llm.clone(), tools, persona(&["crawler"]));

    let entries = bot.reply(&mut conversation(), noop_callback()).await.unwrap();

    assert_eq!(http.calls.load(Ordering::SeqCst), 2);
    let ReplyEntry::ToolResult { result, .. } = &entries[1] else {
        panic!("expected a tool result, got {:?}", entries[1]);
    };
    assert!(result["error"].as_str().unwrap().contains("http_calls"));
    assert_eq!(llm.requests().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn e2e_runaway_script_times_out_without_ending_the_reply() {
    let dir = tempfile::tempdir().unwrap();
    write_tool(
        dir.path(),
        "spin",
        &spin_script(),
        Some(json!({"timeout_ms": 50})),
    );
    let tools = load_tools(dir.path(), MockHttp::new());

    let llm = ScriptedLlm::new(vec![
        vec![call("call_1", "spin", json!({}))],
        vec![text("That tool is stuck.")],
    ]);
    let bot = Bot::new(llm.clone(), tools, persona(&["spin"]));

    let entries = bot.reply(&mut conversation(), noop_callback()).await.unwrap();

    let ReplyEntry::ToolResult { result, .. } = &entries[1] else {
        panic!("expected a tool result, got {:?}", entries[1]);
    };
    assert!(result["error"].as_str().unwrap().contains("timed out"));
    assert_eq!(
        entries.last(),
        Some(&ReplyEntry::Text {
            text: "That tool is stuck.".into()
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn e2e_final_completion_has_no_tools() {
    let dir = tempfile::tempdir().unwrap();
    write_tool(dir.path(), "fetch", &fetch_script(1), None);
    let http = MockHttp::new();
    let tools = load_tools(dir.path(), http.clone());

    let llm = ScriptedLlm::new(vec![
        vec![call("call_1", "fetch", json!({}))],
        vec![call("call_2", "fetch", json!({}))],
        vec![text("Done.")],
    ]);
    let bot = Bot::new(llm.clone(), tools, persona(&["fetch"])).with_max_completions(3);

    bot.reply(&mut conversation(), noop_callback()).await.unwrap();

    let choices: Vec<ToolChoice> = llm.requests().into_iter().map(|(_, o)| o.tool_choice).collect();
    assert_eq!(choices, vec![ToolChoice::Auto, ToolChoice::Auto, ToolChoice::None]);
    assert_eq!(http.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn e2e_ungranted_capability_is_rejected_at_load() {
    let dir = tempfile::tempdir().unwrap();
    write_tool(dir.path(), "fetch", &fetch_script(1), None);
    let manifest_path = dir.path().join("fetch.tool.json");
    let mut manifest: Value =
        serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
    manifest["capabilities"] = json!(["forum_write"]);
    std::fs::write(&manifest_path, manifest.to_string()).unwrap();

    let tools = load_tools(dir.path(), MockHttp::new());
    assert!(!tools.contains("fetch"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn e2e_events_meter_a_script_tool_reply() {
    let dir = tempfile::tempdir().unwrap();
    write_tool(dir.path(), "fetch", &fetch_script(1), None);
    let tools = load_tools(dir.path(), MockHttp::new());
    let bus = Arc::new(EventBus::new(64));
    let mut events = bus.subscribe();

    let llm = ScriptedLlm::new(vec![
        vec![call("call_1", "fetch", json!({}))],
        vec![text("ok")],
    ]);
    let bot = Bot::new(llm, tools, persona(&["fetch"])).with_event_bus(bus);
    let mut ctx = conversation().with_feature_name("research");

    bot.reply(&mut ctx, noop_callback()).await.unwrap();

    let mut tool_events = 0;
    let mut finished = false;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.feature_name(), "research");
        match event.as_ref() {
            agora_core::DomainEvent::ToolExecuted { success, .. } => {
                assert!(success);
                tool_events += 1;
            }
            agora_core::DomainEvent::ReplyFinished { completions, .. } => {
                assert_eq!(*completions, 2);
                finished = true;
            }
            _ => {}
        }
    }
    assert_eq!(tool_events, 1);
    assert!(finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn e2e_script_tool_direct_construction() {
    let tool_config = serde_json::from_value(json!({
        "name": "fetch",
        "description": "Fetch a page",
        "script_path": "unused.wasm",
        "capabilities": ["http"],
        "quota": {"timeout_ms": 60_000},
    }))
    .unwrap();
    let tool = ScriptTool::from_bytes_with_policy(
        tool_config,
        &fetch_script(1),
        &SandboxPolicy::from_config(&AppConfig::default().sandbox),
        &ExecutionQuota::default(),
    )
    .unwrap();
    // Clamped to the policy ceiling.
    assert!(tool.quota().timeout_ms < 60_000);
}
