//! The curated host-call surface exposed to scripts.
//!
//! Scripts run synchronously on a blocking thread; host functions bridge to
//! the async collaborators with the runtime handle captured at invocation
//! time. Every bridged call holds a [`HostCallGuard`] so the watchdog does
//! not charge its duration to the script.
//!
//! Quota, cancellation and marshal-depth violations are recorded on the
//! [`HostState`] and trap the script. Ordinary failures (unknown operation,
//! ungranted capability, permission denied, an HTTP error) are returned to
//! the script as `{"error": "..."}` and the script decides what to do.
//!
//! [`HostCallGuard`]: crate::watchdog::HostCallGuard

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agora_core::forum::{ForumAction, NewPost, NewTopic, NewUpload};
use agora_core::provider::{GenerateOptions, Prompt};
use agora_core::{
    ExecutionQuota, ForumRepository, HostCapability, LlmClient, Message, ProgressReporter,
    QuotaKind, UserRef,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wasmtime::{Caller, Extern, Linker};

use crate::engine::SandboxError;
use crate::http::{HttpClient, HttpMethod, HttpRequest};
use crate::limits::{MemoryCeiling, check_depth};
use crate::watchdog::WatchdogState;

/// Host module name scripts import from.
pub const HOST_MODULE: &str = "agora";

/// Collaborators available to one script invocation.
#[derive(Clone, Default)]
pub struct HostServices {
    pub http: Option<Arc<dyn HttpClient>>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub forum: Option<Arc<dyn ForumRepository>>,
    /// User whose permissions gate mutations
    pub acting_user: Option<UserRef>,
    /// Capabilities granted to the tool
    pub capabilities: HashSet<HostCapability>,
    pub feature_name: String,
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("http", &self.http.is_some())
            .field("llm", &self.llm.is_some())
            .field("forum", &self.forum.is_some())
            .field("acting_user", &self.acting_user)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// What host calls may do during a run.
pub enum HostMode {
    /// Full invocation with side effects.
    Invoke(HostServices),
    /// Rendering a partial call: every host call is answered with an error,
    /// sleeps return immediately, and progress output is discarded.
    Render,
}

/// Per-invocation store data.
pub struct HostState {
    pub(crate) mode: HostMode,
    pub(crate) quota: ExecutionQuota,
    pub(crate) limiter: MemoryCeiling,
    pub(crate) watchdog: Arc<WatchdogState>,
    pub(crate) runtime: tokio::runtime::Handle,
    pub(crate) cancel: CancellationToken,
    pub(crate) progress: ProgressReporter,
    pub(crate) http_calls: u32,
    pub(crate) sleep_calls: u32,
    pub(crate) custom_raw: Option<String>,
    pub(crate) violation: Option<SandboxError>,
}

impl HostState {
    pub(crate) fn new(
        mode: HostMode,
        quota: ExecutionQuota,
        watchdog: Arc<WatchdogState>,
        runtime: tokio::runtime::Handle,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            limiter: MemoryCeiling::new(quota.max_memory_bytes),
            mode,
            quota,
            watchdog,
            runtime,
            cancel,
            progress,
            http_calls: 0,
            sleep_calls: 0,
            custom_raw: None,
            violation: None,
        }
    }

    fn rendering(&self) -> bool {
        matches!(self.mode, HostMode::Render)
    }

    /// Record a violation and produce the trap that unwinds the script.
    fn fail(&mut self, violation: SandboxError) -> anyhow::Error {
        let err = anyhow::anyhow!("{violation}");
        self.violation = Some(violation);
        err
    }

    fn check_cancelled(&mut self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.fail(SandboxError::Cancelled));
        }
        Ok(())
    }

    fn check_depth(&mut self, value: &Value, what: &str) -> anyhow::Result<()> {
        check_depth(value, self.quota.max_marshal_depth, what).map_err(|e| self.fail(e))
    }

    fn count_http_call(&mut self) -> anyhow::Result<()> {
        self.http_calls += 1;
        if self.http_calls > self.quota.max_http_calls {
            let detail = format!(
                "HTTP call {} exceeds the limit of {}",
                self.http_calls, self.quota.max_http_calls
            );
            self.http_calls = self.quota.max_http_calls;
            return Err(self.fail(SandboxError::QuotaExceeded {
                kind: QuotaKind::HttpCalls,
                detail,
            }));
        }
        Ok(())
    }
}

/// Register the host imports on a linker.
pub fn link(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "host_call",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let bytes = read_guest_bytes(&mut caller, ptr, len)?;
            let reply = match String::from_utf8(bytes) {
                Ok(raw) => host_call(&mut caller, &raw)?,
                Err(e) => error_reply(format!("host call request is not valid UTF-8: {e}")),
            };
            write_guest_string(&mut caller, &reply.to_string())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "sleep",
        |mut caller: Caller<'_, HostState>, ms: i64| -> anyhow::Result<()> { sleep(&mut caller, ms) },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "progress",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let text = read_guest_string(&mut caller, ptr, len)?;
            let state = caller.data();
            if !state.rendering() {
                state.progress.report(text);
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "set_custom_raw",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let text = read_guest_string(&mut caller, ptr, len)?;
            let state = caller.data_mut();
            if !state.rendering() {
                state.custom_raw = Some(text);
            }
            Ok(())
        },
    )?;

    Ok(())
}

fn host_call(caller: &mut Caller<'_, HostState>, raw: &str) -> anyhow::Result<Value> {
    let state = caller.data_mut();

    let request: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return Ok(error_reply(format!("malformed host call: {e}"))),
    };
    state.check_depth(&request, "host call request")?;
    state.check_cancelled()?;

    let services = match &state.mode {
        HostMode::Render => {
            return Ok(error_reply("host calls are disabled while rendering"));
        }
        HostMode::Invoke(services) => services.clone(),
    };

    let Some(op) = request.get("op").and_then(Value::as_str).map(str::to_string) else {
        return Ok(error_reply("host call is missing 'op'"));
    };
    let capability = match required_capability(&op) {
        Some(cap) => cap,
        None => return Ok(error_reply(format!("unknown host operation '{op}'"))),
    };
    if !services.capabilities.contains(&capability) {
        return Ok(error_reply(format!(
            "capability '{capability}' is not granted to this tool"
        )));
    }
    if capability == HostCapability::Http {
        state.count_http_call()?;
    }

    debug!(op = %op, "Script host call");
    let watchdog = state.watchdog.clone();
    let runtime = state.runtime.clone();
    let outcome = {
        let _guard = watchdog.enter_host_call();
        runtime.block_on(perform(&services, &op, &request))
    };

    let state = caller.data_mut();
    state.check_cancelled()?;
    let reply = match outcome {
        Ok(value) => json!({ "ok": value }),
        Err(message) => error_reply(message),
    };
    state.check_depth(&reply, "host call reply")?;
    Ok(reply)
}

fn sleep(caller: &mut Caller<'_, HostState>, ms: i64) -> anyhow::Result<()> {
    let state = caller.data_mut();
    if state.rendering() {
        return Ok(());
    }
    state.check_cancelled()?;

    state.sleep_calls += 1;
    if state.sleep_calls > state.quota.max_sleep_calls {
        let detail = format!(
            "sleep call {} exceeds the limit of {}",
            state.sleep_calls, state.quota.max_sleep_calls
        );
        return Err(state.fail(SandboxError::QuotaExceeded {
            kind: QuotaKind::SleepCalls,
            detail,
        }));
    }
    let ms = ms.max(0) as u64;
    if ms > state.quota.max_sleep_ms {
        let detail = format!("sleep of {ms}ms exceeds the limit of {}ms", state.quota.max_sleep_ms);
        return Err(state.fail(SandboxError::QuotaExceeded {
            kind: QuotaKind::SleepDuration,
            detail,
        }));
    }

    let watchdog = state.watchdog.clone();
    let runtime = state.runtime.clone();
    {
        let _guard = watchdog.enter_host_call();
        runtime.block_on(tokio::time::sleep(Duration::from_millis(ms)));
    }
    caller.data_mut().check_cancelled()
}

fn required_capability(op: &str) -> Option<HostCapability> {
    let cap = match op {
        "http.get" | "http.post" | "http.put" | "http.patch" | "http.delete" => HostCapability::Http,
        "llm.generate" => HostCapability::Llm,
        "search" => HostCapability::Search,
        "posts.get" | "topics.get" | "users.get" => HostCapability::ForumRead,
        "posts.create" | "posts.update" | "topics.create" => HostCapability::ForumWrite,
        "uploads.get" | "uploads.create" => HostCapability::Upload,
        _ => return None,
    };
    Some(cap)
}

fn error_reply(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}

fn field<T: DeserializeOwned>(request: &Value, name: &str) -> Result<T, String> {
    let value = request
        .get(name)
        .cloned()
        .ok_or_else(|| format!("missing field '{name}'"))?;
    serde_json::from_value(value).map_err(|e| format!("invalid field '{name}': {e}"))
}

fn optional<T: DeserializeOwned>(request: &Value, name: &str) -> Result<Option<T>, String> {
    match request.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => field(request, name).map(Some),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

async fn perform(services: &HostServices, op: &str, request: &Value) -> Result<Value, String> {
    if let Some(method) = HttpMethod::from_op(op) {
        return http_call(services, method, request).await;
    }
    match op {
        "llm.generate" => llm_generate(services, request).await,
        "search" => {
            let forum = forum(services)?;
            let query: String = field(request, "query")?;
            let limit: usize = optional(request, "limit")?.unwrap_or(10);
            to_value(forum.search(&query, limit).await.map_err(|e| e.to_string())?)
        }
        "posts.get" => {
            let post = forum(services)?.post(field(request, "id")?).await;
            to_value(post.map_err(|e| e.to_string())?)
        }
        "topics.get" => {
            let topic = forum(services)?.topic(field(request, "id")?).await;
            to_value(topic.map_err(|e| e.to_string())?)
        }
        "users.get" => {
            let username: String = field(request, "username")?;
            let user = forum(services)?.user(&username).await;
            to_value(user.map_err(|e| e.to_string())?)
        }
        "uploads.get" => {
            let upload = forum(services)?.upload(field(request, "id")?).await;
            to_value(upload.map_err(|e| e.to_string())?)
        }
        "posts.create" => {
            let post = NewPost {
                topic_id: field(request, "topic_id")?,
                raw: field(request, "raw")?,
                reply_to_post_number: optional(request, "reply_to_post_number")?,
            };
            let action = ForumAction::CreatePost {
                topic_id: post.topic_id,
            };
            let (forum, user) = authorize(services, &action).await?;
            to_value(forum.create_post(&user, post).await.map_err(|e| e.to_string())?)
        }
        "posts.update" => {
            let id: i64 = field(request, "id")?;
            let raw: String = field(request, "raw")?;
            let (forum, user) = authorize(services, &ForumAction::EditPost { post_id: id }).await?;
            to_value(forum.update_post(&user, id, &raw).await.map_err(|e| e.to_string())?)
        }
        "topics.create" => {
            let topic = NewTopic {
                title: field(request, "title")?,
                raw: field(request, "raw")?,
                category_id: optional(request, "category_id")?,
                tags: optional(request, "tags")?.unwrap_or_default(),
            };
            let action = ForumAction::CreateTopic {
                category_id: topic.category_id,
            };
            let (forum, user) = authorize(services, &action).await?;
            to_value(forum.create_topic(&user, topic).await.map_err(|e| e.to_string())?)
        }
        "uploads.create" => {
            let upload = NewUpload {
                filename: field(request, "filename")?,
                content: field(request, "content")?,
            };
            let (forum, user) = authorize(services, &ForumAction::CreateUpload).await?;
            to_value(forum.create_upload(&user, upload).await.map_err(|e| e.to_string())?)
        }
        other => Err(format!("unknown host operation '{other}'")),
    }
}

fn forum(services: &HostServices) -> Result<&Arc<dyn ForumRepository>, String> {
    services
        .forum
        .as_ref()
        .ok_or_else(|| "forum access is not available".to_string())
}

/// Resolve the repository and acting user for a mutation, checking the
/// user's permissions first.
async fn authorize(
    services: &HostServices,
    action: &ForumAction,
) -> Result<(Arc<dyn ForumRepository>, UserRef), String> {
    let forum = forum(services)?.clone();
    let user = services
        .acting_user
        .clone()
        .ok_or_else(|| "no acting user for this mutation".to_string())?;
    if !forum.can_perform(&user, action).await {
        return Err(format!(
            "permission denied: {} may not perform {action:?}",
            user.username
        ));
    }
    Ok((forum, user))
}

async fn http_call(
    services: &HostServices,
    method: HttpMethod,
    request: &Value,
) -> Result<Value, String> {
    let client = services
        .http
        .as_ref()
        .ok_or_else(|| "HTTP client is not configured".to_string())?;
    let body = match request.get("body") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    let response = client
        .send(HttpRequest {
            method,
            url: field(request, "url")?,
            headers: optional(request, "headers")?.unwrap_or_default(),
            body,
        })
        .await?;
    to_value(response)
}

async fn llm_generate(services: &HostServices, request: &Value) -> Result<Value, String> {
    let llm = services
        .llm
        .as_ref()
        .ok_or_else(|| "no LLM is bound to this tool".to_string())?;
    let prompt_text: String = field(request, "prompt")?;
    let parse_json: bool = optional(request, "json")?.unwrap_or(false);

    let prompt = Prompt {
        system: optional(request, "system")?.unwrap_or_default(),
        messages: vec![Message::user(prompt_text)],
        tools: Vec::new(),
    };
    let options = GenerateOptions {
        temperature: optional(request, "temperature")?,
        max_tokens: optional(request, "max_tokens")?,
        response_format: optional(request, "response_format")?,
        feature_name: services.feature_name.clone(),
        ..Default::default()
    };
    let text = llm
        .generate_text(prompt, options)
        .await
        .map_err(|e| e.to_string())?;

    if !parse_json {
        return Ok(Value::String(text));
    }
    serde_json::from_str(strip_code_fence(&text))
        .map_err(|e| format!("LLM reply is not valid JSON: {e}"))
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

fn read_guest_bytes(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<Vec<u8>> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("script does not export 'memory'"))?;
    let data = memory.data(&*caller);
    let start = ptr as u32 as usize;
    let end = start
        .checked_add(len as u32 as usize)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| anyhow::anyhow!("guest buffer out of bounds"))?;
    Ok(data[start..end].to_vec())
}

/// Display text for progress and `custom_raw`; invalid UTF-8 is replaced.
fn read_guest_string(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<String> {
    let bytes = read_guest_bytes(caller, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Copy `text` into guest memory through the script's `alloc`, NUL-terminated.
fn write_guest_string(caller: &mut Caller<'_, HostState>, text: &str) -> anyhow::Result<i32> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("script does not export 'memory'"))?;
    let alloc = caller
        .get_export("alloc")
        .and_then(Extern::into_func)
        .ok_or_else(|| anyhow::anyhow!("script does not export 'alloc'"))?
        .typed::<i32, i32>(&*caller)?;

    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);

    let ptr = alloc.call(&mut *caller, bytes.len() as i32)?;
    memory.write(&mut *caller, ptr as u32 as usize, &bytes)?;
    Ok(ptr)
}
