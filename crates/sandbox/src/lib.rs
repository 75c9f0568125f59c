//! Sandboxed tool execution for Agora.
//!
//! Script tools are WebAssembly modules loaded at runtime. Each invocation
//! runs in a fresh wasmtime store with:
//!
//! - a linear memory ceiling enforced by a resource limiter
//! - optional instruction fuel
//! - a watchdog thread that interrupts the script once its *pure script*
//!   time exceeds the quota (time spent in host calls is not counted)
//! - per-invocation counters for HTTP and sleep calls
//! - a curated host-call surface gated by declared capabilities
//!
//! # Script module interface
//!
//! ```wat
//! (memory (export "memory") 1)
//! (func (export "alloc") (param i32) (result i32))
//! (func (export "invoke") (param i32 i32) (result i32))
//! ;; optional, for rendering partial tool calls
//! (func (export "partial_invoke") (param i32 i32) (result i32))
//! ```
//!
//! Input is a pointer + length to UTF-8 JSON parameters; output is a
//! pointer to a NUL-terminated JSON (or plain text) result.
//!
//! Host imports live in the `agora` module:
//!
//! ```wat
//! (import "agora" "host_call" (func (param i32 i32) (result i32)))
//! (import "agora" "sleep" (func (param i64)))
//! (import "agora" "progress" (func (param i32 i32)))
//! (import "agora" "set_custom_raw" (func (param i32 i32)))
//! ```
//!
//! `host_call` takes a JSON request `{"op": "http.get", ...}` and returns a
//! pointer to a NUL-terminated reply, `{"ok": ...}` or `{"error": "..."}`.

pub mod engine;
pub mod host;
pub mod http;
pub mod limits;
pub mod policy;
pub mod script_tool;
pub mod watchdog;

pub use engine::{ExecutionState, Invocation, SandboxError, ScriptEngine, ScriptOutput};
pub use host::HostServices;
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use policy::SandboxPolicy;
pub use script_tool::{ScriptTool, ScriptToolConfig, load_manifest, load_script_tools_from_dir};
