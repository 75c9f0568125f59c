//! Tool contract: the interface every tool implements, and the registry that
//! resolves model-emitted tool calls into bound [`ToolInstance`]s.
//!
//! A tool declares a machine-readable [`ToolSignature`], the configuration
//! [`ToolOption`]s a persona may override, and two behavior flags:
//! whether it renders partial (still streaming) calls, and whether the
//! orchestrator should request another completion after it ran.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::forum::ForumRepository;
use crate::message::UserRef;
use crate::provider::LlmClient;

/// Validated tool arguments, or resolved tool options.
pub type ToolParams = serde_json::Map<String, Value>;

/// A model-emitted request to invoke a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call ID as emitted by the model
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Raw arguments
    #[serde(default)]
    pub arguments: ToolParams,

    /// Arguments are still streaming in. A partial call is never executed.
    #[serde(default)]
    pub partial: bool,
}

/// Parameter types a tool may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Array,
    Boolean,
}

impl ParameterType {
    fn as_str(self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Array => "array",
            ParameterType::Boolean => "boolean",
        }
    }
}

/// One declared tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(rename = "type")]
    pub param_type: ParameterType,

    #[serde(default)]
    pub required: bool,

    /// Allowed values
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,

    /// Element type for arrays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<ParameterType>,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            param_type,
            required: false,
            enum_values: None,
            item_type: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn items(mut self, item_type: ParameterType) -> Self {
        self.item_type = Some(item_type);
        self
    }
}

/// The stable, machine-readable description of a tool sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSignature {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolSignature {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// JSON Schema object describing the parameters.
    pub fn json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            let mut prop = serde_json::Map::new();
            prop.insert("type".into(), Value::String(p.param_type.as_str().into()));
            if !p.description.is_empty() {
                prop.insert("description".into(), Value::String(p.description.clone()));
            }
            if let Some(values) = &p.enum_values {
                prop.insert("enum".into(), serde_json::json!(values));
            }
            if p.param_type == ParameterType::Array {
                let item = p.item_type.unwrap_or(ParameterType::String);
                prop.insert("items".into(), serde_json::json!({ "type": item.as_str() }));
            }
            properties.insert(p.name.clone(), Value::Object(prop));
            if p.required {
                required.push(Value::String(p.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Validate and coerce raw model arguments.
    ///
    /// Unknown arguments are dropped. In lenient mode (partial calls) values
    /// that fail to coerce and missing required parameters are skipped
    /// instead of rejected.
    pub fn parse_arguments(
        &self,
        args: &ToolParams,
        lenient: bool,
    ) -> std::result::Result<ToolParams, ToolError> {
        let mut parsed = ToolParams::new();
        for p in &self.parameters {
            let Some(raw) = args.get(&p.name).filter(|v| !v.is_null()) else {
                if p.required && !lenient {
                    return Err(ToolError::InvalidArguments(format!(
                        "{}: missing required parameter '{}'",
                        self.name, p.name
                    )));
                }
                continue;
            };

            let value = match coerce(raw, p.param_type, p.item_type) {
                Some(v) => v,
                None if lenient => continue,
                None => {
                    return Err(ToolError::InvalidArguments(format!(
                        "{}: parameter '{}' is not a valid {}",
                        self.name,
                        p.name,
                        p.param_type.as_str()
                    )));
                }
            };

            if let Some(allowed) = &p.enum_values {
                let candidate = match &value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if !allowed.contains(&candidate) {
                    if lenient {
                        continue;
                    }
                    return Err(ToolError::InvalidArguments(format!(
                        "{}: parameter '{}' must be one of {:?}, got '{candidate}'",
                        self.name, p.name, allowed
                    )));
                }
            }

            parsed.insert(p.name.clone(), value);
        }
        Ok(parsed)
    }
}

fn coerce(raw: &Value, ty: ParameterType, item: Option<ParameterType>) -> Option<Value> {
    match ty {
        ParameterType::String => Some(match raw {
            Value::String(_) => raw.clone(),
            other => Value::String(other.to_string()),
        }),
        ParameterType::Integer => match raw {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| {
                    // 3.0 is accepted, 1.7 is not
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .map(Value::from),
            Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
            _ => None,
        },
        ParameterType::Boolean => match raw {
            Value::Bool(_) => Some(raw.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ParameterType::Array => {
            let items = match raw {
                Value::Array(items) => items.clone(),
                // JSON-encoded array, or a bare scalar treated as a singleton
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(Value::Array(items)) => items,
                    _ => vec![raw.clone()],
                },
                Value::Object(_) => return None,
                other => vec![other.clone()],
            };
            match item {
                Some(item_ty) if item_ty != ParameterType::Array => items
                    .iter()
                    .map(|v| coerce(v, item_ty, None))
                    .collect::<Option<Vec<_>>>()
                    .map(Value::Array),
                _ => Some(Value::Array(items)),
            }
        }
    }
}

/// The type of a configuration option a tool accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolOptionKind {
    Boolean {
        #[serde(default)]
        default: Option<bool>,
    },
    Integer {
        #[serde(default)]
        default: Option<i64>,
    },
    Enum {
        values: Vec<String>,
        #[serde(default)]
        default: Option<String>,
    },
    /// Names an LLM handle registered with the bot
    LlmReference,
}

/// A configuration option a persona may set for a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOption {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(flatten)]
    pub kind: ToolOptionKind,
}

impl ToolOption {
    fn default_value(&self) -> Option<Value> {
        match &self.kind {
            ToolOptionKind::Boolean { default } => default.map(Value::Bool),
            ToolOptionKind::Integer { default } => default.map(Value::from),
            ToolOptionKind::Enum { default, .. } => default.clone().map(Value::String),
            ToolOptionKind::LlmReference => None,
        }
    }

    fn validate(&self, value: &Value) -> Option<Value> {
        match &self.kind {
            ToolOptionKind::Boolean { .. } => coerce(value, ParameterType::Boolean, None),
            ToolOptionKind::Integer { .. } => coerce(value, ParameterType::Integer, None),
            ToolOptionKind::Enum { values, .. } => value
                .as_str()
                .filter(|v| values.iter().any(|allowed| allowed == v))
                .map(|v| Value::String(v.to_string())),
            ToolOptionKind::LlmReference => value.as_str().map(|v| Value::String(v.to_string())),
        }
    }
}

/// Merge persona overrides over option defaults, validating each override.
///
/// Overrides for options the tool does not declare are ignored.
pub fn resolve_options(
    tool_name: &str,
    options: &[ToolOption],
    overrides: Option<&ToolParams>,
) -> std::result::Result<ToolParams, ToolError> {
    let mut resolved = ToolParams::new();
    for option in options {
        if let Some(value) = option.default_value() {
            resolved.insert(option.name.clone(), value);
        }
        if let Some(raw) = overrides.and_then(|o| o.get(&option.name)) {
            let value = option.validate(raw).ok_or_else(|| {
                ToolError::InvalidArguments(format!(
                    "{tool_name}: invalid value {raw} for option '{}'",
                    option.name
                ))
            })?;
            resolved.insert(option.name.clone(), value);
        }
    }
    Ok(resolved)
}

/// What a tool invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Machine-readable result, fed back to the model
    pub result: Value,

    /// Human-visible rendering of the tool's side effect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_raw: Option<String>,
}

impl ToolOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            custom_raw: None,
        }
    }

    pub fn with_custom_raw(mut self, raw: impl Into<String>) -> Self {
        self.custom_raw = Some(raw.into());
        self
    }
}

/// Callback through which long-running tools push progress text.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    sink: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    pub fn noop() -> Self {
        Self::default()
    }

    pub fn report(&self, text: impl Into<String>) {
        if let Some(sink) = &self.sink {
            sink(text.into());
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

/// Everything a tool may use while running.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub call_id: String,
    /// Handle for sub-completions
    pub llm: Option<Arc<dyn LlmClient>>,
    pub forum: Option<Arc<dyn ForumRepository>>,
    /// User whose permissions gate any mutation
    pub acting_user: Option<UserRef>,
    /// Resolved option values
    pub options: ToolParams,
    pub cancel: CancellationToken,
    pub feature_name: String,
    pub progress: ProgressReporter,
}

impl ToolContext {
    pub fn option_bool(&self, name: &str) -> Option<bool> {
        self.options.get(name).and_then(Value::as_bool)
    }

    pub fn option_i64(&self, name: &str) -> Option<i64> {
        self.options.get(name).and_then(Value::as_i64)
    }

    pub fn option_str(&self, name: &str) -> Option<&str> {
        self.options.get(name).and_then(Value::as_str)
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("call_id", &self.call_id)
            .field("llm", &self.llm.as_ref().map(|l| l.name().to_string()))
            .field("forum", &self.forum.is_some())
            .field("acting_user", &self.acting_user)
            .field("options", &self.options)
            .field("feature_name", &self.feature_name)
            .finish()
    }
}

/// The core Tool trait.
///
/// Built-in tools implement it directly; script tools implement it on top
/// of the sandbox. Tools are registered in the [`ToolRegistry`] by name.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The machine-readable signature offered to the model.
    fn signature(&self) -> &ToolSignature;

    /// The unique name of this tool.
    fn name(&self) -> &str {
        &self.signature().name
    }

    /// Options a persona may configure.
    fn options(&self) -> &[ToolOption] {
        &[]
    }

    /// Whether `partial_invoke` should be called while arguments stream in.
    fn allow_partial_tool_calls(&self) -> bool {
        false
    }

    /// Whether the orchestrator should request another completion after
    /// this invocation.
    fn chain_next_response(&self, _params: &ToolParams, _output: &ToolOutput) -> bool {
        true
    }

    /// Execute the tool with validated parameters.
    async fn invoke(
        &self,
        params: &ToolParams,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Render progress for a partial call. Must not have side effects.
    async fn partial_invoke(&self, _params: &ToolParams, _ctx: &ToolContext) -> Option<String> {
        None
    }
}

/// A tool bound to one tool-call id.
pub struct ToolInstance {
    call_id: String,
    tool: Arc<dyn Tool>,
    parameters: ToolParams,
    context: ToolContext,
    custom_raw: Option<String>,
    chain: bool,
}

impl ToolInstance {
    pub fn new(
        call_id: impl Into<String>,
        tool: Arc<dyn Tool>,
        parameters: ToolParams,
        context: ToolContext,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool,
            parameters,
            context,
            custom_raw: None,
            chain: true,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn name(&self) -> &str {
        self.tool.name()
    }

    pub fn parameters(&self) -> &ToolParams {
        &self.parameters
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// Replace the LLM handle used for sub-completions.
    pub fn bind_llm(&mut self, llm: Arc<dyn LlmClient>) {
        self.context.llm = Some(llm);
    }

    pub fn set_progress(&mut self, progress: ProgressReporter) {
        self.context.progress = progress;
    }

    /// The value of the first llm-reference option, if set.
    pub fn llm_reference(&self) -> Option<&str> {
        self.tool
            .options()
            .iter()
            .filter(|o| o.kind == ToolOptionKind::LlmReference)
            .find_map(|o| self.context.option_str(&o.name))
    }

    /// Run the tool and return its machine-readable result.
    ///
    /// `custom_raw` is cleared first so output from an earlier invocation
    /// never leaks into this one.
    pub async fn invoke(&mut self) -> std::result::Result<Value, ToolError> {
        self.custom_raw = None;
        self.chain = true;
        let output = self.tool.invoke(&self.parameters, &self.context).await?;
        self.chain = self.tool.chain_next_response(&self.parameters, &output);
        self.custom_raw = output.custom_raw;
        Ok(output.result)
    }

    /// Render a partial call, if the tool supports it.
    pub async fn render_partial(&self) -> Option<String> {
        if !self.tool.allow_partial_tool_calls() {
            return None;
        }
        self.tool.partial_invoke(&self.parameters, &self.context).await
    }

    pub fn custom_raw(&self) -> Option<&str> {
        self.custom_raw.as_deref()
    }

    /// The chaining decision of the last invocation (true before any).
    pub fn chain_next_response(&self) -> bool {
        self.chain
    }
}

/// Name → tool lookup supplied by the embedding application.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Signatures for the named tools; unknown names are skipped.
    pub fn signatures_for(&self, names: &[String]) -> Vec<ToolSignature> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.signature().clone())
            .collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Bind a tool call to its tool: parse arguments (leniently for partial
    /// calls) and resolve options against persona overrides.
    pub fn resolve(
        &self,
        call: &ToolCall,
        base: &ToolContext,
        overrides: Option<&ToolParams>,
    ) -> std::result::Result<ToolInstance, ToolError> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        let parameters = tool
            .signature()
            .parse_arguments(&call.arguments, call.partial)?;
        let options = resolve_options(tool.name(), tool.options(), overrides)?;

        let mut context = base.clone();
        context.call_id = call.id.clone();
        context.options = options;
        Ok(ToolInstance::new(call.id.clone(), tool, parameters, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A simple test tool for unit tests.
    struct EchoTool {
        signature: ToolSignature,
        options: Vec<ToolOption>,
    }

    impl EchoTool {
        fn new() -> Self {
            Self {
                signature: ToolSignature::new("echo", "Echoes back the input")
                    .param(ToolParameter::new("text", ParameterType::String).required())
                    .param(ToolParameter::new("times", ParameterType::Integer))
                    .param(
                        ToolParameter::new("style", ParameterType::String).one_of(&["loud", "quiet"]),
                    ),
                options: vec![
                    ToolOption {
                        name: "shout".into(),
                        description: String::new(),
                        kind: ToolOptionKind::Boolean {
                            default: Some(false),
                        },
                    },
                    ToolOption {
                        name: "model".into(),
                        description: String::new(),
                        kind: ToolOptionKind::LlmReference,
                    },
                ],
            }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn signature(&self) -> &ToolSignature {
            &self.signature
        }

        fn options(&self) -> &[ToolOption] {
            &self.options
        }

        fn chain_next_response(&self, params: &ToolParams, _output: &ToolOutput) -> bool {
            params.get("style").and_then(Value::as_str) != Some("quiet")
        }

        async fn invoke(
            &self,
            params: &ToolParams,
            ctx: &ToolContext,
        ) -> std::result::Result<ToolOutput, ToolError> {
            let mut text = params["text"].as_str().unwrap_or("").to_string();
            if ctx.option_bool("shout") == Some(true) {
                text = text.to_uppercase();
            }
            Ok(ToolOutput::new(json!({ "echo": text })).with_custom_raw(format!("> {text}")))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::new()));
        registry
    }

    fn call(args: Value, partial: bool) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: "echo".into(),
            arguments: args.as_object().cloned().unwrap_or_default(),
            partial,
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let registry = registry();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn registry_signatures_skip_unknown() {
        let registry = registry();
        let sigs = registry.signatures_for(&["echo".into(), "missing".into()]);
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].name, "echo");
    }

    #[test]
    fn json_schema_lists_required() {
        let schema = EchoTool::new().signature.json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["text"]));
        assert_eq!(schema["properties"]["times"]["type"], "integer");
        assert_eq!(schema["properties"]["style"]["enum"], json!(["loud", "quiet"]));
    }

    #[test]
    fn parse_arguments_coerces_types() {
        let sig = ToolSignature::new("t", "")
            .param(ToolParameter::new("n", ParameterType::Integer))
            .param(ToolParameter::new("flag", ParameterType::Boolean))
            .param(ToolParameter::new("tags", ParameterType::Array).items(ParameterType::String))
            .param(ToolParameter::new("ids", ParameterType::Array).items(ParameterType::Integer))
            .param(ToolParameter::new("s", ParameterType::String));
        let args = json!({
            "n": "42",
            "flag": "TRUE",
            "tags": "rust",
            "ids": "[1, \"2\"]",
            "s": 7,
            "extra": "dropped"
        });
        let parsed = sig
            .parse_arguments(args.as_object().unwrap(), false)
            .unwrap();
        assert_eq!(parsed["n"], json!(42));
        assert_eq!(parsed["flag"], json!(true));
        assert_eq!(parsed["tags"], json!(["rust"]));
        assert_eq!(parsed["ids"], json!([1, 2]));
        assert_eq!(parsed["s"], json!("7"));
        assert!(!parsed.contains_key("extra"));
    }

    #[test]
    fn integer_parameters_reject_fractions() {
        let sig = ToolSignature::new("t", "").param(ToolParameter::new("n", ParameterType::Integer));

        let whole = sig
            .parse_arguments(json!({"n": 3.0}).as_object().unwrap(), false)
            .unwrap();
        assert_eq!(whole["n"], json!(3));

        let err = sig
            .parse_arguments(json!({"n": 1.7}).as_object().unwrap(), false)
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        assert!(sig
            .parse_arguments(json!({"n": "1.7"}).as_object().unwrap(), false)
            .is_err());
    }

    #[test]
    fn parse_arguments_rejects_missing_required() {
        let sig = EchoTool::new().signature;
        let err = sig
            .parse_arguments(json!({}).as_object().unwrap(), false)
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn parse_arguments_enforces_enum() {
        let sig = EchoTool::new().signature;
        let args = json!({"text": "hi", "style": "angry"});
        assert!(sig.parse_arguments(args.as_object().unwrap(), false).is_err());
        let lenient = sig.parse_arguments(args.as_object().unwrap(), true).unwrap();
        assert!(!lenient.contains_key("style"));
    }

    #[test]
    fn lenient_parse_tolerates_partial_arguments() {
        let sig = EchoTool::new().signature;
        let args = json!({"times": "not yet"});
        let parsed = sig.parse_arguments(args.as_object().unwrap(), true).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn options_merge_overrides_over_defaults() {
        let tool = EchoTool::new();
        let defaults = resolve_options("echo", tool.options(), None).unwrap();
        assert_eq!(defaults["shout"], json!(false));
        assert!(!defaults.contains_key("model"));

        let overrides = json!({"shout": "true", "model": "small", "unknown": 1});
        let merged =
            resolve_options("echo", tool.options(), overrides.as_object()).unwrap();
        assert_eq!(merged["shout"], json!(true));
        assert_eq!(merged["model"], json!("small"));
        assert!(!merged.contains_key("unknown"));
    }

    #[test]
    fn invalid_option_override_is_rejected() {
        let tool = EchoTool::new();
        let overrides = json!({"shout": "sometimes"});
        let err = resolve_options("echo", tool.options(), overrides.as_object()).unwrap_err();
        assert!(err.to_string().contains("shout"));
    }

    #[test]
    fn enum_option_falls_back_to_default() {
        let options = vec![ToolOption {
            name: "size".into(),
            description: String::new(),
            kind: ToolOptionKind::Enum {
                values: vec!["small".into(), "large".into()],
                default: Some("small".into()),
            },
        }];
        let resolved = resolve_options("img", &options, None).unwrap();
        assert_eq!(resolved["size"], json!("small"));
        let bad = json!({"size": "huge"});
        assert!(resolve_options("img", &options, bad.as_object()).is_err());
    }

    #[tokio::test]
    async fn resolve_and_invoke_instance() {
        let registry = registry();
        let overrides = json!({"shout": true, "model": "small"});
        let mut instance = registry
            .resolve(
                &call(json!({"text": "hello"}), false),
                &ToolContext::default(),
                overrides.as_object(),
            )
            .unwrap();
        assert_eq!(instance.call_id(), "call_1");
        assert_eq!(instance.llm_reference(), Some("small"));

        let result = instance.invoke().await.unwrap();
        assert_eq!(result, json!({"echo": "HELLO"}));
        assert_eq!(instance.custom_raw(), Some("> HELLO"));
        assert!(instance.chain_next_response());
    }

    #[tokio::test]
    async fn chain_decision_comes_from_the_tool() {
        let registry = registry();
        let mut instance = registry
            .resolve(
                &call(json!({"text": "hi", "style": "quiet"}), false),
                &ToolContext::default(),
                None,
            )
            .unwrap();
        instance.invoke().await.unwrap();
        assert!(!instance.chain_next_response());
    }

    #[tokio::test]
    async fn resolve_missing_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .resolve(&call(json!({}), false), &ToolContext::default(), None)
            .err()
            .unwrap();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn partial_render_is_none_without_support() {
        let registry = registry();
        let instance = registry
            .resolve(&call(json!({"te": "h"}), true), &ToolContext::default(), None)
            .unwrap();
        assert!(instance.render_partial().await.is_none());
    }

    #[test]
    fn progress_reporter_forwards() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = ProgressReporter::new(move |t| sink.lock().unwrap().push(t));
        progress.report("half way");
        ProgressReporter::noop().report("ignored");
        assert_eq!(*seen.lock().unwrap(), vec!["half way".to_string()]);
    }
}
