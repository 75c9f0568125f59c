//! Persona: a named bundle of system instructions, tools and response policy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::tool::ToolParams;

/// An example exchange injected before the live history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleExchange {
    pub user: String,
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,

    /// Template; may contain `{placeholder}` tokens
    #[serde(default)]
    pub system_prompt: String,

    /// Tool names offered to the model
    #[serde(default)]
    pub tools: Vec<String>,

    /// Tools that must run before free-form replies resume
    #[serde(default)]
    pub forced_tools: Vec<String>,

    /// Stop forcing once the conversation has more user turns than this
    #[serde(default)]
    pub forced_tool_count: Option<u32>,

    #[serde(default)]
    pub examples: Vec<ExampleExchange>,

    /// Documents searched for guidance fragments
    #[serde(default)]
    pub reference_documents: Vec<String>,

    /// JSON schema the final response must follow
    #[serde(default)]
    pub response_format: Option<serde_json::Value>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub top_p: Option<f32>,

    /// Per-tool option overrides, keyed by tool name
    #[serde(default)]
    pub tool_options: HashMap<String, ToolParams>,
}

impl Persona {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_forced_tools(mut self, tools: &[&str], count: Option<u32>) -> Self {
        self.forced_tools = tools.iter().map(|t| t.to_string()).collect();
        self.forced_tool_count = count;
        self
    }

    pub fn with_example(mut self, user: impl Into<String>, model: impl Into<String>) -> Self {
        self.examples.push(ExampleExchange {
            user: user.into(),
            model: model.into(),
        });
        self
    }

    pub fn with_reference_documents(mut self, documents: &[&str]) -> Self {
        self.reference_documents = documents.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_tool_options(mut self, tool: impl Into<String>, options: ToolParams) -> Self {
        self.tool_options.insert(tool.into(), options);
        self
    }

    pub fn tool_options_for(&self, tool: &str) -> Option<&ToolParams> {
        self.tool_options.get(tool)
    }

    /// Whether forcing is still allowed after `user_turns` user messages.
    pub fn forcing_allowed(&self, user_turns: usize) -> bool {
        match self.forced_tool_count {
            Some(limit) => user_turns <= limit as usize,
            None => true,
        }
    }
}
