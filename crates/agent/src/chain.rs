//! Per-reply chaining state.

use std::collections::{HashSet, VecDeque};

use agora_core::{Persona, ToolCall, ToolChoice};

/// Counters and queues for one `reply`. Created at the start of the reply
/// and dropped at its end.
///
/// Tool-call ids are treated as reply-scoped: a finalized call is resolved
/// at most once per `(name, id)` within a reply, and ids seen in earlier
/// replies are not remembered.
#[derive(Debug, Default)]
pub struct ChainState {
    completions: u32,
    tools_executed: u32,
    resolved: HashSet<(String, String)>,
    tools_run: HashSet<String>,
    forced: VecDeque<String>,
}

impl ChainState {
    /// Start a reply. `offered` are the tools present in the prompt; forced
    /// tools not among them are skipped.
    pub fn new(persona: &Persona, user_turns: usize, offered: &HashSet<String>) -> Self {
        let forced = if persona.forcing_allowed(user_turns) {
            persona
                .forced_tools
                .iter()
                .filter(|name| offered.contains(*name))
                .cloned()
                .collect()
        } else {
            VecDeque::new()
        };
        Self {
            forced,
            ..Default::default()
        }
    }

    /// Tool choice for the next completion.
    ///
    /// Once `max_completions - 1` completions have run the choice is
    /// `None`, so the last completion is plain text. Otherwise the next
    /// forced tool that has not run yet is chosen, each at most once.
    pub fn next_tool_choice(&mut self, max_completions: u32) -> ToolChoice {
        if self.completions + 1 >= max_completions {
            return ToolChoice::None;
        }
        while let Some(name) = self.forced.pop_front() {
            if !self.has_run(&name) {
                return ToolChoice::Tool(name);
            }
        }
        ToolChoice::Auto
    }

    pub fn record_completion(&mut self) {
        self.completions += 1;
    }

    /// Claim a finalized call. False if the same call was already resolved.
    pub fn try_resolve(&mut self, call: &ToolCall) -> bool {
        self.resolved.insert((call.name.clone(), call.id.clone()))
    }

    pub fn record_tool(&mut self, name: &str) {
        self.tools_executed += 1;
        self.tools_run.insert(name.to_string());
    }

    pub fn completions(&self) -> u32 {
        self.completions
    }

    pub fn tools_executed(&self) -> u32 {
        self.tools_executed
    }

    fn has_run(&self, name: &str) -> bool {
        self.tools_run.contains(name)
    }

    /// Forced tools not yet handed out.
    #[cfg(test)]
    fn pending_forced(&self) -> impl Iterator<Item = &str> {
        self.forced.iter().map(String::as_str)
    }
}
