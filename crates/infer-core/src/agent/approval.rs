//! Tool approval policies
//!
//! A policy answers one question per tool call: does a human need to sign
//! off before it runs? Policies are pure; the same call and mode always
//! produce the same answer.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ai::types::AiToolCall;
use crate::config::{ApprovalConfig, BashWhitelist};
use crate::tools::registry::{tool_category, ToolCategory};

/// How tool calls are gated for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Mutating tools ask first, read-only tools run freely
    #[default]
    Standard,
    /// Every tool call asks first
    Plan,
    /// Nothing asks
    AutoAccept,
}

impl AgentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentMode::Standard => "standard",
            AgentMode::Plan => "plan",
            AgentMode::AutoAccept => "auto_accept",
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "standard" => Ok(AgentMode::Standard),
            "plan" => Ok(AgentMode::Plan),
            "auto_accept" | "auto" => Ok(AgentMode::AutoAccept),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// Decides whether a tool call needs user approval
pub trait ApprovalPolicy: Send + Sync {
    fn should_require_approval(&self, call: &AiToolCall, is_chat_mode: bool) -> bool;

    fn name(&self) -> &'static str;
}

/// Build the policy for a mode.
pub fn policy_for_mode(mode: AgentMode, config: &ApprovalConfig) -> Arc<dyn ApprovalPolicy> {
    match mode {
        AgentMode::Standard => Arc::new(StandardPolicy::from_config(config)),
        AgentMode::Plan => Arc::new(PlanOnlyPolicy),
        AgentMode::AutoAccept => Arc::new(AutoAcceptPolicy),
    }
}

/// Never asks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAcceptPolicy;

impl ApprovalPolicy for AutoAcceptPolicy {
    fn should_require_approval(&self, _call: &AiToolCall, _is_chat_mode: bool) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "auto_accept"
    }
}

/// Always asks, regardless of tool or mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOnlyPolicy;

impl ApprovalPolicy for PlanOnlyPolicy {
    fn should_require_approval(&self, _call: &AiToolCall, _is_chat_mode: bool) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "plan"
    }
}

/// Asks for state-mutating tools unless config or the bash whitelist says
/// otherwise.
#[derive(Debug, Clone)]
pub struct StandardPolicy {
    require_approval: bool,
    overrides: HashMap<String, bool>,
    whitelist: BashWhitelistMatcher,
}

impl Default for StandardPolicy {
    fn default() -> Self {
        Self::from_config(&ApprovalConfig::default())
    }
}

impl StandardPolicy {
    pub fn from_config(config: &ApprovalConfig) -> Self {
        Self {
            require_approval: config.require_approval,
            overrides: config.tools.clone(),
            whitelist: BashWhitelistMatcher::new(&config.bash_whitelist),
        }
    }
}

impl ApprovalPolicy for StandardPolicy {
    fn should_require_approval(&self, call: &AiToolCall, is_chat_mode: bool) -> bool {
        // Batch runs have nobody to ask
        if !is_chat_mode {
            return false;
        }

        if call.name == "bash" {
            let command = call
                .arguments
                .get("command")
                .and_then(|c| c.as_str())
                .unwrap_or_default();
            if self.whitelist.allows(command) {
                return false;
            }
        }

        if let Some(&required) = self.overrides.get(&call.name) {
            return required;
        }

        match tool_category(&call.name) {
            ToolCategory::ReadOnly => false,
            ToolCategory::Write => self.require_approval,
        }
    }

    fn name(&self) -> &'static str {
        "standard"
    }
}

/// Compiled bash whitelist.
///
/// A command is allowed only if every segment (split on `;`, `&&`, `||`,
/// `|`, `&`) is allowed, and no segment redirects output or substitutes a
/// subcommand.
#[derive(Debug, Clone, Default)]
pub struct BashWhitelistMatcher {
    commands: Vec<String>,
    patterns: Vec<Regex>,
}

impl BashWhitelistMatcher {
    pub fn new(config: &BashWhitelist) -> Self {
        let patterns = config
            .patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "Ignoring invalid bash whitelist pattern");
                    None
                }
            })
            .collect();
        Self {
            commands: config.commands.clone(),
            patterns,
        }
    }

    pub fn allows(&self, command: &str) -> bool {
        let command = command.trim();
        if command.is_empty() || command.contains("$(") || command.contains('`') {
            return false;
        }
        let segments = split_shell_segments(command);
        !segments.is_empty() && segments.iter().all(|s| self.allows_segment(s))
    }

    fn allows_segment(&self, segment: &str) -> bool {
        if has_unquoted_redirect(segment) {
            return false;
        }
        if self.patterns.iter().any(|re| re.is_match(segment)) {
            return true;
        }
        let tokens = tokenize_shell(segment);
        let tokens = strip_env_prefix(&tokens);
        tokens
            .first()
            .is_some_and(|program| self.commands.iter().any(|c| c == program))
    }
}

fn split_shell_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    let mut chars = command.chars().peekable();

    let mut flush = |current: &mut String| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            segments.push(trimmed.to_string());
        }
        current.clear();
    };

    while let Some(ch) = chars.next() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        match ch {
            '\\' if !in_single => {
                current.push(ch);
                escaped = true;
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            ';' if !in_single && !in_double => flush(&mut current),
            '|' | '&' if !in_single && !in_double => {
                if chars.peek() == Some(&ch) {
                    chars.next();
                }
                flush(&mut current);
            }
            _ => current.push(ch),
        }
    }
    flush(&mut current);

    segments
}

fn tokenize_shell(segment: &str) -> Vec<String> {
    shell_words::split(segment).unwrap_or_else(|_| {
        segment
            .split_whitespace()
            .map(ToString::to_string)
            .collect()
    })
}

fn is_env_assignment(token: &str) -> bool {
    let Some((key, _)) = token.split_once('=') else {
        return false;
    };
    !key.is_empty() && key.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn strip_env_prefix(tokens: &[String]) -> &[String] {
    let idx = tokens
        .iter()
        .position(|t| !is_env_assignment(t))
        .unwrap_or(tokens.len());
    &tokens[idx..]
}

fn has_unquoted_redirect(segment: &str) -> bool {
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for ch in segment.chars() {
        if escaped {
            escaped = false;
            continue;
        }

        match ch {
            '\\' if !in_single => escaped = true,
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '>' if !in_single && !in_double => return true,
            _ => {}
        }
    }

    false
}
