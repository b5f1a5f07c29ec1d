//! Configuration loading
//!
//! Reads `~/.infer/config.toml`. Every field has a default so a missing or
//! partial file is valid; a handful of environment variables override the
//! gateway settings.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::agent::approval::AgentMode;
use crate::paths;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferConfig {
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
    pub approval: ApprovalConfig,
    pub shells: ShellsConfig,
}

/// OpenAI-compatible gateway endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
    /// Wait for response headers. The body is bounded by the agent's
    /// stream idle timeout instead.
    pub response_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_string(),
            api_key: None,
            connect_timeout_secs: 30,
            response_timeout_secs: 300,
            retry: RetryConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// Retries for gateway requests that fail before the stream opens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub provider: String,
    pub model: String,
    pub system_prompt: Option<String>,
    /// Streaming rounds allowed per turn before it is forced to complete
    pub max_turns: usize,
    /// Seconds without a stream chunk before the stream is abandoned
    pub stream_timeout_secs: u64,
    pub approval_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub max_tool_output_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            system_prompt: None,
            max_turns: 50,
            stream_timeout_secs: 120,
            approval_timeout_secs: 300,
            tool_timeout_secs: 120,
            max_tool_output_chars: 30_000,
        }
    }
}

impl AgentConfig {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// Tool approval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub mode: AgentMode,
    /// Default for state-mutating tools without an explicit override
    pub require_approval: bool,
    /// Per-tool override, keyed by tool name
    pub tools: HashMap<String, bool>,
    pub bash_whitelist: BashWhitelist,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: AgentMode::Standard,
            require_approval: true,
            tools: HashMap::new(),
            bash_whitelist: BashWhitelist::default(),
        }
    }
}

/// Commands that `bash` may run without approval
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BashWhitelist {
    /// Exact program names (first word of each command segment)
    pub commands: Vec<String>,
    /// Regular expressions matched against each full segment
    pub patterns: Vec<String>,
}

impl Default for BashWhitelist {
    fn default() -> Self {
        Self {
            commands: ["ls", "pwd", "echo", "cat", "head", "tail", "wc", "grep", "tree"]
                .into_iter()
                .map(String::from)
                .collect(),
            patterns: vec![
                r"^git (status|log|diff|show|branch)( .*)?$".to_string(),
                r"^cargo (check|tree)( .*)?$".to_string(),
            ],
        }
    }
}

/// Background shell settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellsConfig {
    pub enabled: bool,
    pub max_concurrent: usize,
    /// Ring buffer capacity per shell
    pub buffer_bytes: usize,
    /// Terminal shells older than this are swept by the cleanup routine
    pub retention_minutes: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ShellsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 5,
            buffer_bytes: 1024 * 1024,
            retention_minutes: 60,
            cleanup_interval_secs: 600,
        }
    }
}

impl ShellsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

impl InferConfig {
    /// Load from `path`, or from `~/.infer/config.toml` when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit path
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = paths::config_file();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    tracing::debug!(path = %default_path.display(), "No config file, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: InferConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("INFER_GATEWAY_URL") {
            self.gateway.base_url = url;
        }
        if let Ok(key) = std::env::var("INFER_API_KEY") {
            if !key.is_empty() {
                self.gateway.api_key = Some(key);
            }
        }
        if let Ok(model) = std::env::var("INFER_MODEL") {
            if !model.is_empty() {
                self.agent.model = model;
            }
        }
    }
}
