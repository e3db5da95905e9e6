use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_PROCESS: &str = "default";
pub const DEFAULT_MAX_STEPS_PER_RUN: u32 = 256;
pub const DEFAULT_DEADLINE_CHECK_MS: u64 = 500;
pub const DEFAULT_MAX_CONSECUTIVE_CALLS: u32 = 10;
pub const DEFAULT_MAX_CONCURRENT_WORKERS: usize = 4;
pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 250;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Top-level runtime configuration, read from `conductor.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentProfile>,
    #[serde(default = "default_tools")]
    pub tools: BTreeMap<String, ToolConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            safety: SafetyConfig::default(),
            retry: RetryConfig::default(),
            agents: default_agents(),
            tools: default_tools(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue_capacity: usize,
    /// Process given to tasks created without one.
    pub default_process: String,
    /// Upper bound on steps executed in one uninterrupted process run.
    pub max_steps_per_run: u32,
    pub deadline_check_ms: u64,
    pub event_log: Option<PathBuf>,
    /// Directory of `*.toml` / `*.json` process templates, watched for changes.
    pub process_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_process: DEFAULT_PROCESS.to_string(),
            max_steps_per_run: DEFAULT_MAX_STEPS_PER_RUN,
            deadline_check_ms: DEFAULT_DEADLINE_CHECK_MS,
            event_log: None,
            process_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Worker invocations allowed per tree before a terminal tool call.
    pub max_consecutive_calls: u32,
    pub max_concurrent_workers: usize,
    pub worker_timeout_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_consecutive_calls: DEFAULT_MAX_CONSECUTIVE_CALLS,
            max_concurrent_workers: DEFAULT_MAX_CONCURRENT_WORKERS,
            worker_timeout_secs: DEFAULT_WORKER_TIMEOUT_SECS,
        }
    }
}

impl SafetyConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

/// Retry policy for failed worker invocations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// A reasoning agent the runtime may assign tasks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Context documents attached to every task this agent takes.
    #[serde(default)]
    pub context: Vec<String>,
    /// Tools offered to this agent on every turn.
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClassKind {
    Deterministic,
    Process,
    Terminal,
}

/// One entry of the `[tools.<name>]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub class: ToolClassKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    /// Argument holding an array; one sub-task is created per element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_out: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments, passed through to the worker.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
}

impl ToolConfig {
    fn new(class: ToolClassKind, description: &str) -> Self {
        Self {
            class,
            function: None,
            process: None,
            fan_out: None,
            description: Some(description.to_string()),
            parameters: Value::Null,
        }
    }
}

fn default_agents() -> Vec<AgentProfile> {
    vec![AgentProfile {
        name: "generalist".to_string(),
        description: Some("Handles any task without a better match".to_string()),
        capabilities: Vec::new(),
        context: Vec::new(),
        tools: Vec::new(),
    }]
}

fn default_tools() -> BTreeMap<String, ToolConfig> {
    let mut tools = BTreeMap::new();
    tools.insert(
        "end_task".to_string(),
        ToolConfig::new(
            ToolClassKind::Terminal,
            "Finish the task. Set outcome=\"failed\" to report failure.",
        ),
    );
    tools.insert(
        "add_context".to_string(),
        ToolConfig {
            function: Some("add_context".to_string()),
            ..ToolConfig::new(ToolClassKind::Deterministic, "Attach context documents")
        },
    );
    tools.insert(
        "add_tools".to_string(),
        ToolConfig {
            function: Some("add_tools".to_string()),
            ..ToolConfig::new(ToolClassKind::Deterministic, "Make more tools available")
        },
    );
    tools.insert(
        "request_context".to_string(),
        ToolConfig {
            process: Some("request_context".to_string()),
            ..ToolConfig::new(ToolClassKind::Process, "Fetch documents in a sub-task")
        },
    );
    tools.insert(
        "decompose".to_string(),
        ToolConfig {
            process: Some("decompose".to_string()),
            fan_out: Some("parts".to_string()),
            ..ToolConfig::new(ToolClassKind::Process, "Split the task into parallel parts")
        },
    );
    tools
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::from_toml_str(&fs::read_to_string(path)?)?;
        debug!(
            agents = config.agents.len(),
            tools = config.tools.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and the shape of the agent and tool tables.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Validation(msg));

        if self.runtime.queue_capacity == 0 {
            return invalid("runtime.queue_capacity must be at least 1".into());
        }
        if self.runtime.default_process.trim().is_empty() {
            return invalid("runtime.default_process must not be empty".into());
        }
        if self.runtime.max_steps_per_run == 0 {
            return invalid("runtime.max_steps_per_run must be at least 1".into());
        }
        if self.runtime.deadline_check_ms == 0 {
            return invalid("runtime.deadline_check_ms must be at least 1".into());
        }
        if self.safety.max_consecutive_calls == 0 {
            return invalid("safety.max_consecutive_calls must be at least 1".into());
        }
        if self.safety.max_concurrent_workers == 0 {
            return invalid("safety.max_concurrent_workers must be at least 1".into());
        }
        if self.safety.worker_timeout_secs == 0 {
            return invalid("safety.worker_timeout_secs must be at least 1".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be >= 1.0".into());
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return invalid("retry.initial_backoff_ms exceeds retry.max_backoff_ms".into());
        }

        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return invalid("agent name must not be empty".into());
            }
            if !names.insert(agent.name.as_str()) {
                return invalid(format!("duplicate agent '{}'", agent.name));
            }
        }

        for (name, tool) in &self.tools {
            match tool.class {
                ToolClassKind::Deterministic if tool.function.is_none() => {
                    return invalid(format!("tool '{}' is deterministic but names no function", name));
                }
                ToolClassKind::Process if tool.process.is_none() => {
                    return invalid(format!("tool '{}' triggers a process but names none", name));
                }
                ToolClassKind::Terminal if tool.function.is_some() || tool.process.is_some() => {
                    return invalid(format!("terminal tool '{}' cannot name a function or process", name));
                }
                _ => {}
            }
            if tool.fan_out.is_some() && tool.class != ToolClassKind::Process {
                return invalid(format!("tool '{}' uses fan_out but does not trigger a process", name));
            }
        }
        Ok(())
    }
}
