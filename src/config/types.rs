//! Configuration types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the agent's provider.
pub const ENV_PROVIDER: &str = "LLM_PROVIDER";
/// Environment variable overriding the agent's model.
pub const ENV_MODEL: &str = "LLM_MODEL_NAME";
/// Environment variable overriding the agent binary.
pub const ENV_BINARY: &str = "PI_BINARY";
/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// How to launch the agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent executable, looked up on `PATH`.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Model provider passed as `--provider`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model passed as `--model`.
    #[serde(default = "default_model")]
    pub model: Option<String>,
    /// Run without persisting sessions.
    #[serde(default = "default_true")]
    pub no_session: bool,
    /// Directory for persisted sessions.
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    /// Tool allow-list passed as `--tools`.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    /// Extra arguments appended verbatim.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Working directory of the agent.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Seconds to wait for the agent to exit after stdin closes.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_binary() -> String {
    "pi".to_string()
}

fn default_provider() -> String {
    "lmstudio".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_model() -> Option<String> {
    Some("qwen/qwen3-coder-30b".to_string())
}

fn default_true() -> bool {
    true
}

fn default_stop_timeout_secs() -> u64 {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            provider: default_provider(),
            model: default_model(),
            no_session: true,
            session_dir: None,
            tools: None,
            extra_args: Vec::new(),
            working_dir: None,
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

/// Prompt handling and pool limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Seconds to wait for a prompt's terminal event.
    #[serde(default = "default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,
    /// Seconds to drain events after aborting a timed-out prompt.
    #[serde(default = "default_abort_grace_secs")]
    pub abort_grace_secs: u64,
    /// Maximum concurrent chats; 0 means unbounded.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Disable truncation in terminal output.
    #[serde(default)]
    pub raw_output: bool,
}

fn default_prompt_timeout_secs() -> u64 {
    120
}

fn default_abort_grace_secs() -> u64 {
    5
}

fn default_max_sessions() -> usize {
    16
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            prompt_timeout_secs: default_prompt_timeout_secs(),
            abort_grace_secs: default_abort_grace_secs(),
            max_sessions: default_max_sessions(),
            raw_output: false,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    /// Default log filter when neither `RUST_LOG` nor `-v` is given.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            relay: RelaySettings::default(),
            log_level: default_log_level(),
        }
    }
}

impl RelayConfig {
    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(provider) = get(ENV_PROVIDER) {
            self.agent.provider = provider;
        }
        if let Some(model) = get(ENV_MODEL) {
            self.agent.model = Some(model);
        }
        if let Some(binary) = get(ENV_BINARY) {
            self.agent.binary = binary;
        }
        if let Some(level) = get(ENV_LOG_LEVEL) {
            self.log_level = level.to_ascii_lowercase();
        }
    }
}
