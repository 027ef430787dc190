//! Pipeline tunables loaded from an optional TOML file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Pipeline configuration (TOML).
///
/// Every field has a default, so a missing file or a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub agent: AgentConfig,
    pub callback: CallbackConfig,
    pub hosting: HostingConfig,
    pub git: GitIdentityConfig,
    pub post_actions: PostActionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable (resolved through `PATH`).
    pub command: String,
    /// Wall-clock limit for one agent run.
    pub timeout_secs: u64,
    /// Bytes of agent stdout kept in memory for extraction. The execution file is not bounded.
    pub output_limit_bytes: usize,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            timeout_secs: 60 * 60,
            output_limit_bytes: 16 * 1024 * 1024,
            model: None,
            max_turns: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CallbackConfig {
    pub timeout_secs: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostingConfig {
    /// Per-request timeout for hosting API and token exchange calls.
    pub timeout_secs: u64,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// Commit identity used when the bot account cannot be looked up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitIdentityConfig {
    pub user_name: String,
    pub user_email: String,
}

impl Default for GitIdentityConfig {
    fn default() -> Self {
        Self {
            user_name: "devsy-bot".to_string(),
            user_email: "no-reply@devsy.ai".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PostActionsConfig {
    /// Open the pull request ourselves when the agent pushed but did not open one.
    pub open_pr_if_pushed: bool,
    /// Leave a status comment on the pull request after an update run.
    pub comment_on_update: bool,
}

impl Default for PostActionsConfig {
    fn default() -> Self {
        Self {
            open_pr_if_pushed: true,
            comment_on_update: false,
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must not be empty"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.agent.max_turns == Some(0) {
            return Err(anyhow!("agent.max_turns must be > 0 when set"));
        }
        if self.callback.timeout_secs == 0 {
            return Err(anyhow!("callback.timeout_secs must be > 0"));
        }
        if self.hosting.timeout_secs == 0 {
            return Err(anyhow!("hosting.timeout_secs must be > 0"));
        }
        if self.git.user_name.trim().is_empty() || self.git.user_email.trim().is_empty() {
            return Err(anyhow!("git.user_name and git.user_email must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// `None` or a missing file yields `PipelineConfig::default()`.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let Some(path) = path.filter(|p| p.exists()) else {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    };
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    debug!(path = %path.display(), "loaded config");
    Ok(cfg)
}
