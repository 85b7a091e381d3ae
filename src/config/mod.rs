use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::OrchestratorError;
use crate::model::WorkspaceStrategy;

const POLICY_FILENAME: &str = "policy.toml";
pub const CONFIG_DIR: &str = ".metawsm";
const DB_FILENAME: &str = "metawsm.db";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceSettings {
    #[serde(default = "default_strategy")]
    pub default_strategy: WorkspaceStrategy,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TmuxSettings {
    /// Supports `{agent}` and `{workspace}` placeholders.
    #[serde(default = "default_session_pattern")]
    pub session_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSettings {
    #[serde(default = "default_step_retries")]
    pub step_retries: u32,
}

/// Health thresholds, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HealthSettings {
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,
    #[serde(default = "default_activity_stalled_seconds")]
    pub activity_stalled_seconds: u64,
    #[serde(default = "default_progress_stalled_seconds")]
    pub progress_stalled_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloseSettings {
    #[serde(default = "default_require_clean_git")]
    pub require_clean_git: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    Shell,
    Codex,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunnerOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub full_auto: bool,
}

/// How an agent's session command is produced.
///
/// ```toml
/// [[agent_profiles]]
/// name = "implementer"
/// runner = "codex"
/// base_prompt = "Implement the ticket described in the workspace."
/// [agent_profiles.runner_options]
/// full_auto = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub name: String,
    pub runner: RunnerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_prompt: Option<String>,
    #[serde(default)]
    pub runner_options: RunnerOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyAgent {
    pub name: String,
    pub profile: String,
}

fn default_version() -> u32 {
    1
}

fn default_strategy() -> WorkspaceStrategy {
    WorkspaceStrategy::Create
}

fn default_branch_prefix() -> String {
    "task".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_session_pattern() -> String {
    "{agent}-{workspace}".to_string()
}

fn default_step_retries() -> u32 {
    1
}

fn default_idle_seconds() -> u64 {
    300
}

fn default_activity_stalled_seconds() -> u64 {
    900
}

fn default_progress_stalled_seconds() -> u64 {
    1200
}

fn default_require_clean_git() -> bool {
    true
}

fn default_agent_profiles() -> Vec<AgentProfile> {
    vec![AgentProfile {
        name: "default-shell".to_string(),
        runner: RunnerKind::Shell,
        base_prompt: None,
        runner_options: RunnerOptions {
            command: Some("bash".to_string()),
            full_auto: false,
        },
    }]
}

fn default_agents() -> Vec<PolicyAgent> {
    vec![PolicyAgent {
        name: "agent".to_string(),
        profile: "default-shell".to_string(),
    }]
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            branch_prefix: default_branch_prefix(),
            base_branch: default_base_branch(),
        }
    }
}

impl Default for TmuxSettings {
    fn default() -> Self {
        Self {
            session_pattern: default_session_pattern(),
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            step_retries: default_step_retries(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            idle_seconds: default_idle_seconds(),
            activity_stalled_seconds: default_activity_stalled_seconds(),
            progress_stalled_seconds: default_progress_stalled_seconds(),
        }
    }
}

impl Default for CloseSettings {
    fn default() -> Self {
        Self {
            require_clean_git: default_require_clean_git(),
        }
    }
}

/// Policy loaded once by the caller and injected into the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub workspace: WorkspaceSettings,
    #[serde(default)]
    pub tmux: TmuxSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub close: CloseSettings,
    #[serde(default = "default_agent_profiles")]
    pub agent_profiles: Vec<AgentProfile>,
    #[serde(default = "default_agents")]
    pub agents: Vec<PolicyAgent>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            workspace: WorkspaceSettings::default(),
            tmux: TmuxSettings::default(),
            execution: ExecutionSettings::default(),
            health: HealthSettings::default(),
            close: CloseSettings::default(),
            agent_profiles: default_agent_profiles(),
            agents: default_agents(),
        }
    }
}

impl PolicyConfig {
    /// Search upward from `start` for a `.metawsm/policy.toml` file and load it.
    /// Returns the default policy if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_policy_file(start) {
            let config = Self::load_file(&path)?;
            Ok((config, Some(path)))
        } else {
            Ok((PolicyConfig::default(), None))
        }
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: PolicyConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid policy {}", path.display()))?;
        Ok(config)
    }

    fn find_policy_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(POLICY_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Decode the JSON snapshot persisted with a run.
    pub fn from_snapshot(json: &str) -> Result<Self> {
        let config: PolicyConfig =
            serde_json::from_str(json).context("failed to decode policy snapshot")?;
        Ok(config)
    }

    pub fn snapshot(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode policy snapshot")
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let invalid = |message: String| Err(OrchestratorError::Validation(message));

        if self.version == 0 {
            return invalid("policy version must be > 0".to_string());
        }
        if self.tmux.session_pattern.trim().is_empty() {
            return invalid("tmux.session_pattern cannot be empty".to_string());
        }
        if self.workspace.base_branch.trim().is_empty() {
            return invalid("workspace.base_branch cannot be empty".to_string());
        }

        let health = &self.health;
        if health.idle_seconds == 0
            || health.activity_stalled_seconds == 0
            || health.progress_stalled_seconds == 0
        {
            return invalid("health thresholds must be > 0".to_string());
        }
        if health.activity_stalled_seconds < health.idle_seconds {
            return invalid(
                "health.activity_stalled_seconds must be >= health.idle_seconds".to_string(),
            );
        }

        if self.agent_profiles.is_empty() {
            return invalid("agent_profiles must contain at least one profile".to_string());
        }
        let mut profiles = HashSet::new();
        for profile in &self.agent_profiles {
            let name = profile.name.trim();
            if name.is_empty() {
                return invalid("agent_profiles entries require a name".to_string());
            }
            if !profiles.insert(name) {
                return invalid(format!("duplicate agent profile {name:?}"));
            }
            match profile.runner {
                RunnerKind::Shell => {
                    let command = profile.runner_options.command.as_deref().unwrap_or("");
                    if command.trim().is_empty() {
                        return invalid(format!(
                            "agent profile {name:?} uses runner shell but runner_options.command is empty"
                        ));
                    }
                }
                RunnerKind::Codex => {
                    let prompt = profile.base_prompt.as_deref().unwrap_or("");
                    if prompt.trim().is_empty() {
                        return invalid(format!(
                            "agent profile {name:?} uses runner codex but base_prompt is empty"
                        ));
                    }
                }
            }
        }

        if self.agents.is_empty() {
            return invalid("agents must contain at least one agent".to_string());
        }
        let mut agents = HashSet::new();
        for agent in &self.agents {
            let name = agent.name.trim();
            if name.is_empty() {
                return invalid("agents entries require a name".to_string());
            }
            if !agents.insert(name) {
                return invalid(format!("duplicate agent {name:?}"));
            }
            if !profiles.contains(agent.profile.trim()) {
                return invalid(format!(
                    "agent {name:?} references unknown profile {:?}",
                    agent.profile
                ));
            }
        }
        Ok(())
    }
}

/// Directory holding the policy file and run database for `start`.
///
/// Uses the nearest existing `.metawsm/` above `start`, or `start/.metawsm`.
pub fn state_dir(start: &Path) -> PathBuf {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_DIR);
        if candidate.is_dir() {
            return candidate;
        }
        if !dir.pop() {
            return start.join(CONFIG_DIR);
        }
    }
}

pub fn default_db_path(start: &Path) -> PathBuf {
    state_dir(start).join(DB_FILENAME)
}

/// Write the default policy to `<root>/.metawsm/policy.toml`.
pub fn write_default_policy(root: &Path) -> Result<PathBuf> {
    let dir = root.join(CONFIG_DIR);
    let path = dir.join(POLICY_FILENAME);
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let body = toml::to_string_pretty(&PolicyConfig::default())
        .context("failed to render default policy")?;
    std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
