// Layered configuration system
//
// Priority: caller overrides -> project config -> global config -> defaults.
// Files are TOML; keys may be camelCase or snake_case; unknown keys are
// ignored so older configs keep loading.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::agents::AgentType;
use crate::critic::CriticConfig;
use crate::models::{BranchStrategy, TeamMode};
use crate::retry::RetryConfig;

/// Engine configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Scheduling settings
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Git and worktree settings
    #[serde(default)]
    pub git: GitConfig,
    /// Critic review settings
    #[serde(default)]
    pub critic: CriticConfig,
    /// Retry settings for remote VCS calls
    #[serde(default)]
    pub retry: RetryConfig,
    /// GitHub settings, required only for the raise_prs strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GithubConfig>,
}

/// Scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum concurrently executing agents per plan
    #[serde(
        rename = "maxParallelAgents",
        alias = "max_parallel_agents",
        default = "default_max_parallel_agents"
    )]
    pub max_parallel_agents: u32,
    /// Seconds a cancelled agent gets to stop before being force-finalized
    #[serde(
        rename = "cancelGraceSecs",
        alias = "cancel_grace_secs",
        default = "default_cancel_grace_secs"
    )]
    pub cancel_grace_secs: u64,
    /// Default team mode for new plans
    #[serde(rename = "teamMode", alias = "team_mode", default)]
    pub team_mode: TeamMode,
    /// Default branch strategy for new plans
    #[serde(rename = "branchStrategy", alias = "branch_strategy", default)]
    pub branch_strategy: BranchStrategy,
    /// Agent CLI used for workers and critics
    #[serde(rename = "agentType", alias = "agent_type", default)]
    pub agent_type: AgentType,
    /// Model override passed through to the runner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_max_parallel_agents() -> u32 {
    2
}

fn default_cancel_grace_secs() -> u64 {
    30
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel_agents(),
            cancel_grace_secs: default_cancel_grace_secs(),
            team_mode: TeamMode::default(),
            branch_strategy: BranchStrategy::default(),
            agent_type: AgentType::default(),
            model: None,
        }
    }
}

/// Git configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GitConfig {
    /// Branch task branches start from. Repo HEAD when unset.
    #[serde(rename = "baseBranch", alias = "base_branch", default)]
    pub base_branch: Option<String>,
    /// Directory worktrees are created under.
    /// `<project>/.ralph-engine/worktrees` when unset.
    #[serde(rename = "worktreeBase", alias = "worktree_base", default)]
    pub worktree_base: Option<String>,
}

/// GitHub settings for pushing branches and opening pull requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    pub owner: String,
    pub repo: String,
    pub token: String,
}

/// Partial overlay. Every present field overrides the layer below it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialEngineConfig {
    #[serde(default)]
    pub execution: Option<PartialExecutionConfig>,
    #[serde(default)]
    pub git: Option<PartialGitConfig>,
    #[serde(default)]
    pub critic: Option<CriticConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub github: Option<GithubConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialExecutionConfig {
    #[serde(rename = "maxParallelAgents", alias = "max_parallel_agents", default)]
    pub max_parallel_agents: Option<u32>,
    #[serde(rename = "cancelGraceSecs", alias = "cancel_grace_secs", default)]
    pub cancel_grace_secs: Option<u64>,
    #[serde(rename = "teamMode", alias = "team_mode", default)]
    pub team_mode: Option<TeamMode>,
    #[serde(rename = "branchStrategy", alias = "branch_strategy", default)]
    pub branch_strategy: Option<BranchStrategy>,
    #[serde(rename = "agentType", alias = "agent_type", default)]
    pub agent_type: Option<AgentType>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialGitConfig {
    #[serde(rename = "baseBranch", alias = "base_branch", default)]
    pub base_branch: Option<String>,
    #[serde(rename = "worktreeBase", alias = "worktree_base", default)]
    pub worktree_base: Option<String>,
}

impl EngineConfig {
    /// Overlay a partial config onto this one.
    pub fn apply(&mut self, partial: PartialEngineConfig) {
        if let Some(execution) = partial.execution {
            if let Some(value) = execution.max_parallel_agents {
                self.execution.max_parallel_agents = value;
            }
            if let Some(value) = execution.cancel_grace_secs {
                self.execution.cancel_grace_secs = value;
            }
            if let Some(value) = execution.team_mode {
                self.execution.team_mode = value;
            }
            if let Some(value) = execution.branch_strategy {
                self.execution.branch_strategy = value;
            }
            if let Some(value) = execution.agent_type {
                self.execution.agent_type = value;
            }
            if let Some(value) = execution.model {
                self.execution.model = Some(value);
            }
        }
        if let Some(git) = partial.git {
            if let Some(value) = git.base_branch {
                self.git.base_branch = Some(value);
            }
            if let Some(value) = git.worktree_base {
                self.git.worktree_base = Some(value);
            }
        }
        if let Some(critic) = partial.critic {
            self.critic = critic;
        }
        if let Some(retry) = partial.retry {
            self.retry = retry;
        }
        if let Some(github) = partial.github {
            self.github = Some(github);
        }
    }

    /// Validate config values
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_parallel_agents == 0 {
            return Err(anyhow!("max_parallel_agents must be greater than 0"));
        }
        if self.critic.max_iterations == 0 {
            return Err(anyhow!("critic max_iterations must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry max_attempts must be greater than 0"));
        }
        Ok(())
    }
}

/// Config loader
pub struct ConfigLoader {
    global_path: Option<PathBuf>,
    project_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            global_path: Self::get_global_config_path(),
            project_path: None,
        }
    }

    pub fn with_project_path(mut self, path: &Path) -> Self {
        self.project_path = Some(path.join(".ralph-engine").join("config.toml"));
        self
    }

    fn get_global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ralph-engine").join("config.toml"))
    }

    pub fn load_global(&self) -> Result<Option<PartialEngineConfig>> {
        match self.global_path {
            Some(ref path) => self.load_from_path(path),
            None => Ok(None),
        }
    }

    pub fn load_project(&self) -> Result<Option<PartialEngineConfig>> {
        match self.project_path {
            Some(ref path) => self.load_from_path(path),
            None => Ok(None),
        }
    }

    /// Load a partial config from a specific path. Missing file is not an
    /// error; a malformed file is.
    pub fn load_from_path(&self, path: &Path) -> Result<Option<PartialEngineConfig>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file '{}': {}", path.display(), e))?;

        let partial: PartialEngineConfig = toml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;

        Ok(Some(partial))
    }

    pub fn global_config_path(&self) -> Option<&Path> {
        self.global_path.as_deref()
    }

    pub fn project_config_path(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Load and merge configuration from all sources.
/// Priority: overrides -> project -> global -> defaults.
pub fn load_merged_config(
    project_path: Option<&Path>,
    overrides: Option<PartialEngineConfig>,
) -> Result<EngineConfig> {
    let loader = match project_path {
        Some(path) => ConfigLoader::new().with_project_path(path),
        None => ConfigLoader::new(),
    };

    let mut config = EngineConfig::default();

    // A missing file layers nothing; a malformed file is an error, never a
    // silent fall-through to defaults.
    if let Some(global) = loader.load_global()? {
        config.apply(global);
    }
    if let Some(project) = loader.load_project()? {
        config.apply(project);
    }
    if let Some(overrides) = overrides {
        config.apply(overrides);
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_values() {
        let config = EngineConfig::default();

        assert_eq!(config.execution.max_parallel_agents, 2);
        assert_eq!(config.execution.cancel_grace_secs, 30);
        assert_eq!(config.execution.team_mode, TeamMode::TopDown);
        assert_eq!(
            config.execution.branch_strategy,
            BranchStrategy::FeatureBranch
        );
        assert!(config.git.base_branch.is_none());
        assert!(config.github.is_none());
        assert_eq!(config.critic.max_iterations, 3);
        assert_eq!(config.execution.agent_type, AgentType::Claude);
        assert!(config.execution.model.is_none());
    }

    #[test]
    fn test_load_merged_config_with_project() {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join(".ralph-engine");
        fs::create_dir_all(&config_dir).unwrap();

        let config_content = r#"
[execution]
max_parallel_agents = 5
cancel_grace_secs = 10

[git]
base_branch = "main"
"#;
        fs::write(config_dir.join("config.toml"), config_content).unwrap();

        let config = load_merged_config(Some(temp_dir.path()), None).unwrap();
        assert_eq!(config.execution.max_parallel_agents, 5);
        assert_eq!(config.execution.cancel_grace_secs, 10);
        assert_eq!(config.git.base_branch, Some("main".to_string()));
        // Unset keys fall back to defaults
        assert_eq!(config.execution.team_mode, TeamMode::TopDown);
    }

    #[test]
    fn test_camel_case_keys_accepted() {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join(".ralph-engine");
        fs::create_dir_all(&config_dir).unwrap();

        let config_content = r#"
[execution]
maxParallelAgents = 4
branchStrategy = "raise_prs"
agentType = "opencode"
"#;
        fs::write(config_dir.join("config.toml"), config_content).unwrap();

        let config = load_merged_config(Some(temp_dir.path()), None).unwrap();
        assert_eq!(config.execution.max_parallel_agents, 4);
        assert_eq!(config.execution.branch_strategy, BranchStrategy::RaisePrs);
        assert_eq!(config.execution.agent_type, AgentType::Opencode);
    }

    #[test]
    fn test_overrides_beat_project_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join(".ralph-engine");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("config.toml"),
            "[execution]\nmax_parallel_agents = 5\n",
        )
        .unwrap();

        let overrides = PartialEngineConfig {
            execution: Some(PartialExecutionConfig {
                max_parallel_agents: Some(8),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = load_merged_config(Some(temp_dir.path()), Some(overrides)).unwrap();
        assert_eq!(config.execution.max_parallel_agents, 8);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join(".ralph-engine");
        fs::create_dir_all(&config_dir).unwrap();

        let config_content = r#"
some_future_key = "value"

[execution]
max_parallel_agents = 3

[some_future_section]
x = 1
"#;
        fs::write(config_dir.join("config.toml"), config_content).unwrap();

        let config = load_merged_config(Some(temp_dir.path()), None).unwrap();
        assert_eq!(config.execution.max_parallel_agents, 3);
    }

    #[test]
    fn test_malformed_project_config_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join(".ralph-engine");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("config.toml"),
            "[execution]\nmax_parallel_agents = \"eight\"\n",
        )
        .unwrap();

        // A typo'd config must surface, not fall back to defaults
        let err = load_merged_config(Some(temp_dir.path()), None).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_validates_max_parallel_greater_than_zero() {
        let overrides = PartialEngineConfig {
            execution: Some(PartialExecutionConfig {
                max_parallel_agents: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };

        let result = load_merged_config(None, Some(overrides));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_project_config_is_not_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let config = load_merged_config(Some(temp_dir.path()), None).unwrap();
        assert_eq!(config.execution.max_parallel_agents, 2);
    }

    #[test]
    fn test_github_section_parsed() {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join(".ralph-engine");
        fs::create_dir_all(&config_dir).unwrap();

        let config_content = r#"
[github]
owner = "acme"
repo = "widgets"
token = "ghp_test"
"#;
        fs::write(config_dir.join("config.toml"), config_content).unwrap();

        let config = load_merged_config(Some(temp_dir.path()), None).unwrap();
        let github = config.github.unwrap();
        assert_eq!(github.owner, "acme");
        assert_eq!(github.repo, "widgets");
    }
}
