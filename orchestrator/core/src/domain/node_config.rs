// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Orchestrator Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) describing:
// - concurrency bounds for coding and verification workers
// - the external session runner command
// - the work item database
// - policy file locations
// - logging and observation channel settings
//
// The org-level command policy may live in the same file under a top-level
// `commands:` key; that key is read by the policy loader and ignored here.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const API_VERSION: &str = "autobuild.dev/v1";
pub const KIND: &str = "OrchestratorConfig";

/// Upper bound for `max_parallel_agents`, independent of configuration.
pub const PARALLEL_AGENTS_CEILING: usize = 5;

/// Top-level configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfigManifest {
    /// API version (must be "autobuild.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "OrchestratorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: OrchestratorConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfigSpec {
    #[serde(default)]
    pub orchestrator: SchedulingConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Concurrency bounds and retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Concurrent coding workers; verification workers share the same cap.
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,

    /// Hard ceiling on concurrent worker processes of any role.
    #[serde(default = "default_max_total_agents")]
    pub max_total_agents: usize,

    /// Skip verification passes entirely.
    #[serde(default)]
    pub fast_path: bool,

    /// Passing items re-checked per verification pass.
    #[serde(default = "default_regression_sample_size")]
    pub regression_sample_size: usize,

    /// Failed or crashed attempts before an item is skipped for good.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Time between SIGTERM and SIGKILL on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Exit codes a runner uses to report it could not finish its item.
    #[serde(default = "default_reported_failure_codes")]
    pub reported_failure_codes: Vec<i32>,
}

/// External session runner invocation. The supervisor appends
/// `--project-dir <dir> --role <role>` to `args`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_runner_program")]
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Relative paths resolve against the project directory.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Org-level policy file; defaults to `~/.autobuild/config.yaml`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_file: Option<PathBuf>,

    /// Project policy file relative to the project directory; defaults to
    /// `.autobuild/allowed_commands.yaml`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observation channel buffer; slow subscribers lag past this.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,

    /// compact or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_max_parallel_agents() -> usize {
    3
}

fn default_max_total_agents() -> usize {
    10
}

fn default_regression_sample_size() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_reported_failure_codes() -> Vec<i32> {
    vec![2]
}

fn default_runner_program() -> String {
    "autobuild-session".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".autobuild/features.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_event_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel_agents(),
            max_total_agents: default_max_total_agents(),
            fast_path: false,
            regression_sample_size: default_regression_sample_size(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            reported_failure_codes: default_reported_failure_codes(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: default_runner_program(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for OrchestratorConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "autobuild".to_string(),
                version: None,
                labels: None,
            },
            spec: OrchestratorConfigSpec::default(),
        }
    }
}

impl DatabaseConfig {
    pub fn resolve_path(&self, project_dir: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            project_dir.join(&self.path)
        }
    }
}

impl OrchestratorConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AUTOBUILD_CONFIG_PATH environment variable
    /// 2. ./autobuild-config.yaml (working directory)
    /// 3. ~/.autobuild/config.yaml (user home)
    /// 4. /etc/autobuild/config.yaml (Unix only)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AUTOBUILD_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./autobuild-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        // The home file doubles as the org policy file; only treat it as a
        // manifest when it declares one.
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".autobuild").join("config.yaml");
            if declares_manifest(&user_config) {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/autobuild/config.yaml");
            if system_config.exists() {
                return Some(system_config);
            }
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .with_context(|| format!("failed to load config at {:?}", path))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::debug!("No configuration file found in standard locations, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variable overrides for container and CI use.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AUTOBUILD_MAX_PARALLEL_AGENTS") {
            match val.parse::<usize>() {
                Ok(n) => {
                    tracing::info!("Environment override: AUTOBUILD_MAX_PARALLEL_AGENTS={}", n);
                    self.spec.orchestrator.max_parallel_agents = n;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for AUTOBUILD_MAX_PARALLEL_AGENTS: '{}'. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("AUTOBUILD_FAST_PATH") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: AUTOBUILD_FAST_PATH=true");
                    self.spec.orchestrator.fast_path = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: AUTOBUILD_FAST_PATH=false");
                    self.spec.orchestrator.fast_path = false;
                }
                _ => tracing::warn!(
                    "Invalid value for AUTOBUILD_FAST_PATH: '{}'. Expected true/false. Ignoring.",
                    val
                ),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let sched = &self.spec.orchestrator;
        if sched.max_parallel_agents == 0 || sched.max_parallel_agents > PARALLEL_AGENTS_CEILING {
            anyhow::bail!(
                "spec.orchestrator.max_parallel_agents must be between 1 and {} (got {})",
                PARALLEL_AGENTS_CEILING,
                sched.max_parallel_agents
            );
        }
        if sched.max_parallel_agents > sched.max_total_agents {
            anyhow::bail!(
                "spec.orchestrator.max_parallel_agents ({}) exceeds max_total_agents ({})",
                sched.max_parallel_agents,
                sched.max_total_agents
            );
        }
        if sched.max_attempts == 0 {
            anyhow::bail!("spec.orchestrator.max_attempts must be at least 1");
        }
        if sched.reported_failure_codes.contains(&0) {
            anyhow::bail!("spec.orchestrator.reported_failure_codes cannot contain 0");
        }

        if self.spec.runner.program.trim().is_empty() {
            anyhow::bail!("spec.runner.program cannot be empty");
        }

        match self.spec.observability.logging.format.as_str() {
            "compact" | "json" => {}
            other => anyhow::bail!(
                "spec.observability.logging.format must be 'compact' or 'json' (got '{}')",
                other
            ),
        }

        Ok(())
    }
}

fn declares_manifest(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_yaml::from_str::<serde_yaml::Value>(&content).ok())
        .map(|value| value.get("apiVersion").is_some())
        .unwrap_or(false)
}
