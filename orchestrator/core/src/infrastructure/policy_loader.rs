// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Policy File Loader
//!
//! Reads the two configurable policy sources and assembles an immutable
//! `PolicyBundle`. A missing file contributes an empty layer; a malformed
//! one is a load error.
//!
//! Org file (`~/.autobuild/config.yaml`, other top-level keys ignored):
//! ```yaml
//! commands:
//!   allow: ["make", "cargo*"]
//!   block: ["curl"]
//! ```
//!
//! Project file (`<project>/.autobuild/allowed_commands.yaml`):
//! ```yaml
//! commands:
//!   - name: ./scripts/seed.sh
//!     description: seeds the dev database
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::domain::command_policy::{LayerKind, PolicyBundle, PolicyError, PolicyLayer};
use crate::domain::node_config::PolicyConfig;

pub const PROJECT_POLICY_FILE: &str = ".autobuild/allowed_commands.yaml";

#[derive(Debug, Default, Deserialize)]
struct OrgPolicyFile {
    #[serde(default)]
    commands: OrgCommands,
}

#[derive(Debug, Default, Deserialize)]
struct OrgCommands {
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    block: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProjectPolicyFile {
    #[serde(default)]
    commands: Vec<ProjectCommand>,
}

/// `description` is accepted and ignored.
#[derive(Debug, Deserialize)]
struct ProjectCommand {
    name: String,
}

#[derive(Debug, Clone)]
pub struct PolicyLoader {
    org_file: Option<PathBuf>,
    project_file: PathBuf,
}

impl PolicyLoader {
    pub fn new(org_file: Option<PathBuf>, project_file: PathBuf) -> Self {
        Self { org_file, project_file }
    }

    /// Resolves file locations from configuration. The org file falls back
    /// to `~/.autobuild/config.yaml`.
    pub fn from_config(config: &PolicyConfig, project_dir: &Path) -> Self {
        let org_file = config.org_file.clone().or_else(default_org_file);
        let project_file = project_dir.join(
            config
                .project_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(PROJECT_POLICY_FILE)),
        );
        Self::new(org_file, project_file)
    }

    pub fn load(&self) -> Result<PolicyBundle, PolicyError> {
        let org: OrgPolicyFile = match &self.org_file {
            Some(path) => read_yaml(path)?.unwrap_or_default(),
            None => OrgPolicyFile::default(),
        };
        let project: ProjectPolicyFile = read_yaml(&self.project_file)?.unwrap_or_default();

        let bundle = PolicyBundle::new(
            PolicyLayer::new(LayerKind::OrgBlocklist, &org.commands.block)?,
            PolicyLayer::new(LayerKind::OrgAllowlist, &org.commands.allow)?,
            PolicyLayer::new(
                LayerKind::ProjectAllowlist,
                project.commands.iter().map(|command| command.name.as_str()),
            )?,
        )?;

        tracing::debug!(
            org_block = org.commands.block.len(),
            org_allow = org.commands.allow.len(),
            project_allow = project.commands.len(),
            "command policy loaded"
        );
        Ok(bundle)
    }
}

fn default_org_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".autobuild").join("config.yaml"))
}

/// `Ok(None)` when the file does not exist.
fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, PolicyError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PolicyError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        }
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_yaml::from_str(&content).map(Some).map_err(|e| PolicyError::Load {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command_policy::authorize;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PolicyLoader::new(
            Some(dir.path().join("absent.yaml")),
            dir.path().join(PROJECT_POLICY_FILE),
        );
        let bundle = loader.load().unwrap();
        assert_eq!(bundle, PolicyBundle::defaults());
    }

    #[test]
    fn test_layers_loaded_from_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let org = write(
            dir.path(),
            "org.yaml",
            "apiVersion: autobuild.dev/v1\ncommands:\n  allow: [make]\n  block: [curl]\n",
        );
        write(
            dir.path(),
            PROJECT_POLICY_FILE,
            "commands:\n  - name: ./scripts/seed.sh\n    description: seed data\n  - name: cargo*\n",
        );

        let bundle = PolicyLoader::new(Some(org), dir.path().join(PROJECT_POLICY_FILE))
            .load()
            .unwrap();

        assert!(authorize("make build", &bundle).is_allowed());
        assert!(authorize("cargo test --workspace", &bundle).is_allowed());
        assert!(!authorize("bash scripts/seed.sh", &bundle).is_allowed());
        assert!(authorize("./scripts/seed.sh", &bundle).is_allowed());
        // org block overrides the global default allowlist
        assert!(!authorize("curl https://example.com", &bundle).is_allowed());
    }

    #[test]
    fn test_oversized_project_layer_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = String::from("commands:\n");
        for i in 0..101 {
            content.push_str(&format!("  - name: tool{}\n", i));
        }
        write(dir.path(), PROJECT_POLICY_FILE, &content);

        let err = PolicyLoader::new(None, dir.path().join(PROJECT_POLICY_FILE))
            .load()
            .unwrap_err();
        assert!(matches!(err, PolicyError::TooLarge { count: 101, .. }));
    }

    #[test]
    fn test_malformed_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "org.yaml", "commands: [unclosed");
        let err = PolicyLoader::new(Some(path), dir.path().join("none.yaml"))
            .load()
            .unwrap_err();
        assert!(matches!(err, PolicyError::Load { .. }));
    }

    #[test]
    fn test_org_conflict_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "org.yaml", "commands:\n  allow: [make]\n  block: [make]\n");
        let err = PolicyLoader::new(Some(path), dir.path().join("none.yaml"))
            .load()
            .unwrap_err();
        assert!(matches!(err, PolicyError::Conflict { .. }));
    }
}
