// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the autobuild CLI

pub mod authorize;
pub mod config;
pub mod feature;
pub mod run;

pub use self::authorize::AuthorizeCommand;
pub use self::config::ConfigCommand;
pub use self::feature::FeatureCommand;
pub use self::run::RunCommand;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use autobuild_core::domain::node_config::OrchestratorConfigManifest;
use autobuild_core::domain::repository::WorkItemRepository;
use autobuild_core::infrastructure::db::Database;
use autobuild_core::infrastructure::repositories::SqliteWorkItemRepository;

/// Loaded configuration plus the project it applies to.
pub struct ProjectContext {
    pub config: OrchestratorConfigManifest,
    pub project_dir: PathBuf,
}

impl ProjectContext {
    pub fn new(config: OrchestratorConfigManifest, project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Project directory {:?} not found", project_dir))?;
        Ok(Self { config, project_dir })
    }

    pub fn database_path(&self) -> PathBuf {
        self.config.spec.database.resolve_path(&self.project_dir)
    }

    pub async fn open_store(&self) -> Result<Arc<dyn WorkItemRepository>> {
        let path = self.database_path();
        let db = Database::open(&path, &self.config.spec.database)
            .await
            .with_context(|| format!("Failed to open work item store at {:?}", path))?;
        Ok(Arc::new(SqliteWorkItemRepository::new(db.get_pool().clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobuild_core::domain::work_item::NewWorkItem;

    #[tokio::test]
    async fn test_store_created_under_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let context = ProjectContext::new(OrchestratorConfigManifest::default(), dir.path()).unwrap();

        assert!(context.database_path().ends_with(".autobuild/features.db"));

        let store = context.open_store().await.unwrap();
        store.create_bulk(vec![NewWorkItem::new("functional", "login")]).await.unwrap();
        assert!(context.database_path().exists());

        // a second open sees the same data
        let again = context.open_store().await.unwrap();
        assert_eq!(again.get_stats().await.unwrap().total, 1);
    }

    #[test]
    fn test_missing_project_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(ProjectContext::new(OrchestratorConfigManifest::default(), &missing).is_err());
    }
}
