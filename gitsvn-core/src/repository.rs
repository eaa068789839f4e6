//! Repository handle
//!
//! Owns the context shared by every branch (object store, filters, lock
//! table, configuration) and hands out one [`Branch`] per branch name.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::branch::Branch;
use crate::config::RepositoryConfig;
use crate::disk_store::DiskObjectStore;
use crate::error::Result;
use crate::filter::FilterRegistry;
use crate::lfs::{LfsStorage, LocalLfsStorage, MemoryLfsStorage};
use crate::locks::{LockStorage, MemoryLockStorage};
use crate::storage::{MemoryObjectStore, ObjectStore};

const UUID_FILE: &str = "uuid";

/// Services shared by all branches of a repository
pub struct RepoContext {
    pub store: Arc<dyn ObjectStore>,
    pub filters: FilterRegistry,
    pub locks: Arc<dyn LockStorage>,
    pub config: RepositoryConfig,
    pub uuid: String,
}

/// A Git-backed repository as seen by Subversion clients
pub struct Repository {
    context: Arc<RepoContext>,
    path: Option<PathBuf>,
    branches: Mutex<HashMap<String, Arc<Branch>>>,
}

impl Repository {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        lfs: Option<Arc<dyn LfsStorage>>,
        locks: Arc<dyn LockStorage>,
        config: RepositoryConfig,
        uuid: String,
    ) -> Self {
        let filters = FilterRegistry::new(store.clone(), lfs, config.digest_cache_size);
        Self {
            context: Arc::new(RepoContext {
                store,
                filters,
                locks,
                config,
                uuid,
            }),
            path: None,
            branches: Mutex::new(HashMap::new()),
        }
    }

    /// Repository kept entirely in memory. LFS is backed by memory when the
    /// configuration enables it.
    pub fn in_memory(config: RepositoryConfig) -> Self {
        let lfs: Option<Arc<dyn LfsStorage>> = match config.lfs {
            Some(_) => Some(Arc::new(MemoryLfsStorage::new())),
            None => None,
        };
        Self::new(
            Arc::new(MemoryObjectStore::new()),
            lfs,
            Arc::new(MemoryLockStorage::new()),
            config,
            uuid::Uuid::new_v4().to_string(),
        )
    }

    /// Create a new repository directory with the given configuration
    pub fn init(path: &Path, config: &RepositoryConfig) -> Result<Self> {
        fs::create_dir_all(path)?;
        config.save(path)?;
        info!("Initialized repository at {:?}", path);
        Self::open(path)
    }

    /// Open a disk-backed repository
    pub fn open(path: &Path) -> Result<Self> {
        let config = RepositoryConfig::load(path)?;
        let store = Arc::new(DiskObjectStore::open(path)?);
        let lfs: Option<Arc<dyn LfsStorage>> = match config.lfs_path(path) {
            Some(lfs_path) => Some(Arc::new(LocalLfsStorage::open(&lfs_path)?)),
            None => None,
        };

        let uuid_path = path.join(UUID_FILE);
        let uuid = if uuid_path.exists() {
            fs::read_to_string(&uuid_path)?.trim().to_string()
        } else {
            let uuid = uuid::Uuid::new_v4().to_string();
            fs::write(&uuid_path, &uuid)?;
            uuid
        };

        let mut repository = Self::new(
            store,
            lfs,
            Arc::new(MemoryLockStorage::new()),
            config,
            uuid,
        );
        repository.path = Some(path.to_path_buf());
        Ok(repository)
    }

    pub fn context(&self) -> &Arc<RepoContext> {
        &self.context
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.context.config
    }

    pub fn uuid(&self) -> &str {
        &self.context.uuid
    }

    /// Directory of a disk-backed repository
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Handle for `name`, with its revision list loaded
    pub async fn branch(&self, name: &str) -> Result<Arc<Branch>> {
        let mut branches = self.branches.lock().await;
        if let Some(branch) = branches.get(name) {
            return Ok(branch.clone());
        }
        let branch = Arc::new(Branch::new(name, self.context.clone()));
        branch.update_revisions().await?;
        branches.insert(name.to_string(), branch.clone());
        Ok(branch)
    }

    /// Handle for the configured branch
    pub async fn default_branch(&self) -> Result<Arc<Branch>> {
        let name = self.context.config.branch.clone();
        self.branch(&name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LfsConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_branch_handles_are_shared() {
        let repo = Repository::in_memory(RepositoryConfig::default());
        let a = repo.default_branch().await.unwrap();
        let b = repo.branch("master").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.latest_revision().await.id, 0);
    }

    #[tokio::test]
    async fn test_lfs_filter_follows_config() {
        let plain = Repository::in_memory(RepositoryConfig::default());
        assert!(plain.context().filters.get("lfs").is_none());

        let config = RepositoryConfig {
            lfs: Some(LfsConfig::default()),
            ..Default::default()
        };
        let with_lfs = Repository::in_memory(config);
        assert!(with_lfs.context().filters.get("lfs").is_some());
    }

    #[tokio::test]
    async fn test_open_keeps_uuid() {
        let temp_dir = TempDir::new().unwrap();
        let config = RepositoryConfig {
            lfs: Some(LfsConfig::default()),
            ..Default::default()
        };
        let uuid = Repository::init(temp_dir.path(), &config).unwrap().uuid().to_string();

        let reopened = Repository::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.uuid(), uuid);
        assert_eq!(reopened.config(), &config);
        assert!(temp_dir.path().join("lfs").join("objects").is_dir());
    }
}
