//! Repository configuration
//!
//! Stored as `gitsvn.json` at the repository root. Every field has a default,
//! so a missing file (or a file with only some keys) is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Name of the configuration file inside a repository directory
pub const CONFIG_FILE: &str = "gitsvn.json";

/// Repository configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Branch exposed to Subversion clients
    pub branch: String,
    /// LFS storage. `None` disables the `lfs` filter.
    pub lfs: Option<LfsConfig>,
    /// Number of content digests kept in memory
    pub digest_cache_size: usize,
    /// Property mismatches collected before a commit report is truncated
    pub max_property_errors: usize,
    /// How many times a commit may be rebuilt after a filter change
    pub max_filter_migrations: usize,
}

/// Local LFS storage settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LfsConfig {
    /// Storage directory; defaults to `<repo>/lfs`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            branch: "master".to_string(),
            lfs: None,
            digest_cache_size: 10_000,
            max_property_errors: 50,
            max_filter_migrations: 1,
        }
    }
}

impl RepositoryConfig {
    /// Load the configuration of the repository at `repo_path`.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save the configuration into the repository at `repo_path`.
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = repo_path.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    /// Resolved LFS storage directory, if LFS is enabled
    pub fn lfs_path(&self, repo_path: &Path) -> Option<PathBuf> {
        self.lfs.as_ref().map(|lfs| match &lfs.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => repo_path.join(path),
            None => repo_path.join("lfs"),
        })
    }
}
