//! Path locks
//!
//! The commit builder only reads locks (to check the tokens a committer
//! presents) and releases them after a successful push. Taking and stealing
//! locks belongs to the session layer; [`MemoryLockStorage`] provides a
//! simple implementation of both sides.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::path;
use crate::user::User;

/// A lock held on a single path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDescriptor {
    pub path: String,
    pub token: String,
    pub owner: String,
    /// Branch the lock was taken on; `None` locks the path on every branch
    pub branch: Option<String>,
    pub comment: Option<String>,
    pub created: DateTime<Utc>,
}

/// How far below a path a lock query reaches.
///
/// Locks are only ever taken on files, so a separate files-only depth
/// would select exactly what `Immediates` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    /// The path itself
    Empty,
    /// The path and its direct children
    Immediates,
    /// The path and everything below it
    Infinity,
}

impl Depth {
    fn covers(&self, root: &str, candidate: &str) -> bool {
        if root == candidate {
            return true;
        }
        match path::relative(root, candidate) {
            None => false,
            Some(rest) => match self {
                Depth::Empty => false,
                Depth::Immediates => !rest.contains('/'),
                Depth::Infinity => true,
            },
        }
    }
}

/// Lock table interface
#[async_trait]
pub trait LockStorage: Send + Sync {
    /// Locks on `path` and below it, limited by `depth`
    async fn get_locks(
        &self,
        user: &User,
        branch: &str,
        path: &str,
        depth: Depth,
    ) -> Result<Vec<LockDescriptor>>;

    /// Release the presented locks (path → token). Locks whose token no
    /// longer matches are left alone.
    async fn release(
        &self,
        user: &User,
        branch: &str,
        locks: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// In-memory lock table
#[derive(Default)]
pub struct MemoryLockStorage {
    locks: RwLock<BTreeMap<String, LockDescriptor>>,
}

impl MemoryLockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `path` for `user`. Fails with `AlreadyExists` if the path is
    /// locked and `steal` is not set.
    pub async fn lock(
        &self,
        user: &User,
        branch: Option<&str>,
        path: &str,
        comment: Option<&str>,
        steal: bool,
    ) -> Result<LockDescriptor> {
        let path = path::normalize(path);
        let mut locks = self.locks.write().await;
        if locks.contains_key(&path) && !steal {
            return Err(Error::AlreadyExists(path));
        }
        let descriptor = LockDescriptor {
            path: path.clone(),
            token: format!("opaquelocktoken:{}", uuid::Uuid::new_v4()),
            owner: user.username.clone(),
            branch: branch.map(str::to_string),
            comment: comment.map(str::to_string),
            created: Utc::now(),
        };
        debug!("Lock {} by {}", path, user.username);
        locks.insert(path, descriptor.clone());
        Ok(descriptor)
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn on_branch(lock: &LockDescriptor, branch: &str) -> bool {
    lock.branch.as_deref().is_none_or(|b| b == branch)
}

#[async_trait]
impl LockStorage for MemoryLockStorage {
    async fn get_locks(
        &self,
        _user: &User,
        branch: &str,
        path: &str,
        depth: Depth,
    ) -> Result<Vec<LockDescriptor>> {
        let root = path::normalize(path);
        Ok(self
            .locks
            .read()
            .await
            .values()
            .filter(|lock| on_branch(lock, branch) && depth.covers(&root, &lock.path))
            .cloned()
            .collect())
    }

    async fn release(
        &self,
        user: &User,
        branch: &str,
        presented: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut locks = self.locks.write().await;
        for (lock_path, token) in presented {
            let lock_path = path::normalize(lock_path);
            let matches = locks
                .get(&lock_path)
                .is_some_and(|lock| &lock.token == token && on_branch(lock, branch));
            if matches {
                debug!("Unlock {} by {}", lock_path, user.username);
                locks.remove(&lock_path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_conflict_and_steal() {
        let storage = MemoryLockStorage::new();
        let user = User::new("alice", "Alice", "alice@example.com");
        let first = storage.lock(&user, None, "/a.txt", None, false).await.unwrap();
        assert!(matches!(
            storage.lock(&user, None, "a.txt", None, false).await,
            Err(Error::AlreadyExists(_))
        ));
        let stolen = storage.lock(&user, None, "/a.txt", Some("mine"), true).await.unwrap();
        assert_ne!(first.token, stolen.token);
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_locks_by_depth() {
        let storage = MemoryLockStorage::new();
        let user = User::anonymous();
        for p in ["/dir", "/dir/a", "/dir/sub/b", "/other"] {
            storage.lock(&user, None, p, None, false).await.unwrap();
        }
        let paths = |locks: Vec<LockDescriptor>| locks.into_iter().map(|l| l.path).collect::<Vec<_>>();

        let found = storage.get_locks(&user, "master", "/dir", Depth::Empty).await.unwrap();
        assert_eq!(paths(found), vec!["/dir"]);
        let found = storage.get_locks(&user, "master", "/dir", Depth::Immediates).await.unwrap();
        assert_eq!(paths(found), vec!["/dir", "/dir/a"]);
        let found = storage.get_locks(&user, "master", "/dir", Depth::Infinity).await.unwrap();
        assert_eq!(paths(found), vec!["/dir", "/dir/a", "/dir/sub/b"]);
        let found = storage.get_locks(&user, "master", "/", Depth::Infinity).await.unwrap();
        assert_eq!(found.len(), 4);
    }

    #[tokio::test]
    async fn test_branch_scoped_locks_and_release() {
        let storage = MemoryLockStorage::new();
        let user = User::anonymous();
        let lock = storage.lock(&user, Some("feature"), "/a", None, false).await.unwrap();
        assert!(storage.get_locks(&user, "master", "/a", Depth::Empty).await.unwrap().is_empty());
        assert_eq!(storage.get_locks(&user, "feature", "/a", Depth::Empty).await.unwrap().len(), 1);

        let mut wrong = BTreeMap::new();
        wrong.insert("/a".to_string(), "opaquelocktoken:wrong".to_string());
        storage.release(&user, "feature", &wrong).await.unwrap();
        assert_eq!(storage.len().await, 1);

        let mut presented = BTreeMap::new();
        presented.insert("/a".to_string(), lock.token);
        storage.release(&user, "feature", &presented).await.unwrap();
        assert!(storage.is_empty().await);
    }
}
