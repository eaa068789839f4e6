//! Branches and their linear revision history
//!
//! Revision 0 is the empty pre-history revision. Revision N is the N-th
//! commit on the branch's first-parent chain, counted from the root commit.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::object::{empty_tree_id, CommitRecord, FileMode, ObjectId, ObjectKind, TreeEntry};
use crate::path;
use crate::projection::TreeNode;
use crate::repository::RepoContext;
use crate::storage::{branch_ref, load_tree};
use crate::user::User;
use crate::writer::CommitBuilder;

/// A published revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub id: u64,
    /// `None` only for revision 0
    pub commit_id: Option<ObjectId>,
    pub tree_id: ObjectId,
    pub author: String,
    pub email: String,
    pub message: String,
    /// Unix seconds
    pub timestamp: i64,
}

impl Revision {
    fn empty() -> Self {
        Self {
            id: 0,
            commit_id: None,
            tree_id: empty_tree_id(),
            author: String::new(),
            email: String::new(),
            message: String::new(),
            timestamp: 0,
        }
    }

    fn from_commit(id: u64, commit_id: ObjectId, commit: &CommitRecord) -> Self {
        Self {
            id,
            commit_id: Some(commit_id),
            tree_id: commit.tree,
            author: commit.author.name.clone(),
            email: commit.author.email.clone(),
            message: commit.message.clone(),
            timestamp: commit.committer.timestamp,
        }
    }

    /// Commit date in Subversion's `svn:date` format
    pub fn date_string(&self) -> String {
        DateTime::<Utc>::from_timestamp(self.timestamp, 0)
            .unwrap_or_default()
            .format("%Y-%m-%dT%H:%M:%S%.6fZ")
            .to_string()
    }
}

/// One branch of the repository
pub struct Branch {
    name: String,
    context: Arc<RepoContext>,
    revisions: RwLock<Vec<Arc<Revision>>>,
    /// Serialises validate + publish; never held while building trees
    publish_lock: Mutex<()>,
}

impl Branch {
    pub(crate) fn new(name: &str, context: Arc<RepoContext>) -> Self {
        Self {
            name: name.to_string(),
            context,
            revisions: RwLock::new(vec![Arc::new(Revision::empty())]),
            publish_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ref_name(&self) -> String {
        branch_ref(&self.name)
    }

    pub fn context(&self) -> &Arc<RepoContext> {
        &self.context
    }

    pub(crate) fn publish_lock(&self) -> &Mutex<()> {
        &self.publish_lock
    }

    /// Append revisions for commits published since the last call
    pub async fn update_revisions(&self) -> Result<()> {
        let mut revisions = self.revisions.write().await;
        let head = self.context.store.read_ref(&self.ref_name()).await?;
        let known = revisions.last().and_then(|r| r.commit_id);
        if head == known {
            return Ok(());
        }

        let mut chain = Vec::new();
        let mut cursor = head;
        let mut reached_known = known.is_none();
        while let Some(commit_id) = cursor {
            if Some(commit_id) == known {
                reached_known = true;
                break;
            }
            let data = self
                .context
                .store
                .open_kind(&commit_id, ObjectKind::Commit)
                .await?;
            let commit = CommitRecord::decode(&data)?;
            cursor = commit.parent;
            chain.push((commit_id, commit));
        }
        if !reached_known {
            warn!("Branch {} was rewritten, reloading revisions", self.name);
            revisions.truncate(1);
        }

        let added = chain.len();
        for (commit_id, commit) in chain.into_iter().rev() {
            let id = revisions.len() as u64;
            revisions.push(Arc::new(Revision::from_commit(id, commit_id, &commit)));
        }
        info!(
            "Branch {}: loaded {} new revision(s), latest r{}",
            self.name,
            added,
            revisions.len() - 1
        );
        Ok(())
    }

    pub async fn latest_revision(&self) -> Arc<Revision> {
        let revisions = self.revisions.read().await;
        revisions
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::new(Revision::empty()))
    }

    pub async fn revision(&self, id: u64) -> Result<Arc<Revision>> {
        self.revisions
            .read()
            .await
            .get(id as usize)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("revision r{}", id)))
    }

    pub async fn revision_by_commit(&self, commit_id: &ObjectId) -> Option<Arc<Revision>> {
        self.revisions
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.commit_id.as_ref() == Some(commit_id))
            .cloned()
    }

    /// Root directory at revision `rev`
    pub async fn root(self: &Arc<Self>, rev: u64) -> Result<TreeNode> {
        let revision = self.revision(rev).await?;
        Ok(TreeNode::root(self.clone(), revision.tree_id, rev))
    }

    /// Node at `path` in revision `rev`, if it exists
    pub async fn file(self: &Arc<Self>, rev: u64, file_path: &str) -> Result<Option<TreeNode>> {
        let mut node = self.root(rev).await?;
        for name in path::components(file_path) {
            match node.entry(name).await? {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        Ok(Some(node))
    }

    /// Most recent revision at or before `rev` that changed `path`
    pub async fn last_change(&self, file_path: &str, rev: u64) -> Result<Option<u64>> {
        let revisions: Vec<Arc<Revision>> = {
            let all = self.revisions.read().await;
            all.iter().take(rev as usize + 1).cloned().collect()
        };
        if revisions.len() as u64 != rev + 1 {
            return Err(Error::NotFound(format!("revision r{}", rev)));
        }

        let mut current = self.entry_at(revisions[rev as usize].tree_id, file_path).await?;
        if current.is_none() {
            return Ok(None);
        }
        for id in (1..=rev).rev() {
            let previous = self
                .entry_at(revisions[id as usize - 1].tree_id, file_path)
                .await?;
            if previous != current {
                return Ok(Some(id));
            }
            current = previous;
        }
        Ok(Some(0))
    }

    /// Tree entry for `file_path` inside the tree `root`
    async fn entry_at(&self, root: ObjectId, file_path: &str) -> Result<Option<TreeEntry>> {
        let mut entry = TreeEntry::new("", FileMode::Tree, root);
        for name in path::components(file_path) {
            if !entry.mode.is_tree() {
                return Ok(None);
            }
            let entries = load_tree(self.context.store.as_ref(), &entry.id).await?;
            match entries.into_iter().find(|e| e.name == name) {
                Some(child) => entry = child,
                None => return Ok(None),
            }
        }
        Ok(Some(entry))
    }

    /// Open a transaction against the latest revision.
    ///
    /// `presented_locks` maps locked paths to the tokens the committer holds.
    pub async fn create_commit_builder(
        self: &Arc<Self>,
        user: User,
        presented_locks: BTreeMap<String, String>,
    ) -> Result<CommitBuilder> {
        CommitBuilder::new(self.clone(), user, presented_locks).await
    }
}
