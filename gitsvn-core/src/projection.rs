//! Read-side view of a tree at a revision
//!
//! A [`TreeNode`] is one path at a fixed revision. Children, rule files and
//! derived properties are loaded on first use and memoized in the node.

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::attributes::{self, svn_props, AttributeRule, InheritedRules, Properties};
use crate::branch::{Branch, Revision};
use crate::error::{Error, Result};
use crate::filter::ContentFilter;
use crate::object::{FileMode, ObjectId, TreeEntry};
use crate::path;
use crate::storage::load_tree;

pub struct TreeNode {
    branch: Arc<Branch>,
    entry: TreeEntry,
    path: String,
    revision: u64,
    /// Rules in effect for this node, from the rule files of its ancestors
    rules: InheritedRules,
    /// Rule-derived properties (files only)
    upstream: Properties,
    filter: Option<Arc<dyn ContentFilter>>,

    raw_entries: OnceCell<Vec<TreeEntry>>,
    own_rules: OnceCell<Vec<AttributeRule>>,
    child_rules: OnceCell<InheritedRules>,
    children: OnceCell<Vec<TreeNode>>,
    properties: OnceCell<Properties>,
}

impl TreeNode {
    pub(crate) fn new(
        branch: Arc<Branch>,
        entry: TreeEntry,
        path: String,
        revision: u64,
        rules: InheritedRules,
    ) -> Self {
        let (upstream, filter) = if entry.mode.is_blob() {
            let attributes = rules.file_attributes(&path);
            let filter = branch
                .context()
                .filters
                .select(entry.mode, attributes.filter.as_deref());
            (attributes.properties, Some(filter))
        } else {
            (Properties::new(), None)
        };
        Self {
            branch,
            entry,
            path,
            revision,
            rules,
            upstream,
            filter,
            raw_entries: OnceCell::new(),
            own_rules: OnceCell::new(),
            child_rules: OnceCell::new(),
            children: OnceCell::new(),
            properties: OnceCell::new(),
        }
    }

    /// Root directory of the tree `tree_id`
    pub fn root(branch: Arc<Branch>, tree_id: ObjectId, revision: u64) -> Self {
        Self::new(
            branch,
            TreeEntry::new("", FileMode::Tree, tree_id),
            path::ROOT.to_string(),
            revision,
            InheritedRules::new(),
        )
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> FileMode {
        self.entry.mode
    }

    pub fn id(&self) -> &ObjectId {
        &self.entry.id
    }

    pub fn tree_entry(&self) -> &TreeEntry {
        &self.entry
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_dir(&self) -> bool {
        !self.entry.mode.is_blob()
    }

    /// Filter used to read this file; `None` for directories
    pub fn filter(&self) -> Option<&Arc<dyn ContentFilter>> {
        self.filter.as_ref()
    }

    /// Rule-derived properties, before mode and content are considered
    pub fn upstream_properties(&self) -> &Properties {
        &self.upstream
    }

    /// Entries of the underlying tree object
    pub async fn raw_entries(&self) -> Result<&[TreeEntry]> {
        let entries = self
            .raw_entries
            .get_or_try_init(|| async {
                if self.entry.mode.is_tree() {
                    load_tree(self.branch.context().store.as_ref(), &self.entry.id).await
                } else {
                    Ok(Vec::new())
                }
            })
            .await?;
        Ok(entries)
    }

    async fn own_rules(&self) -> Result<&[AttributeRule]> {
        let rules = self
            .own_rules
            .get_or_try_init(|| async {
                let entries = self.raw_entries().await?;
                attributes::load_rules(self.branch.context().store.as_ref(), entries).await
            })
            .await?;
        Ok(rules)
    }

    /// Rules in effect for this directory's children
    pub async fn child_rules(&self) -> Result<&InheritedRules> {
        self.child_rules
            .get_or_try_init(|| async {
                let own = self.own_rules().await?.to_vec();
                Ok::<_, Error>(self.rules.child(&self.path, own))
            })
            .await
    }

    fn child(&self, entry: TreeEntry, rules: InheritedRules) -> TreeNode {
        let child_path = path::join(&self.path, &entry.name);
        TreeNode::new(self.branch.clone(), entry, child_path, self.revision, rules)
    }

    /// Children of a directory, in tree order
    pub async fn entries(&self) -> Result<&[TreeNode]> {
        let children = self
            .children
            .get_or_try_init(|| async {
                let rules = self.child_rules().await?.clone();
                let entries = self.raw_entries().await?;
                Ok::<_, Error>(
                    entries
                        .iter()
                        .map(|entry| self.child(entry.clone(), rules.clone()))
                        .collect(),
                )
            })
            .await?;
        Ok(children)
    }

    /// A single child by name
    pub async fn entry(&self, name: &str) -> Result<Option<TreeNode>> {
        let Some(entry) = self.raw_entries().await?.iter().find(|e| e.name == name).cloned() else {
            return Ok(None);
        };
        let rules = self.child_rules().await?.clone();
        Ok(Some(self.child(entry, rules)))
    }

    /// Effective Subversion properties.
    ///
    /// Files get the rule-derived properties plus `svn:special` for symlinks,
    /// `svn:executable` for executables and a binary MIME type when the
    /// filter sniffs binary content. Directories holding a rule file get
    /// `svn:auto-props`.
    pub async fn properties(&self) -> Result<&Properties> {
        self.properties
            .get_or_try_init(|| async {
                let mut props = self.upstream.clone();
                match (self.entry.mode, &self.filter) {
                    (FileMode::Symlink, _) => {
                        props.insert(svn_props::SPECIAL.to_string(), "*".to_string());
                    }
                    (mode, Some(filter)) => {
                        if mode == FileMode::Executable {
                            props.insert(svn_props::EXECUTABLE.to_string(), "*".to_string());
                        }
                        if filter.is_binary(&self.entry.id).await? {
                            props.insert(
                                svn_props::MIME_TYPE.to_string(),
                                svn_props::BINARY_MIME_TYPE.to_string(),
                            );
                        }
                    }
                    (_, None) => {
                        if let Some(auto_props) = attributes::auto_props(self.own_rules().await?) {
                            props.insert(svn_props::AUTO_PROPS.to_string(), auto_props);
                        }
                    }
                }
                Ok::<_, Error>(props)
            })
            .await
    }

    fn content_filter(&self) -> Result<&Arc<dyn ContentFilter>> {
        self.filter
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("{} has no content", self.path)))
    }

    /// Content size; zero for directories
    pub async fn size(&self) -> Result<u64> {
        match &self.filter {
            Some(filter) => filter.size(&self.entry.id).await,
            None => Ok(0),
        }
    }

    /// MD5 (hex) of the content
    pub async fn content_digest(&self) -> Result<String> {
        self.content_filter()?.content_digest(&self.entry.id).await
    }

    pub async fn open_read(&self) -> Result<Box<dyn Read + Send>> {
        self.content_filter()?.open_read(&self.entry.id).await
    }

    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let mut reader = self.open_read().await?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Revision that last changed this path
    pub async fn last_change(&self) -> Result<Arc<Revision>> {
        let id = self
            .branch
            .last_change(&self.path, self.revision)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!(
                    "can't find last change revision for {}@{}",
                    self.path, self.revision
                ))
            })?;
        self.branch.revision(id).await
    }
}

/// Same object, rule-derived properties and filter, hence the same content
/// and effective properties as seen by clients
impl PartialEq for TreeNode {
    fn eq(&self, other: &Self) -> bool {
        self.entry == other.entry
            && self.upstream == other.upstream
            && self.filter.as_ref().map(|f| f.name()) == other.filter.as_ref().map(|f| f.name())
    }
}

impl Eq for TreeNode {}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("path", &self.path)
            .field("revision", &self.revision)
            .field("entry", &self.entry)
            .finish()
    }
}
