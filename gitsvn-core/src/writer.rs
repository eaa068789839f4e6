//! Commit builder
//!
//! A [`CommitBuilder`] turns a sequence of directory and file edits into a
//! new commit on a branch. Edits mutate a stack of pending directory frames;
//! closing a frame writes its tree object into the parent. Every successful
//! edit is also appended to a journal, which is replayed to
//!
//! - rebuild the trees after staged content had to move to another filter,
//! - walk the new tree and check each touched path (filter migration, then
//!   property validation).
//!
//! Objects go through a per-builder [`ObjectInserter`]. Nothing becomes
//! visible to readers until the branch ref is moved by compare-and-swap.

use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, info};

use crate::attributes::{
    self, svn_props, AttributeRule, FileAttributes, InheritedRules, Properties, CONFIG_FILES,
};
use crate::branch::{Branch, Revision};
use crate::error::{Error, PropertyReport, Result};
use crate::filter::{ContentFilter, FilterWriter};
use crate::locks::Depth;
use crate::object::{CommitRecord, FileMode, ObjectId, ObjectKind, Signature, TreeEntry};
use crate::path;
use crate::projection::TreeNode;
use crate::repository::RepoContext;
use crate::storage::{load_tree, ObjectInserter};
use crate::user::User;

/// Name of the entry that keeps an otherwise empty directory alive
pub const KEEP_FILE: &str = ".keep";

const KEEP_FILE_CONTENT: &[u8] = b"";

/// File mode implied by declared properties
pub fn mode_for_properties(props: &Properties) -> FileMode {
    if props.contains_key(svn_props::SPECIAL) {
        FileMode::Symlink
    } else if props.contains_key(svn_props::EXECUTABLE) {
        FileMode::Executable
    } else {
        FileMode::Regular
    }
}

/// Content written through a filter, ready to be stored
struct StagedContent {
    filter: Arc<dyn ContentFilter>,
    data: Bytes,
}

/// A file being added or modified.
///
/// Obtained from [`CommitBuilder::create_file`] or
/// [`CommitBuilder::modify_file`] and handed back through
/// [`CommitBuilder::save_file`].
pub struct FileUpdate {
    context: Arc<RepoContext>,
    user: User,
    path: String,
    name: String,
    attributes: FileAttributes,
    original: Option<ObjectId>,
    properties: Properties,
    content: Option<StagedContent>,
}

impl FileUpdate {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blob of the file before this transaction
    pub fn original(&self) -> Option<&ObjectId> {
        self.original.as_ref()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Declare the complete property set of the file
    pub fn set_properties(&mut self, properties: Properties) {
        self.properties = properties;
    }

    pub fn set_property(&mut self, name: &str, value: Option<&str>) {
        match value {
            Some(value) => self.properties.insert(name.to_string(), value.to_string()),
            None => self.properties.remove(name),
        };
    }

    pub fn mode(&self) -> FileMode {
        mode_for_properties(&self.properties)
    }

    /// Filter the content will be written with, given the current rules and
    /// declared properties
    pub fn filter(&self) -> Arc<dyn ContentFilter> {
        self.context
            .filters
            .select(self.mode(), self.attributes.filter.as_deref())
    }

    /// The property set the rules will expect for `content` written with
    /// `mode`.
    pub fn derive_properties(&self, mode: FileMode, content: &[u8]) -> Properties {
        let mut props = self.attributes.properties.clone();
        match mode {
            FileMode::Symlink => {
                props.insert(svn_props::SPECIAL.to_string(), "*".to_string());
            }
            _ => {
                if mode == FileMode::Executable {
                    props.insert(svn_props::EXECUTABLE.to_string(), "*".to_string());
                }
                let probe = &content[..content.len().min(8000)];
                if probe.contains(&0) {
                    props.insert(
                        svn_props::MIME_TYPE.to_string(),
                        svn_props::BINARY_MIME_TYPE.to_string(),
                    );
                }
            }
        }
        props
    }

    /// Start writing new content. Properties should be declared first: they
    /// decide the filter.
    pub fn writer(&mut self) -> Result<ContentWriter<'_>> {
        let filter = self.filter();
        let sink = filter.open_write(&self.user)?;
        Ok(ContentWriter {
            update: self,
            filter,
            sink,
        })
    }

    pub fn write_content(&mut self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer()?;
        writer.write_all(data)?;
        writer.finish()
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }
}

/// Streams new content of a [`FileUpdate`] through its filter
pub struct ContentWriter<'a> {
    update: &'a mut FileUpdate,
    filter: Arc<dyn ContentFilter>,
    sink: Box<dyn FilterWriter>,
}

impl Write for ContentWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl ContentWriter<'_> {
    /// Complete the content; it replaces anything staged before
    pub fn finish(self) -> Result<()> {
        let data = self.sink.finish()?;
        self.update.content = Some(StagedContent {
            filter: self.filter,
            data,
        });
        Ok(())
    }
}

/// Content of a saved file as stored in this transaction
#[derive(Clone)]
struct StoredContent {
    filter: Arc<dyn ContentFilter>,
    blob: ObjectId,
}

/// A file recorded by `save_file`
struct SavedFile {
    path: String,
    properties: Properties,
    original: Option<ObjectId>,
    content: Option<StoredContent>,
}

/// Recorded edit operation
#[derive(Debug, Clone)]
enum Edit {
    AddDir(String),
    OpenDir(String),
    CloseDir,
    SaveFile {
        name: String,
        file: usize,
        modify: bool,
    },
    Delete(String),
    CheckDirProperties(Properties),
}

/// A directory being edited
struct Frame {
    name: String,
    path: String,
    entries: BTreeMap<String, TreeEntry>,
    /// Rules in effect for the entries of this directory
    rules: InheritedRules,
}

/// A directory of the new tree, read back through the inserter
struct DirView {
    entry: TreeEntry,
    path: String,
    /// Rules in effect for this directory itself
    parent_rules: InheritedRules,
    entries: Vec<TreeEntry>,
    /// Rules in effect for the entries of this directory
    rules: InheritedRules,
}

impl DirView {
    fn find(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// Check applied to each touched path while replaying the journal
enum Pass {
    FilterMigration {
        /// Staged file index → filter the new tree reads it with
        mismatches: Vec<(usize, Arc<dyn ContentFilter>)>,
    },
    PropertyValidation { report: PropertyReport },
}

impl Pass {
    async fn check(
        &mut self,
        node: &TreeNode,
        declared: &Properties,
        file: Option<(usize, &SavedFile)>,
    ) -> Result<()> {
        let staged = file.and_then(|(index, saved)| {
            let content = saved.content.as_ref()?;
            let filter = node.filter()?;
            (content.filter.name() != filter.name()).then(|| (index, content, filter))
        });
        match self {
            Pass::FilterMigration { mismatches } => {
                if let Some((index, _, filter)) = staged {
                    mismatches.push((index, filter.clone()));
                }
            }
            Pass::PropertyValidation { report } => {
                if let Some((_, content, filter)) = staged {
                    return Err(Error::FilterMismatch {
                        path: node.path().to_string(),
                        expected: filter.name().to_string(),
                        actual: content.filter.name().to_string(),
                    });
                }
                let expected = node.properties().await?;
                if expected != declared {
                    report.add(node.path(), expected, declared);
                }
            }
        }
        Ok(())
    }
}

/// Write transaction against one branch.
///
/// Not shareable between callers; dropping it abandons the transaction and
/// the objects it has not flushed.
pub struct CommitBuilder {
    branch: Arc<Branch>,
    user: User,
    presented_locks: BTreeMap<String, String>,
    keep_locks: bool,
    base: Arc<Revision>,
    base_entries: Vec<TreeEntry>,
    base_rules: InheritedRules,
    inserter: ObjectInserter,
    frames: Vec<Frame>,
    journal: Vec<Edit>,
    files: Vec<SavedFile>,
}

impl CommitBuilder {
    pub(crate) async fn new(
        branch: Arc<Branch>,
        user: User,
        presented_locks: BTreeMap<String, String>,
    ) -> Result<Self> {
        branch.update_revisions().await?;
        let base = branch.latest_revision().await;
        let context = branch.context().clone();
        let base_entries = load_tree(context.store.as_ref(), &base.tree_id).await?;
        let base_rules = InheritedRules::new().child(
            path::ROOT,
            attributes::load_rules(context.store.as_ref(), &base_entries).await?,
        );
        let mut builder = Self {
            inserter: ObjectInserter::new(context.store.clone()),
            branch,
            user,
            presented_locks,
            keep_locks: false,
            base,
            base_entries,
            base_rules,
            frames: Vec::new(),
            journal: Vec::new(),
            files: Vec::new(),
        };
        builder.reset();
        Ok(builder)
    }

    /// Revision the transaction is based on
    pub fn base_revision(&self) -> &Arc<Revision> {
        &self.base
    }

    /// Keep presented locks after a successful commit
    pub fn keep_locks(&mut self, keep: bool) {
        self.keep_locks = keep;
    }

    fn context(&self) -> &Arc<RepoContext> {
        self.branch.context()
    }

    fn reset(&mut self) {
        self.frames = vec![Frame {
            name: String::new(),
            path: path::ROOT.to_string(),
            entries: self
                .base_entries
                .iter()
                .map(|e| (e.name.clone(), e.clone()))
                .collect(),
            rules: self.base_rules.clone(),
        }];
    }

    fn current(&self) -> Result<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| Error::Internal("no open directory".into()))
    }

    fn current_mut(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| Error::Internal("no open directory".into()))
    }

    /// Full path of `name` in the current directory
    fn full_path(&self, name: &str) -> String {
        let dir = self.frames.last().map(|f| f.path.as_str()).unwrap_or(path::ROOT);
        path::join(dir, name)
    }

    async fn record(&mut self, edit: Edit) -> Result<()> {
        self.apply(&edit).await?;
        self.journal.push(edit);
        Ok(())
    }

    async fn apply(&mut self, edit: &Edit) -> Result<()> {
        match edit {
            Edit::AddDir(name) => {
                let current = self.current()?;
                if current.entries.contains_key(name) {
                    return Err(Error::AlreadyExists(self.full_path(name)));
                }
                let frame = Frame {
                    name: name.clone(),
                    path: self.full_path(name),
                    entries: BTreeMap::new(),
                    rules: current.rules.clone(),
                };
                self.frames.push(frame);
            }
            Edit::OpenDir(name) => {
                let dir_path = self.full_path(name);
                let current = self.current_mut()?;
                let original = match current.entries.get(name) {
                    Some(entry) if entry.mode.is_tree() => entry.clone(),
                    _ => return Err(Error::NotFound(dir_path)),
                };
                current.entries.remove(name);
                let parent_rules = current.rules.clone();

                let entries = self.inserter.load_tree(&original.id).await?;
                let rules = parent_rules.child(&dir_path, self.read_rules(&entries).await?);
                self.frames.push(Frame {
                    name: name.clone(),
                    path: dir_path,
                    entries: entries.into_iter().map(|e| (e.name.clone(), e)).collect(),
                    rules,
                });
            }
            Edit::CloseDir => {
                if self.frames.len() < 2 {
                    return Err(Error::Internal("close_dir without an open directory".into()));
                }
                let Some(mut last) = self.frames.pop() else {
                    return Err(Error::Internal("no open directory".into()));
                };
                if last.entries.is_empty() {
                    let keep = self.inserter.insert_blob(Bytes::from_static(KEEP_FILE_CONTENT));
                    last.entries.insert(
                        KEEP_FILE.to_string(),
                        TreeEntry::new(KEEP_FILE, FileMode::Regular, keep),
                    );
                } else if last.entries.len() >= 2 {
                    last.entries.remove(KEEP_FILE);
                }
                let entries: Vec<TreeEntry> = last.entries.into_values().collect();
                let tree_id = self.inserter.insert_tree(&entries);
                debug!("Create tree {} for dir: {}", tree_id, last.path);

                let current = self.current_mut()?;
                if current.entries.contains_key(&last.name) {
                    return Err(Error::AlreadyExists(last.path));
                }
                current.entries.insert(
                    last.name.clone(),
                    TreeEntry::new(last.name, FileMode::Tree, tree_id),
                );
            }
            Edit::SaveFile { name, file, modify } => {
                let file_path = self.full_path(name);
                let saved = self
                    .files
                    .get(*file)
                    .ok_or_else(|| Error::Internal(format!("unknown staged file {}", file)))?;
                if *modify != self.current()?.entries.contains_key(name) {
                    return Err(Error::OutOfDate(file_path));
                }
                let mode = mode_for_properties(&saved.properties);
                let id = match (&saved.content, &saved.original) {
                    (Some(content), _) => content.blob,
                    (None, Some(original)) => *original,
                    (None, None) => return Err(Error::IncompleteData(file_path)),
                };
                self.current_mut()?
                    .entries
                    .insert(name.clone(), TreeEntry::new(name.clone(), mode, id));
            }
            Edit::Delete(name) => {
                let file_path = self.full_path(name);
                if self.current_mut()?.entries.remove(name).is_none() {
                    return Err(Error::NotFound(file_path));
                }
            }
            Edit::CheckDirProperties(_) => {}
        }
        Ok(())
    }

    /// Create directory `name` in the current directory and enter it
    pub async fn add_dir(&mut self, name: &str) -> Result<()> {
        self.record(Edit::AddDir(name.to_string())).await
    }

    /// Enter the existing directory `name`
    pub async fn open_dir(&mut self, name: &str) -> Result<()> {
        self.record(Edit::OpenDir(name.to_string())).await
    }

    /// Leave the current directory, writing its tree
    pub async fn close_dir(&mut self) -> Result<()> {
        self.record(Edit::CloseDir).await
    }

    /// Declare the full property set of the current directory
    pub async fn check_dir_properties(&mut self, properties: Properties) -> Result<()> {
        self.record(Edit::CheckDirProperties(properties)).await
    }

    /// Remove `name` from the current directory
    pub async fn delete(&mut self, name: &str) -> Result<()> {
        self.record(Edit::Delete(name.to_string())).await
    }

    fn file_update(&self, name: &str, original: Option<ObjectId>) -> Result<FileUpdate> {
        let current = self.current()?;
        let file_path = path::join(&current.path, name);
        Ok(FileUpdate {
            context: self.context().clone(),
            user: self.user.clone(),
            attributes: current.rules.file_attributes(&file_path),
            path: file_path,
            name: name.to_string(),
            original,
            properties: Properties::new(),
            content: None,
        })
    }

    /// Start a new file in the current directory
    pub fn create_file(&self, name: &str) -> Result<FileUpdate> {
        self.file_update(name, None)
    }

    /// Start replacing an existing file of the current directory
    pub fn modify_file(&self, name: &str) -> Result<FileUpdate> {
        let original = match self.current()?.entries.get(name) {
            Some(entry) if entry.mode.is_blob() => entry.id,
            _ => return Err(Error::NotFound(self.full_path(name))),
        };
        self.file_update(name, Some(original))
    }

    /// Store a file prepared with `create_file` (`modify == false`) or
    /// `modify_file` (`modify == true`)
    pub async fn save_file(&mut self, update: FileUpdate, modify: bool) -> Result<()> {
        let content = update.content.map(|staged| StoredContent {
            blob: self.inserter.insert_blob(staged.data),
            filter: staged.filter,
        });
        self.files.push(SavedFile {
            path: update.path,
            properties: update.properties,
            original: update.original,
            content,
        });
        let edit = Edit::SaveFile {
            name: update.name,
            file: self.files.len() - 1,
            modify,
        };
        if let Err(e) = self.record(edit).await {
            self.files.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Fail if `path` changed after `rev`, or, with `check_lock`, if a lock
    /// below it is not matched by a presented token
    pub async fn check_up_to_date(&self, file_path: &str, rev: u64, check_lock: bool) -> Result<()> {
        let file = self
            .branch
            .file(self.base.id, file_path)
            .await?
            .ok_or_else(|| Error::NotFound(path::normalize(file_path)))?;
        if file.last_change().await?.id > rev {
            return Err(Error::OutOfDate(file.path().to_string()));
        }
        if check_lock {
            let locks = self
                .context()
                .locks
                .get_locks(&self.user, self.branch.name(), file.path(), Depth::Infinity)
                .await?;
            for lock in locks {
                if self.presented_locks.get(&lock.path) != Some(&lock.token) {
                    return Err(Error::BadLockToken(lock.path));
                }
            }
        }
        Ok(())
    }

    /// Rule file of a directory of the new tree
    async fn read_rules(&self, entries: &[TreeEntry]) -> Result<Vec<AttributeRule>> {
        let Some(entry) = attributes::rules_entry(entries) else {
            return Ok(Vec::new());
        };
        let data = self.inserter.open_kind(&entry.id, ObjectKind::Blob).await?;
        Ok(attributes::parse_rules(&String::from_utf8_lossy(&data)))
    }

    async fn dir_view(
        &self,
        entry: TreeEntry,
        dir_path: String,
        parent_rules: InheritedRules,
    ) -> Result<DirView> {
        let entries = self.inserter.load_tree(&entry.id).await?;
        let rules = parent_rules.child(&dir_path, self.read_rules(&entries).await?);
        Ok(DirView {
            entry,
            path: dir_path,
            parent_rules,
            entries,
            rules,
        })
    }

    fn node(&self, entry: TreeEntry, node_path: String, rules: InheritedRules) -> TreeNode {
        TreeNode::new(self.branch.clone(), entry, node_path, self.base.id + 1, rules)
    }

    /// Replay the journal over the tree `tree_id`, checking every touched
    /// path. Trees are read through the inserter, so this works before the
    /// transaction is flushed. Paths removed later in the same transaction
    /// are skipped.
    async fn replay(&self, tree_id: &ObjectId, pass: &mut Pass) -> Result<()> {
        let root = TreeEntry::new("", FileMode::Tree, *tree_id);
        let root = self
            .dir_view(root, path::ROOT.to_string(), InheritedRules::new())
            .await?;
        let mut stack = vec![Some(root)];
        for edit in &self.journal {
            match edit {
                Edit::AddDir(name) | Edit::OpenDir(name) => {
                    let child = match stack.last() {
                        Some(Some(dir)) => match dir.find(name) {
                            Some(entry) if entry.mode.is_tree() => {
                                let dir_path = path::join(&dir.path, name);
                                Some(self.dir_view(entry.clone(), dir_path, dir.rules.clone()).await?)
                            }
                            _ => None,
                        },
                        Some(None) => None,
                        None => return Err(Error::Internal("replay left the root".into())),
                    };
                    stack.push(child);
                }
                Edit::CloseDir => {
                    stack.pop();
                }
                Edit::SaveFile { name, file, .. } => {
                    let Some(Some(dir)) = stack.last() else {
                        continue;
                    };
                    if let Some(entry) = dir.find(name) {
                        let node = self.node(entry.clone(), path::join(&dir.path, name), dir.rules.clone());
                        let saved = &self.files[*file];
                        pass.check(&node, &saved.properties, Some((*file, saved))).await?;
                    }
                }
                Edit::CheckDirProperties(declared) => {
                    if let Some(Some(dir)) = stack.last() {
                        let node = self.node(dir.entry.clone(), dir.path.clone(), dir.parent_rules.clone());
                        pass.check(&node, declared, None).await?;
                    }
                }
                Edit::Delete(_) => {}
            }
        }
        Ok(())
    }

    /// Re-encode staged files through the filter the new tree expects
    async fn migrate(&mut self, mismatches: Vec<(usize, Arc<dyn ContentFilter>)>) -> Result<()> {
        for (index, filter) in mismatches {
            let saved = &self.files[index];
            let Some(content) = saved.content.clone() else {
                continue;
            };
            info!(
                "Migrate {} from filter {} to {}",
                saved.path,
                content.filter.name(),
                filter.name()
            );
            let blob = self.inserter.open_kind(&content.blob, ObjectKind::Blob).await?;
            let mut reader = content.filter.decode(blob)?;
            let mut writer = filter.open_write(&self.user)?;
            io::copy(&mut reader, &mut writer)?;
            let blob = self.inserter.insert_blob(writer.finish()?);
            self.files[index].content = Some(StoredContent { filter, blob });
        }
        Ok(())
    }

    /// Rebuild all trees from the journal
    async fn rebuild(&mut self) -> Result<()> {
        self.reset();
        let journal = std::mem::take(&mut self.journal);
        for edit in &journal {
            if let Err(e) = self.apply(edit).await {
                self.journal = journal;
                return Err(e);
            }
        }
        self.journal = journal;
        Ok(())
    }

    /// Validate and publish the transaction as a new revision.
    ///
    /// Fails with [`Error::OutOfDate`] when another commit reached the
    /// branch first; the caller should start over with a new builder.
    pub async fn commit(mut self, author: &User, message: &str) -> Result<Arc<Revision>> {
        if self.frames.len() != 1 {
            return Err(Error::Internal(format!(
                "commit with {} directories still open",
                self.frames.len() - 1
            )));
        }
        let context = self.context().clone();
        let max_migrations = context.config.max_filter_migrations;

        let mut migrations = 0;
        let (tree_id, commit_id) = loop {
            let entries: Vec<TreeEntry> = self.current()?.entries.values().cloned().collect();
            let tree_id = self.inserter.insert_tree(&entries);
            debug!("Create tree {} for commit.", tree_id);

            let signature = Signature::new(
                author.real_name.clone(),
                author.email.clone(),
                Utc::now().timestamp(),
            );
            let record = CommitRecord::new(tree_id, self.base.commit_id, signature, message.to_string());
            let commit_id = self.inserter.insert_commit(&record);

            let mut pass = Pass::FilterMigration {
                mismatches: Vec::new(),
            };
            self.replay(&tree_id, &mut pass).await?;
            let Pass::FilterMigration { mismatches } = pass else {
                return Err(Error::Internal("unexpected check pass".into()));
            };
            if mismatches.is_empty() {
                self.inserter.flush_reachable(&commit_id).await?;
                info!(
                    "Create commit {}: {}",
                    commit_id,
                    message.lines().next().unwrap_or_default()
                );
                break (tree_id, commit_id);
            }
            if migrations >= max_migrations {
                let (index, filter) = &mismatches[0];
                let saved = &self.files[*index];
                return Err(Error::FilterMismatch {
                    path: saved.path.clone(),
                    expected: filter.name().to_string(),
                    actual: saved
                        .content
                        .as_ref()
                        .map(|c| c.filter.name())
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            migrations += 1;
            info!("Need recreate tree after filter migration.");
            self.migrate(mismatches).await?;
            self.rebuild().await?;
        };

        let revision = {
            let _guard = self.branch.publish_lock().lock().await;

            info!("Validate properties");
            let mut pass = Pass::PropertyValidation {
                report: PropertyReport::new(CONFIG_FILES)
                    .with_limit(context.config.max_property_errors),
            };
            self.replay(&tree_id, &mut pass).await?;
            if let Pass::PropertyValidation { report } = pass {
                if !report.is_empty() {
                    return Err(Error::PropertyMismatch(report));
                }
            }

            info!("Try to push commit in branch: {}", self.branch.name());
            let pushed = context
                .store
                .compare_and_swap_ref(&self.branch.ref_name(), self.base.commit_id, commit_id)
                .await?;
            if !pushed {
                info!("Non fast forward push rejected");
                return Err(Error::OutOfDate(format!(
                    "branch {} moved past r{}",
                    self.branch.name(),
                    self.base.id
                )));
            }
            info!("Commit is pushed");

            self.branch.update_revisions().await?;
            self.branch
                .revision_by_commit(&commit_id)
                .await
                .ok_or_else(|| Error::Internal(format!("pushed commit {} not found", commit_id)))?
        };

        if !self.keep_locks && !self.presented_locks.is_empty() {
            context
                .locks
                .release(&self.user, self.branch.name(), &self.presented_locks)
                .await?;
        }
        Ok(revision)
    }
}
