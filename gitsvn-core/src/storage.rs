//! Object store abstraction
//!
//! The store holds immutable Git objects plus the branch refs that publish
//! them. A ref changes only through [`ObjectStore::compare_and_swap_ref`],
//! which is the single publication point for new revisions.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::object::{
    decode_tree, empty_tree_id, encode_tree, CommitRecord, ObjectId, ObjectKind, StoredObject,
    TreeEntry,
};

/// Generic object store interface
///
/// All storage backends must implement this trait
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object, returning its id. Storing an existing object is a no-op.
    async fn insert(&self, object: StoredObject) -> Result<ObjectId>;

    /// Load an object by id
    async fn open(&self, id: &ObjectId) -> Result<StoredObject>;

    /// Check if object exists
    async fn contains(&self, id: &ObjectId) -> Result<bool>;

    /// Current target of a ref, if the ref exists
    async fn read_ref(&self, name: &str) -> Result<Option<ObjectId>>;

    /// Atomically move `name` from `expected` to `new`.
    ///
    /// Returns `false` without touching the ref when its current value is not
    /// `expected` (`None` meaning "ref must not exist yet").
    async fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<bool>;

    /// Load an object and check its kind
    async fn open_kind(&self, id: &ObjectId, kind: ObjectKind) -> Result<Bytes> {
        let object = self.open(id).await?;
        if object.kind != kind {
            return Err(Error::InvalidObject(format!(
                "{} is a {}, expected {}",
                id,
                object.kind.as_str(),
                kind.as_str()
            )));
        }
        Ok(object.data)
    }
}

/// Full ref name for a branch
pub fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{}", branch)
}

/// Entries of a tree object. The empty tree never has to be stored.
pub async fn load_tree(store: &dyn ObjectStore, id: &ObjectId) -> Result<Vec<TreeEntry>> {
    if *id == empty_tree_id() {
        return Ok(Vec::new());
    }
    decode_tree(&store.open_kind(id, ObjectKind::Tree).await?)
}

/// In-memory object store
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectId, StoredObject>>,
    refs: Mutex<HashMap<String, ObjectId>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            refs: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored objects
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn insert(&self, object: StoredObject) -> Result<ObjectId> {
        let id = object.id();
        self.objects.write().await.entry(id).or_insert(object);
        Ok(id)
    }

    async fn open(&self, id: &ObjectId) -> Result<StoredObject> {
        self.objects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(Error::ObjectNotFound(*id))
    }

    async fn contains(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(id))
    }

    async fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        Ok(self.refs.lock().await.get(name).copied())
    }

    async fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<bool> {
        let mut refs = self.refs.lock().await;
        if refs.get(name).copied() != expected {
            return Ok(false);
        }
        refs.insert(name.to_string(), new);
        Ok(true)
    }
}

/// Per-transaction object insertion context.
///
/// Inserts are buffered and only reach the store on
/// [`flush_reachable`](Self::flush_reachable). Reads through the inserter see
/// buffered objects before the store. Dropping an inserter discards whatever
/// was not flushed, so a transaction that fails before flushing leaves no
/// trace in the store.
pub struct ObjectInserter {
    store: std::sync::Arc<dyn ObjectStore>,
    pending: HashMap<ObjectId, StoredObject>,
}

impl ObjectInserter {
    pub fn new(store: std::sync::Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            pending: HashMap::new(),
        }
    }

    /// Buffer an object and return the id it will have once flushed
    pub fn insert(&mut self, kind: ObjectKind, data: Bytes) -> ObjectId {
        let object = StoredObject::new(kind, data);
        let id = object.id();
        self.pending.entry(id).or_insert(object);
        id
    }

    pub fn insert_blob(&mut self, data: Bytes) -> ObjectId {
        self.insert(ObjectKind::Blob, data)
    }

    pub fn insert_tree(&mut self, entries: &[TreeEntry]) -> ObjectId {
        self.insert(ObjectKind::Tree, encode_tree(entries))
    }

    pub fn insert_commit(&mut self, commit: &CommitRecord) -> ObjectId {
        self.insert(ObjectKind::Commit, commit.encode())
    }

    /// Number of objects waiting for flush
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Payload of a buffered or stored object of the given kind
    pub async fn open_kind(&self, id: &ObjectId, kind: ObjectKind) -> Result<Bytes> {
        match self.pending.get(id) {
            Some(object) if object.kind == kind => Ok(object.data.clone()),
            Some(object) => Err(Error::InvalidObject(format!(
                "{} is a {}, expected {}",
                id,
                object.kind.as_str(),
                kind.as_str()
            ))),
            None => self.store.open_kind(id, kind).await,
        }
    }

    /// [`load_tree`] that also sees buffered trees
    pub async fn load_tree(&self, id: &ObjectId) -> Result<Vec<TreeEntry>> {
        if *id == empty_tree_id() {
            return Ok(Vec::new());
        }
        decode_tree(&self.open_kind(id, ObjectKind::Tree).await?)
    }

    /// Write the buffered objects reachable from `root` to the store and
    /// drop the rest.
    ///
    /// Children are written before the objects that reference them.
    pub async fn flush_reachable(&mut self, root: &ObjectId) -> Result<()> {
        let mut reachable = Vec::new();
        let mut queue = vec![*root];
        while let Some(id) = queue.pop() {
            let Some(object) = self.pending.remove(&id) else {
                continue;
            };
            match object.kind {
                ObjectKind::Commit => queue.push(CommitRecord::decode(&object.data)?.tree),
                ObjectKind::Tree => {
                    queue.extend(decode_tree(&object.data)?.into_iter().map(|entry| entry.id))
                }
                _ => {}
            }
            reachable.push(object);
        }
        if !self.pending.is_empty() {
            debug!("Dropping {} unreachable objects", self.pending.len());
            self.pending.clear();
        }
        for object in reachable.into_iter().rev() {
            self.store.insert(object).await?;
        }
        Ok(())
    }

    pub fn store(&self) -> &std::sync::Arc<dyn ObjectStore> {
        &self.store
    }
}

impl Drop for ObjectInserter {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!("Discarding {} unflushed objects", self.pending.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::FileMode;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_insert_and_open() {
        let store = MemoryObjectStore::new();
        let id = store
            .insert(StoredObject::new(ObjectKind::Blob, Bytes::from_static(b"hello\n")))
            .await
            .unwrap();
        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert!(store.contains(&id).await.unwrap());

        let data = store.open_kind(&id, ObjectKind::Blob).await.unwrap();
        assert_eq!(&data[..], b"hello\n");
        assert!(store.open_kind(&id, ObjectKind::Tree).await.is_err());
    }

    #[tokio::test]
    async fn test_open_missing_object() {
        let store = MemoryObjectStore::new();
        let missing = ObjectId::new([9u8; 20]);
        assert!(matches!(
            store.open(&missing).await,
            Err(Error::ObjectNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_compare_and_swap_ref() {
        let store = MemoryObjectStore::new();
        let first = ObjectId::new([1u8; 20]);
        let second = ObjectId::new([2u8; 20]);
        let name = branch_ref("master");

        assert!(store.compare_and_swap_ref(&name, None, first).await.unwrap());
        // ref exists now, creating again must fail
        assert!(!store.compare_and_swap_ref(&name, None, second).await.unwrap());
        assert!(!store.compare_and_swap_ref(&name, Some(second), second).await.unwrap());
        assert!(store.compare_and_swap_ref(&name, Some(first), second).await.unwrap());
        assert_eq!(store.read_ref(&name).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_inserter_buffers_until_flush() {
        let store = Arc::new(MemoryObjectStore::new());
        let mut inserter = ObjectInserter::new(store.clone());

        let blob = inserter.insert_blob(Bytes::from_static(b"data"));
        let tree = inserter.insert_tree(&[TreeEntry::new("f", FileMode::Regular, blob)]);
        assert_eq!(inserter.pending(), 2);
        assert!(!store.contains(&tree).await.unwrap());

        inserter.flush_reachable(&tree).await.unwrap();
        assert_eq!(inserter.pending(), 0);
        assert!(store.contains(&blob).await.unwrap());
        assert!(store.contains(&tree).await.unwrap());
    }

    #[tokio::test]
    async fn test_inserter_reads_pending_objects() {
        let store = Arc::new(MemoryObjectStore::new());
        let stored = store
            .insert(StoredObject::new(ObjectKind::Blob, Bytes::from_static(b"old")))
            .await
            .unwrap();
        let mut inserter = ObjectInserter::new(store.clone());

        let blob = inserter.insert_blob(Bytes::from_static(b"new"));
        let entries = vec![
            TreeEntry::new("new", FileMode::Regular, blob),
            TreeEntry::new("old", FileMode::Regular, stored),
        ];
        let tree = inserter.insert_tree(&entries);

        assert_eq!(inserter.load_tree(&tree).await.unwrap(), entries);
        assert_eq!(&inserter.open_kind(&blob, ObjectKind::Blob).await.unwrap()[..], b"new");
        assert_eq!(&inserter.open_kind(&stored, ObjectKind::Blob).await.unwrap()[..], b"old");
        assert!(inserter.open_kind(&tree, ObjectKind::Blob).await.is_err());
        assert!(inserter.load_tree(&empty_tree_id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flush_skips_unreachable_objects() {
        let store = Arc::new(MemoryObjectStore::new());
        let mut inserter = ObjectInserter::new(store.clone());

        let orphan = inserter.insert_blob(Bytes::from_static(b"superseded"));
        let blob = inserter.insert_blob(Bytes::from_static(b"kept"));
        let sub = inserter.insert_tree(&[TreeEntry::new("f", FileMode::Regular, blob)]);
        let root = inserter.insert_tree(&[TreeEntry::new("dir", FileMode::Tree, sub)]);

        inserter.flush_reachable(&root).await.unwrap();
        assert_eq!(inserter.pending(), 0);
        for id in [blob, sub, root] {
            assert!(store.contains(&id).await.unwrap());
        }
        assert!(!store.contains(&orphan).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_tree() {
        let store = MemoryObjectStore::new();
        assert!(load_tree(&store, &empty_tree_id()).await.unwrap().is_empty());

        let blob = ObjectId::for_object(ObjectKind::Blob, b"x");
        let entries = vec![TreeEntry::new("x", FileMode::Executable, blob)];
        let tree = store
            .insert(StoredObject::new(ObjectKind::Tree, encode_tree(&entries)))
            .await
            .unwrap();
        assert_eq!(load_tree(&store, &tree).await.unwrap(), entries);
    }

    #[tokio::test]
    async fn test_dropped_inserter_leaves_store_untouched() {
        let store = Arc::new(MemoryObjectStore::new());
        {
            let mut inserter = ObjectInserter::new(store.clone());
            inserter.insert_blob(Bytes::from_static(b"lost"));
        }
        assert!(store.is_empty().await);
    }
}
