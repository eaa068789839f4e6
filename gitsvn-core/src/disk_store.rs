//! Disk-persistent object store
//!
//! Stores objects on disk using a content-addressed layout (like git loose
//! objects), compressed with zstd.
//!
//! Layout on disk:
//! ```text
//! {root}/
//!   objects/{hash[0..2]}/{hash[2..]}   "<kind> <len>\0<payload>", zstd
//!   refs/heads/{branch}                commit id (hex text)
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::object::{ObjectId, ObjectKind, StoredObject};
use crate::storage::ObjectStore;

const ZSTD_LEVEL: i32 = 3;

/// Disk-persistent object store
pub struct DiskObjectStore {
    root: PathBuf,
    /// Serialises ref updates within this process
    ref_lock: Mutex<()>,
}

impl DiskObjectStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        let root = path.to_path_buf();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("refs").join("heads"))?;
        Ok(Self {
            root,
            ref_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn ref_path(&self, name: &str) -> Result<PathBuf> {
        if name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(Error::Config(format!("invalid ref name: {}", name)));
        }
        Ok(self.root.join(name))
    }

    fn encode(object: &StoredObject) -> Result<Vec<u8>> {
        let mut raw = format!("{} {}\0", object.kind.as_str(), object.data.len()).into_bytes();
        raw.extend_from_slice(&object.data);
        Ok(zstd::encode_all(&raw[..], ZSTD_LEVEL)?)
    }

    fn decode(id: &ObjectId, compressed: &[u8]) -> Result<StoredObject> {
        let raw = zstd::decode_all(compressed)?;
        let nul = raw
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::InvalidObject(format!("{}: missing header", id)))?;
        let header = std::str::from_utf8(&raw[..nul])
            .map_err(|_| Error::InvalidObject(format!("{}: header is not UTF-8", id)))?;
        let (kind, len) = header
            .split_once(' ')
            .ok_or_else(|| Error::InvalidObject(format!("{}: bad header {:?}", id, header)))?;
        let kind = ObjectKind::parse(kind)?;
        let data = Bytes::copy_from_slice(&raw[nul + 1..]);
        if len.parse::<usize>().ok() != Some(data.len()) {
            return Err(Error::InvalidObject(format!("{}: length mismatch", id)));
        }
        Ok(StoredObject::new(kind, data))
    }
}

#[async_trait]
impl ObjectStore for DiskObjectStore {
    async fn insert(&self, object: StoredObject) -> Result<ObjectId> {
        let id = object.id();
        let path = self.object_path(&id);
        if path.exists() {
            return Ok(id);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        // Write to temp file first, then rename for atomicity
        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp_path, Self::encode(&object)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(id)
    }

    async fn open(&self, id: &ObjectId) -> Result<StoredObject> {
        match fs::read(self.object_path(id)) {
            Ok(compressed) => Self::decode(id, &compressed),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::ObjectNotFound(*id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.object_path(id).exists())
    }

    async fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        match fs::read_to_string(self.ref_path(name)?) {
            Ok(text) => Ok(Some(ObjectId::from_hex(&text)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<bool> {
        let _guard = self.ref_lock.lock().await;
        if self.read_ref(name).await? != expected {
            return Ok(false);
        }
        let path = self.ref_path(name)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp_path = path.with_extension("lock");
        fs::write(&tmp_path, format!("{}\n", new))?;
        fs::rename(&tmp_path, &path)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::branch_ref;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_objects_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let blob = StoredObject::new(ObjectKind::Blob, Bytes::from_static(b"persistent"));

        let id = {
            let store = DiskObjectStore::open(temp_dir.path()).unwrap();
            store.insert(blob.clone()).await.unwrap()
        };

        let store = DiskObjectStore::open(temp_dir.path()).unwrap();
        assert!(store.contains(&id).await.unwrap());
        assert_eq!(store.open(&id).await.unwrap(), blob);
    }

    #[tokio::test]
    async fn test_missing_object_and_ref() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskObjectStore::open(temp_dir.path()).unwrap();
        let id = ObjectId::new([5u8; 20]);
        assert!(matches!(store.open(&id).await, Err(Error::ObjectNotFound(_))));
        assert_eq!(store.read_ref(&branch_ref("master")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ref_compare_and_swap() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskObjectStore::open(temp_dir.path()).unwrap();
        let name = branch_ref("feature/x");
        let a = ObjectId::new([1u8; 20]);
        let b = ObjectId::new([2u8; 20]);

        assert!(store.compare_and_swap_ref(&name, None, a).await.unwrap());
        assert!(!store.compare_and_swap_ref(&name, None, b).await.unwrap());
        assert!(store.compare_and_swap_ref(&name, Some(a), b).await.unwrap());
        assert_eq!(store.read_ref(&name).await.unwrap(), Some(b));
        assert!(store.read_ref("refs/heads/../x").await.is_err());
    }
}
