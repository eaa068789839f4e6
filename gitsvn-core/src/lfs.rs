//! Content-addressable storage for LFS objects.
//!
//! The LFS filter only needs two things from a store: fetch content by its
//! SHA-256 oid, and stream new content in while the oid is computed. Where
//! the bytes live (local disk, memory, a remote server) is up to the
//! implementation.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::pointer::Oid;
use crate::user::User;

/// LFS object store interface
pub trait LfsStorage: Send + Sync {
    /// Look up an object. `None` when the store has no object with this oid
    /// and size.
    fn reader(&self, oid: &Oid, size: u64) -> Result<Option<Box<dyn LfsReader>>>;

    /// Start writing a new object on behalf of `user`
    fn writer(&self, user: &User) -> Result<Box<dyn LfsWriter>>;
}

/// Handle to a stored LFS object
pub trait LfsReader: Send {
    fn size(&self) -> u64;

    /// MD5 of the content if the store already knows it
    fn md5(&self) -> Option<String>;

    fn open(&self) -> Result<Box<dyn Read + Send>>;
}

/// Streaming writer for a new LFS object.
///
/// Dropping a writer without calling [`finish`](LfsWriter::finish) discards
/// everything written so far.
pub trait LfsWriter: Write + Send {
    /// Complete the object and return its oid. Fails if `expected` is given
    /// and does not match the written content.
    fn finish(self: Box<Self>, expected: Option<&Oid>) -> Result<Oid>;
}

/// SHA-256 and MD5 computed side by side while content streams through
struct ContentHasher {
    sha256: Sha256,
    md5: md5::Context,
}

impl ContentHasher {
    fn new() -> Self {
        Self {
            sha256: Sha256::new(),
            md5: md5::Context::new(),
        }
    }

    fn update(&mut self, data: &[u8]) {
        self.sha256.update(data);
        self.md5.consume(data);
    }

    fn finish(self) -> (Oid, String) {
        let oid = Oid::from_bytes(self.sha256.finalize().into());
        (oid, format!("{:x}", self.md5.compute()))
    }
}

fn check_expected(actual: &Oid, expected: Option<&Oid>) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(Error::InvalidObject(format!(
            "LFS content hash mismatch: expected {}, actual {}",
            expected, actual
        ))),
        _ => Ok(()),
    }
}

#[derive(Clone)]
struct MemoryObject {
    data: Bytes,
    md5: String,
}

/// In-memory LFS store
#[derive(Clone, Default)]
pub struct MemoryLfsStorage {
    objects: Arc<RwLock<HashMap<Oid, MemoryObject>>>,
}

impl MemoryLfsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, oid: &Oid) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(oid)
    }

    pub fn remove(&self, oid: &Oid) -> bool {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(oid)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LfsStorage for MemoryLfsStorage {
    fn reader(&self, oid: &Oid, size: u64) -> Result<Option<Box<dyn LfsReader>>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .get(oid)
            .filter(|object| object.data.len() as u64 == size)
            .map(|object| Box::new(object.clone()) as Box<dyn LfsReader>))
    }

    fn writer(&self, _user: &User) -> Result<Box<dyn LfsWriter>> {
        Ok(Box::new(MemoryWriter {
            objects: self.objects.clone(),
            buffer: Vec::new(),
        }))
    }
}

impl LfsReader for MemoryObject {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn md5(&self) -> Option<String> {
        Some(self.md5.clone())
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}

struct MemoryWriter {
    objects: Arc<RwLock<HashMap<Oid, MemoryObject>>>,
    buffer: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LfsWriter for MemoryWriter {
    fn finish(self: Box<Self>, expected: Option<&Oid>) -> Result<Oid> {
        let mut hasher = ContentHasher::new();
        hasher.update(&self.buffer);
        let (oid, md5) = hasher.finish();
        check_expected(&oid, expected)?;

        let object = MemoryObject {
            data: Bytes::from(self.buffer),
            md5,
        };
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(oid)
            .or_insert(object);
        Ok(oid)
    }
}

/// Local filesystem LFS store
///
/// Layout on disk (same as `.git/lfs`):
/// ```text
/// {root}/
///   objects/{oid[0..2]}/{oid[2..4]}/{oid}       content
///   objects/{oid[0..2]}/{oid[2..4]}/{oid}.md5   cached MD5 (hex)
///   tmp/                                       in-flight uploads
/// ```
pub struct LocalLfsStorage {
    root: PathBuf,
}

impl LocalLfsStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let root = path.to_path_buf();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root })
    }

    fn object_path(&self, oid: &Oid) -> PathBuf {
        let hex = oid.to_hex();
        self.root
            .join("objects")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex)
    }
}

impl LfsStorage for LocalLfsStorage {
    fn reader(&self, oid: &Oid, size: u64) -> Result<Option<Box<dyn LfsReader>>> {
        let path = self.object_path(oid);
        let actual = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if actual != size {
            return Ok(None);
        }
        Ok(Some(Box::new(LocalReader { path, size })))
    }

    fn writer(&self, _user: &User) -> Result<Box<dyn LfsWriter>> {
        let tmp_path = self
            .root
            .join("tmp")
            .join(uuid::Uuid::new_v4().to_string());
        let file = File::create(&tmp_path)?;
        Ok(Box::new(LocalWriter {
            root: self.root.clone(),
            tmp_path,
            file: Some(BufWriter::new(file)),
            hasher: Some(ContentHasher::new()),
        }))
    }
}

struct LocalReader {
    path: PathBuf,
    size: u64,
}

impl LfsReader for LocalReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn md5(&self) -> Option<String> {
        fs::read_to_string(self.path.with_extension("md5"))
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

struct LocalWriter {
    root: PathBuf,
    tmp_path: PathBuf,
    file: Option<BufWriter<File>>,
    hasher: Option<ContentHasher>,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("LFS writer already finished"))?;
        let written = file.write(buf)?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..written]);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl LfsWriter for LocalWriter {
    fn finish(mut self: Box<Self>, expected: Option<&Oid>) -> Result<Oid> {
        let file = self
            .file
            .take()
            .ok_or_else(|| Error::Internal("LFS writer already finished".into()))?;
        file.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        let hasher = self
            .hasher
            .take()
            .ok_or_else(|| Error::Internal("LFS writer already finished".into()))?;
        let (oid, md5) = hasher.finish();
        check_expected(&oid, expected)?;

        let storage = LocalLfsStorage {
            root: self.root.clone(),
        };
        let path = storage.object_path(&oid);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        if path.exists() {
            fs::remove_file(&self.tmp_path)?;
        } else {
            fs::rename(&self.tmp_path, &path)?;
        }
        fs::write(path.with_extension("md5"), md5)?;
        Ok(oid)
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        // Unfinished upload, or the temp file left behind by a failed finish
        if self.tmp_path.exists() {
            self.file.take();
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
