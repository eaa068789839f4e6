//! Content filters
//!
//! A filter translates between the bytes a Subversion client sees and the
//! blob stored in Git. The same filter must be used to write a blob and to
//! read it back; the commit builder enforces that before publishing.
//!
//! - `raw`: content stored as is
//! - `link`: symlinks; Subversion sees `link <target>`, Git stores `<target>`
//! - `lfs`: content kept in an [`LfsStorage`], Git stores a pointer record

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

use crate::error::{Error, Result};
use crate::lfs::{LfsReader, LfsStorage, LfsWriter};
use crate::object::{FileMode, ObjectId, ObjectKind};
use crate::pointer::Pointer;
use crate::storage::ObjectStore;
use crate::user::User;

pub const RAW_FILTER: &str = "raw";
pub const LINK_FILTER: &str = "link";
pub const LFS_FILTER: &str = "lfs";

/// Number of leading bytes inspected by binary detection
const BINARY_PROBE_SIZE: u64 = 8000;

const LINK_PREFIX: &[u8] = b"link ";

/// Sink returned by [`ContentFilter::open_write`]
pub trait FilterWriter: Write + Send {
    /// Complete the write and return the payload of the Git blob
    fn finish(self: Box<Self>) -> Result<Bytes>;
}

/// Bidirectional mapping between Subversion content and Git blobs
#[async_trait]
pub trait ContentFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// MD5 (hex) of the content a client would read
    async fn content_digest(&self, id: &ObjectId) -> Result<String>;

    /// Size of the content a client would read
    async fn size(&self, id: &ObjectId) -> Result<u64>;

    async fn open_read(&self, id: &ObjectId) -> Result<Box<dyn Read + Send>>;

    /// Client content of a blob payload that was already loaded
    fn decode(&self, blob: Bytes) -> Result<Box<dyn Read + Send>>;

    fn open_write(&self, user: &User) -> Result<Box<dyn FilterWriter>>;

    /// Whether the content looks binary (NUL in the leading bytes)
    async fn is_binary(&self, id: &ObjectId) -> Result<bool> {
        let reader = self.open_read(id).await?;
        let mut probe = Vec::new();
        reader.take(BINARY_PROBE_SIZE).read_to_end(&mut probe)?;
        Ok(probe.contains(&0))
    }
}

/// MD5 (hex) of everything `reader` yields
pub fn md5_hex(reader: &mut dyn Read) -> Result<String> {
    let mut context = md5::Context::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// LRU cache of computed content digests, keyed by filter and blob
pub struct DigestCache {
    entries: Mutex<LruCache<(&'static str, ObjectId), String>>,
}

impl DigestCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, filter: &'static str, id: &ObjectId) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(filter, *id))
            .cloned()
    }

    pub fn put(&self, filter: &'static str, id: ObjectId, digest: String) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put((filter, id), digest);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn cached_digest(
    filter: &dyn ContentFilter,
    cache: &DigestCache,
    id: &ObjectId,
) -> Result<String> {
    if let Some(digest) = cache.get(filter.name(), id) {
        return Ok(digest);
    }
    let mut reader = filter.open_read(id).await?;
    let digest = md5_hex(&mut reader)?;
    cache.put(filter.name(), *id, digest.clone());
    Ok(digest)
}

/// Buffers written bytes; `finish` hands them back transformed
struct BufferWriter {
    buffer: Vec<u8>,
    transform: fn(Vec<u8>) -> Vec<u8>,
}

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FilterWriter for BufferWriter {
    fn finish(self: Box<Self>) -> Result<Bytes> {
        Ok(Bytes::from((self.transform)(self.buffer)))
    }
}

/// Literal content
pub struct RawFilter {
    store: Arc<dyn ObjectStore>,
    cache: Arc<DigestCache>,
}

impl RawFilter {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<DigestCache>) -> Self {
        Self { store, cache }
    }
}

#[async_trait]
impl ContentFilter for RawFilter {
    fn name(&self) -> &'static str {
        RAW_FILTER
    }

    async fn content_digest(&self, id: &ObjectId) -> Result<String> {
        cached_digest(self, &self.cache, id).await
    }

    async fn size(&self, id: &ObjectId) -> Result<u64> {
        Ok(self.store.open_kind(id, ObjectKind::Blob).await?.len() as u64)
    }

    async fn open_read(&self, id: &ObjectId) -> Result<Box<dyn Read + Send>> {
        self.decode(self.store.open_kind(id, ObjectKind::Blob).await?)
    }

    fn decode(&self, blob: Bytes) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(blob)))
    }

    fn open_write(&self, _user: &User) -> Result<Box<dyn FilterWriter>> {
        Ok(Box::new(BufferWriter {
            buffer: Vec::new(),
            transform: |data| data,
        }))
    }
}

/// Symlinks
pub struct LinkFilter {
    store: Arc<dyn ObjectStore>,
    cache: Arc<DigestCache>,
}

impl LinkFilter {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<DigestCache>) -> Self {
        Self { store, cache }
    }
}

#[async_trait]
impl ContentFilter for LinkFilter {
    fn name(&self) -> &'static str {
        LINK_FILTER
    }

    async fn content_digest(&self, id: &ObjectId) -> Result<String> {
        cached_digest(self, &self.cache, id).await
    }

    async fn size(&self, id: &ObjectId) -> Result<u64> {
        let target = self.store.open_kind(id, ObjectKind::Blob).await?;
        Ok((LINK_PREFIX.len() + target.len()) as u64)
    }

    async fn open_read(&self, id: &ObjectId) -> Result<Box<dyn Read + Send>> {
        self.decode(self.store.open_kind(id, ObjectKind::Blob).await?)
    }

    fn decode(&self, target: Bytes) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(LINK_PREFIX).chain(Cursor::new(target))))
    }

    fn open_write(&self, _user: &User) -> Result<Box<dyn FilterWriter>> {
        Ok(Box::new(BufferWriter {
            buffer: Vec::new(),
            transform: |data| match data.strip_prefix(LINK_PREFIX) {
                Some(target) => target.to_vec(),
                None => data,
            },
        }))
    }

    async fn is_binary(&self, _id: &ObjectId) -> Result<bool> {
        Ok(false)
    }
}

/// Git LFS
pub struct LfsFilter {
    store: Arc<dyn ObjectStore>,
    storage: Arc<dyn LfsStorage>,
    cache: Arc<DigestCache>,
}

impl LfsFilter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        storage: Arc<dyn LfsStorage>,
        cache: Arc<DigestCache>,
    ) -> Self {
        Self {
            store,
            storage,
            cache,
        }
    }

    /// The blob and, if it is a pointer record, the parsed pointer
    async fn load(&self, id: &ObjectId) -> Result<(Bytes, Option<Pointer>)> {
        let data = self.store.open_kind(id, ObjectKind::Blob).await?;
        let pointer = Pointer::parse(&data);
        Ok((data, pointer))
    }

    fn reader(&self, pointer: &Pointer) -> Result<Box<dyn LfsReader>> {
        self.storage
            .reader(pointer.oid(), pointer.size())?
            .ok_or_else(|| Error::ForbiddenContent(pointer.oid().to_hex()))
    }
}

#[async_trait]
impl ContentFilter for LfsFilter {
    fn name(&self) -> &'static str {
        LFS_FILTER
    }

    async fn content_digest(&self, id: &ObjectId) -> Result<String> {
        if let (_, Some(pointer)) = self.load(id).await? {
            if let Some(md5) = self.reader(&pointer)?.md5() {
                return Ok(md5);
            }
        }
        cached_digest(self, &self.cache, id).await
    }

    async fn size(&self, id: &ObjectId) -> Result<u64> {
        Ok(match self.load(id).await? {
            (_, Some(pointer)) => pointer.size(),
            (data, None) => data.len() as u64,
        })
    }

    async fn open_read(&self, id: &ObjectId) -> Result<Box<dyn Read + Send>> {
        let (data, _) = self.load(id).await?;
        self.decode(data)
    }

    fn decode(&self, blob: Bytes) -> Result<Box<dyn Read + Send>> {
        match Pointer::parse(&blob) {
            Some(pointer) => self.reader(&pointer)?.open(),
            None => Ok(Box::new(Cursor::new(blob))),
        }
    }

    fn open_write(&self, user: &User) -> Result<Box<dyn FilterWriter>> {
        Ok(Box::new(LfsPointerWriter {
            content: self.storage.writer(user)?,
            size: 0,
        }))
    }
}

/// Streams content into LFS storage; the Git blob is the pointer record
struct LfsPointerWriter {
    content: Box<dyn LfsWriter>,
    size: u64,
}

impl Write for LfsPointerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.content.write(buf)?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.content.flush()
    }
}

impl FilterWriter for LfsPointerWriter {
    fn finish(self: Box<Self>) -> Result<Bytes> {
        // Empty content stays an empty blob; the unfinished LFS upload is
        // discarded when dropped.
        if self.size == 0 {
            return Ok(Bytes::new());
        }
        let size = self.size;
        let oid = self.content.finish(None)?;
        Ok(Bytes::from(Pointer::new(oid, size).encode_bytes()))
    }
}

/// Filters available to a repository
pub struct FilterRegistry {
    filters: HashMap<&'static str, Arc<dyn ContentFilter>>,
    raw: Arc<dyn ContentFilter>,
}

impl FilterRegistry {
    /// Registry with `raw` and `link`, plus `lfs` when `lfs` storage is given
    pub fn new(
        store: Arc<dyn ObjectStore>,
        lfs: Option<Arc<dyn LfsStorage>>,
        digest_cache_size: usize,
    ) -> Self {
        let cache = Arc::new(DigestCache::new(digest_cache_size));
        let raw: Arc<dyn ContentFilter> = Arc::new(RawFilter::new(store.clone(), cache.clone()));
        let mut registry = Self {
            filters: HashMap::new(),
            raw: raw.clone(),
        };
        registry.register(raw);
        registry.register(Arc::new(LinkFilter::new(store.clone(), cache.clone())));
        if let Some(storage) = lfs {
            registry.register(Arc::new(LfsFilter::new(store, storage, cache)));
        }
        registry
    }

    pub fn register(&mut self, filter: Arc<dyn ContentFilter>) {
        self.filters.insert(filter.name(), filter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ContentFilter>> {
        self.filters.get(name).cloned()
    }

    /// Filter for a blob with `mode` and the rule-assigned filter name
    pub fn select(&self, mode: FileMode, name: Option<&str>) -> Arc<dyn ContentFilter> {
        if mode == FileMode::Symlink {
            if let Some(link) = self.get(LINK_FILTER) {
                return link;
            }
        }
        match name {
            None => self.raw.clone(),
            Some(name) => self.get(name).unwrap_or_else(|| {
                warn!("Unknown filter {:?}, falling back to {}", name, RAW_FILTER);
                self.raw.clone()
            }),
        }
    }
}
