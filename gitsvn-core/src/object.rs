//! Git object model used as the durable revision store
//!
//! Blobs, trees and commits are encoded exactly as Git encodes them, so the
//! object ids produced here are the ids Git itself would compute.

use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// Unique identifier for any stored object (SHA-1 of the Git encoding)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Compute the id of an object of `kind` holding `data`
    pub fn for_object(kind: ObjectKind, data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| Error::InvalidObject(format!("bad object id {:?}: {}", hex_str, e)))?;
        Self::from_slice(&bytes)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::InvalidObject(format!("object id has {} bytes", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

/// Object type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(Error::InvalidObject(format!("unknown object kind: {}", other))),
        }
    }
}

/// A stored object: its kind and raw payload (without the Git header)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub kind: ObjectKind,
    pub data: Bytes,
}

impl StoredObject {
    pub fn new(kind: ObjectKind, data: Bytes) -> Self {
        Self { kind, data }
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::for_object(self.kind, &self.data)
    }
}

/// Tree entry mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileMode {
    Tree,
    Regular,
    Executable,
    Symlink,
    /// Submodule commit reference
    Gitlink,
}

impl FileMode {
    /// Octal representation used inside tree objects
    pub fn as_octal(&self) -> &'static str {
        match self {
            FileMode::Tree => "40000",
            FileMode::Regular => "100644",
            FileMode::Executable => "100755",
            FileMode::Symlink => "120000",
            FileMode::Gitlink => "160000",
        }
    }

    pub fn parse_octal(mode: &str) -> Result<Self> {
        match mode {
            "40000" | "040000" => Ok(FileMode::Tree),
            "100644" | "100664" => Ok(FileMode::Regular),
            "100755" => Ok(FileMode::Executable),
            "120000" => Ok(FileMode::Symlink),
            "160000" => Ok(FileMode::Gitlink),
            other => Err(Error::InvalidObject(format!("unknown file mode: {}", other))),
        }
    }

    /// Kind of object an entry with this mode points to
    pub fn object_kind(&self) -> ObjectKind {
        match self {
            FileMode::Tree => ObjectKind::Tree,
            FileMode::Gitlink => ObjectKind::Commit,
            FileMode::Regular | FileMode::Executable | FileMode::Symlink => ObjectKind::Blob,
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, FileMode::Tree)
    }

    pub fn is_blob(&self) -> bool {
        self.object_kind() == ObjectKind::Blob
    }
}

/// Directory tree entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeEntry {
    /// Name of the entry
    pub name: String,
    /// Entry mode
    pub mode: FileMode,
    /// Object ID (points to Blob or Tree)
    pub id: ObjectId,
}

impl TreeEntry {
    /// Create a new tree entry
    pub fn new(name: impl Into<String>, mode: FileMode, id: ObjectId) -> Self {
        Self {
            name: name.into(),
            mode,
            id,
        }
    }
}

/// Git tree ordering: names compare bytewise, trees as if suffixed with `/`
pub fn tree_order(a: &TreeEntry, b: &TreeEntry) -> Ordering {
    let suffix = |entry: &TreeEntry| if entry.mode.is_tree() { Some(b'/') } else { None };
    a.name
        .bytes()
        .chain(suffix(a))
        .cmp(b.name.bytes().chain(suffix(b)))
}

/// Encode tree entries in canonical Git order
pub fn encode_tree(entries: &[TreeEntry]) -> Bytes {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| tree_order(a, b));

    let mut data = Vec::with_capacity(entries.len() * 40);
    for entry in sorted {
        data.extend_from_slice(entry.mode.as_octal().as_bytes());
        data.push(b' ');
        data.extend_from_slice(entry.name.as_bytes());
        data.push(0);
        data.extend_from_slice(entry.id.as_bytes());
    }
    Bytes::from(data)
}

/// Id of the tree with no entries
pub fn empty_tree_id() -> ObjectId {
    ObjectId::for_object(ObjectKind::Tree, b"")
}

/// Decode a tree object payload
pub fn decode_tree(data: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| Error::InvalidObject("tree entry without mode".into()))?;
        let mode = std::str::from_utf8(&rest[..space])
            .map_err(|_| Error::InvalidObject("tree entry mode is not UTF-8".into()))?;
        let mode = FileMode::parse_octal(mode)?;
        rest = &rest[space + 1..];

        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::InvalidObject("tree entry without name".into()))?;
        let name = String::from_utf8(rest[..nul].to_vec())
            .map_err(|_| Error::InvalidObject("tree entry name is not UTF-8".into()))?;
        rest = &rest[nul + 1..];

        if rest.len() < 20 {
            return Err(Error::InvalidObject(format!("truncated tree entry: {}", name)));
        }
        let id = ObjectId::from_slice(&rest[..20])?;
        rest = &rest[20..];

        entries.push(TreeEntry::new(name, mode, id));
    }
    Ok(entries)
}

/// Author/committer identity with timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Unix seconds
    pub timestamp: i64,
    /// Timezone offset in minutes
    pub tz_offset: i32,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            timestamp,
            tz_offset: 0,
        }
    }

    fn encode(&self) -> String {
        let sign = if self.tz_offset < 0 { '-' } else { '+' };
        let offset = self.tz_offset.abs();
        format!(
            "{} <{}> {} {}{:02}{:02}",
            self.name,
            self.email,
            self.timestamp,
            sign,
            offset / 60,
            offset % 60
        )
    }

    fn decode(line: &str) -> Result<Self> {
        let bad = || Error::InvalidObject(format!("bad signature: {}", line));
        let open = line.find('<').ok_or_else(bad)?;
        let close = line.rfind('>').ok_or_else(bad)?;
        if close < open {
            return Err(bad());
        }
        let name = line[..open].trim_end().to_string();
        let email = line[open + 1..close].to_string();
        let mut tail = line[close + 1..].split_whitespace();
        let timestamp = tail
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or_else(bad)?;
        let tz_offset = match tail.next() {
            Some(tz) if tz.len() == 5 => {
                let field = |range: std::ops::Range<usize>| {
                    tz.get(range).and_then(|v| v.parse::<i32>().ok())
                };
                let hours = field(1..3).ok_or_else(bad)?;
                let minutes = field(3..5).ok_or_else(bad)?;
                let offset = hours * 60 + minutes;
                if tz.starts_with('-') { -offset } else { offset }
            }
            _ => 0,
        };
        Ok(Self {
            name,
            email,
            timestamp,
            tz_offset,
        })
    }
}

/// Commit/Revision object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Tree object ID for this revision
    pub tree: ObjectId,
    /// First parent (empty for initial commit)
    pub parent: Option<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl CommitRecord {
    pub fn new(tree: ObjectId, parent: Option<ObjectId>, author: Signature, message: String) -> Self {
        Self {
            tree,
            parent,
            committer: author.clone(),
            author,
            message,
        }
    }

    /// Encode to the Git commit format
    pub fn encode(&self) -> Bytes {
        let mut text = format!("tree {}\n", self.tree);
        if let Some(parent) = &self.parent {
            text.push_str(&format!("parent {}\n", parent));
        }
        text.push_str(&format!("author {}\n", self.author.encode()));
        text.push_str(&format!("committer {}\n", self.committer.encode()));
        text.push('\n');
        text.push_str(&self.message);
        Bytes::from(text)
    }

    /// Decode a commit payload; only the first parent is kept
    pub fn decode(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::InvalidObject("commit is not UTF-8".into()))?;
        let (headers, message) = text.split_once("\n\n").unwrap_or((text, ""));

        let mut tree = None;
        let mut parent = None;
        let mut author = None;
        let mut committer = None;
        for line in headers.lines() {
            // Continuation lines of multi-line headers (gpgsig, mergetag)
            if line.starts_with(' ') {
                continue;
            }
            match line.split_once(' ') {
                Some(("tree", id)) => tree = Some(ObjectId::from_hex(id)?),
                Some(("parent", id)) if parent.is_none() => parent = Some(ObjectId::from_hex(id)?),
                Some(("author", sig)) => author = Some(Signature::decode(sig)?),
                Some(("committer", sig)) => committer = Some(Signature::decode(sig)?),
                _ => {}
            }
        }

        let tree = tree.ok_or_else(|| Error::InvalidObject("commit without tree".into()))?;
        let author = author.ok_or_else(|| Error::InvalidObject("commit without author".into()))?;
        let committer = committer.unwrap_or_else(|| author.clone());
        Ok(Self {
            tree,
            parent,
            author,
            committer,
            message: message.to_string(),
        })
    }

    /// Check if this is an initial commit (no parents)
    pub fn is_initial(&self) -> bool {
        self.parent.is_none()
    }
}
