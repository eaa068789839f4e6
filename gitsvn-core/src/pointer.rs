//! LFS pointer records.
//!
//! A pointer is a small text blob that stands in for large content kept in
//! LFS storage. Only blobs strictly shorter than [`MAX_POINTER_SIZE`] are
//! ever considered as pointer candidates; anything longer is literal content
//! no matter what it starts with.

use sha2::{Digest, Sha256};
use std::fmt;

/// LFS specification version.
pub const LFS_SPEC_V1: &str = "https://git-lfs.github.com/spec/v1";

/// Size bound of a pointer record.
pub const MAX_POINTER_SIZE: usize = 1024;

const OID_PREFIX: &str = "sha256:";

/// LFS Object ID - a SHA256 hash of the file content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid {
    bytes: [u8; 32],
}

impl Oid {
    /// Create an OID from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Oid { bytes }
    }

    /// Parse an OID from a lowercase hex string.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return None;
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex, &mut bytes).ok()?;
        Some(Oid { bytes })
    }

    /// Compute the OID (SHA256 hash) of content.
    pub fn from_content(content: &[u8]) -> Self {
        Oid {
            bytes: Sha256::digest(content).into(),
        }
    }

    /// Get the OID as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

/// An LFS pointer representing a file stored in LFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pointer {
    /// The SHA256 hash of the file content.
    oid: Oid,
    /// The size of the file in bytes.
    size: u64,
}

impl Pointer {
    /// Create a new pointer with the given OID and size.
    pub fn new(oid: Oid, size: u64) -> Self {
        Pointer { oid, size }
    }

    /// Create a pointer from file content.
    pub fn from_content(content: &[u8]) -> Self {
        Pointer {
            oid: Oid::from_content(content),
            size: content.len() as u64,
        }
    }

    /// Get the OID of this pointer.
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Get the size of the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Parse a canonical pointer record.
    ///
    /// The record is a sequence of `key value\n` lines: `version` first, the
    /// remaining keys in strictly ascending order, `oid` and `size` required.
    /// Unknown keys are tolerated as long as they keep the ordering.
    pub fn parse(content: &[u8]) -> Option<Self> {
        if content.len() >= MAX_POINTER_SIZE {
            return None;
        }
        let text = std::str::from_utf8(content).ok()?;
        let body = text.strip_suffix('\n')?;

        let mut lines = body.split('\n');
        let (key, version) = lines.next()?.split_once(' ')?;
        if key != "version" || version != LFS_SPEC_V1 {
            return None;
        }

        let mut oid = None;
        let mut size = None;
        let mut last_key = "";
        for line in lines {
            let (key, value) = line.split_once(' ')?;
            if !valid_key(key) || key <= last_key {
                return None;
            }
            last_key = key;
            match key {
                "oid" => oid = Some(Oid::from_hex(value.strip_prefix(OID_PREFIX)?)?),
                "size" => size = Some(parse_size(value)?),
                _ => {}
            }
        }

        Some(Pointer {
            oid: oid?,
            size: size?,
        })
    }

    /// Encode the pointer to its canonical text representation.
    pub fn encode(&self) -> String {
        format!(
            "version {}\noid {}{}\nsize {}\n",
            LFS_SPEC_V1,
            OID_PREFIX,
            self.oid.to_hex(),
            self.size
        )
    }

    /// Encode the pointer to bytes.
    pub fn encode_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-'))
}

fn parse_size(value: &str) -> Option<u64> {
    if value.is_empty()
        || !value.bytes().all(|b| b.is_ascii_digit())
        || (value.len() > 1 && value.starts_with('0'))
    {
        return None;
    }
    value.parse().ok()
}
