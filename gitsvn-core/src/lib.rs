//! GitSvn Core Library
//!
//! Revision engine that serves a Git object store to Subversion clients:
//! - Git object model and content-addressed storage (memory, disk)
//! - Linear revision numbering over a branch's first-parent chain
//! - Subversion properties derived from `.gitattributes`
//! - Content filters (raw, symlink, LFS) with a digest cache
//! - Transactional commit builder with filter migration and
//!   optimistic publishing
//! - Path locks

pub mod attributes;
pub mod branch;
pub mod config;
pub mod disk_store;
pub mod error;
pub mod filter;
pub mod lfs;
pub mod locks;
pub mod object;
pub mod path;
pub mod pointer;
pub mod projection;
pub mod repository;
pub mod storage;
pub mod user;
pub mod writer;

pub use attributes::{svn_props, FileAttributes, Properties};
pub use branch::{Branch, Revision};
pub use config::{LfsConfig, RepositoryConfig};
pub use disk_store::DiskObjectStore;
pub use error::{Error, PropertyReport, Result};
pub use filter::{ContentFilter, FilterRegistry, LFS_FILTER, LINK_FILTER, RAW_FILTER};
pub use lfs::{LfsStorage, LocalLfsStorage, MemoryLfsStorage};
pub use locks::{Depth, LockDescriptor, LockStorage, MemoryLockStorage};
pub use object::{FileMode, ObjectId, ObjectKind, TreeEntry};
pub use pointer::{Oid, Pointer};
pub use projection::TreeNode;
pub use repository::{RepoContext, Repository};
pub use storage::{MemoryObjectStore, ObjectInserter, ObjectStore};
pub use user::User;
pub use writer::{CommitBuilder, ContentWriter, FileUpdate};
