mod cache;
mod memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::{CacheSummary, ContentCache};
pub use memory::MemoryFileStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no such file or directory: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// Full copy of one store entry, as produced by `snapshot` and consumed by
/// `hydrate`. Directories carry no data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub path: String,
    pub kind: NodeKind,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub create: bool,
    pub overwrite: bool,
}

impl WriteOptions {
    /// Create or replace.
    pub fn upsert() -> Self {
        Self {
            create: true,
            overwrite: true,
        }
    }
}

/// A completed mutation of a file. Directory operations are reported per
/// affected file; directories themselves are not tracked by git.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsMutation {
    Write { path: String, content: Vec<u8> },
    Delete { path: String },
    /// Carries the moved file's bytes so observers never re-read the store.
    Rename {
        old: String,
        new: String,
        content: Vec<u8>,
    },
}

/// Receives mutation events synchronously, after the store has released its
/// own lock. Implementations must not block.
pub trait MutationObserver: Send + Sync {
    fn on_mutation(&self, event: &FsMutation);
}

/// Unsubscribes its observer when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Virtual document tree addressed by absolute paths (`/articles/a.md`).
pub trait FileStore: Send + Sync {
    /// Missing parent directories are created.
    fn write_file(&self, path: &str, content: &[u8], options: WriteOptions)
        -> Result<(), StoreError>;

    fn read_file(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    fn delete(&self, path: &str, recursive: bool) -> Result<(), StoreError>;

    /// Succeeds when the directory already exists.
    fn create_directory(&self, path: &str) -> Result<(), StoreError>;

    fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>, StoreError>;

    fn rename(&self, old: &str, new: &str, overwrite: bool) -> Result<(), StoreError>;

    fn snapshot(&self) -> Vec<StoreEntry>;

    /// Replace the whole tree without notifying observers.
    fn hydrate(&self, entries: Vec<StoreEntry>);

    fn subscribe(&self, observer: Arc<dyn MutationObserver>) -> Subscription;
}
