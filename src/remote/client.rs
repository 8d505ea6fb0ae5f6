use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{config::RepoConfig, error::Result};

/// Git mode for a regular, non-executable file.
pub const FILE_MODE: &str = "100644";

/// One entry of a `create_tree` request.
///
/// `sha: None` serializes as JSON `null`, which the git tree API reads as
/// "remove this path from the base tree".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub mode: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: Option<String>,
}

impl TreeEntry {
    pub fn blob(path: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: FILE_MODE.to_string(),
            kind: "blob".to_string(),
            sha: Some(sha.into()),
        }
    }

    pub fn removal(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: FILE_MODE.to_string(),
            kind: "blob".to_string(),
            sha: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub tree_sha: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    /// Symlinks and submodules; never pulled.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    /// Repo-relative path.
    pub path: String,
    pub kind: EntryKind,
}

/// A single file as returned by the contents endpoint. Large files come back
/// without inline content and must be resolved through `get_blob`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: String,
    pub sha: String,
    pub content: Option<String>,
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentResponse {
    Directory(Vec<ListingEntry>),
    File(FileContent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobContent {
    pub content: Option<String>,
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { sha: String },
    /// Head was already contained in base.
    UpToDate,
}

/// Git-object-level operations against a hosted repository.
///
/// Implementations are stateless with respect to the sync engine: every call
/// names the repository explicitly so a configuration change between calls is
/// picked up immediately.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Resolve a branch to its head commit sha.
    async fn get_ref(&self, repo: &RepoConfig, branch: &str) -> Result<String>;

    async fn get_commit(&self, repo: &RepoConfig, sha: &str) -> Result<CommitInfo>;

    /// Create `branch` pointing at `from_sha`.
    async fn create_ref(&self, repo: &RepoConfig, branch: &str, from_sha: &str) -> Result<()>;

    /// Upload base64-encoded bytes and return the blob sha.
    async fn create_blob(&self, repo: &RepoConfig, base64_content: &str) -> Result<String>;

    async fn create_tree(
        &self,
        repo: &RepoConfig,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String>;

    async fn create_commit(
        &self,
        repo: &RepoConfig,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> Result<String>;

    /// Move `branch` to `commit_sha`. Non-fast-forward moves are rejected.
    async fn update_ref(&self, repo: &RepoConfig, branch: &str, commit_sha: &str) -> Result<()>;

    /// List a directory or fetch a file at `path` (repo-relative) on `branch`.
    async fn get_content(
        &self,
        repo: &RepoConfig,
        path: &str,
        branch: &str,
    ) -> Result<ContentResponse>;

    async fn get_blob(&self, repo: &RepoConfig, sha: &str) -> Result<BlobContent>;

    /// Server-side merge of `head` into `base`.
    async fn merge(
        &self,
        repo: &RepoConfig,
        base: &str,
        head: &str,
        message: &str,
    ) -> Result<MergeOutcome>;
}
