//! In-process git object model implementing `RemoteRepository`.
//!
//! Blobs, trees, commits and branch refs live in memory. Trees are kept
//! flattened (`path -> blob sha`) because the engine only ever addresses
//! files by full path. Used by the test suite and by `--offline` runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::{
    BlobContent, CommitInfo, ContentResponse, EntryKind, FileContent, ListingEntry, MergeOutcome,
    RemoteRepository, TreeEntry, FILE_MODE,
};
use crate::{
    config::RepoConfig,
    error::{Result, SyncError},
};

/// Remote operations, used for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    GetRef,
    GetCommit,
    CreateRef,
    CreateBlob,
    CreateTree,
    CreateCommit,
    UpdateRef,
    GetContent,
    GetBlob,
    Merge,
}

#[derive(Debug, Clone)]
struct CommitObject {
    tree: String,
    parents: Vec<String>,
}

#[derive(Default)]
struct RemoteData {
    blobs: HashMap<String, Vec<u8>>,
    trees: HashMap<String, BTreeMap<String, String>>,
    commits: HashMap<String, CommitObject>,
    refs: BTreeMap<String, String>,
    /// Stands in for the commit timestamp so identical commits get distinct ids.
    sequence: u64,
    calls: HashMap<RemoteOp, usize>,
    failures: HashMap<RemoteOp, usize>,
    inline_limit: Option<usize>,
}

#[derive(Default)]
pub struct MemoryRemote {
    data: Mutex<RemoteData>,
}

/// Git object id: SHA-1 over "<kind> <len>\0<data>".
fn object_id(kind: &str, data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{} {}\0", kind, data.len()).as_bytes());
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl RemoteData {
    fn record(&mut self, op: RemoteOp) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(remaining) = self.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::Transport(format!("injected {:?} failure", op)));
            }
        }
        Ok(())
    }

    fn put_blob(&mut self, content: &[u8]) -> String {
        let sha = object_id("blob", content);
        self.blobs.entry(sha.clone()).or_insert_with(|| content.to_vec());
        sha
    }

    fn put_tree(&mut self, entries: BTreeMap<String, String>) -> String {
        let mut serialized = Vec::new();
        for (path, sha) in &entries {
            serialized.extend_from_slice(format!("{} {}\0{}\n", FILE_MODE, path, sha).as_bytes());
        }
        let sha = object_id("tree", &serialized);
        self.trees.entry(sha.clone()).or_insert(entries);
        sha
    }

    fn put_commit(&mut self, message: &str, tree: &str, parents: &[String]) -> String {
        self.sequence += 1;
        let mut text = format!("tree {}\n", tree);
        for parent in parents {
            text.push_str(&format!("parent {}\n", parent));
        }
        text.push_str(&format!("seq {}\n\n{}", self.sequence, message));
        let sha = object_id("commit", text.as_bytes());
        self.commits.insert(
            sha.clone(),
            CommitObject {
                tree: tree.to_string(),
                parents: parents.to_vec(),
            },
        );
        sha
    }

    fn head(&self, branch: &str) -> Result<&String> {
        self.refs
            .get(branch)
            .ok_or_else(|| SyncError::NotFound(format!("branch {}", branch)))
    }

    fn commit(&self, sha: &str) -> Result<&CommitObject> {
        self.commits
            .get(sha)
            .ok_or_else(|| SyncError::NotFound(format!("commit {}", sha)))
    }

    fn tree(&self, sha: &str) -> Result<&BTreeMap<String, String>> {
        self.trees
            .get(sha)
            .ok_or_else(|| SyncError::NotFound(format!("tree {}", sha)))
    }

    fn branch_tree(&self, branch: &str) -> Result<&BTreeMap<String, String>> {
        let head = self.head(branch)?;
        let commit = self.commit(head)?;
        self.tree(&commit.tree)
    }

    fn ancestors(&self, sha: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([sha.to_string()]);
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&next) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        seen
    }

    /// Nearest commit reachable from both `a` and `b`, breadth-first from `b`.
    fn merge_base(&self, a: &str, b: &str) -> Option<String> {
        let from_a = self.ancestors(a);
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([b.to_string()]);
        while let Some(next) = queue.pop_front() {
            if from_a.contains(&next) {
                return Some(next);
            }
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&next) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        None
    }

    fn commit_to_branch(
        &mut self,
        branch: &str,
        writes: &[(&str, &[u8])],
        deletes: &[&str],
        message: &str,
    ) -> String {
        let (mut entries, parents) = match self.refs.get(branch).cloned() {
            Some(head) => {
                let tree = self
                    .commits
                    .get(&head)
                    .and_then(|c| self.trees.get(&c.tree))
                    .cloned()
                    .unwrap_or_default();
                (tree, vec![head])
            }
            None => (BTreeMap::new(), Vec::new()),
        };
        for (path, content) in writes {
            let sha = self.put_blob(content);
            entries.insert((*path).to_string(), sha);
        }
        for path in deletes {
            entries.remove(*path);
        }
        let tree = self.put_tree(entries);
        let commit = self.put_commit(message, &tree, &parents);
        self.refs.insert(branch.to_string(), commit.clone());
        commit
    }
}

impl MemoryRemote {
    /// An empty repository with no branches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit `files` onto `branch`, creating it when absent.
    pub fn seed_branch(&self, branch: &str, files: &[(&str, &[u8])]) -> String {
        self.data
            .lock()
            .commit_to_branch(branch, files, &[], "seed")
    }

    /// Simulate another writer committing directly to `branch`.
    pub fn commit_files(
        &self,
        branch: &str,
        writes: &[(&str, &[u8])],
        deletes: &[&str],
        message: &str,
    ) -> String {
        self.data
            .lock()
            .commit_to_branch(branch, writes, deletes, message)
    }

    pub fn head(&self, branch: &str) -> Option<String> {
        self.data.lock().refs.get(branch).cloned()
    }

    /// Parent shas of `commit`.
    pub fn parents(&self, commit: &str) -> Vec<String> {
        self.data
            .lock()
            .commits
            .get(commit)
            .map(|c| c.parents.clone())
            .unwrap_or_default()
    }

    pub fn blob_sha(&self, branch: &str, path: &str) -> Option<String> {
        let data = self.data.lock();
        data.branch_tree(branch).ok()?.get(path).cloned()
    }

    pub fn file(&self, branch: &str, path: &str) -> Option<Vec<u8>> {
        let data = self.data.lock();
        let sha = data.branch_tree(branch).ok()?.get(path)?;
        data.blobs.get(sha).cloned()
    }

    /// Every file on `branch` with its bytes.
    pub fn files(&self, branch: &str) -> BTreeMap<String, Vec<u8>> {
        let data = self.data.lock();
        let Ok(tree) = data.branch_tree(branch) else {
            return BTreeMap::new();
        };
        tree.iter()
            .filter_map(|(path, sha)| data.blobs.get(sha).map(|b| (path.clone(), b.clone())))
            .collect()
    }

    pub fn call_count(&self, op: RemoteOp) -> usize {
        self.data.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Make the next `count` calls of `op` fail with a transport error.
    pub fn fail_next(&self, op: RemoteOp, count: usize) {
        self.data.lock().failures.insert(op, count);
    }

    /// Omit inline content for files larger than `limit` bytes, forcing a
    /// blob fetch the way the hosted API does for large files.
    pub fn set_inline_limit(&self, limit: Option<usize>) {
        self.data.lock().inline_limit = limit;
    }
}

#[async_trait]
impl RemoteRepository for MemoryRemote {
    async fn get_ref(&self, _repo: &RepoConfig, branch: &str) -> Result<String> {
        let mut data = self.data.lock();
        data.record(RemoteOp::GetRef)?;
        data.head(branch).cloned()
    }

    async fn get_commit(&self, _repo: &RepoConfig, sha: &str) -> Result<CommitInfo> {
        let mut data = self.data.lock();
        data.record(RemoteOp::GetCommit)?;
        let commit = data.commit(sha)?;
        Ok(CommitInfo {
            sha: sha.to_string(),
            tree_sha: commit.tree.clone(),
        })
    }

    async fn create_ref(&self, _repo: &RepoConfig, branch: &str, from_sha: &str) -> Result<()> {
        let mut data = self.data.lock();
        data.record(RemoteOp::CreateRef)?;
        if data.refs.contains_key(branch) {
            return Err(SyncError::Conflict(format!("reference heads/{} already exists", branch)));
        }
        data.commit(from_sha)?;
        data.refs.insert(branch.to_string(), from_sha.to_string());
        Ok(())
    }

    async fn create_blob(&self, _repo: &RepoConfig, base64_content: &str) -> Result<String> {
        let mut data = self.data.lock();
        data.record(RemoteOp::CreateBlob)?;
        let bytes = STANDARD.decode(base64_content)?;
        Ok(data.put_blob(&bytes))
    }

    async fn create_tree(
        &self,
        _repo: &RepoConfig,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String> {
        let mut data = self.data.lock();
        data.record(RemoteOp::CreateTree)?;
        let mut tree = data.tree(base_tree)?.clone();
        for entry in entries {
            match &entry.sha {
                Some(sha) => {
                    if !data.blobs.contains_key(sha) {
                        return Err(SyncError::Conflict(format!(
                            "tree entry {} references unknown blob {}",
                            entry.path, sha
                        )));
                    }
                    tree.insert(entry.path.clone(), sha.clone());
                }
                None => {
                    tree.remove(&entry.path);
                }
            }
        }
        Ok(data.put_tree(tree))
    }

    async fn create_commit(
        &self,
        _repo: &RepoConfig,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> Result<String> {
        let mut data = self.data.lock();
        data.record(RemoteOp::CreateCommit)?;
        data.tree(tree_sha)?;
        for parent in parents {
            data.commit(parent)?;
        }
        Ok(data.put_commit(message, tree_sha, parents))
    }

    async fn update_ref(&self, _repo: &RepoConfig, branch: &str, commit_sha: &str) -> Result<()> {
        let mut data = self.data.lock();
        data.record(RemoteOp::UpdateRef)?;
        let current = data.head(branch)?.clone();
        data.commit(commit_sha)?;
        if !data.ancestors(commit_sha).contains(&current) {
            return Err(SyncError::Conflict(format!(
                "update of heads/{} is not a fast forward",
                branch
            )));
        }
        data.refs.insert(branch.to_string(), commit_sha.to_string());
        Ok(())
    }

    async fn get_content(
        &self,
        _repo: &RepoConfig,
        path: &str,
        branch: &str,
    ) -> Result<ContentResponse> {
        let mut data = self.data.lock();
        data.record(RemoteOp::GetContent)?;
        let path = path.trim_matches('/');
        let tree = data.branch_tree(branch)?;

        if let Some(sha) = tree.get(path) {
            let blob = data.blobs.get(sha).cloned().unwrap_or_default();
            let inline = data.inline_limit.map_or(true, |limit| blob.len() <= limit);
            return Ok(ContentResponse::File(FileContent {
                path: path.to_string(),
                sha: sha.clone(),
                content: inline.then(|| STANDARD.encode(&blob)),
                encoding: inline.then(|| "base64".to_string()),
            }));
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let mut children: BTreeMap<String, EntryKind> = BTreeMap::new();
        for file in tree.keys().filter(|p| p.starts_with(&prefix)) {
            let rest = &file[prefix.len()..];
            match rest.split_once('/') {
                Some((dir, _)) => {
                    children.insert(dir.to_string(), EntryKind::Dir);
                }
                None => {
                    children.entry(rest.to_string()).or_insert(EntryKind::File);
                }
            }
        }
        if children.is_empty() {
            return Err(SyncError::NotFound(format!("{} on {}", path, branch)));
        }
        Ok(ContentResponse::Directory(
            children
                .into_iter()
                .map(|(name, kind)| ListingEntry {
                    path: format!("{}{}", prefix, name),
                    name,
                    kind,
                })
                .collect(),
        ))
    }

    async fn get_blob(&self, _repo: &RepoConfig, sha: &str) -> Result<BlobContent> {
        let mut data = self.data.lock();
        data.record(RemoteOp::GetBlob)?;
        let blob = data
            .blobs
            .get(sha)
            .ok_or_else(|| SyncError::NotFound(format!("blob {}", sha)))?;
        Ok(BlobContent {
            content: Some(STANDARD.encode(blob)),
            encoding: Some("base64".to_string()),
        })
    }

    async fn merge(
        &self,
        _repo: &RepoConfig,
        base: &str,
        head: &str,
        message: &str,
    ) -> Result<MergeOutcome> {
        let mut data = self.data.lock();
        data.record(RemoteOp::Merge)?;
        let base_sha = data.head(base)?.clone();
        let head_sha = data.head(head)?.clone();

        if data.ancestors(&base_sha).contains(&head_sha) {
            return Ok(MergeOutcome::UpToDate);
        }

        let ours = data.tree(&data.commit(&base_sha)?.tree)?.clone();
        let theirs = data.tree(&data.commit(&head_sha)?.tree)?.clone();
        let ancestor = match data.merge_base(&base_sha, &head_sha) {
            Some(sha) => data.tree(&data.commit(&sha)?.tree)?.clone(),
            None => BTreeMap::new(),
        };

        let paths: BTreeSet<&String> = ours.keys().chain(theirs.keys()).collect();
        let mut merged = BTreeMap::new();
        for path in paths {
            let (o, t, a) = (ours.get(path), theirs.get(path), ancestor.get(path));
            let pick = if o == t || t == a {
                o
            } else if o == a {
                t
            } else {
                return Err(SyncError::Conflict(format!("merge conflict in {}", path)));
            };
            if let Some(sha) = pick {
                merged.insert(path.clone(), sha.clone());
            }
        }

        let tree = data.put_tree(merged);
        let sha = data.put_commit(message, &tree, &[base_sha, head_sha]);
        data.refs.insert(base.to_string(), sha.clone());
        Ok(MergeOutcome::Merged { sha })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepoConfig {
        RepoConfig {
            owner: "owner".to_string(),
            repo: "repo".to_string(),
            main_branch: "main".to_string(),
            work_branch: "work".to_string(),
        }
    }

    #[test]
    fn blob_ids_match_git() {
        // `git hash-object` of "hello\n"
        assert_eq!(
            object_id("blob", b"hello\n"),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
    }

    #[tokio::test]
    async fn commit_cycle_moves_branch() {
        let remote = MemoryRemote::new();
        remote.seed_branch("main", &[("articles/a.md", b"one")]);
        let repo = repo();

        let head = remote.get_ref(&repo, "main").await.unwrap();
        let base = remote.get_commit(&repo, &head).await.unwrap();
        let blob = remote.create_blob(&repo, &STANDARD.encode("two")).await.unwrap();
        let tree = remote
            .create_tree(
                &repo,
                &base.tree_sha,
                &[
                    TreeEntry::blob("articles/b.md", blob),
                    TreeEntry::removal("articles/a.md"),
                ],
            )
            .await
            .unwrap();
        let commit = remote
            .create_commit(&repo, "sync", &tree, &[head.clone()])
            .await
            .unwrap();
        remote.update_ref(&repo, "main", &commit).await.unwrap();

        let files = remote.files("main");
        assert_eq!(files.len(), 1);
        assert_eq!(files["articles/b.md"], b"two");
        assert_eq!(remote.parents(&commit), vec![head]);
    }

    #[tokio::test]
    async fn update_ref_rejects_non_fast_forward() {
        let remote = MemoryRemote::new();
        let root = remote.seed_branch("main", &[("a", b"1")]);
        remote.commit_files("main", &[("a", b"2")], &[], "other writer");
        let repo = repo();

        let tree = remote.get_commit(&repo, &root).await.unwrap().tree_sha;
        let stale = remote
            .create_commit(&repo, "stale", &tree, &[root])
            .await
            .unwrap();
        let err = remote.update_ref(&repo, "main", &stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn content_lists_directories() {
        let remote = MemoryRemote::new();
        remote.seed_branch(
            "main",
            &[
                ("articles/a.md", b"a"),
                ("books/b/config.yaml", b"c"),
                ("books/b/01.md", b"1"),
            ],
        );
        let repo = repo();

        let ContentResponse::Directory(entries) =
            remote.get_content(&repo, "books", "main").await.unwrap()
        else {
            panic!("expected listing");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "books/b");
        assert_eq!(entries[0].kind, EntryKind::Dir);

        let err = remote.get_content(&repo, "images", "main").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn inline_limit_omits_content() {
        let remote = MemoryRemote::new();
        remote.seed_branch("main", &[("images/big.png", b"0123456789")]);
        remote.set_inline_limit(Some(4));

        let ContentResponse::File(file) = remote
            .get_content(&repo(), "images/big.png", "main")
            .await
            .unwrap()
        else {
            panic!("expected file");
        };
        assert!(file.content.is_none());
    }

    #[tokio::test]
    async fn merge_detects_conflicts() {
        let remote = MemoryRemote::new();
        let root = remote.seed_branch("main", &[("a", b"base")]);
        remote.data.lock().refs.insert("work".to_string(), root);
        remote.commit_files("main", &[("a", b"main side")], &[], "main edit");
        remote.commit_files("work", &[("a", b"work side")], &[], "work edit");

        let err = remote
            .merge(&repo(), "main", "work", "deploy")
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn merge_combines_disjoint_edits() {
        let remote = MemoryRemote::new();
        let root = remote.seed_branch("main", &[("a", b"base"), ("b", b"base")]);
        remote.data.lock().refs.insert("work".to_string(), root);
        remote.commit_files("main", &[("a", b"main side")], &[], "main edit");
        remote.commit_files("work", &[("c", b"new")], &["b"], "work edit");

        let outcome = remote.merge(&repo(), "main", "work", "deploy").await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged { .. }));

        let files = remote.files("main");
        assert_eq!(files["a"], b"main side");
        assert_eq!(files["c"], b"new");
        assert!(!files.contains_key("b"));

        let again = remote.merge(&repo(), "main", "work", "deploy").await.unwrap();
        assert_eq!(again, MergeOutcome::UpToDate);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let remote = MemoryRemote::new();
        remote.seed_branch("main", &[]);
        remote.fail_next(RemoteOp::GetRef, 1);

        assert!(remote.get_ref(&repo(), "main").await.is_err());
        assert!(remote.get_ref(&repo(), "main").await.is_ok());
        assert_eq!(remote.call_count(RemoteOp::GetRef), 2);
    }
}
