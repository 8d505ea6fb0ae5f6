use std::collections::{BTreeMap, BTreeSet, HashMap};

use sha2::{Digest, Sha256};

use crate::{path::to_virtual_path, remote::TreeEntry};

/// SHA-256 of `content`, hex encoded. Used to detect no-op writes.
pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub content: Vec<u8>,
    pub hash: String,
}

/// Immutable copy of the pending change set, taken at commit start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub writes: Vec<(String, PendingWrite)>,
    pub deletes: Vec<String>,
}

impl LedgerSnapshot {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// What the engine believes the remote holds on one branch.
#[derive(Debug, Default)]
struct BranchState {
    shas: HashMap<String, String>,
    hashes: HashMap<String, String>,
}

/// Not-yet-committed writes and deletes, keyed by repo-relative path, plus
/// per-branch known-remote state. A path is never both written and deleted.
#[derive(Debug, Default)]
pub struct PendingState {
    writes: BTreeMap<String, PendingWrite>,
    deletes: BTreeSet<String>,
    branches: HashMap<String, BranchState>,
}

impl PendingState {
    pub fn new() -> Self {
        Self::default()
    }

    fn branch_mut(&mut self, branch: &str) -> &mut BranchState {
        self.branches.entry(branch.to_string()).or_default()
    }

    /// Record a write. Returns false when it changes nothing: the path is not
    /// pending deletion and `hash` matches the pending write or the remote.
    ///
    /// Writing back the remote's content while a different write is pending
    /// drops that pending write and returns true, so the stale bytes are never
    /// pushed. A strict no-op rule would keep the stale write and return false;
    /// this is the one case where a remote-matching write mutates the ledger.
    pub fn record_write(&mut self, branch: &str, path: &str, content: Vec<u8>, hash: String) -> bool {
        if !self.deletes.contains(path) {
            if self.writes.get(path).is_some_and(|w| w.hash == hash) {
                return false;
            }
            if self.remote_hash(branch, path) == Some(hash.as_str()) {
                return self.writes.remove(path).is_some();
            }
        }
        self.deletes.remove(path);
        self.writes
            .insert(path.to_string(), PendingWrite { content, hash });
        true
    }

    pub fn record_delete(&mut self, path: &str) -> bool {
        self.writes.remove(path);
        self.deletes.insert(path.to_string());
        true
    }

    /// Delete of `old` plus write of `new` as one step.
    pub fn record_rename(
        &mut self,
        branch: &str,
        old: &str,
        new: &str,
        content: Vec<u8>,
        hash: String,
    ) -> bool {
        self.record_delete(old);
        self.record_write(branch, new, content, hash);
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.writes.is_empty() || !self.deletes.is_empty()
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.writes.contains_key(path) || self.deletes.contains(path)
    }

    pub fn pending_write(&self, path: &str) -> Option<&PendingWrite> {
        self.writes.get(path)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            writes: self
                .writes
                .iter()
                .map(|(path, write)| (path.clone(), write.clone()))
                .collect(),
            deletes: self.deletes.iter().cloned().collect(),
        }
    }

    /// Fold a successful commit of `snapshot` into the live state.
    ///
    /// Writes are promoted only when the committed tree holds a blob for them,
    /// and leave the pending set only if nothing newer replaced them since the
    /// snapshot was taken.
    pub fn apply_commit_result(
        &mut self,
        branch: &str,
        committed: &[TreeEntry],
        snapshot: &LedgerSnapshot,
    ) {
        let committed: HashMap<&str, Option<&str>> = committed
            .iter()
            .map(|entry| (entry.path.as_str(), entry.sha.as_deref()))
            .collect();

        for (path, write) in &snapshot.writes {
            let Some(Some(sha)) = committed.get(path.as_str()) else {
                continue;
            };
            let state = self.branch_mut(branch);
            state.shas.insert(path.clone(), sha.to_string());
            state.hashes.insert(path.clone(), write.hash.clone());
            if self.writes.get(path).is_some_and(|live| live.hash == write.hash) {
                self.writes.remove(path);
            }
        }

        for path in &snapshot.deletes {
            let state = self.branch_mut(branch);
            state.shas.remove(path);
            state.hashes.remove(path);
            self.deletes.remove(path);
        }
    }

    /// Seed known-remote state from a pull.
    pub fn set_remote_state(&mut self, branch: &str, path: &str, sha: String, hash: String) {
        let state = self.branch_mut(branch);
        state.shas.insert(path.to_string(), sha);
        state.hashes.insert(path.to_string(), hash);
    }

    pub fn remote_sha(&self, branch: &str, path: &str) -> Option<&str> {
        self.branches
            .get(branch)
            .and_then(|s| s.shas.get(path))
            .map(String::as_str)
    }

    pub fn remote_hash(&self, branch: &str, path: &str) -> Option<&str> {
        self.branches
            .get(branch)
            .and_then(|s| s.hashes.get(path))
            .map(String::as_str)
    }

    /// Absolute virtual paths of every pending write and delete.
    pub fn pending_paths(&self) -> BTreeSet<String> {
        self.writes
            .keys()
            .chain(self.deletes.iter())
            .map(|path| to_virtual_path(path))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRANCH: &str = "work";

    fn write(ledger: &mut PendingState, path: &str, content: &[u8]) -> bool {
        ledger.record_write(BRANCH, path, content.to_vec(), hash_content(content))
    }

    #[test]
    fn test_identical_write_is_noop() {
        let mut ledger = PendingState::new();
        assert!(write(&mut ledger, "articles/a.md", b"hello"));
        assert!(!write(&mut ledger, "articles/a.md", b"hello"));
        assert!(write(&mut ledger, "articles/a.md", b"hello again"));
    }

    #[test]
    fn test_write_matching_remote_is_noop() {
        let mut ledger = PendingState::new();
        ledger.set_remote_state(BRANCH, "articles/a.md", "sha1".into(), hash_content(b"v1"));

        assert!(!write(&mut ledger, "articles/a.md", b"v1"));
        assert!(!ledger.has_pending());
        // Other branches have their own known-remote state.
        assert!(ledger.record_write("main", "articles/a.md", b"v1".to_vec(), hash_content(b"v1")));
    }

    #[test]
    fn test_delete_clears_dedupe_memory() {
        let mut ledger = PendingState::new();
        assert!(write(&mut ledger, "articles/a.md", b"c1"));
        assert!(ledger.record_delete("articles/a.md"));
        assert!(write(&mut ledger, "articles/a.md", b"c1"));

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.writes.len(), 1);
        assert!(snapshot.deletes.is_empty());
    }

    #[test]
    fn test_reverting_to_remote_drops_pending_write() {
        let mut ledger = PendingState::new();
        ledger.set_remote_state(BRANCH, "articles/a.md", "sha1".into(), hash_content(b"v1"));

        assert!(write(&mut ledger, "articles/a.md", b"v2"));
        assert!(write(&mut ledger, "articles/a.md", b"v1"));
        assert!(!ledger.has_pending());
        // Nothing left to drop.
        assert!(!write(&mut ledger, "articles/a.md", b"v1"));
    }

    #[test]
    fn test_rename_is_delete_plus_write() {
        let mut ledger = PendingState::new();
        write(&mut ledger, "articles/old.md", b"draft");
        assert!(ledger.record_rename(
            BRANCH,
            "articles/old.md",
            "articles/new.md",
            b"draft".to_vec(),
            hash_content(b"draft"),
        ));

        let snapshot = ledger.snapshot();
        let written: Vec<_> = snapshot.writes.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(written, vec!["articles/new.md"]);
        assert_eq!(snapshot.deletes, vec!["articles/old.md".to_string()]);
    }

    #[test]
    fn test_commit_promotes_and_clears() {
        let mut ledger = PendingState::new();
        write(&mut ledger, "articles/a.md", b"body");
        ledger.record_delete("articles/gone.md");
        ledger.set_remote_state(BRANCH, "articles/gone.md", "old".into(), "h".into());

        let snapshot = ledger.snapshot();
        let entries = vec![
            TreeEntry::blob("articles/a.md", "blobsha"),
            TreeEntry::removal("articles/gone.md"),
        ];
        ledger.apply_commit_result(BRANCH, &entries, &snapshot);

        assert!(!ledger.has_pending());
        assert_eq!(
            ledger.remote_hash(BRANCH, "articles/a.md"),
            Some(hash_content(b"body").as_str())
        );
        assert_eq!(ledger.remote_sha(BRANCH, "articles/a.md"), Some("blobsha"));
        assert_eq!(ledger.remote_sha(BRANCH, "articles/gone.md"), None);
    }

    #[test]
    fn test_uncommitted_entries_stay_pending() {
        let mut ledger = PendingState::new();
        write(&mut ledger, "articles/a.md", b"a");
        write(&mut ledger, "articles/b.md", b"b");

        let snapshot = ledger.snapshot();
        ledger.apply_commit_result(
            BRANCH,
            &[TreeEntry::blob("articles/a.md", "sha-a")],
            &snapshot,
        );

        assert_eq!(
            ledger.pending_paths(),
            BTreeSet::from(["/articles/b.md".to_string()])
        );
    }

    #[test]
    fn test_write_during_commit_survives() {
        let mut ledger = PendingState::new();
        write(&mut ledger, "articles/a.md", b"first");
        let snapshot = ledger.snapshot();

        write(&mut ledger, "articles/a.md", b"second");
        ledger.apply_commit_result(BRANCH, &[TreeEntry::blob("articles/a.md", "sha")], &snapshot);

        let pending = ledger.pending_write("articles/a.md").unwrap();
        assert_eq!(pending.content, b"second");
        assert_eq!(
            ledger.remote_hash(BRANCH, "articles/a.md"),
            Some(hash_content(b"first").as_str())
        );
    }

    #[test]
    fn test_pending_paths_are_virtual() {
        let mut ledger = PendingState::new();
        write(&mut ledger, "books/b/01.md", b"x");
        ledger.record_delete("images/a.png");

        assert_eq!(
            ledger.pending_paths(),
            BTreeSet::from(["/books/b/01.md".to_string(), "/images/a.png".to_string()])
        );
    }
}
