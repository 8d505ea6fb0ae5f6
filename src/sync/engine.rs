use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{
    clock::Clock,
    ledger::{hash_content, PendingState},
    scheduler::{CommitFn, CommitScheduler},
};
use crate::{
    config::{RepoConfig, RepoConfigSource, SyncConfig},
    error::{Result, SyncError},
    path::{is_within, to_repo_path, to_virtual_path},
    remote::{
        resolve_file_bytes, ContentResponse, EntryKind, MergeOutcome, RemoteRepository, TreeEntry,
    },
    store::{FileStore, FsMutation, MutationObserver, NodeKind, StoreError, Subscription, WriteOptions},
};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Repo-relative directories mirrored by pulls.
    pub tracked_roots: Vec<String>,
    pub debounce: Duration,
    pub min_interval: Duration,
    pub commit_message: String,
    pub deploy_message: String,
}

impl EngineOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            tracked_roots: config.normalized_roots(),
            debounce: Duration::from_millis(config.debounce_ms),
            min_interval: Duration::from_millis(config.min_interval_ms),
            commit_message: config.commit_message.clone(),
            deploy_message: config.deploy_message.clone(),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Files written into the store.
    pub files: usize,
    pub directories: usize,
    /// Remote files left alone because a local edit is pending.
    pub skipped_pending: usize,
    /// Local entries deleted because the remote no longer has them.
    pub pruned: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Nothing,
    Committed {
        commit_sha: String,
        writes: usize,
        deletes: usize,
    },
}

struct EngineInner {
    remote: Arc<dyn RemoteRepository>,
    store: Arc<dyn FileStore>,
    config: Arc<dyn RepoConfigSource>,
    options: EngineOptions,
    ledger: Mutex<PendingState>,
    scheduler: CommitScheduler,
    /// Set while a pull writes into the store; mutation intake ignores
    /// events in that window.
    pulling: AtomicBool,
    auto_sync_paused: AtomicBool,
    pull_gate: tokio::sync::Mutex<()>,
    commit_gate: tokio::sync::Mutex<()>,
    pending_tx: watch::Sender<BTreeSet<String>>,
    /// Work branch as of the last configuration read. Intake dedupes against
    /// it so a keystroke never re-reads the configuration.
    intake_branch: Mutex<String>,
}

/// Keeps a remote branch eventually consistent with local store edits.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    subscription: Mutex<Option<Subscription>>,
}

struct MutationIntake(Weak<EngineInner>);

impl MutationObserver for MutationIntake {
    fn on_mutation(&self, event: &FsMutation) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_mutation(event);
        }
    }
}

/// Clears the pulling flag even if the pull future is dropped.
struct PullingGuard<'a>(&'a AtomicBool);

impl<'a> PullingGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for PullingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    /// Build the engine and subscribe it to `store` mutations.
    pub fn new(
        remote: Arc<dyn RemoteRepository>,
        store: Arc<dyn FileStore>,
        config: Arc<dyn RepoConfigSource>,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> Self {
        let (pending_tx, _) = watch::channel(BTreeSet::new());
        let intake_branch = match config.repo_config() {
            Ok(repo) => repo.work_branch,
            Err(e) => {
                tracing::debug!("no repository configured yet: {}", e);
                SyncConfig::default().work_branch
            }
        };
        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let engine = weak.clone();
            let commit: CommitFn = Arc::new(move || {
                let engine = engine.clone();
                async move {
                    match engine.upgrade() {
                        Some(inner) => inner
                            .commit_pending()
                            .await
                            .map(|outcome| matches!(outcome, CommitOutcome::Committed { .. })),
                        None => Ok(false),
                    }
                }
                .boxed()
            });
            EngineInner {
                scheduler: CommitScheduler::new(
                    clock,
                    options.debounce,
                    options.min_interval,
                    commit,
                ),
                remote,
                store: store.clone(),
                config,
                options,
                ledger: Mutex::new(PendingState::new()),
                pulling: AtomicBool::new(false),
                auto_sync_paused: AtomicBool::new(false),
                pull_gate: tokio::sync::Mutex::new(()),
                commit_gate: tokio::sync::Mutex::new(()),
                pending_tx,
                intake_branch: Mutex::new(intake_branch),
            }
        });
        let subscription = store.subscribe(Arc::new(MutationIntake(Arc::downgrade(&inner))));
        Self {
            inner,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    /// Mirror the tracked roots of the work branch into the store, then prune
    /// local entries the remote no longer has. Pending paths are never
    /// overwritten or pruned.
    pub async fn pull_all(&self) -> Result<PullReport> {
        self.inner.pull_all().await
    }

    /// Route a store mutation into the ledger. Normally invoked through the
    /// store subscription.
    pub fn handle_mutation(&self, event: &FsMutation) {
        self.inner.handle_mutation(event);
    }

    /// Commit the pending change set to the work branch as one commit.
    pub async fn commit_pending(&self) -> Result<CommitOutcome> {
        self.inner.commit_pending().await
    }

    /// Commit pending changes now, unless the minimum interval since the last
    /// commit has not elapsed (a timer is armed for the remainder then).
    /// Returns whether a commit ran.
    pub async fn flush_pending(&self) -> Result<bool> {
        if !self.has_pending() {
            return Ok(false);
        }
        self.inner.scheduler.mark_pending();
        self.inner.scheduler.flush().await
    }

    /// Commit pending changes now, ignoring the minimum interval.
    pub async fn flush_pending_unsafe(&self) -> Result<bool> {
        if !self.has_pending() {
            return Ok(false);
        }
        self.inner.scheduler.flush_unsafe().await
    }

    /// Merge the work branch into the main branch on the remote.
    pub async fn deploy_work_to_main(&self) -> Result<MergeOutcome> {
        self.inner.deploy_work_to_main().await
    }

    /// Delete entries under the tracked roots that are neither in `remote_paths`
    /// nor pending. Returns how many entries were removed.
    pub async fn prune_local_entries(&self, remote_paths: &HashSet<String>) -> Result<usize> {
        let _gate = self.inner.pull_gate.lock().await;
        let _pulling = PullingGuard::set(&self.inner.pulling);
        self.inner.prune_local_entries(remote_paths)
    }

    /// Returns the new paused state.
    pub fn toggle_auto_sync(&self) -> bool {
        let paused = !self.is_auto_sync_paused();
        self.set_auto_sync_paused(paused);
        paused
    }

    pub fn set_auto_sync_paused(&self, paused: bool) {
        self.inner.auto_sync_paused.store(paused, Ordering::SeqCst);
        tracing::info!("auto-sync {}", if paused { "paused" } else { "resumed" });
        if !paused && self.has_pending() {
            self.inner.scheduler.mark_dirty();
        }
    }

    pub fn is_auto_sync_paused(&self) -> bool {
        self.inner.auto_sync_paused.load(Ordering::SeqCst)
    }

    pub fn has_pending(&self) -> bool {
        self.inner.ledger.lock().has_pending()
    }

    /// Absolute virtual paths with uncommitted changes.
    pub fn pending_paths(&self) -> BTreeSet<String> {
        self.inner.ledger.lock().pending_paths()
    }

    /// Receives the pending path set whenever it changes.
    pub fn subscribe_pending(&self) -> watch::Receiver<BTreeSet<String>> {
        self.inner.pending_tx.subscribe()
    }

    /// Content hash last seen on the remote for a repo-relative path.
    pub fn known_remote_hash(&self, branch: &str, path: &str) -> Option<String> {
        self.inner
            .ledger
            .lock()
            .remote_hash(branch, path)
            .map(str::to_string)
    }

    pub fn is_pulling(&self) -> bool {
        self.inner.pulling.load(Ordering::SeqCst)
    }

    /// Stop observing the store and disarm the commit timer. Pending changes
    /// are kept and can still be flushed.
    pub fn shutdown(&self) {
        self.inner.scheduler.cancel();
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.inner.scheduler.cancel();
    }
}

impl EngineInner {
    fn publish_pending(&self) {
        let paths = self.ledger.lock().pending_paths();
        self.pending_tx.send_if_modified(|current| {
            if *current == paths {
                return false;
            }
            *current = paths;
            true
        });
    }

    /// Read the configuration for a remote operation and remember its work
    /// branch for mutation intake.
    fn repo_config(&self) -> Result<RepoConfig> {
        let repo = self.config.repo_config()?;
        let mut branch = self.intake_branch.lock();
        if *branch != repo.work_branch {
            tracing::debug!("intake now dedupes against {}", repo.work_branch);
            *branch = repo.work_branch.clone();
        }
        Ok(repo)
    }

    fn handle_mutation(&self, event: &FsMutation) {
        if self.pulling.load(Ordering::SeqCst) {
            tracing::trace!("ignoring mutation during pull: {:?}", event_path(event));
            return;
        }
        let branch = self.intake_branch.lock().clone();
        let changed = {
            let mut ledger = self.ledger.lock();
            match event {
                FsMutation::Write { path, content } => match to_repo_path(path) {
                    Some(path) => {
                        ledger.record_write(&branch, &path, content.clone(), hash_content(content))
                    }
                    None => false,
                },
                FsMutation::Delete { path } => match to_repo_path(path) {
                    Some(path) => ledger.record_delete(&path),
                    None => false,
                },
                FsMutation::Rename { old, new, content } => {
                    match (to_repo_path(old), to_repo_path(new)) {
                        (Some(old), Some(new)) => ledger.record_rename(
                            &branch,
                            &old,
                            &new,
                            content.clone(),
                            hash_content(content),
                        ),
                        _ => false,
                    }
                }
            }
        };
        if !changed {
            return;
        }
        tracing::debug!("recorded {}", event_path(event));
        self.publish_pending();
        if !self.auto_sync_paused.load(Ordering::SeqCst) {
            self.scheduler.mark_dirty();
        }
    }

    async fn ensure_work_branch(&self, repo: &RepoConfig) -> Result<()> {
        match self.remote.get_ref(repo, &repo.work_branch).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let head = self.remote.get_ref(repo, &repo.main_branch).await?;
        tracing::info!(
            "creating branch {} from {} at {}",
            repo.work_branch,
            repo.main_branch,
            head
        );
        match self.remote.create_ref(repo, &repo.work_branch, &head).await {
            // Someone else created it in the meantime.
            Err(SyncError::Conflict(_)) => Ok(()),
            other => other,
        }
    }

    fn ensure_directories(&self) {
        let roots = self.options.tracked_roots.iter().map(|r| to_virtual_path(r));
        for dir in std::iter::once("/".to_string()).chain(roots) {
            if let Err(e) = self.store.create_directory(&dir) {
                tracing::debug!("could not create {}: {}", dir, e);
            }
        }
    }

    async fn pull_all(&self) -> Result<PullReport> {
        let repo = self.repo_config()?;
        let _gate = self.pull_gate.lock().await;
        let result = {
            let _pulling = PullingGuard::set(&self.pulling);
            self.pull_tracked_roots(&repo).await
        };
        self.publish_pending();
        let report = result?;
        tracing::info!(
            "pulled {} files and {} directories from {} ({} pending kept, {} pruned)",
            report.files,
            report.directories,
            repo.work_branch,
            report.skipped_pending,
            report.pruned
        );
        Ok(report)
    }

    async fn pull_tracked_roots(&self, repo: &RepoConfig) -> Result<PullReport> {
        self.ensure_work_branch(repo).await?;
        self.ensure_directories();

        let mut report = PullReport::default();
        let mut visited = HashSet::new();
        for root in &self.options.tracked_roots {
            visited.insert(to_virtual_path(root));
            self.pull_directory(repo, root, &mut visited, &mut report)
                .await?;
        }
        report.pruned = self.prune_local_entries(&visited)?;
        Ok(report)
    }

    async fn pull_directory(
        &self,
        repo: &RepoConfig,
        root: &str,
        visited: &mut HashSet<String>,
        report: &mut PullReport,
    ) -> Result<()> {
        let mut queue = VecDeque::from([root.to_string()]);
        while let Some(dir) = queue.pop_front() {
            let entries = match self.remote.get_content(repo, &dir, &repo.work_branch).await {
                Ok(ContentResponse::Directory(entries)) => entries,
                Ok(ContentResponse::File(_)) => {
                    tracing::warn!("tracked root {} is a file, skipping", dir);
                    continue;
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!("{} not found on {}", dir, repo.work_branch);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for entry in entries {
                match entry.kind {
                    EntryKind::File => self.pull_file(repo, &entry.path, visited, report).await?,
                    EntryKind::Dir => {
                        visited.insert(to_virtual_path(&entry.path));
                        report.directories += 1;
                        queue.push_back(entry.path);
                    }
                    EntryKind::Other => tracing::debug!("skipping {}", entry.path),
                }
            }
        }
        Ok(())
    }

    async fn pull_file(
        &self,
        repo: &RepoConfig,
        path: &str,
        visited: &mut HashSet<String>,
        report: &mut PullReport,
    ) -> Result<()> {
        let virtual_path = to_virtual_path(path);
        visited.insert(virtual_path.clone());

        let file = match self.remote.get_content(repo, path, &repo.work_branch).await {
            Ok(ContentResponse::File(file)) => file,
            Ok(ContentResponse::Directory(_)) => {
                tracing::warn!("{} turned into a directory during pull", path);
                return Ok(());
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let Some(bytes) = resolve_file_bytes(self.remote.as_ref(), repo, &file).await? else {
            tracing::debug!("{} has no content", path);
            return Ok(());
        };

        let pending = {
            let mut ledger = self.ledger.lock();
            ledger.set_remote_state(&repo.work_branch, path, file.sha, hash_content(&bytes));
            ledger.is_pending(path)
        };
        if pending {
            tracing::debug!("keeping local pending copy of {}", path);
            report.skipped_pending += 1;
            return Ok(());
        }
        self.store
            .write_file(&virtual_path, &bytes, WriteOptions::upsert())?;
        report.files += 1;
        Ok(())
    }

    /// Every entry below the tracked roots, roots themselves excluded.
    fn local_entries(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let mut queue: VecDeque<String> = self
            .options
            .tracked_roots
            .iter()
            .map(|r| to_virtual_path(r))
            .collect();
        while let Some(dir) = queue.pop_front() {
            let children = match self.store.read_directory(&dir) {
                Ok(children) => children,
                Err(StoreError::FileNotFound(_)) | Err(StoreError::NotADirectory(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            for child in children {
                let path = format!("{}/{}", dir, child.name);
                if child.kind == NodeKind::Directory {
                    queue.push_back(path.clone());
                }
                found.push(path);
            }
        }
        Ok(found)
    }

    /// Caller holds the pulling flag.
    fn prune_local_entries(&self, remote_paths: &HashSet<String>) -> Result<usize> {
        let mut protected = HashSet::new();
        for path in self.ledger.lock().pending_paths() {
            let mut current = Some(path.as_str());
            while let Some(p) = current {
                if p == "/" || !protected.insert(p.to_string()) {
                    break;
                }
                current = crate::path::parent(p);
            }
        }

        let doomed: BTreeSet<String> = self
            .local_entries()?
            .into_iter()
            .filter(|p| !remote_paths.contains(p) && !protected.contains(p))
            .collect();

        let mut removed: Vec<&String> = Vec::new();
        for path in &doomed {
            // Parents sort before their children; a removed parent took them along.
            if removed.iter().any(|r| is_within(path, r)) {
                continue;
            }
            match self.store.delete(path, true) {
                Ok(()) | Err(StoreError::FileNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            tracing::debug!("pruned {}", path);
            removed.push(path);
        }
        Ok(removed.len())
    }

    async fn commit_pending(&self) -> Result<CommitOutcome> {
        let _gate = self.commit_gate.lock().await;
        match self.commit_snapshot().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!("failed to commit pending changes: {}", e);
                if e.is_retryable() {
                    self.scheduler.mark_dirty();
                }
                Err(e)
            }
        }
    }

    async fn commit_snapshot(&self) -> Result<CommitOutcome> {
        let snapshot = self.ledger.lock().snapshot();
        if snapshot.is_empty() {
            return Ok(CommitOutcome::Nothing);
        }
        let repo = self.repo_config()?;
        self.ensure_work_branch(&repo).await?;

        let head = self.remote.get_ref(&repo, &repo.work_branch).await?;
        let base = self.remote.get_commit(&repo, &head).await?;

        let mut entries = Vec::with_capacity(snapshot.writes.len() + snapshot.deletes.len());
        for (path, write) in &snapshot.writes {
            let sha = self
                .remote
                .create_blob(&repo, &STANDARD.encode(&write.content))
                .await?;
            entries.push(TreeEntry::blob(path.clone(), sha));
        }
        for path in &snapshot.deletes {
            entries.push(TreeEntry::removal(path.clone()));
        }

        let tree = self
            .remote
            .create_tree(&repo, &base.tree_sha, &entries)
            .await?;
        let commit_sha = self
            .remote
            .create_commit(&repo, &self.options.commit_message, &tree, &[head])
            .await?;
        self.remote
            .update_ref(&repo, &repo.work_branch, &commit_sha)
            .await?;

        self.ledger
            .lock()
            .apply_commit_result(&repo.work_branch, &entries, &snapshot);
        self.publish_pending();

        tracing::info!(
            "committed {} writes and {} deletes to {} as {}",
            snapshot.writes.len(),
            snapshot.deletes.len(),
            repo.work_branch,
            commit_sha
        );
        Ok(CommitOutcome::Committed {
            commit_sha,
            writes: snapshot.writes.len(),
            deletes: snapshot.deletes.len(),
        })
    }

    async fn deploy_work_to_main(&self) -> Result<MergeOutcome> {
        let repo = self.repo_config()?;
        let outcome = async {
            self.ensure_work_branch(&repo).await?;
            self.remote
                .merge(
                    &repo,
                    &repo.main_branch,
                    &repo.work_branch,
                    &self.options.deploy_message,
                )
                .await
        }
        .await
        .map_err(|e| match e {
            SyncError::NotFound(_) => SyncError::Config(format!(
                "branch {} or {} does not exist",
                repo.main_branch, repo.work_branch
            )),
            SyncError::Conflict(_) => SyncError::MergeConflict {
                base: repo.main_branch.clone(),
                head: repo.work_branch.clone(),
            },
            other => other,
        })?;
        match &outcome {
            MergeOutcome::Merged { sha } => {
                tracing::info!("deployed {} into {} as {}", repo.work_branch, repo.main_branch, sha)
            }
            MergeOutcome::UpToDate => tracing::info!("{} is already up to date", repo.main_branch),
        }
        Ok(outcome)
    }
}

fn event_path(event: &FsMutation) -> &str {
    match event {
        FsMutation::Write { path, .. } | FsMutation::Delete { path } => path,
        FsMutation::Rename { new, .. } => new,
    }
}
