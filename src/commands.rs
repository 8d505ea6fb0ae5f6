//! CLI command handlers. Each command opens a `Session`: configuration,
//! remote client, hydrated file store and a sync engine wired together.

pub mod deploy;
pub mod pull;
pub mod push;
pub mod status;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::runtime::Handle;

use git_docsync::{
    config::{FileConfigSource, RepoConfig, RepoConfigSource, StaticConfigSource, SyncConfig},
    remote::{GithubClient, MemoryRemote, RemoteRepository},
    store::{ContentCache, FileStore, MemoryFileStore},
    sync::{EngineOptions, SyncEngine, TokioClock},
};

/// Options shared by every command.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub offline: bool,
}

pub struct Session {
    pub config: SyncConfig,
    pub repo: RepoConfig,
    pub store: Arc<MemoryFileStore>,
    pub cache: ContentCache,
    pub engine: SyncEngine,
}

impl Session {
    pub fn open(options: &GlobalOptions) -> Result<Self> {
        let config_path = match &options.config {
            Some(path) => path.clone(),
            None => SyncConfig::config_file_path()?,
        };
        let mut config = SyncConfig::load_with_env(&config_path)?;

        let (remote, source): (Arc<dyn RemoteRepository>, Arc<dyn RepoConfigSource>) =
            if options.offline {
                if config.owner.trim().is_empty() {
                    config.owner = "offline".to_string();
                }
                if config.repo.trim().is_empty() {
                    config.repo = "docs".to_string();
                }
                let repo = config.repo_config()?;
                let remote = MemoryRemote::new();
                remote.seed_branch(&repo.main_branch, &[]);
                eprintln!("git-docsync: offline mode, using an empty in-memory repository");
                (
                    Arc::new(remote),
                    Arc::new(StaticConfigSource(config.clone())),
                )
            } else {
                (
                    Arc::new(GithubClient::from_config(&config)?),
                    Arc::new(FileConfigSource::new(config_path)),
                )
            };
        let repo = source.repo_config()?;

        let cache_dir = config.ensure_cache_dir()?;
        let cache = ContentCache::new(&cache_dir, &repo);
        let store = Arc::new(MemoryFileStore::new());
        if let Some(entries) = cache.load() {
            tracing::debug!("hydrating store with {} cached entries", entries.len());
            store.hydrate(entries);
        }

        let engine = SyncEngine::new(
            remote,
            store.clone(),
            source,
            Arc::new(TokioClock::new(Handle::current())),
            EngineOptions::from_config(&config),
        );

        Ok(Self {
            config,
            repo,
            store,
            cache,
            engine,
        })
    }

    pub fn save_cache(&self) -> Result<()> {
        self.cache
            .save(&self.store.snapshot())
            .with_context(|| format!("Failed to save content cache {:?}", self.cache.path()))
    }

    pub fn close(self) -> Result<()> {
        self.engine.shutdown();
        if self.engine.has_pending() {
            eprintln!(
                "git-docsync: {} path(s) still pending, they will be retried on the next push",
                self.engine.pending_paths().len()
            );
        }
        self.save_cache()
    }
}

pub fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Every regular file below `dir`, recursively. A missing `dir` yields nothing.
pub fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in
            fs::read_dir(&current).with_context(|| format!("Failed to read {:?}", current))?
        {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
