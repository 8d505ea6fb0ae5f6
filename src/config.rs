use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Configuration for git-docsync
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Repository owner (user or organization)
    #[serde(default)]
    pub owner: String,
    /// Repository name
    #[serde(default)]
    pub repo: String,
    /// Published branch that deploys merge into
    #[serde(default = "defaults::main_branch")]
    pub main_branch: String,
    /// Branch that accumulates automatic commits
    #[serde(default = "defaults::work_branch")]
    pub work_branch: String,
    /// Top-level directories mirrored between the store and the repository
    #[serde(default = "defaults::tracked_roots")]
    pub tracked_roots: Vec<String>,
    /// Quiet period after the last change before committing
    #[serde(default = "defaults::debounce_ms")]
    pub debounce_ms: u64,
    /// Minimum gap between the end of one commit and the start of the next
    #[serde(default = "defaults::min_interval_ms")]
    pub min_interval_ms: u64,
    /// REST API endpoint of the hosting service
    #[serde(default = "defaults::api_base_url")]
    pub api_base_url: String,
    /// Name of the environment variable holding the bearer token
    #[serde(default = "defaults::token_env")]
    pub token_env: String,
    /// Directory holding the content snapshot cache
    #[serde(default = "defaults::cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "defaults::commit_message")]
    pub commit_message: String,
    #[serde(default = "defaults::deploy_message")]
    pub deploy_message: String,
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Immutable snapshot identifying the remote repository and its two branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    pub owner: String,
    pub repo: String,
    pub main_branch: String,
    pub work_branch: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            main_branch: defaults::main_branch(),
            work_branch: defaults::work_branch(),
            tracked_roots: defaults::tracked_roots(),
            debounce_ms: defaults::debounce_ms(),
            min_interval_ms: defaults::min_interval_ms(),
            api_base_url: defaults::api_base_url(),
            token_env: defaults::token_env(),
            cache_dir: defaults::cache_dir(),
            commit_message: defaults::commit_message(),
            deploy_message: defaults::deploy_message(),
            request_timeout_secs: defaults::request_timeout_secs(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from the default config file and environment variables.
    /// A missing file yields defaults so environment-only setups work.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        Self::load_with_env(&config_path)
    }

    /// Load configuration from `path` (if present), then apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        tracing::debug!("loading git-docsync config from {:?}", path);
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            tracing::debug!("config file {:?} not found, using defaults", path);
            Self::default()
        };

        if let Ok(owner) = env::var("DOCSYNC_OWNER") {
            config.owner = owner;
        }

        if let Ok(repo) = env::var("DOCSYNC_REPO") {
            config.repo = repo;
        }

        if let Ok(branch) = env::var("DOCSYNC_MAIN_BRANCH") {
            config.main_branch = branch;
        }

        if let Ok(branch) = env::var("DOCSYNC_WORK_BRANCH") {
            config.work_branch = branch;
        }

        if let Ok(url) = env::var("DOCSYNC_API_URL") {
            config.api_base_url = url;
        }

        if let Ok(path) = env::var("DOCSYNC_CACHE_DIR") {
            config.cache_dir = expand_tilde(&PathBuf::from(path));
        }

        if let Ok(ms) = env::var("DOCSYNC_DEBOUNCE_MS") {
            config.debounce_ms = ms
                .parse()
                .context("Failed to parse DOCSYNC_DEBOUNCE_MS as u64")?;
        }

        if let Ok(ms) = env::var("DOCSYNC_MIN_INTERVAL_MS") {
            config.min_interval_ms = ms
                .parse()
                .context("Failed to parse DOCSYNC_MIN_INTERVAL_MS as u64")?;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: SyncConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.cache_dir = expand_tilde(&config.cache_dir);

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get default config file path
    pub fn config_file_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".config/git-docsync/config.yaml"))
            .context("Could not determine home directory for config file")
    }

    /// Get cache directory, creating it if necessary
    pub fn ensure_cache_dir(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("Failed to create cache directory: {:?}", self.cache_dir))?;
        Ok(self.cache_dir.clone())
    }

    /// Resolve the repository snapshot used by one remote operation.
    ///
    /// Blank owner/repo is a hard failure; blank branches fall back to the
    /// defaults. Identical main and work branches are allowed but warned about.
    pub fn repo_config(&self) -> Result<RepoConfig, SyncError> {
        let owner = self.owner.trim();
        let repo = self.repo.trim();
        if owner.is_empty() || repo.is_empty() {
            return Err(SyncError::Config(
                "set `owner` and `repo` (or DOCSYNC_OWNER / DOCSYNC_REPO)".to_string(),
            ));
        }
        let main_branch = non_blank_or(&self.main_branch, defaults::main_branch);
        let work_branch = non_blank_or(&self.work_branch, defaults::work_branch);
        if main_branch == work_branch {
            tracing::warn!(
                "work branch and main branch are both `{}`; automatic commits land on the published branch",
                main_branch
            );
        }
        Ok(RepoConfig {
            owner: owner.to_string(),
            repo: repo.to_string(),
            main_branch,
            work_branch,
        })
    }

    /// Tracked roots with surrounding slashes and blanks removed.
    pub fn normalized_roots(&self) -> Vec<String> {
        self.tracked_roots
            .iter()
            .map(|root| root.trim().trim_matches('/').to_string())
            .filter(|root| !root.is_empty())
            .collect()
    }
}

fn non_blank_or(value: &str, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

/// Where the engine obtains a fresh `RepoConfig` at the start of each operation.
pub trait RepoConfigSource: Send + Sync {
    fn repo_config(&self) -> Result<RepoConfig, SyncError>;
}

/// Serves a fixed configuration.
pub struct StaticConfigSource(pub SyncConfig);

impl RepoConfigSource for StaticConfigSource {
    fn repo_config(&self) -> Result<RepoConfig, SyncError> {
        self.0.repo_config()
    }
}

/// Re-reads the config file (plus environment) on every call.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl RepoConfigSource for FileConfigSource {
    fn repo_config(&self) -> Result<RepoConfig, SyncError> {
        SyncConfig::load_with_env(&self.path)
            .map_err(|e| SyncError::Config(format!("{:#}", e)))?
            .repo_config()
    }
}

mod defaults {
    use std::path::PathBuf;

    pub(crate) fn main_branch() -> String {
        "main".to_string()
    }

    pub(crate) fn work_branch() -> String {
        "docsync-work".to_string()
    }

    pub(crate) fn tracked_roots() -> Vec<String> {
        vec![
            "articles".to_string(),
            "books".to_string(),
            "images".to_string(),
        ]
    }

    pub(crate) fn debounce_ms() -> u64 {
        30_000
    }

    pub(crate) fn min_interval_ms() -> u64 {
        10 * 60 * 1000
    }

    pub(crate) fn api_base_url() -> String {
        "https://api.github.com".to_string()
    }

    pub(crate) fn token_env() -> String {
        "GITHUB_TOKEN".to_string()
    }

    pub(crate) fn cache_dir() -> PathBuf {
        dirs::cache_dir()
            .map(|dir| dir.join("git-docsync"))
            .unwrap_or_else(|| PathBuf::from(".git-docsync-cache"))
    }

    pub(crate) fn commit_message() -> String {
        "docsync: sync".to_string()
    }

    pub(crate) fn deploy_message() -> String {
        "docsync: deploy work -> main".to_string()
    }

    pub(crate) fn request_timeout_secs() -> u64 {
        30
    }
}
