use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{NodeKind, StoreEntry};
use crate::config::RepoConfig;

/// Bumped whenever the on-disk layout changes; older files are ignored.
const CACHE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheFile {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<CachedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CachedEntry {
    path: String,
    kind: NodeKind,
    ctime: DateTime<Utc>,
    mtime: DateTime<Utc>,
    /// Base64 file bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSummary {
    pub saved_at: DateTime<Utc>,
    pub files: usize,
    pub directories: usize,
    pub bytes: usize,
}

/// Snapshot of the file store persisted between runs, one file per repository.
pub struct ContentCache {
    path: PathBuf,
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl ContentCache {
    pub fn new(cache_dir: &Path, repo: &RepoConfig) -> Self {
        let name = sanitize(&format!("{}_{}", repo.owner, repo.repo));
        Self {
            path: cache_dir.join(format!("{}.json", name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<CacheFile>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read content cache from {:?}", self.path))?;
        let file: CacheFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse content cache from {:?}", self.path))?;
        if file.version != CACHE_VERSION {
            tracing::info!(
                "ignoring content cache version {} (expected {})",
                file.version,
                CACHE_VERSION
            );
            return Ok(None);
        }
        Ok(Some(file))
    }

    /// Cached store entries, or `None` when there is no usable cache.
    /// A corrupt cache is logged and treated as absent.
    pub fn load(&self) -> Option<Vec<StoreEntry>> {
        let file = match self.read() {
            Ok(file) => file?,
            Err(e) => {
                tracing::warn!("{:#}", e);
                return None;
            }
        };

        let mut entries = Vec::with_capacity(file.entries.len());
        for entry in file.entries {
            let data = match (&entry.kind, entry.data) {
                (NodeKind::File, Some(encoded)) => match STANDARD.decode(encoded) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        tracing::warn!("dropping cached {}: {}", entry.path, e);
                        continue;
                    }
                },
                (NodeKind::File, None) => Some(Vec::new()),
                (NodeKind::Directory, _) => None,
            };
            entries.push(StoreEntry {
                path: entry.path,
                kind: entry.kind,
                ctime: entry.ctime,
                mtime: entry.mtime,
                data,
            });
        }
        tracing::debug!("loaded {} cached entries from {:?}", entries.len(), self.path);
        Some(entries)
    }

    /// Write atomically via a sibling temp file.
    pub fn save(&self, entries: &[StoreEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let file = CacheFile {
            version: CACHE_VERSION,
            saved_at: Utc::now(),
            entries: entries
                .iter()
                .map(|entry| CachedEntry {
                    path: entry.path.clone(),
                    kind: entry.kind,
                    ctime: entry.ctime,
                    mtime: entry.mtime,
                    data: entry.data.as_ref().map(|d| STANDARD.encode(d)),
                })
                .collect(),
        };
        let content = serde_json::to_string(&file).context("Failed to serialize content cache")?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move {:?} into place", tmp))?;
        Ok(())
    }

    pub fn summary(&self) -> Result<Option<CacheSummary>> {
        let Some(file) = self.read()? else {
            return Ok(None);
        };
        let mut summary = CacheSummary {
            saved_at: file.saved_at,
            files: 0,
            directories: 0,
            bytes: 0,
        };
        for entry in &file.entries {
            match entry.kind {
                NodeKind::File => {
                    summary.files += 1;
                    summary.bytes += entry
                        .data
                        .as_deref()
                        .and_then(|d| STANDARD.decode(d).ok())
                        .map_or(0, |b| b.len());
                }
                NodeKind::Directory => summary.directories += 1,
            }
        }
        Ok(Some(summary))
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove {:?}", self.path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStore, MemoryFileStore, WriteOptions};
    use tempfile::TempDir;

    fn repo() -> RepoConfig {
        RepoConfig {
            owner: "some owner".to_string(),
            repo: "docs/site".to_string(),
            main_branch: "main".to_string(),
            work_branch: "work".to_string(),
        }
    }

    #[test]
    fn test_file_name_is_sanitized() {
        let cache = ContentCache::new(Path::new("/tmp/c"), &repo());
        assert_eq!(cache.path(), Path::new("/tmp/c/some_owner_docs_site.json"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::new(temp_dir.path(), &repo());

        let store = MemoryFileStore::new();
        store
            .write_file("/images/a.png", &[0, 159, 146, 150], WriteOptions::upsert())
            .unwrap();
        store.create_directory("/books").unwrap();
        cache.save(&store.snapshot()).unwrap();

        let restored = MemoryFileStore::new();
        restored.hydrate(cache.load().unwrap());
        assert_eq!(
            restored.read_file("/images/a.png").unwrap(),
            vec![0, 159, 146, 150]
        );
        assert!(restored.exists("/books"));

        let summary = cache.summary().unwrap().unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.bytes, 4);
        // "/", "/books", "/images"
        assert_eq!(summary.directories, 3);
    }

    #[test]
    fn test_missing_cache_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::new(temp_dir.path(), &repo());
        assert!(cache.load().is_none());
        assert!(cache.summary().unwrap().is_none());
    }

    #[test]
    fn test_version_mismatch_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::new(temp_dir.path(), &repo());
        fs::write(
            cache.path(),
            r#"{"version":0,"saved_at":"2024-01-01T00:00:00Z","entries":[]}"#,
        )
        .unwrap();
        assert!(cache.load().is_none());
    }

    #[test]
    fn test_corrupt_cache_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::new(temp_dir.path(), &repo());
        fs::write(cache.path(), "not json").unwrap();
        assert!(cache.load().is_none());

        cache.clear().unwrap();
        assert!(!cache.path().exists());
    }
}
