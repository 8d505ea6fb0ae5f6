//! Handle status command

use anyhow::Result;

use git_docsync::{config::SyncConfig, store::ContentCache};

use super::GlobalOptions;

pub fn handle(options: &GlobalOptions) -> Result<()> {
    let config_path = match &options.config {
        Some(path) => path.clone(),
        None => SyncConfig::config_file_path()?,
    };
    let config = SyncConfig::load_with_env(&config_path)?;

    println!("config:        {}", config_path.display());
    let repo = match config.repo_config() {
        Ok(repo) => repo,
        Err(e) => {
            println!("repository:    not configured ({})", e);
            return Ok(());
        }
    };
    println!("repository:    {}/{}", repo.owner, repo.repo);
    println!("main branch:   {}", repo.main_branch);
    println!("work branch:   {}", repo.work_branch);
    println!("tracked roots: {}", config.normalized_roots().join(", "));
    println!("api:           {}", config.api_base_url);
    println!(
        "debounce:      {}ms (minimum interval {}ms)",
        config.debounce_ms, config.min_interval_ms
    );

    let cache = ContentCache::new(&config.cache_dir, &repo);
    match cache.summary()? {
        Some(summary) => println!(
            "cache:         {} ({} files, {} directories, {} bytes, saved {})",
            cache.path().display(),
            summary.files,
            summary.directories,
            summary.bytes,
            summary.saved_at.to_rfc3339()
        ),
        None => println!("cache:         none at {}", cache.path().display()),
    }
    Ok(())
}
