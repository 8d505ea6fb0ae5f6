//! Handle push command: mirror a local directory into the store and commit
//! the resulting change set to the work branch.

use std::{collections::BTreeSet, fs, path::Path};

use anyhow::{Context, Result};

use git_docsync::{
    path::{in_tracked_roots, to_repo_path, to_virtual_path},
    store::{FileStore, NodeKind, WriteOptions},
};

use super::{collect_files, spinner, GlobalOptions, Session};

pub async fn handle(options: &GlobalOptions, dir: &Path, respect_interval: bool) -> Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    let session = Session::open(options)?;

    let bar = spinner("Pulling remote state");
    let pulled = session.engine.pull_all().await;
    bar.finish_and_clear();
    pulled?;

    let (written, deleted) = mirror(&session, dir)?;
    println!(
        "Recorded {} write(s) and {} delete(s) from {}",
        written,
        deleted,
        dir.display()
    );

    if !session.engine.has_pending() {
        println!("Nothing to commit");
        return session.close();
    }

    let bar = spinner(&format!("Committing to {}", session.repo.work_branch));
    let result = if respect_interval {
        session.engine.flush_pending().await
    } else {
        session.engine.flush_pending_unsafe().await
    };
    bar.finish_and_clear();

    match result {
        Ok(true) => println!("Committed to {}", session.repo.work_branch),
        Ok(false) => println!("Minimum interval not reached; changes stay pending"),
        Err(e) => {
            session.close()?;
            return Err(e).context("Failed to commit pending changes");
        }
    }
    session.close()
}

/// Apply the tracked roots under `dir` to the store. Store writes and deletes
/// reach the engine through its store subscription.
fn mirror(session: &Session, dir: &Path) -> Result<(usize, usize)> {
    let roots = session.config.normalized_roots();
    let mut seen = BTreeSet::new();
    let mut written = 0;

    for root in &roots {
        for file in collect_files(&dir.join(root))? {
            let relative = file
                .strip_prefix(dir)
                .with_context(|| format!("{:?} is outside {:?}", file, dir))?;
            let Some(repo_path) = relative.to_str().and_then(|p| to_repo_path(&p.replace('\\', "/")))
            else {
                tracing::warn!("skipping {:?}: not a valid repository path", relative);
                continue;
            };
            let virtual_path = to_virtual_path(&repo_path);
            let bytes = fs::read(&file).with_context(|| format!("Failed to read {:?}", file))?;

            let unchanged = session
                .store
                .read_file(&virtual_path)
                .is_ok_and(|current| current == bytes);
            if !unchanged {
                session
                    .store
                    .write_file(&virtual_path, &bytes, WriteOptions::upsert())?;
                written += 1;
            }
            seen.insert(virtual_path);
        }
    }

    let mut deleted = 0;
    for entry in session.store.snapshot() {
        if entry.kind != NodeKind::File || seen.contains(&entry.path) {
            continue;
        }
        let tracked = to_repo_path(&entry.path).is_some_and(|p| in_tracked_roots(&p, &roots));
        if tracked {
            session.store.delete(&entry.path, false)?;
            deleted += 1;
        }
    }
    Ok((written, deleted))
}
