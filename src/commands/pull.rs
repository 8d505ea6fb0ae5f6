//! Handle pull command

use std::{fs, path::Path};

use anyhow::{Context, Result};

use git_docsync::{
    path::{in_tracked_roots, to_repo_path},
    store::{FileStore, NodeKind},
};

use super::{spinner, GlobalOptions, Session};

pub async fn handle(options: &GlobalOptions, into: Option<&Path>) -> Result<()> {
    let session = Session::open(options)?;

    let bar = spinner(&format!(
        "Pulling {}/{} ({})",
        session.repo.owner, session.repo.repo, session.repo.work_branch
    ));
    let result = session.engine.pull_all().await;
    bar.finish_and_clear();
    let report = result?;

    println!(
        "Pulled {} file(s) in {} directories; {} pending kept, {} pruned",
        report.files, report.directories, report.skipped_pending, report.pruned
    );

    if let Some(dir) = into {
        let exported = export(&session, dir)?;
        println!("Exported {} file(s) to {}", exported, dir.display());
    }

    session.close()
}

/// Write the tracked roots of the store below `dir`.
fn export(session: &Session, dir: &Path) -> Result<usize> {
    let roots = session.config.normalized_roots();
    let mut exported = 0;
    for entry in session.store.snapshot() {
        let Some(repo_path) = to_repo_path(&entry.path) else {
            continue;
        };
        if !in_tracked_roots(&repo_path, &roots) {
            continue;
        }
        let target = dir.join(&repo_path);
        match (entry.kind, entry.data) {
            (NodeKind::Directory, _) => fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory {:?}", target))?,
            (NodeKind::File, data) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create directory {:?}", parent))?;
                }
                fs::write(&target, data.unwrap_or_default())
                    .with_context(|| format!("Failed to write {:?}", target))?;
                exported += 1;
            }
        }
    }
    Ok(exported)
}
