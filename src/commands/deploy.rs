//! Handle deploy command

use anyhow::Result;

use git_docsync::remote::MergeOutcome;

use super::{spinner, GlobalOptions, Session};

pub async fn handle(options: &GlobalOptions) -> Result<()> {
    let session = Session::open(options)?;

    let bar = spinner(&format!(
        "Merging {} into {}",
        session.repo.work_branch, session.repo.main_branch
    ));
    let result = session.engine.deploy_work_to_main().await;
    bar.finish_and_clear();

    match result? {
        MergeOutcome::Merged { sha } => println!(
            "Deployed {} into {} ({})",
            session.repo.work_branch, session.repo.main_branch, sha
        ),
        MergeOutcome::UpToDate => println!("{} is already up to date", session.repo.main_branch),
    }
    session.engine.shutdown();
    Ok(())
}
