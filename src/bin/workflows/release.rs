use anyhow::Result;
use bonsai_release::config::ChannelName;
use bonsai_release::matrix::CellResult;
use bonsai_release::{CancelFlag, ReleaseConfig, RunOptions};

pub(crate) struct ReleaseArgs {
    pub(crate) repository: Option<String>,
    pub(crate) nightly: bool,
    pub(crate) stable: bool,
    pub(crate) workers: Option<usize>,
    pub(crate) tolerate_partial: bool,
}

pub(crate) fn release(config: ReleaseConfig, args: ReleaseArgs) -> Result<()> {
    let channel = match (args.nightly, args.stable) {
        (true, _) => Some(ChannelName::Nightly),
        (_, true) => Some(ChannelName::Stable),
        _ => None,
    };
    let options = RunOptions {
        channel,
        nightly_date: None,
        workers: args.workers,
        tolerate_partial: args.tolerate_partial.then_some(true),
        repository: args.repository,
    };

    let summary = bonsai_release::run_release(config, &options, &CancelFlag::new())?;

    println!("Release {} ({})", summary.target, summary.status.as_str());
    for outcome in &summary.report.outcomes {
        match &outcome.result {
            CellResult::Succeeded(cell) => println!(
                "  [ok]   {:<16} {} ({})",
                outcome.cell.job_id(),
                cell.artifact.file_name,
                cell.identity.build_string()
            ),
            CellResult::Failed(err) => {
                println!("  [fail] {:<16} {}", outcome.cell.job_id(), err)
            }
            CellResult::Cancelled => {
                println!("  [skip] {:<16} not started", outcome.cell.job_id())
            }
        }
    }
    println!("Run manifest: {}", summary.manifest_path.display());
    Ok(())
}
