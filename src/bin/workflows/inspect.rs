use std::path::Path;

use anyhow::{Context, Result};
use bonsai_release::identity::{content_qualifier_for, pin_compatible};
use bonsai_release::matrix::RuntimeVersion;
use bonsai_release::preflight::read_version_file;
use bonsai_release::run_manifest::{latest_run, prune_old_runs, runs_dir};
use bonsai_release::{expand, BuildIdentity, ReleaseConfig, VariantSet};

pub(crate) fn print_matrix(config: &ReleaseConfig) -> Result<()> {
    let cells = expand(&config.platforms, &config.runtimes)?;
    for cell in &cells {
        println!("{}", cell.job_id());
    }
    Ok(())
}

pub(crate) fn print_variants(config: &ReleaseConfig) -> Result<()> {
    let table = &config.priority_table;
    for (set, offset) in table.mapping() {
        let marker = if set == config.selected_variant { "*" } else { " " };
        println!(
            "{marker} {:>6}  {:<24} {}",
            config.base_build + offset,
            set.to_string(),
            table.tag(&set)
        );
    }
    Ok(())
}

pub(crate) fn print_identity(
    config: &ReleaseConfig,
    runtime: &str,
    flags: &[String],
    source: Option<&Path>,
) -> Result<()> {
    let runtime = RuntimeVersion::new(runtime)?;
    let variant = if flags.is_empty() {
        config.selected_variant.clone()
    } else {
        VariantSet::from_flags(flags)?
    };
    let version = read_version_file(&config.version_file)?;
    let qualifier = source
        .map(|dir| {
            content_qualifier_for(dir, &[config.output_dir.as_path(), config.store_dir.as_path()])
                .with_context(|| format!("hashing source tree '{}'", dir.display()))
        })
        .transpose()?;

    let identity = BuildIdentity::for_variant(
        &config.priority_table,
        &version,
        config.base_build,
        &variant,
        &runtime.tag(),
        qualifier.as_deref(),
    )?;
    println!("identity:     {}", identity.render());
    println!("build string: {}", identity.build_string());
    println!("build number: {}", identity.build_number());
    println!("pin:          {}", pin_compatible(&config.product, &identity)?);
    Ok(())
}

pub(crate) fn show_runs(config: &ReleaseConfig, prune: Option<usize>) -> Result<()> {
    let runs = runs_dir(&config.store_dir);
    if let Some(keep) = prune {
        let removed = prune_old_runs(&runs, keep)?;
        println!("Removed {removed} run(s)");
    }
    let Some(run) = latest_run(&runs)? else {
        println!("No release runs under {}", runs.display());
        return Ok(());
    };
    println!("Run {} ({}) -> {}", run.run_id, run.status, run.tag);
    println!("  started:  {}", run.created_at_utc);
    if let Some(finished) = &run.finished_at_utc {
        println!("  finished: {finished}");
    }
    for cell in &run.cells {
        let detail = cell
            .artifact
            .as_deref()
            .or(cell.error.as_deref())
            .unwrap_or("-");
        println!("  {:<9} {:<16} {}", cell.status, cell.job_id, detail);
    }
    Ok(())
}
