use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bonsai_release::config::{load_config, DEFAULT_CONFIG_FILE};
use bonsai_release::ReleaseConfig;

pub(crate) fn load(explicit: Option<&Path>) -> Result<ReleaseConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => locate_config()?,
    };
    tracing::debug!(config = %path.display(), "loading release config");
    Ok(load_config(&path)?)
}

fn locate_config() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    for ancestor in cwd.ancestors() {
        let candidate = ancestor.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!(
        "unable to locate {} from '{}'; pass --config",
        DEFAULT_CONFIG_FILE,
        cwd.display()
    )
}
