//! Per-cell build driver.
//!
//! For one [`MatrixCell`] the driver prepares an empty output directory,
//! invokes the [`Toolchain`], and then requires exactly one file matching the
//! artifact glob (for Bonsai, `bonsai_*.zip`). Zero or several matches mean
//! the toolchain or its configuration is wrong, so neither is retried.

pub mod toolchain;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::error::BuildError;
use crate::fsutil::sha256_file;
use crate::identity::BuildIdentity;
use crate::matrix::MatrixCell;

pub use toolchain::{CommandToolchain, Toolchain, ToolchainRequest};

/// A located build output, handed from the driver to the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub cell: MatrixCell,
    pub path: PathBuf,
    /// Asset name on the release; the built file name, unmodified.
    pub file_name: String,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Clone)]
pub struct BuildDriver {
    toolchain: Arc<dyn Toolchain>,
    output_root: PathBuf,
    artifact_glob: String,
}

impl BuildDriver {
    /// `artifact_glob` is matched inside each cell's own output directory,
    /// e.g. `bonsai_*.zip`.
    pub fn new(toolchain: Arc<dyn Toolchain>, output_root: PathBuf, artifact_glob: &str) -> Self {
        Self {
            toolchain,
            output_root,
            artifact_glob: artifact_glob.to_string(),
        }
    }

    /// Output directory owned by `cell`.
    pub fn output_dir_for(&self, cell: &MatrixCell) -> PathBuf {
        self.output_root.join(cell.job_id())
    }

    pub fn build(
        &self,
        cell: &MatrixCell,
        source_tree: &Path,
        stable: bool,
    ) -> Result<ArtifactRef, BuildError> {
        self.build_with_identity(cell, source_tree, stable, None)
    }

    /// Build `cell`, passing the rendered build string of `identity` to the
    /// toolchain.
    pub fn build_with_identity(
        &self,
        cell: &MatrixCell,
        source_tree: &Path,
        stable: bool,
        identity: Option<&BuildIdentity>,
    ) -> Result<ArtifactRef, BuildError> {
        let job_id = cell.job_id();
        let output_dir = self.output_dir_for(cell);
        reset_dir(&output_dir).map_err(|source| BuildError::Io {
            job_id: job_id.clone(),
            source,
        })?;

        let build_string = identity.map(BuildIdentity::build_string);
        self.toolchain.invoke(&ToolchainRequest {
            cell,
            source_tree,
            output_dir: &output_dir,
            stable,
            build_string: build_string.as_deref(),
        })?;

        let path = locate_artifact(&output_dir, &self.artifact_glob, &job_id)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| BuildError::Io {
                job_id: job_id.clone(),
                source: anyhow::anyhow!("artifact path has no UTF-8 file name: {}", path.display()),
            })?;

        if stable && has_date_qualifier(&file_name) {
            return Err(BuildError::UnexpectedDateQualifier { job_id, file_name });
        }

        let (sha256, size_bytes) = sha256_file(&path).map_err(|source| BuildError::Io {
            job_id: job_id.clone(),
            source,
        })?;
        tracing::info!(job = %job_id, artifact = %file_name, size_bytes, "artifact located");

        Ok(ArtifactRef {
            cell: cell.clone(),
            path,
            file_name,
            sha256,
            size_bytes,
        })
    }
}

fn reset_dir(dir: &Path) -> anyhow::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("clearing output directory '{}'", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("creating output directory '{}'", dir.display()))
}

/// The single regular file in `dir` matching `pattern`.
pub fn locate_artifact(dir: &Path, pattern: &str, job_id: &str) -> Result<PathBuf, BuildError> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.display().to_string()),
        pattern
    );
    let entries = glob::glob(&full).map_err(|e| BuildError::Io {
        job_id: job_id.to_string(),
        source: anyhow::anyhow!("invalid artifact glob '{pattern}': {e}"),
    })?;

    let mut matches: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    matches.sort();

    match matches.len() {
        0 => Err(BuildError::ArtifactNotFound {
            job_id: job_id.to_string(),
            pattern: pattern.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        count => Err(BuildError::AmbiguousArtifact {
            job_id: job_id.to_string(),
            pattern: pattern.to_string(),
            count,
            found: matches
                .iter()
                .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

/// True when `name` carries a nightly date: `alpha` followed by six digits
/// (`alpha240131`) or an eight digit `20YYMMDD` run.
pub fn has_date_qualifier(name: &str) -> bool {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let run = &name[start..i];
        if run.len() == 8 && run.starts_with("20") {
            return true;
        }
        if run.len() == 6 && name[..start].ends_with("alpha") {
            return true;
        }
    }
    false
}
