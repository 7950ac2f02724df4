//! Error taxonomy for a release run.
//!
//! - [`ConfigError`]: pre-flight problems. Nothing has been built or published.
//! - [`BuildError`]: one matrix cell failed to produce its artifact.
//! - [`PublishError`]: one artifact failed to reach the release. Safe to retry.
//! - [`OrchestrationError`]: the aggregate outcome of a run with failed cells.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "repository identity mismatch: expected '{expected}', got '{}'",
        actual.as_deref().unwrap_or("<unset>")
    )]
    RepositoryMismatch {
        expected: String,
        actual: Option<String>,
    },

    #[error("version file not found: {0}")]
    MissingVersionFile(PathBuf),

    #[error("invalid version file '{path}': {reason}")]
    InvalidVersionFile { path: PathBuf, reason: String },

    #[error("unrecognized variant flags: {0}")]
    UnrecognizedVariant(String),

    #[error("invalid variant rule {axis}={value}: {reason}")]
    InvalidVariantRule {
        axis: String,
        value: String,
        reason: String,
    },

    #[error("variant combinations {first} and {second} both map to offset {offset}")]
    VariantCollision {
        first: String,
        second: String,
        offset: u32,
    },

    #[error("duplicate {axis} value '{value}' in build matrix")]
    DuplicateAxisValue { axis: &'static str, value: String },

    #[error("build matrix is empty: {0}")]
    EmptyMatrix(&'static str),

    #[error("invalid {field} '{value}': {reason}")]
    InvalidComponent {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("missing required host tools:\n{0}")]
    MissingTools(String),

    #[error("reading config '{path}'")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parsing config '{path}'")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config '{path}': {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to launch toolchain '{program}'")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("toolchain failed for {job_id} (status {status}): {output}")]
    ToolchainFailed {
        job_id: String,
        status: String,
        output: String,
    },

    #[error("no artifact matching '{pattern}' for {job_id}")]
    ArtifactNotFound { job_id: String, pattern: String },

    #[error("{count} artifacts match '{pattern}' for {job_id}: {found}")]
    AmbiguousArtifact {
        job_id: String,
        pattern: String,
        count: usize,
        found: String,
    },

    #[error("stable artifact '{file_name}' for {job_id} carries a date qualifier")]
    UnexpectedDateQualifier { job_id: String, file_name: String },

    #[error("preparing build output for {job_id}")]
    Io {
        job_id: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("release '{tag}' is locked by another publisher: {lock}")]
    Locked { tag: String, lock: PathBuf },

    #[error("upload of '{asset}' to '{tag}' failed")]
    Transport {
        tag: String,
        asset: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("creating release '{tag}' failed")]
    CreateRelease {
        tag: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid asset name '{0}'")]
    InvalidAssetName(String),
}

/// A matrix job that panicked instead of returning.
#[derive(Debug, Error)]
#[error("job {job_id} panicked: {message}")]
pub struct CellPanic {
    pub job_id: String,
    pub message: String,
}

/// Error a single matrix cell can end with.
#[derive(Debug, Error)]
pub enum CellError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Panicked(#[from] CellPanic),
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{} of {total} cells failed: {}", failed.len(), failed.join(", "))]
    CellsFailed { failed: Vec<String>, total: usize },

    #[error("run cancelled before {} cells started", not_started.len())]
    Cancelled { not_started: Vec<String> },

    #[error("preparing toolchain and release backend")]
    Setup(#[source] anyhow::Error),

    #[error("writing run manifest")]
    Manifest(#[source] anyhow::Error),
}
