//! External toolchain invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::BuildError;
use crate::matrix::MatrixCell;

/// Lines of toolchain output kept in a failure report.
const OUTPUT_TAIL_LINES: usize = 40;

/// Parameters of one toolchain invocation.
#[derive(Debug, Clone)]
pub struct ToolchainRequest<'a> {
    pub cell: &'a MatrixCell,
    pub source_tree: &'a Path,
    /// Directory the toolchain must write its single artifact into.
    pub output_dir: &'a Path,
    /// Stable builds carry no date qualifier.
    pub stable: bool,
    pub build_string: Option<&'a str>,
}

/// Something that compiles and packages one matrix cell.
pub trait Toolchain: Send + Sync {
    fn invoke(&self, request: &ToolchainRequest<'_>) -> Result<(), BuildError>;
}

/// Runs a configured program once per cell.
///
/// Arguments may contain `{platform}`, `{runtime}`, `{runtime_tag}`,
/// `{stable}`, `{output_dir}` and `{build_string}` placeholders. The same
/// values are exported as `BONSAI_*` environment variables.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandToolchain {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Run from `dir` instead of the source tree.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn placeholders(request: &ToolchainRequest<'_>) -> Vec<(&'static str, String)> {
        vec![
            ("platform", request.cell.platform.to_string()),
            ("runtime", request.cell.runtime.to_string()),
            ("runtime_tag", request.cell.runtime.tag()),
            ("stable", if request.stable { "1" } else { "0" }.to_string()),
            ("output_dir", request.output_dir.display().to_string()),
            (
                "build_string",
                request.build_string.unwrap_or_default().to_string(),
            ),
        ]
    }

    /// Arguments with placeholders substituted for `request`.
    pub fn render_args(&self, request: &ToolchainRequest<'_>) -> Vec<String> {
        let values = Self::placeholders(request);
        self.args
            .iter()
            .map(|arg| {
                values.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
            })
            .collect()
    }
}

impl Toolchain for CommandToolchain {
    fn invoke(&self, request: &ToolchainRequest<'_>) -> Result<(), BuildError> {
        let job_id = request.cell.job_id();
        let args = self.render_args(request);
        tracing::debug!(job = %job_id, program = %self.program, ?args, "invoking toolchain");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .current_dir(self.working_dir.as_deref().unwrap_or(request.source_tree))
            .envs(&self.env);
        for (key, value) in Self::placeholders(request) {
            cmd.env(format!("BONSAI_{}", key.to_ascii_uppercase()), value);
        }

        let output = cmd.output().map_err(|source| BuildError::Launch {
            program: self.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines().chain(stderr.lines()) {
            tracing::trace!(job = %job_id, "{line}");
        }

        if !output.status.success() {
            let combined = format!("{stdout}{stderr}");
            let lines: Vec<&str> = combined.lines().collect();
            let tail = lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..].join("\n");
            return Err(BuildError::ToolchainFailed {
                job_id,
                status: output.status.to_string(),
                output: tail,
            });
        }
        Ok(())
    }
}
