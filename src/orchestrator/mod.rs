//! One release run, end to end.
//!
//! ```text
//! plan (gate, version, variant)
//!     │
//!     ├── ReleaseTarget resolved once (nightly date fixed here)
//!     ├── matrix expanded, source qualifier computed
//!     │
//! setup (required tools, release backend)
//!     │
//!     └── per cell, in parallel:
//!             identity → build → locate artifact → publish
//!     │
//!     run manifest written, status aggregated
//! ```
//!
//! Nothing is built or published before every preflight check passes.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use time::Date;

use crate::config::{BackendKind, ChannelName, ReleaseConfig};
use crate::driver::{ArtifactRef, BuildDriver, CommandToolchain, Toolchain};
use crate::error::{CellError, ConfigError, OrchestrationError};
use crate::identity::{content_qualifier_for, BuildIdentity};
use crate::matrix::{
    expand, run_cells, CancelFlag, CellResult, MatrixCell, MatrixReport, RunStatus,
};
use crate::preflight::{
    check_repository_identity, check_required_tools, read_version_file,
    resolve_repository_identity,
};
use crate::release::{
    Channel, GhReleaseBackend, LocalReleaseStore, PublishResult, Publisher, ReleaseBackend,
    ReleaseTarget,
};
use crate::run_manifest::{
    generate_run_id, now_utc_compact, runs_dir, write_run_manifest, CellRecord, RunManifest,
};

/// Per-invocation overrides of the loaded config.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub channel: Option<ChannelName>,
    /// Date used for nightly tags instead of today (UTC).
    pub nightly_date: Option<Date>,
    pub workers: Option<usize>,
    pub tolerate_partial: Option<bool>,
    /// Repository identity; falls back to `GITHUB_REPOSITORY`.
    pub repository: Option<String>,
}

/// Everything fixed before the first cell starts.
#[derive(Debug, Clone)]
pub struct ReleasePlan {
    pub version: String,
    pub target: ReleaseTarget,
    pub cells: Vec<MatrixCell>,
    pub content_qualifier: Option<String>,
}

/// What one successful cell produced.
#[derive(Debug, Clone)]
pub struct CellReport {
    pub identity: BuildIdentity,
    pub artifact: ArtifactRef,
    pub publish: PublishResult,
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub target: ReleaseTarget,
    pub status: RunStatus,
    pub report: MatrixReport<CellReport, CellError>,
    pub manifest_path: PathBuf,
}

pub struct Orchestrator {
    config: ReleaseConfig,
    driver: BuildDriver,
    publisher: Publisher,
}

impl Orchestrator {
    pub fn new(
        config: ReleaseConfig,
        toolchain: Arc<dyn Toolchain>,
        backend: Arc<dyn ReleaseBackend>,
    ) -> Self {
        let driver = BuildDriver::new(toolchain, config.output_dir.clone(), &config.artifact_glob);
        Self {
            config,
            driver,
            publisher: Publisher::new(backend),
        }
    }

    /// Wire the configured command toolchain and release backend.
    ///
    /// This checks tools and opens the backend; callers that must not touch
    /// either before the repository gate passes go through [`run_release`].
    pub fn from_config(config: ReleaseConfig) -> anyhow::Result<Self> {
        let tc = &config.toolchain;
        let mut tools: Vec<(&str, &str)> = vec![(tc.program.as_str(), tc.program.as_str())];
        tools.extend(tc.required_tools.iter().map(|t| (t.as_str(), t.as_str())));
        check_required_tools(&tools)?;

        let toolchain = CommandToolchain::new(tc.program.clone(), tc.args.clone())
            .with_env(tc.env.clone())
            .with_working_dir(config.source_tree.clone());
        let backend: Arc<dyn ReleaseBackend> = match config.backend {
            BackendKind::Local => Arc::new(LocalReleaseStore::open(&config.store_dir)?),
            BackendKind::Gh => Arc::new(GhReleaseBackend::new(&config.repository)?),
        };
        Ok(Self::new(config, Arc::new(toolchain), backend))
    }

    pub fn config(&self) -> &ReleaseConfig {
        &self.config
    }

    /// Run every preflight check and fix the run's target and cells.
    pub fn plan(&self, options: &RunOptions) -> Result<ReleasePlan, ConfigError> {
        plan_release(&self.config, options)
    }

    /// Identity the cell's artifact is built under.
    pub fn identity_for(
        &self,
        plan: &ReleasePlan,
        cell: &MatrixCell,
    ) -> Result<BuildIdentity, ConfigError> {
        BuildIdentity::for_variant(
            &self.config.priority_table,
            &plan.version,
            self.config.base_build,
            &self.config.selected_variant,
            &cell.runtime.tag(),
            plan.content_qualifier.as_deref(),
        )
    }

    pub fn run(
        &self,
        options: &RunOptions,
        cancel: &CancelFlag,
    ) -> Result<RunSummary, OrchestrationError> {
        let plan = self.plan(options)?;
        self.execute(plan, options, cancel)
    }

    /// Build and publish every cell of an already checked plan.
    pub fn execute(
        &self,
        plan: ReleasePlan,
        options: &RunOptions,
        cancel: &CancelFlag,
    ) -> Result<RunSummary, OrchestrationError> {
        let identities = plan
            .cells
            .iter()
            .map(|cell| self.identity_for(&plan, cell))
            .collect::<Result<Vec<_>, _>>()?;

        let run_id = generate_run_id().map_err(OrchestrationError::Manifest)?;
        let created_at_utc = now_utc_compact();
        let workers = options
            .workers
            .or(self.config.workers)
            .unwrap_or_else(default_workers);
        let tolerate_partial = options
            .tolerate_partial
            .unwrap_or(self.config.tolerate_partial_failure);
        let stable = plan.target.channel.is_stable();

        tracing::info!(
            run_id = %run_id,
            tag = %plan.target,
            cells = plan.cells.len(),
            workers,
            "release run started"
        );

        let build_and_publish = |cell: &MatrixCell| -> Result<CellReport, CellError> {
            let index = plan
                .cells
                .iter()
                .position(|c| c == cell)
                .unwrap_or_default();
            let identity = identities[index].clone();
            let artifact = self.driver.build_with_identity(
                cell,
                &self.config.source_tree,
                stable,
                Some(&identity),
            )?;
            let publish = self.publisher.publish(&plan.target, &artifact)?;
            Ok(CellReport {
                identity,
                artifact,
                publish,
            })
        };
        let report = run_cells(&plan.cells, workers, cancel, build_and_publish);

        let status = report.status(tolerate_partial);
        let manifest = RunManifest {
            run_id: run_id.clone(),
            tag: plan.target.tag.clone(),
            version: plan.version.clone(),
            status: status.as_str().to_string(),
            created_at_utc,
            finished_at_utc: Some(now_utc_compact()),
            cells: cell_records(&report),
        };
        let manifest_path = write_run_manifest(&runs_dir(&self.config.store_dir), &manifest)
            .map_err(OrchestrationError::Manifest)?;

        for (cell, err) in report.failed() {
            tracing::error!(job = %cell, error = %err, "cell failed");
        }
        tracing::info!(run_id = %run_id, status = status.as_str(), "release run finished");

        match status {
            RunStatus::Succeeded | RunStatus::PartiallyFailed => Ok(RunSummary {
                run_id,
                target: plan.target,
                status,
                report,
                manifest_path,
            }),
            RunStatus::Failed => Err(OrchestrationError::CellsFailed {
                failed: report.failed().map(|(c, _)| c.job_id()).collect(),
                total: report.outcomes.len(),
            }),
            RunStatus::Cancelled => Err(OrchestrationError::Cancelled {
                not_started: report.not_started().map(MatrixCell::job_id).collect(),
            }),
        }
    }
}

/// Plan a release from `config` alone: gate, version, variant, target, cells
/// and source qualifier. Nothing is created on disk.
pub fn plan_release(
    config: &ReleaseConfig,
    options: &RunOptions,
) -> Result<ReleasePlan, ConfigError> {
    let actual = resolve_repository_identity(options.repository.as_deref());
    let gate = check_repository_identity(&config.repository, actual.as_deref());
    tracing::info!(expected = %config.repository, actual = ?actual, ?gate, "repository gate");
    gate.require()?;

    let version = read_version_file(&config.version_file)?;
    config
        .priority_table
        .require_recognized(&config.selected_variant)?;

    let channel = match options.channel.unwrap_or(config.channel) {
        ChannelName::Stable => Channel::Stable,
        ChannelName::Nightly => match options.nightly_date {
            Some(date) => Channel::Nightly { date },
            None => Channel::nightly_today(),
        },
    };
    let target = ReleaseTarget::for_channel(&config.product, &version, channel)?;
    let cells = expand(&config.platforms, &config.runtimes)?;

    let content_qualifier = if config.hash_sources {
        Some(source_qualifier(config)?)
    } else {
        None
    };

    Ok(ReleasePlan {
        version,
        target,
        cells,
        content_qualifier,
    })
}

/// Plan, then wire the configured toolchain and backend, then run.
///
/// A run refused by the gate or missing its version file never checks tools,
/// opens the local store or talks to `gh`.
pub fn run_release(
    config: ReleaseConfig,
    options: &RunOptions,
    cancel: &CancelFlag,
) -> Result<RunSummary, OrchestrationError> {
    let plan = plan_release(&config, options)?;
    let orchestrator = Orchestrator::from_config(config).map_err(OrchestrationError::Setup)?;
    orchestrator.execute(plan, options, cancel)
}

fn source_qualifier(config: &ReleaseConfig) -> Result<String, ConfigError> {
    let source_tree = &config.source_tree;
    // Outputs of earlier runs must not move the next run's identity.
    let excluded = [config.output_dir.as_path(), config.store_dir.as_path()];
    content_qualifier_for(source_tree, &excluded)
        .with_context(|| format!("hashing source tree '{}'", source_tree.display()))
        .map_err(|e| ConfigError::Invalid {
            path: source_tree.to_path_buf(),
            reason: format!("{e:#}"),
        })
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn cell_records(report: &MatrixReport<CellReport, CellError>) -> Vec<CellRecord> {
    report
        .outcomes
        .iter()
        .map(|outcome| {
            let elapsed_ms = outcome.elapsed.as_millis() as u64;
            let job_id = outcome.cell.job_id();
            match &outcome.result {
                CellResult::Succeeded(cell) => CellRecord {
                    job_id,
                    status: "success".to_string(),
                    build_string: Some(cell.identity.build_string()),
                    artifact: Some(cell.artifact.file_name.clone()),
                    error: None,
                    elapsed_ms,
                },
                CellResult::Failed(err) => CellRecord {
                    job_id,
                    status: "failed".to_string(),
                    build_string: None,
                    artifact: None,
                    error: Some(err.to_string()),
                    elapsed_ms,
                },
                CellResult::Cancelled => CellRecord {
                    job_id,
                    status: "cancelled".to_string(),
                    build_string: None,
                    artifact: None,
                    error: None,
                    elapsed_ms,
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::error::BuildError;
    use crate::driver::ToolchainRequest;
    use std::fs;
    use tempfile::TempDir;

    struct ZipToolchain;

    impl Toolchain for ZipToolchain {
        fn invoke(&self, request: &ToolchainRequest<'_>) -> Result<(), BuildError> {
            let name = format!(
                "bonsai_{}_{}.zip",
                request.cell.platform,
                request.cell.runtime.tag()
            );
            fs::write(request.output_dir.join(name), b"zip").unwrap();
            Ok(())
        }
    }

    fn setup(tmp: &TempDir, extra: &str) -> Orchestrator {
        let config = config_in(tmp, extra);
        let store = LocalReleaseStore::open(&config.store_dir).unwrap();
        Orchestrator::new(config, Arc::new(ZipToolchain), Arc::new(store))
    }

    fn config_in(tmp: &TempDir, extra: &str) -> ReleaseConfig {
        fs::write(tmp.path().join("VERSION"), "0.9.2\n").unwrap();
        let raw = format!(
            r#"
[release]
product = "bonsai"
repository = "IfcOpenShell/IfcOpenShell"

[matrix]
platforms = ["linux", "macos"]
runtimes = ["311"]

[build]
program = "make"
artifact_glob = "bonsai_*.zip"
{extra}
"#
        );
        parse_config(&raw, &tmp.path().join("release.toml")).unwrap()
    }

    fn options() -> RunOptions {
        RunOptions {
            repository: Some("IfcOpenShell/IfcOpenShell".to_string()),
            ..RunOptions::default()
        }
    }

    #[test]
    fn gate_denies_forks_before_any_build() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = setup(&tmp, "");
        let opts = RunOptions {
            repository: Some("someone/IfcOpenShell".to_string()),
            ..RunOptions::default()
        };
        assert!(matches!(
            orchestrator.run(&opts, &CancelFlag::new()),
            Err(OrchestrationError::Config(ConfigError::RepositoryMismatch { .. }))
        ));
        assert!(!tmp.path().join("dist").exists());
    }

    #[test]
    fn refused_release_leaves_no_store_behind() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(&tmp, "required_tools = [\"no-such-packager\"]\n");
        let store_dir = config.store_dir.clone();
        let opts = RunOptions {
            repository: Some("someone/IfcOpenShell".to_string()),
            ..RunOptions::default()
        };
        assert!(matches!(
            run_release(config, &opts, &CancelFlag::new()),
            Err(OrchestrationError::Config(ConfigError::RepositoryMismatch { .. }))
        ));
        assert!(!store_dir.exists());
        assert!(!tmp.path().join("dist").exists());
    }

    #[test]
    fn missing_version_file_is_reported_before_tool_checks() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(&tmp, "required_tools = [\"no-such-packager\"]\n");
        fs::remove_file(tmp.path().join("VERSION")).unwrap();
        let store_dir = config.store_dir.clone();
        assert!(matches!(
            run_release(config, &options(), &CancelFlag::new()),
            Err(OrchestrationError::Config(_))
        ));
        assert!(!store_dir.exists());
    }

    #[test]
    fn missing_tools_fail_setup_after_planning() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(&tmp, "required_tools = [\"no-such-packager\"]\n");
        let store_dir = config.store_dir.clone();
        assert!(matches!(
            run_release(config, &options(), &CancelFlag::new()),
            Err(OrchestrationError::Setup(_))
        ));
        assert!(!store_dir.exists());
    }

    #[test]
    fn build_outputs_do_not_change_the_next_qualifier() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = setup(&tmp, "output_dir = \"out\"\n");
        let before = orchestrator.plan(&options()).unwrap().content_qualifier;
        orchestrator.run(&options(), &CancelFlag::new()).unwrap();
        assert!(tmp.path().join("out").exists());
        assert!(tmp.path().join(".releases").exists());

        let after = orchestrator.plan(&options()).unwrap().content_qualifier;
        assert!(before.is_some());
        assert_eq!(after, before);
    }

    #[test]
    fn nightly_plan_uses_fixed_date() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = setup(&tmp, "");
        let opts = RunOptions {
            channel: Some(ChannelName::Nightly),
            nightly_date: Some(Date::from_calendar_date(2024, time::Month::January, 31).unwrap()),
            ..options()
        };
        let plan = orchestrator.plan(&opts).unwrap();
        assert_eq!(plan.target.tag, "bonsai-0.9.2-alpha240131");
        assert_eq!(plan.cells.len(), 2);
        assert!(plan.content_qualifier.unwrap().starts_with('h'));
    }

    #[test]
    fn identities_follow_selected_variant() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = setup(
            &tmp,
            "[variants]\nbase_build = 1\nselected = { variant = \"novtk\" }\nhash_sources = false\n",
        );
        let plan = orchestrator.plan(&options()).unwrap();
        let identity = orchestrator.identity_for(&plan, &plan.cells[0]).unwrap();
        assert_eq!(identity.build_number(), 201);
        assert_eq!(identity.build_string(), "py311_novtk_unhashed_201");
    }

    #[test]
    fn run_writes_manifest() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = setup(&tmp, "");
        let summary = orchestrator.run(&options(), &CancelFlag::new()).unwrap();
        assert_eq!(summary.status, RunStatus::Succeeded);
        assert!(summary.manifest_path.is_file());
        let manifest: RunManifest =
            serde_json::from_slice(&fs::read(&summary.manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.tag, "bonsai-0.9.2");
        assert_eq!(manifest.cells.len(), 2);
        assert!(manifest.cells.iter().all(|c| c.status == "success"));
    }
}
