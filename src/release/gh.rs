//! GitHub releases through the `gh` CLI.
//!
//! Authentication is whatever `gh` is configured with (`GH_TOKEN`,
//! `gh auth login`); this backend never handles credentials.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use super::{AssetRecord, ReleaseBackend, ReleaseState, ReleaseTarget};
use crate::driver::ArtifactRef;
use crate::error::PublishError;

#[derive(Debug, Clone)]
pub struct GhReleaseBackend {
    gh: PathBuf,
    repository: String,
}

#[derive(Debug, Deserialize)]
struct GhReleaseView {
    #[serde(default)]
    assets: Vec<GhAsset>,
}

#[derive(Debug, Deserialize)]
struct GhAsset {
    name: String,
    #[serde(default)]
    size: u64,
}

impl GhReleaseBackend {
    /// Locate `gh` on PATH and target `repository` (`owner/name`).
    pub fn new(repository: &str) -> Result<Self> {
        let gh = which::which("gh").context("`gh` CLI not found on PATH")?;
        Ok(Self::with_binary(gh, repository))
    }

    pub fn with_binary(gh: PathBuf, repository: &str) -> Self {
        Self {
            gh,
            repository: repository.to_string(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        tracing::debug!(?args, repo = %self.repository, "running gh");
        Command::new(&self.gh)
            .args(args)
            .arg("--repo")
            .arg(&self.repository)
            .output()
            .with_context(|| format!("executing {}", self.gh.display()))
    }

    fn view(&self, tag: &str) -> Result<Option<GhReleaseView>> {
        let output = self.run(&["release", "view", tag, "--json", "assets"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("release not found") || stderr.contains("Not Found") {
                return Ok(None);
            }
            bail!("gh release view {tag} failed: {}", stderr.trim());
        }
        parse_release_view(&output.stdout).map(Some)
    }

    /// Arguments that create `target` as a release.
    pub fn create_args(target: &ReleaseTarget) -> Vec<String> {
        let mut args = vec![
            "release".to_string(),
            "create".to_string(),
            target.tag.clone(),
            "--title".to_string(),
            target.display_name.clone(),
            "--notes".to_string(),
            String::new(),
        ];
        if !target.channel.is_stable() {
            args.push("--prerelease".to_string());
        }
        args
    }
}

fn parse_release_view(stdout: &[u8]) -> Result<GhReleaseView> {
    serde_json::from_slice(stdout).context("parsing `gh release view` output")
}

fn failure(output: &Output) -> anyhow::Error {
    anyhow!(
        "status {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    )
}

impl ReleaseBackend for GhReleaseBackend {
    fn ensure_release(&self, target: &ReleaseTarget) -> Result<ReleaseState, PublishError> {
        let create = || -> Result<ReleaseState> {
            if self.view(&target.tag)?.is_some() {
                return Ok(ReleaseState::Updated);
            }
            let args = Self::create_args(target);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let output = self.run(&args)?;
            if output.status.success() {
                return Ok(ReleaseState::Created);
            }
            // Another cell may have created it in the meantime.
            if self.view(&target.tag)?.is_some() {
                return Ok(ReleaseState::Updated);
            }
            Err(failure(&output))
        };
        create().map_err(|source| PublishError::CreateRelease {
            tag: target.tag.clone(),
            source,
        })
    }

    fn put_asset(
        &self,
        target: &ReleaseTarget,
        artifact: &ArtifactRef,
    ) -> Result<bool, PublishError> {
        let upload = || -> Result<bool> {
            let replaced = self
                .view(&target.tag)?
                .map(|v| v.assets.iter().any(|a| a.name == artifact.file_name))
                .unwrap_or(false);
            let path = artifact.path.display().to_string();
            let output = self.run(&["release", "upload", &target.tag, &path, "--clobber"])?;
            if !output.status.success() {
                return Err(failure(&output));
            }
            Ok(replaced)
        };
        upload().map_err(|source| PublishError::Transport {
            tag: target.tag.clone(),
            asset: artifact.file_name.clone(),
            source,
        })
    }

    fn list_assets(&self, tag: &str) -> Result<Vec<AssetRecord>, PublishError> {
        let view = self.view(tag).map_err(|source| PublishError::Transport {
            tag: tag.to_string(),
            asset: "*".to_string(),
            source,
        })?;
        let mut assets: Vec<AssetRecord> = view
            .map(|v| v.assets)
            .unwrap_or_default()
            .into_iter()
            .map(|a| AssetRecord {
                name: a.name,
                size_bytes: a.size,
                sha256: None,
                job_id: None,
                uploaded_at_unix: None,
            })
            .collect();
        assets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(assets)
    }
}
