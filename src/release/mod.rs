//! Release publication.
//!
//! All cells of one run publish into the same [`ReleaseTarget`]. Its tag is a
//! pure function of product, version and channel, so cells never disagree on
//! where their artifact goes. A release moves through
//! `absent → created → updated*`; there is no delete path.
//!
//! Publishing is keyed by asset file name: the same (tag, name) pair published
//! twice leaves one asset with the second upload's content.

pub mod gh;
pub mod store;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::driver::ArtifactRef;
use crate::error::{ConfigError, PublishError};
use crate::identity::validate_segment;

pub use gh::GhReleaseBackend;
pub use store::LocalReleaseStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Channel {
    Stable,
    Nightly { date: Date },
}

impl Channel {
    /// Nightly channel dated today (UTC).
    pub fn nightly_today() -> Self {
        Channel::Nightly {
            date: OffsetDateTime::now_utc().date(),
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, Channel::Stable)
    }

    /// Date qualifier appended to nightly tags, e.g. `alpha240131`.
    pub fn qualifier(&self) -> Option<String> {
        match self {
            Channel::Stable => None,
            Channel::Nightly { date } => Some(format!(
                "alpha{:02}{:02}{:02}",
                date.year().rem_euclid(100),
                date.month() as u8,
                date.day()
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseTarget {
    pub product: String,
    pub version: String,
    pub channel: Channel,
    pub tag: String,
    pub display_name: String,
}

impl ReleaseTarget {
    /// `<product>-<version>` for stable releases,
    /// `<product>-<version>-alpha<YYMMDD>` for nightlies.
    pub fn for_channel(product: &str, version: &str, channel: Channel) -> Result<Self, ConfigError> {
        validate_segment("product", product)?;
        validate_segment("version", version)?;
        let tag = match channel.qualifier() {
            None => format!("{product}-{version}"),
            Some(q) => format!("{product}-{version}-{q}"),
        };
        Ok(Self {
            product: product.to_string(),
            version: version.to_string(),
            channel,
            display_name: tag.clone(),
            tag,
        })
    }
}

impl fmt::Display for ReleaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseState {
    /// This publish created the release.
    Created,
    /// The release already existed.
    Updated,
}

/// One asset attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub name: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub uploaded_at_unix: Option<u64>,
}

/// Where releases live.
///
/// `put_asset` must be atomic from the caller's view: after it returns,
/// consumers see either the previous asset or the new one in full.
pub trait ReleaseBackend: Send + Sync {
    fn ensure_release(&self, target: &ReleaseTarget) -> Result<ReleaseState, PublishError>;

    /// Upload `artifact`, replacing an asset of the same name. Returns whether
    /// an asset was replaced.
    fn put_asset(&self, target: &ReleaseTarget, artifact: &ArtifactRef)
        -> Result<bool, PublishError>;

    fn list_assets(&self, tag: &str) -> Result<Vec<AssetRecord>, PublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishResult {
    pub tag: String,
    pub asset_name: String,
    pub release: ReleaseState,
    pub replaced: bool,
}

#[derive(Clone)]
pub struct Publisher {
    backend: Arc<dyn ReleaseBackend>,
}

impl Publisher {
    pub fn new(backend: Arc<dyn ReleaseBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn ReleaseBackend {
        self.backend.as_ref()
    }

    /// Publish one artifact into `target`, creating the release if needed.
    pub fn publish(
        &self,
        target: &ReleaseTarget,
        artifact: &ArtifactRef,
    ) -> Result<PublishResult, PublishError> {
        validate_asset_name(&artifact.file_name)?;
        let release = self.backend.ensure_release(target)?;
        if release == ReleaseState::Created {
            tracing::info!(tag = %target.tag, "release created");
        }
        let replaced = self.backend.put_asset(target, artifact)?;
        tracing::info!(
            tag = %target.tag,
            asset = %artifact.file_name,
            job = %artifact.cell,
            replaced,
            "asset published"
        );
        Ok(PublishResult {
            tag: target.tag.clone(),
            asset_name: artifact.file_name.clone(),
            release,
            replaced,
        })
    }
}

pub(crate) fn validate_asset_name(name: &str) -> Result<(), PublishError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        return Err(PublishError::InvalidAssetName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    #[test]
    fn stable_tag_has_no_date() {
        let target = ReleaseTarget::for_channel("bonsai", "0.9.2", Channel::Stable).unwrap();
        assert_eq!(target.tag, "bonsai-0.9.2");
        assert_eq!(target.display_name, "bonsai-0.9.2");
    }

    #[test]
    fn nightly_tag_is_dated() {
        let date = Date::from_calendar_date(2024, Month::January, 31).unwrap();
        let target =
            ReleaseTarget::for_channel("bonsai", "0.8.1", Channel::Nightly { date }).unwrap();
        assert_eq!(target.tag, "bonsai-0.8.1-alpha240131");
    }

    #[test]
    fn tag_depends_only_on_inputs() {
        let a = ReleaseTarget::for_channel("bonsai", "0.9.2", Channel::Stable).unwrap();
        let b = ReleaseTarget::for_channel("bonsai", "0.9.2", Channel::Stable).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(ReleaseTarget::for_channel("bon sai", "0.9.2", Channel::Stable).is_err());
        assert!(validate_asset_name("../x.zip").is_err());
        assert!(validate_asset_name("a/b.zip").is_err());
        assert!(validate_asset_name("bonsai_linux_py311.zip").is_ok());
    }
}
