//! Filesystem release store.
//!
//! Layout under the store root:
//!
//! ```text
//! blobs/sha256/<2 hex>/<sha256>     asset contents, content-addressed
//! releases/<tag>/release.json       created once, on first publish
//! releases/<tag>/assets/<name>.json one index entry per asset name
//! locks/<tag>.lock                  serializes writers of one release
//! tmp/                              staging for atomic renames
//! ```
//!
//! A blob is renamed into place before the index entry that points at it,
//! and the index entry is itself written by rename. Readers therefore see a
//! complete old asset or a complete new one.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::{
    validate_asset_name, AssetRecord, Channel, ReleaseBackend, ReleaseState, ReleaseTarget,
};
use crate::driver::ArtifactRef;
use crate::error::PublishError;
use crate::fsutil::{atomic_rename, is_hex_64, now_unix, sha256_file, tmp_name, write_json_atomic};

/// Default store directory name, relative to the config file.
pub const DEFAULT_STORE_DIR: &str = ".releases";

/// Stored once per release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub tag: String,
    pub display_name: String,
    pub product: String,
    pub version: String,
    pub channel: Channel,
    pub created_at_unix: u64,
}

/// Index entry mapping an asset name to its blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AssetIndexEntry {
    name: String,
    blob_sha256: String,
    size_bytes: u64,
    job_id: String,
    uploaded_at_unix: u64,
}

impl From<AssetIndexEntry> for AssetRecord {
    fn from(entry: AssetIndexEntry) -> Self {
        AssetRecord {
            name: entry.name,
            size_bytes: entry.size_bytes,
            sha256: Some(entry.blob_sha256),
            job_id: Some(entry.job_id),
            uploaded_at_unix: Some(entry.uploaded_at_unix),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalReleaseStore {
    root: PathBuf,
}

impl LocalReleaseStore {
    /// Open (and create if needed) the store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.blobs_dir().join("sha256"))?;
        fs::create_dir_all(self.releases_dir())?;
        fs::create_dir_all(self.tmp_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        Ok(())
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn release_dir(&self, tag: &str) -> Result<PathBuf> {
        validate_tag(tag)?;
        Ok(self.releases_dir().join(tag))
    }

    fn release_record_path(&self, tag: &str) -> Result<PathBuf> {
        Ok(self.release_dir(tag)?.join("release.json"))
    }

    fn asset_index_path(&self, tag: &str, name: &str) -> Result<PathBuf> {
        validate_asset_name(name)?;
        Ok(self
            .release_dir(tag)?
            .join("assets")
            .join(format!("{name}.json")))
    }

    fn blob_path(&self, sha256: &str) -> Result<PathBuf> {
        if !is_hex_64(sha256) {
            bail!("invalid sha256: {sha256}");
        }
        let prefix = &sha256[0..2];
        Ok(self.blobs_dir().join("sha256").join(prefix).join(sha256))
    }

    /// The release record for `tag`, if the release exists.
    pub fn release(&self, tag: &str) -> Result<Option<ReleaseRecord>> {
        let path = self.release_record_path(tag)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes =
            fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let record = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(record))
    }

    /// Tags of every release in the store, sorted.
    pub fn list_releases(&self) -> Result<Vec<String>> {
        let dir = self.releases_dir();
        let mut out = vec![];
        for ent in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))?
        {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            if let Some(tag) = ent.file_name().to_str() {
                if ent.path().join("release.json").is_file() {
                    out.push(tag.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Create the release for `target` if it does not exist yet.
    pub fn create_release(&self, target: &ReleaseTarget) -> Result<ReleaseState> {
        let _lock = self.acquire_lock(&target.tag)?;
        self.create_release_locked(target)
    }

    fn create_release_locked(&self, target: &ReleaseTarget) -> Result<ReleaseState> {
        let path = self.release_record_path(&target.tag)?;
        if path.exists() {
            return Ok(ReleaseState::Updated);
        }
        let record = ReleaseRecord {
            tag: target.tag.clone(),
            display_name: target.display_name.clone(),
            product: target.product.clone(),
            version: target.version.clone(),
            channel: target.channel,
            created_at_unix: now_unix(),
        };
        write_json_atomic(&path, &record)?;
        Ok(ReleaseState::Created)
    }

    /// Store `src_file` as asset `name` of release `tag`, replacing any asset
    /// of that name. Returns whether an asset was replaced.
    pub fn put_asset_file(&self, tag: &str, name: &str, src_file: &Path, job_id: &str) -> Result<bool> {
        if !src_file.is_file() {
            bail!("Source file not found: {}", src_file.display());
        }
        let index_path = self.asset_index_path(tag, name)?;
        if !self.release_record_path(tag)?.exists() {
            bail!("release '{tag}' does not exist");
        }

        let _lock = self.acquire_lock(tag)?;

        let (sha256, size_bytes) = sha256_file(src_file)?;
        let blob_path = self.blob_path(&sha256)?;
        if !blob_path.exists() {
            let tmp = self
                .tmp_dir()
                .join(tmp_name(&format!("blob-{}", &sha256[..16])));
            fs::copy(src_file, &tmp).with_context(|| {
                format!("Failed to copy {} to {}", src_file.display(), tmp.display())
            })?;
            atomic_rename(&tmp, &blob_path)?;
        }

        let replaced = index_path.exists();
        let entry = AssetIndexEntry {
            name: name.to_string(),
            blob_sha256: sha256,
            size_bytes,
            job_id: job_id.to_string(),
            uploaded_at_unix: now_unix(),
        };
        write_json_atomic(&index_path, &entry)?;
        Ok(replaced)
    }

    /// Assets of release `tag`, sorted by name.
    pub fn assets(&self, tag: &str) -> Result<Vec<AssetRecord>> {
        let dir = self.release_dir(tag)?.join("assets");
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut out = vec![];
        for ent in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))?
        {
            let path = ent?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            let entry: AssetIndexEntry = serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse index {}", path.display()))?;
            out.push(AssetRecord::from(entry));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Block until this process holds the exclusive lock for `tag`.
    fn acquire_lock(&self, tag: &str) -> Result<ReleaseLock> {
        validate_tag(tag)?;
        let lock_path = self.locks_dir().join(format!("{tag}.lock"));
        fs::create_dir_all(self.locks_dir())?;

        // The lock file is never unlinked: removing a still-locked file lets a
        // second writer create a fresh file at the same path and lock that.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
        Ok(ReleaseLock { file })
    }
}

impl ReleaseBackend for LocalReleaseStore {
    fn ensure_release(&self, target: &ReleaseTarget) -> Result<ReleaseState, PublishError> {
        self.create_release(target)
            .map_err(|source| PublishError::CreateRelease {
                tag: target.tag.clone(),
                source,
            })
    }

    fn put_asset(
        &self,
        target: &ReleaseTarget,
        artifact: &ArtifactRef,
    ) -> Result<bool, PublishError> {
        self.put_asset_file(
            &target.tag,
            &artifact.file_name,
            &artifact.path,
            &artifact.cell.job_id(),
        )
        .map_err(|source| PublishError::Transport {
            tag: target.tag.clone(),
            asset: artifact.file_name.clone(),
            source,
        })
    }

    fn list_assets(&self, tag: &str) -> Result<Vec<AssetRecord>, PublishError> {
        self.assets(tag).map_err(|source| PublishError::Transport {
            tag: tag.to_string(),
            asset: "*".to_string(),
            source,
        })
    }
}

/// Holds the release lock until dropped.
#[derive(Debug)]
struct ReleaseLock {
    file: File,
}

impl Drop for ReleaseLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        bail!("release tag must not be empty");
    }
    if tag.contains('/') || tag.contains('\\') || tag.contains("..") || tag.starts_with('.') {
        bail!("release tag must be a safe filename segment: {tag}");
    }
    Ok(())
}
