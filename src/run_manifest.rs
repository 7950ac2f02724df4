//! Per-run record of cell outcomes.
//!
//! Each release run writes `<store>/runs/<run_id>/run-manifest.json`. Run ids
//! are base62 and sort by creation time, so the newest run is easy to find
//! when triaging a failed platform.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::fsutil::write_json_atomic;

pub const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
pub const RUNS_SUBDIR: &str = "runs";

const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    pub job_id: String,
    /// `success`, `failed` or `cancelled`.
    pub status: String,
    pub build_string: Option<String>,
    pub artifact: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub tag: String,
    pub version: String,
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub cells: Vec<CellRecord>,
}

pub fn runs_dir(store_root: &Path) -> PathBuf {
    store_root.join(RUNS_SUBDIR)
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

pub fn write_run_manifest(runs_dir: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    let path = manifest_path(&runs_dir.join(&manifest.run_id));
    write_json_atomic(&path, manifest)
        .with_context(|| format!("writing run manifest '{}'", path.display()))?;
    Ok(path)
}

pub fn load_runs(runs_dir: &Path) -> Result<Vec<RunManifest>> {
    if !runs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_dir)
        .with_context(|| format!("reading runs directory '{}'", runs_dir.display()))?
    {
        let run_dir = entry
            .with_context(|| format!("iterating runs directory '{}'", runs_dir.display()))?
            .path();
        if !run_dir.is_dir() {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes =
            fs::read(&path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
        let parsed: RunManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run manifest '{}'", path.display()))?;
        runs.push(parsed);
    }
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs)
}

/// The most recently created run, if any.
pub fn latest_run(runs_dir: &Path) -> Result<Option<RunManifest>> {
    Ok(load_runs(runs_dir)?.into_iter().next())
}

/// Keep the newest `keep` runs and delete the rest.
pub fn prune_old_runs(runs_dir: &Path, keep: usize) -> Result<usize> {
    let runs = load_runs(runs_dir)?;
    let mut removed = 0;
    for run in runs.into_iter().skip(keep) {
        let path = runs_dir.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

fn run_sort_key(run: &RunManifest) -> (String, usize, String) {
    // Shorter base62 ids are older; compare length before content.
    (run.created_at_utc.clone(), run.run_id.len(), run.run_id.clone())
}

pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let seq = RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let entropy = run_id_entropy(nanos, std::process::id(), seq);
    let suffix = base62_encode_u128(entropy);
    if suffix.len() > 22 {
        bail!("run id overflow while generating run identifier")
    }
    Ok(suffix)
}

/// Timestamp in the high bits, then 16 bits each of pid and sequence.
fn run_id_entropy(nanos: u128, pid: u32, seq: u64) -> u128 {
    let pid_component = ((pid as u128) & 0xFFFF) << (RUN_ID_SALT_BITS - 16);
    let seq_component = (seq as u128) & 0xFFFF;
    (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        let idx = (value % 62) as usize;
        bytes.push(ALPHABET[idx] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest(run_id: &str, created: &str) -> RunManifest {
        RunManifest {
            run_id: run_id.to_string(),
            tag: "bonsai-0.9.2".to_string(),
            version: "0.9.2".to_string(),
            status: "success".to_string(),
            created_at_utc: created.to_string(),
            finished_at_utc: None,
            cells: vec![],
        }
    }

    #[test]
    fn run_ids_are_unique() {
        let a = generate_run_id().unwrap();
        let b = generate_run_id().unwrap();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn large_pids_stay_out_of_the_timestamp_bits() {
        let nanos = 1_700_000_000_123_456_789u128;
        for pid in [0, 70_000, 4_194_304, u32::MAX] {
            let entropy = run_id_entropy(nanos, pid, u64::MAX);
            assert_eq!(entropy >> RUN_ID_SALT_BITS, nanos);
        }
        let earlier = run_id_entropy(nanos, u32::MAX, 0);
        let later = run_id_entropy(nanos + 1, 0, 0);
        assert!(base62_encode_u128(earlier) < base62_encode_u128(later));
    }

    #[test]
    fn base62_encoding() {
        assert_eq!(base62_encode_u128(0), "0");
        assert_eq!(base62_encode_u128(61), "z");
        assert_eq!(base62_encode_u128(62), "10");
    }

    #[test]
    fn latest_run_and_pruning() {
        let tmp = TempDir::new().unwrap();
        let runs = runs_dir(tmp.path());
        write_run_manifest(&runs, &manifest("A1", "20240101T000000Z")).unwrap();
        write_run_manifest(&runs, &manifest("B2", "20240301T000000Z")).unwrap();
        write_run_manifest(&runs, &manifest("C3", "20240201T000000Z")).unwrap();

        assert_eq!(latest_run(&runs).unwrap().unwrap().run_id, "B2");
        assert_eq!(prune_old_runs(&runs, 2).unwrap(), 1);
        let left: Vec<String> = load_runs(&runs)
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(left, vec!["B2", "C3"]);
    }

    #[test]
    fn missing_runs_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(latest_run(&tmp.path().join("nope")).unwrap().is_none());
    }
}
