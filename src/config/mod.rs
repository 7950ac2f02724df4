//! `release.toml` loading.
//!
//! Relative paths resolve against the directory holding the config file.
//! When no `[[variants.rule]]` entries are given, the IfcOpenShell default
//! priority table applies.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::identity::validate_segment;
use crate::matrix::{Platform, RuntimeVersion};
use crate::release::store::DEFAULT_STORE_DIR;
use crate::variant::{PriorityRule, PriorityTable, VariantSet};

pub const DEFAULT_CONFIG_FILE: &str = "release.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelName {
    Stable,
    Nightly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Filesystem store under `release.store`.
    Local,
    /// GitHub releases through the `gh` CLI.
    Gh,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReleaseToml {
    release: ReleaseSection,
    matrix: MatrixSection,
    build: BuildSection,
    #[serde(default)]
    variants: VariantsSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReleaseSection {
    product: String,
    repository: String,
    #[serde(default = "default_version_file")]
    version_file: String,
    #[serde(default = "default_channel")]
    channel: ChannelName,
    #[serde(default)]
    tolerate_partial_failure: bool,
    workers: Option<usize>,
    store: Option<String>,
    #[serde(default = "default_backend")]
    backend: BackendKind,
    source_tree: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatrixSection {
    platforms: Vec<Platform>,
    runtimes: Vec<RuntimeVersion>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildSection {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default = "default_output_dir")]
    output_dir: String,
    artifact_glob: String,
    #[serde(default)]
    required_tools: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VariantsSection {
    #[serde(default)]
    base_build: u32,
    #[serde(default)]
    selected: VariantSet,
    #[serde(default)]
    rule: Option<Vec<PriorityRule>>,
    #[serde(default = "default_true")]
    hash_sources: bool,
}

impl Default for VariantsSection {
    fn default() -> Self {
        Self {
            base_build: 0,
            selected: VariantSet::default(),
            rule: None,
            hash_sources: true,
        }
    }
}

fn default_version_file() -> String {
    "VERSION".to_string()
}

fn default_channel() -> ChannelName {
    ChannelName::Stable
}

fn default_backend() -> BackendKind {
    BackendKind::Local
}

fn default_output_dir() -> String {
    "dist".to_string()
}

fn default_true() -> bool {
    true
}

/// Toolchain invocation settings.
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub required_tools: Vec<String>,
}

/// Validated release configuration.
#[derive(Debug, Clone)]
pub struct ReleaseConfig {
    pub config_path: PathBuf,
    pub product: String,
    pub repository: String,
    pub version_file: PathBuf,
    pub channel: ChannelName,
    pub tolerate_partial_failure: bool,
    pub workers: Option<usize>,
    pub store_dir: PathBuf,
    pub backend: BackendKind,
    pub source_tree: PathBuf,
    pub platforms: Vec<Platform>,
    pub runtimes: Vec<RuntimeVersion>,
    pub toolchain: ToolchainConfig,
    pub output_dir: PathBuf,
    pub artifact_glob: String,
    pub base_build: u32,
    pub selected_variant: VariantSet,
    pub priority_table: PriorityTable,
    pub hash_sources: bool,
}

pub fn load_config(config_path: &Path) -> Result<ReleaseConfig, ConfigError> {
    let raw = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
        path: config_path.to_path_buf(),
        source,
    })?;
    parse_config(&raw, config_path)
}

/// Parse config text as if it were read from `config_path`.
pub fn parse_config(raw: &str, config_path: &Path) -> Result<ReleaseConfig, ConfigError> {
    let parsed: ReleaseToml = toml::from_str(raw).map_err(|source| ConfigError::Parse {
        path: config_path.to_path_buf(),
        source,
    })?;
    let base_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let invalid = |reason: String| ConfigError::Invalid {
        path: config_path.to_path_buf(),
        reason,
    };

    let release = parsed.release;
    validate_segment("product", &release.product)?;
    if release.repository.split('/').count() != 2
        || release.repository.split('/').any(str::is_empty)
    {
        return Err(invalid(format!(
            "repository '{}' must be owner/name",
            release.repository
        )));
    }
    if release.workers == Some(0) {
        return Err(invalid("workers must be at least 1".to_string()));
    }

    let build = parsed.build;
    if build.program.trim().is_empty() {
        return Err(invalid("build.program must not be empty".to_string()));
    }
    if build.artifact_glob.is_empty()
        || build.artifact_glob.contains('/')
        || build.artifact_glob.contains('\\')
    {
        return Err(invalid(format!(
            "build.artifact_glob '{}' must be a bare file name pattern",
            build.artifact_glob
        )));
    }
    glob::Pattern::new(&build.artifact_glob)
        .map_err(|e| invalid(format!("build.artifact_glob: {e}")))?;

    let variants = parsed.variants;
    let priority_table = match variants.rule {
        Some(rules) => PriorityTable::new(rules)?,
        None => PriorityTable::ifcopenshell_default(),
    };
    priority_table.require_recognized(&variants.selected)?;

    Ok(ReleaseConfig {
        config_path: config_path.to_path_buf(),
        product: release.product,
        repository: release.repository,
        version_file: resolve_path(&base_dir, &release.version_file),
        channel: release.channel,
        tolerate_partial_failure: release.tolerate_partial_failure,
        workers: release.workers,
        store_dir: resolve_path(
            &base_dir,
            release.store.as_deref().unwrap_or(DEFAULT_STORE_DIR),
        ),
        backend: release.backend,
        source_tree: resolve_path(&base_dir, release.source_tree.as_deref().unwrap_or(".")),
        platforms: parsed.matrix.platforms,
        runtimes: parsed.matrix.runtimes,
        toolchain: ToolchainConfig {
            program: build.program,
            args: build.args,
            env: build.env,
            required_tools: build.required_tools,
        },
        output_dir: resolve_path(&base_dir, &build.output_dir),
        artifact_glob: build.artifact_glob,
        base_build: variants.base_build,
        selected_variant: variants.selected,
        priority_table,
        hash_sources: variants.hash_sources,
    })
}

fn resolve_path(base_dir: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[release]
product = "bonsai"
repository = "IfcOpenShell/IfcOpenShell"

[matrix]
platforms = ["linux", "macos"]
runtimes = ["311"]

[build]
program = "make"
args = ["dist", "PLATFORM={platform}"]
artifact_glob = "bonsai_*.zip"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse_config(MINIMAL, Path::new("/repo/release.toml")).unwrap();
        assert_eq!(cfg.product, "bonsai");
        assert_eq!(cfg.version_file, PathBuf::from("/repo/VERSION"));
        assert_eq!(cfg.output_dir, PathBuf::from("/repo/dist"));
        assert_eq!(cfg.store_dir, PathBuf::from("/repo/.releases"));
        assert_eq!(cfg.channel, ChannelName::Stable);
        assert_eq!(cfg.backend, BackendKind::Local);
        assert!(!cfg.tolerate_partial_failure);
        assert_eq!(cfg.platforms.len(), 2);
        assert_eq!(cfg.runtimes[0].tag(), "py311");
        assert!(cfg.selected_variant.is_empty());
        assert_eq!(cfg.priority_table.rules().len(), 2);
    }

    #[test]
    fn custom_variant_rules_are_validated() {
        let raw = format!(
            "{MINIMAL}
[variants]
base_build = 4
selected = {{ variant = \"novtk\" }}

[[variants.rule]]
axis = \"variant\"
value = \"all\"
offset = 100
tag = \"all\"

[[variants.rule]]
axis = \"variant\"
value = \"novtk\"
offset = 100
tag = \"novtk\"
"
        );
        assert!(matches!(
            parse_config(&raw, Path::new("release.toml")),
            Err(ConfigError::VariantCollision { .. })
        ));
    }

    #[test]
    fn selected_variant_must_be_known() {
        let raw = format!("{MINIMAL}\n[variants]\nselected = {{ variant = \"gpu\" }}\n");
        assert!(matches!(
            parse_config(&raw, Path::new("release.toml")),
            Err(ConfigError::UnrecognizedVariant(_))
        ));
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        let extra = MINIMAL.replace("[build]", "[build]\nunknown = 1");
        assert!(matches!(
            parse_config(&extra, Path::new("release.toml")),
            Err(ConfigError::Parse { .. })
        ));

        let bad_repo = MINIMAL.replace("IfcOpenShell/IfcOpenShell", "IfcOpenShell");
        assert!(parse_config(&bad_repo, Path::new("release.toml")).is_err());

        let bad_glob = MINIMAL.replace("bonsai_*.zip", "dist/bonsai_*.zip");
        assert!(parse_config(&bad_glob, Path::new("release.toml")).is_err());

        let bad_platform = MINIMAL.replace("\"linux\"", "\"linux_x64\"");
        assert!(parse_config(&bad_platform, Path::new("release.toml")).is_err());
    }
}
