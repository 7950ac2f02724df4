//! Build identity composition.
//!
//! A [`BuildIdentity`] is computed once per package build and rendered into
//! the artifact's build string:
//!
//! ```text
//! <runtime-tag>_<variant>_<content-qualifier>_<build-number>
//! py311_novtk_h3f2a9c01_200
//! ```
//!
//! `_` separates segments, so no segment may contain one. When no content
//! qualifier is available the segment renders as `unhashed`, and two rebuilds
//! of the same version, variant and runtime become indistinguishable.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::ConfigError;
use crate::variant::{PriorityTable, VariantSet};

/// Rendered in place of a missing content qualifier.
pub const UNHASHED: &str = "unhashed";

/// Hex characters of the source digest kept in a content qualifier.
const QUALIFIER_HEX_LEN: usize = 8;

/// Directories never hashed into a content qualifier.
const SKIPPED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    "target",
    "dist",
    "build",
    "__pycache__",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BuildIdentity {
    pub version: String,
    pub base_build: u32,
    pub variant_tag: String,
    pub variant_offset: u32,
    pub runtime_tag: String,
    pub content_qualifier: Option<String>,
}

impl BuildIdentity {
    /// Compose an identity, rejecting components that are not filename-safe.
    pub fn compose(
        version: &str,
        base_build: u32,
        variant_tag: &str,
        variant_offset: u32,
        runtime_tag: &str,
        content_qualifier: Option<&str>,
    ) -> Result<Self, ConfigError> {
        validate_segment("version", version)?;
        validate_segment("variant tag", variant_tag)?;
        validate_segment("runtime tag", runtime_tag)?;
        // `render` joins version and runtime tag with '-'; only the version may carry one.
        if runtime_tag.contains('-') {
            return Err(ConfigError::InvalidComponent {
                field: "runtime tag",
                value: runtime_tag.to_string(),
                reason: "must not contain '-'",
            });
        }
        if let Some(q) = content_qualifier {
            validate_segment("content qualifier", q)?;
        }
        base_build
            .checked_add(variant_offset)
            .ok_or_else(|| ConfigError::InvalidComponent {
                field: "build number",
                value: format!("{base_build}+{variant_offset}"),
                reason: "overflows u32",
            })?;

        Ok(Self {
            version: version.to_string(),
            base_build,
            variant_tag: variant_tag.to_string(),
            variant_offset,
            runtime_tag: runtime_tag.to_string(),
            content_qualifier: content_qualifier.map(str::to_string),
        })
    }

    /// Compose an identity for `flags`, looking up tag and offset in `table`.
    pub fn for_variant(
        table: &PriorityTable,
        version: &str,
        base_build: u32,
        flags: &VariantSet,
        runtime_tag: &str,
        content_qualifier: Option<&str>,
    ) -> Result<Self, ConfigError> {
        table.require_recognized(flags)?;
        Self::compose(
            version,
            base_build,
            &table.tag(flags),
            table.priority(flags),
            runtime_tag,
            content_qualifier,
        )
    }

    /// Build number seen by package resolvers.
    pub fn build_number(&self) -> u32 {
        self.base_build + self.variant_offset
    }

    pub fn build_string(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.runtime_tag,
            self.variant_tag,
            self.content_qualifier.as_deref().unwrap_or(UNHASHED),
            self.build_number()
        )
    }

    /// Filename-safe rendering, unique per version, variant, runtime and qualifier.
    pub fn render(&self) -> String {
        format!("{}-{}", self.version, self.build_string())
    }
}

/// Run-time pin accepting any build of `dependency` with the same
/// major.minor.patch and the same variant tag.
pub fn pin_compatible(dependency: &str, identity: &BuildIdentity) -> Result<String, ConfigError> {
    let release = identity
        .version
        .split(['.', '-', '+'])
        .take(3)
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                Err(ConfigError::InvalidComponent {
                    field: "version",
                    value: identity.version.clone(),
                    reason: "expected major.minor.patch",
                })
            } else {
                Ok(digits)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    if release.len() != 3 {
        return Err(ConfigError::InvalidComponent {
            field: "version",
            value: identity.version.clone(),
            reason: "expected major.minor.patch",
        });
    }
    Ok(format!(
        "{} {}.* *_{}_*",
        dependency,
        release.join("."),
        identity.variant_tag
    ))
}

/// Short digest over every file of `source_tree`, e.g. `h3f2a9c01`.
///
/// Relative paths and contents are hashed in sorted order, so the qualifier
/// does not depend on directory iteration order. Directories in `excluded`
/// (build outputs, the release store) are skipped wherever they sit inside
/// the tree; excluded paths that do not exist are ignored.
pub fn content_qualifier_for(source_tree: &Path, excluded: &[&Path]) -> Result<String> {
    let root = fs::canonicalize(source_tree)
        .with_context(|| format!("resolving source tree '{}'", source_tree.display()))?;
    let excluded: Vec<PathBuf> = excluded
        .iter()
        .filter_map(|path| fs::canonicalize(path).ok())
        .collect();

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            if !e.file_type().is_dir() || e.depth() == 0 {
                return true;
            }
            let named_skip = SKIPPED_DIRS
                .iter()
                .any(|skip| e.file_name().to_str() == Some(*skip));
            !named_skip && !excluded.iter().any(|dir| dir == e.path())
        })
    {
        let entry = entry
            .with_context(|| format!("walking source tree '{}'", source_tree.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    for path in &files {
        let rel = path
            .strip_prefix(&root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let bytes =
            fs::read(path).with_context(|| format!("hashing source file '{}'", path.display()))?;
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    let digest = format!("{:x}", hasher.finalize());
    Ok(format!("h{}", &digest[..QUALIFIER_HEX_LEN]))
}

/// Check that `value` can be used as one segment of a build string or file name.
pub fn validate_segment(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidComponent {
        field,
        value: value.to_string(),
        reason,
    };
    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.contains('_') {
        return Err(invalid("must not contain '_'"));
    }
    if value.starts_with('.') || value.starts_with('-') {
        return Err(invalid("must not start with '.' or '-'"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'))
    {
        return Err(invalid("only ASCII letters, digits, '.', '+' and '-' are allowed"));
    }
    Ok(())
}
