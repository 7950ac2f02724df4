//! Preflight checks, evaluated once before any build or publish work.
//!
//! - the repository identity gate, so release publication never runs from a
//!   fork;
//! - the single-line version file;
//! - host tools the toolchain needs.
//!
//! # Example
//!
//! ```rust
//! use bonsai_release::preflight::{check_repository_identity, Gate};
//!
//! let gate = check_repository_identity("IfcOpenShell/IfcOpenShell", Some("someone/IfcOpenShell"));
//! assert!(matches!(gate, Gate::Deny { .. }));
//! ```

use std::fs;
use std::path::Path;

use crate::error::ConfigError;

/// Environment variable CI sets to the repository running the workflow.
pub const REPOSITORY_ENV: &str = "GITHUB_REPOSITORY";

/// Outcome of the repository identity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Allow,
    Deny {
        expected: String,
        actual: Option<String>,
    },
}

impl Gate {
    /// Turn a denial into a configuration error.
    pub fn require(self) -> Result<(), ConfigError> {
        match self {
            Gate::Allow => Ok(()),
            Gate::Deny { expected, actual } => {
                Err(ConfigError::RepositoryMismatch { expected, actual })
            }
        }
    }
}

/// Allow only when `actual` is exactly `expected`. No case folding, no
/// trimming: `ifcopenshell/ifcopenshell` is a different repository.
pub fn check_repository_identity(expected: &str, actual: Option<&str>) -> Gate {
    match actual {
        Some(actual) if actual == expected => Gate::Allow,
        _ => Gate::Deny {
            expected: expected.to_string(),
            actual: actual.map(str::to_string),
        },
    }
}

/// Identity of the running repository: `explicit` if given, else
/// [`REPOSITORY_ENV`].
pub fn resolve_repository_identity(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(REPOSITORY_ENV).ok())
        .filter(|s| !s.is_empty())
}

/// Read a version file holding exactly one non-empty line.
pub fn read_version_file(path: &Path) -> Result<String, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::MissingVersionFile(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::InvalidVersionFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let invalid = |reason: &str| ConfigError::InvalidVersionFile {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
    let version = lines.next().ok_or_else(|| invalid("file is empty"))?.trim();
    if lines.next().is_some() {
        return Err(invalid("expected a single line"));
    }
    if version.chars().any(char::is_whitespace) {
        return Err(invalid("version must not contain whitespace"));
    }
    Ok(version.to_string())
}

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Each tuple is (command_name, package_name).
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<(), ConfigError> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        return Err(ConfigError::MissingTools(missing.join("\n")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn identity_must_match_exactly() {
        let expected = "IfcOpenShell/IfcOpenShell";
        assert_eq!(check_repository_identity(expected, Some(expected)), Gate::Allow);
        assert!(matches!(
            check_repository_identity(expected, Some("ifcopenshell/ifcopenshell")),
            Gate::Deny { .. }
        ));
        assert!(matches!(
            check_repository_identity(expected, Some("fork/IfcOpenShell")),
            Gate::Deny { .. }
        ));
        assert!(matches!(
            check_repository_identity(expected, None).require(),
            Err(ConfigError::RepositoryMismatch { actual: None, .. })
        ));
    }

    #[test]
    fn explicit_identity_wins() {
        assert_eq!(
            resolve_repository_identity(Some("a/b")),
            Some("a/b".to_string())
        );
    }

    #[test]
    fn reads_single_line_version() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("VERSION");

        fs::write(&path, "0.9.2\n").unwrap();
        assert_eq!(read_version_file(&path).unwrap(), "0.9.2");

        fs::write(&path, "0.9.2\n0.9.3\n").unwrap();
        assert!(read_version_file(&path).is_err());

        fs::write(&path, "\n  \n").unwrap();
        assert!(read_version_file(&path).is_err());

        assert!(matches!(
            read_version_file(&tmp.path().join("missing")),
            Err(ConfigError::MissingVersionFile(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_check_required_tools() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
        assert!(check_required_tools(&[("sh", "coreutils")]).is_ok());
        assert!(matches!(
            check_required_tools(&[("nonexistent_command_xyz", "fake-package")]),
            Err(ConfigError::MissingTools(_))
        ));
    }
}
