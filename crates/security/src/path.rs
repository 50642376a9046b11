//! Path confinement: keep tool-invoked filesystem access inside the workspace.
//!
//! Two checks live here. [`resolve_within`] follows symlinks and is used for
//! paths the process will actually enter (a working directory). The lexical
//! helpers are used for paths that only appear as command-line arguments,
//! where the filesystem may not even contain them yet.

use std::path::{Component, Path, PathBuf};

/// Error returned when path validation fails.
#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path '{path}' is outside the workspace")]
    OutsideWorkspace { path: String },

    #[error("Path traversal detected in '{path}'")]
    PathTraversal { path: String },

    #[error("Failed to canonicalize path '{path}': {reason}")]
    CanonicalizeFailed { path: String, reason: String },
}

/// Resolve `candidate` against `workspace` and require the result to stay
/// inside it once symlinks are followed.
///
/// Relative candidates are joined onto the workspace. Candidates that do not
/// exist yet are resolved through their nearest existing ancestor.
/// Returns the canonical path on success.
pub fn resolve_within(workspace: &Path, candidate: &Path) -> Result<PathBuf, PathValidationError> {
    let root = workspace
        .canonicalize()
        .map_err(|e| PathValidationError::CanonicalizeFailed {
            path: workspace.display().to_string(),
            reason: e.to_string(),
        })?;

    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let resolved = canonicalize_existing_prefix(&joined).map_err(|e| {
        PathValidationError::CanonicalizeFailed {
            path: candidate.display().to_string(),
            reason: e.to_string(),
        }
    })?;

    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(PathValidationError::OutsideWorkspace {
            path: candidate.display().to_string(),
        })
    }
}

/// Whether `candidate`, taken relative to `base`, lands outside `base`
/// without touching the filesystem.
pub fn escapes_lexically(base: &Path, candidate: &Path) -> bool {
    let base = normalize_lexically(base);
    let target = if candidate.is_absolute() {
        normalize_lexically(candidate)
    } else {
        normalize_lexically(&base.join(candidate))
    };
    !target.starts_with(&base)
}

/// Whether a raw string contains a parent-directory hop. URL tokens are
/// skipped: a `..` segment there is resolved by the server, not the shell.
pub fn contains_traversal(s: &str) -> bool {
    let s = s.replace('\\', "/");
    s.split_whitespace()
        .filter(|token| !token.contains("://"))
        .any(|token| token == ".." || token.contains("../") || token.ends_with("/.."))
}

/// Canonicalize the longest existing ancestor and re-attach the rest.
fn canonicalize_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut rest = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut resolved = existing.canonicalize()?;
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    Ok(normalize_lexically(&resolved))
}

/// Collapse `.` and `..` components without consulting the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
