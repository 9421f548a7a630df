//! Path validation for filesystem tools.
//!
//! Every path a tool touches must resolve inside the workspace, after `..`
//! components and symlinks are taken into account.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, TermpalError};

/// A path verified to lie inside the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafePath(PathBuf);

impl SafePath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for SafePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Collapse `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
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

/// Canonicalize the deepest existing ancestor and re-attach the rest.
///
/// Lets callers validate paths to files that do not exist yet while still
/// resolving symlinks in the part that does.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    while existing.symlink_metadata().is_err() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize()?;
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Validate that `path` (absolute, or relative to `workspace`) stays inside
/// `workspace`.
///
/// # Example
/// ```
/// use termpal::security::validate_path_in_workspace;
///
/// let ws = tempfile::tempdir().unwrap();
/// let ws = ws.path().to_str().unwrap();
/// assert!(validate_path_in_workspace("notes/today.md", ws).is_ok());
/// assert!(validate_path_in_workspace("../outside.txt", ws).is_err());
/// ```
pub fn validate_path_in_workspace(path: &str, workspace: impl AsRef<Path>) -> Result<SafePath> {
    let workspace = workspace.as_ref().canonicalize().map_err(|e| {
        TermpalError::SecurityViolation(format!(
            "Workspace '{}' is not accessible: {}",
            workspace.as_ref().display(),
            e
        ))
    })?;

    if path.contains('\0') {
        return Err(TermpalError::SecurityViolation(
            "Path contains a NUL byte".to_string(),
        ));
    }

    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workspace.join(candidate)
    };
    let resolved = resolve_existing_prefix(&normalize(&joined))?;

    if resolved.starts_with(&workspace) {
        Ok(SafePath(resolved))
    } else {
        Err(TermpalError::SecurityViolation(format!(
            "Path '{}' escapes the workspace",
            path
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_inside() {
        let ws = tempfile::tempdir().unwrap();
        let safe = validate_path_in_workspace("a/b.txt", ws.path()).unwrap();
        assert!(safe.as_path().starts_with(ws.path().canonicalize().unwrap()));
        assert!(safe.as_path().ends_with("a/b.txt"));
    }

    #[test]
    fn test_dotdot_escape_rejected() {
        let ws = tempfile::tempdir().unwrap();
        let err = validate_path_in_workspace("../../etc/passwd", ws.path()).unwrap_err();
        assert!(matches!(err, TermpalError::SecurityViolation(_)));
    }

    #[test]
    fn test_dotdot_inside_allowed() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::create_dir(ws.path().join("sub")).unwrap();
        assert!(validate_path_in_workspace("sub/../file.txt", ws.path()).is_ok());
    }

    #[test]
    fn test_absolute_outside_rejected() {
        let ws = tempfile::tempdir().unwrap();
        assert!(validate_path_in_workspace("/etc/hostname", ws.path()).is_err());
    }

    #[test]
    fn test_absolute_inside_allowed() {
        let ws = tempfile::tempdir().unwrap();
        let inside = ws.path().canonicalize().unwrap().join("x.txt");
        assert!(validate_path_in_workspace(inside.to_str().unwrap(), ws.path()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let ws = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), ws.path().join("link")).unwrap();
        let err = validate_path_in_workspace("link/secret.txt", ws.path()).unwrap_err();
        assert!(matches!(err, TermpalError::SecurityViolation(_)));
    }

    #[test]
    fn test_missing_workspace() {
        let err = validate_path_in_workspace("a.txt", "/definitely/not/here/termpal").unwrap_err();
        assert!(matches!(err, TermpalError::SecurityViolation(_)));
    }
}
