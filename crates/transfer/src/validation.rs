use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Validates that a relative file path does not escape its base directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_relative_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    let path = Path::new(file_path);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Resolves `relative` under the writable `root` and creates its parent
/// directories.
///
/// The parent is canonicalized after creation, so a symlink inside the root
/// that points elsewhere is rejected too.
pub fn resolve_within_root(root: &Path, relative: &str) -> Result<PathBuf, TransferError> {
    validate_relative_path(relative)?;

    std::fs::create_dir_all(root)?;
    let root = root.canonicalize()?;
    let target = root.join(relative);

    let parent = target
        .parent()
        .ok_or_else(|| TransferError::InvalidPath(format!("no parent directory: {relative}")))?;
    std::fs::create_dir_all(parent)?;
    let parent = parent.canonicalize()?;
    if !parent.starts_with(&root) {
        return Err(TransferError::InvalidPath(format!(
            "{} is outside the download root {}",
            parent.display(),
            root.display()
        )));
    }

    let file_name = target
        .file_name()
        .ok_or_else(|| TransferError::InvalidPath(format!("no file name: {relative}")))?;
    Ok(parent.join(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_path() {
        assert!(validate_relative_path("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_relative_path("../../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_nested_parent_dir_traversal() {
        assert!(validate_relative_path("sub/../../../escape").is_err());
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(validate_relative_path("/tmp/malicious").is_err());
    }

    #[test]
    fn accepts_subdirectory_path() {
        assert!(validate_relative_path("photos/2024/a.jpg").is_ok());
    }

    #[test]
    fn accepts_current_dir_prefix() {
        assert!(validate_relative_path("./a.jpg").is_ok());
    }

    #[test]
    fn resolve_creates_parents_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = resolve_within_root(dir.path(), "docs/q3/report.pdf").unwrap();
        assert!(path.starts_with(dir.path().canonicalize().unwrap()));
        assert!(path.parent().unwrap().is_dir());
        assert_eq!(path.file_name().unwrap(), "report.pdf");
    }

    #[test]
    fn resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_within_root(dir.path(), "../outside.txt").unwrap_err();
        assert!(matches!(err, TransferError::InvalidPath(_)));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_escape() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        let err = resolve_within_root(root.path(), "link/file.txt").unwrap_err();
        assert!(matches!(err, TransferError::InvalidPath(_)));
    }
}
