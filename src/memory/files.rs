//! Restricted file reads for memory content.
//!
//! Collaborators may read MEMORY.md, HEARTBEAT.md, anything under
//! memory/, and the configured extra paths. Everything else is denied,
//! and only markdown files may be read at all.

use std::path::{Path, PathBuf};

use crate::error::{KeeperError, Result};

/// Read a window of lines from an allowed markdown file.
///
/// `from_line` is 1-indexed; `num_lines == 0` reads to the end of the
/// file. Paths outside the allowed set fail with a permission error.
pub fn read_file(
    workspace: &Path,
    extra_paths: &[PathBuf],
    path: &Path,
    from_line: usize,
    num_lines: usize,
) -> Result<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("md") {
        return Err(KeeperError::Permission(format!(
            "only markdown files may be read: {}",
            path.display()
        )));
    }

    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    };

    let canonical = resolved
        .canonicalize()
        .map_err(|_| KeeperError::NotFound(format!("{}", resolved.display())))?;

    if !is_allowed(workspace, extra_paths, &canonical) {
        return Err(KeeperError::Permission(format!(
            "path is outside the readable set: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&canonical)?;
    let start = from_line.saturating_sub(1);
    let window: Vec<&str> = if num_lines == 0 {
        content.lines().skip(start).collect()
    } else {
        content.lines().skip(start).take(num_lines).collect()
    };

    Ok(window.join("\n"))
}

fn is_allowed(workspace: &Path, extra_paths: &[PathBuf], canonical: &Path) -> bool {
    let workspace = match workspace.canonicalize() {
        Ok(p) => p,
        Err(_) => return false,
    };

    if canonical == workspace.join("MEMORY.md") || canonical == workspace.join("HEARTBEAT.md") {
        return true;
    }
    if canonical.starts_with(workspace.join("memory")) {
        return true;
    }

    extra_paths.iter().any(|extra| {
        extra
            .canonicalize()
            .map(|e| canonical.starts_with(&e))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "line one\nline two\nline three").unwrap();
        std::fs::write(dir.path().join("secret.md"), "hidden").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not markdown").unwrap();
        std::fs::create_dir(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory").join("daily.md"), "entry").unwrap();
        dir
    }

    #[test]
    fn test_reads_memory_md_window() {
        let dir = setup();
        let text = read_file(dir.path(), &[], Path::new("MEMORY.md"), 2, 1).unwrap();
        assert_eq!(text, "line two");

        let rest = read_file(dir.path(), &[], Path::new("MEMORY.md"), 2, 0).unwrap();
        assert_eq!(rest, "line two\nline three");
    }

    #[test]
    fn test_reads_under_memory_dir() {
        let dir = setup();
        let text = read_file(dir.path(), &[], Path::new("memory/daily.md"), 1, 0).unwrap();
        assert_eq!(text, "entry");
    }

    #[test]
    fn test_denies_workspace_file_outside_allowed_set() {
        let dir = setup();
        let err = read_file(dir.path(), &[], Path::new("secret.md"), 1, 0).unwrap_err();
        assert!(matches!(err, KeeperError::Permission(_)));
    }

    #[test]
    fn test_denies_non_markdown() {
        let dir = setup();
        let err = read_file(dir.path(), &[], Path::new("notes.txt"), 1, 0).unwrap_err();
        assert!(matches!(err, KeeperError::Permission(_)));
    }

    #[test]
    fn test_denies_traversal_out_of_memory_dir() {
        let dir = setup();
        let err = read_file(dir.path(), &[], Path::new("memory/../secret.md"), 1, 0).unwrap_err();
        assert!(matches!(err, KeeperError::Permission(_)));
    }

    #[test]
    fn test_extra_path_allows_reads() {
        let dir = setup();
        let extra = tempfile::tempdir().unwrap();
        std::fs::write(extra.path().join("shared.md"), "shared notes").unwrap();

        let denied = read_file(
            dir.path(),
            &[],
            &extra.path().join("shared.md"),
            1,
            0,
        );
        assert!(denied.is_err());

        let text = read_file(
            dir.path(),
            &[extra.path().to_path_buf()],
            &extra.path().join("shared.md"),
            1,
            0,
        )
        .unwrap();
        assert_eq!(text, "shared notes");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = setup();
        let err = read_file(dir.path(), &[], Path::new("memory/absent.md"), 1, 0).unwrap_err();
        assert!(matches!(err, KeeperError::NotFound(_)));
    }
}
