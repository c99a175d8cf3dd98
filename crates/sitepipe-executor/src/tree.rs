//! Moving artifact bundles to and from directories.

use bytes::Bytes;
use sitepipe_core::artifact::ArtifactBundle;
use sitepipe_core::{Error, Result};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Directories never copied into a bundle.
const SKIPPED_DIRS: &[&str] = &[".git"];

/// Read every regular file under `root` whose relative path passes `keep`.
///
/// Paths in the bundle use `/` separators and are relative to `root`.
pub fn read_tree(root: &Path, keep: impl Fn(&str) -> bool) -> Result<ArtifactBundle> {
    let mut bundle = ArtifactBundle::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && e.file_name()
                        .to_str()
                        .is_some_and(|name| SKIPPED_DIRS.contains(&name)))
        });

    for entry in walker {
        let entry =
            entry.map_err(|e| Error::Internal(format!("walking {}: {}", root.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !keep(&relative) {
            continue;
        }

        let content = std::fs::read(entry.path())
            .map_err(|e| Error::Internal(format!("reading {}: {}", entry.path().display(), e)))?;
        bundle.insert(relative, Bytes::from(content));
    }

    Ok(bundle)
}

/// Join a bundle path onto `root`, refusing paths that escape it.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(Error::ExecutionFailed(format!(
            "artifact path '{}' escapes the workspace",
            relative.display()
        )));
    }
    Ok(root.join(relative))
}

/// Write every file in `bundle` under `root`.
pub async fn write_tree(root: &Path, bundle: &ArtifactBundle) -> Result<()> {
    for (path, content) in bundle.iter() {
        let target = safe_join(root, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(format!("creating {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| Error::Internal(format!("writing {}: {}", target.display(), e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read_skips_git() {
        let dir = TempDir::new().unwrap();
        let bundle = ArtifactBundle::new()
            .with_file("index.html", "<html/>")
            .with_file("static/js/app.js", "app()")
            .with_file(".git/HEAD", "ref: refs/heads/master");

        write_tree(dir.path(), &bundle).await.unwrap();
        let read = read_tree(dir.path(), |_| true).unwrap();

        assert_eq!(read.len(), 2);
        assert_eq!(read.get("static/js/app.js").unwrap().as_ref(), b"app()");
        assert!(!read.contains(".git/HEAD"));
    }

    #[tokio::test]
    async fn test_read_with_filter() {
        let dir = TempDir::new().unwrap();
        let bundle = ArtifactBundle::new()
            .with_file("index.html", "a")
            .with_file("notes.txt", "b");
        write_tree(dir.path(), &bundle).await.unwrap();

        let read = read_tree(dir.path(), |p| p.ends_with(".html")).unwrap();
        assert_eq!(read.paths().collect::<Vec<_>>(), vec!["index.html"]);
    }

    #[test]
    fn test_safe_join() {
        let root = Path::new("/work");
        assert_eq!(safe_join(root, "a/b.txt").unwrap(), PathBuf::from("/work/a/b.txt"));
        assert!(safe_join(root, "../etc/passwd").is_err());
        assert!(safe_join(root, "/etc/passwd").is_err());
    }
}
