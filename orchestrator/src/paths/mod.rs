//! Host path resolution
//!
//! Host directories bound into containers are given as user-facing paths
//! (`~/.histomicstk/logs`). They are expanded, created when missing, and
//! canonicalised before use.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{DeployError, Result};

/// Replace a leading `~` with the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Expand, create if missing, and canonicalise a host directory
pub async fn resolve_dir(path: &Path) -> Result<PathBuf> {
    let expanded = expand_home(path);
    let to_error = |source| DeployError::Path {
        path: expanded.clone(),
        source,
    };

    if !tokio::fs::try_exists(&expanded).await.map_err(to_error)? {
        debug!(path = %expanded.display(), "Creating host directory");
        tokio::fs::create_dir_all(&expanded).await.map_err(to_error)?;
    }

    tokio::fs::canonicalize(&expanded).await.map_err(to_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(
            expand_home(Path::new("~/.histomicstk/logs")),
            home.join(".histomicstk/logs")
        );
        assert_eq!(expand_home(Path::new("~")), home);
        assert_eq!(expand_home(Path::new("/srv/logs")), PathBuf::from("/srv/logs"));
        assert_eq!(expand_home(Path::new("~other/x")), PathBuf::from("~other/x"));
    }

    #[tokio::test]
    async fn test_resolve_dir_creates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/logs");

        let resolved = resolve_dir(&target).await.unwrap();
        assert!(resolved.is_dir());
        assert!(resolved.is_absolute());
        assert_eq!(resolved, std::fs::canonicalize(&target).unwrap());
    }

    #[tokio::test]
    async fn test_resolve_dir_existing_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();

        let resolved = resolve_dir(dir.path()).await.unwrap();
        assert!(resolved.join("keep.txt").exists());
    }
}
