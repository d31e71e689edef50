//! Best-effort removal of generated asset files.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Removes the files behind generated asset URLs.
///
/// Implementations never fail: missing files are skipped and IO errors are
/// logged.
#[async_trait]
pub trait AssetPurger: Send + Sync {
    /// Removes the file behind `url`. Returns true if a file was deleted.
    async fn purge(&self, url: &str) -> bool;

    /// Removes every file in `urls`, returning how many were deleted.
    async fn purge_all(&self, urls: &[String]) -> usize {
        let mut deleted = 0;
        for url in urls {
            if self.purge(url).await {
                deleted += 1;
            }
        }
        deleted
    }
}

/// Serves assets from a local static directory.
///
/// URLs of the form `{url_prefix}videos/a.mp4` map to `{root}/videos/a.mp4`;
/// anything else is treated as remote and left alone.
#[derive(Debug, Clone)]
pub struct LocalAssetStore {
    root: PathBuf,
    url_prefix: String,
}

impl LocalAssetStore {
    /// Creates a store rooted at `root`, owning URLs starting with `url_prefix`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into(),
        }
    }

    /// Returns the static root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a local asset URL to its path, rejecting remote URLs and any
    /// path that would escape the root.
    #[must_use]
    pub fn local_path(&self, url: &str) -> Option<PathBuf> {
        let relative = url.strip_prefix(&self.url_prefix)?;
        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl AssetPurger for LocalAssetStore {
    async fn purge(&self, url: &str) -> bool {
        let Some(path) = self.local_path(url) else {
            debug!(url, "Not a local asset, skipping");
            return false;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "Deleted asset file");
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Asset file already gone");
                false
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete asset file");
                false
            }
        }
    }
}

/// A purger that deletes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAssetPurger;

#[async_trait]
impl AssetPurger for NoOpAssetPurger {
    async fn purge(&self, _url: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path_mapping() {
        let store = LocalAssetStore::new("/srv/static", "/static/");
        assert_eq!(
            store.local_path("/static/videos/a.mp4"),
            Some(PathBuf::from("/srv/static/videos/a.mp4"))
        );
        assert_eq!(store.local_path("https://cdn.example.com/a.png"), None);
        assert_eq!(store.local_path("/static/../etc/passwd"), None);
    }

    #[tokio::test]
    async fn test_purge_deletes_local_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::write(dir.path().join("images/hero.png"), b"png").unwrap();

        let store = LocalAssetStore::new(dir.path(), "/static/");
        assert!(store.purge("/static/images/hero.png").await);
        assert!(!dir.path().join("images/hero.png").exists());
    }

    #[tokio::test]
    async fn test_purge_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalAssetStore::new(dir.path(), "/static/");
        assert!(!store.purge("/static/images/missing.png").await);
        assert!(!store.purge("https://remote/asset.png").await);
    }

    #[tokio::test]
    async fn test_purge_all_counts_deleted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"a").unwrap();
        std::fs::write(dir.path().join("b.png"), b"b").unwrap();

        let store = LocalAssetStore::new(dir.path(), "/static/");
        let urls = vec![
            "/static/a.png".to_string(),
            "/static/b.png".to_string(),
            "/static/c.png".to_string(),
        ];
        assert_eq!(store.purge_all(&urls).await, 2);
    }
}
