use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::{BackendKind, FetchError, StorageBackend, StoreError, StoredReference, LOCAL_PREFIX};

static ENTRY_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+\.png$").expect("entry name pattern is valid"));

/// Process-scoped temp directory served under `/files/`.
///
/// The directory is created once when the backend is built and removed when it
/// is dropped. Entry names are fresh UUIDs, so concurrent writers never share a
/// path. Files are never rewritten, which makes the modification time the
/// creation time used by [`LocalBackend::sweep`].
pub struct LocalBackend {
    dir: TempDir,
}

impl LocalBackend {
    pub fn create(parent: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix("pixelsense-")
            .tempdir_in(parent)?;
        info!("Local image store at {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Map an entry name to its path, rejecting anything that could escape the directory.
    pub fn entry_path(&self, name: &str) -> Result<PathBuf, FetchError> {
        if !ENTRY_NAME.is_match(name) {
            return Err(FetchError::InvalidName(name.to_string()));
        }
        Ok(self.dir.path().join(name))
    }

    /// Read an entry by name (used to serve `/files/{name}`).
    pub async fn read(&self, name: &str) -> Result<Vec<u8>, FetchError> {
        let path = self.entry_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(FetchError::NotFound(format!("{}{}", LOCAL_PREFIX, name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, name: &str) -> Result<(), FetchError> {
        let path = self.entry_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed local entry {}", name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(FetchError::NotFound(format!("{}{}", LOCAL_PREFIX, name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn entry_count(&self) -> std::io::Result<usize> {
        let mut entries = tokio::fs::read_dir(self.dir.path()).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Delete entries older than `ttl`. Returns how many were removed.
    pub async fn sweep(&self, ttl: Duration) -> std::io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(self.dir.path()).await?;

        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let age = match meta.modified().or_else(|_| meta.created()) {
                Ok(created) => now.duration_since(created).unwrap_or(Duration::ZERO),
                Err(_) => continue,
            };
            if age >= ttl {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to sweep {}: {}", entry.path().display(), e),
                }
            }
        }

        if removed > 0 {
            info!("Swept {} expired local images", removed);
        }
        Ok(removed)
    }

    /// Remove every entry, leaving the directory itself in place until drop.
    pub async fn purge(&self) -> std::io::Result<usize> {
        self.sweep(Duration::ZERO).await
    }

    /// Periodically sweep expired entries. The task ends once the backend is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, ttl: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(backend) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = backend.sweep(ttl).await {
                    warn!("Local image sweep failed: {}", e);
                }
            }
        });
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn name(&self) -> &'static str {
        "local"
    }

    async fn store(
        &self,
        bytes: &[u8],
        filename_hint: &str,
    ) -> Result<StoredReference, StoreError> {
        let name = format!("{}.png", uuid::Uuid::new_v4().simple());
        let path = self.dir.path().join(&name);
        tokio::fs::write(&path, bytes).await?;
        debug!("Wrote {} as {}", filename_hint, path.display());
        Ok(StoredReference::new(
            format!("{}{}", LOCAL_PREFIX, name),
            BackendKind::Local,
        ))
    }

    async fn fetch(&self, reference: &StoredReference) -> Result<Vec<u8>, FetchError> {
        let name = reference
            .local_name()
            .ok_or_else(|| FetchError::InvalidName(reference.location.clone()))?;
        self.read(name).await
    }

    async fn remove(&self, reference: &StoredReference) -> Result<(), FetchError> {
        let name = reference
            .local_name()
            .ok_or_else(|| FetchError::InvalidName(reference.location.clone()))?;
        self.delete(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_uses_hex_png_names() {
        let parent = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(parent.path()).unwrap();

        let a = backend.store(b"one", "a.png").await.unwrap();
        let b = backend.store(b"two", "a.png").await.unwrap();
        assert_ne!(a.location, b.location);

        let re = Regex::new(r"^/files/[0-9a-f]{32}\.png$").unwrap();
        assert!(re.is_match(&a.location), "{}", a.location);
        assert_eq!(backend.fetch(&a).await.unwrap(), b"one");
        assert_eq!(backend.fetch(&b).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let parent = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(parent.path()).unwrap();

        for name in ["../etc/passwd", "a/b.png", "x.jpg", "", ".png"] {
            assert!(
                matches!(backend.read(name).await, Err(FetchError::InvalidName(_))),
                "accepted {:?}",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_sweep_respects_ttl() {
        let parent = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(parent.path()).unwrap();
        backend.store(b"x", "x.png").await.unwrap();

        assert_eq!(backend.sweep(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(backend.entry_count().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.sweep(Duration::from_millis(1)).await.unwrap(), 1);
        assert_eq!(backend.entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_directory_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(parent.path()).unwrap();
        let dir = backend.path().to_path_buf();
        assert!(dir.exists());
        drop(backend);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let parent = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(parent.path()).unwrap();
        assert!(matches!(
            backend.delete("gone.png").await,
            Err(FetchError::NotFound(_))
        ));
    }
}
