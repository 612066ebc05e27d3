//! Image store proxy
//!
//! Images are persisted through an ordered list of [`StorageBackend`]s. A store
//! request walks the list and returns the first reference any backend hands
//! back; soft failures are logged and the next backend is tried. In the default
//! setup the external image host comes first and the process-local temp
//! directory is the last resort.

pub mod imgbb;
pub mod local;

pub use imgbb::ImgbbBackend;
pub use local::LocalBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::imaging::{prepare_image_async, ImageError, PreparedImage};

/// URL prefix under which local entries are served.
pub const LOCAL_PREFIX: &str = "/files/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    External,
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::External => "external",
            BackendKind::Local => "local",
        }
    }
}

/// Where an image lives after a successful store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReference {
    pub location: String,
    pub backend: BackendKind,
    pub created_at: DateTime<Utc>,
}

impl StoredReference {
    pub fn new(location: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            location: location.into(),
            backend,
            created_at: Utc::now(),
        }
    }

    /// Classify a reference string coming back from a client.
    pub fn parse(location: &str) -> Self {
        let location = location.trim();
        let backend = if location.starts_with(LOCAL_PREFIX) {
            BackendKind::Local
        } else {
            BackendKind::External
        };
        Self::new(location, backend)
    }

    pub fn is_local(&self) -> bool {
        self.backend == BackendKind::Local
    }

    /// File name of a local entry (`/files/<name>` → `<name>`).
    pub fn local_name(&self) -> Option<&str> {
        if !self.is_local() {
            return None;
        }
        self.location.strip_prefix(LOCAL_PREFIX)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("Upload request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Image host returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed image host response: {0}")]
    MalformedResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("All storage backends failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Stored image not found: {0}")]
    NotFound(String),

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("Fetch request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Fetching {url} returned {status}")]
    Status { status: u16, url: String },

    #[error("No storage backend handles {0} references")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] ImageError),
}

/// A place images can be written to and read back from.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &'static str;

    /// False when the backend lacks what it needs (credentials) and will always refuse.
    fn is_configured(&self) -> bool {
        true
    }

    async fn store(&self, bytes: &[u8], filename_hint: &str)
        -> Result<StoredReference, StoreError>;

    async fn fetch(&self, reference: &StoredReference) -> Result<Vec<u8>, FetchError>;

    async fn remove(&self, _reference: &StoredReference) -> Result<(), FetchError> {
        Ok(())
    }
}

pub struct ImageStore {
    backends: Vec<Arc<dyn StorageBackend>>,
    local: Arc<LocalBackend>,
    max_dim: u32,
}

impl ImageStore {
    /// `backends` are tried in order. The local backend is always appended last.
    pub fn new(
        mut backends: Vec<Arc<dyn StorageBackend>>,
        local: Arc<LocalBackend>,
        max_dim: u32,
    ) -> Self {
        backends.push(local.clone());
        Self {
            backends,
            local,
            max_dim,
        }
    }

    /// External host first, then the local temp directory.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let local = Arc::new(LocalBackend::create(&config.storage.temp_parent())?);
        let imgbb: Arc<dyn StorageBackend> = Arc::new(ImgbbBackend::new(&config.storage)?);
        Ok(Self::new(vec![imgbb], local, config.image.max_dim))
    }

    pub fn local(&self) -> &Arc<LocalBackend> {
        &self.local
    }

    pub fn max_dim(&self) -> u32 {
        self.max_dim
    }

    /// Whether an external host is configured ahead of the local fallback.
    pub fn has_external(&self) -> bool {
        self.backends
            .iter()
            .any(|b| b.kind() == BackendKind::External && b.is_configured())
    }

    pub async fn store(
        &self,
        bytes: &[u8],
        filename_hint: &str,
    ) -> Result<StoredReference, StoreError> {
        self.store_in(self.backends.iter(), bytes, filename_hint).await
    }

    /// Publish through the external hosts only. Nothing is written locally,
    /// so a failure leaves no file behind.
    pub async fn publish_external(
        &self,
        bytes: &[u8],
        filename_hint: &str,
    ) -> Result<StoredReference, StoreError> {
        let external = self
            .backends
            .iter()
            .filter(|b| b.kind() == BackendKind::External);
        self.store_in(external, bytes, filename_hint).await
    }

    async fn store_in<'a>(
        &self,
        backends: impl Iterator<Item = &'a Arc<dyn StorageBackend>>,
        bytes: &[u8],
        filename_hint: &str,
    ) -> Result<StoredReference, StoreError> {
        let mut failures = Vec::new();

        for backend in backends {
            match backend.store(bytes, filename_hint).await {
                Ok(reference) => {
                    info!(
                        "Stored {} ({} bytes) via {}: {}",
                        filename_hint,
                        bytes.len(),
                        backend.name(),
                        reference.location
                    );
                    return Ok(reference);
                }
                Err(StoreError::NotConfigured(what)) => {
                    debug!("Skipping {}: {} not configured", backend.name(), what);
                    failures.push(format!("{}: not configured", backend.name()));
                }
                Err(e) => {
                    warn!("Storage backend {} failed, trying next: {}", backend.name(), e);
                    failures.push(format!("{}: {}", backend.name(), e));
                }
            }
        }

        Err(StoreError::Exhausted(failures))
    }

    /// Write straight to the local temp directory.
    pub async fn store_local(&self, bytes: &[u8]) -> Result<StoredReference, StoreError> {
        self.local.store(bytes, "upload.png").await
    }

    /// Resolve a reference back to prepared image bytes.
    pub async fn retrieve(&self, reference: &StoredReference) -> Result<PreparedImage, FetchError> {
        let backend = self
            .backends
            .iter()
            .find(|b| b.kind() == reference.backend)
            .ok_or(FetchError::Unsupported(reference.backend.as_str()))?;

        let raw = backend.fetch(reference).await?;
        let prepared = prepare_image_async(raw, self.max_dim).await?;
        Ok(prepared)
    }

    /// Drop a local entry. External entries are left alone.
    pub async fn discard(&self, reference: &StoredReference) -> Result<(), FetchError> {
        if reference.is_local() {
            self.local.remove(reference).await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::prepare_image;
    use crate::imaging::tests::jpeg_bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StorageBackend for FailingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::External
        }

        fn name(&self) -> &'static str {
            "failing"
        }

        async fn store(&self, _: &[u8], _: &str) -> Result<StoredReference, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Status {
                status: 503,
                body: "unavailable".to_string(),
            })
        }

        async fn fetch(&self, r: &StoredReference) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::NotFound(r.location.clone()))
        }
    }

    struct AcceptingBackend;

    #[async_trait]
    impl StorageBackend for AcceptingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::External
        }

        fn name(&self) -> &'static str {
            "accepting"
        }

        async fn store(&self, _: &[u8], hint: &str) -> Result<StoredReference, StoreError> {
            Ok(StoredReference::new(
                format!("https://img.example/{}", hint),
                BackendKind::External,
            ))
        }

        async fn fetch(&self, r: &StoredReference) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::NotFound(r.location.clone()))
        }
    }

    fn local(dir: &tempfile::TempDir) -> Arc<LocalBackend> {
        Arc::new(LocalBackend::create(dir.path()).unwrap())
    }

    #[test]
    fn test_parse_reference() {
        let r = StoredReference::parse("/files/abc.png");
        assert_eq!(r.backend, BackendKind::Local);
        assert_eq!(r.local_name(), Some("abc.png"));

        let r = StoredReference::parse("https://i.ibb.co/x/y.png");
        assert_eq!(r.backend, BackendKind::External);
        assert_eq!(r.local_name(), None);
    }

    #[tokio::test]
    async fn test_falls_back_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let failing = Arc::new(FailingBackend {
            calls: AtomicUsize::new(0),
        });
        let store = ImageStore::new(
            vec![failing.clone() as Arc<dyn StorageBackend>],
            local(&dir),
            1024,
        );

        let prepared = prepare_image(&jpeg_bytes(64, 32), 1024).unwrap();
        let reference = store.store(&prepared.bytes, "photo.png").await.unwrap();

        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(reference.backend, BackendKind::Local);
        let name = reference.local_name().unwrap();
        assert!(store.local().path().join(name).exists());
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(
            vec![Arc::new(AcceptingBackend) as Arc<dyn StorageBackend>],
            local(&dir),
            1024,
        );

        let reference = store.store(b"bytes", "x.png").await.unwrap();
        assert_eq!(reference.backend, BackendKind::External);
        assert_eq!(reference.location, "https://img.example/x.png");
        assert_eq!(store.local().entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_external_never_writes_locally() {
        let dir = tempfile::tempdir().unwrap();
        let failing = Arc::new(FailingBackend {
            calls: AtomicUsize::new(0),
        });
        let store = ImageStore::new(
            vec![failing.clone() as Arc<dyn StorageBackend>],
            local(&dir),
            1024,
        );

        let err = store.publish_external(b"bytes", "q.png").await.unwrap_err();
        assert!(matches!(err, StoreError::Exhausted(ref f) if f.len() == 1));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.local().entry_count().await.unwrap(), 0);

        let accepting = ImageStore::new(
            vec![Arc::new(AcceptingBackend) as Arc<dyn StorageBackend>],
            local(&dir),
            1024,
        );
        let reference = accepting.publish_external(b"bytes", "q.png").await.unwrap();
        assert_eq!(reference.backend, BackendKind::External);
    }

    #[tokio::test]
    async fn test_retrieve_round_trips_prepared_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(vec![], local(&dir), 1024);

        let original = jpeg_bytes(1800, 900);
        let prepared = prepare_image(&original, 1024).unwrap();
        let reference = store.store(&prepared.bytes, "p.png").await.unwrap();

        let retrieved = store.retrieve(&reference).await.unwrap();
        assert_eq!(retrieved, prepared);
    }

    #[tokio::test]
    async fn test_retrieve_missing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(vec![], local(&dir), 1024);

        let err = store
            .retrieve(&StoredReference::parse("/files/missing.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retrieve_external_without_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(vec![], local(&dir), 1024);

        let err = store
            .retrieve(&StoredReference::parse("https://example.com/a.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unsupported("external")));
    }

    #[tokio::test]
    async fn test_discard_removes_local_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(vec![], local(&dir), 1024);

        let reference = store.store_local(b"not really png").await.unwrap();
        assert_eq!(store.local().entry_count().await.unwrap(), 1);

        store.discard(&reference).await.unwrap();
        assert_eq!(store.local().entry_count().await.unwrap(), 0);

        // external references are ignored
        store
            .discard(&StoredReference::parse("https://example.com/a.png"))
            .await
            .unwrap();
    }
}
