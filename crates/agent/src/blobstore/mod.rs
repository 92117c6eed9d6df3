use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use common::{Digest, DigestError, MultipleDigest};
use thiserror::Error;
use tracing::{debug, warn};

use crate::settings::AgentConfig;

mod cascading;
mod http;
mod local;
mod manager;

pub use cascading::CascadingBlobstore;
pub use http::HttpBlobstore;
pub use local::LocalBlobstore;
pub use manager::FsBlobManager;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob id `{0}`")]
    InvalidId(String),
    #[error("blob `{blob_id}` failed digest verification")]
    DigestMismatch {
        blob_id: String,
        #[source]
        source: DigestError,
    },
}

/// Blob store whose reads are checked against a caller-supplied digest.
///
/// `get` returns a path to a private copy of the blob; callers hand it back through
/// `clean_up` once done.
#[async_trait]
pub trait DigestBlobstore: Send + Sync {
    async fn get(&self, blob_id: &str, digest: &Digest) -> anyhow::Result<PathBuf>;
    async fn clean_up(&self, path: &Path) -> anyhow::Result<()>;
    async fn create(&self, path: &Path) -> anyhow::Result<(String, MultipleDigest)>;
    async fn delete(&self, blob_id: &str) -> anyhow::Result<()>;
    async fn validate(&self) -> anyhow::Result<()>;
}

/// One local cache tier.
#[async_trait]
pub trait BlobManager: Send + Sync {
    /// Cheap local probe; never fails.
    fn blob_exists(&self, blob_id: &str) -> bool;
    async fn get_path(&self, blob_id: &str, digest: &Digest) -> anyhow::Result<PathBuf>;
    async fn delete(&self, blob_id: &str) -> anyhow::Result<()>;
    async fn write(&self, blob_id: &str, src: &Path) -> anyhow::Result<()>;
}

/// Blob ids become file names; reject anything that could step outside a tier directory.
pub(crate) fn validate_blob_id(blob_id: &str) -> Result<(), BlobError> {
    let ok = !blob_id.is_empty()
        && blob_id != "."
        && blob_id != ".."
        && !blob_id.contains('/')
        && !blob_id.contains('\\')
        && !blob_id.contains('\0');
    if ok { Ok(()) } else { Err(BlobError::InvalidId(blob_id.to_string())) }
}

/// Fresh path inside the work directory for a private blob copy.
pub(crate) async fn work_file(work_dir: &Path) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(work_dir)
        .await
        .with_context(|| format!("creating work dir {}", work_dir.display()))?;
    Ok(work_dir.join(format!("blob-{}", uuid::Uuid::new_v4())))
}

/// Verify a staged copy off the async runtime; the copy is removed when it does not match.
pub(crate) async fn verify_staged(blob_id: &str, digest: &Digest, path: &Path) -> anyhow::Result<()> {
    let d = digest.clone();
    let p = path.to_path_buf();
    let res = tokio::task::spawn_blocking(move || d.verify_file(&p))
        .await
        .context("digest verification task")?;
    if let Err(source) = res {
        let _ = tokio::fs::remove_file(path).await;
        return Err(BlobError::DigestMismatch { blob_id: blob_id.to_string(), source }.into());
    }
    Ok(())
}

/// Best-effort write-through of a freshly fetched blob into a cache tier.
pub(crate) async fn write_through(cache: Option<&Arc<dyn BlobManager>>, blob_id: &str, staged: &Path) {
    if let Some(cache) = cache {
        match cache.write(blob_id, staged).await {
            Ok(()) => debug!(blob_id=%blob_id, "Cached fetched blob"),
            Err(e) => warn!(blob_id=%blob_id, error=%format!("{e:#}"), "Failed to cache fetched blob"),
        }
    }
}

pub(crate) async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Build the configured cascade: local tiers in order, then the remote store.
pub fn from_config(config: &AgentConfig) -> anyhow::Result<Arc<dyn DigestBlobstore>> {
    let work_dir = config.blob_work_dir();
    let tiers: Vec<Arc<dyn BlobManager>> = config
        .blobstore
        .tiers
        .iter()
        .map(|dir| Arc::new(FsBlobManager::new(dir.clone(), work_dir.clone())) as Arc<dyn BlobManager>)
        .collect();

    let cache = match config.blobstore.cache_tier {
        Some(i) => Some(
            tiers
                .get(i)
                .cloned()
                .with_context(|| format!("cache_tier {i} out of range ({} tiers)", tiers.len()))?,
        ),
        None => None,
    };

    let remote: Arc<dyn DigestBlobstore> = match config.blobstore.remote.as_deref() {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
            Arc::new(HttpBlobstore::new(url, work_dir.clone(), cache)?)
        }
        Some(url) => {
            let dir = url.strip_prefix("file:").unwrap_or(url);
            Arc::new(LocalBlobstore::new(PathBuf::from(dir), work_dir.clone(), cache))
        }
        None => Arc::new(LocalBlobstore::new(config.data_dir.join("blobs"), work_dir.clone(), cache)),
    };

    Ok(Arc::new(CascadingBlobstore::new(remote, tiers)))
}
