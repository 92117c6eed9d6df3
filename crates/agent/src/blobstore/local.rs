use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use common::{Digest, MultipleDigest};
use tracing::debug;

use super::{
    remove_if_exists, validate_blob_id, verify_staged, work_file, write_through, BlobError, BlobManager,
    DigestBlobstore,
};

/// Authoritative store kept in a directory, e.g. a shared mount (`file:/mnt/blobs`).
pub struct LocalBlobstore {
    dir: PathBuf,
    work_dir: PathBuf,
    cache: Option<Arc<dyn BlobManager>>,
}

impl LocalBlobstore {
    pub fn new(dir: PathBuf, work_dir: PathBuf, cache: Option<Arc<dyn BlobManager>>) -> Self {
        Self { dir, work_dir, cache }
    }
}

#[async_trait]
impl DigestBlobstore for LocalBlobstore {
    async fn get(&self, blob_id: &str, digest: &Digest) -> anyhow::Result<PathBuf> {
        validate_blob_id(blob_id)?;
        let src = self.dir.join(blob_id);
        let exists = tokio::fs::try_exists(&src)
            .await
            .with_context(|| format!("checking for blob {blob_id} in {}", self.dir.display()))?;
        if !exists {
            return Err(BlobError::NotFound(blob_id.to_string()).into());
        }
        let dst = work_file(&self.work_dir).await?;
        tokio::fs::copy(&src, &dst)
            .await
            .with_context(|| format!("copying blob {blob_id} from {}", self.dir.display()))?;
        verify_staged(blob_id, digest, &dst).await?;
        write_through(self.cache.as_ref(), blob_id, &dst).await;
        Ok(dst)
    }

    async fn clean_up(&self, path: &Path) -> anyhow::Result<()> {
        remove_if_exists(path).await.with_context(|| format!("cleaning up {}", path.display()))
    }

    async fn create(&self, path: &Path) -> anyhow::Result<(String, MultipleDigest)> {
        let p = path.to_path_buf();
        let digests = tokio::task::spawn_blocking(move || MultipleDigest::of_file(&p))
            .await
            .context("digest task")?
            .with_context(|| format!("hashing {}", path.display()))?;
        let blob_id = uuid::Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating blobstore dir {}", self.dir.display()))?;
        tokio::fs::copy(path, self.dir.join(&blob_id))
            .await
            .with_context(|| format!("storing {} as blob {blob_id}", path.display()))?;
        debug!(blob_id=%blob_id, "Created blob");
        Ok((blob_id, digests))
    }

    async fn delete(&self, blob_id: &str) -> anyhow::Result<()> {
        validate_blob_id(blob_id)?;
        remove_if_exists(&self.dir.join(blob_id))
            .await
            .with_context(|| format!("deleting blob {blob_id} from {}", self.dir.display()))
    }

    async fn validate(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("blobstore dir {} is not usable", self.dir.display()))
    }
}
