use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use common::{Digest, MultipleDigest};
use reqwest::StatusCode;
use tracing::debug;

use super::{
    remove_if_exists, validate_blob_id, verify_staged, work_file, write_through, BlobError, BlobManager,
    DigestBlobstore,
};

/// Remote store speaking plain HTTP verbs against `{base}/{blob_id}`.
pub struct HttpBlobstore {
    base: String,
    client: reqwest::Client,
    work_dir: PathBuf,
    cache: Option<Arc<dyn BlobManager>>,
}

impl HttpBlobstore {
    pub fn new(base: &str, work_dir: PathBuf, cache: Option<Arc<dyn BlobManager>>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("steward-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building blobstore HTTP client")?;
        Ok(Self { base: base.trim_end_matches('/').to_string(), client, work_dir, cache })
    }

    fn url(&self, blob_id: &str) -> String {
        format!("{}/{}", self.base, blob_id)
    }
}

#[async_trait]
impl DigestBlobstore for HttpBlobstore {
    async fn get(&self, blob_id: &str, digest: &Digest) -> anyhow::Result<PathBuf> {
        validate_blob_id(blob_id)?;
        let url = self.url(blob_id);
        let res = self.client.get(&url).send().await.with_context(|| format!("fetch {url}"))?;
        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound(blob_id.to_string()).into());
        }
        if !status.is_success() {
            return Err(anyhow!("fetch {}: {}", url, status));
        }
        let bytes = res.bytes().await.with_context(|| format!("reading body of {url}"))?;

        let dst = work_file(&self.work_dir).await?;
        tokio::fs::write(&dst, &bytes)
            .await
            .with_context(|| format!("staging blob {blob_id}"))?;
        verify_staged(blob_id, digest, &dst).await?;
        debug!(blob_id=%blob_id, size=bytes.len(), "Fetched blob from remote");
        write_through(self.cache.as_ref(), blob_id, &dst).await;
        Ok(dst)
    }

    async fn clean_up(&self, path: &Path) -> anyhow::Result<()> {
        remove_if_exists(path).await.with_context(|| format!("cleaning up {}", path.display()))
    }

    async fn create(&self, path: &Path) -> anyhow::Result<(String, MultipleDigest)> {
        let bytes = tokio::fs::read(path).await.with_context(|| format!("reading {}", path.display()))?;
        let p = path.to_path_buf();
        let digests = tokio::task::spawn_blocking(move || MultipleDigest::of_file(&p))
            .await
            .context("digest task")?
            .with_context(|| format!("hashing {}", path.display()))?;
        let blob_id = uuid::Uuid::new_v4().to_string();
        let url = self.url(&blob_id);
        let res = self.client.put(&url).body(bytes).send().await.with_context(|| format!("upload {url}"))?;
        if !res.status().is_success() {
            return Err(anyhow!("upload {}: {}", url, res.status()));
        }
        Ok((blob_id, digests))
    }

    /// A blob the remote no longer has counts as deleted.
    async fn delete(&self, blob_id: &str) -> anyhow::Result<()> {
        validate_blob_id(blob_id)?;
        let url = self.url(blob_id);
        let res = self.client.delete(&url).send().await.with_context(|| format!("delete {url}"))?;
        let status = res.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(anyhow!("delete {}: {}", url, status))
    }

    async fn validate(&self) -> anyhow::Result<()> {
        let parsed = reqwest::Url::parse(&self.base).with_context(|| format!("invalid blobstore url {}", self.base))?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            other => Err(anyhow!("unsupported blobstore scheme `{other}`")),
        }
    }
}
