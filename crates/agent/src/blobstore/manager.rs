use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use common::Digest;

use super::{remove_if_exists, validate_blob_id, verify_staged, work_file, BlobError, BlobManager};

/// Directory-backed cache tier: `{dir}/{blob_id}`.
pub struct FsBlobManager {
    dir: PathBuf,
    work_dir: PathBuf,
}

impl FsBlobManager {
    pub fn new(dir: PathBuf, work_dir: PathBuf) -> Self {
        Self { dir, work_dir }
    }

    fn blob_path(&self, blob_id: &str) -> Result<PathBuf, BlobError> {
        validate_blob_id(blob_id)?;
        Ok(self.dir.join(blob_id))
    }
}

#[async_trait]
impl BlobManager for FsBlobManager {
    fn blob_exists(&self, blob_id: &str) -> bool {
        self.blob_path(blob_id).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Copy the cached blob into the work dir and verify the copy.
    async fn get_path(&self, blob_id: &str, digest: &Digest) -> anyhow::Result<PathBuf> {
        let src = self.blob_path(blob_id)?;
        let dst = work_file(&self.work_dir).await?;
        tokio::fs::copy(&src, &dst)
            .await
            .with_context(|| format!("copying blob {blob_id} out of {}", self.dir.display()))?;
        verify_staged(blob_id, digest, &dst).await?;
        Ok(dst)
    }

    /// Missing blobs count as deleted.
    async fn delete(&self, blob_id: &str) -> anyhow::Result<()> {
        let path = self.blob_path(blob_id)?;
        remove_if_exists(&path)
            .await
            .with_context(|| format!("deleting blob {blob_id} from {}", self.dir.display()))
    }

    async fn write(&self, blob_id: &str, src: &Path) -> anyhow::Result<()> {
        let path = self.blob_path(blob_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating tier dir {}", self.dir.display()))?;
        // Unique per write so concurrent writers of one blob never share a temp file.
        let tmp = self.dir.join(format!(".partial-{}", uuid::Uuid::new_v4()));
        let written = match tokio::fs::copy(src, &tmp).await {
            Ok(_) => tokio::fs::rename(&tmp, &path)
                .await
                .with_context(|| format!("publishing blob {blob_id} in {}", self.dir.display())),
            Err(e) => {
                Err(e).with_context(|| format!("writing blob {blob_id} into {}", self.dir.display()))
            }
        };
        if written.is_err() {
            let _ = remove_if_exists(&tmp).await;
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::DigestAlgorithm;

    #[tokio::test]
    async fn write_then_get_verifies_copy() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FsBlobManager::new(dir.path().join("tier"), dir.path().join("work"));
        let src = dir.path().join("src");
        std::fs::write(&src, b"payload").unwrap();

        assert!(!tier.blob_exists("b1"));
        tier.write("b1", &src).await.unwrap();
        assert!(tier.blob_exists("b1"));

        let digest = Digest::of_bytes(DigestAlgorithm::Sha256, b"payload");
        let copy = tier.get_path("b1", &digest).await.unwrap();
        assert!(copy.starts_with(dir.path().join("work")));
        assert_eq!(std::fs::read(&copy).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn concurrent_writes_of_one_blob_both_land() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FsBlobManager::new(dir.path().join("tier"), dir.path().join("work"));
        let src = dir.path().join("src");
        std::fs::write(&src, b"payload").unwrap();

        let (a, b) = tokio::join!(tier.write("b1", &src), tier.write("b1", &src));
        a.unwrap();
        b.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("tier"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["b1".to_string()]);
        assert!(!tier.blob_exists(".b1.partial"));
    }

    #[tokio::test]
    async fn corrupted_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FsBlobManager::new(dir.path().join("tier"), dir.path().join("work"));
        std::fs::create_dir_all(dir.path().join("tier")).unwrap();
        std::fs::write(dir.path().join("tier").join("b1"), b"bit rot").unwrap();

        let digest = Digest::of_bytes(DigestAlgorithm::Sha256, b"payload");
        let err = tier.get_path("b1", &digest).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<BlobError>(), Some(BlobError::DigestMismatch { .. })));
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FsBlobManager::new(dir.path().join("tier"), dir.path().join("work"));
        tier.delete("never-written").await.unwrap();
        assert!(tier.delete("../escape").await.is_err());
    }
}
