use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use common::{Digest, MultipleDigest};
use tracing::{debug, warn};

use super::{BlobManager, DigestBlobstore};

/// Read-through cascade: local tiers in caller order, then one remote store.
///
/// Local tiers are only read from and deleted from; new content always goes to the remote.
pub struct CascadingBlobstore {
    inner: Arc<dyn DigestBlobstore>,
    blob_managers: Vec<Arc<dyn BlobManager>>,
}

impl CascadingBlobstore {
    pub fn new(inner: Arc<dyn DigestBlobstore>, blob_managers: Vec<Arc<dyn BlobManager>>) -> Self {
        Self { inner, blob_managers }
    }
}

#[async_trait]
impl DigestBlobstore for CascadingBlobstore {
    /// The first tier claiming the blob answers, including with an error: a tier that claims
    /// a blob it cannot produce is not skipped.
    async fn get(&self, blob_id: &str, digest: &Digest) -> anyhow::Result<PathBuf> {
        for (tier, manager) in self.blob_managers.iter().enumerate() {
            if manager.blob_exists(blob_id) {
                let path = manager.get_path(blob_id, digest).await?;
                debug!(blob_id=%blob_id, tier, "Found blob with BlobManager");
                return Ok(path);
            }
        }
        self.inner.get(blob_id, digest).await
    }

    async fn clean_up(&self, path: &Path) -> anyhow::Result<()> {
        self.inner.clean_up(path).await
    }

    async fn create(&self, path: &Path) -> anyhow::Result<(String, MultipleDigest)> {
        self.inner.create(path).await
    }

    async fn validate(&self) -> anyhow::Result<()> {
        self.inner.validate().await
    }

    /// Delete from the first tier that accepts the delete, then from the remote.
    /// If every tier fails, the last tier's error is returned and the remote is left alone.
    async fn delete(&self, blob_id: &str) -> anyhow::Result<()> {
        let mut last_err: Option<anyhow::Error> = None;
        for (tier, manager) in self.blob_managers.iter().enumerate() {
            match manager.delete(blob_id).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!(blob_id=%blob_id, tier, error=%format!("{e:#}"), "Tier delete failed");
                    last_err = Some(e);
                }
            }
        }

        if let Some(e) = last_err {
            return Err(e);
        }

        self.inner.delete(blob_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use common::DigestAlgorithm;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<String>>>;

    struct FakeTier {
        name: &'static str,
        exists: bool,
        get_fails: bool,
        delete_fails: bool,
        calls: Calls,
    }

    impl FakeTier {
        fn new(name: &'static str, calls: &Calls) -> Self {
            Self { name, exists: false, get_fails: false, delete_fails: false, calls: calls.clone() }
        }
    }

    #[async_trait]
    impl BlobManager for FakeTier {
        fn blob_exists(&self, _blob_id: &str) -> bool {
            self.calls.lock().unwrap().push(format!("{}.exists", self.name));
            self.exists
        }

        async fn get_path(&self, _blob_id: &str, _digest: &Digest) -> anyhow::Result<PathBuf> {
            self.calls.lock().unwrap().push(format!("{}.get_path", self.name));
            if self.get_fails {
                return Err(anyhow!("{} lost the blob", self.name));
            }
            Ok(PathBuf::from(format!("/{}/blob", self.name)))
        }

        async fn delete(&self, _blob_id: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("{}.delete", self.name));
            if self.delete_fails {
                return Err(anyhow!("{} delete failed", self.name));
            }
            Ok(())
        }

        async fn write(&self, _blob_id: &str, _src: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FakeRemote {
        calls: Calls,
    }

    #[async_trait]
    impl DigestBlobstore for FakeRemote {
        async fn get(&self, _blob_id: &str, _digest: &Digest) -> anyhow::Result<PathBuf> {
            self.calls.lock().unwrap().push("remote.get".into());
            Ok(PathBuf::from("/remote/blob"))
        }
        async fn clean_up(&self, _path: &Path) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("remote.clean_up".into());
            Ok(())
        }
        async fn create(&self, _path: &Path) -> anyhow::Result<(String, MultipleDigest)> {
            Err(anyhow!("not used"))
        }
        async fn delete(&self, _blob_id: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("remote.delete".into());
            Ok(())
        }
        async fn validate(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("remote.validate".into());
            Ok(())
        }
    }

    fn digest() -> Digest {
        Digest::of_bytes(DigestAlgorithm::Sha256, b"blob")
    }

    fn cascade(tiers: Vec<FakeTier>, calls: &Calls) -> CascadingBlobstore {
        CascadingBlobstore::new(
            Arc::new(FakeRemote { calls: calls.clone() }),
            tiers.into_iter().map(|t| Arc::new(t) as Arc<dyn BlobManager>).collect(),
        )
    }

    fn recorded(calls: &Calls) -> Vec<String> {
        calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn get_stops_at_first_tier_with_blob() {
        let calls = Calls::default();
        let t1 = FakeTier::new("t1", &calls);
        let t2 = FakeTier { exists: true, ..FakeTier::new("t2", &calls) };
        let t3 = FakeTier { exists: true, ..FakeTier::new("t3", &calls) };
        let store = cascade(vec![t1, t2, t3], &calls);

        let path = store.get("b1", &digest()).await.unwrap();
        assert_eq!(path, PathBuf::from("/t2/blob"));
        assert_eq!(recorded(&calls), vec!["t1.exists", "t2.exists", "t2.get_path"]);
    }

    #[tokio::test]
    async fn get_falls_back_to_remote() {
        let calls = Calls::default();
        let store = cascade(vec![FakeTier::new("t1", &calls), FakeTier::new("t2", &calls)], &calls);

        let path = store.get("b1", &digest()).await.unwrap();
        assert_eq!(path, PathBuf::from("/remote/blob"));
        assert_eq!(recorded(&calls), vec!["t1.exists", "t2.exists", "remote.get"]);
    }

    #[tokio::test]
    async fn get_surfaces_tier_error_without_fallback() {
        let calls = Calls::default();
        let t1 = FakeTier { exists: true, get_fails: true, ..FakeTier::new("t1", &calls) };
        let t2 = FakeTier { exists: true, ..FakeTier::new("t2", &calls) };
        let store = cascade(vec![t1, t2], &calls);

        let err = store.get("b1", &digest()).await.unwrap_err();
        assert!(err.to_string().contains("t1 lost the blob"));
        assert_eq!(recorded(&calls), vec!["t1.exists", "t1.get_path"]);
    }

    #[tokio::test]
    async fn delete_stops_after_first_successful_tier() {
        let calls = Calls::default();
        let t1 = FakeTier { delete_fails: true, ..FakeTier::new("t1", &calls) };
        let t2 = FakeTier::new("t2", &calls);
        let t3 = FakeTier::new("t3", &calls);
        let store = cascade(vec![t1, t2, t3], &calls);

        store.delete("b1").await.unwrap();
        assert_eq!(recorded(&calls), vec!["t1.delete", "t2.delete", "remote.delete"]);
    }

    #[tokio::test]
    async fn delete_with_all_tiers_failing_returns_last_error() {
        let calls = Calls::default();
        let t1 = FakeTier { delete_fails: true, ..FakeTier::new("t1", &calls) };
        let t2 = FakeTier { delete_fails: true, ..FakeTier::new("t2", &calls) };
        let store = cascade(vec![t1, t2], &calls);

        let err = store.delete("b1").await.unwrap_err();
        assert_eq!(err.to_string(), "t2 delete failed");
        assert_eq!(recorded(&calls), vec!["t1.delete", "t2.delete"]);
    }

    #[tokio::test]
    async fn delete_without_tiers_goes_to_remote() {
        let calls = Calls::default();
        let store = cascade(Vec::new(), &calls);
        store.delete("b1").await.unwrap();
        assert_eq!(recorded(&calls), vec!["remote.delete"]);
    }

    #[tokio::test]
    async fn maintenance_calls_pass_through() {
        let calls = Calls::default();
        let t1 = FakeTier { exists: true, ..FakeTier::new("t1", &calls) };
        let store = cascade(vec![t1], &calls);
        store.validate().await.unwrap();
        store.clean_up(Path::new("/tmp/x")).await.unwrap();
        assert_eq!(recorded(&calls), vec!["remote.validate", "remote.clean_up"]);
    }
}
