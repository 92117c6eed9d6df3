use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use common::{Action, Digest, Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::blobstore::DigestBlobstore;
use crate::bundle::{BundleCollection, FileBundle};
use crate::settings::SpecService;
use crate::state;
use crate::supervisor::JobSupervisor;

#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    /// Re-run mutating requests that were accepted but never finished.
    async fn resume_previously_dispatched_tasks(&self) -> anyhow::Result<()>;
    async fn dispatch(&self, request: Request) -> Response;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TaskRecord {
    request_id: String,
    action: Action,
    started_at: i64,
}

pub struct TaskDispatcher {
    agent_id: String,
    bundles: BundleCollection,
    blobstore: Arc<dyn DigestBlobstore>,
    supervisor: Arc<dyn JobSupervisor>,
    spec_service: Arc<dyn SpecService>,
    tasks_path: PathBuf,
    tasks_lock: Mutex<()>,
    bundle_lock: tokio::sync::Mutex<()>,
}

impl TaskDispatcher {
    pub fn new(
        agent_id: String,
        bundles: BundleCollection,
        blobstore: Arc<dyn DigestBlobstore>,
        supervisor: Arc<dyn JobSupervisor>,
        spec_service: Arc<dyn SpecService>,
        data_dir: &std::path::Path,
    ) -> Self {
        Self {
            agent_id,
            bundles,
            blobstore,
            supervisor,
            spec_service,
            tasks_path: state::tasks_path(data_dir),
            tasks_lock: Mutex::new(()),
            bundle_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn load_tasks(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(state::read_json::<Vec<TaskRecord>>(&self.tasks_path)?.unwrap_or_default())
    }

    fn record_task(&self, request_id: &str, action: &Action) -> anyhow::Result<()> {
        let _guard = self.tasks_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut tasks = self.load_tasks()?;
        tasks.retain(|t| t.request_id != request_id);
        tasks.push(TaskRecord {
            request_id: request_id.to_string(),
            action: action.clone(),
            started_at: chrono::Utc::now().timestamp(),
        });
        state::write_json(&self.tasks_path, &tasks)
    }

    fn forget_task(&self, request_id: &str) -> anyhow::Result<()> {
        let _guard = self.tasks_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut tasks = self.load_tasks()?;
        tasks.retain(|t| t.request_id != request_id);
        state::write_json(&self.tasks_path, &tasks)
    }

    async fn execute(&self, action: &Action) -> anyhow::Result<Value> {
        match action {
            Action::Ping => Ok(json!("pong")),
            Action::GetState => {
                let spec = self.spec_service.get().await.context("Getting job spec")?;
                Ok(json!({
                    "agent_id": self.agent_id,
                    "job_state": self.supervisor.status().await,
                    "deployment": spec.deployment,
                    "job": spec.job.map(|j| j.name),
                    "index": spec.index,
                    "node_id": spec.node_id,
                }))
            }
            Action::FetchBlob { blob_id, digest } => {
                let path = self.blobstore.get(blob_id, digest).await.with_context(|| format!("Fetching blob {blob_id}"))?;
                let size = tokio::fs::metadata(&path)
                    .await
                    .map(|m| m.len())
                    .with_context(|| format!("Reading size of fetched blob {blob_id}"));
                self.blobstore.clean_up(&path).await?;
                let size = size?;
                Ok(json!({ "blob_id": blob_id, "size": size }))
            }
            Action::DeleteBlob { blob_id } => {
                self.blobstore.delete(blob_id).await.with_context(|| format!("Deleting blob {blob_id}"))?;
                Ok(json!("deleted"))
            }
            Action::InstallBundle { name, version, blob_id, digest } => {
                let _lock = self.bundle_lock.lock().await;
                let bundle = self.bundles.get(name, version)?;
                let path = match (blob_id, digest) {
                    (Some(id), Some(d)) => self.install_from_blob(bundle, id, d).await?,
                    (None, None) => run_blocking(move || bundle.install_without_contents().map_err(Into::into)).await?,
                    _ => return Err(anyhow!("install_bundle needs both blob_id and digest, or neither")),
                };
                info!(bundle=%name, %version, path=%path.display(), "Installed bundle");
                Ok(json!({ "install_path": path }))
            }
            Action::EnableBundle { name, version } => {
                let _lock = self.bundle_lock.lock().await;
                let bundle = self.bundles.get(name, version)?;
                match self.bundles.enabled_version(name)? {
                    Some(current) if current == *version => {
                        return Ok(json!({ "enable_path": bundle.enable_path() }));
                    }
                    Some(current) => {
                        let previous = self.bundles.get(name, &current)?;
                        run_blocking(move || previous.disable().map_err(Into::into)).await?;
                    }
                    None => {}
                }
                let path = run_blocking(move || bundle.enable().map_err(Into::into)).await?;
                info!(bundle=%name, %version, "Enabled bundle");
                Ok(json!({ "enable_path": path }))
            }
            Action::DisableBundle { name, version } => {
                let _lock = self.bundle_lock.lock().await;
                let bundle = self.bundles.get(name, version)?;
                run_blocking(move || bundle.disable().map_err(Into::into)).await?;
                info!(bundle=%name, %version, "Disabled bundle");
                Ok(json!("disabled"))
            }
        }
    }

    async fn install_from_blob(&self, bundle: FileBundle, blob_id: &str, digest: &Digest) -> anyhow::Result<PathBuf> {
        if bundle.is_installed() {
            return Ok(bundle.get_install_path()?);
        }
        let archive = self.blobstore.get(blob_id, digest).await.with_context(|| format!("Fetching blob {blob_id}"))?;
        let staged = archive.clone();
        let res = run_blocking(move || bundle.install_with_contents(&staged).map_err(Into::into)).await;
        if let Err(e) = self.blobstore.clean_up(&archive).await {
            warn!(path=%archive.display(), error=%format!("{e:#}"), "Failed to clean up fetched blob");
        }
        res
    }

    async fn run_action(&self, request_id: &str, action: &Action) -> anyhow::Result<Value> {
        let persistent = action.is_persistent();
        if persistent {
            self.record_task(request_id, action).context("Recording dispatched task")?;
        }
        let res = self.execute(action).await;
        if persistent {
            if let Err(e) = self.forget_task(request_id) {
                warn!(request_id=%request_id, error=%format!("{e:#}"), "Failed to clear finished task");
            }
        }
        res
    }
}

async fn run_blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.context("bundle task")?
}

#[async_trait]
impl ActionDispatcher for TaskDispatcher {
    async fn resume_previously_dispatched_tasks(&self) -> anyhow::Result<()> {
        let tasks = {
            let _guard = self.tasks_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.load_tasks().context("Loading dispatched tasks")?
        };
        if tasks.is_empty() {
            return Ok(());
        }
        info!(count = tasks.len(), "Resuming previously dispatched tasks");
        for task in tasks {
            match self.run_action(&task.request_id, &task.action).await {
                Ok(_) => info!(request_id=%task.request_id, action=%task.action.name(), "Resumed task finished"),
                Err(e) => warn!(request_id=%task.request_id, action=%task.action.name(), error=%format!("{e:#}"), "Resumed task failed"),
            }
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Response {
        let action = request.action.name();
        match self.run_action(&request.id, &request.action).await {
            Ok(value) => Response::value(request.id, value),
            Err(e) => {
                warn!(request_id=%request.id, %action, error=%format!("{e:#}"), "Action failed");
                Response::exception(request.id, format!("{action}: {e:#}"))
            }
        }
    }
}
