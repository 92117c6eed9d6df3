use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use common::FailureEvent;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::settings::JobConfig;
use crate::state;

pub type JobFailureHandler = Arc<dyn Fn(FailureEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[async_trait]
pub trait JobSupervisor: Send + Sync {
    /// Aggregate job state: `running`, `starting` or `failing`.
    async fn status(&self) -> String;
    async fn health_recorder(&self, status: &str);
    /// Start the jobs, then feed their failure events to `handler` until the event source goes away.
    async fn monitor_job_failures(&self, handler: JobFailureHandler) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum JobState {
    Starting,
    Running,
    Failing,
}

type SharedStates = Arc<Mutex<BTreeMap<String, JobState>>>;

#[derive(Serialize)]
struct HealthRecord<'a> {
    state: &'a str,
    updated_at: i64,
    jobs: BTreeMap<String, JobState>,
}

/// Runs configured jobs as child processes and restarts them when they exit.
pub struct ProcessSupervisor {
    jobs: Vec<JobConfig>,
    health_path: PathBuf,
    states: SharedStates,
    events_tx: mpsc::UnboundedSender<FailureEvent>,
    events_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<FailureEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    pub fn new(jobs: Vec<JobConfig>, data_dir: &std::path::Path) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let states = jobs.iter().map(|j| (j.name.clone(), JobState::Starting)).collect();
        Self {
            jobs,
            health_path: state::health_path(data_dir),
            states: Arc::new(Mutex::new(states)),
            events_tx,
            events_rx: tokio::sync::Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Launch one restart loop per job.
    fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for job in &self.jobs {
            let handle = tokio::spawn(run_job(job.clone(), self.states.clone(), self.events_tx.clone()));
            tasks.push(handle);
            info!(job=%job.name, command=%job.command, "Job supervised");
        }
    }

    /// Abort the restart loops; running children are killed with them.
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(states: &SharedStates, job: &str, state: JobState) {
    let mut s = states.lock().unwrap_or_else(|e| e.into_inner());
    s.insert(job.to_string(), state);
}

fn failure_event(job: &str, event: &str, action: &str, description: String) -> FailureEvent {
    FailureEvent {
        id: uuid::Uuid::new_v4().to_string(),
        service: job.to_string(),
        event: event.to_string(),
        action: action.to_string(),
        date: chrono::Utc::now().to_rfc2822(),
        description,
    }
}

async fn run_job(job: JobConfig, states: SharedStates, events: mpsc::UnboundedSender<FailureEvent>) {
    let delay = Duration::from_secs(job.restart_delay_secs);
    let mut restarts: u64 = 0;
    loop {
        let spawned = tokio::process::Command::new(&job.command)
            .args(&job.args)
            .envs(&job.env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let event = match spawned {
            Ok(mut child) => {
                set_state(&states, &job.name, JobState::Running);
                if restarts > 0 {
                    let _ = events.send(failure_event(
                        &job.name,
                        "exists",
                        "alert",
                        format!("process is running after {restarts} restart(s)"),
                    ));
                }
                let description = match child.wait().await {
                    Ok(status) => format!("process exited: {status}"),
                    Err(e) => format!("waiting on process failed: {e}"),
                };
                warn!(job=%job.name, %description, "Job exited");
                failure_event(&job.name, "does not exist", "restart", description)
            }
            Err(e) => {
                warn!(job=%job.name, error=%e, "Job failed to start");
                failure_event(&job.name, "execution failed", "restart", format!("failed to execute {}: {e}", job.command))
            }
        };
        set_state(&states, &job.name, JobState::Failing);
        if events.send(event).is_err() {
            debug!(job=%job.name, "No failure monitor listening");
        }

        tokio::time::sleep(delay).await;
        restarts += 1;
    }
}

#[async_trait]
impl JobSupervisor for ProcessSupervisor {
    async fn status(&self) -> String {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let status = if states.values().any(|s| *s == JobState::Failing) {
            "failing"
        } else if states.values().any(|s| *s == JobState::Starting) {
            "starting"
        } else {
            "running"
        };
        status.to_string()
    }

    async fn health_recorder(&self, status: &str) {
        let jobs = self.states.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let record = HealthRecord { state: status, updated_at: chrono::Utc::now().timestamp(), jobs };
        if let Err(e) = state::write_json(&self.health_path, &record) {
            warn!(error=%format!("{e:#}"), "Failed to record health");
        }
    }

    async fn monitor_job_failures(&self, handler: JobFailureHandler) -> anyhow::Result<()> {
        let mut rx = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("job failures are already being monitored"))?;
        self.start();
        while let Some(event) = rx.recv().await {
            debug!(job=%event.service, event=%event.event, "Job failure event");
            if let Err(e) = handler(event).await {
                warn!(error=%format!("{e:#}"), "Job failure handler failed");
            }
        }
        Err(anyhow!("job failure event channel closed"))
    }
}
