use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use common::{FailureEvent, Heartbeat, Message};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alert::{Clock, FailureAdapter};
use crate::bus::{DispatchFn, Handler, HEALTH_MONITOR};
use crate::dispatcher::ActionDispatcher;
use crate::platform::{CanRebooter, VitalsService};
use crate::settings::{SettingsService, SpecService};
use crate::supervisor::{JobFailureHandler, JobSupervisor};

/// Room for one report per loop before a sender waits.
const ERROR_CHANNEL_CAPACITY: usize = 3;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Refusing to boot")]
    RefusingToStart,
}

type ErrorSender = mpsc::Sender<anyhow::Error>;

#[derive(Clone)]
pub struct Agent {
    handler: Arc<dyn Handler>,
    dispatcher: Arc<dyn ActionDispatcher>,
    supervisor: Arc<dyn JobSupervisor>,
    spec_service: Arc<dyn SpecService>,
    vitals: Arc<dyn VitalsService>,
    settings: Arc<dyn SettingsService>,
    clock: Arc<dyn Clock>,
    can_rebooter: Arc<dyn CanRebooter>,
    heartbeat_interval: Duration,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler: Arc<dyn Handler>,
        dispatcher: Arc<dyn ActionDispatcher>,
        supervisor: Arc<dyn JobSupervisor>,
        spec_service: Arc<dyn SpecService>,
        vitals: Arc<dyn VitalsService>,
        settings: Arc<dyn SettingsService>,
        clock: Arc<dyn Clock>,
        can_rebooter: Arc<dyn CanRebooter>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            handler,
            dispatcher,
            supervisor,
            spec_service,
            vitals,
            settings,
            clock,
            can_rebooter,
            heartbeat_interval,
        }
    }

    /// Run until one of the loops fails; the first reported error is returned.
    ///
    /// The remaining loops are not cancelled and keep running until the runtime shuts down.
    pub async fn run(&self) -> anyhow::Result<()> {
        let bootable = self
            .can_rebooter
            .can_reboot()
            .await
            .context("Failed to check if agent can be rebooted")?;
        if !bootable {
            return Err(AgentError::RefusingToStart.into());
        }

        self.dispatcher
            .resume_previously_dispatched_tasks()
            .await
            .context("Resuming previously dispatched tasks")?;

        let (err_tx, mut err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let agent = self.clone();
        let tx = err_tx.clone();
        spawn_guarded("Message Bus Handler", err_tx.clone(), async move {
            agent.subscribe_action_dispatcher(tx).await
        });

        let agent = self.clone();
        let tx = err_tx.clone();
        spawn_guarded("Generate Heartbeats", err_tx.clone(), async move { agent.generate_heartbeats(tx).await });

        let agent = self.clone();
        let tx = err_tx.clone();
        spawn_guarded("Monitor Job Failures", err_tx, async move { agent.monitor_job_failures(tx).await });

        info!(interval_secs = self.heartbeat_interval.as_secs(), "Agent started");
        match err_rx.recv().await {
            Some(err) => Err(err),
            None => Err(anyhow!("agent loops exited without reporting an error")),
        }
    }

    async fn subscribe_action_dispatcher(&self, errors: ErrorSender) {
        let dispatcher = self.dispatcher.clone();
        let dispatch: DispatchFn = Arc::new(move |request| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(request).await }.boxed()
        });

        let err = match self.handler.run(dispatch).await {
            Ok(()) => anyhow!("message bus handler stopped"),
            Err(e) => e,
        };
        report(&errors, err.context("Message Bus Handler")).await;
    }

    async fn generate_heartbeats(&self, errors: ErrorSender) {
        debug!("Generating heartbeats");
        self.send_and_record_heartbeat(&errors).await;

        let mut ticker = tokio::time::interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.send_and_record_heartbeat(&errors).await;
        }
    }

    async fn send_and_record_heartbeat(&self, errors: &ErrorSender) {
        let status = self.supervisor.status().await;
        let heartbeat = match self.build_heartbeat(&status).await {
            Ok(hb) => hb,
            Err(e) => {
                report(errors, e.context("Building heartbeat")).await;
                return;
            }
        };
        self.supervisor.health_recorder(&status).await;

        if let Err(e) = self.handler.send(HEALTH_MONITOR, Message::Heartbeat(heartbeat)).await {
            report(errors, e.context("Sending heartbeat")).await;
        }
    }

    async fn build_heartbeat(&self, status: &str) -> anyhow::Result<Heartbeat> {
        let vitals = self.vitals.get().await.context("Getting job vitals")?;
        let spec = self.spec_service.get().await.context("Getting job spec")?;
        Ok(Heartbeat {
            deployment: spec.deployment,
            job: spec.job.map(|j| j.name),
            index: spec.index,
            job_state: status.to_string(),
            vitals,
            node_id: spec.node_id,
        })
    }

    async fn monitor_job_failures(&self, errors: ErrorSender) {
        let agent = self.clone();
        let tx = errors.clone();
        let handler: JobFailureHandler = Arc::new(move |event| {
            let agent = agent.clone();
            let tx = tx.clone();
            async move { agent.handle_job_failure(event, &tx).await }.boxed()
        });

        let err = match self.supervisor.monitor_job_failures(handler).await {
            Ok(()) => anyhow!("job failure monitor stopped"),
            Err(e) => e,
        };
        report(&errors, err.context("Monitoring job failures")).await;
    }

    /// Turn a supervisor event into an alert. Problems go to the error channel; the
    /// supervisor always sees success.
    async fn handle_job_failure(&self, event: FailureEvent, errors: &ErrorSender) -> anyhow::Result<()> {
        let adapter = FailureAdapter::new(&event, self.settings.clone(), self.clock.clone());
        if adapter.is_ignorable() {
            debug!(event=%event.event, service=%event.service, "Ignored job failure event");
            return Ok(());
        }

        let (severity, found) = adapter.severity();
        if !found {
            warn!(event=%event.event, ?severity, "Unknown job failure event, using default severity");
        }

        let alert = match adapter.alert() {
            Ok(alert) => alert,
            Err(e) => {
                report(errors, e.context("Adapting alert")).await;
                return Ok(());
            }
        };

        if let Err(e) = self.handler.send(HEALTH_MONITOR, Message::Alert(alert)).await {
            report(errors, e.context("Sending alert")).await;
        }
        Ok(())
    }
}

async fn report(errors: &ErrorSender, err: anyhow::Error) {
    error!(error=%format!("{err:#}"), "Agent error");
    let _ = errors.send(err).await;
}

/// Spawn a loop and turn a panic inside it into a reported error.
fn spawn_guarded<F>(name: &'static str, errors: ErrorSender, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(fut);
    tokio::spawn(async move {
        match task.await {
            Ok(()) => debug!(loop_name = name, "Agent loop finished"),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(loop_name = name, panic = %msg, "Agent loop panicked");
                let _ = errors.send(anyhow!("{name} panicked: {msg}")).await;
            }
            Err(e) => warn!(loop_name = name, error = %e, "Agent loop cancelled"),
        }
    });
}
