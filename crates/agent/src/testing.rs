//! Hand-written fakes for the agent's collaborators.

use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::{ApplySpec, FailureEvent, Message, Request, Response, Vitals};

use crate::alert::Clock;
use crate::bus::{DispatchFn, Handler};
use crate::dispatcher::ActionDispatcher;
use crate::platform::{CanRebooter, VitalsService};
use crate::settings::{Settings, SettingsService, SpecService};
use crate::supervisor::{JobFailureHandler, JobSupervisor};

#[derive(Default)]
pub struct SpyHandler {
    pub run_calls: Mutex<usize>,
    pub sent: Mutex<Vec<(String, Message)>>,
    /// `run` returns this error instead of serving forever.
    pub run_error: Option<String>,
    pub fail_sends: bool,
}

impl SpyHandler {
    pub fn sent(&self) -> Vec<(String, Message)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn heartbeats(&self) -> usize {
        self.sent().iter().filter(|(_, m)| matches!(m, Message::Heartbeat(_))).count()
    }
}

#[async_trait]
impl Handler for SpyHandler {
    async fn run(&self, _dispatch: DispatchFn) -> anyhow::Result<()> {
        *self.run_calls.lock().unwrap() += 1;
        match &self.run_error {
            Some(msg) => Err(anyhow!("{msg}")),
            None => std::future::pending().await,
        }
    }

    async fn send(&self, target: &str, message: Message) -> anyhow::Result<()> {
        if self.fail_sends {
            return Err(anyhow!("bus unavailable"));
        }
        self.sent.lock().unwrap().push((target.to_string(), message));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDispatcher {
    pub resume_calls: Mutex<usize>,
    pub resume_error: Option<String>,
}

#[async_trait]
impl ActionDispatcher for FakeDispatcher {
    async fn resume_previously_dispatched_tasks(&self) -> anyhow::Result<()> {
        *self.resume_calls.lock().unwrap() += 1;
        match &self.resume_error {
            Some(msg) => Err(anyhow!("{msg}")),
            None => Ok(()),
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        Response::value(request.id, serde_json::json!("ok"))
    }
}

#[derive(Default)]
pub struct FakeSupervisor {
    pub recorded: Mutex<Vec<String>>,
    /// Delivered to the failure handler as soon as monitoring starts.
    pub events: Vec<FailureEvent>,
    pub panic_in_monitor: bool,
}

#[async_trait]
impl JobSupervisor for FakeSupervisor {
    async fn status(&self) -> String {
        "running".to_string()
    }

    async fn health_recorder(&self, status: &str) {
        self.recorded.lock().unwrap().push(status.to_string());
    }

    async fn monitor_job_failures(&self, handler: JobFailureHandler) -> anyhow::Result<()> {
        if self.panic_in_monitor {
            panic!("supervisor link exploded");
        }
        for event in self.events.clone() {
            handler(event).await?;
        }
        std::future::pending().await
    }
}

#[derive(Default)]
pub struct FakeVitals {
    pub fail: bool,
    /// Fail only the first sample.
    pub fail_first: bool,
    pub calls: Mutex<usize>,
}

#[async_trait]
impl VitalsService for FakeVitals {
    async fn get(&self) -> anyhow::Result<Vitals> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if self.fail || (self.fail_first && call == 1) {
            return Err(anyhow!("no /proc"));
        }
        Ok(Vitals { cpu_percent: 12.5, mem_percent: 40, ..Vitals::default() })
    }
}

#[derive(Default)]
pub struct FakeSpecService {
    pub spec: ApplySpec,
}

#[async_trait]
impl SpecService for FakeSpecService {
    async fn get(&self) -> anyhow::Result<ApplySpec> {
        Ok(self.spec.clone())
    }
}

pub struct FakeCanRebooter {
    pub result: Result<bool, String>,
}

#[async_trait]
impl CanRebooter for FakeCanRebooter {
    async fn can_reboot(&self) -> anyhow::Result<bool> {
        self.result.clone().map_err(|msg| anyhow!("{msg}"))
    }
}

#[derive(Default)]
pub struct FakeSettings {
    pub fail: bool,
}

impl SettingsService for FakeSettings {
    fn settings(&self) -> anyhow::Result<Settings> {
        if self.fail {
            return Err(anyhow!("settings unavailable"));
        }
        Ok(Settings { agent_id: "agent-1".into() })
    }
}

pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0, 0).single().unwrap_or_default()
    }
}

pub fn failure_event(name: &str) -> FailureEvent {
    FailureEvent {
        id: "evt-1".into(),
        service: "nginx".into(),
        event: name.into(),
        action: "restart".into(),
        date: "Sun, 22 May 2011 20:07:41 +0500".into(),
        description: "process is not running".into(),
    }
}
