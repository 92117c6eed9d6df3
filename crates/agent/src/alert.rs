use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use common::{Alert, FailureEvent, Severity};

use crate::settings::SettingsService;

/// Severity used for event names the table does not know.
pub const DEFAULT_SEVERITY: Severity = Severity::Critical;

/// Supervisor events that describe expected transitions rather than failures.
const IGNORED_EVENTS: &[&str] = &[
    "started",
    "stopped",
    "restarted",
    "action done",
    "monitor",
    "unmonitor",
];

const SEVERITIES: &[(&str, Severity)] = &[
    ("action done", Severity::Ignored),
    ("checksum changed", Severity::Warning),
    ("checksum failed", Severity::Critical),
    ("connection failed", Severity::Alert),
    ("connection succeeded", Severity::Ignored),
    ("content failed", Severity::Error),
    ("content succeeded", Severity::Ignored),
    ("data access error", Severity::Error),
    ("data access succeeded", Severity::Ignored),
    ("does not exist", Severity::Alert),
    ("execution failed", Severity::Alert),
    ("execution succeeded", Severity::Ignored),
    ("exists", Severity::Ignored),
    ("gid failed", Severity::Critical),
    ("gid succeeded", Severity::Ignored),
    ("icmp failed", Severity::Critical),
    ("icmp succeeded", Severity::Ignored),
    ("invalid type", Severity::Error),
    ("monit instance changed", Severity::Ignored),
    ("not monitored", Severity::Ignored),
    ("permission failed", Severity::Critical),
    ("permission succeeded", Severity::Ignored),
    ("pid failed", Severity::Critical),
    ("pid succeeded", Severity::Ignored),
    ("ppid failed", Severity::Critical),
    ("ppid succeeded", Severity::Ignored),
    ("resource limit matched", Severity::Error),
    ("resource limit succeeded", Severity::Ignored),
    ("size changed", Severity::Warning),
    ("size failed", Severity::Critical),
    ("timeout", Severity::Critical),
    ("timestamp changed", Severity::Warning),
    ("timestamp failed", Severity::Critical),
    ("type succeeded", Severity::Ignored),
    ("uid failed", Severity::Critical),
    ("uid succeeded", Severity::Ignored),
];

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Turns one supervisor failure event into a canonical [`Alert`].
pub struct FailureAdapter<'a> {
    event: &'a FailureEvent,
    settings: Arc<dyn SettingsService>,
    clock: Arc<dyn Clock>,
}

impl<'a> FailureAdapter<'a> {
    pub fn new(event: &'a FailureEvent, settings: Arc<dyn SettingsService>, clock: Arc<dyn Clock>) -> Self {
        Self { event, settings, clock }
    }

    pub fn is_ignorable(&self) -> bool {
        let name = normalize(&self.event.event);
        IGNORED_EVENTS.contains(&name.as_str())
    }

    /// Severity for the event and whether the name was recognised.
    pub fn severity(&self) -> (Severity, bool) {
        let name = normalize(&self.event.event);
        match SEVERITIES.iter().find(|(n, _)| *n == name) {
            Some((_, severity)) => (*severity, true),
            None => (DEFAULT_SEVERITY, false),
        }
    }

    pub fn alert(&self) -> anyhow::Result<Alert> {
        let settings = self.settings.settings().context("Getting settings")?;
        let (severity, _) = self.severity();
        Ok(Alert {
            id: self.event.id.clone(),
            severity,
            title: format!(
                "{} ({}) - {} - {}",
                self.event.service, settings.agent_id, self.event.event, self.event.action
            ),
            summary: self.event.description.clone(),
            created_at: self.created_at(),
        })
    }

    /// Event date when it parses as RFC 2822, otherwise the current time.
    fn created_at(&self) -> i64 {
        DateTime::parse_from_rfc2822(self.event.date.trim())
            .map(|d| d.timestamp())
            .unwrap_or_else(|_| self.clock.now().timestamp())
    }
}

fn normalize(event: &str) -> String {
    event.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSettings, FixedClock};

    fn event(name: &str, date: &str) -> FailureEvent {
        FailureEvent {
            id: "evt-1".into(),
            service: "nginx".into(),
            event: name.into(),
            action: "alert".into(),
            date: date.into(),
            description: "process is not running".into(),
        }
    }

    fn adapter(e: &FailureEvent) -> FailureAdapter<'_> {
        FailureAdapter::new(e, Arc::new(FakeSettings::default()), Arc::new(FixedClock(1_000)))
    }

    #[test]
    fn expected_transitions_are_ignorable() {
        for name in ["started", "Stopped", "action done"] {
            assert!(adapter(&event(name, "")).is_ignorable(), "{name}");
        }
        assert!(!adapter(&event("does not exist", "")).is_ignorable());
    }

    #[test]
    fn severity_lookup_and_default() {
        assert_eq!(adapter(&event("does not exist", "")).severity(), (Severity::Alert, true));
        assert_eq!(adapter(&event("Timestamp Changed", "")).severity(), (Severity::Warning, true));
        assert_eq!(adapter(&event("disk on fire", "")).severity(), (DEFAULT_SEVERITY, false));
    }

    #[test]
    fn alert_uses_event_date_and_identity() {
        let e = event("does not exist", "Sun, 22 May 2011 20:07:41 +0500");
        let alert = adapter(&e).alert().unwrap();
        assert_eq!(alert.id, "evt-1");
        assert_eq!(alert.title, "nginx (agent-1) - does not exist - alert");
        assert_eq!(alert.summary, "process is not running");
        assert_eq!(alert.created_at, 1_306_076_861);
    }

    #[test]
    fn unparseable_date_falls_back_to_clock() {
        let e = event("does not exist", "yesterday-ish");
        assert_eq!(adapter(&e).alert().unwrap().created_at, 1_000);
    }

    #[test]
    fn settings_failure_fails_alert() {
        let e = event("does not exist", "");
        let adapter = FailureAdapter::new(&e, Arc::new(FakeSettings { fail: true }), Arc::new(FixedClock(0)));
        let err = adapter.alert().unwrap_err();
        assert!(format!("{err:#}").contains("settings unavailable"));
    }
}
