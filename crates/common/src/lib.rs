use serde::{Deserialize, Serialize};

pub mod digest;

pub use digest::{Digest, DigestAlgorithm, DigestError, MultipleDigest};

pub const STEWARD_CMD_TOPIC: &str = "steward/cmd/v1";
pub const STEWARD_HEALTH_TOPIC: &str = "steward/hm/v1";
pub const STEWARD_REPLY_TOPIC: &str = "steward/reply/v1";

/// Inbound command addressed to one agent (or to every agent when `agent_id` is empty).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(default)]
    pub agent_id: String,
    /// Free-form reply address; echoed back in the response envelope.
    #[serde(default)]
    pub reply_to: String,
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Ping,
    GetState,
    FetchBlob { blob_id: String, digest: Digest },
    DeleteBlob { blob_id: String },
    InstallBundle {
        name: String,
        version: String,
        #[serde(default)]
        blob_id: Option<String>,
        #[serde(default)]
        digest: Option<Digest>,
    },
    EnableBundle { name: String, version: String },
    DisableBundle { name: String, version: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Ping => "ping",
            Action::GetState => "get_state",
            Action::FetchBlob { .. } => "fetch_blob",
            Action::DeleteBlob { .. } => "delete_blob",
            Action::InstallBundle { .. } => "install_bundle",
            Action::EnableBundle { .. } => "enable_bundle",
            Action::DisableBundle { .. } => "disable_bundle",
        }
    }

    /// Actions that change on-disk state and must survive an agent restart.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Action::Ping | Action::GetState)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl Response {
    pub fn value(request_id: impl Into<String>, value: serde_json::Value) -> Self {
        Self { request_id: request_id.into(), value: Some(value), exception: None }
    }

    pub fn exception(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), value: None, exception: Some(message.into()) }
    }
}

// ===================== Health reporting =====================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub deployment: String,
    pub job: Option<String>,
    pub index: Option<u32>,
    pub job_state: String,
    pub vitals: Vitals,
    pub node_id: String,
}

/// Point-in-time resource snapshot of the machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Vitals {
    pub cpu_percent: f32,
    pub mem_percent: u64,
    pub mem_kb: u64,
    pub swap_percent: u64,
    pub swap_kb: u64,
    pub load: [f64; 3],
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Alert,
    Critical,
    Error,
    Warning,
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    pub summary: String,
    /// Unix seconds.
    pub created_at: i64,
}

/// Failure notification as produced by the process supervisor, before normalisation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureEvent {
    pub id: String,
    pub service: String,
    pub event: String,
    pub action: String,
    /// RFC 2822 timestamp.
    pub date: String,
    pub description: String,
}

/// Identity of the workload this node runs, as last applied by the director.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ApplySpec {
    #[serde(default)]
    pub deployment: String,
    #[serde(default)]
    pub job: Option<JobRef>,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobRef {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

// ===================== Wire envelope =====================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Message {
    Heartbeat(Heartbeat),
    Alert(Alert),
    Response(Response),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Heartbeat(_) => "heartbeat",
            Message::Alert(_) => "alert",
            Message::Response(_) => "response",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub agent_id: String,
    pub target: String,
    pub message: Message,
}

pub fn serialize_message<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn deserialize_message<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_decodes_tagged_action() {
        let raw = br#"{"id":"r1","reply_to":"director","action":{"action":"fetch_blob","blob_id":"b1","digest":"sha256:00ff"}}"#;
        let req: Request = deserialize_message(raw).unwrap();
        assert_eq!(req.agent_id, "");
        match req.action {
            Action::FetchBlob { blob_id, digest } => {
                assert_eq!(blob_id, "b1");
                assert_eq!(digest.algorithm(), DigestAlgorithm::Sha256);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn install_bundle_blob_fields_are_optional() {
        let raw = br#"{"id":"r2","action":{"action":"install_bundle","name":"web","version":"1.2"}}"#;
        let req: Request = deserialize_message(raw).unwrap();
        assert!(req.action.is_persistent());
        assert_eq!(
            req.action,
            Action::InstallBundle { name: "web".into(), version: "1.2".into(), blob_id: None, digest: None }
        );
    }

    #[test]
    fn envelope_carries_message_kind() {
        let env = Envelope {
            agent_id: "a1".into(),
            target: "hm".into(),
            message: Message::Response(Response::value("r1", serde_json::json!("pong"))),
        };
        let v: serde_json::Value = serde_json::from_slice(&serialize_message(&env).unwrap()).unwrap();
        assert_eq!(v["message"]["kind"], "response");
        assert_eq!(v["message"]["payload"]["value"], "pong");
    }
}
