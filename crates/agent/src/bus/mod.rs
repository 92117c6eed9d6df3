use std::sync::Arc;

use async_trait::async_trait;
use common::{Message, Request, Response};
use futures::future::BoxFuture;

mod gossip;

pub use gossip::GossipHandler;

/// Bus target for heartbeats and alerts.
pub const HEALTH_MONITOR: &str = "hm";

pub type DispatchFn = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Message bus seam: receive requests for this agent, publish messages from it.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve inbound requests through `dispatch`; only returns when the bus stops.
    async fn run(&self, dispatch: DispatchFn) -> anyhow::Result<()>;
    async fn send(&self, target: &str, message: Message) -> anyhow::Result<()>;
}

/// Requests with an empty `agent_id` are broadcast to every agent.
pub(crate) fn is_addressed_to(request: &Request, agent_id: &str) -> bool {
    request.agent_id.is_empty() || request.agent_id == agent_id
}
