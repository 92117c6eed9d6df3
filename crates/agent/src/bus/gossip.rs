use std::path::Path;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use common::{deserialize_message, serialize_message, Envelope, Message, Request, Response};
use futures::StreamExt;
use libp2p::{
    gossipsub, identify, identity, mdns, noise,
    swarm::{Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, SwarmBuilder,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use super::{is_addressed_to, DispatchFn, Handler, HEALTH_MONITOR};
use crate::settings::BusConfig;
use crate::state;

#[derive(libp2p::swarm::NetworkBehaviour)]
struct NodeBehaviour {
    gossipsub: gossipsub::Behaviour,
    mdns: mdns::tokio::Behaviour,
    identify: identify::Behaviour,
}

struct Outbound {
    topic: gossipsub::IdentTopic,
    payload: Vec<u8>,
    done: oneshot::Sender<anyhow::Result<()>>,
}

/// Gossipsub-backed bus: commands arrive on the command topic, heartbeats and alerts go to
/// the health topic, responses to the reply topic.
pub struct GossipHandler {
    agent_id: String,
    local_peer_id: PeerId,
    topic_cmd: gossipsub::IdentTopic,
    topic_health: gossipsub::IdentTopic,
    topic_reply: gossipsub::IdentTopic,
    swarm: Mutex<Option<Swarm<NodeBehaviour>>>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
}

fn load_or_create_node_key(path: &Path) -> anyhow::Result<identity::Keypair> {
    if let Ok(bytes) = std::fs::read(path) {
        match identity::Keypair::from_protobuf_encoding(&bytes) {
            Ok(kp) => return Ok(kp),
            Err(e) => warn!(path=%path.display(), error=%e, "Unreadable node key, generating a new one"),
        }
    }
    let kp = identity::Keypair::generate_ed25519();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let enc = kp.to_protobuf_encoding().context("encoding node key")?;
    std::fs::write(path, enc).with_context(|| format!("writing node key {}", path.display()))?;
    Ok(kp)
}

impl GossipHandler {
    pub fn new(config: &BusConfig, agent_id: String, data_dir: &Path) -> anyhow::Result<Self> {
        let id_keys = load_or_create_node_key(&state::node_key_path(data_dir))?;
        let local_peer_id = PeerId::from(id_keys.public());

        let gossip_config = gossipsub::ConfigBuilder::default()
            .max_transmit_size(1024 * 1024)
            .build()
            .map_err(|e| anyhow!("gossipsub config: {e}"))?;
        let mut gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(id_keys.clone()),
            gossip_config,
        )
        .map_err(|e| anyhow!(e))?;

        let topic_cmd = gossipsub::IdentTopic::new(config.command_topic.clone());
        let topic_health = gossipsub::IdentTopic::new(config.health_topic.clone());
        let topic_reply = gossipsub::IdentTopic::new(config.reply_topic.clone());
        gossipsub.subscribe(&topic_cmd)?;

        let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?;

        let mut id_cfg = identify::Config::new("steward/0.1".into(), id_keys.public());
        id_cfg.agent_version = format!("steward-agent v{} id={}", env!("CARGO_PKG_VERSION"), agent_id);
        let identify = identify::Behaviour::new(id_cfg);

        let behaviour = NodeBehaviour { gossipsub, mdns, identify };

        let mut swarm = SwarmBuilder::with_existing_identity(id_keys)
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
            .with_quic()
            .with_dns()?
            .with_behaviour(|_| Ok(behaviour))?
            .build();

        let listen_quic: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port)
            .parse()
            .map_err(|e| anyhow!("Failed to parse UDP multiaddr: {}", e))?;
        Swarm::listen_on(&mut swarm, listen_quic)?;
        let listen_tcp: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|e| anyhow!("Failed to parse TCP multiaddr: {}", e))?;
        Swarm::listen_on(&mut swarm, listen_tcp)?;

        for addr in &config.bootstrap {
            match addr.parse::<Multiaddr>() {
                Ok(ma) => {
                    if let Err(e) = swarm.dial(ma) {
                        warn!(%addr, error=%e, "Failed to dial bootstrap peer");
                    }
                }
                Err(e) => warn!(%addr, error=%e, "Ignoring malformed bootstrap address"),
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        Ok(Self {
            agent_id,
            local_peer_id,
            topic_cmd,
            topic_health,
            topic_reply,
            swarm: Mutex::new(Some(swarm)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn topic_for(&self, target: &str) -> gossipsub::IdentTopic {
        if target == HEALTH_MONITOR { self.topic_health.clone() } else { self.topic_reply.clone() }
    }

    fn envelope(&self, target: &str, message: Message) -> anyhow::Result<Vec<u8>> {
        serialize_message(&Envelope { agent_id: self.agent_id.clone(), target: target.to_string(), message })
    }
}

/// No subscribers yet or an identical message already in flight both count as delivered.
fn publish_result(res: Result<gossipsub::MessageId, gossipsub::PublishError>) -> anyhow::Result<()> {
    match res {
        Ok(_) | Err(gossipsub::PublishError::InsufficientPeers) | Err(gossipsub::PublishError::Duplicate) => Ok(()),
        Err(e) => Err(anyhow!("publish failed: {e}")),
    }
}

#[async_trait]
impl Handler for GossipHandler {
    async fn run(&self, dispatch: DispatchFn) -> anyhow::Result<()> {
        let mut swarm = self.swarm.lock().await.take().ok_or_else(|| anyhow!("bus handler is already running"))?;
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("bus handler is already running"))?;
        let (reply_tx, mut reply_rx) = mpsc::channel::<(String, Response)>(64);

        info!(peer_id=%self.local_peer_id, agent_id=%self.agent_id, "Message bus started");
        loop {
            tokio::select! {
                Some(out) = outbound_rx.recv() => {
                    let res = swarm.behaviour_mut().gossipsub.publish(out.topic, out.payload);
                    let _ = out.done.send(publish_result(res));
                }
                Some((reply_to, response)) = reply_rx.recv() => {
                    let request_id = response.request_id.clone();
                    match self.envelope(&reply_to, Message::Response(response)) {
                        Ok(payload) => {
                            let res = swarm.behaviour_mut().gossipsub.publish(self.topic_reply.clone(), payload);
                            if let Err(e) = publish_result(res) {
                                warn!(request_id=%request_id, error=%e, "Failed to publish response");
                            }
                        }
                        Err(e) => warn!(request_id=%request_id, error=%e, "Failed to encode response"),
                    }
                }
                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(ev)) => match ev {
                            mdns::Event::Discovered(list) => {
                                for (peer, _addr) in list {
                                    swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer);
                                }
                            }
                            mdns::Event::Expired(list) => {
                                for (peer, _addr) in list {
                                    swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer);
                                }
                            }
                        },
                        SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                            debug!(%peer_id, agent=%info.agent_version, "Identify received");
                        }
                        SwarmEvent::Behaviour(NodeBehaviourEvent::Gossipsub(gossipsub::Event::Message { propagation_source, message, .. })) => {
                            if message.topic != self.topic_cmd.hash() {
                                continue;
                            }
                            let request = match deserialize_message::<Request>(&message.data) {
                                Ok(r) => r,
                                Err(e) => {
                                    warn!(from=%propagation_source, error=%e, "Dropping undecodable request");
                                    continue;
                                }
                            };
                            if !is_addressed_to(&request, &self.agent_id) {
                                continue;
                            }
                            info!(from=%propagation_source, request_id=%request.id, action=%request.action.name(), "Received request");
                            let dispatch = dispatch.clone();
                            let reply_tx = reply_tx.clone();
                            tokio::spawn(async move {
                                let reply_to = request.reply_to.clone();
                                let response = dispatch(request).await;
                                let _ = reply_tx.send((reply_to, response)).await;
                            });
                        }
                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(dial=%format!("{address}/p2p/{}", self.local_peer_id), "listening");
                        }
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => debug!(%peer_id, "peer connected"),
                        SwarmEvent::ConnectionClosed { peer_id, .. } => debug!(%peer_id, "peer disconnected"),
                        _ => {}
                    }
                }
                else => break,
            }
        }
        Err(anyhow!("message bus loop ended"))
    }

    async fn send(&self, target: &str, message: Message) -> anyhow::Result<()> {
        let kind = message.kind();
        let payload = self.envelope(target, message)?;
        let (done, result) = oneshot::channel();
        self.outbound_tx
            .send(Outbound { topic: self.topic_for(target), payload, done })
            .await
            .map_err(|_| anyhow!("message bus is closed"))?;
        result
            .await
            .map_err(|_| anyhow!("message bus dropped {kind} before publishing"))?
            .with_context(|| format!("publishing {kind} to {target}"))
    }
}
