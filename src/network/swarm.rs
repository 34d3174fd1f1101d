use std::time::Duration;

use libp2p::futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::{
    gossipsub, identify, noise, swarm::SwarmEvent, tcp, yamux, Multiaddr, PeerId, Swarm,
    SwarmBuilder,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::network::behaviour::{SquadBehaviour, SquadBehaviourEvent};
use crate::network::{session_topic, NetworkCommand, NetworkEvent, Signal, SignalEnvelope};
use crate::session::bootstrap::{pick_advertised, SessionId};

const PROTOCOL_VERSION: &str = "squadlink/0.1.0";

pub fn build_swarm(keypair: &Keypair) -> Result<Swarm<SquadBehaviour>, Box<dyn std::error::Error>> {
    // Small squads: every member is one hop from the host, flood everything.
    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(5))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .mesh_n(2)
        .mesh_n_low(1)
        .mesh_n_high(4)
        .mesh_outbound_min(1)
        .flood_publish(true)
        .build()
        .map_err(|e| format!("GossipSub config error: {}", e))?;

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(keypair.clone()),
        gossipsub_config,
    )
    .map_err(|e| format!("GossipSub behaviour error: {}", e))?;

    let identify = identify::Behaviour::new(identify::Config::new(
        PROTOCOL_VERSION.to_string(),
        keypair.public(),
    ));

    let swarm = SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_quic()
        .with_dns()?
        .with_behaviour(|_key| SquadBehaviour { gossipsub, identify })?
        .with_swarm_config(|c: libp2p::swarm::Config| {
            c.with_idle_connection_timeout(Duration::from_secs(120))
        })
        .build();

    Ok(swarm)
}

/// Which session the swarm is currently signaling for.
enum Membership {
    Idle,
    Hosting {
        topic: gossipsub::IdentTopic,
        pending_reply: Option<oneshot::Sender<Result<SessionId, ConnectionError>>>,
    },
    Joining {
        topic: gossipsub::IdentTopic,
        host: PeerId,
        reachable: bool,
    },
}

impl Membership {
    fn topic(&self) -> Option<&gossipsub::IdentTopic> {
        match self {
            Membership::Idle => None,
            Membership::Hosting { topic, .. } | Membership::Joining { topic, .. } => Some(topic),
        }
    }
}

pub async fn run_event_loop(
    mut swarm: Swarm<SquadBehaviour>,
    mut cmd_rx: mpsc::Receiver<NetworkCommand>,
    net_tx: mpsc::Sender<NetworkEvent>,
    my_peer_id: String,
    listen_port: u16,
    advertise_addr: Option<String>,
) {
    let local_peer = *swarm.local_peer_id();
    let mut listen_error: Option<String> = None;
    for addr in [
        format!("/ip4/0.0.0.0/tcp/{}", listen_port),
        format!("/ip4/0.0.0.0/udp/{}/quic-v1", listen_port),
    ] {
        let result = addr
            .parse::<Multiaddr>()
            .map_err(|e| e.to_string())
            .and_then(|a| swarm.listen_on(a).map(|_| ()).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!("Failed to listen on {}: {}", addr, e);
            listen_error = Some(e);
        }
    }

    let advertised = match advertise_addr.as_deref().map(str::parse::<Multiaddr>) {
        Some(Ok(addr)) => Some(SessionId::for_listen_addr(&addr, local_peer)),
        Some(Err(e)) => {
            warn!("Ignoring invalid advertise address: {}", e);
            None
        }
        None => None,
    };

    let mut listen_addrs: Vec<Multiaddr> = Vec::new();
    let mut membership = Membership::Idle;

    loop {
        tokio::select! {
            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!("Listening on {}", address);
                        listen_addrs.push(address);
                        if let Membership::Hosting { pending_reply, .. } = &mut membership {
                            if let Some(reply) = pending_reply.take() {
                                let _ = reply.send(Ok(session_id_for(&advertised, &listen_addrs, local_peer)));
                            }
                        }
                    }
                    SwarmEvent::ExpiredListenAddr { address, .. } => {
                        listen_addrs.retain(|a| a != &address);
                    }
                    SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                        info!("Connected to {} via {}", peer_id, endpoint.get_remote_address());
                        match &membership {
                            Membership::Hosting { .. } => {
                                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                            }
                            Membership::Joining { host, .. } if *host == peer_id => {
                                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                            }
                            _ => {}
                        }
                    }
                    SwarmEvent::ConnectionClosed { peer_id, num_established, cause, .. } => {
                        info!("Disconnected from {} ({:?})", peer_id, cause);
                        if num_established == 0 {
                            swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                        }
                    }
                    SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                        warn!("Outgoing connection to {:?} failed: {}", peer_id, error);
                        if let Membership::Joining { host, reachable: false, .. } = &membership {
                            if peer_id == Some(*host) {
                                let _ = net_tx.send(NetworkEvent::HostUnreachable {
                                    reason: error.to_string(),
                                }).await;
                            }
                        }
                    }
                    SwarmEvent::Behaviour(SquadBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed {
                        peer_id,
                        topic,
                    })) => {
                        debug!("Peer {} subscribed to {}", peer_id, topic);
                        if let Membership::Joining { topic: ours, host, reachable } = &mut membership {
                            if peer_id == *host && topic == ours.hash() && !*reachable {
                                *reachable = true;
                                info!("Host {} is ready for signaling", host);
                                let _ = net_tx.send(NetworkEvent::HostReachable {
                                    host_peer_id: host.to_string(),
                                }).await;
                            }
                        }
                    }
                    SwarmEvent::Behaviour(SquadBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                        message,
                        propagation_source,
                        ..
                    })) => {
                        let Some(ours) = membership.topic() else { continue };
                        if message.topic != ours.hash() {
                            continue;
                        }
                        match serde_json::from_slice::<SignalEnvelope>(&message.data) {
                            Ok(envelope) if envelope.to_peer_id == my_peer_id => {
                                // Only the signer may speak for itself.
                                if message.source.map(|s| s.to_string()) != Some(envelope.from_peer_id.clone()) {
                                    warn!("Dropping signal with forged sender from {}", propagation_source);
                                    continue;
                                }
                                debug!("Signal {} from {}", signal_kind(&envelope.signal), envelope.from_peer_id);
                                let _ = net_tx.send(NetworkEvent::Signal {
                                    from_peer_id: envelope.from_peer_id,
                                    signal: envelope.signal,
                                }).await;
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Malformed signal from {}: {}", propagation_source, e),
                        }
                    }
                    SwarmEvent::Behaviour(SquadBehaviourEvent::Identify(identify::Event::Received {
                        peer_id,
                        info,
                        ..
                    })) => {
                        debug!("Identified peer: {} running {}", peer_id, info.protocol_version);
                    }
                    _ => {}
                }
            }
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    NetworkCommand::Host { reply } => {
                        leave(&mut swarm, &mut membership);
                        if let Some(e) = &listen_error {
                            if listen_addrs.is_empty() {
                                let _ = reply.send(Err(ConnectionError::ListenFailed(e.clone())));
                                continue;
                            }
                        }
                        let topic = gossipsub::IdentTopic::new(session_topic(&my_peer_id));
                        if let Err(e) = swarm.behaviour_mut().gossipsub.subscribe(&topic) {
                            let _ = reply.send(Err(ConnectionError::ListenFailed(e.to_string())));
                            continue;
                        }
                        info!("Hosting session on {}", topic);
                        let pending_reply = if listen_addrs.is_empty() && advertised.is_none() {
                            Some(reply)
                        } else {
                            let _ = reply.send(Ok(session_id_for(&advertised, &listen_addrs, local_peer)));
                            None
                        };
                        membership = Membership::Hosting { topic, pending_reply };
                    }
                    NetworkCommand::Join { session_id } => {
                        leave(&mut swarm, &mut membership);
                        let host = session_id.host_peer_id();
                        let topic = gossipsub::IdentTopic::new(session_topic(&host.to_string()));
                        if let Err(e) = swarm.behaviour_mut().gossipsub.subscribe(&topic) {
                            warn!("Failed to subscribe to {}: {}", topic, e);
                        }
                        info!("Dialing host {}", session_id);
                        if let Err(e) = swarm.dial(session_id.addr().clone()) {
                            let _ = net_tx.send(NetworkEvent::HostUnreachable { reason: e.to_string() }).await;
                        }
                        membership = Membership::Joining { topic, host, reachable: false };
                    }
                    NetworkCommand::SendSignal { to_peer_id, signal } => {
                        let Some(topic) = membership.topic().cloned() else {
                            warn!("Dropping {} for {}: no session", signal_kind(&signal), to_peer_id);
                            continue;
                        };
                        let envelope = SignalEnvelope {
                            from_peer_id: my_peer_id.clone(),
                            to_peer_id,
                            signal,
                        };
                        if let Ok(data) = serde_json::to_vec(&envelope) {
                            match swarm.behaviour_mut().gossipsub.publish(topic, data) {
                                Ok(_) => debug!("Sent {} to {}", signal_kind(&envelope.signal), envelope.to_peer_id),
                                Err(e) => warn!("Failed to send {}: {}", signal_kind(&envelope.signal), e),
                            }
                        }
                    }
                    NetworkCommand::Leave => leave(&mut swarm, &mut membership),
                }
            }
        }
    }
}

fn leave(swarm: &mut Swarm<SquadBehaviour>, membership: &mut Membership) {
    match std::mem::replace(membership, Membership::Idle) {
        Membership::Idle => {}
        Membership::Hosting { topic, pending_reply } => {
            if let Some(reply) = pending_reply {
                let _ = reply.send(Err(ConnectionError::ListenFailed("session left".to_string())));
            }
            let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
            info!("Stopped hosting");
        }
        Membership::Joining { topic, host, .. } => {
            let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
            swarm.behaviour_mut().gossipsub.remove_explicit_peer(&host);
            let _ = swarm.disconnect_peer_id(host);
            info!("Left session hosted by {}", host);
        }
    }
}

fn session_id_for(advertised: &Option<SessionId>, listen_addrs: &[Multiaddr], host: PeerId) -> SessionId {
    if let Some(id) = advertised {
        return id.clone();
    }
    match pick_advertised(listen_addrs) {
        Some(addr) => SessionId::for_listen_addr(addr, host),
        None => SessionId::for_listen_addr(&Multiaddr::empty(), host),
    }
}

fn signal_kind(signal: &Signal) -> &'static str {
    match signal {
        Signal::Offer { .. } => "offer",
        Signal::Answer { .. } => "answer",
        Signal::IceCandidate { .. } => "ice candidate",
    }
}
