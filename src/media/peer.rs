use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as WrtcMediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::ConnectionError;

/// Label of the ordered data channel carrying sync messages.
pub const SYNC_CHANNEL_LABEL: &str = "squad-sync";

type Channels = Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>;

/// Events emitted by peer connections back to the session loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// WebRTC connection state changed.
    ConnectionStateChanged {
        peer_id: String,
        state: RTCPeerConnectionState,
    },
    /// The sync channel to this peer is open and writable.
    ChannelOpen { peer_id: String },
    /// One sync message, in channel order.
    ChannelMessage { peer_id: String, data: Vec<u8> },
    ChannelClosed { peer_id: String },
    /// Received an audio track from a remote peer.
    RemoteTrack {
        peer_id: String,
        track: Arc<TrackRemote>,
    },
    /// ICE candidate gathered, must be sent to the remote peer.
    IceCandidate { peer_id: String, candidate: String },
}

/// Owns one WebRTC peer connection per squad member: an ordered sync
/// channel plus the voice call.
pub struct PeerManager {
    connections: HashMap<String, Arc<RTCPeerConnection>>,
    /// Sync channels (peer_id -> channel). Shared with `on_data_channel`
    /// callbacks so the answerer can send too.
    data_channels: Channels,
    /// `None` when the session runs without local audio.
    local_track: Option<Arc<TrackLocalStaticSample>>,
    event_tx: mpsc::Sender<PeerEvent>,
    ice_servers: Vec<String>,
}

impl PeerManager {
    pub fn new(event_tx: mpsc::Sender<PeerEvent>, ice_servers: Vec<String>, with_audio: bool) -> Self {
        let local_track = with_audio.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: 1,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                "audio-track".to_string(),
                "squadlink-voice".to_string(),
            ))
        });

        Self {
            connections: HashMap::new(),
            data_channels: Arc::new(Mutex::new(HashMap::new())),
            local_track,
            event_tx,
            ice_servers,
        }
    }

    /// Get a reference to the local audio track for writing samples.
    pub fn local_track(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.local_track.as_ref()
    }

    /// Send to each recipient's sync channel in turn, optionally skipping
    /// one peer. Channels that are not open are skipped silently.
    pub async fn broadcast(&self, recipients: &HashSet<String>, data: &[u8], except: Option<&str>) {
        let data = Bytes::copy_from_slice(data);
        let channels = self.data_channels.lock().await;
        for pid in recipients {
            if except == Some(pid.as_str()) {
                continue;
            }
            let Some(dc) = channels.get(pid) else { continue };
            if dc.ready_state() != RTCDataChannelState::Open {
                debug!("Skipping {}: sync channel not open", pid);
                continue;
            }
            if let Err(e) = dc.send(&data).await {
                debug!("Failed to send sync message to {}: {}", pid, e);
            }
        }
    }

    pub async fn send_to(&self, peer_id: &str, data: &[u8]) {
        let channels = self.data_channels.lock().await;
        match channels.get(peer_id) {
            Some(dc) if dc.ready_state() == RTCDataChannelState::Open => {
                if let Err(e) = dc.send(&Bytes::copy_from_slice(data)).await {
                    debug!("Failed to send sync message to {}: {}", peer_id, e);
                }
            }
            _ => debug!("Dropping sync message to {}: channel not open", peer_id),
        }
    }

    /// Create a new peer connection and return its SDP offer.
    pub async fn create_offer(&mut self, peer_id: &str) -> Result<String, ConnectionError> {
        let pc = self.create_peer_connection(peer_id).await?;

        // The offerer owns the sync channel; it must be ordered.
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(SYNC_CHANNEL_LABEL, Some(init))
            .await
            .map_err(|e| pc_error("Failed to create data channel", e))?;

        Self::setup_data_channel(&self.data_channels, &self.event_tx, peer_id, dc).await;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| pc_error("Failed to create offer", e))?;

        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| pc_error("Failed to set local description", e))?;

        let sdp = serde_json::to_string(&offer).map_err(|e| pc_error("Failed to serialize SDP", e))?;

        info!("Created WebRTC offer for peer {}", peer_id);
        Ok(sdp)
    }

    /// Handle an incoming SDP offer and return an answer.
    pub async fn handle_offer(&mut self, peer_id: &str, sdp_json: &str) -> Result<String, ConnectionError> {
        let offer: RTCSessionDescription =
            serde_json::from_str(sdp_json).map_err(|e| pc_error("Failed to parse offer SDP", e))?;

        // A fresh offer from a known peer means it reconnected.
        let pc = self.create_peer_connection(peer_id).await?;

        pc.set_remote_description(offer)
            .await
            .map_err(|e| pc_error("Failed to set remote description", e))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| pc_error("Failed to create answer", e))?;

        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| pc_error("Failed to set local description", e))?;

        let sdp = serde_json::to_string(&answer).map_err(|e| pc_error("Failed to serialize answer SDP", e))?;

        info!("Created WebRTC answer for peer {}", peer_id);
        Ok(sdp)
    }

    /// Handle an incoming SDP answer.
    pub async fn handle_answer(&mut self, peer_id: &str, sdp_json: &str) -> Result<(), ConnectionError> {
        let answer: RTCSessionDescription =
            serde_json::from_str(sdp_json).map_err(|e| pc_error("Failed to parse answer SDP", e))?;

        let pc = self
            .connections
            .get(peer_id)
            .ok_or_else(|| ConnectionError::PeerConnection(format!("No peer connection for {}", peer_id)))?;

        pc.set_remote_description(answer)
            .await
            .map_err(|e| pc_error("Failed to set remote description", e))?;

        info!("Applied WebRTC answer from peer {}", peer_id);
        Ok(())
    }

    /// Handle an incoming ICE candidate.
    pub async fn handle_ice_candidate(&self, peer_id: &str, candidate_json: &str) -> Result<(), ConnectionError> {
        let candidate: webrtc::ice_transport::ice_candidate::RTCIceCandidateInit =
            serde_json::from_str(candidate_json).map_err(|e| pc_error("Failed to parse ICE candidate", e))?;

        let pc = self
            .connections
            .get(peer_id)
            .ok_or_else(|| ConnectionError::PeerConnection(format!("No peer connection for {}", peer_id)))?;

        pc.add_ice_candidate(candidate)
            .await
            .map_err(|e| pc_error("Failed to add ICE candidate", e))?;

        debug!("Added ICE candidate from peer {}", peer_id);
        Ok(())
    }

    /// Close a specific peer connection. Returns false if there was none.
    /// Handlers are detached first so closing emits no events.
    pub async fn close_peer(&mut self, peer_id: &str) -> bool {
        if let Some(dc) = self.data_channels.lock().await.remove(peer_id) {
            dc.on_close(Box::new(|| Box::pin(async {})));
            dc.on_message(Box::new(|_| Box::pin(async {})));
            let _ = dc.close().await;
        }
        match self.connections.remove(peer_id) {
            Some(pc) => {
                pc.on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
                if let Err(e) = pc.close().await {
                    warn!("Error closing peer connection to {}: {}", peer_id, e);
                }
                info!("Closed peer connection to {}", peer_id);
                true
            }
            None => false,
        }
    }

    /// Close all peer connections.
    pub async fn close_all(&mut self) {
        let peer_ids: Vec<String> = self.connections.keys().cloned().collect();
        for peer_id in peer_ids {
            self.close_peer(&peer_id).await;
        }
    }

    /// Check if we already have a connection to this peer.
    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.connections.contains_key(peer_id)
    }

    /// Store the channel for sending and wire its handlers.
    async fn setup_data_channel(
        data_channels: &Channels,
        event_tx: &mpsc::Sender<PeerEvent>,
        peer_id: &str,
        dc: Arc<RTCDataChannel>,
    ) {
        data_channels.lock().await.insert(peer_id.to_string(), dc.clone());

        let tx = event_tx.clone();
        let pid = peer_id.to_string();
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            let pid = pid.clone();
            Box::pin(async move {
                info!("Sync channel to {} open", pid);
                let _ = tx.send(PeerEvent::ChannelOpen { peer_id: pid }).await;
            })
        }));

        let tx = event_tx.clone();
        let pid = peer_id.to_string();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            let pid = pid.clone();
            Box::pin(async move {
                let _ = tx
                    .send(PeerEvent::ChannelMessage {
                        peer_id: pid,
                        data: msg.data.to_vec(),
                    })
                    .await;
            })
        }));

        let tx = event_tx.clone();
        let pid = peer_id.to_string();
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            let pid = pid.clone();
            Box::pin(async move {
                info!("Sync channel to {} closed", pid);
                let _ = tx.send(PeerEvent::ChannelClosed { peer_id: pid }).await;
            })
        }));
    }

    /// Internal: create a new RTCPeerConnection with the voice transceiver.
    async fn create_peer_connection(&mut self, peer_id: &str) -> Result<Arc<RTCPeerConnection>, ConnectionError> {
        // Close existing connection to this peer if any
        if self.connections.contains_key(peer_id) {
            self.close_peer(peer_id).await;
        }

        let mut media_engine = WrtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| pc_error("Failed to register codecs", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| pc_error("Failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| pc_error("Failed to create peer connection", e))?,
        );

        match &self.local_track {
            Some(track) => {
                let rtp_sender = pc
                    .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| pc_error("Failed to add audio track", e))?;

                // Read incoming RTCP packets (needed by webrtc crate for proper operation)
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while rtp_sender.read(&mut buf).await.is_ok() {}
                });
            }
            None => {
                // Still negotiate audio so we can hear the squad.
                pc.add_transceiver_from_kind(
                    RTPCodecType::Audio,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| pc_error("Failed to add audio transceiver", e))?;
            }
        }

        let pid = peer_id.to_string();

        let tx = self.event_tx.clone();
        let pid_state = pid.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            let pid = pid_state.clone();
            Box::pin(async move {
                info!("WebRTC connection to {} state: {}", pid, state);
                let _ = tx.send(PeerEvent::ConnectionStateChanged { peer_id: pid, state }).await;
            })
        }));

        let tx = self.event_tx.clone();
        let pid_track = pid.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            let pid = pid_track.clone();
            Box::pin(async move {
                if track.kind() == RTPCodecType::Audio {
                    info!("Received remote audio track from {}", pid);
                    let _ = tx.send(PeerEvent::RemoteTrack { peer_id: pid, track }).await;
                }
            })
        }));

        let tx = self.event_tx.clone();
        let pid_ice = pid.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            let pid = pid_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let json = match candidate.to_json().map(|init| serde_json::to_string(&init)) {
                    Ok(Ok(json)) => json,
                    Ok(Err(e)) => {
                        warn!("Failed to serialize ICE candidate: {}", e);
                        return;
                    }
                    Err(e) => {
                        warn!("Failed to serialize ICE candidate: {}", e);
                        return;
                    }
                };
                let _ = tx.send(PeerEvent::IceCandidate { peer_id: pid, candidate: json }).await;
            })
        }));

        // Answerer side: the sync channel arrives from the offerer.
        let tx = self.event_tx.clone();
        let pid_dc = pid.clone();
        let dc_channels = self.data_channels.clone();
        pc.on_data_channel(Box::new(move |dc| {
            let tx = tx.clone();
            let pid = pid_dc.clone();
            let channels = dc_channels.clone();
            Box::pin(async move {
                if dc.label() == SYNC_CHANNEL_LABEL {
                    Self::setup_data_channel(&channels, &tx, &pid, dc).await;
                } else {
                    warn!("Ignoring unexpected data channel '{}' from {}", dc.label(), pid);
                }
            })
        }));

        self.connections.insert(peer_id.to_string(), pc.clone());
        info!("Created WebRTC peer connection for {}", peer_id);

        Ok(pc)
    }
}

fn pc_error(context: &str, e: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::PeerConnection(format!("{}: {}", context, e))
}
