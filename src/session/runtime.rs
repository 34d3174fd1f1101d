//! The session loop.
//!
//! One task owns everything mutable about a session: the sync engine, the
//! peer connections, the transmission controller and the audio context.
//! Commands, network events, peer events, capture frames and timers are
//! all serialized through the `select!` in [`run_session`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use webrtc::media::Sample;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{AudioConfig, Config};
use crate::error::{ConnectionError, HardwareError, PolicyError, SessionError};
use crate::events::{AppEvent, EventSender};
use crate::media::codec::{OpusDecoder, OpusEncoder};
use crate::media::hardware::{AudioIo, DesktopAudio, PlaybackSink};
use crate::media::peer::{PeerEvent, PeerManager};
use crate::models::{Operator, Role};
use crate::network::{NetworkCommand, NetworkEvent, Signal};
use crate::session::bootstrap::SessionId;
use crate::session::{Reply, SessionCommand, SessionSnapshot, TransmitState};
use crate::sync::{SyncEffect, SyncEngine, Target};
use crate::voice::focus::{AudioFocusAdapter, AudioHardware};
use crate::voice::level::LevelMeter;
use crate::voice::{TransmissionController, TransmitChange};

/// How long the swarm gets to report a listen address.
const HOST_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the audio context for a new session. `None` for the I/O half
/// means the session runs without capture or playback.
pub type HardwareFactory = Box<dyn Fn(&AudioConfig) -> (Box<dyn AudioHardware>, Option<AudioIo>) + Send>;

pub fn desktop_hardware() -> HardwareFactory {
    Box::new(|config| {
        let (hw, io) = DesktopAudio::new(config);
        (Box::new(hw) as Box<dyn AudioHardware>, Some(io))
    })
}

/// A host start waiting for the swarm to report a listen address.
struct PendingHost {
    callsign: String,
    reply: Reply<String>,
    listen: oneshot::Receiver<Result<SessionId, ConnectionError>>,
    deadline: Instant,
}

struct ActiveSession {
    session_id: Option<String>,
    sync: SyncEngine,
    peers: PeerManager,
    /// Set on operator devices.
    host_peer_id: Option<String>,
    /// Peers whose sync channel the engine has seen open.
    open_channels: HashSet<String>,
    pending_join: Option<oneshot::Sender<Result<(), SessionError>>>,
    join_deadline: Option<Instant>,
    readers: HashMap<String, JoinHandle<()>>,
}

impl ActiveSession {
    /// Perform engine effects in order. Sends never wait on a peer.
    async fn perform(&self, effects: Vec<SyncEffect>, event_tx: &EventSender) {
        for effect in effects {
            match effect {
                SyncEffect::Send { target, message } => {
                    let data = match message.encode() {
                        Ok(data) => data,
                        Err(e) => {
                            error!("Failed to encode {}: {}", message.kind(), e);
                            continue;
                        }
                    };
                    match target {
                        Target::All => self.peers.broadcast(&self.open_channels, &data, None).await,
                        Target::AllExcept(peer) => {
                            self.peers.broadcast(&self.open_channels, &data, Some(&peer)).await
                        }
                        Target::Peer(peer) => self.peers.send_to(&peer, &data).await,
                    }
                }
                SyncEffect::Emit(event) => {
                    let _ = event_tx.send(event);
                }
            }
        }
    }
}

pub struct SessionRuntime {
    config: Config,
    local_peer_id: String,
    network_tx: mpsc::Sender<NetworkCommand>,
    event_tx: EventSender,
    state_tx: watch::Sender<SessionSnapshot>,
    peer_tx: mpsc::Sender<PeerEvent>,
    hardware: HardwareFactory,
    controller: TransmissionController,
    meter: LevelMeter,
    /// Suppresses repeated refusal events within one loud burst.
    vox_refused_until: Option<Instant>,
    focus: Option<AudioFocusAdapter>,
    io: Option<AudioIo>,
    encoder: Option<OpusEncoder>,
    pending_host: Option<PendingHost>,
    session: Option<ActiveSession>,
}

impl SessionRuntime {
    pub fn new(
        config: Config,
        local_peer_id: String,
        network_tx: mpsc::Sender<NetworkCommand>,
        event_tx: EventSender,
        state_tx: watch::Sender<SessionSnapshot>,
        hardware: HardwareFactory,
    ) -> (Self, mpsc::Receiver<PeerEvent>) {
        let (peer_tx, peer_rx) = mpsc::channel(256);
        let controller = TransmissionController::with_mode(config.transmit.settings(), config.transmit.mode);
        let runtime = Self {
            config,
            local_peer_id,
            network_tx,
            event_tx,
            state_tx,
            peer_tx,
            hardware,
            controller,
            meter: LevelMeter::default(),
            vox_refused_until: None,
            focus: None,
            io: None,
            encoder: None,
            pending_host: None,
            session: None,
        };
        (runtime, peer_rx)
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.event_tx.send(event);
    }

    fn transmit_state(&self) -> TransmitState {
        TransmitState {
            mode: self.controller.mode(),
            transmitting: self.controller.is_transmitting(),
        }
    }

    fn callsign_or_default(&self, callsign: String) -> String {
        let trimmed = callsign.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
        match &self.config.callsign {
            Some(c) if !c.trim().is_empty() => c.trim().to_string(),
            _ => {
                let id = &self.local_peer_id;
                format!("OP-{}", id[id.len().saturating_sub(4)..].to_uppercase())
            }
        }
    }

    // ------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::StartHost { callsign, reply } => {
                self.start_host(callsign, reply).await;
            }
            SessionCommand::Join { callsign, session_id, reply } => {
                self.join(callsign, &session_id, reply).await;
            }
            SessionCommand::Leave { reply } => {
                let result = if let Some(pending) = self.pending_host.take() {
                    info!("Cancelling host start");
                    let _ = self.network_tx.send(NetworkCommand::Leave).await;
                    let cancelled = ConnectionError::ListenFailed("session left".to_string());
                    self.settle_host(pending.reply, Err(cancelled.into()));
                    Ok(())
                } else if self.session.is_some() {
                    self.end_session().await;
                    Ok(())
                } else {
                    Err(PolicyError::NoSession.into())
                };
                self.respond(reply, result);
            }
            SessionCommand::SetStatus { status, reply } => {
                let result = self.local_action(|sync| Ok(((), sync.set_status(status)))).await;
                self.respond(reply, result);
            }
            SessionCommand::SetPosition { position, reply } => {
                let result = self.local_action(|sync| Ok(((), sync.set_position(position)))).await;
                self.respond(reply, result);
            }
            SessionCommand::SetBattery { percent, reply } => {
                let result = self.local_action(|sync| Ok(((), sync.set_battery(percent)))).await;
                self.respond(reply, result);
            }
            SessionCommand::CreateMarker { position, label, reply } => {
                let result = self.local_action(|sync| Ok(sync.create_marker(position, &label))).await;
                self.respond(reply, result);
            }
            SessionCommand::MoveMarker { id, position, reply } => {
                let result = self.local_action(|sync| Ok(((), sync.move_marker(&id, position)?))).await;
                self.respond(reply, result);
            }
            SessionCommand::DeleteMarker { id, reply } => {
                let result = self.local_action(|sync| Ok(((), sync.delete_marker(&id)?))).await;
                self.respond(reply, result);
            }
            SessionCommand::SetSilence { silenced, reply } => {
                let result = self.local_action(|sync| Ok(((), sync.set_silence(silenced)?))).await;
                self.respond(reply, result);
            }
            SessionCommand::HoldTalk { reply } => {
                let result = self.hold_talk().await;
                self.respond(reply, result);
            }
            SessionCommand::ReleaseTalk { reply } => {
                let change = self.controller.release_talk();
                self.apply_transmit(change).await.ok();
                self.respond(reply, Ok(self.transmit_state()));
            }
            SessionCommand::ToggleMode { reply } => {
                let change = self.controller.toggle_mode();
                self.vox_refused_until = None;
                self.meter.reset();
                self.apply_transmit(change).await.ok();
                if !change.is_flip() {
                    self.emit(AppEvent::TransmissionChanged {
                        mode: self.controller.mode(),
                        transmitting: self.controller.is_transmitting(),
                    });
                }
                self.respond(reply, Ok(self.transmit_state()));
            }
            SessionCommand::Hardware(event) => {
                let Some(focus) = self.focus.as_mut() else {
                    debug!("Ignoring {:?}: no audio context", event);
                    return;
                };
                let outcome = focus.handle(event);
                if outcome.close_mic {
                    let change = self.controller.force_close();
                    self.apply_transmit(change).await.ok();
                }
                if let Some(route) = outcome.route_changed {
                    self.emit(AppEvent::AudioRouteChanged { route });
                }
            }
        }
    }

    /// Ask the swarm for a listen address. The session opens when it
    /// answers, in [`SessionRuntime::finish_host`].
    async fn start_host(&mut self, callsign: String, reply: Reply<String>) {
        if self.session.is_some() || self.pending_host.is_some() {
            self.respond(reply, Err(PolicyError::SessionActive.into()));
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.network_tx.send(NetworkCommand::Host { reply: tx }).await.is_err() {
            self.settle_host(reply, Err(SessionError::Unavailable));
            return;
        }
        self.pending_host = Some(PendingHost {
            callsign,
            reply,
            listen: rx,
            deadline: Instant::now() + HOST_START_TIMEOUT,
        });
    }

    fn finish_host(&mut self, listened: Result<Result<SessionId, ConnectionError>, oneshot::error::RecvError>) {
        let Some(pending) = self.pending_host.take() else { return };
        let result = match listened {
            Ok(Ok(session_id)) => Ok(self.open_host_session(pending.callsign, session_id)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SessionError::Unavailable),
        };
        self.settle_host(pending.reply, result);
    }

    async fn host_timed_out(&mut self) {
        let Some(pending) = self.pending_host.take() else { return };
        let _ = self.network_tx.send(NetworkCommand::Leave).await;
        let err = ConnectionError::ListenFailed("no listen address reported".to_string());
        self.settle_host(pending.reply, Err(err.into()));
    }

    fn settle_host(&self, reply: Reply<String>, result: Result<String, SessionError>) {
        if let Err(e) = &result {
            warn!("Host start failed: {}", e);
            self.emit(AppEvent::ConnectionError { message: e.to_string() });
        }
        self.respond(reply, result);
    }

    fn open_host_session(&mut self, callsign: String, session_id: SessionId) -> String {
        let session_id = session_id.to_string();
        let local = Operator::new(&self.local_peer_id, self.callsign_or_default(callsign), Role::Host);
        info!("Hosting session {} as {}", session_id, local.callsign);
        let with_audio = self.start_audio();
        let session = ActiveSession {
            session_id: Some(session_id.clone()),
            sync: SyncEngine::new_host(local),
            peers: PeerManager::new(self.peer_tx.clone(), self.config.network.stun_servers.clone(), with_audio),
            host_peer_id: None,
            open_channels: HashSet::new(),
            pending_join: None,
            join_deadline: None,
            readers: HashMap::new(),
        };
        self.emit(AppEvent::SessionStarted {
            session_id: Some(session_id.clone()),
            role: Role::Host,
            local_id: self.local_peer_id.clone(),
        });
        self.emit_effect(session.sync.roster_changed());
        self.session = Some(session);
        session_id
    }

    async fn join(&mut self, callsign: String, raw_id: &str, reply: oneshot::Sender<Result<(), SessionError>>) {
        if self.session.is_some() || self.pending_host.is_some() {
            let _ = reply.send(Err(PolicyError::SessionActive.into()));
            return;
        }
        let session_id = match SessionId::parse(raw_id) {
            Ok(id) if id.host_peer_id().to_string() == self.local_peer_id => {
                let _ = reply.send(Err(
                    ConnectionError::MalformedSessionId("that is this device's own session".to_string()).into(),
                ));
                return;
            }
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        let host_peer_id = session_id.host_peer_id().to_string();

        let local = Operator::new(&self.local_peer_id, self.callsign_or_default(callsign), Role::Operator);
        info!("Joining {} as {}", session_id, local.callsign);
        let with_audio = self.start_audio();
        let session = ActiveSession {
            session_id: Some(session_id.to_string()),
            sync: SyncEngine::new_operator(local, host_peer_id.clone()),
            peers: PeerManager::new(self.peer_tx.clone(), self.config.network.stun_servers.clone(), with_audio),
            host_peer_id: Some(host_peer_id),
            open_channels: HashSet::new(),
            pending_join: Some(reply),
            join_deadline: Some(Instant::now() + self.config.join_timeout()),
            readers: HashMap::new(),
        };
        self.emit(AppEvent::SessionStarted {
            session_id: session.session_id.clone(),
            role: Role::Operator,
            local_id: self.local_peer_id.clone(),
        });
        self.emit_effect(session.sync.roster_changed());
        self.session = Some(session);

        if self.network_tx.send(NetworkCommand::Join { session_id }).await.is_err() {
            self.fail_join(ConnectionError::HostUnreachable("network task stopped".to_string())).await;
        }
    }

    async fn end_session(&mut self) {
        let Some(mut session) = self.session.take() else { return };
        info!("Ending session {:?}", session.session_id);
        if let Some(reply) = session.pending_join.take() {
            let _ = reply.send(Err(ConnectionError::HostUnreachable("session left".to_string()).into()));
        }
        for (_, reader) in session.readers.drain() {
            reader.abort();
        }
        session.peers.close_all().await;
        let _ = self.network_tx.send(NetworkCommand::Leave).await;
        self.controller.force_close();
        self.stop_audio();
        self.vox_refused_until = None;
        self.emit(AppEvent::SessionEnded);
    }

    async fn fail_join(&mut self, err: ConnectionError) {
        let Some(reply) = self.session.as_mut().and_then(|s| s.pending_join.take()) else {
            return;
        };
        warn!("Join failed: {}", err);
        self.emit(AppEvent::ConnectionError { message: err.to_string() });
        self.end_session().await;
        self.respond(reply, Err(err.into()));
    }

    /// Publish state before answering, so a caller reading the snapshot
    /// after the reply sees the change.
    fn respond<T>(&self, reply: Reply<T>, result: Result<T, SessionError>) {
        self.publish_state();
        let _ = reply.send(result);
    }

    async fn local_action<T>(
        &mut self,
        action: impl FnOnce(&mut SyncEngine) -> Result<(T, Vec<SyncEffect>), SessionError>,
    ) -> Result<T, SessionError> {
        let session = self.session.as_mut().ok_or(PolicyError::NoSession)?;
        let (value, effects) = action(&mut session.sync)?;
        session.perform(effects, &self.event_tx).await;
        Ok(value)
    }

    fn emit_effect(&self, effect: SyncEffect) {
        if let SyncEffect::Emit(event) = effect {
            self.emit(event);
        }
    }

    // ------------------------------------------------------------
    // Audio context
    // ------------------------------------------------------------

    /// Start the hardware context for a new session. Returns whether local
    /// audio is available; without it the session runs degraded.
    fn start_audio(&mut self) -> bool {
        let (hw, io) = (self.hardware)(&self.config.audio);
        let mut focus = AudioFocusAdapter::new(hw);
        match focus.start() {
            Ok(route) => {
                self.emit(AppEvent::AudioRouteChanged { route });
                self.focus = Some(focus);
            }
            Err(e) => {
                warn!("Audio unavailable, continuing without voice: {}", e);
                self.emit(AppEvent::HardwareError { message: e.to_string() });
                return false;
            }
        }
        self.encoder = match OpusEncoder::new() {
            Ok(encoder) => Some(encoder),
            Err(e) => {
                warn!("{}", e);
                None
            }
        };
        self.io = io;
        self.meter.reset();
        self.io.is_some() && self.encoder.is_some()
    }

    fn stop_audio(&mut self) {
        if let Some(mut focus) = self.focus.take() {
            focus.stop();
        }
        self.io = None;
        self.encoder = None;
        self.meter.reset();
    }

    // ------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------

    async fn hold_talk(&mut self) -> Result<TransmitState, SessionError> {
        let gate = self.session.as_ref().ok_or(PolicyError::NoSession)?.sync.gate();
        match self.controller.hold_talk(gate) {
            Ok(change) => {
                if let Err(e) = self.apply_transmit(change).await {
                    self.emit(AppEvent::HardwareError { message: e.to_string() });
                    return Err(e.into());
                }
                Ok(self.transmit_state())
            }
            Err(e) => {
                info!("Talk refused: {}", e);
                self.emit(AppEvent::TransmissionBlocked { reason: e.to_string() });
                Err(e.into())
            }
        }
    }

    /// Drive the mic interlock for a controller change and publish the flip.
    /// If the mic can't open, the controller is closed again and nothing
    /// is published.
    async fn apply_transmit(&mut self, change: TransmitChange) -> Result<(), HardwareError> {
        match change {
            TransmitChange::Unchanged => return Ok(()),
            TransmitChange::Started => {
                let opened = match self.focus.as_mut() {
                    Some(focus) => focus.set_mic(true),
                    None => Err(HardwareError::NoInputDevice),
                };
                if let Err(e) = opened {
                    self.controller.force_close();
                    return Err(e);
                }
            }
            TransmitChange::Stopped => {
                if let Some(focus) = self.focus.as_mut() {
                    if let Err(e) = focus.set_mic(false) {
                        warn!("Failed to close mic: {}", e);
                    }
                }
            }
        }

        let transmitting = self.controller.is_transmitting();
        if let Some(session) = self.session.as_mut() {
            let effects = session.sync.set_transmitting(transmitting);
            session.perform(effects, &self.event_tx).await;
        }
        self.emit(AppEvent::TransmissionChanged {
            mode: self.controller.mode(),
            transmitting,
        });
        Ok(())
    }

    /// Meter a capture frame, feed VOX, and send it if the mic is hot.
    /// Returns whether the transmit state flipped.
    async fn handle_frame(&mut self, frame: Vec<f32>) -> bool {
        let level = self.meter.process(&frame);
        let Some(gate) = self.session.as_ref().map(|s| s.sync.gate()) else {
            return false;
        };
        let was_transmitting = self.controller.is_transmitting();

        let now = Instant::now();
        let refusal = match self.controller.on_level(level, now, gate) {
            Ok(change) => self.apply_transmit(change).await.err().map(|e| AppEvent::HardwareError {
                message: e.to_string(),
            }),
            Err(e) => Some(AppEvent::TransmissionBlocked { reason: e.to_string() }),
        };
        if let Some(event) = refusal {
            // One event per loud burst, not per frame.
            let fresh = self.vox_refused_until.map_or(true, |until| now >= until);
            self.vox_refused_until = Some(now + self.controller.settings().vox_hold);
            if fresh {
                info!("Voice activation refused: {:?}", event);
                self.emit(event);
            }
        }

        self.send_frame(&frame).await;
        was_transmitting != self.controller.is_transmitting()
    }

    async fn send_frame(&mut self, frame: &[f32]) {
        if !self.controller.is_transmitting() {
            return;
        }
        let (Some(io), Some(encoder), Some(session)) = (&self.io, self.encoder.as_mut(), &self.session) else {
            return;
        };
        if !io.mic_gate.is_open() {
            return;
        }
        let Some(track) = session.peers.local_track() else { return };
        match encoder.encode(frame) {
            Ok(opus_data) => {
                let sample = Sample {
                    data: opus_data.into(),
                    duration: Duration::from_millis(20),
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    debug!("Failed to write audio sample: {}", e);
                }
            }
            Err(e) => debug!("Opus encode failed: {}", e),
        }
    }

    async fn on_hold_expired(&mut self) {
        let change = self.controller.on_hold_expired(Instant::now());
        if change.is_flip() {
            debug!("VOX hold expired");
        }
        self.apply_transmit(change).await.ok();
    }

    /// Close a non-host's mic when silence turns on mid-transmission.
    async fn enforce_silence(&mut self) {
        let Some(gate) = self.session.as_ref().map(|s| s.sync.gate()) else { return };
        if gate.blocks() && self.controller.is_transmitting() {
            info!("Radio silence: closing mic");
            let change = self.controller.force_close();
            self.apply_transmit(change).await.ok();
        }
    }

    // ------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------

    async fn handle_peer(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::ChannelOpen { peer_id } => {
                let Some(session) = self.session.as_mut() else { return };
                if !session.peers.has_peer(&peer_id) {
                    debug!("Ignoring stale channel open from {}", peer_id);
                    return;
                }
                if session.host_peer_id.as_deref() == Some(peer_id.as_str()) {
                    session.join_deadline = None;
                    if let Some(reply) = session.pending_join.take() {
                        info!("Joined session {:?}", session.session_id);
                        let _ = reply.send(Ok(()));
                    }
                }
                session.open_channels.insert(peer_id.clone());
                let effects = session.sync.on_channel_open(&peer_id);
                session.perform(effects, &self.event_tx).await;
            }
            PeerEvent::ChannelMessage { peer_id, data } => {
                let Some(session) = self.session.as_mut() else { return };
                if !session.open_channels.contains(&peer_id) {
                    debug!("Dropping message from {}: channel not open", peer_id);
                    return;
                }
                let effects = session.sync.on_message(&peer_id, &data);
                let silence_on = effects
                    .iter()
                    .any(|e| matches!(e, SyncEffect::Emit(AppEvent::SilenceChanged { silenced: true })));
                session.perform(effects, &self.event_tx).await;
                if silence_on {
                    self.enforce_silence().await;
                }
            }
            PeerEvent::ChannelClosed { peer_id } => {
                self.drop_peer(&peer_id, "sync channel closed").await;
            }
            PeerEvent::ConnectionStateChanged { peer_id, state } => match state {
                RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Disconnected
                | RTCPeerConnectionState::Closed => {
                    self.drop_peer(&peer_id, "connection lost").await;
                }
                _ => debug!("Peer {} connection: {}", peer_id, state),
            },
            PeerEvent::RemoteTrack { peer_id, track } => self.spawn_reader(peer_id, track),
            PeerEvent::IceCandidate { peer_id, candidate } => {
                send_signal(&self.network_tx, &peer_id, Signal::IceCandidate { candidate }).await;
            }
        }
    }

    async fn drop_peer(&mut self, peer_id: &str, reason: &str) {
        let Some(session) = self.session.as_mut() else { return };
        if !session.peers.close_peer(peer_id).await {
            return;
        }
        info!("Peer {} gone: {}", peer_id, reason);
        if let Some(reader) = session.readers.remove(peer_id) {
            reader.abort();
        }
        let was_open = session.open_channels.remove(peer_id);
        if was_open {
            let effects = session.sync.on_channel_closed(peer_id);
            session.perform(effects, &self.event_tx).await;
        }

        if session.host_peer_id.as_deref() == Some(peer_id) {
            if session.pending_join.is_some() {
                self.fail_join(ConnectionError::HostUnreachable(reason.to_string())).await;
            } else {
                self.emit(AppEvent::ConnectionError {
                    message: format!("Lost connection to host: {}", reason),
                });
            }
        }
    }

    fn spawn_reader(&mut self, peer_id: String, track: Arc<TrackRemote>) {
        let Some(session) = self.session.as_mut() else { return };
        let Some(sink) = self.io.as_ref().map(|io| io.playback.clone()) else {
            debug!("No playback, ignoring audio from {}", peer_id);
            return;
        };
        let decoder = match OpusDecoder::new() {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create decoder for {}: {}", peer_id, e);
                return;
            }
        };
        let pid = peer_id.clone();
        let reader = tokio::spawn(read_remote_audio(pid, track, decoder, sink));
        if let Some(old) = session.readers.insert(peer_id, reader) {
            old.abort();
        }
    }

    // ------------------------------------------------------------
    // Network
    // ------------------------------------------------------------

    async fn handle_network(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::HostReachable { host_peer_id } => {
                let Some(session) = self.session.as_mut() else { return };
                if session.host_peer_id.as_deref() != Some(host_peer_id.as_str()) || session.pending_join.is_none() {
                    return;
                }
                match session.peers.create_offer(&host_peer_id).await {
                    Ok(sdp) => send_signal(&self.network_tx, &host_peer_id, Signal::Offer { sdp }).await,
                    Err(e) => self.fail_join(e).await,
                }
            }
            NetworkEvent::HostUnreachable { reason } => {
                self.fail_join(ConnectionError::HostUnreachable(reason)).await;
            }
            NetworkEvent::Signal { from_peer_id, signal } => self.handle_signal(from_peer_id, signal).await,
        }
    }

    async fn handle_signal(&mut self, from: String, signal: Signal) {
        let Some(is_host) = self.session.as_ref().map(|s| s.sync.is_host()) else {
            debug!("Ignoring signal from {}: no session", from);
            return;
        };
        match signal {
            Signal::Offer { sdp } => {
                if !is_host {
                    warn!("Ignoring offer from {}: operators only dial the host", from);
                    return;
                }
                // A repeat offer means the operator reconnected.
                if self.session.as_ref().is_some_and(|s| s.peers.has_peer(&from)) {
                    self.drop_peer(&from, "reconnecting").await;
                }
                let Some(session) = self.session.as_mut() else { return };
                match session.peers.handle_offer(&from, &sdp).await {
                    Ok(answer) => send_signal(&self.network_tx, &from, Signal::Answer { sdp: answer }).await,
                    Err(e) => warn!("Failed to answer {}: {}", from, e),
                }
            }
            Signal::Answer { sdp } => {
                let Some(session) = self.session.as_mut() else { return };
                if let Err(e) = session.peers.handle_answer(&from, &sdp).await {
                    warn!("Failed to apply answer from {}: {}", from, e);
                }
            }
            Signal::IceCandidate { candidate } => {
                let Some(session) = self.session.as_ref() else { return };
                if let Err(e) = session.peers.handle_ice_candidate(&from, &candidate).await {
                    debug!("Dropping ICE candidate from {}: {}", from, e);
                }
            }
        }
    }

    // ------------------------------------------------------------
    // Timers and state
    // ------------------------------------------------------------

    async fn heartbeat(&mut self) {
        let Some(focus) = self.focus.as_mut() else { return };
        let outcome = focus.heartbeat();
        if outcome.close_mic {
            let change = self.controller.force_close();
            self.apply_transmit(change).await.ok();
        }
        if let Some(route) = outcome.route_changed {
            self.emit(AppEvent::AudioRouteChanged { route });
        }
    }

    fn publish_state(&self) {
        let transmit = self.transmit_state();
        let snapshot = match &self.session {
            Some(s) => SessionSnapshot {
                active: true,
                role: Some(s.sync.local().role),
                session_id: s.session_id.clone(),
                connected: !s.open_channels.is_empty(),
                local: Some(s.sync.local().clone()),
                remote: s.sync.roster().values().cloned().collect(),
                markers: s.sync.markers().to_vec(),
                silenced: s.sync.silenced(),
                transmit,
                route: self.focus.as_ref().map(|f| f.route()),
                audio_available: self.io.is_some() && self.encoder.is_some(),
            },
            None => SessionSnapshot {
                transmit,
                ..Default::default()
            },
        };
        self.state_tx.send_replace(snapshot);
    }

    async fn shutdown(&mut self) {
        if let Some(pending) = self.pending_host.take() {
            self.settle_host(pending.reply, Err(SessionError::Unavailable));
        }
        self.end_session().await;
        info!("Session loop stopped");
    }
}

/// Run the session loop until the command channel closes.
pub async fn run_session(
    mut runtime: SessionRuntime,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    mut net_rx: mpsc::Receiver<NetworkEvent>,
    mut peer_rx: mpsc::Receiver<PeerEvent>,
) {
    let mut heartbeat = tokio::time::interval(runtime.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    runtime.publish_state();

    loop {
        let hold_deadline = runtime.controller.hold_deadline();
        let join_deadline = runtime.session.as_ref().and_then(|s| s.join_deadline);
        let host_deadline = runtime.pending_host.as_ref().map(|p| p.deadline);

        let publish = tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                runtime.handle_command(cmd).await;
                true
            }
            Some(event) = net_rx.recv() => {
                runtime.handle_network(event).await;
                true
            }
            Some(event) = peer_rx.recv() => {
                runtime.handle_peer(event).await;
                true
            }
            Some(frame) = next_frame(&mut runtime.io) => {
                runtime.handle_frame(frame).await
            }
            _ = sleep_until(hold_deadline) => {
                runtime.on_hold_expired().await;
                true
            }
            listened = host_listen(&mut runtime.pending_host) => {
                runtime.finish_host(listened);
                true
            }
            _ = sleep_until(host_deadline) => {
                runtime.host_timed_out().await;
                true
            }
            _ = sleep_until(join_deadline) => {
                runtime.fail_join(ConnectionError::JoinTimedOut).await;
                true
            }
            _ = heartbeat.tick() => {
                runtime.heartbeat().await;
                true
            }
        };
        if publish {
            runtime.publish_state();
        }
    }

    runtime.shutdown().await;
    runtime.publish_state();
}

async fn next_frame(io: &mut Option<AudioIo>) -> Option<Vec<f32>> {
    match io {
        Some(io) => io.frames.recv().await,
        None => std::future::pending().await,
    }
}

async fn host_listen(
    pending: &mut Option<PendingHost>,
) -> Result<Result<SessionId, ConnectionError>, oneshot::error::RecvError> {
    match pending {
        Some(pending) => (&mut pending.listen).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

async fn send_signal(network_tx: &mpsc::Sender<NetworkCommand>, to: &str, signal: Signal) {
    let cmd = NetworkCommand::SendSignal {
        to_peer_id: to.to_string(),
        signal,
    };
    if network_tx.send(cmd).await.is_err() {
        warn!("Network task stopped, dropping signal for {}", to);
    }
}

async fn read_remote_audio(peer_id: String, track: Arc<TrackRemote>, mut decoder: OpusDecoder, sink: PlaybackSink) {
    let mut buf = vec![0u8; 4096];
    loop {
        match track.read(&mut buf).await {
            Ok((rtp_packet, _attributes)) => {
                let payload = &rtp_packet.payload;
                if payload.is_empty() {
                    continue;
                }
                match decoder.decode(payload) {
                    Ok(pcm) => sink.push(&peer_id, pcm),
                    Err(e) => debug!("Decode error for {}: {}", peer_id, e),
                }
            }
            Err(e) => {
                debug!("Remote track read ended for {}: {}", peer_id, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::events::create_event_bus;
    use crate::media::hardware::MicGate;
    use crate::models::OperatorStatus;
    use crate::state::ServiceContext;
    use crate::sync::SyncMessage;
    use crate::voice::TransmitMode;
    use crate::voice::focus::tests::{FakeHardware, FakeState};
    use crate::voice::focus::HardwareEvent;

    /// How the fake swarm answers `Host`.
    #[derive(Clone, Copy, PartialEq)]
    enum Listen {
        Ready,
        Fails,
        /// Never reports an address until told to leave.
        Silent,
    }

    struct Harness {
        ctx: ServiceContext,
        audio: Arc<Mutex<FakeState>>,
        net_tx: mpsc::Sender<NetworkEvent>,
        peer_tx: mpsc::Sender<PeerEvent>,
        /// Signals the loop asked the swarm to send.
        signals: mpsc::UnboundedReceiver<(String, Signal)>,
        /// Feeds capture frames to the current session.
        mic: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
    }

    fn harness(config: Config) -> Harness {
        harness_with(config, Listen::Ready)
    }

    /// Session loop with fake audio and a fake swarm task.
    fn harness_with(mut config: Config, listen: Listen) -> Harness {
        config.network.stun_servers = Vec::new();
        let local_peer = libp2p::PeerId::random();
        let (network_tx, mut network_rx) = mpsc::channel(16);
        let (net_tx, net_rx) = mpsc::channel(16);
        let (session_tx, session_rx) = mpsc::channel(16);
        let (event_tx, _) = create_event_bus();
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());
        let (signal_tx, signals) = mpsc::unbounded_channel();

        let audio = Arc::new(Mutex::new(FakeState::default()));
        let mic = Arc::new(Mutex::new(None));
        let shared = audio.clone();
        let frames_slot = mic.clone();
        let hardware: HardwareFactory = Box::new(move |_| {
            let (frames_tx, frames) = mpsc::channel(64);
            *frames_slot.lock().unwrap() = Some(frames_tx);
            let io = AudioIo {
                frames,
                mic_gate: MicGate::default(),
                playback: PlaybackSink::default(),
            };
            (Box::new(FakeHardware(shared.clone())) as Box<dyn AudioHardware>, Some(io))
        });

        tokio::spawn(async move {
            let mut waiting = Vec::new();
            while let Some(cmd) = network_rx.recv().await {
                match cmd {
                    NetworkCommand::Host { reply } => match listen {
                        Listen::Ready => {
                            let addr = "/ip4/10.0.0.5/tcp/4001".parse().unwrap();
                            let _ = reply.send(Ok(SessionId::for_listen_addr(&addr, local_peer)));
                        }
                        Listen::Fails => {
                            let _ = reply.send(Err(ConnectionError::ListenFailed("address in use".to_string())));
                        }
                        Listen::Silent => waiting.push(reply),
                    },
                    NetworkCommand::SendSignal { to_peer_id, signal } => {
                        let _ = signal_tx.send((to_peer_id, signal));
                    }
                    NetworkCommand::Leave => {
                        for reply in waiting.drain(..) {
                            let _ = reply.send(Err(ConnectionError::ListenFailed("session left".to_string())));
                        }
                    }
                    NetworkCommand::Join { .. } => {}
                }
            }
        });

        let (runtime, peer_rx) = SessionRuntime::new(
            config,
            local_peer.to_string(),
            network_tx,
            event_tx.clone(),
            state_tx,
            hardware,
        );
        let peer_tx = runtime.peer_tx.clone();
        tokio::spawn(run_session(runtime, session_rx, net_rx, peer_rx));

        Harness {
            ctx: ServiceContext {
                peer_id: local_peer.to_string(),
                session_tx,
                event_tx,
                state_rx,
            },
            audio,
            net_tx,
            peer_tx,
            signals,
            mic,
        }
    }

    impl Harness {
        /// Join a session and complete the handshake up to the open sync
        /// channel. Returns the host's peer id.
        async fn join_as_operator(&mut self) -> String {
            let host_peer = libp2p::PeerId::random().to_string();
            let session_id = format!("/ip4/10.0.0.9/tcp/4001/p2p/{}", host_peer);
            let ctx = self.ctx.clone();
            let join = tokio::spawn(async move {
                ctx.request(|reply| SessionCommand::Join {
                    callsign: "BRAVO".to_string(),
                    session_id,
                    reply,
                })
                .await
            });

            self.wait_for(|s| s.active).await;
            self.net_tx
                .send(NetworkEvent::HostReachable { host_peer_id: host_peer.clone() })
                .await
                .unwrap();
            loop {
                let (to, signal) = tokio::time::timeout(Duration::from_secs(5), self.signals.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if to == host_peer && matches!(signal, Signal::Offer { .. }) {
                    break;
                }
            }
            self.peer_tx
                .send(PeerEvent::ChannelOpen { peer_id: host_peer.clone() })
                .await
                .unwrap();
            join.await.unwrap().unwrap();
            host_peer
        }

        async fn from_host(&self, host_peer: &str, message: SyncMessage) {
            self.peer_tx
                .send(PeerEvent::ChannelMessage {
                    peer_id: host_peer.to_string(),
                    data: message.encode().unwrap(),
                })
                .await
                .unwrap();
        }

        async fn wait_for(&self, check: impl FnMut(&SessionSnapshot) -> bool) {
            let mut state_rx = self.ctx.state_rx.clone();
            tokio::time::timeout(Duration::from_secs(5), state_rx.wait_for(check))
                .await
                .unwrap()
                .unwrap();
        }

        async fn speak(&self, frames: usize) {
            let mic = self.mic.lock().unwrap().clone().unwrap();
            for _ in 0..frames {
                mic.send(vec![0.5; 960]).await.unwrap();
            }
        }
    }

    async fn host(ctx: &ServiceContext) -> String {
        ctx.request(|reply: Reply<String>| SessionCommand::StartHost {
            callsign: "ACTUAL".to_string(),
            reply,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_host_session_lifecycle() {
        let h = harness(Config::default());
        let session_id = host(&h.ctx).await;
        assert!(session_id.starts_with("/ip4/10.0.0.5/tcp/4001/p2p/"));

        let snap = h.ctx.snapshot();
        assert!(snap.active);
        assert_eq!(snap.role, Some(Role::Host));
        assert_eq!(snap.local.unwrap().callsign, "ACTUAL");
        assert!(snap.audio_available);

        let again = h
            .ctx
            .request(|reply| SessionCommand::StartHost { callsign: String::new(), reply })
            .await;
        assert_eq!(again, Err(PolicyError::SessionActive.into()));

        h.ctx
            .request(|reply| SessionCommand::SetStatus { status: OperatorStatus::Contact, reply })
            .await
            .unwrap();
        assert_eq!(h.ctx.snapshot().local.unwrap().status, OperatorStatus::Contact);

        h.ctx.request(|reply| SessionCommand::Leave { reply }).await.unwrap();
        assert!(!h.ctx.snapshot().active);
        assert!(h.audio.lock().unwrap().torn_down);

        let none = h.ctx.request(|reply| SessionCommand::Leave { reply }).await;
        assert_eq!(none, Err(PolicyError::NoSession.into()));
    }

    #[tokio::test]
    async fn test_talk_follows_focus() {
        let h = harness(Config::default());
        host(&h.ctx).await;
        let mut events = h.ctx.event_tx.subscribe();

        let state = h.ctx.request(|reply| SessionCommand::HoldTalk { reply }).await.unwrap();
        assert!(state.transmitting);
        assert!(h.audio.lock().unwrap().mic);
        assert!(h.ctx.snapshot().local.unwrap().is_transmitting);

        h.ctx
            .notify(SessionCommand::Hardware(HardwareEvent::FocusLost { transient: true }))
            .await
            .unwrap();
        // A later request is answered after the hardware event was handled.
        let state = h.ctx.request(|reply| SessionCommand::ReleaseTalk { reply }).await.unwrap();
        assert!(!state.transmitting);
        assert!(!h.audio.lock().unwrap().mic);

        let mut flips = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let AppEvent::TransmissionChanged { transmitting, .. } = event {
                flips.push(transmitting);
            }
        }
        assert_eq!(flips, vec![true, false]);

        // No focus, no mic.
        let refused = h.ctx.request(|reply| SessionCommand::HoldTalk { reply }).await;
        assert_eq!(refused, Err(HardwareError::NoAudioFocus.into()));
        assert!(!h.ctx.snapshot().transmit.transmitting);
    }

    #[tokio::test]
    async fn test_commands_without_session_are_refused() {
        let h = harness(Config::default());
        let result = h
            .ctx
            .request(|reply| SessionCommand::SetSilence { silenced: true, reply })
            .await;
        assert_eq!(result, Err(PolicyError::NoSession.into()));
        let result = h.ctx.request(|reply| SessionCommand::HoldTalk { reply }).await;
        assert_eq!(result, Err(PolicyError::NoSession.into()));
    }

    #[tokio::test]
    async fn test_malformed_session_id_is_rejected() {
        let h = harness(Config::default());
        let result = h
            .ctx
            .request(|reply| SessionCommand::Join {
                callsign: "BRAVO".to_string(),
                session_id: "not-an-address".to_string(),
                reply,
            })
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Connection(ConnectionError::MalformedSessionId(_)))
        ));
        assert!(!h.ctx.snapshot().active);
    }

    #[tokio::test]
    async fn test_join_times_out_without_host_channel() {
        let mut config = Config::default();
        config.network.join_timeout_secs = 1;
        let h = harness(config);
        let host_peer = libp2p::PeerId::random();
        let session_id = format!("/ip4/10.0.0.9/tcp/4001/p2p/{}", host_peer);

        let ctx = h.ctx.clone();
        let join = tokio::spawn(async move {
            ctx.request(|reply| SessionCommand::Join {
                callsign: "BRAVO".to_string(),
                session_id,
                reply,
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        // While pending, the device is an operator and cannot set silence.
        let silence = h
            .ctx
            .request(|reply| SessionCommand::SetSilence { silenced: true, reply })
            .await;
        assert_eq!(silence, Err(PolicyError::HostOnly.into()));

        let result = join.await.unwrap();
        assert_eq!(result, Err(ConnectionError::JoinTimedOut.into()));
        assert!(!h.ctx.snapshot().active);
    }

    #[tokio::test]
    async fn test_host_start_failure_is_reported() {
        let h = harness_with(Config::default(), Listen::Fails);
        let mut events = h.ctx.event_tx.subscribe();

        let result = h
            .ctx
            .request(|reply| SessionCommand::StartHost { callsign: String::new(), reply })
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Connection(ConnectionError::ListenFailed(_)))
        ));
        assert!(!h.ctx.snapshot().active);

        let mut reported = false;
        while let Ok(event) = events.try_recv() {
            if let AppEvent::ConnectionError { message } = event {
                assert!(message.contains("address in use"));
                reported = true;
            }
        }
        assert!(reported);
    }

    #[tokio::test]
    async fn test_pending_host_start_does_not_block_commands() {
        let h = harness_with(Config::default(), Listen::Silent);
        let ctx = h.ctx.clone();
        let start = tokio::spawn(async move {
            ctx.request(|reply| SessionCommand::StartHost { callsign: String::new(), reply })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = tokio::time::timeout(
            Duration::from_secs(1),
            h.ctx
                .request(|reply| SessionCommand::SetStatus { status: OperatorStatus::Contact, reply }),
        )
        .await
        .unwrap();
        assert_eq!(status, Err(PolicyError::NoSession.into()));

        let again = h
            .ctx
            .request(|reply| SessionCommand::StartHost { callsign: String::new(), reply })
            .await;
        assert_eq!(again, Err(PolicyError::SessionActive.into()));
        let join = h
            .ctx
            .request(|reply| SessionCommand::Join {
                callsign: String::new(),
                session_id: format!("/ip4/10.0.0.9/tcp/4001/p2p/{}", libp2p::PeerId::random()),
                reply,
            })
            .await;
        assert_eq!(join, Err(PolicyError::SessionActive.into()));

        // Leaving cancels the start.
        h.ctx.request(|reply| SessionCommand::Leave { reply }).await.unwrap();
        let result = start.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Connection(ConnectionError::ListenFailed(_)))
        ));
        assert!(!h.ctx.snapshot().active);
    }

    #[tokio::test]
    async fn test_silence_closes_operator_mic() {
        let mut h = harness(Config::default());
        let host_peer = h.join_as_operator().await;

        let state = h.ctx.request(|reply| SessionCommand::HoldTalk { reply }).await.unwrap();
        assert!(state.transmitting);
        assert!(h.audio.lock().unwrap().mic);
        let mut events = h.ctx.event_tx.subscribe();

        h.from_host(&host_peer, SyncMessage::SilenceSet { silenced: true }).await;
        h.wait_for(|s| s.silenced).await;

        let snap = h.ctx.snapshot();
        assert!(!snap.transmit.transmitting);
        assert!(!snap.local.unwrap().is_transmitting);
        assert!(!h.audio.lock().unwrap().mic);

        let mut flips = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let AppEvent::TransmissionChanged { transmitting, .. } = event {
                flips.push(transmitting);
            }
        }
        assert_eq!(flips, vec![false]);

        let refused = h.ctx.request(|reply| SessionCommand::HoldTalk { reply }).await;
        assert_eq!(refused, Err(PolicyError::BlockedBySilence.into()));
    }

    #[tokio::test]
    async fn test_vox_refused_once_per_burst() {
        let mut config = Config::default();
        config.transmit.mode = TransmitMode::Vox;
        config.transmit.vox_hold_ms = 100;
        let mut h = harness(config);
        let host_peer = h.join_as_operator().await;
        h.from_host(&host_peer, SyncMessage::SilenceSet { silenced: true }).await;
        h.wait_for(|s| s.silenced).await;
        let mut events = h.ctx.event_tx.subscribe();

        h.speak(5).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        h.speak(5).await;

        let mut blocked = 0;
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(300), events.recv()).await {
            if matches!(event, AppEvent::TransmissionBlocked { .. }) {
                blocked += 1;
            }
        }
        assert_eq!(blocked, 2);
        assert!(!h.audio.lock().unwrap().mic);
        assert!(!h.ctx.snapshot().transmit.transmitting);
    }
}
