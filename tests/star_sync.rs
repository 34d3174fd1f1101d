//! Drives a host and several operators through an in-memory FIFO star.
//! Each delivery is encoded and decoded, so the wire codec is in the path.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use squadlink_lib::error::PolicyError;
use squadlink_lib::events::AppEvent;
use squadlink_lib::models::{MarkerPosition, Operator, OperatorStatus, Role};
use squadlink_lib::sync::{SyncEffect, SyncEngine, SyncMessage, Target};
use squadlink_lib::voice::{TransmissionController, TransmitChange, TransmitMode, TransmitSettings};

const HOST: &str = "host";

struct Delivery {
    from: String,
    to: String,
    data: Vec<u8>,
}

/// Host at the center, one channel per operator. Operators only talk to the host.
struct Star {
    nodes: BTreeMap<String, SyncEngine>,
    open: HashSet<String>,
    queue: VecDeque<Delivery>,
    /// (to, kind) for every delivered message.
    delivered: Vec<(String, &'static str)>,
    events: BTreeMap<String, Vec<AppEvent>>,
}

impl Star {
    fn new() -> Self {
        let host = SyncEngine::new_host(Operator::new(HOST, "ACTUAL", Role::Host));
        let mut nodes = BTreeMap::new();
        nodes.insert(HOST.to_string(), host);
        Self {
            nodes,
            open: HashSet::new(),
            queue: VecDeque::new(),
            delivered: Vec::new(),
            events: BTreeMap::new(),
        }
    }

    fn engine(&self, id: &str) -> &SyncEngine {
        &self.nodes[id]
    }

    fn engine_mut(&mut self, id: &str) -> &mut SyncEngine {
        self.nodes.get_mut(id).unwrap()
    }

    /// Bring an operator up and open its channel on both ends.
    fn join(&mut self, id: &str, callsign: &str) {
        let op = SyncEngine::new_operator(Operator::new(id, callsign, Role::Operator), HOST);
        self.nodes.insert(id.to_string(), op);
        self.open.insert(id.to_string());
        let host_effects = self.engine_mut(HOST).on_channel_open(id);
        self.perform(HOST, host_effects);
        let op_effects = self.engine_mut(id).on_channel_open(HOST);
        self.perform(id, op_effects);
        self.settle();
    }

    fn disconnect(&mut self, id: &str) {
        self.open.remove(id);
        self.queue.retain(|d| d.from != id && d.to != id);
        let host_effects = self.engine_mut(HOST).on_channel_closed(id);
        self.perform(HOST, host_effects);
        self.nodes.remove(id);
        self.settle();
    }

    /// Run a local action on `id` and let the network quiesce.
    fn act(&mut self, id: &str, action: impl FnOnce(&mut SyncEngine) -> Vec<SyncEffect>) {
        let effects = action(self.engine_mut(id));
        self.perform(id, effects);
        self.settle();
    }

    /// Put raw bytes on a channel, bypassing the sender's engine.
    fn inject(&mut self, from: &str, to: &str, message: SyncMessage) {
        self.queue.push_back(Delivery {
            from: from.to_string(),
            to: to.to_string(),
            data: message.encode().unwrap(),
        });
        self.settle();
    }

    fn channels_of(&self, node: &str) -> Vec<String> {
        if node == HOST {
            let mut peers: Vec<String> = self.open.iter().cloned().collect();
            peers.sort();
            peers
        } else if self.open.contains(node) {
            vec![HOST.to_string()]
        } else {
            Vec::new()
        }
    }

    fn perform(&mut self, node: &str, effects: Vec<SyncEffect>) {
        for effect in effects {
            match effect {
                SyncEffect::Send { target, message } => {
                    let recipients: Vec<String> = match target {
                        Target::All => self.channels_of(node),
                        Target::AllExcept(skip) => {
                            self.channels_of(node).into_iter().filter(|p| *p != skip).collect()
                        }
                        Target::Peer(peer) => vec![peer],
                    };
                    let data = message.encode().unwrap();
                    for to in recipients {
                        self.queue.push_back(Delivery {
                            from: node.to_string(),
                            to,
                            data: data.clone(),
                        });
                    }
                }
                SyncEffect::Emit(event) => {
                    self.events.entry(node.to_string()).or_default().push(event);
                }
            }
        }
    }

    fn settle(&mut self) {
        while let Some(delivery) = self.queue.pop_front() {
            let Some(engine) = self.nodes.get_mut(&delivery.to) else {
                continue;
            };
            let kind = SyncMessage::decode(&delivery.data).unwrap().kind();
            self.delivered.push((delivery.to.clone(), kind));
            let effects = engine.on_message(&delivery.from, &delivery.data);
            self.perform(&delivery.to.clone(), effects);
        }
    }

    fn count_delivered(&self, to: &str, kind: &str) -> usize {
        self.delivered.iter().filter(|(t, k)| t == to && *k == kind).count()
    }

    fn remote_ids(&self, id: &str) -> Vec<String> {
        self.engine(id).roster().keys().cloned().collect()
    }
}

fn squad() -> Star {
    let mut star = Star::new();
    star.join("a", "ALPHA");
    star.join("b", "BRAVO");
    star.join("c", "CHARLIE");
    star
}

fn spot() -> MarkerPosition {
    MarkerPosition { lat: 48.85, lng: 2.35 }
}

#[test]
fn test_every_device_converges_on_full_roster() {
    let star = squad();

    assert_eq!(star.remote_ids(HOST), vec!["a", "b", "c"]);
    assert_eq!(star.remote_ids("a"), vec!["b", "c", "host"]);
    assert_eq!(star.remote_ids("b"), vec!["a", "c", "host"]);
    assert_eq!(star.remote_ids("c"), vec!["a", "b", "host"]);
}

#[test]
fn test_one_roster_sync_per_connection() {
    let star = squad();
    for id in ["a", "b", "c"] {
        assert_eq!(star.count_delivered(id, "SYNC_ROSTER"), 1, "{}", id);
    }
    assert_eq!(star.count_delivered(HOST, "SYNC_ROSTER"), 0);
}

#[test]
fn test_status_change_is_relayed_once_to_each_peer() {
    let mut star = squad();
    let before = star.count_delivered("a", "UPDATE_OPERATOR");

    star.act("b", |sync| sync.set_status(OperatorStatus::Contact));

    assert_eq!(star.engine(HOST).roster()["b"].status, OperatorStatus::Contact);
    assert_eq!(star.engine("a").roster()["b"].status, OperatorStatus::Contact);
    assert_eq!(star.engine("c").roster()["b"].status, OperatorStatus::Contact);
    assert_eq!(star.count_delivered("a", "UPDATE_OPERATOR"), before + 1);
    // The sender never hears its own update back.
    assert!(!star.engine("b").roster().contains_key("b"));
}

#[test]
fn test_host_status_reaches_every_operator() {
    let mut star = squad();

    star.act(HOST, |sync| sync.set_status(OperatorStatus::Contact));

    for id in ["a", "b", "c"] {
        let host_entry = &star.engine(id).roster()[HOST];
        assert_eq!(host_entry.status, OperatorStatus::Contact, "{}", id);
        assert_eq!(host_entry.role, Role::Host);
    }
}

#[test]
fn test_silence_blocks_operators_but_not_host() {
    let mut star = squad();
    let settings = TransmitSettings::default();
    let mut alpha = TransmissionController::new(settings);
    let mut host = TransmissionController::new(settings);

    // Alpha is talking when silence lands.
    assert_eq!(alpha.hold_talk(star.engine("a").gate()), Ok(TransmitChange::Started));
    star.act("a", |sync| sync.set_transmitting(true));
    assert!(star.engine("c").roster()["a"].is_transmitting);

    star.act(HOST, |sync| sync.set_silence(true).unwrap());
    for id in ["a", "b", "c"] {
        assert!(star.engine(id).silenced(), "{}", id);
        assert!(star
            .events
            .get(id)
            .unwrap()
            .contains(&AppEvent::SilenceChanged { silenced: true }));
    }

    // Alpha's device closes the mic and publishes the flip.
    assert_eq!(alpha.force_close(), TransmitChange::Stopped);
    star.act("a", |sync| sync.set_transmitting(false));
    assert!(!star.engine(HOST).roster()["a"].is_transmitting);
    assert!(!star.engine("c").roster()["a"].is_transmitting);

    assert_eq!(alpha.hold_talk(star.engine("a").gate()), Err(PolicyError::BlockedBySilence));
    assert_eq!(host.hold_talk(star.engine(HOST).gate()), Ok(TransmitChange::Started));

    star.act(HOST, |sync| sync.set_silence(false).unwrap());
    assert_eq!(alpha.hold_talk(star.engine("a").gate()), Ok(TransmitChange::Started));
}

#[test]
fn test_vox_refused_under_silence() {
    let mut star = squad();
    star.act(HOST, |sync| sync.set_silence(true).unwrap());

    let mut bravo = TransmissionController::with_mode(TransmitSettings::default(), TransmitMode::Vox);
    let now = Instant::now();
    assert_eq!(
        bravo.on_level(0.5, now, star.engine("b").gate()),
        Err(PolicyError::BlockedBySilence)
    );
    assert!(!bravo.is_transmitting());
    assert_eq!(bravo.on_hold_expired(now + Duration::from_secs(2)), TransmitChange::Unchanged);
}

#[test]
fn test_operator_cannot_set_silence() {
    let mut star = squad();
    assert_eq!(star.engine_mut("a").set_silence(true), Err(PolicyError::HostOnly));

    // A forged SILENCE_SET reaching the host from an operator is dropped and not relayed.
    star.inject("a", HOST, SyncMessage::SilenceSet { silenced: true });
    assert!(!star.engine(HOST).silenced());
    assert!(!star.engine("b").silenced());
}

#[test]
fn test_marker_lifecycle_across_star() {
    let mut star = squad();

    let mut created = None;
    star.act("a", |sync| {
        let (marker, effects) = sync.create_marker(spot(), "RALLY");
        created = Some(marker);
        effects
    });
    let marker = created.unwrap();
    for id in [HOST, "b", "c"] {
        let markers = star.engine(id).markers();
        assert_eq!(markers.len(), 1, "{}", id);
        assert_eq!(markers[0].sender, "ALPHA");
        assert_eq!(markers[0].owner_id, "a");
    }

    // Bravo does not own it.
    assert_eq!(
        star.engine_mut("b").move_marker(&marker.id, spot()),
        Err(PolicyError::NotMarkerOwner(marker.id.clone()))
    );

    // The host may move anyone's marker.
    let moved = MarkerPosition { lat: 1.0, lng: 2.0 };
    star.act(HOST, |sync| sync.move_marker(&marker.id, moved).unwrap());
    for id in ["a", "b", "c"] {
        assert_eq!(star.engine(id).markers()[0].position, moved, "{}", id);
    }

    star.act("a", |sync| sync.delete_marker(&marker.id).unwrap());
    for id in [HOST, "a", "b", "c"] {
        assert!(star.engine(id).markers().is_empty(), "{}", id);
    }
}

#[test]
fn test_forged_marker_delete_is_dropped() {
    let mut star = squad();
    let mut created = None;
    star.act("a", |sync| {
        let (marker, effects) = sync.create_marker(spot(), "OP");
        created = Some(marker);
        effects
    });
    let marker = created.unwrap();

    star.inject("b", HOST, SyncMessage::PingDelete { id: marker.id.clone() });

    for id in [HOST, "a", "c"] {
        assert_eq!(star.engine(id).markers().len(), 1, "{}", id);
    }
}

#[test]
fn test_marker_cannot_be_taken_over() {
    let mut star = squad();
    let mut created = None;
    star.act("a", |sync| {
        let (marker, effects) = sync.create_marker(spot(), "RV");
        created = Some(marker);
        effects
    });
    let marker = created.unwrap();

    // Bravo reuses the id under its own name.
    let mut hijack = marker.clone();
    hijack.owner_id = "b".to_string();
    hijack.label = "HIJACK".to_string();
    star.inject("b", HOST, SyncMessage::PingCreate { marker: hijack.clone() });

    // Alpha's update tries to hand the marker to Bravo.
    let mut handover = hijack;
    handover.position = MarkerPosition { lat: 3.0, lng: 4.0 };
    star.inject("a", HOST, SyncMessage::PingUpdate { marker: handover });

    for id in [HOST, "a", "b", "c"] {
        let stored = &star.engine(id).markers()[0];
        assert_eq!(stored.owner_id, "a", "{}", id);
        assert_eq!(stored.label, "RV", "{}", id);
    }
    // The move itself went through everywhere except Alpha, whose
    // injected update bypassed its own engine.
    for id in [HOST, "b", "c"] {
        assert_eq!(star.engine(id).markers()[0].position, MarkerPosition { lat: 3.0, lng: 4.0 });
    }

    star.inject("b", HOST, SyncMessage::PingDelete { id: marker.id.clone() });
    assert_eq!(star.engine(HOST).markers().len(), 1);
}

#[test]
fn test_unknown_marker_is_refused_locally() {
    let mut star = squad();
    assert_eq!(
        star.engine_mut("c").delete_marker("nope"),
        Err(PolicyError::UnknownMarker("nope".to_string()))
    );
}

#[test]
fn test_late_joiner_receives_markers_and_silence() {
    let mut star = squad();
    star.act("a", |sync| sync.create_marker(spot(), "LZ").1);
    star.act(HOST, |sync| sync.set_silence(true).unwrap());

    star.join("d", "DELTA");

    let delta = star.engine("d");
    assert!(delta.silenced());
    assert_eq!(delta.markers().len(), 1);
    assert_eq!(delta.markers()[0].label, "LZ");
    assert_eq!(star.remote_ids("d"), vec!["a", "b", "c", "host"]);
    assert!(star.engine("a").roster().contains_key("d"));
}

#[test]
fn test_departure_removes_operator_everywhere() {
    let mut star = squad();
    star.disconnect("b");

    assert_eq!(star.remote_ids(HOST), vec!["a", "c"]);
    assert_eq!(star.remote_ids("a"), vec!["c", "host"]);
    assert_eq!(star.remote_ids("c"), vec!["a", "host"]);
    assert_eq!(star.count_delivered("a", "OPERATOR_LEFT"), 1);
}

#[test]
fn test_operator_left_from_non_host_is_ignored() {
    let mut star = squad();
    star.inject("c", "a", SyncMessage::OperatorLeft { id: "b".to_string() });
    assert!(star.engine("a").roster().contains_key("b"));
}
