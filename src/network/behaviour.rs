use libp2p::{gossipsub, identify, swarm::NetworkBehaviour};

#[derive(NetworkBehaviour)]
pub struct SquadBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
}
