pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod models;
pub mod network;
pub mod services;
pub mod session;
pub mod state;
pub mod sync;
pub mod voice;

use libp2p::identity::Keypair;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::config::Config;
use crate::events::create_event_bus;
use crate::network::{NetworkCommand, NetworkEvent};
use crate::session::runtime::desktop_hardware;
use crate::session::{Bootstrap, SessionCommand, SessionRuntime, SessionSnapshot};
use crate::state::ServiceContext;

/// Create the shared context and the receiving ends the background tasks own.
fn create_service_context(
    keypair: &Keypair,
) -> (
    ServiceContext,
    mpsc::Receiver<SessionCommand>,
    watch::Sender<SessionSnapshot>,
) {
    let peer_id = libp2p::PeerId::from(keypair.public()).to_string();
    info!("My peer ID: {}", peer_id);

    let (session_tx, session_rx) = mpsc::channel::<SessionCommand>(64);
    let (event_tx, _event_rx) = create_event_bus();
    let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());

    let ctx = ServiceContext {
        peer_id,
        session_tx,
        event_tx,
        state_rx,
    };
    (ctx, session_rx, state_tx)
}

/// Spawn the libp2p swarm event loop. It only carries signaling.
fn spawn_network(
    keypair: Keypair,
    config: &Config,
    network_rx: mpsc::Receiver<NetworkCommand>,
    net_tx: mpsc::Sender<NetworkEvent>,
    peer_id: String,
) {
    let listen_port = config.network.listen_port;
    let advertise_addr = config.network.advertise_addr.clone();
    tokio::spawn(async move {
        let swarm = match network::swarm::build_swarm(&keypair) {
            Ok(swarm) => swarm,
            Err(e) => {
                error!("Failed to build swarm: {}", e);
                return;
            }
        };
        network::swarm::run_event_loop(swarm, network_rx, net_tx, peer_id, listen_port, advertise_addr).await;
    });
}

/// Spawn the session loop that owns all session state.
fn spawn_session(
    config: Config,
    ctx: &ServiceContext,
    network_tx: mpsc::Sender<NetworkCommand>,
    net_rx: mpsc::Receiver<NetworkEvent>,
    session_rx: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<SessionSnapshot>,
) {
    let (runtime, peer_rx) = SessionRuntime::new(
        config,
        ctx.peer_id.clone(),
        network_tx,
        ctx.event_tx.clone(),
        state_tx,
        desktop_hardware(),
    );
    tokio::spawn(session::run_session(runtime, session_rx, net_rx, peer_rx));
}

/// Enter the session requested on the command line.
async fn bootstrap_session(ctx: &ServiceContext, bootstrap: Bootstrap) {
    match bootstrap {
        Bootstrap::Host { callsign } => match services::session::start_host(ctx, &callsign).await {
            Ok(session_id) => println!("Session ID: {}", session_id),
            Err(e) => error!("Failed to start hosting: {}", e),
        },
        Bootstrap::Join { callsign, session_id } => {
            match services::session::join(ctx, &callsign, &session_id).await {
                Ok(()) => info!("Joined session {}", session_id),
                Err(e) => error!("Failed to join {}: {}", session_id, e),
            }
        }
    }
}

/// Run headless: swarm, session loop and the local API server.
/// Returns when the API server stops.
pub async fn run(config: Config, bootstrap: Option<Bootstrap>) -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let keypair = Keypair::generate_ed25519();
    let (ctx, session_rx, state_tx) = create_service_context(&keypair);

    let (network_tx, network_rx) = mpsc::channel::<NetworkCommand>(256);
    let (net_tx, net_rx) = mpsc::channel::<NetworkEvent>(256);
    spawn_network(keypair, &config, network_rx, net_tx, ctx.peer_id.clone());

    let api_port = config.api.port;
    spawn_session(config, &ctx, network_tx, net_rx, session_rx, state_tx);

    if let Some(bootstrap) = bootstrap {
        let boot_ctx = ctx.clone();
        tokio::spawn(async move {
            bootstrap_session(&boot_ctx, bootstrap).await;
        });
    }

    api::server::start_api_server(ctx, api_port).await
}
