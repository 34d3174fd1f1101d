use std::path::PathBuf;

use clap::Parser;

use squadlink_lib::config::Config;
use squadlink_lib::session::Bootstrap;
use squadlink_lib::voice::TransmitMode;

#[derive(Parser)]
#[command(name = "squadlink", about = "Serverless P2P squad link")]
struct Cli {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start hosting a session on launch
    #[arg(long, conflicts_with = "join")]
    host: bool,

    /// Join the session with this id on launch
    #[arg(long)]
    join: Option<String>,

    /// Callsign shown to the squad
    #[arg(long)]
    callsign: Option<String>,

    /// API server port
    #[arg(long)]
    port: Option<u16>,

    /// libp2p listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Address advertised in the session id
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Start in voice-activated mode
    #[arg(long)]
    vox: bool,

    /// VOX RMS threshold (0, 1]
    #[arg(long)]
    vox_threshold: Option<f32>,

    /// VOX hold time in milliseconds
    #[arg(long)]
    vox_hold_ms: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(callsign) = &self.callsign {
            config.callsign = Some(callsign.clone());
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(port) = self.listen_port {
            config.network.listen_port = port;
        }
        if let Some(addr) = &self.advertise_addr {
            config.network.advertise_addr = Some(addr.clone());
        }
        if self.vox {
            config.transmit.mode = TransmitMode::Vox;
        }
        if let Some(threshold) = self.vox_threshold {
            config.transmit.vox_threshold = threshold;
        }
        if let Some(hold) = self.vox_hold_ms {
            config.transmit.vox_hold_ms = hold;
        }
    }

    fn bootstrap(&self, config: &Config) -> Option<Bootstrap> {
        let callsign = config.callsign.clone().unwrap_or_default();
        if self.host {
            Some(Bootstrap::Host { callsign })
        } else {
            self.join.as_ref().map(|session_id| Bootstrap::Join {
                callsign,
                session_id: session_id.clone(),
            })
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        },
        None => Config::default(),
    };
    cli.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(2);
    }
    let bootstrap = cli.bootstrap(&config);

    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    if let Err(e) = rt.block_on(squadlink_lib::run(config, bootstrap)) {
        eprintln!("API server error: {}", e);
        std::process::exit(1);
    }
}
