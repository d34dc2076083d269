//! swarmpatch - peer-to-peer secure update distribution

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarmpatch::agent::{ClientConfig, RendezvousClient};
use swarmpatch::descriptor::{self, UpdateDescriptor, UUID_SHELL};
use swarmpatch::overlay::{GossipOverlay, SnapshotSlot};
use swarmpatch::swarm::MemorySwarm;
use swarmpatch::update::{AgentContext, UpdateManager};
use swarmpatch::{peer, Config, RendezvousServer, Result, SwarmpatchError};
use swarmpatch_wire::{Class, Codec, Message, MessageType, Method, PeerData, PeerId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "swarmpatch")]
#[command(version, about = "Peer-to-peer secure update distribution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(long, global = true, default_value = swarmpatch::defaults::CONFIG_FILE)]
    config_file: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous server
    Server {
        /// Address the server listens on
        #[arg(short, long, default_value = swarmpatch::defaults::SERVER_ADDRESS)]
        address: String,
    },

    /// Run the update agent
    Agent,

    /// Build and sign an update descriptor
    Submit {
        /// Update payload, a file or a directory
        #[arg(short, long)]
        file: PathBuf,

        /// Update version
        #[arg(short, long)]
        version: u32,

        /// Target resource UUID
        #[arg(short, long, default_value_t = UUID_SHELL, value_parser = Uuid::parse_str)]
        uuid: Uuid,

        /// Private key for signing (PEM)
        #[arg(short = 'k', long)]
        private_key: Option<PathBuf>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Emit JSON instead of bencode
        #[arg(short, long)]
        json: bool,
    },

    /// Send a one-off message to an agent or server (connectivity smoke test)
    Send {
        /// Address to send to
        #[arg(short, long)]
        address: String,

        /// Relay target peer id (hex); when set, the message goes through
        /// the server as a relay request and the reply is printed
        #[arg(short, long)]
        peer: Option<String>,

        /// Message to be sent
        #[arg(short, long, default_value = "Aloha!")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("swarmpatch={log_level},warn"))
        .with_target(false)
        .init();

    match cli.command {
        Commands::Server { address } => run_server(&cli.config_file, &address).await,
        Commands::Agent => run_agent(&cli.config_file).await,
        Commands::Submit {
            file,
            version,
            uuid,
            private_key,
            output,
            json,
        } => submit(&cli.config_file, file, version, uuid, private_key, output, json).await,
        Commands::Send {
            address,
            peer,
            message,
        } => send(&cli.config_file, &address, peer, &message).await,
    }
}

async fn run_server(config_file: &str, address: &str) -> Result<()> {
    let config = Config::load(config_file).await?;
    if config.uses_reference_password() {
        warn!("running with the reference integrity password; override STUN.Password for real deployments");
    }

    let server = Arc::new(RendezvousServer::bind(address, &config.stun.password).await?);
    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    runner
        .await
        .map_err(|e| SwarmpatchError::AgentRuntime(e.to_string()))??;
    info!("server is exiting");
    Ok(())
}

async fn run_agent(config_file: &str) -> Result<()> {
    let config = Config::load(config_file).await?;
    config.create_directories().await?;
    if config.uses_reference_password() {
        warn!("running with the reference integrity password; override STUN.Password for real deployments");
    }

    let peer_id = peer::local_peer_id()?;

    // no key means every received descriptor is rejected; the agent still
    // relays and serves the swarm
    let public_key = match &config.public_key_path {
        Some(path) => Some(descriptor::load_public_key(path)?),
        None => {
            warn!("no PublicKeyPath configured; incoming updates will fail verification");
            None
        }
    };

    let mut ctx = AgentContext::new(
        &config.bittorrent.data_dir,
        &config.bittorrent.metadata_dir,
    );
    ctx.proxy = config.proxy;
    ctx.public_key = public_key;

    let swarm = Arc::new(MemorySwarm::new(&config.bittorrent.data_dir));
    let slot = SnapshotSlot::default();
    let (inbound_tx, mut inbound_rx) = mpsc::channel(256);

    let client = RendezvousClient::start(
        ClientConfig::new(
            &config.stun.server_address,
            &config.stun.agent_address,
            peer_id,
            &config.stun.password,
        ),
        slot.clone(),
        inbound_tx,
    )
    .await?;

    let overlay = GossipOverlay::new(peer_id, slot, client.commands());
    let manager = Arc::new(UpdateManager::new(ctx, swarm, overlay));
    manager.load_persisted().await;

    // notification sink: every relayed payload is tried as a descriptor
    let sink = {
        let manager = manager.clone();
        tokio::spawn(async move {
            while let Some((sender, payload)) = inbound_rx.recv().await {
                let descriptor = match UpdateDescriptor::from_bytes(&payload) {
                    Ok(descriptor) => descriptor,
                    Err(e) => {
                        debug!("payload from {sender} is not a descriptor: {e}");
                        continue;
                    }
                };
                let (uuid, version) = descriptor.key();
                match manager.admit(descriptor, &sender.to_string()).await {
                    Ok(()) => info!("admitted update uuid:{uuid} version:{version} from {sender}"),
                    Err(
                        e @ (SwarmpatchError::AlreadyExists { .. } | SwarmpatchError::IsOlder { .. }),
                    ) => debug!("ignoring update uuid:{uuid} version:{version}: {e}"),
                    Err(e) => warn!("rejected update uuid:{uuid} version:{version}: {e}"),
                }
            }
        })
    };

    info!("agent {peer_id} is running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    client.shutdown().await?;
    manager.stop_all().await;
    let _ = sink.await;
    info!("agent has been shut down");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn submit(
    config_file: &str,
    file: PathBuf,
    version: u32,
    uuid: Uuid,
    private_key: Option<PathBuf>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let config = Config::load(config_file).await?;

    if !file.exists() {
        return Err(SwarmpatchError::Configuration(format!(
            "update payload '{}' does not exist",
            file.display()
        )));
    }

    let key_path = private_key
        .or_else(|| config.private_key_path.clone())
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh/id_rsa")))
        .ok_or_else(|| {
            SwarmpatchError::Configuration("no private key path available".to_string())
        })?;
    let key = descriptor::load_private_key(&key_path)?;

    let mut update = descriptor::from_payload(
        &file,
        uuid,
        version,
        &config.bittorrent.tracker,
        config.bittorrent.piece_length,
    )?;
    update.sign(&key)?;

    let encoded = if json {
        serde_json::to_vec(&update)?
    } else {
        update.to_bytes()?
    };
    match output {
        Some(path) => std::fs::write(path, encoded)?,
        None => std::io::stdout().write_all(&encoded)?,
    }
    Ok(())
}

async fn send(
    config_file: &str,
    address: &str,
    peer: Option<String>,
    message: &str,
) -> Result<()> {
    let config = Config::load(config_file).await?;
    let codec = Codec::new(config.stun.password.clone());
    let local = peer::local_peer_id()?;

    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(address).await?;

    let payload = PeerData::new(message.as_bytes().to_vec())?;
    match peer {
        // relay through the server and report the outcome
        Some(target) => {
            let target: PeerId = target.parse()?;
            let request = Message::new(MessageType::new(Method::Data, Class::Request))
                .with(&target)?
                .with(&payload)?;
            socket.send(&codec.encode(&request)?).await?;

            let mut buf = vec![0u8; 2048];
            let len = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut buf))
                .await
                .map_err(|_| SwarmpatchError::TransactionTimeout)??;
            let response = codec.decode(&buf[..len])?;
            match response.kind().class {
                Class::SuccessResponse => println!("relayed to {target}"),
                _ => println!("relay refused: {}", response.kind()),
            }
        }
        // poke the target directly with an indication
        None => {
            let indication = Message::new(MessageType::new(Method::Data, Class::Indication))
                .with(&local)?
                .with(&payload)?;
            socket.send(&codec.encode(&indication)?).await?;
            println!("sent {} bytes to {address}", message.len());
        }
    }
    Ok(())
}
