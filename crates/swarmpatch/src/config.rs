//! Configuration management
//!
//! The configuration file is JSON with the section names the deployment
//! tooling already uses (`BitTorrent`, `STUN`). Missing sections and fields
//! fall back to the defaults, so a minimal deployment can run with an empty
//! object.

use crate::defaults;
use crate::error::{Result, SwarmpatchError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Swarm transfer configuration
    #[serde(rename = "BitTorrent")]
    pub bittorrent: SwarmSection,

    /// Rendezvous exchange configuration
    #[serde(rename = "STUN")]
    pub stun: RendezvousSection,

    /// Proxy-only node: participates in distribution, never deploys
    #[serde(rename = "Proxy")]
    pub proxy: bool,

    /// Public key used to verify update descriptors
    #[serde(rename = "PublicKeyPath")]
    pub public_key_path: Option<PathBuf>,

    /// Private key used by the submit tool
    #[serde(rename = "PrivateKeyPath")]
    pub private_key_path: Option<PathBuf>,
}

/// Swarm transfer section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSection {
    #[serde(rename = "Tracker")]
    pub tracker: String,

    #[serde(rename = "PieceLength")]
    pub piece_length: u32,

    /// Where persisted update metadata lives
    #[serde(rename = "MetadataDir")]
    pub metadata_dir: PathBuf,

    /// Where fetched payloads land
    #[serde(rename = "DataDir")]
    pub data_dir: PathBuf,
}

/// Rendezvous exchange section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousSection {
    /// Address of the rendezvous server
    #[serde(rename = "ServerAddress")]
    pub server_address: String,

    /// Local address the agent binds
    #[serde(rename = "AgentAddress")]
    pub agent_address: String,

    /// Shared short-term integrity password
    #[serde(rename = "Password")]
    pub password: String,
}

impl Default for SwarmSection {
    fn default() -> Self {
        SwarmSection {
            tracker: defaults::TRACKER.to_string(),
            piece_length: defaults::PIECE_LENGTH,
            metadata_dir: PathBuf::from(defaults::METADATA_DIR),
            data_dir: PathBuf::from(defaults::DATA_DIR),
        }
    }
}

impl Default for RendezvousSection {
    fn default() -> Self {
        RendezvousSection {
            server_address: defaults::SERVER_ADDRESS.to_string(),
            agent_address: defaults::AGENT_ADDRESS.to_string(),
            password: defaults::STUN_PASSWORD.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bittorrent: SwarmSection::default(),
            stun: RendezvousSection::default(),
            proxy: false,
            public_key_path: None,
            private_key_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn load(config_path: &str) -> Result<Self> {
        let content = fs::read_to_string(config_path).await.map_err(|e| {
            SwarmpatchError::Configuration(format!("cannot read {config_path}: {e}"))
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            SwarmpatchError::Configuration(format!("cannot parse {config_path}: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.stun.server_address.is_empty() {
            return Err(SwarmpatchError::Configuration(
                "STUN.ServerAddress must not be empty".to_string(),
            ));
        }
        if self.stun.password.is_empty() {
            return Err(SwarmpatchError::Configuration(
                "STUN.Password must not be empty".to_string(),
            ));
        }
        if self.bittorrent.piece_length == 0 {
            return Err(SwarmpatchError::Configuration(
                "BitTorrent.PieceLength must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// True when the deployment still runs on the reference password
    pub fn uses_reference_password(&self) -> bool {
        self.stun.password == defaults::STUN_PASSWORD
    }

    /// Create the data and metadata directories if missing
    pub async fn create_directories(&self) -> Result<()> {
        for dir in [&self.bittorrent.metadata_dir, &self.bittorrent.data_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir).await.map_err(|e| {
                    SwarmpatchError::Configuration(format!(
                        "failed to create directory {}: {e}",
                        dir.display()
                    ))
                })?;
            }
        }
        Ok(())
    }
}
