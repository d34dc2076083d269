//! swarmpatch — peer-to-peer signed update distribution
//!
//! Delivers signed software updates to a fleet of devices behind NATs. A
//! rendezvous server tracks who is reachable where and relays short
//! messages; agents gossip signed update descriptors over that relay and
//! fetch the payloads from each other through a swarm transfer engine.

pub mod agent;
pub mod config;
pub mod deploy;
pub mod descriptor;
pub mod error;
pub mod overlay;
pub mod peer;
pub mod server;
pub mod session;
pub mod swarm;
pub mod update;

// Re-export main types
pub use agent::{AgentState, RendezvousClient};
pub use config::Config;
pub use descriptor::UpdateDescriptor;
pub use error::{Result, SwarmpatchError};
pub use overlay::GossipOverlay;
pub use server::RendezvousServer;
pub use update::UpdateManager;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default rendezvous server listen address (IANA STUN port)
    pub const SERVER_ADDRESS: &str = "0.0.0.0:3478";

    /// Default agent bind address
    pub const AGENT_ADDRESS: &str = "0.0.0.0:9322";

    /// Short-term integrity password of the reference deployment.
    /// Deployments must override it; both server and agent warn loudly
    /// when it is still in use.
    pub const STUN_PASSWORD: &str = "123";

    /// Session entries older than this are evicted
    pub const SESSION_TTL_SECS: u64 = 60;

    /// Keep-alive cadence for the NAT binding
    pub const KEEP_ALIVE_SECS: u64 = 30;

    /// Session-table refresh cadence
    pub const REFRESH_MILLIS: u64 = 1_000;

    /// Deadline for a request's reply
    pub const REPLY_TIMEOUT_SECS: u64 = 5;

    /// Keep-alive failures tolerated before re-registering
    pub const SOFT_ERROR_LIMIT: u32 = 3;

    /// Update monitor tick
    pub const MONITOR_TICK_SECS: u64 = 5;

    /// Deployment failures tolerated before an update is parked
    pub const DEPLOY_FAILS_LIMIT: u32 = 5;

    /// Wall-clock budget for one deployment script
    pub const DEPLOY_TIMEOUT_SECS: u64 = 600;

    /// Default swarm piece length
    pub const PIECE_LENGTH: u32 = 32 * 1024;

    /// Default swarm tracker announce URL
    pub const TRACKER: &str = "https://tracker.swarmpatch.org:443/announce";

    /// Default configuration file
    pub const CONFIG_FILE: &str = "config.json";

    /// Default update payload directory
    pub const DATA_DIR: &str = "/var/lib/swarmpatch/data";

    /// Default update metadata directory
    pub const METADATA_DIR: &str = "/var/lib/swarmpatch/metadata";
}
