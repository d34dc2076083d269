//! Swarm transfer abstraction
//!
//! The update manager talks to the content distribution engine through this
//! trait, never to a concrete client. A production bittorrent engine plugs
//! in behind it; the in-memory engine below serves tests and proxy-less
//! bring-up, deriving completeness from what is already on disk.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Everything the engine needs to join a swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub info_hash: [u8; 20],
    pub name: String,
    pub tracker: String,
    pub piece_length: u32,
    pub total_length: i64,
    /// Payload paths relative to the data directory
    pub files: Vec<PathBuf>,
}

/// Transfer statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwarmStats {
    pub total_peers: u32,
    pub active_peers: u32,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// A swarm engine.
#[async_trait]
pub trait SwarmClient: Send + Sync {
    /// Attach a torrent and return the handle owning its lifetime.
    async fn add_torrent(&self, metainfo: Metainfo) -> Result<Box<dyn SwarmHandle>>;
}

/// One attached torrent.
#[async_trait]
pub trait SwarmHandle: Send + Sync {
    fn bytes_missing(&self) -> u64;

    /// Ask the engine to fetch every file. Idempotent; may suspend until
    /// the torrent's info is available.
    async fn download_all(&self);

    /// Payload paths relative to the data directory.
    fn files(&self) -> Vec<PathBuf>;

    fn stats(&self) -> SwarmStats;

    /// Begin teardown of the torrent.
    fn drop_torrent(&self);

    /// Resolves once the torrent is fully closed.
    async fn closed(&self);
}

struct MemoryTorrent {
    info_hash: [u8; 20],
    metainfo: Metainfo,
    missing: AtomicU64,
    auto_complete: bool,
    closed_tx: watch::Sender<bool>,
}

/// In-memory swarm engine.
///
/// `bytes_missing` is seeded from the files already present under the data
/// directory; with `auto_complete`, a `download_all` call satisfies the
/// transfer immediately, which is what the tests drive.
pub struct MemorySwarm {
    data_dir: PathBuf,
    auto_complete: bool,
    torrents: parking_lot::Mutex<HashMap<[u8; 20], Arc<MemoryTorrent>>>,
}

impl MemorySwarm {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        MemorySwarm {
            data_dir: data_dir.into(),
            auto_complete: false,
            torrents: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    /// Mark a torrent complete (test hook).
    pub fn complete(&self, info_hash: &[u8; 20]) {
        if let Some(torrent) = self.torrents.lock().get(info_hash) {
            torrent.missing.store(0, Ordering::Relaxed);
        }
    }

    pub fn contains(&self, info_hash: &[u8; 20]) -> bool {
        self.torrents.lock().contains_key(info_hash)
    }

    fn missing_on_disk(&self, metainfo: &Metainfo) -> u64 {
        let mut missing = metainfo.total_length;
        for rel in &metainfo.files {
            if let Ok(meta) = std::fs::metadata(self.data_dir.join(rel)) {
                missing -= meta.len() as i64;
            }
        }
        missing.max(0) as u64
    }
}

#[async_trait]
impl SwarmClient for MemorySwarm {
    async fn add_torrent(&self, metainfo: Metainfo) -> Result<Box<dyn SwarmHandle>> {
        let missing = self.missing_on_disk(&metainfo);
        debug!(
            "attaching torrent {} ({} bytes missing)",
            hex::encode(metainfo.info_hash),
            missing
        );
        let (closed_tx, _) = watch::channel(false);
        let torrent = Arc::new(MemoryTorrent {
            info_hash: metainfo.info_hash,
            metainfo,
            missing: AtomicU64::new(missing),
            auto_complete: self.auto_complete,
            closed_tx,
        });
        self.torrents
            .lock()
            .insert(torrent.info_hash, torrent.clone());
        Ok(Box::new(MemoryHandle(torrent)))
    }
}

struct MemoryHandle(Arc<MemoryTorrent>);

#[async_trait]
impl SwarmHandle for MemoryHandle {
    fn bytes_missing(&self) -> u64 {
        self.0.missing.load(Ordering::Relaxed)
    }

    async fn download_all(&self) {
        if self.0.auto_complete {
            self.0.missing.store(0, Ordering::Relaxed);
        }
    }

    fn files(&self) -> Vec<PathBuf> {
        self.0.metainfo.files.clone()
    }

    fn stats(&self) -> SwarmStats {
        SwarmStats::default()
    }

    fn drop_torrent(&self) {
        let _ = self.0.closed_tx.send(true);
    }

    async fn closed(&self) {
        let mut rx = self.0.closed_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}
