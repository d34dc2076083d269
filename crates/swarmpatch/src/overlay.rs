//! Gossip overlay
//!
//! Forwards short notifications to every peer the session table currently
//! lists, through the server's relay. Fire and forget: the overlay neither
//! retransmits nor deduplicates — receivers that care about duplicates
//! (the update manager does) filter on their own key.

use crate::agent::ClientCommand;
use crate::error::{Result, SwarmpatchError};
use crate::session::SessionSnapshot;
use parking_lot::RwLock;
use std::sync::Arc;
use swarmpatch_wire::PeerId;
use tokio::sync::mpsc;
use tracing::debug;

/// Shared slot holding the latest session-table snapshot.
///
/// The rendezvous client installs a fresh snapshot after every successful
/// refresh; readers clone an `Arc` out and never hold the lock while
/// working, so a broadcast can never block an install.
#[derive(Clone, Default)]
pub struct SnapshotSlot(Arc<RwLock<Arc<SessionSnapshot>>>);

impl SnapshotSlot {
    /// Atomically replace the snapshot.
    pub fn install(&self, snapshot: SessionSnapshot) {
        *self.0.write() = Arc::new(snapshot);
    }

    /// Cheap consistent view of the latest snapshot.
    pub fn load(&self) -> Arc<SessionSnapshot> {
        self.0.read().clone()
    }
}

/// The overlay fan-out half: broadcast to everyone we currently know.
#[derive(Clone)]
pub struct GossipOverlay {
    local: PeerId,
    snapshot: SnapshotSlot,
    outbound: mpsc::Sender<ClientCommand>,
}

impl GossipOverlay {
    pub fn new(
        local: PeerId,
        snapshot: SnapshotSlot,
        outbound: mpsc::Sender<ClientCommand>,
    ) -> Self {
        GossipOverlay {
            local,
            snapshot,
            outbound,
        }
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load()
    }

    /// Enqueue a relay of `payload` to every known peer except ourselves.
    /// Returns the number of peers addressed; an error means the agent is
    /// gone and nothing was (or will be) enqueued further.
    pub async fn broadcast(&self, payload: &[u8]) -> Result<usize> {
        let snapshot = self.snapshot.load();
        let mut addressed = 0;
        for peer in snapshot.peers().filter(|p| **p != self.local) {
            self.outbound
                .send(ClientCommand::SendData {
                    dest: *peer,
                    payload: payload.to_vec(),
                })
                .await
                .map_err(|_| {
                    SwarmpatchError::Overlay("agent command channel closed".to_string())
                })?;
            addressed += 1;
        }
        debug!("broadcast of {} bytes to {} peer(s)", payload.len(), addressed);
        Ok(addressed)
    }
}
