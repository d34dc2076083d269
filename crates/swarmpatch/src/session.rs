//! Session table
//!
//! The server's map of currently alive peers to their external (reflexive)
//! and internal address pairs. Entries are refreshed by Binding and Refresh
//! requests and evicted once they outlive the session TTL. The wire snapshot
//! is MessagePack keyed by the raw 6-byte peer id; JSON rendering exists for
//! operator inspection only and is never consumed by the protocol.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use swarmpatch_wire::PeerId;

/// One live peer as the server sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub peer_id: PeerId,
    /// Reflexive address observed by the server
    pub external: SocketAddr,
    /// Address the peer believes it binds locally
    pub internal: SocketAddr,
    pub last_seen: Instant,
}

/// Map of peer id to session entry, unique on peer id.
///
/// If two endpoints claim the same peer id, the most recent one wins; with a
/// shared short-term password as the only secret, an id collision is
/// indistinguishable from a takeover and is treated as one.
#[derive(Debug, Default)]
pub struct SessionTable {
    entries: HashMap<PeerId, SessionEntry>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert an entry and refresh its `last_seen`.
    pub fn insert_or_update(
        &mut self,
        peer_id: PeerId,
        external: SocketAddr,
        internal: SocketAddr,
        now: Instant,
    ) {
        self.entries.insert(
            peer_id,
            SessionEntry {
                peer_id,
                external,
                internal,
                last_seen: now,
            },
        );
    }

    /// Refresh `last_seen` of an existing entry; true if the peer was known.
    pub fn touch(&mut self, peer_id: &PeerId, now: Instant) -> bool {
        match self.entries.get_mut(peer_id) {
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<SessionEntry> {
        self.entries.remove(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&SessionEntry> {
        self.entries.get(peer_id)
    }

    /// Reverse lookup by the reflexive address, used to identify relay
    /// senders.
    pub fn find_by_external(&self, addr: &SocketAddr) -> Option<&SessionEntry> {
        self.entries.values().find(|e| e.external == *addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries with `last_seen + ttl < now`; returns the eviction
    /// count.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.last_seen + ttl >= now);
        before - self.entries.len()
    }

    /// Deep copy suitable for serialization. Includes every live peer — the
    /// requester too, so agents can check they are visible.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot(
            self.entries
                .values()
                .map(|e| {
                    (
                        e.peer_id,
                        (e.external.to_string(), e.internal.to_string()),
                    )
                })
                .collect(),
        )
    }
}

/// Serializable snapshot of the session table: peer id → (external, internal)
/// address strings. IPv4 renders as `ip:port`, IPv6 as `[ip]:port`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionSnapshot(pub BTreeMap<PeerId, (String, String)>);

impl SessionSnapshot {
    /// MessagePack form carried in Refresh responses.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_msgpack(raw: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(raw)?)
    }

    /// JSON rendering for operator inspection.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.0.contains_key(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the table lists anyone besides the given peer.
    pub fn has_peer_other_than(&self, local: &PeerId) -> bool {
        self.0.keys().any(|p| p != local)
    }
}
