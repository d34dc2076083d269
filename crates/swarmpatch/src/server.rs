//! Rendezvous server
//!
//! A single UDP socket serves the whole fleet: Binding requests register the
//! sender's reflexive address, Refresh requests hand back the session table,
//! Data requests are relayed to the named peer as an indication. Anything
//! that fails validation is dropped without an answer — unauthenticated
//! senders learn nothing, not even that a server is listening.

use crate::error::Result;
use crate::session::{SessionSnapshot, SessionTable};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use swarmpatch_wire::{
    Class, Codec, ErrorCode, Message, MessageType, Method, PeerData, PeerId, SwarmPorts,
    XorMappedAddress,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

const BINDING_SUCCESS: MessageType = MessageType::new(Method::Binding, Class::SuccessResponse);
const REFRESH_SUCCESS: MessageType = MessageType::new(Method::Refresh, Class::SuccessResponse);
const REFRESH_ERROR: MessageType = MessageType::new(Method::Refresh, Class::ErrorResponse);
const DATA_SUCCESS: MessageType = MessageType::new(Method::Data, Class::SuccessResponse);
const DATA_ERROR: MessageType = MessageType::new(Method::Data, Class::ErrorResponse);
const DATA_INDICATION: MessageType = MessageType::new(Method::Data, Class::Indication);

/// Counters exposed for operators and tests.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    protocol_errors: AtomicU64,
    bindings: AtomicU64,
    refreshes: AtomicU64,
    relays: AtomicU64,
    relay_failures: AtomicU64,
}

impl ServerMetrics {
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    pub fn bindings(&self) -> u64 {
        self.bindings.load(Ordering::Relaxed)
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn relays(&self) -> u64 {
        self.relays.load(Ordering::Relaxed)
    }

    pub fn relay_failures(&self) -> u64 {
        self.relay_failures.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The rendezvous server.
pub struct RendezvousServer {
    socket: UdpSocket,
    codec: Codec,
    sessions: RwLock<SessionTable>,
    metrics: ServerMetrics,
    session_ttl: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl RendezvousServer {
    /// Bind the server socket. Failing to bind is fatal to the process.
    pub async fn bind(addr: &str, password: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("rendezvous server listening on {}", socket.local_addr()?);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(RendezvousServer {
            socket,
            // the server only talks to its own fleet; anything advertising
            // other software is dropped like any other invalid message
            codec: Codec::new(password).require_matching_software(),
            sessions: RwLock::new(SessionTable::new()),
            metrics: ServerMetrics::default(),
            session_ttl: Duration::from_secs(crate::defaults::SESSION_TTL_SECS),
            shutdown_tx,
        })
    }

    /// Override the session TTL (tests shrink it).
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Current session table snapshot (operator inspection, tests).
    pub fn snapshot(&self) -> SessionSnapshot {
        self.sessions.read().snapshot()
    }

    /// Ask a running server to exit its receive loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Receive loop. Datagram handling is bounded — decode, one table
    /// access, at most two sends; nothing slow runs on this path.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // expiry must fire at least once per TTL/2
        let mut expiry = interval(self.session_ttl / 2);
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("rendezvous server shutting down");
                    break;
                }
                _ = expiry.tick() => {
                    let evicted = self
                        .sessions
                        .write()
                        .expire(Instant::now(), self.session_ttl);
                    if evicted > 0 {
                        info!("expired {evicted} stale session(s)");
                        if let Ok(table) = self.snapshot().to_json() {
                            debug!("session table now {table}");
                        }
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => warn!("socket receive error: {e}"),
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let msg = match self.codec.decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                // silent drop; unauthenticated senders get no answer
                ServerMetrics::bump(&self.metrics.protocol_errors);
                debug!("dropping datagram from {from}: {e}");
                return;
            }
        };

        match (msg.kind().method, msg.kind().class) {
            (Method::Binding, Class::Request) => self.handle_binding(msg, from).await,
            (Method::Refresh, Class::Request) => self.handle_refresh(msg, from).await,
            (Method::Data, Class::Request) => self.handle_data(msg, from).await,
            (Method::ChannelBind, Class::Indication) => {
                // reserved overlay extension hook
                debug!("channel-bind indication from {from} acknowledged");
            }
            (method, class) => {
                ServerMetrics::bump(&self.metrics.protocol_errors);
                debug!("unexpected {method} {class:?} from {from}");
            }
        }
    }

    async fn handle_binding(&self, msg: Message, from: SocketAddr) {
        let peer = match msg.get::<PeerId>() {
            Ok(peer) => peer,
            Err(_) => return,
        };
        // the advertised internal port rides in EvenPort; without it the
        // reflexive endpoint doubles as the internal one
        let internal = match msg.get::<SwarmPorts>() {
            Ok(ports) => SocketAddr::new(from.ip(), ports.internal),
            Err(_) => from,
        };

        self.sessions
            .write()
            .insert_or_update(peer, from, internal, Instant::now());
        ServerMetrics::bump(&self.metrics.bindings);
        debug!("binding from {peer} at {from}");

        let response = Message::response_to(BINDING_SUCCESS, msg.transaction_id())
            .with(&peer)
            .and_then(|m| m.with(&XorMappedAddress(from)));
        match response {
            Ok(response) => self.send(&response, from).await,
            Err(e) => warn!("failed to build binding response: {e}"),
        }
    }

    async fn handle_refresh(&self, msg: Message, from: SocketAddr) {
        let peer = match msg.get::<PeerId>() {
            Ok(peer) => peer,
            Err(_) => return,
        };

        // a session entry comes from a Binding, never from a bare Refresh
        let snapshot = {
            let mut sessions = self.sessions.write();
            if sessions.touch(&peer, Instant::now()) {
                Some(sessions.snapshot())
            } else {
                None
            }
        };
        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => {
                debug!("refresh from unregistered peer {peer} at {from}");
                let response = Message::response_to(REFRESH_ERROR, msg.transaction_id())
                    .with(&peer)
                    .and_then(|m| m.with(&ErrorCode::not_registered()));
                match response {
                    Ok(response) => self.send(&response, from).await,
                    Err(e) => warn!("failed to build refresh error response: {e}"),
                }
                return;
            }
        };
        ServerMetrics::bump(&self.metrics.refreshes);

        let response = snapshot
            .to_msgpack()
            .map_err(|e| e.to_string())
            .and_then(|packed| {
                PeerData::new(packed)
                    .map_err(|e| e.to_string())
                    .and_then(|data| {
                        Message::response_to(REFRESH_SUCCESS, msg.transaction_id())
                            .with(&peer)
                            .and_then(|m| m.with(&data))
                            .map_err(|e| e.to_string())
                    })
            });
        match response {
            Ok(response) => self.send(&response, from).await,
            Err(e) => warn!("failed to build refresh response: {e}"),
        }
    }

    async fn handle_data(&self, msg: Message, from: SocketAddr) {
        // Username names the destination; the sender is identified by its
        // reflexive address
        let dest = match msg.get::<PeerId>() {
            Ok(dest) => dest,
            Err(_) => return,
        };
        let payload = match msg.get::<PeerData>() {
            Ok(payload) => payload,
            Err(e) => {
                ServerMetrics::bump(&self.metrics.protocol_errors);
                debug!("data request from {from} without payload: {e}");
                return;
            }
        };

        let (sender, target) = {
            let sessions = self.sessions.read();
            (
                sessions.find_by_external(&from).map(|e| e.peer_id),
                sessions.get(&dest).map(|e| e.external),
            )
        };

        let sender = match sender {
            Some(sender) => sender,
            None => {
                ServerMetrics::bump(&self.metrics.relay_failures);
                debug!("relay from unregistered endpoint {from}");
                self.send_data_error(&msg, &dest, ErrorCode::not_registered(), from)
                    .await;
                return;
            }
        };

        let target = match target {
            Some(target) => target,
            None => {
                ServerMetrics::bump(&self.metrics.relay_failures);
                debug!("relay target {dest} not in session table");
                self.send_data_error(&msg, &sender, ErrorCode::peer_not_found(), from)
                    .await;
                return;
            }
        };

        let indication = Message::new(DATA_INDICATION)
            .with(&sender)
            .and_then(|m| m.with(&payload));
        match indication {
            Ok(indication) => {
                self.send(&indication, target).await;
                ServerMetrics::bump(&self.metrics.relays);
                debug!("relayed {} bytes {sender} -> {dest}", payload.0.len());

                match Message::response_to(DATA_SUCCESS, msg.transaction_id()).with(&sender) {
                    Ok(response) => self.send(&response, from).await,
                    Err(e) => warn!("failed to build data response: {e}"),
                }
            }
            Err(e) => warn!("failed to build data indication: {e}"),
        }
    }

    async fn send_data_error(
        &self,
        request: &Message,
        username: &PeerId,
        code: ErrorCode,
        to: SocketAddr,
    ) {
        let response = Message::response_to(DATA_ERROR, request.transaction_id())
            .with(username)
            .and_then(|m| m.with(&code));
        match response {
            Ok(response) => self.send(&response, to).await,
            Err(e) => warn!("failed to build data error response: {e}"),
        }
    }

    async fn send(&self, msg: &Message, to: SocketAddr) {
        match self.codec.encode(msg) {
            Ok(wire) => {
                if let Err(e) = self.socket.send_to(&wire, to).await {
                    warn!("send to {to} failed: {e}");
                }
            }
            Err(e) => warn!("failed to encode {}: {e}", msg.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmpatch_wire::WireError;
    use tokio::time::timeout;

    struct TestPeer {
        socket: UdpSocket,
        codec: Codec,
        id: PeerId,
    }

    impl TestPeer {
        async fn new(id_last: u8) -> Self {
            TestPeer {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                codec: Codec::new("123"),
                id: PeerId([0, 0, 0, 0, 0, id_last]),
            }
        }

        async fn send(&self, msg: &Message, to: SocketAddr) {
            let wire = self.codec.encode(msg).unwrap();
            self.socket.send_to(&wire, to).await.unwrap();
        }

        async fn recv(&self) -> Message {
            let mut buf = vec![0u8; 64 * 1024];
            let (len, _) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
                .await
                .expect("timed out waiting for datagram")
                .unwrap();
            self.codec.decode(&buf[..len]).unwrap()
        }

        async fn recv_nothing(&self) {
            let mut buf = vec![0u8; 1024];
            let outcome =
                timeout(Duration::from_millis(300), self.socket.recv_from(&mut buf)).await;
            assert!(outcome.is_err(), "expected silence, got a datagram");
        }

        fn binding_request(&self) -> Message {
            Message::new(MessageType::new(Method::Binding, Class::Request))
                .with(&self.id)
                .unwrap()
        }
    }

    async fn start_server() -> (Arc<RendezvousServer>, SocketAddr) {
        let server = Arc::new(RendezvousServer::bind("127.0.0.1:0", "123").await.unwrap());
        let addr = server.local_addr().unwrap();
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        (server, addr)
    }

    #[tokio::test]
    async fn binding_registers_and_reflects_address() {
        let (server, addr) = start_server().await;
        let peer = TestPeer::new(1).await;

        peer.send(&peer.binding_request(), addr).await;
        let response = peer.recv().await;

        assert!(response.is(Method::Binding, Class::SuccessResponse));
        let mapped = response.get::<XorMappedAddress>().unwrap();
        assert_eq!(mapped.0, peer.socket.local_addr().unwrap());
        assert!(server.snapshot().contains(&peer.id));
        assert_eq!(server.metrics().bindings(), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn invalid_integrity_produces_no_reply_and_no_mutation() {
        let (server, addr) = start_server().await;
        let peer = TestPeer::new(2).await;

        let bad_codec = Codec::new("wrong-password");
        let wire = bad_codec.encode(&peer.binding_request()).unwrap();
        peer.socket.send_to(&wire, addr).await.unwrap();

        peer.recv_nothing().await;
        assert!(server.snapshot().is_empty());
        assert_eq!(server.metrics().protocol_errors(), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn corrupted_datagram_is_counted_and_dropped() {
        let (server, addr) = start_server().await;
        let peer = TestPeer::new(3).await;

        let mut wire = peer.codec.encode(&peer.binding_request()).unwrap().to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        // confirm the corruption actually breaks the message
        assert!(matches!(
            peer.codec.decode(&wire),
            Err(WireError::Fingerprint | WireError::Malformed(_))
        ));
        peer.socket.send_to(&wire, addr).await.unwrap();

        peer.recv_nothing().await;
        assert!(server.snapshot().is_empty());
        assert_eq!(server.metrics().protocol_errors(), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn foreign_software_is_counted_and_dropped() {
        let (server, addr) = start_server().await;
        let peer = TestPeer::new(8).await;

        let rogue = Codec::new("123").with_software("rogue/agent");
        let wire = rogue.encode(&peer.binding_request()).unwrap();
        peer.socket.send_to(&wire, addr).await.unwrap();

        peer.recv_nothing().await;
        assert!(server.snapshot().is_empty());
        assert_eq!(server.metrics().protocol_errors(), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn refresh_from_unknown_peer_is_refused() {
        let (server, addr) = start_server().await;
        let peer = TestPeer::new(9).await;

        let refresh = Message::new(MessageType::new(Method::Refresh, Class::Request))
            .with(&peer.id)
            .unwrap();
        peer.send(&refresh, addr).await;

        let response = peer.recv().await;
        assert!(response.is(Method::Refresh, Class::ErrorResponse));
        assert_eq!(response.get::<ErrorCode>().unwrap().code, 401);
        assert!(server.snapshot().is_empty(), "no session from a bare refresh");
        assert_eq!(server.metrics().refreshes(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn refresh_payload_lists_every_peer_including_requester() {
        let (server, addr) = start_server().await;
        let alice = TestPeer::new(4).await;
        let bob = TestPeer::new(5).await;

        alice.send(&alice.binding_request(), addr).await;
        alice.recv().await;
        bob.send(&bob.binding_request(), addr).await;
        bob.recv().await;

        let refresh = Message::new(MessageType::new(Method::Refresh, Class::Request))
            .with(&bob.id)
            .unwrap();
        bob.send(&refresh, addr).await;
        let response = bob.recv().await;

        assert!(response.is(Method::Refresh, Class::SuccessResponse));
        let data = response.get::<PeerData>().unwrap();
        let snapshot = SessionSnapshot::from_msgpack(&data.0).unwrap();
        assert!(snapshot.contains(&alice.id));
        assert!(snapshot.contains(&bob.id), "requester must see itself");
        let (external, _) = snapshot.0.get(&alice.id).unwrap();
        assert_eq!(external, &alice.socket.local_addr().unwrap().to_string());
        server.shutdown();
    }

    #[tokio::test]
    async fn binding_with_swarm_ports_records_internal_endpoint() {
        let (server, addr) = start_server().await;
        let peer = TestPeer::new(6).await;

        let request = peer
            .binding_request()
            .with(&SwarmPorts {
                external: 6881,
                internal: 7001,
            })
            .unwrap();
        peer.send(&request, addr).await;
        peer.recv().await;

        let snapshot = server.snapshot();
        let (_, internal) = snapshot.0.get(&peer.id).unwrap();
        assert!(internal.ends_with(":7001"), "internal was {internal}");
        server.shutdown();
    }

    #[tokio::test]
    async fn expiry_evicts_silent_peers() {
        let server = Arc::new(
            RendezvousServer::bind("127.0.0.1:0", "123")
                .await
                .unwrap()
                .with_session_ttl(Duration::from_millis(200)),
        );
        let addr = server.local_addr().unwrap();
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });

        let peer = TestPeer::new(7).await;
        peer.send(&peer.binding_request(), addr).await;
        peer.recv().await;
        assert!(server.snapshot().contains(&peer.id));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(server.snapshot().is_empty());
        server.shutdown();
    }
}
