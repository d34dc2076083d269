//! End-to-end scenarios over loopback UDP: session-table refresh, relay,
//! gossip-driven update propagation, and the deployment failure budget.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use swarmpatch::agent::{ClientCommand, ClientConfig, RendezvousClient};
use swarmpatch::descriptor::{self, UpdateDescriptor, UUID_SHELL};
use swarmpatch::overlay::{GossipOverlay, SnapshotSlot};
use swarmpatch::session::SessionSnapshot;
use swarmpatch::swarm::MemorySwarm;
use swarmpatch::update::{AgentContext, UpdateManager};
use swarmpatch::RendezvousServer;
use swarmpatch_wire::{Class, Codec, ErrorCode, Message, MessageType, Method, PeerData, PeerId};
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

const PASSWORD: &str = "123";

fn signing_key() -> &'static rsa::RsaPrivateKey {
    static KEY: OnceLock<rsa::RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
}

async fn start_server() -> (Arc<RendezvousServer>, SocketAddr) {
    let server = Arc::new(
        RendezvousServer::bind("127.0.0.1:0", PASSWORD)
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let runner = server.clone();
    tokio::spawn(async move { runner.run().await });
    (server, addr)
}

/// Raw wire-level peer for the protocol scenarios.
struct WirePeer {
    socket: UdpSocket,
    codec: Codec,
    id: PeerId,
}

impl WirePeer {
    async fn new(id: PeerId) -> Self {
        WirePeer {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            codec: Codec::new(PASSWORD),
            id,
        }
    }

    async fn register(&self, server: SocketAddr) {
        let request = Message::new(MessageType::new(Method::Binding, Class::Request))
            .with(&self.id)
            .unwrap();
        self.send(&request, server).await;
        let response = self.recv().await;
        assert!(response.is(Method::Binding, Class::SuccessResponse));
    }

    async fn send(&self, msg: &Message, to: SocketAddr) {
        let wire = self.codec.encode(msg).unwrap();
        self.socket.send_to(&wire, to).await.unwrap();
    }

    async fn recv(&self) -> Message {
        let mut buf = vec![0u8; 64 * 1024];
        let (len, _) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a datagram")
            .unwrap();
        self.codec.decode(&buf[..len]).unwrap()
    }

    async fn assert_silence(&self) {
        let mut buf = vec![0u8; 2048];
        let outcome = timeout(Duration::from_millis(300), self.socket.recv_from(&mut buf)).await;
        assert!(outcome.is_err(), "expected no further datagrams");
    }
}

#[tokio::test]
async fn refresh_reports_both_registered_peers() {
    let (server, addr) = start_server().await;
    let alice = WirePeer::new(PeerId([0x01, 0x02, 0x03, 0x04, 0x05, 0x06])).await;
    let bob = WirePeer::new(PeerId([0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f])).await;

    alice.register(addr).await;
    bob.register(addr).await;

    let refresh = Message::new(MessageType::new(Method::Refresh, Class::Request))
        .with(&bob.id)
        .unwrap();
    bob.send(&refresh, addr).await;
    let response = bob.recv().await;
    assert!(response.is(Method::Refresh, Class::SuccessResponse));

    let table = SessionSnapshot::from_msgpack(&response.get::<PeerData>().unwrap().0).unwrap();
    assert_eq!(table.len(), 2);
    let (alice_external, _) = table.0.get(&alice.id).unwrap();
    assert_eq!(alice_external, &alice.socket.local_addr().unwrap().to_string());
    let (bob_external, _) = table.0.get(&bob.id).unwrap();
    assert_eq!(bob_external, &bob.socket.local_addr().unwrap().to_string());

    server.shutdown();
}

#[tokio::test]
async fn relay_delivers_exactly_one_indication() {
    let (server, addr) = start_server().await;
    let alice = WirePeer::new(PeerId([1; 6])).await;
    let bob = WirePeer::new(PeerId([2; 6])).await;
    alice.register(addr).await;
    bob.register(addr).await;

    let request = Message::new(MessageType::new(Method::Data, Class::Request))
        .with(&bob.id)
        .unwrap()
        .with(&PeerData::new(b"hello".to_vec()).unwrap())
        .unwrap();
    alice.send(&request, addr).await;

    let indication = bob.recv().await;
    assert!(indication.is(Method::Data, Class::Indication));
    assert_eq!(indication.get::<PeerId>().unwrap(), alice.id);
    assert_eq!(indication.get::<PeerData>().unwrap().0, b"hello");

    let response = alice.recv().await;
    assert!(response.is(Method::Data, Class::SuccessResponse));
    assert_eq!(response.transaction_id(), request.transaction_id());

    // exactly one indication per validated request
    bob.assert_silence().await;
    assert_eq!(server.metrics().relays(), 1);
    server.shutdown();
}

#[tokio::test]
async fn relay_to_unknown_peer_is_refused() {
    let (server, addr) = start_server().await;
    let alice = WirePeer::new(PeerId([3; 6])).await;
    alice.register(addr).await;

    let request = Message::new(MessageType::new(Method::Data, Class::Request))
        .with(&PeerId([0xff; 6]))
        .unwrap()
        .with(&PeerData::new(b"hello".to_vec()).unwrap())
        .unwrap();
    alice.send(&request, addr).await;

    let response = alice.recv().await;
    assert!(response.is(Method::Data, Class::ErrorResponse));
    assert_eq!(response.get::<ErrorCode>().unwrap().code, 404);
    assert_eq!(server.metrics().relays(), 0);
    assert_eq!(server.metrics().relay_failures(), 1);
    server.shutdown();
}

#[tokio::test]
async fn relay_from_unregistered_sender_is_refused() {
    let (server, addr) = start_server().await;
    let bob = WirePeer::new(PeerId([4; 6])).await;
    bob.register(addr).await;

    // alice never registered; she is authenticated but unknown
    let alice = WirePeer::new(PeerId([5; 6])).await;
    let request = Message::new(MessageType::new(Method::Data, Class::Request))
        .with(&bob.id)
        .unwrap()
        .with(&PeerData::new(b"hello".to_vec()).unwrap())
        .unwrap();
    alice.send(&request, addr).await;

    let response = alice.recv().await;
    assert!(response.is(Method::Data, Class::ErrorResponse));
    assert_eq!(response.get::<ErrorCode>().unwrap().code, 401);
    bob.assert_silence().await;
    server.shutdown();
}

/// A full agent: rendezvous client, overlay, update manager, and the sink
/// pumping relayed payloads into the manager.
struct TestAgent {
    client: RendezvousClient,
    manager: Arc<UpdateManager>,
    data_dir: PathBuf,
    _dirs: TempDir,
    _sink: tokio::task::JoinHandle<()>,
}

impl TestAgent {
    async fn start(server: SocketAddr, id_last: u8) -> Self {
        let dirs = TempDir::new().unwrap();
        let data_dir = dirs.path().join("data");
        let metadata_dir = dirs.path().join("metadata");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::create_dir_all(&metadata_dir).unwrap();

        let peer_id = PeerId([0, 0, 0, 0, 9, id_last]);
        let mut config = ClientConfig::new(
            server.to_string(),
            "127.0.0.1:0".to_string(),
            peer_id,
            PASSWORD,
        );
        config.refresh = Duration::from_millis(100);
        config.reply_timeout = Duration::from_millis(800);

        let slot = SnapshotSlot::default();
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<(PeerId, Vec<u8>)>(64);
        let client = RendezvousClient::start(config, slot.clone(), inbound_tx)
            .await
            .unwrap();

        let mut ctx = AgentContext::new(&data_dir, &metadata_dir);
        ctx.public_key = Some(rsa::RsaPublicKey::from(signing_key()));
        ctx.monitor_tick = Duration::from_millis(50);
        ctx.deploy_timeout = Duration::from_secs(5);

        let swarm = Arc::new(MemorySwarm::new(&data_dir).with_auto_complete(true));
        let overlay = GossipOverlay::new(peer_id, slot, client.commands());
        let manager = Arc::new(UpdateManager::new(ctx, swarm, overlay));

        let sink = {
            let manager = manager.clone();
            tokio::spawn(async move {
                while let Some((sender, payload)) = inbound_rx.recv().await {
                    if let Ok(descriptor) = UpdateDescriptor::from_bytes(&payload) {
                        let _ = manager.admit(descriptor, &sender.to_string()).await;
                    }
                }
            })
        };

        TestAgent {
            client,
            manager,
            data_dir,
            _dirs: dirs,
            _sink: sink,
        }
    }

    async fn stop(self) {
        self.client.shutdown().await.unwrap();
        self.manager.stop_all().await;
    }
}

fn signed_payload_descriptor(path: &std::path::Path, version: u32) -> UpdateDescriptor {
    let mut update = descriptor::from_payload(
        path,
        UUID_SHELL,
        version,
        "http://t.example/announce",
        32 * 1024,
    )
    .unwrap();
    update.sign(signing_key()).unwrap();
    update
}

#[tokio::test]
async fn gossip_carries_an_update_from_one_agent_to_another() {
    let (server, addr) = start_server().await;
    let publisher = TestAgent::start(addr, 1).await;
    let subscriber = TestAgent::start(addr, 2).await;

    // the payload exists on both sides; the swarm layer is exercised by the
    // in-memory engine, not the tests
    let script = "#!/bin/sh\nexit 0\n";
    std::fs::write(publisher.data_dir.join("notice.sh"), script).unwrap();
    std::fs::write(subscriber.data_dir.join("notice.sh"), script).unwrap();

    let update = signed_payload_descriptor(&publisher.data_dir.join("notice.sh"), 1);
    let uuid = update.uuid;
    publisher.manager.admit(update, "local").await.unwrap();

    // the publisher's monitor gossips the descriptor once the session table
    // lists the subscriber; the subscriber verifies and admits it
    timeout(Duration::from_secs(10), async {
        loop {
            if subscriber.manager.get(&uuid).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("subscriber never received the update");

    // and, payload complete, eventually deploys it
    let received = subscriber.manager.get(&uuid).await.unwrap();
    timeout(Duration::from_secs(10), async {
        loop {
            if received.state().await.deployed.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("subscriber never deployed the update");

    publisher.stop().await;
    subscriber.stop().await;
    server.shutdown();
}

#[tokio::test]
async fn supersession_replaces_files_and_registry_entry() {
    let (server, addr) = start_server().await;
    let agent = TestAgent::start(addr, 3).await;

    std::fs::write(agent.data_dir.join("app.sh"), "#!/bin/sh\nexit 0\n").unwrap();
    let v3 = signed_payload_descriptor(&agent.data_dir.join("app.sh"), 3);
    let uuid = v3.uuid;
    agent.manager.admit(v3, "test").await.unwrap();

    let v5 = signed_payload_descriptor(&agent.data_dir.join("app.sh"), 5);
    agent.manager.admit(v5, "test").await.unwrap();

    let current = agent.manager.get(&uuid).await.unwrap();
    assert_eq!(current.version(), 5);

    let metadata_dir = agent._dirs.path().join("metadata");
    assert!(metadata_dir.join(format!("{uuid}-v5")).exists());
    assert!(!metadata_dir.join(format!("{uuid}-v3")).exists());

    // an older descriptor bounces without touching the registry
    std::fs::write(agent.data_dir.join("app.sh"), "#!/bin/sh\nexit 0\n").unwrap();
    let v4 = signed_payload_descriptor(&agent.data_dir.join("app.sh"), 4);
    assert!(agent.manager.admit(v4, "test").await.is_err());
    assert_eq!(agent.manager.get(&uuid).await.unwrap().version(), 5);

    agent.stop().await;
    server.shutdown();
}

#[tokio::test]
async fn failing_deployment_is_retried_then_parked_until_a_newer_version() {
    let dirs = TempDir::new().unwrap();
    let data_dir = dirs.path().join("data");
    let metadata_dir = dirs.path().join("metadata");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::create_dir_all(&metadata_dir).unwrap();

    let mut ctx = AgentContext::new(&data_dir, &metadata_dir);
    ctx.public_key = Some(rsa::RsaPublicKey::from(signing_key()));
    ctx.monitor_tick = Duration::from_millis(30);
    ctx.deploy_timeout = Duration::from_secs(5);

    let swarm = Arc::new(MemorySwarm::new(&data_dir));
    let (tx, _rx) = mpsc::channel::<ClientCommand>(64);
    let overlay = GossipOverlay::new(PeerId([8; 6]), SnapshotSlot::default(), tx);
    let manager = UpdateManager::new(ctx, swarm, overlay);

    // version 1 always fails to deploy
    std::fs::write(data_dir.join("patch.sh"), "#!/bin/sh\nexit 1\n").unwrap();
    let v1 = signed_payload_descriptor(&data_dir.join("patch.sh"), 1);
    let uuid = v1.uuid;
    manager.admit(v1, "test").await.unwrap();
    let update = manager.get(&uuid).await.unwrap();

    // the budget allows six attempts (fails 0 through 5), then parks
    timeout(Duration::from_secs(10), async {
        loop {
            if update.state().await.deploy_fails == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("deployment failures never reached the budget");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let state = update.state().await;
    assert_eq!(state.deploy_fails, 6, "no attempts beyond the budget");
    assert!(state.deployed.is_none());

    // a newer version resets the budget and deploys
    std::fs::write(data_dir.join("patch.sh"), "#!/bin/sh\nexit 0\n").unwrap();
    let v2 = signed_payload_descriptor(&data_dir.join("patch.sh"), 2);
    manager.admit(v2, "test").await.unwrap();
    let update = manager.get(&uuid).await.unwrap();
    assert_eq!(update.version(), 2);

    timeout(Duration::from_secs(10), async {
        loop {
            let state = update.state().await;
            if state.deployed.is_some() && state.deploy_fails == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("new version never deployed");

    manager.stop_all().await;
}

#[tokio::test]
async fn persisted_updates_survive_a_restart() {
    let dirs = TempDir::new().unwrap();
    let data_dir = dirs.path().join("data");
    let metadata_dir = dirs.path().join("metadata");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::create_dir_all(&metadata_dir).unwrap();

    std::fs::write(data_dir.join("app.sh"), "#!/bin/sh\nexit 0\n").unwrap();
    let update = signed_payload_descriptor(&data_dir.join("app.sh"), 4);
    let uuid = update.uuid;

    // shared stub overlay listing one other peer, so gossip can complete
    let (tx, _overlay_rx) = mpsc::channel::<ClientCommand>(256);
    let slot = SnapshotSlot::default();
    let mut table = std::collections::BTreeMap::new();
    table.insert(
        PeerId([1; 6]),
        ("198.51.100.1:40000".to_string(), "10.0.0.1:9322".to_string()),
    );
    slot.install(SessionSnapshot(table));

    let build_manager = || {
        let mut ctx = AgentContext::new(&data_dir, &metadata_dir);
        ctx.public_key = Some(rsa::RsaPublicKey::from(signing_key()));
        ctx.monitor_tick = Duration::from_millis(50);
        let swarm = Arc::new(MemorySwarm::new(&data_dir));
        let overlay = GossipOverlay::new(PeerId([7; 6]), slot.clone(), tx.clone());
        UpdateManager::new(ctx, swarm, overlay)
    };

    let first = build_manager();
    first.admit(update, "test").await.unwrap();
    let admitted = first.get(&uuid).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while !admitted.state().await.sent {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("descriptor was never gossiped");
    first.stop_all().await;
    drop(first);

    let second = build_manager();
    assert_eq!(second.load_persisted().await, 1);
    let resumed = second.get(&uuid).await.unwrap();
    assert_eq!(resumed.version(), 4);
    assert!(resumed.state().await.sent, "send history survives restarts");
    second.stop_all().await;
}
