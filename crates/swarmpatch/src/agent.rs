//! Agent-side rendezvous client
//!
//! One task owns the UDP socket and the registration state; keep-alive,
//! refresh, and reply-deadline timers deliver events into that task, so
//! every state transition happens in one place. Outbound relay traffic is
//! queued through a command channel and paced to one in-flight Data
//! transaction, and inbound Data indications are handed to the overlay.

use crate::error::Result;
use crate::overlay::SnapshotSlot;
use crate::session::SessionSnapshot;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;
use swarmpatch_wire::{
    Class, Codec, Message, MessageType, Method, PeerData, PeerId, SwarmPorts, TransactionId,
    XorMappedAddress,
};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

const BINDING_REQUEST: MessageType = MessageType::new(Method::Binding, Class::Request);
const REFRESH_REQUEST: MessageType = MessageType::new(Method::Refresh, Class::Request);
const DATA_REQUEST: MessageType = MessageType::new(Method::Data, Class::Request);

/// Registration states of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Registering,
    Registered,
    /// Registered and the session table lists at least one other peer.
    /// Informational only; behaviour is identical to `Registered`.
    Connected,
    RegistrationFailed,
}

/// Events driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Start,
    BindSuccess,
    BindError,
    Reset,
    Stop,
    PeerSeen,
    NoPeer,
}

impl AgentState {
    /// Central transition function. Pairs not listed leave the state
    /// unchanged; the driver logs them at debug level.
    pub fn transition(self, event: AgentEvent) -> AgentState {
        use AgentEvent::*;
        use AgentState::*;
        match (self, event) {
            (Stopped, Start) => Registering,
            (Registering, BindSuccess) => Registered,
            (Registering, BindError) => RegistrationFailed,
            (RegistrationFailed, Reset) => Stopped,
            (Registered, PeerSeen) => Connected,
            (Connected, NoPeer) => Registered,
            (Registered | Connected, BindError) => Registering,
            (_, Stop) => Stopped,
            (state, _) => state,
        }
    }
}

/// Commands accepted by the driver task.
#[derive(Debug)]
pub enum ClientCommand {
    /// Relay `payload` to `dest` through the server. Best-effort.
    SendData { dest: PeerId, payload: Vec<u8> },
}

/// Timer and retry knobs for the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_address: String,
    pub bind_address: String,
    pub peer_id: PeerId,
    pub password: String,
    /// Swarm ports advertised in Binding requests
    pub swarm_ports: SwarmPorts,
    pub keep_alive: Duration,
    pub refresh: Duration,
    pub reply_timeout: Duration,
    /// Keep-alive failures tolerated before dropping back to Registering
    pub soft_error_limit: u32,
    /// Re-registration backoff, doubling up to the max
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl ClientConfig {
    pub fn new(
        server_address: impl Into<String>,
        bind_address: impl Into<String>,
        peer_id: PeerId,
        password: impl Into<String>,
    ) -> Self {
        ClientConfig {
            server_address: server_address.into(),
            bind_address: bind_address.into(),
            peer_id,
            password: password.into(),
            swarm_ports: SwarmPorts {
                external: 0,
                internal: 0,
            },
            keep_alive: Duration::from_secs(crate::defaults::KEEP_ALIVE_SECS),
            refresh: Duration::from_millis(crate::defaults::REFRESH_MILLIS),
            reply_timeout: Duration::from_secs(crate::defaults::REPLY_TIMEOUT_SECS),
            soft_error_limit: crate::defaults::SOFT_ERROR_LIMIT,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(64),
        }
    }
}

/// Handle to the driver task.
pub struct RendezvousClient {
    commands: mpsc::Sender<ClientCommand>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<AgentState>,
    driver: JoinHandle<()>,
}

impl RendezvousClient {
    /// Bind the socket and spawn the driver. A bind failure is fatal; every
    /// later network error is retried or dropped inside the driver.
    pub async fn start(
        config: ClientConfig,
        snapshot: SnapshotSlot,
        inbound: mpsc::Sender<(PeerId, Vec<u8>)>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(&config.bind_address).await?;
        socket.connect(&config.server_address).await?;
        info!(
            "agent {} bound {} towards {}",
            config.peer_id,
            socket.local_addr()?,
            config.server_address
        );

        let (commands_tx, commands_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(AgentState::Stopped);

        let codec = Codec::new(config.password.clone());
        let backoff = config.backoff_base;
        let driver = Driver {
            config,
            socket,
            codec,
            state: AgentState::Stopped,
            state_tx,
            pending: HashMap::new(),
            outbox: VecDeque::new(),
            soft_errors: 0,
            reflexive: None,
            retry_at: None,
            backoff,
            snapshot,
            inbound,
        };
        let driver = tokio::spawn(driver.run(commands_rx, shutdown_rx));

        Ok(RendezvousClient {
            commands: commands_tx,
            shutdown_tx,
            state_rx,
            driver,
        })
    }

    /// Sender half of the command channel, for the overlay.
    pub fn commands(&self) -> mpsc::Sender<ClientCommand> {
        self.commands.clone()
    }

    pub fn state(&self) -> AgentState {
        *self.state_rx.borrow()
    }

    /// Watch the state for tests and supervisors.
    pub fn state_watch(&self) -> watch::Receiver<AgentState> {
        self.state_rx.clone()
    }

    /// Stop the driver: cancels the timers, closes the socket, and waits
    /// for the task to finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.driver
            .await
            .map_err(|e| crate::error::SwarmpatchError::AgentRuntime(e.to_string()))
    }
}

struct Pending {
    method: Method,
    deadline: Instant,
}

enum Wake {
    Shutdown,
    Datagram(usize),
    RecvError(std::io::Error),
    KeepAlive,
    Refresh,
    Deadline,
    Command(Option<ClientCommand>),
}

struct Driver {
    config: ClientConfig,
    socket: UdpSocket,
    codec: Codec,
    state: AgentState,
    state_tx: watch::Sender<AgentState>,
    pending: HashMap<TransactionId, Pending>,
    outbox: VecDeque<(PeerId, Vec<u8>)>,
    soft_errors: u32,
    reflexive: Option<SocketAddr>,
    retry_at: Option<Instant>,
    backoff: Duration,
    snapshot: SnapshotSlot,
    inbound: mpsc::Sender<(PeerId, Vec<u8>)>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ClientCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut keepalive = interval(self.config.keep_alive);
        let mut refresh = interval(self.config.refresh);
        let mut deadlines = interval(Duration::from_millis(250));
        let mut buf = vec![0u8; 64 * 1024];

        self.apply(AgentEvent::Start);
        self.send_binding().await;

        loop {
            let wake = tokio::select! {
                _ = shutdown.changed() => Wake::Shutdown,
                received = self.socket.recv(&mut buf) => match received {
                    Ok(len) => Wake::Datagram(len),
                    Err(e) => Wake::RecvError(e),
                },
                _ = keepalive.tick() => Wake::KeepAlive,
                _ = refresh.tick() => Wake::Refresh,
                _ = deadlines.tick() => Wake::Deadline,
                cmd = commands.recv() => Wake::Command(cmd),
            };

            match wake {
                Wake::Shutdown => {
                    self.apply(AgentEvent::Stop);
                    break;
                }
                Wake::Datagram(len) => {
                    let datagram = buf[..len].to_vec();
                    self.on_datagram(&datagram).await;
                }
                Wake::RecvError(e) => warn!("socket receive error: {e}"),
                Wake::KeepAlive => {
                    if matches!(self.state, AgentState::Registered | AgentState::Connected) {
                        self.send_binding().await;
                    }
                }
                Wake::Refresh => {
                    if matches!(self.state, AgentState::Registered | AgentState::Connected) {
                        self.send_refresh().await;
                    }
                }
                Wake::Deadline => self.on_deadline_tick().await,
                Wake::Command(Some(ClientCommand::SendData { dest, payload })) => {
                    self.outbox.push_back((dest, payload));
                    self.pump_outbox().await;
                }
                Wake::Command(None) => {
                    debug!("command channel closed, stopping driver");
                    self.apply(AgentEvent::Stop);
                    break;
                }
            }
        }
    }

    fn apply(&mut self, event: AgentEvent) {
        let next = self.state.transition(event);
        if next != self.state {
            info!("agent state {:?} -> {:?} on {:?}", self.state, next, event);
            self.state = next;
            let _ = self.state_tx.send(next);
        } else {
            debug!("event {:?} ignored in state {:?}", event, self.state);
        }
    }

    fn has_inflight(&self, method: Method) -> bool {
        self.pending.values().any(|p| p.method == method)
    }

    fn track(&mut self, txid: TransactionId, method: Method) {
        self.pending.insert(
            txid,
            Pending {
                method,
                deadline: Instant::now() + self.config.reply_timeout,
            },
        );
    }

    async fn send(&self, msg: &Message) -> bool {
        match self.codec.encode(msg) {
            Ok(wire) => match self.socket.send(&wire).await {
                Ok(_) => true,
                Err(e) => {
                    warn!("send failed: {e}");
                    false
                }
            },
            Err(e) => {
                warn!("failed to encode {}: {e}", msg.kind());
                false
            }
        }
    }

    // one outstanding transaction per method
    async fn send_binding(&mut self) {
        if self.has_inflight(Method::Binding) {
            debug!("binding already in flight");
            return;
        }
        let ports = self.config.swarm_ports;
        let msg = Message::new(BINDING_REQUEST)
            .with(&self.config.peer_id)
            .and_then(|m| {
                // nothing to advertise, nothing to send
                if ports.external == 0 && ports.internal == 0 {
                    Ok(m)
                } else {
                    m.with(&ports)
                }
            });
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("failed to build binding request: {e}");
                return;
            }
        };
        let txid = msg.transaction_id();
        if self.send(&msg).await {
            self.track(txid, Method::Binding);
        } else if self.state == AgentState::Registering {
            self.registration_failed();
        }
    }

    async fn send_refresh(&mut self) {
        if self.has_inflight(Method::Refresh) {
            return;
        }
        let msg = match Message::new(REFRESH_REQUEST).with(&self.config.peer_id) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("failed to build refresh request: {e}");
                return;
            }
        };
        let txid = msg.transaction_id();
        if self.send(&msg).await {
            self.track(txid, Method::Refresh);
        }
    }

    async fn pump_outbox(&mut self) {
        if self.has_inflight(Method::Data) {
            return;
        }
        let (dest, payload) = match self.outbox.pop_front() {
            Some(next) => next,
            None => return,
        };
        let msg = PeerData::new(payload).and_then(|data| {
            Message::new(DATA_REQUEST)
                .with(&dest)
                .and_then(|m| m.with(&data))
        });
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("failed to build data request for {dest}: {e}");
                return;
            }
        };
        let txid = msg.transaction_id();
        if self.send(&msg).await {
            self.track(txid, Method::Data);
        }
    }

    async fn on_datagram(&mut self, datagram: &[u8]) {
        let msg = match self.codec.decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping datagram: {e}");
                return;
            }
        };

        match msg.kind().class {
            Class::Indication => {
                if msg.kind().method != Method::Data {
                    debug!("ignoring {} indication", msg.kind().method);
                    return;
                }
                let sender = match msg.get::<PeerId>() {
                    Ok(sender) => sender,
                    Err(_) => return,
                };
                let payload = match msg.get::<PeerData>() {
                    Ok(payload) => payload.into_inner(),
                    Err(e) => {
                        debug!("data indication from {sender} without payload: {e}");
                        return;
                    }
                };
                if self.inbound.send((sender, payload)).await.is_err() {
                    warn!("overlay receiver gone, dropping indication from {sender}");
                }
            }
            Class::SuccessResponse | Class::ErrorResponse => {
                let txid = msg.transaction_id();
                match self.pending.remove(&txid) {
                    // a response must reach its own waiter only; an unknown
                    // or stale transaction id is dropped, never rerouted
                    None => debug!("response for unknown transaction {txid:?}"),
                    Some(p) if p.method != msg.kind().method => {
                        debug!(
                            "response method {} does not match transaction {txid:?} ({})",
                            msg.kind().method,
                            p.method
                        );
                    }
                    Some(p) => self.on_response(p.method, msg).await,
                }
            }
            Class::Request => debug!("agents do not serve {} requests", msg.kind().method),
        }
    }

    async fn on_response(&mut self, method: Method, msg: Message) {
        match (method, msg.kind().class) {
            (Method::Binding, Class::SuccessResponse) => match msg.get::<XorMappedAddress>() {
                Ok(mapped) => {
                    self.soft_errors = 0;
                    self.backoff = self.config.backoff_base;
                    if self.reflexive != Some(mapped.0) {
                        info!("reflexive address is {}", mapped.0);
                        self.reflexive = Some(mapped.0);
                    }
                    if self.state == AgentState::Registering {
                        self.apply(AgentEvent::BindSuccess);
                    }
                }
                Err(e) => {
                    warn!("binding response without mapped address: {e}");
                    if self.state == AgentState::Registering {
                        self.registration_failed();
                    }
                }
            },
            (Method::Binding, Class::ErrorResponse) => {
                warn!("binding rejected by server");
                self.on_binding_failure().await;
            }
            (Method::Refresh, Class::SuccessResponse) => {
                let snapshot = msg
                    .get::<PeerData>()
                    .map_err(crate::error::SwarmpatchError::from)
                    .and_then(|data| SessionSnapshot::from_msgpack(&data.0));
                match snapshot {
                    Ok(snapshot) => {
                        let has_peers = snapshot.has_peer_other_than(&self.config.peer_id);
                        if self.state == AgentState::Registered && has_peers {
                            self.apply(AgentEvent::PeerSeen);
                        } else if self.state == AgentState::Connected && !has_peers {
                            self.apply(AgentEvent::NoPeer);
                        }
                        self.snapshot.install(snapshot);
                    }
                    Err(e) => warn!("unusable refresh payload: {e}"),
                }
            }
            (Method::Refresh, Class::ErrorResponse) => {
                // the server has no session for us; re-register rather than
                // waiting out the keep-alive timer
                warn!("refresh rejected by server, re-registering");
                self.send_binding().await;
            }
            (Method::Data, Class::SuccessResponse) => {
                debug!("relay accepted");
                self.pump_outbox().await;
            }
            (Method::Data, Class::ErrorResponse) => {
                match msg.get::<swarmpatch_wire::ErrorCode>() {
                    Ok(code) => debug!("relay failed: {} {}", code.code, code.reason),
                    Err(_) => debug!("relay failed"),
                }
                self.pump_outbox().await;
            }
            (method, class) => debug!("unhandled response {method} {class:?}"),
        }
    }

    async fn on_deadline_tick(&mut self) {
        let now = Instant::now();

        if self.state == AgentState::Stopped {
            if let Some(at) = self.retry_at {
                if now >= at {
                    self.retry_at = None;
                    self.apply(AgentEvent::Start);
                    self.send_binding().await;
                }
            }
            return;
        }

        let expired: Vec<(TransactionId, Method)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(txid, p)| (*txid, p.method))
            .collect();
        for (txid, method) in expired {
            self.pending.remove(&txid);
            debug!("transaction {txid:?} ({method}) timed out");
            match method {
                Method::Binding => self.on_binding_failure().await,
                Method::Refresh => {}
                Method::Data => self.pump_outbox().await,
                Method::ChannelBind => {}
            }
        }
    }

    async fn on_binding_failure(&mut self) {
        match self.state {
            AgentState::Registering => self.registration_failed(),
            AgentState::Registered | AgentState::Connected => {
                self.soft_errors += 1;
                if self.soft_errors > self.config.soft_error_limit {
                    warn!(
                        "keep-alive failed {} times, re-registering",
                        self.soft_errors
                    );
                    self.soft_errors = 0;
                    self.apply(AgentEvent::BindError);
                    self.send_binding().await;
                }
            }
            _ => {}
        }
    }

    /// Registering -> RegistrationFailed -> (automatic reset) -> Stopped,
    /// with the next attempt scheduled under exponential backoff.
    fn registration_failed(&mut self) {
        self.apply(AgentEvent::BindError);
        self.apply(AgentEvent::Reset);
        self.pending.clear();
        self.outbox.clear();
        self.reflexive = None;
        self.retry_at = Some(Instant::now() + self.backoff);
        warn!("registration failed, retrying in {:?}", self.backoff);
        self.backoff = (self.backoff * 2).min(self.config.backoff_max);
    }
}
