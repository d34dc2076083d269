//! Update lifecycle management
//!
//! The registry holds at most one update per uuid, always the highest
//! version admitted. Every admitted update gets its own monitor task that
//! gossips the descriptor once, keeps the swarm fetching, deploys when the
//! payload is complete, and persists state after every change. One update's
//! failure never touches another: monitors catch every recoverable error
//! and log it.
//!
//! Lock order is registry before update, never the reverse.

use crate::deploy::{ApkDeployer, Deployer, ShellDeployer};
use crate::descriptor::{UpdateDescriptor, UUID_APK, UUID_SHELL};
use crate::error::{Result, SwarmpatchError};
use crate::overlay::GossipOverlay;
use crate::swarm::{SwarmClient, SwarmHandle};
use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Immutable agent-wide context handed to every monitor task. Updates never
/// hold a reference back to the agent, only to this.
#[derive(Clone)]
pub struct AgentContext {
    pub data_dir: PathBuf,
    pub metadata_dir: PathBuf,
    /// Proxy nodes distribute payloads but never deploy them
    pub proxy: bool,
    /// Trusted key for descriptor verification; absent means every
    /// descriptor is rejected
    pub public_key: Option<RsaPublicKey>,
    pub monitor_tick: Duration,
    pub deploy_timeout: Duration,
    pub deploy_fails_limit: u32,
}

impl AgentContext {
    pub fn new(data_dir: impl Into<PathBuf>, metadata_dir: impl Into<PathBuf>) -> Self {
        AgentContext {
            data_dir: data_dir.into(),
            metadata_dir: metadata_dir.into(),
            proxy: false,
            public_key: None,
            monitor_tick: Duration::from_secs(crate::defaults::MONITOR_TICK_SECS),
            deploy_timeout: Duration::from_secs(crate::defaults::DEPLOY_TIMEOUT_SECS),
            deploy_fails_limit: crate::defaults::DEPLOY_FAILS_LIMIT,
        }
    }
}

/// Persisted per-update state. Unknown JSON fields are kept across a
/// load/save cycle, and `source` is retained for older tooling even though
/// nothing reads it here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateState {
    pub descriptor: UpdateDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: String,
    pub stopped: bool,
    pub sent: bool,
    #[serde(rename = "deploy-fails", default)]
    pub deploy_fails: u32,
    #[serde(default)]
    pub missing: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UpdateState {
    fn new(descriptor: UpdateDescriptor, source: &str) -> Self {
        UpdateState {
            descriptor,
            deployed: None,
            source: source.to_string(),
            stopped: true,
            sent: false,
            deploy_fails: 0,
            missing: 0,
            extra: serde_json::Map::new(),
        }
    }
}

struct UpdateInner {
    state: UpdateState,
    handle: Option<Box<dyn SwarmHandle>>,
    monitor: Option<JoinHandle<()>>,
}

/// A managed update.
pub struct Update {
    uuid: Uuid,
    version: u32,
    stop_tx: watch::Sender<bool>,
    inner: Mutex<UpdateInner>,
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uuid:{} version:{}", self.uuid, self.version)
    }
}

impl Update {
    fn from_state(state: UpdateState) -> Arc<Self> {
        let (uuid, version) = state.descriptor.key();
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Update {
            uuid,
            version,
            stop_tx,
            inner: Mutex::new(UpdateInner {
                state,
                handle: None,
                monitor: None,
            }),
        })
    }

    fn new(descriptor: UpdateDescriptor, source: &str) -> Arc<Self> {
        Self::from_state(UpdateState::new(descriptor, source))
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Clone of the current persisted state.
    pub async fn state(&self) -> UpdateState {
        self.inner.lock().await.state.clone()
    }

    /// `<metadata_dir>/<uuid>-v<version>`
    pub fn metadata_path(&self, metadata_dir: &Path) -> PathBuf {
        metadata_dir.join(format!("{}-v{}", self.uuid, self.version))
    }

    pub async fn save(&self, metadata_dir: &Path) -> Result<()> {
        let inner = self.inner.lock().await;
        persist(&inner.state, &self.metadata_path(metadata_dir)).await
    }

    /// Stop the lifecycle: end the monitor, then detach the swarm handle
    /// and wait for its close signal. A deployment in progress finishes or
    /// times out on its own; it is never cancelled mid-execution.
    pub async fn stop(&self) {
        info!("stopping update {self}");
        let _ = self.stop_tx.send(true);

        let monitor = {
            let mut inner = self.inner.lock().await;
            inner.state.stopped = true;
            inner.monitor.take()
        };
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        let handle = self.inner.lock().await.handle.take();
        if let Some(handle) = handle {
            handle.drop_torrent();
            handle.closed().await;
        }
        info!("stopped update {self}");
    }

    /// Remove payload and metadata files. Requires a stopped update;
    /// missing files are tolerated.
    pub async fn delete(&self, ctx: &AgentContext) -> Result<()> {
        let inner = self.inner.lock().await;
        if !inner.state.stopped {
            return Err(SwarmpatchError::NotStopped);
        }

        let payload = ctx.data_dir.join(&inner.state.descriptor.info.name);
        let removed = if inner.state.descriptor.info.files.is_some() {
            tokio::fs::remove_dir_all(&payload).await
        } else {
            tokio::fs::remove_file(&payload).await
        };
        match removed {
            Ok(()) => debug!("removed payload {}", payload.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove payload {}: {e}", payload.display()),
        }

        let metadata = self.metadata_path(&ctx.metadata_dir);
        match tokio::fs::remove_file(&metadata).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SwarmpatchError::AgentRuntime(format!(
                    "failed to delete metadata of {self}: {e}"
                )))
            }
        }
        info!("deleted update {self}");
        Ok(())
    }
}

/// Atomic JSON persistence: temp file then rename.
async fn persist(state: &UpdateState, path: &Path) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(state)?;
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Registry of managed updates, unique per uuid.
pub struct UpdateManager {
    ctx: Arc<AgentContext>,
    swarm: Arc<dyn SwarmClient>,
    overlay: GossipOverlay,
    registry: Mutex<HashMap<Uuid, Arc<Update>>>,
}

impl UpdateManager {
    pub fn new(ctx: AgentContext, swarm: Arc<dyn SwarmClient>, overlay: GossipOverlay) -> Self {
        UpdateManager {
            ctx: Arc::new(ctx),
            swarm,
            overlay,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Verify and admit a freshly received descriptor.
    pub async fn admit(&self, descriptor: UpdateDescriptor, source: &str) -> Result<()> {
        self.verify(&descriptor)?;
        self.activate(Update::new(descriptor, source)).await
    }

    /// Re-admit a persisted state after a restart, keeping its send/deploy
    /// history. The signature is checked again; trust is never assumed from
    /// disk.
    pub async fn resume(&self, state: UpdateState) -> Result<()> {
        self.verify(&state.descriptor)?;
        self.activate(Update::from_state(state)).await
    }

    fn verify(&self, descriptor: &UpdateDescriptor) -> Result<()> {
        let key = self
            .ctx
            .public_key
            .as_ref()
            .ok_or(SwarmpatchError::Verification)?;
        descriptor.verify(key)
    }

    /// Admission policy: insert if new, supersede if strictly newer.
    async fn register(&self, update: Arc<Update>) -> Result<Option<Arc<Update>>> {
        let mut registry = self.registry.lock().await;
        let existing = registry.get(&update.uuid()).map(|u| u.version());
        match existing {
            None => {
                registry.insert(update.uuid(), update);
                Ok(None)
            }
            Some(version) if version < update.version() => {
                Ok(registry.insert(update.uuid(), update))
            }
            Some(version) if version == update.version() => {
                Err(SwarmpatchError::AlreadyExists {
                    uuid: update.uuid(),
                    version,
                })
            }
            Some(_) => Err(SwarmpatchError::IsOlder {
                uuid: update.uuid(),
                version: update.version(),
            }),
        }
    }

    async fn activate(&self, update: Arc<Update>) -> Result<()> {
        let previous = self.register(update.clone()).await?;
        if let Some(previous) = previous {
            info!("update {previous} superseded by version {}", update.version());
            previous.stop().await;
            if let Err(e) = previous.delete(&self.ctx).await {
                warn!("failed to delete superseded update {previous}: {e}");
            }
        }

        let metainfo = {
            let inner = update.inner.lock().await;
            inner.state.descriptor.metainfo()?
        };
        let handle = match self.swarm.add_torrent(metainfo).await {
            Ok(handle) => handle,
            Err(e) => {
                // roll the registration back; a handle-less update is useless
                self.registry.lock().await.remove(&update.uuid());
                return Err(e);
            }
        };

        {
            let mut inner = update.inner.lock().await;
            inner.state.stopped = false;
            inner.state.missing = handle.bytes_missing();
            inner.handle = Some(handle);
        }
        info!("started update {update}");

        if let Err(e) = update.save(&self.ctx.metadata_dir).await {
            warn!("failed to persist update {update}: {e}");
        }

        let monitor = tokio::spawn(monitor_update(
            update.clone(),
            self.ctx.clone(),
            self.overlay.clone(),
            self.stop_rx_for(&update),
        ));
        update.inner.lock().await.monitor = Some(monitor);
        Ok(())
    }

    fn stop_rx_for(&self, update: &Arc<Update>) -> watch::Receiver<bool> {
        update.stop_tx.subscribe()
    }

    pub async fn get(&self, uuid: &Uuid) -> Option<Arc<Update>> {
        self.registry.lock().await.get(uuid).cloned()
    }

    pub async fn len(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.lock().await.is_empty()
    }

    /// Scan the metadata directory and resume the highest persisted version
    /// of every uuid. Returns how many updates came back.
    pub async fn load_persisted(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.ctx.metadata_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "cannot read metadata directory {}: {e}",
                    self.ctx.metadata_dir.display()
                );
                return 0;
            }
        };

        let mut best: HashMap<Uuid, UpdateState> = HashMap::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("cannot read {}: {e}", path.display());
                    continue;
                }
            };
            match serde_json::from_str::<UpdateState>(&content) {
                Ok(state) => {
                    let (uuid, version) = state.descriptor.key();
                    match best.get(&uuid) {
                        Some(seen) if seen.descriptor.version >= version => {}
                        _ => {
                            best.insert(uuid, state);
                        }
                    }
                }
                Err(e) => warn!("skipping unreadable metadata {}: {e}", path.display()),
            }
        }

        let mut resumed = 0;
        for (uuid, state) in best {
            let version = state.descriptor.version;
            match self.resume(state).await {
                Ok(()) => resumed += 1,
                Err(e) => warn!("not resuming update uuid:{uuid} version:{version}: {e}"),
            }
        }
        if resumed > 0 {
            info!("resumed {resumed} persisted update(s)");
        }
        resumed
    }

    /// Stop every update; called on agent shutdown after the overlay has
    /// gone quiet.
    pub async fn stop_all(&self) {
        let updates: Vec<Arc<Update>> = self.registry.lock().await.values().cloned().collect();
        for update in updates {
            update.stop().await;
        }
    }
}

/// Per-update monitor loop.
async fn monitor_update(
    update: Arc<Update>,
    ctx: Arc<AgentContext>,
    overlay: GossipOverlay,
    mut stop_rx: watch::Receiver<bool>,
) {
    let notification = match update.inner.lock().await.state.descriptor.to_bytes() {
        Ok(notification) => notification,
        Err(e) => {
            warn!("update {update} has an unencodable descriptor: {e}");
            return;
        }
    };

    let mut tick = tokio::time::interval(ctx.monitor_tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = tick.tick() => {}
        }

        let mut guard = update.inner.lock().await;
        let inner = &mut *guard;
        if inner.state.stopped {
            break;
        }
        let handle = match inner.handle.as_ref() {
            Some(handle) => handle,
            None => break,
        };
        let mut dirty = false;

        // gossip the descriptor once per (uuid, version); a broadcast that
        // addressed nobody does not count, the table may simply not have
        // been learned yet
        if !inner.state.sent {
            match overlay.broadcast(&notification).await {
                Ok(0) => debug!("no peers to gossip update {update} to yet"),
                Ok(addressed) => {
                    debug!("update {update} gossiped to {addressed} peer(s)");
                    inner.state.sent = true;
                    dirty = true;
                }
                Err(e) => warn!("failed to gossip update {update}: {e}"),
            }
        }

        let missing = handle.bytes_missing();
        if missing != inner.state.missing {
            inner.state.missing = missing;
            dirty = true;
        }

        if missing > 0 {
            // idempotent; keeps the fetch moving
            handle.download_all().await;
        } else if !ctx.proxy && inner.state.deployed.is_none() {
            let files = handle.files();
            dirty |= attempt_deploy(&update, &mut inner.state, &files, &ctx).await;
        }

        if dirty {
            let path = update.metadata_path(&ctx.metadata_dir);
            if let Err(e) = persist(&inner.state, &path).await {
                warn!("failed to persist update {update}: {e}");
            }
        }
    }
    debug!("monitor for update {update} exited");
}

/// One deployment attempt, if the failure budget allows. Returns whether
/// state changed.
async fn attempt_deploy(
    update: &Update,
    state: &mut UpdateState,
    files: &[PathBuf],
    ctx: &AgentContext,
) -> bool {
    if state.deploy_fails > ctx.deploy_fails_limit {
        debug!(
            "update {update} parked after {} deployment failures",
            state.deploy_fails
        );
        return false;
    }

    info!("deploying update {update}");
    let uuid = state.descriptor.uuid;
    let result = if uuid == UUID_SHELL {
        deploy_files(&ShellDeployer, files, ctx).await
    } else if uuid == UUID_APK {
        deploy_files(&ApkDeployer, files, ctx).await
    } else {
        Err(SwarmpatchError::Deploy(format!(
            "unrecognized deployment uuid {uuid}"
        )))
    };

    match result {
        Ok(()) => {
            state.deploy_fails = 0;
            state.deployed = Some(Utc::now());
            info!("deployed update {update}");
        }
        Err(e) => {
            state.deploy_fails += 1;
            warn!(
                "deployment of update {update} failed ({} so far): {e}",
                state.deploy_fails
            );
        }
    }
    true
}

async fn deploy_files(
    deployer: &dyn Deployer,
    files: &[PathBuf],
    ctx: &AgentContext,
) -> Result<()> {
    for rel in files {
        deployer
            .deploy(&ctx.data_dir.join(rel), ctx.deploy_timeout)
            .await?;
    }
    Ok(())
}
