//! LAN discovery: advertise this device over UDP multicast, browse and resolve peers, and
//! fold what is seen into the Discovery Set on a single owner task.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use stash_core::protocol::{TYPE_PROPERTY, UUID_PROPERTY};
use stash_core::registry::PeerFilter;
use stash_core::wire::{decode_frame, encode_frame};
use stash_core::{
    DeviceId, DiscoveryEvent, DiscoverySet, FrameEncodeError, Message, PeerDescriptor, PeerKey,
    PeerNotification,
};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const MAX_DATAGRAM: usize = 9 * 1024;
/// Queriers heard from within this window get our goodbye.
const QUERIER_MEMORY: Duration = Duration::from_secs(60);
const MAX_REPLY_JITTER_MS: u64 = 20;
const RESOLVE_RETRY: Duration = Duration::from_secs(1);
const DEVICE_TYPE: &str = "remotestash_device";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open browse socket: {0}")]
    Browse(#[source] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
    #[error("discovery registry has shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiserState {
    Inactive,
    Active,
}

struct ActiveAdvert {
    socket: Arc<UdpSocket>,
    queriers: Arc<Mutex<HashMap<SocketAddr, Instant>>>,
    task: JoinHandle<()>,
}

/// Publishes this device under the service type and answers queries and resolve requests.
pub struct Advertiser {
    name: String,
    identity: DeviceId,
    transfer_port: u16,
    discovery_port: u16,
    active: Option<ActiveAdvert>,
}

impl Advertiser {
    pub fn new(
        name: impl Into<String>,
        identity: DeviceId,
        transfer_port: u16,
        discovery_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            identity,
            transfer_port,
            discovery_port,
            active: None,
        }
    }

    pub fn state(&self) -> AdvertiserState {
        match self.active {
            Some(_) => AdvertiserState::Active,
            None => AdvertiserState::Inactive,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the advertiser socket is bound to, while active.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().and_then(|a| a.socket.local_addr().ok())
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (UUID_PROPERTY.to_string(), self.identity.to_string()),
            (TYPE_PROPERTY.to_string(), DEVICE_TYPE.to_string()),
        ])
    }

    /// Bind the discovery port and start answering. A bind failure is returned and the
    /// advertiser stays inactive.
    pub async fn start(&mut self) -> Result<(), DiscoveryError> {
        if self.active.is_some() {
            return Ok(());
        }
        let socket = make_multicast_socket(self.discovery_port).map_err(|source| {
            DiscoveryError::Bind {
                port: self.discovery_port,
                source,
            }
        })?;
        let socket = Arc::new(socket);
        let queriers = Arc::new(Mutex::new(HashMap::new()));
        let responder = Responder {
            socket: socket.clone(),
            name: self.name.clone(),
            announce: encode_frame(&Message::announce(&self.name, self.transfer_port))?,
            resolved: encode_frame(&Message::resolve_response(
                &self.name,
                self.transfer_port,
                self.properties(),
            ))?,
            queriers: queriers.clone(),
        };
        let task = tokio::spawn(responder.run());
        tracing::info!(
            name = %self.name,
            identity = %self.identity,
            transfer_port = self.transfer_port,
            discovery_port = self.discovery_port,
            "advertising"
        );
        self.active = Some(ActiveAdvert {
            socket,
            queriers,
            task,
        });
        Ok(())
    }

    /// Stop answering and tell the group and recent browsers we are gone.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.task.abort();
        let frame = match encode_frame(&Message::goodbye(&self.name)) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("could not encode goodbye: {}", e);
                return;
            }
        };
        let now = Instant::now();
        let mut targets = vec![SocketAddr::from((MULTICAST_GROUP, self.discovery_port))];
        targets.extend(
            active
                .queriers
                .lock()
                .await
                .iter()
                .filter(|(_, seen)| now.duration_since(**seen) < QUERIER_MEMORY)
                .map(|(addr, _)| *addr),
        );
        for to in targets {
            if let Err(e) = active.socket.send_to(&frame, to).await {
                tracing::debug!(%to, "goodbye failed: {}", e);
            }
        }
        tracing::info!(name = %self.name, "stopped advertising");
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.task.abort();
        }
    }
}

fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    // Without a multicast route only unicast queries reach us; keep going.
    if let Err(e) = std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED) {
        tracing::warn!("could not join {}: {}", MULTICAST_GROUP, e);
    }
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

struct Responder {
    socket: Arc<UdpSocket>,
    name: String,
    announce: Vec<u8>,
    resolved: Vec<u8>,
    queriers: Arc<Mutex<HashMap<SocketAddr, Instant>>>,
}

impl Responder {
    async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!("advertiser recv failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let msg = match decode_frame(&buf[..n]) {
                Ok((msg, _)) => msg,
                Err(e) => {
                    tracing::debug!(%from, "ignoring datagram: {}", e);
                    continue;
                }
            };
            if !msg.is_ours() {
                continue;
            }
            match msg {
                Message::Query { .. } => {
                    {
                        let mut q = self.queriers.lock().await;
                        let now = Instant::now();
                        q.retain(|_, seen| now.duration_since(*seen) < QUERIER_MEMORY);
                        q.insert(from, now);
                    }
                    self.reply(&self.announce, from).await;
                }
                Message::ResolveRequest { name, .. } if name == self.name => {
                    tracing::debug!(%from, "resolve request");
                    self.reply(&self.resolved, from).await;
                }
                _ => {}
            }
        }
    }

    /// Unicast reply after a short random delay so advertisers on one LAN do not answer
    /// a multicast query in lockstep.
    async fn reply(&self, frame: &[u8], to: SocketAddr) {
        let jitter = rand::thread_rng().gen_range(0..=MAX_REPLY_JITTER_MS);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
        if let Err(e) = self.socket.send_to(frame, to).await {
            tracing::debug!(%to, "reply failed: {}", e);
        }
    }
}

/// Browsing parameters for the registry owner.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Our own identity; advertisements carrying it are ignored.
    pub own_identity: Option<DeviceId>,
    /// Where queries are sent: the multicast group, or one advertiser directly.
    pub query_target: SocketAddr,
    pub resolve_timeout: Duration,
    pub query_interval: Duration,
    pub peer_ttl: Duration,
}

impl RegistryConfig {
    pub fn from_config(c: &Config, own_identity: Option<DeviceId>) -> Self {
        Self {
            own_identity,
            query_target: SocketAddr::from((MULTICAST_GROUP, c.discovery_port)),
            resolve_timeout: c.resolve_timeout(),
            query_interval: c.query_interval(),
            peer_ttl: c.peer_ttl(),
        }
    }
}

enum RegistryCommand {
    Announced {
        name: String,
        host: SocketAddr,
        from: SocketAddr,
    },
    Resolved {
        name: String,
        host: SocketAddr,
        properties: BTreeMap<String, String>,
    },
    ResolutionTimedOut {
        name: String,
    },
    Goodbye {
        name: String,
    },
    StartBrowsing(oneshot::Sender<Result<(), DiscoveryError>>),
    StopBrowsing,
    AddManual {
        name: Option<String>,
        host: SocketAddr,
        reply: oneshot::Sender<PeerKey>,
    },
    Confirm {
        key: PeerKey,
        identity: DeviceId,
    },
    Select {
        key: PeerKey,
        reply: oneshot::Sender<Option<PeerDescriptor>>,
    },
    Selected(oneshot::Sender<Option<PeerDescriptor>>),
    Snapshot(oneshot::Sender<Vec<PeerDescriptor>>),
    Shutdown,
}

/// Sends `Shutdown` once the last [`RegistryHandle`] clone is gone.
struct OwnerGuard(mpsc::UnboundedSender<RegistryCommand>);

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        let _ = self.0.send(RegistryCommand::Shutdown);
    }
}

/// Application side of the registry owner task.
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::UnboundedSender<RegistryCommand>,
    _owner: Arc<OwnerGuard>,
}

impl RegistryHandle {
    fn send(&self, cmd: RegistryCommand) -> Result<(), DiscoveryError> {
        self.commands.send(cmd).map_err(|_| DiscoveryError::Closed)
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, DiscoveryError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| DiscoveryError::Closed)
    }

    /// Open the browse socket and start querying. Idempotent.
    pub async fn start_browsing(&self) -> Result<(), DiscoveryError> {
        self.ask(RegistryCommand::StartBrowsing).await?
    }

    /// Stop querying and cancel pending resolutions. Known peers stay in the set.
    pub fn stop_browsing(&self) -> Result<(), DiscoveryError> {
        self.send(RegistryCommand::StopBrowsing)
    }

    /// Add a peer by address. It is temporary until [`confirm`](Self::confirm)ed.
    pub async fn add_manual(
        &self,
        name: Option<String>,
        host: SocketAddr,
    ) -> Result<PeerKey, DiscoveryError> {
        self.ask(|reply| RegistryCommand::AddManual { name, host, reply })
            .await
    }

    /// Record the identity a manual peer reported.
    pub fn confirm(&self, key: PeerKey, identity: DeviceId) -> Result<(), DiscoveryError> {
        self.send(RegistryCommand::Confirm { key, identity })
    }

    pub async fn select(&self, key: PeerKey) -> Result<Option<PeerDescriptor>, DiscoveryError> {
        self.ask(|reply| RegistryCommand::Select { key, reply }).await
    }

    pub async fn selected(&self) -> Result<Option<PeerDescriptor>, DiscoveryError> {
        self.ask(RegistryCommand::Selected).await
    }

    pub async fn snapshot(&self) -> Result<Vec<PeerDescriptor>, DiscoveryError> {
        self.ask(RegistryCommand::Snapshot).await
    }
}

/// Spawn the registry owner. Notifications arrive on the returned receiver in fold order.
pub fn spawn_registry(
    config: RegistryConfig,
) -> (RegistryHandle, mpsc::UnboundedReceiver<PeerNotification>) {
    let set = DiscoverySet::new(config.own_identity);
    spawn_with_set(config, set)
}

/// Like [`spawn_registry`], with a caller-supplied predicate deciding which peers enter.
pub fn spawn_registry_with_filter(
    config: RegistryConfig,
    filter: PeerFilter,
) -> (RegistryHandle, mpsc::UnboundedReceiver<PeerNotification>) {
    spawn_with_set(config, DiscoverySet::with_filter(filter))
}

fn spawn_with_set(
    config: RegistryConfig,
    set: DiscoverySet,
) -> (RegistryHandle, mpsc::UnboundedReceiver<PeerNotification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let owner = RegistryOwner {
        set,
        config,
        notify: notify_tx,
        commands: tx.clone(),
        browse: None,
    };
    tokio::spawn(owner.run(rx));
    let handle = RegistryHandle {
        commands: tx.clone(),
        _owner: Arc::new(OwnerGuard(tx)),
    };
    (handle, notify_rx)
}

struct Browse {
    socket: Arc<UdpSocket>,
    tasks: Vec<JoinHandle<()>>,
    resolving: HashMap<String, JoinHandle<()>>,
    started: Instant,
}

/// Sole owner of the Discovery Set. Everything that touches it arrives as a command.
struct RegistryOwner {
    set: DiscoverySet,
    config: RegistryConfig,
    notify: mpsc::UnboundedSender<PeerNotification>,
    commands: mpsc::UnboundedSender<RegistryCommand>,
    browse: Option<Browse>,
}

impl RegistryOwner {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RegistryCommand>) {
        let mut expiry = tokio::time::interval(self.config.query_interval);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None | Some(RegistryCommand::Shutdown) => break,
                    Some(cmd) => self.handle(cmd).await,
                },
                _ = expiry.tick() => self.expire(),
            }
        }
        self.stop_browsing();
        tracing::debug!("registry owner stopped");
    }

    async fn handle(&mut self, cmd: RegistryCommand) {
        let now = Instant::now();
        match cmd {
            RegistryCommand::Announced { name, host, from } => {
                let notes = self
                    .set
                    .apply(DiscoveryEvent::Found { name: name.clone() }, now);
                let moved = self
                    .set
                    .snapshot()
                    .iter()
                    .any(|p| {
                        !p.manual && p.name == name && p.host.is_some() && p.host != Some(host)
                    });
                if moved || notes.iter().any(|n| n.needs_resolution().is_some()) {
                    self.resolve(name, from);
                }
                self.publish(notes);
            }
            RegistryCommand::Resolved {
                name,
                host,
                properties,
            } => {
                self.finish_resolution(&name);
                let event = DiscoveryEvent::Resolved {
                    name,
                    host,
                    properties,
                };
                let notes = self.set.apply(event, now);
                self.publish(notes);
            }
            RegistryCommand::ResolutionTimedOut { name } => {
                if let Some(b) = &mut self.browse {
                    b.resolving.remove(&name);
                }
                tracing::warn!(%name, "resolution timed out");
                let notes = self
                    .set
                    .apply(DiscoveryEvent::ResolutionTimedOut { name }, now);
                self.publish(notes);
            }
            RegistryCommand::Goodbye { name } => {
                self.finish_resolution(&name);
                let notes = self.set.apply(DiscoveryEvent::Removed { name }, now);
                self.publish(notes);
            }
            RegistryCommand::StartBrowsing(reply) => {
                let _ = reply.send(self.start_browsing().await);
            }
            RegistryCommand::StopBrowsing => self.stop_browsing(),
            RegistryCommand::AddManual { name, host, reply } => {
                let (key, notes) = self.set.add_manual(name, host, now);
                self.publish(notes);
                let _ = reply.send(key);
            }
            RegistryCommand::Confirm { key, identity } => {
                let notes = self.set.confirm(&key, identity);
                self.publish(notes);
            }
            RegistryCommand::Select { key, reply } => {
                let _ = reply.send(self.set.select(&key).cloned());
            }
            RegistryCommand::Selected(reply) => {
                let _ = reply.send(self.set.selected().cloned());
            }
            RegistryCommand::Snapshot(reply) => {
                let _ = reply.send(self.set.snapshot());
            }
            RegistryCommand::Shutdown => {}
        }
    }

    async fn start_browsing(&mut self) -> Result<(), DiscoveryError> {
        if self.browse.is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(DiscoveryError::Browse)?;
        socket
            .set_multicast_ttl_v4(1)
            .map_err(DiscoveryError::Browse)?;
        let socket = Arc::new(socket);
        let query = encode_frame(&Message::query())?;
        let recv = tokio::spawn(browse_recv_loop(socket.clone(), self.commands.clone()));
        let send = tokio::spawn(query_loop(
            socket.clone(),
            query,
            self.config.query_target,
            self.config.query_interval,
        ));
        tracing::info!(target = %self.config.query_target, "browsing");
        self.browse = Some(Browse {
            socket,
            tasks: vec![recv, send],
            resolving: HashMap::new(),
            started: Instant::now(),
        });
        Ok(())
    }

    fn stop_browsing(&mut self) {
        let Some(browse) = self.browse.take() else {
            return;
        };
        for task in browse.tasks {
            task.abort();
        }
        for (_, task) in browse.resolving {
            task.abort();
        }
        tracing::info!("stopped browsing");
    }

    /// Resolve `name` by asking the advertiser at `advertiser`, bounded by the resolve timeout.
    fn resolve(&mut self, name: String, advertiser: SocketAddr) {
        let Some(browse) = &mut self.browse else {
            return;
        };
        if browse.resolving.contains_key(&name) {
            return;
        }
        let frame = match encode_frame(&Message::resolve_request(&name)) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(%name, "cannot resolve: {}", e);
                return;
            }
        };
        let socket = browse.socket.clone();
        let commands = self.commands.clone();
        let timeout = self.config.resolve_timeout;
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            // The answer arrives on the browse socket; re-ask in case a datagram was lost.
            let ask = async {
                loop {
                    if let Err(e) = socket.send_to(&frame, advertiser).await {
                        tracing::debug!(%advertiser, "resolve request failed: {}", e);
                    }
                    tokio::time::sleep(RESOLVE_RETRY).await;
                }
            };
            let _ = tokio::time::timeout(timeout, ask).await;
            let _ = commands.send(RegistryCommand::ResolutionTimedOut { name: task_name });
        });
        tracing::debug!(%name, %advertiser, "resolving");
        browse.resolving.insert(name, task);
    }

    fn finish_resolution(&mut self, name: &str) {
        if let Some(task) = self
            .browse
            .as_mut()
            .and_then(|b| b.resolving.remove(name))
        {
            task.abort();
        }
    }

    fn expire(&mut self) {
        let Some(browse) = &self.browse else {
            return;
        };
        let now = Instant::now();
        // Give peers a full TTL to re-announce after browsing (re)starts.
        if now.duration_since(browse.started) < self.config.peer_ttl {
            return;
        }
        let notes = self.set.expire(now, self.config.peer_ttl);
        self.publish(notes);
    }

    fn publish(&self, notes: Vec<PeerNotification>) {
        for note in notes {
            match &note {
                PeerNotification::Added(p) => tracing::debug!(name = %p.name, "peer added"),
                PeerNotification::Updated { peer, .. } => {
                    tracing::debug!(name = %peer.name, host = ?peer.host, "peer updated")
                }
                PeerNotification::Removed(p) => tracing::info!(name = %p.name, "peer removed"),
                PeerNotification::SelectionCleared => tracing::info!("selected peer went away"),
            }
            let _ = self.notify.send(note);
        }
    }
}

async fn query_loop(socket: Arc<UdpSocket>, frame: Vec<u8>, target: SocketAddr, every: Duration) {
    loop {
        if let Err(e) = socket.send_to(&frame, target).await {
            tracing::debug!(%target, "query failed: {}", e);
        }
        tokio::time::sleep(every).await;
    }
}

async fn browse_recv_loop(socket: Arc<UdpSocket>, commands: mpsc::UnboundedSender<RegistryCommand>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("browse recv failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let msg = match decode_frame(&buf[..n]) {
            Ok((msg, _)) => msg,
            Err(e) => {
                tracing::debug!(%from, "ignoring datagram: {}", e);
                continue;
            }
        };
        if !msg.is_ours() {
            continue;
        }
        let cmd = match msg {
            Message::Announce { name, port, .. } => RegistryCommand::Announced {
                name,
                host: SocketAddr::new(from.ip(), port),
                from,
            },
            Message::ResolveResponse {
                name,
                port,
                properties,
                ..
            } => RegistryCommand::Resolved {
                name,
                host: SocketAddr::new(from.ip(), port),
                properties,
            },
            Message::Goodbye { name, .. } => RegistryCommand::Goodbye { name },
            _ => continue,
        };
        if commands.send(cmd).is_err() {
            return;
        }
    }
}
