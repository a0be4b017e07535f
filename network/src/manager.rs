//! The network agent: connection pool, peer discovery and flood
//! propagation across subscribed streams.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

use bitmessage_core::repository::{KnownNode, NodeRegistry};
use bitmessage_core::{CoreError, CoreResult, Cryptography, InventoryVector, StoredObject};
use bitmessage_inventory::{Inventory, StoreResult};

use crate::message::NetworkMessage;
use crate::peer::{
    run_session, unix_now, Direction, InboundObject, Peer, SessionContext, SessionState,
};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);
/// An unanswered GETDATA claim lapses after this long so another
/// session may retry the vector.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const INBOUND_OBJECT_QUEUE: usize = 1024;

/// Knobs of the network agent.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub port: u16,
    /// Target number of outbound connections per stream.
    pub connection_limit: usize,
    /// Outbound connections are recycled after this long, rotating the
    /// pool through the known-node set.
    pub connection_ttl: Duration,
    pub user_agent: String,
    pub streams: Vec<u64>,
    /// Whether to accept inbound connections.
    pub listen: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 8444,
            connection_limit: 8,
            connection_ttl: Duration::from_secs(30 * 60),
            user_agent: "/bitmessage-rust:0.1.0/".into(),
            streams: vec![1],
            listen: true,
        }
    }
}

/// Owns the pool of peer sessions. Objects accepted into the inventory
/// are flooded to every other active peer as INV; full objects travel
/// only on request.
pub struct NetworkAgent {
    config: NetworkConfig,
    crypto: Arc<dyn Cryptography>,
    inventory: Arc<Inventory>,
    registry: Arc<dyn NodeRegistry>,
    peers: Arc<RwLock<HashMap<SocketAddr, Arc<Peer>>>>,
    requested: Arc<DashMap<InventoryVector, Instant>>,
    nonce: u64,
    objects_tx: mpsc::Sender<InboundObject>,
    /// Accepted objects, handed to the message pipeline.
    accepted_tx: mpsc::Sender<StoredObject>,
}

impl NetworkAgent {
    /// Builds the agent; accepted objects are delivered on the returned
    /// channel in arrival order.
    pub fn new(
        config: NetworkConfig,
        crypto: Arc<dyn Cryptography>,
        inventory: Arc<Inventory>,
        registry: Arc<dyn NodeRegistry>,
    ) -> (Arc<Self>, mpsc::Receiver<StoredObject>) {
        let (objects_tx, objects_rx) = mpsc::channel(INBOUND_OBJECT_QUEUE);
        let (accepted_tx, accepted_rx) = mpsc::channel(INBOUND_OBJECT_QUEUE);
        let nonce = crypto.random_nonce();
        let agent = Arc::new(NetworkAgent {
            config,
            crypto,
            inventory,
            registry,
            peers: Arc::new(RwLock::new(HashMap::new())),
            requested: Arc::new(DashMap::new()),
            nonce,
            objects_tx,
            accepted_tx,
        });
        agent.clone().spawn_ingest(objects_rx);
        (agent, accepted_rx)
    }

    /// Binds the listener (when enabled), connects outward and starts
    /// the maintenance loops. Returns the bound listen address.
    pub async fn start(self: &Arc<Self>) -> CoreResult<Option<SocketAddr>> {
        let listen_addr = if self.config.listen {
            let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
            let local = listener.local_addr()?;
            info!(addr = %local, "listening for peers");
            self.clone().spawn_accept_loop(listener);
            Some(local)
        } else {
            None
        };

        self.fill_outbound().await;
        self.clone().spawn_maintenance();
        Ok(listen_addr)
    }

    fn session_context(&self) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            crypto: self.crypto.clone(),
            inventory: self.inventory.clone(),
            registry: self.registry.clone(),
            user_agent: self.config.user_agent.clone(),
            streams: self.config.streams.clone(),
            nonce: self.nonce,
            port: self.config.port,
            objects: self.objects_tx.clone(),
            requested: self.requested.clone(),
        })
    }

    fn spawn_accept_loop(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let connected = self.peers.read().await.len();
                        // Leave headroom above the outbound target for
                        // inbound peers, like the port itself implies.
                        if connected >= self.config.connection_limit * 4 {
                            debug!(peer = %addr, "connection limit reached, refusing");
                            continue;
                        }
                        self.clone().spawn_session(stream, addr, Direction::Inbound);
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    fn spawn_session(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, direction: Direction) {
        let ctx = self.session_context();
        tokio::spawn(async move {
            let (peer, outbound_rx) = Peer::new(addr, direction);
            self.peers.write().await.insert(addr, peer.clone());

            let result = run_session(ctx, peer.clone(), stream, outbound_rx).await;
            match &result {
                Ok(()) => debug!(peer = %addr, "session closed"),
                Err(e) => debug!(peer = %addr, "session ended: {}", e),
            }

            self.peers.write().await.remove(&addr);
            self.after_session(addr, &peer, result).await;
        });
    }

    /// Registry bookkeeping once a session ends: reachable peers are
    /// refreshed, hostile or unreachable ones forgotten.
    async fn after_session(&self, addr: SocketAddr, peer: &Peer, result: CoreResult<()>) {
        let was_active = !peer.streams().await.is_empty();
        match result {
            Ok(()) | Err(CoreError::Timeout) if was_active => {
                for stream in peer.streams().await {
                    let node = KnownNode {
                        ip: addr.ip(),
                        port: addr.port(),
                        stream,
                        services: 1,
                        last_seen: unix_now(),
                    };
                    if let Err(e) = self.registry.touch(&node).await {
                        warn!("registry update failed: {}", e);
                    }
                }
            }
            Err(CoreError::ProtocolViolation(_)) => {
                let _ = self.registry.remove(addr.ip(), addr.port()).await;
            }
            _ => {}
        }
    }

    /// Opens outbound connections until every stream has its target.
    async fn fill_outbound(self: &Arc<Self>) {
        let peers = self.peers.read().await;
        let connected: Vec<SocketAddr> = peers.keys().copied().collect();
        let outbound_count = {
            let mut n = 0;
            for peer in peers.values() {
                if peer.direction == Direction::Outbound {
                    n += 1;
                }
            }
            n
        };
        drop(peers);

        let per_stream_target = self.config.connection_limit;
        if outbound_count >= per_stream_target * self.config.streams.len() {
            return;
        }

        for stream in &self.config.streams {
            let needed = per_stream_target.saturating_sub(outbound_count);
            if needed == 0 {
                continue;
            }
            let candidates = match self.registry.known_nodes(*stream, needed * 3).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("node registry unavailable: {}", e);
                    return;
                }
            };
            let mut opened = 0;
            for node in candidates {
                if opened >= needed {
                    break;
                }
                let addr = node.socket_addr();
                if connected.contains(&addr) {
                    continue;
                }
                opened += 1;
                let agent = self.clone();
                tokio::spawn(async move {
                    match TcpStream::connect(addr).await {
                        Ok(stream) => {
                            agent.spawn_session(stream, addr, Direction::Outbound);
                        }
                        Err(e) => {
                            debug!(peer = %addr, "connect failed: {}", e);
                            let _ = agent.registry.remove(addr.ip(), addr.port()).await;
                        }
                    }
                });
            }
        }
    }

    fn spawn_maintenance(self: Arc<Self>) {
        let agent = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(MAINTENANCE_INTERVAL);
            loop {
                tick.tick().await;
                agent.recycle_stale_peers().await;
                agent.fill_outbound().await;
                agent
                    .requested
                    .retain(|_, claimed| claimed.elapsed() < REQUEST_TIMEOUT);
            }
        });

        tokio::spawn(async move {
            let mut tick = interval(CLEANUP_INTERVAL);
            loop {
                tick.tick().await;
                match self.inventory.cleanup().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "inventory cleanup"),
                    Err(e) => warn!("inventory cleanup failed: {}", e),
                }
            }
        });
    }

    /// Drops outbound connections older than the configured TTL; the
    /// next maintenance round replaces them with fresh peers.
    async fn recycle_stale_peers(&self) {
        let mut stale = Vec::new();
        {
            let peers = self.peers.read().await;
            for (addr, peer) in peers.iter() {
                if peer.direction == Direction::Outbound && peer.age() > self.config.connection_ttl
                {
                    stale.push(*addr);
                }
            }
        }
        let peers = self.peers.read().await;
        for addr in stale {
            if let Some(peer) = peers.get(&addr) {
                debug!(peer = %addr, "recycling connection past its TTL");
                peer.disconnect();
            }
        }
    }

    fn spawn_ingest(self: Arc<Self>, mut objects_rx: mpsc::Receiver<InboundObject>) {
        tokio::spawn(async move {
            while let Some(inbound) = objects_rx.recv().await {
                self.ingest(inbound).await;
            }
        });
    }

    /// Validates one received object; on acceptance, floods the vector
    /// and hands the object to the pipeline.
    async fn ingest(&self, inbound: InboundObject) {
        match self.inventory.store_object(&inbound.bytes).await {
            StoreResult::Accepted(stored) => {
                self.flood(stored.iv, stored.stream, Some(inbound.from)).await;
                if self.accepted_tx.send(stored).await.is_err() {
                    warn!("object pipeline is gone");
                }
            }
            StoreResult::Duplicate => {
                // Normal under concurrent arrivals; first acceptance won.
                debug!(peer = %inbound.from, "duplicate object");
            }
            StoreResult::Rejected(e) => {
                warn!(peer = %inbound.from, "rejected object: {}", e);
            }
        }
    }

    /// Announces a vector to every active peer on the stream except the
    /// originator.
    async fn flood(&self, iv: InventoryVector, stream: u64, except: Option<SocketAddr>) {
        let peers = self.peers.read().await;
        for (addr, peer) in peers.iter() {
            if Some(*addr) == except {
                continue;
            }
            if !peer.is_active().await {
                continue;
            }
            if !peer.streams().await.contains(&stream) {
                continue;
            }
            peer.send(NetworkMessage::Inv(vec![iv]));
        }
    }

    /// Stores a locally-built object (PoW already attached) and floods
    /// it to everyone.
    pub async fn broadcast_object(&self, bytes: &[u8]) -> CoreResult<InventoryVector> {
        match self.inventory.store_object(bytes).await {
            StoreResult::Accepted(stored) => {
                info!(iv = %stored.iv, "broadcasting local object");
                self.flood(stored.iv, stored.stream, None).await;
                Ok(stored.iv)
            }
            StoreResult::Duplicate => Err(CoreError::Duplicate),
            StoreResult::Rejected(e) => Err(e),
        }
    }

    /// Current peer table snapshot `(addr, state, direction)`.
    pub async fn peer_snapshot(&self) -> Vec<(SocketAddr, SessionState, Direction)> {
        let peers = self.peers.read().await;
        let mut out = Vec::with_capacity(peers.len());
        for (addr, peer) in peers.iter() {
            out.push((*addr, peer.state().await, peer.direction));
        }
        out
    }

    pub async fn active_peer_count(&self) -> usize {
        let peers = self.peers.read().await;
        let mut n = 0;
        for peer in peers.values() {
            if peer.is_active().await {
                n += 1;
            }
        }
        n
    }
}
