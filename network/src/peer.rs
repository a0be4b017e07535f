//! Per-connection wire session: handshake, gossip, object transfer.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

use bitmessage_core::repository::{KnownNode, NodeRegistry};
use bitmessage_core::{CoreError, CoreResult, Cryptography, InventoryVector};
use bitmessage_inventory::Inventory;

use crate::connection::{split, FrameReader, FrameWriter};
use crate::message::{
    NetworkAddress, NetworkMessage, VersionPayload, MAX_ADDR_ENTRIES, MAX_INV_ENTRIES,
    MIN_PROTOCOL_VERSION,
};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
/// Largest tolerated clock difference in a version announcement.
pub const MAX_TIME_OFFSET: i64 = 3600;

const TICK_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE: usize = 256;
const MAX_MISBEHAVIOR: u32 = 3;
const MAX_CHECKSUM_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    VersionReceived,
    Active,
    Disconnected,
}

/// An object as it arrived from a session, before validation.
#[derive(Debug)]
pub struct InboundObject {
    pub from: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Dependencies every session shares, assembled by the network agent.
pub struct SessionContext {
    pub crypto: Arc<dyn Cryptography>,
    pub inventory: Arc<Inventory>,
    pub registry: Arc<dyn NodeRegistry>,
    pub user_agent: String,
    pub streams: Vec<u64>,
    /// Our random handshake nonce; a peer echoing it is ourselves.
    pub nonce: u64,
    pub port: u16,
    pub objects: mpsc::Sender<InboundObject>,
    /// Vectors with a GETDATA in flight anywhere, so two sessions do
    /// not fetch the same object twice.
    pub requested: Arc<DashMap<InventoryVector, Instant>>,
}

/// Shared view of one connection; the session task owns the socket.
pub struct Peer {
    pub addr: SocketAddr,
    pub direction: Direction,
    state: RwLock<SessionState>,
    remote: RwLock<Option<VersionPayload>>,
    outbound: mpsc::Sender<NetworkMessage>,
    shutdown: Notify,
    connected_at: Instant,
}

impl Peer {
    pub fn new(
        addr: SocketAddr,
        direction: Direction,
    ) -> (Arc<Self>, mpsc::Receiver<NetworkMessage>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let peer = Arc::new(Peer {
            addr,
            direction,
            state: RwLock::new(SessionState::Connecting),
            remote: RwLock::new(None),
            outbound,
            shutdown: Notify::new(),
            connected_at: Instant::now(),
        });
        (peer, outbound_rx)
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == SessionState::Active
    }

    /// Streams the remote subscribed to in its version message.
    pub async fn streams(&self) -> Vec<u64> {
        self.remote
            .read()
            .await
            .as_ref()
            .map(|v| v.streams.clone())
            .unwrap_or_default()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Asks the session task to wind down at its next turn.
    pub fn disconnect(&self) {
        self.shutdown.notify_one();
    }

    async fn wait_shutdown(&self) {
        self.shutdown.notified().await;
    }

    /// Queues a message for the session writer; a full queue drops the
    /// message rather than stalling the caller on a slow peer.
    pub fn send(&self, message: NetworkMessage) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(_) => {
                debug!(peer = %self.addr, "outbound queue full, message dropped");
                false
            }
        }
    }
}

/// Runs a session to completion; the error describes why it ended.
pub async fn run_session(
    ctx: Arc<SessionContext>,
    peer: Arc<Peer>,
    stream: TcpStream,
    mut outbound_rx: mpsc::Receiver<NetworkMessage>,
) -> CoreResult<()> {
    let (mut reader, mut writer) = split(stream, ctx.crypto.clone())?;

    let remote = timeout(
        HANDSHAKE_TIMEOUT,
        handshake(&ctx, &peer, &mut reader, &mut writer),
    )
    .await
    .map_err(|_| CoreError::Timeout)??;
    debug!(peer = %peer.addr, agent = %remote.user_agent, "handshake complete");

    *peer.remote.write().await = Some(remote);
    peer.set_state(SessionState::Active).await;

    let mut session = Session {
        ctx: ctx.clone(),
        peer: peer.clone(),
        pending: HashSet::new(),
        backlog: VecDeque::new(),
    };
    session.share_addresses(&mut writer).await?;
    session.share_inventory(&mut writer).await?;

    // Frames are read on their own task; `read_frame` holds partial
    // state across awaits and must never be dropped mid-frame by a
    // select race.
    let (frame_tx, mut frame_rx) = mpsc::channel(64);
    let reader_task = tokio::spawn(read_loop(reader, frame_tx));

    let result = active_loop(&mut session, &mut frame_rx, &mut writer, &mut outbound_rx).await;
    reader_task.abort();
    session.release_claims();
    peer.set_state(SessionState::Disconnected).await;
    result
}

/// Pumps frames to the session until the connection fails.
async fn read_loop(
    mut reader: FrameReader,
    frames: mpsc::Sender<CoreResult<NetworkMessage>>,
) {
    loop {
        let result = reader.read_frame().await;
        let (message, fatal) = match result {
            Ok((header, payload)) => {
                (NetworkMessage::decode_payload(&header.command, &payload), false)
            }
            // A checksum failure consumed the whole frame; the stream
            // is still in sync.
            Err(e @ CoreError::ChecksumMismatch) => (Err(e), false),
            Err(e) => (Err(e), true),
        };
        if frames.send(message).await.is_err() || fatal {
            return;
        }
    }
}

fn version_message(ctx: &SessionContext, remote: SocketAddr) -> NetworkMessage {
    let sender = SocketAddr::new("0.0.0.0".parse().expect("literal address"), ctx.port);
    NetworkMessage::Version(VersionPayload::new(
        remote,
        sender,
        ctx.nonce,
        unix_now() as i64,
        &ctx.user_agent,
        &ctx.streams,
    ))
}

/// Both sides send VERSION and answer with VERACK; the session is
/// active once both were seen. The connecting side speaks first.
async fn handshake(
    ctx: &SessionContext,
    peer: &Peer,
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
) -> CoreResult<VersionPayload> {
    let mut version_sent = peer.direction == Direction::Outbound;
    if version_sent {
        writer.write_message(&version_message(ctx, peer.addr)).await?;
    }

    let mut remote: Option<VersionPayload> = None;
    let mut verack_received = false;
    let mut verack_sent = false;
    while remote.is_none() || !verack_received || !verack_sent {
        let (header, payload) = reader.read_frame().await?;
        match NetworkMessage::decode_payload(&header.command, &payload)? {
            NetworkMessage::Version(version) => {
                if remote.is_some() {
                    return Err(CoreError::ProtocolViolation("duplicate version".into()));
                }
                validate_version(ctx, &version)?;
                if !version_sent {
                    writer.write_message(&version_message(ctx, peer.addr)).await?;
                    version_sent = true;
                }
                writer.write_message(&NetworkMessage::Verack).await?;
                verack_sent = true;
                peer.set_state(SessionState::VersionReceived).await;
                remote = Some(version);
            }
            NetworkMessage::Verack => verack_received = true,
            other => {
                return Err(CoreError::ProtocolViolation(format!(
                    "{} before handshake finished",
                    other.command()
                )));
            }
        }
    }
    remote.ok_or_else(|| CoreError::ProtocolViolation("handshake incomplete".into()))
}

fn validate_version(ctx: &SessionContext, version: &VersionPayload) -> CoreResult<()> {
    if version.version < MIN_PROTOCOL_VERSION {
        return Err(CoreError::ProtocolViolation(format!(
            "protocol version {} too old",
            version.version
        )));
    }
    if version.nonce == ctx.nonce {
        return Err(CoreError::ProtocolViolation("connected to ourselves".into()));
    }
    let skew = (unix_now() as i64 - version.timestamp).abs();
    if skew > MAX_TIME_OFFSET {
        return Err(CoreError::ProtocolViolation(format!(
            "peer clock off by {}s",
            skew
        )));
    }
    Ok(())
}

struct Session {
    ctx: Arc<SessionContext>,
    peer: Arc<Peer>,
    /// The one outstanding GETDATA batch.
    pending: HashSet<InventoryVector>,
    /// Claimed vectors waiting for the current batch to drain.
    backlog: VecDeque<InventoryVector>,
}

async fn active_loop(
    session: &mut Session,
    frame_rx: &mut mpsc::Receiver<CoreResult<NetworkMessage>>,
    writer: &mut FrameWriter,
    outbound_rx: &mut mpsc::Receiver<NetworkMessage>,
) -> CoreResult<()> {
    let mut last_activity = Instant::now();
    let mut misbehavior = 0u32;
    let mut checksum_failures = 0u32;
    let mut tick = interval(TICK_INTERVAL);
    tick.reset();
    let peer = session.peer.clone();

    loop {
        tokio::select! {
            _ = peer.wait_shutdown() => return Ok(()),
            frame = frame_rx.recv() => match frame {
                Some(Ok(message)) => {
                    last_activity = Instant::now();
                    session.on_message(message, writer).await?;
                }
                Some(Err(CoreError::ChecksumMismatch)) => {
                    checksum_failures += 1;
                    warn!(peer = %peer.addr, "frame checksum mismatch");
                    if checksum_failures >= MAX_CHECKSUM_FAILURES {
                        return Err(CoreError::ChecksumMismatch);
                    }
                }
                Some(Err(e @ CoreError::ProtocolViolation(_))) => return Err(e),
                Some(Err(e @ CoreError::Oversize(_))) => return Err(e),
                Some(Err(e @ CoreError::Io(_))) => return Err(e),
                Some(Err(e)) => {
                    // Malformed payload: drop the frame, penalize.
                    last_activity = Instant::now();
                    misbehavior += 1;
                    warn!(peer = %peer.addr, "dropping frame: {}", e);
                    if misbehavior >= MAX_MISBEHAVIOR {
                        return Err(CoreError::ProtocolViolation(
                            "too many malformed frames".into(),
                        ));
                    }
                }
                None => return Ok(()), // reader closed after a fatal error
            },
            message = outbound_rx.recv() => match message {
                Some(message) => writer.write_message(&message).await?,
                None => return Ok(()), // agent dropped us
            },
            _ = tick.tick() => {
                if last_activity.elapsed() > IDLE_TIMEOUT {
                    return Err(CoreError::Timeout);
                }
                if session.pending.is_empty() {
                    session.request_more(writer).await?;
                }
            }
        }
    }
}

impl Session {
    async fn on_message(
        &mut self,
        message: NetworkMessage,
        writer: &mut FrameWriter,
    ) -> CoreResult<()> {
        match message {
            NetworkMessage::Inv(vectors) => self.on_inv(vectors, writer).await,
            NetworkMessage::GetData(vectors) => self.on_getdata(vectors, writer).await,
            NetworkMessage::Object(bytes) => self.on_object(bytes, writer).await,
            NetworkMessage::Addr(addresses) => self.on_addr(addresses).await,
            NetworkMessage::Version(_) | NetworkMessage::Verack => Err(
                CoreError::ProtocolViolation("handshake message on active session".into()),
            ),
        }
    }

    /// Claims the vectors we lack and requests a batch if none is in
    /// flight.
    async fn on_inv(
        &mut self,
        vectors: Vec<InventoryVector>,
        writer: &mut FrameWriter,
    ) -> CoreResult<()> {
        let missing = self.ctx.inventory.missing(&vectors).await?;
        for iv in missing {
            if self.pending.contains(&iv) || self.backlog.contains(&iv) {
                continue;
            }
            // First session to claim a vector fetches it for everyone.
            match self.ctx.requested.entry(iv) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(Instant::now());
                    self.backlog.push_back(iv);
                }
            }
        }
        if self.pending.is_empty() {
            self.request_more(writer).await?;
        }
        Ok(())
    }

    async fn request_more(&mut self, writer: &mut FrameWriter) -> CoreResult<()> {
        if self.backlog.is_empty() {
            return Ok(());
        }
        let count = self.backlog.len().min(MAX_INV_ENTRIES);
        let batch: Vec<InventoryVector> = self.backlog.drain(..count).collect();
        self.pending.extend(batch.iter().copied());
        debug!(peer = %self.peer.addr, count, "requesting objects");
        writer.write_message(&NetworkMessage::GetData(batch)).await
    }

    /// Serves the objects we actually have; unknown vectors are
    /// silently skipped.
    async fn on_getdata(
        &mut self,
        vectors: Vec<InventoryVector>,
        writer: &mut FrameWriter,
    ) -> CoreResult<()> {
        for iv in vectors {
            if let Some(bytes) = self.ctx.inventory.get_object(&iv).await {
                writer.write_message(&NetworkMessage::Object(bytes)).await?;
            }
        }
        Ok(())
    }

    async fn on_object(
        &mut self,
        bytes: Vec<u8>,
        writer: &mut FrameWriter,
    ) -> CoreResult<()> {
        let iv = InventoryVector::of_object(self.ctx.crypto.as_ref(), &bytes);
        self.pending.remove(&iv);
        self.ctx.requested.remove(&iv);

        if self
            .ctx
            .objects
            .send(InboundObject {
                from: self.peer.addr,
                bytes,
            })
            .await
            .is_err()
        {
            // The agent is shutting down; so are we.
            return Ok(());
        }
        if self.pending.is_empty() {
            self.request_more(writer).await?;
        }
        Ok(())
    }

    async fn on_addr(&mut self, addresses: Vec<NetworkAddress>) -> CoreResult<()> {
        let now = unix_now();
        let nodes: Vec<KnownNode> = addresses
            .iter()
            .map(|a| KnownNode {
                ip: a.addr.ip(),
                port: a.addr.port(),
                stream: a.stream,
                services: a.services,
                // Never trust a future timestamp from gossip.
                last_seen: a.time.min(now),
            })
            .collect();
        debug!(peer = %self.peer.addr, count = nodes.len(), "merging gossiped addresses");
        self.ctx.registry.offer(&nodes).await
    }

    /// Opportunistic ADDR right after the handshake.
    async fn share_addresses(&mut self, writer: &mut FrameWriter) -> CoreResult<()> {
        let mut shared = Vec::new();
        for stream in &self.ctx.streams {
            let nodes = self
                .ctx
                .registry
                .known_nodes(*stream, MAX_ADDR_ENTRIES - shared.len())
                .await?;
            shared.extend(nodes.into_iter().map(|n| NetworkAddress {
                time: n.last_seen,
                stream: n.stream,
                services: n.services,
                addr: n.socket_addr(),
            }));
            if shared.len() >= MAX_ADDR_ENTRIES {
                break;
            }
        }
        if !shared.is_empty() {
            writer.write_message(&NetworkMessage::Addr(shared)).await?;
        }
        Ok(())
    }

    /// Announces our whole inventory for the streams both sides carry,
    /// in batches the protocol allows.
    async fn share_inventory(&mut self, writer: &mut FrameWriter) -> CoreResult<()> {
        let remote_streams = self.peer.streams().await;
        for stream in &self.ctx.streams {
            if !remote_streams.contains(stream) {
                continue;
            }
            let inventory = self.ctx.inventory.get_inventory(*stream).await?;
            for batch in inventory.chunks(MAX_INV_ENTRIES) {
                writer
                    .write_message(&NetworkMessage::Inv(batch.to_vec()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Returns claims so other sessions can fetch what we never got.
    fn release_claims(&mut self) {
        for iv in self.pending.drain() {
            self.ctx.requested.remove(&iv);
        }
        for iv in self.backlog.drain(..) {
            self.ctx.requested.remove(&iv);
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
