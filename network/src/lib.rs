//! Bitmessage wire protocol: framed messages, per-peer sessions and
//! the flood-fill network agent.

pub mod connection;
pub mod manager;
pub mod message;
pub mod peer;

pub use connection::{FrameReader, FrameWriter};
pub use manager::{NetworkAgent, NetworkConfig};
pub use message::{
    FrameHeader, NetworkAddress, NetworkMessage, VersionPayload, MAGIC, MAX_ADDR_ENTRIES,
    MAX_INV_ENTRIES, MIN_PROTOCOL_VERSION, NODE_NETWORK, PROTOCOL_VERSION,
};
pub use peer::{
    Direction, InboundObject, Peer, SessionContext, SessionState, HANDSHAKE_TIMEOUT, IDLE_TIMEOUT,
    MAX_TIME_OFFSET,
};
