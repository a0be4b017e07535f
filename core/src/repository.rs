//! Persistence seams consumed by the core.
//!
//! The node never mandates an engine; anything that honors these
//! contracts (and tolerates concurrent use) plugs in. Reference
//! implementations live in the `bitmessage-storage` crate.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::address::BitmessageAddress;
use crate::error::CoreResult;
use crate::keys::{PrivateKey, Pubkey};
use crate::object::{InventoryVector, ObjectType};
use crate::plaintext::{Label, MessageStatus, Plaintext};

/// An object as the inventory persists it: the raw bytes plus the
/// envelope fields queries index on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub iv: InventoryVector,
    pub stream: u64,
    pub object_type: ObjectType,
    pub version: u64,
    pub expires_time: u64,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait InventoryRepository: Send + Sync {
    async fn contains(&self, iv: &InventoryVector) -> CoreResult<bool>;

    async fn get_object(&self, iv: &InventoryVector) -> CoreResult<Option<StoredObject>>;

    /// All currently-stored vectors for a stream.
    async fn get_inventory(&self, stream: u64) -> CoreResult<Vec<InventoryVector>>;

    /// Vectors filtered by version/type; either filter may be absent.
    async fn find(
        &self,
        stream: u64,
        version: Option<u64>,
        types: &[ObjectType],
    ) -> CoreResult<Vec<InventoryVector>>;

    /// Of the offered vectors, the ones not present here.
    async fn missing(&self, offered: &[InventoryVector]) -> CoreResult<Vec<InventoryVector>> {
        let mut out = Vec::new();
        for iv in offered {
            if !self.contains(iv).await? {
                out.push(*iv);
            }
        }
        Ok(out)
    }

    async fn store(&self, object: StoredObject) -> CoreResult<()>;

    /// Drops everything expired before `cutoff` and returns what was
    /// removed so the caller can keep suppressing those vectors.
    async fn remove_expired(&self, cutoff: u64) -> CoreResult<Vec<StoredObject>>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Persists the message, assigning an id on first save.
    async fn save(&self, message: &mut Plaintext) -> CoreResult<()>;

    async fn remove(&self, id: u64) -> CoreResult<()>;

    async fn get(&self, id: u64) -> CoreResult<Option<Plaintext>>;

    async fn find_by_initial_hash(&self, initial_hash: &[u8]) -> CoreResult<Option<Plaintext>>;

    async fn find_by_status(
        &self,
        status: MessageStatus,
        recipient: Option<&BitmessageAddress>,
    ) -> CoreResult<Vec<Plaintext>>;

    /// Sent messages whose retransmission timer has elapsed.
    async fn find_to_resend(&self, now: u64) -> CoreResult<Vec<Plaintext>>;

    /// The sent message whose embedded acknowledgement payload equals
    /// `ack_data`, if any.
    async fn find_by_ack_data(&self, ack_data: &[u8]) -> CoreResult<Option<Plaintext>>;

    async fn labels(&self) -> CoreResult<Vec<Label>>;

    async fn save_label(&self, label: &Label) -> CoreResult<()>;

    async fn remove_label(&self, id: u64) -> CoreResult<()>;

    async fn count_unread(&self, label_id: u64) -> CoreResult<u64>;
}

/// Everything the node knows about an address: always the tuple
/// itself, sometimes the pubkey (contacts) or the private keys
/// (identities).
#[derive(Debug, Clone)]
pub struct AddressEntry {
    pub address: BitmessageAddress,
    pub alias: Option<String>,
    pub pubkey: Option<Pubkey>,
    pub private_key: Option<PrivateKey>,
    /// Whether broadcasts from this address should be trial-decrypted.
    pub subscribed: bool,
}

impl AddressEntry {
    pub fn contact(address: BitmessageAddress) -> Self {
        AddressEntry {
            address,
            alias: None,
            pubkey: None,
            private_key: None,
            subscribed: false,
        }
    }

    pub fn identity(address: BitmessageAddress, key: PrivateKey) -> Self {
        AddressEntry {
            address,
            alias: None,
            pubkey: Some(key.pubkey.clone()),
            private_key: Some(key),
            subscribed: false,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.private_key.is_some()
    }
}

#[async_trait]
pub trait AddressRepository: Send + Sync {
    async fn get(&self, address: &BitmessageAddress) -> CoreResult<Option<AddressEntry>>;

    async fn save(&self, entry: AddressEntry) -> CoreResult<()>;

    /// Local identities, i.e. entries holding private keys.
    async fn identities(&self) -> CoreResult<Vec<AddressEntry>>;

    /// Addresses whose broadcasts we subscribe to.
    async fn subscriptions(&self) -> CoreResult<Vec<AddressEntry>>;

    /// Attaches (or refreshes) the pubkey of a known address.
    async fn attach_pubkey(
        &self,
        address: &BitmessageAddress,
        pubkey: Pubkey,
    ) -> CoreResult<()>;
}

/// A peer we have heard of, from bootstrap or ADDR gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownNode {
    pub ip: IpAddr,
    pub port: u16,
    pub stream: u64,
    pub services: u64,
    pub last_seen: u64,
}

impl KnownNode {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Up to `limit` known peers of a stream, freshest first.
    async fn known_nodes(&self, stream: u64, limit: usize) -> CoreResult<Vec<KnownNode>>;

    /// Merges gossiped or bootstrapped entries, keeping the freshest
    /// timestamp per endpoint.
    async fn offer(&self, nodes: &[KnownNode]) -> CoreResult<()>;

    /// Records a successful interaction with a peer.
    async fn touch(&self, node: &KnownNode) -> CoreResult<()>;

    /// Forgets a peer that keeps failing.
    async fn remove(&self, ip: IpAddr, port: u16) -> CoreResult<()>;
}

/// Why a PoW job exists; consulted when its nonce arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowPurpose {
    /// The object carries message `message_id`; completing it means the
    /// message was sent.
    Message { message_id: u64 },
    /// The object is the acknowledgement to embed into message
    /// `message_id` before the message itself can be built.
    Acknowledgement { message_id: u64 },
    /// The object announces one of our identities.
    PubkeyAnnouncement { address: BitmessageAddress },
    /// The object asks the network for a correspondent's pubkey.
    PubkeyRequest { recipient: BitmessageAddress },
    /// The object is a broadcast carrying message `message_id`.
    Broadcast { message_id: u64 },
}

/// A queued proof-of-work computation.
#[derive(Debug, Clone)]
pub struct PowItem {
    pub initial_hash: [u8; 64],
    pub target: u64,
    /// The serialized object minus its leading nonce.
    pub object_after_nonce: Vec<u8>,
    pub purpose: PowPurpose,
}

#[async_trait]
pub trait ProofOfWorkRepository: Send + Sync {
    async fn enqueue(&self, item: PowItem) -> CoreResult<()>;

    async fn pending(&self) -> CoreResult<Vec<PowItem>>;

    async fn get(&self, initial_hash: &[u8; 64]) -> CoreResult<Option<PowItem>>;

    async fn remove(&self, initial_hash: &[u8; 64]) -> CoreResult<()>;
}
