//! # Bitmessage Core Library
//!
//! Protocol core of a Bitmessage node: the bit-exact wire codec, the
//! cryptographic identity and address model, typed objects with their
//! proof-of-work contract, and the repository seams the node consumes.
//!
//! Networking lives in `bitmessage-network`, the inventory in
//! `bitmessage-inventory`, and the nonce grinder in `bitmessage-pow`;
//! this crate is the leaf they all share.

pub mod address;
pub mod codec;
pub mod crypto;
pub mod crypto_box;
pub mod error;
pub mod keys;
pub mod object;
pub mod payload;
pub mod plaintext;
pub mod pow;
pub mod repository;

pub use address::BitmessageAddress;
pub use crypto::{Cryptography, DefaultCryptography};
pub use crypto_box::CryptoBox;
pub use error::{CoreError, CoreResult};
pub use keys::{Feature, PrivateKey, Pubkey};
pub use object::{InventoryVector, Object, ObjectType};
pub use payload::{BroadcastData, BroadcastPayload, GetPubkey, MsgData, ObjectPayload, PubkeyPayload};
pub use plaintext::{Label, LabelKind, MessageEncoding, MessageStatus, Plaintext, PlaintextType};
pub use repository::{
    AddressEntry, AddressRepository, InventoryRepository, KnownNode, MessageRepository,
    NodeRegistry, PowItem, PowPurpose, ProofOfWorkRepository, StoredObject,
};
