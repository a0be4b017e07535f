//! Typed object payloads and their canonical byte forms.
//!
//! One tagged variant per object kind; shared behavior (signing input,
//! encryption envelope) lives in free functions and helper structs
//! instead of a type hierarchy. Encrypted payloads stay opaque byte
//! strings until someone trial-decrypts them, so foreign traffic and
//! embedded acknowledgements survive decode → encode unchanged.

use crate::address::RIPE_LENGTH;
use crate::codec::{put_u32, put_var_bytes, put_var_int, Decoder, MAX_PAYLOAD_SIZE};
use crate::crypto::Cryptography;
use crate::error::{CoreError, CoreResult};
use crate::keys::Pubkey;
use crate::object::ObjectType;

pub const TAG_LENGTH: usize = 32;

/// A request for somebody's pubkey: the ripe for v2/v3 addresses, the
/// address tag for v4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetPubkey {
    Ripe([u8; RIPE_LENGTH]),
    Tag([u8; TAG_LENGTH]),
}

/// A pubkey announcement. v2/v3 travel in cleartext; v4 is encrypted to
/// a key only holders of the textual address can derive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubkeyPayload {
    Plain(Pubkey),
    Encrypted {
        tag: [u8; TAG_LENGTH],
        encrypted: Vec<u8>,
    },
}

/// A broadcast; v5 objects prefix the sender's address tag so
/// subscribers can cheaply pre-filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastPayload {
    Plain {
        encrypted: Vec<u8>,
    },
    Tagged {
        tag: [u8; TAG_LENGTH],
        encrypted: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectPayload {
    GetPubkey(GetPubkey),
    Pubkey(PubkeyPayload),
    /// Opaque encrypted person-to-person message. Also the shape of
    /// acknowledgement objects, whose "ciphertext" is whatever the
    /// original sender put there.
    Msg { encrypted: Vec<u8> },
    Broadcast(BroadcastPayload),
}

impl ObjectPayload {
    pub fn object_type(&self) -> ObjectType {
        match self {
            ObjectPayload::GetPubkey(_) => ObjectType::GetPubkey,
            ObjectPayload::Pubkey(_) => ObjectType::Pubkey,
            ObjectPayload::Msg { .. } => ObjectType::Msg,
            ObjectPayload::Broadcast(_) => ObjectType::Broadcast,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ObjectPayload::GetPubkey(GetPubkey::Ripe(ripe)) => buf.extend_from_slice(ripe),
            ObjectPayload::GetPubkey(GetPubkey::Tag(tag)) => buf.extend_from_slice(tag),
            ObjectPayload::Pubkey(PubkeyPayload::Plain(pubkey)) => pubkey.encode(buf),
            ObjectPayload::Pubkey(PubkeyPayload::Encrypted { tag, encrypted }) => {
                buf.extend_from_slice(tag);
                buf.extend_from_slice(encrypted);
            }
            ObjectPayload::Msg { encrypted } => buf.extend_from_slice(encrypted),
            ObjectPayload::Broadcast(BroadcastPayload::Plain { encrypted }) => {
                buf.extend_from_slice(encrypted)
            }
            ObjectPayload::Broadcast(BroadcastPayload::Tagged { tag, encrypted }) => {
                buf.extend_from_slice(tag);
                buf.extend_from_slice(encrypted);
            }
        }
    }

    pub fn decode(
        object_type: ObjectType,
        version: u64,
        stream: u64,
        dec: &mut Decoder<'_>,
    ) -> CoreResult<Self> {
        match object_type {
            ObjectType::GetPubkey => match version {
                2 | 3 => Ok(ObjectPayload::GetPubkey(GetPubkey::Ripe(dec.array()?))),
                4 => Ok(ObjectPayload::GetPubkey(GetPubkey::Tag(dec.array()?))),
                v => Err(CoreError::parse(format!("getpubkey version {}", v))),
            },
            ObjectType::Pubkey => match version {
                2 | 3 => Ok(ObjectPayload::Pubkey(PubkeyPayload::Plain(Pubkey::decode(
                    version, stream, dec,
                )?))),
                4 => Ok(ObjectPayload::Pubkey(PubkeyPayload::Encrypted {
                    tag: dec.array()?,
                    encrypted: dec.take_rest().to_vec(),
                })),
                v => Err(CoreError::parse(format!("pubkey version {}", v))),
            },
            ObjectType::Msg => Ok(ObjectPayload::Msg {
                encrypted: dec.take_rest().to_vec(),
            }),
            ObjectType::Broadcast => match version {
                4 => Ok(ObjectPayload::Broadcast(BroadcastPayload::Plain {
                    encrypted: dec.take_rest().to_vec(),
                })),
                5 => Ok(ObjectPayload::Broadcast(BroadcastPayload::Tagged {
                    tag: dec.array()?,
                    encrypted: dec.take_rest().to_vec(),
                })),
                v => Err(CoreError::parse(format!("broadcast version {}", v))),
            },
        }
    }
}

/// The decrypted body of a person-to-person msg: the sender's identity,
/// the destination, the message, an optional embedded acknowledgement
/// object and a trailing signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgData {
    pub msg_version: u64,
    pub address_version: u64,
    pub stream: u64,
    pub behavior_bitfield: u32,
    pub public_signing_key: [u8; 65],
    pub public_encryption_key: [u8; 65],
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
    pub destination_ripe: [u8; RIPE_LENGTH],
    pub encoding: u64,
    pub message: Vec<u8>,
    /// Serialized ack object, or empty when no ack was requested.
    pub ack: Vec<u8>,
    pub signature: Vec<u8>,
}

impl MsgData {
    /// Everything before the signature, the sender-identity part in
    /// protocol order.
    pub fn signed_fields(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256 + self.message.len() + self.ack.len());
        put_var_int(&mut buf, self.msg_version);
        put_var_int(&mut buf, self.address_version);
        put_var_int(&mut buf, self.stream);
        put_u32(&mut buf, self.behavior_bitfield);
        buf.extend_from_slice(&self.public_signing_key[1..]);
        buf.extend_from_slice(&self.public_encryption_key[1..]);
        if self.address_version >= 3 {
            put_var_int(&mut buf, self.nonce_trials_per_byte);
            put_var_int(&mut buf, self.extra_bytes);
        }
        buf.extend_from_slice(&self.destination_ripe);
        put_var_int(&mut buf, self.encoding);
        put_var_bytes(&mut buf, &self.message);
        put_var_bytes(&mut buf, &self.ack);
        buf
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.signed_fields();
        put_var_bytes(&mut buf, &self.signature);
        buf
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut dec = Decoder::new(bytes);
        let msg_version = dec.var_int()?;
        let address_version = dec.var_int()?;
        let stream = dec.var_int()?;
        let behavior_bitfield = dec.u32()?;
        let mut public_signing_key = [4u8; 65];
        public_signing_key[1..].copy_from_slice(dec.bytes(64)?);
        let mut public_encryption_key = [4u8; 65];
        public_encryption_key[1..].copy_from_slice(dec.bytes(64)?);
        let (nonce_trials_per_byte, extra_bytes) = if address_version >= 3 {
            (dec.var_int()?, dec.var_int()?)
        } else {
            (0, 0)
        };
        let destination_ripe = dec.array()?;
        let encoding = dec.var_int()?;
        let message = dec.var_bytes(MAX_PAYLOAD_SIZE)?;
        let ack = dec.var_bytes(MAX_PAYLOAD_SIZE)?;
        let signature = dec.var_bytes(1024)?;
        dec.finish()?;
        Ok(MsgData {
            msg_version,
            address_version,
            stream,
            behavior_bitfield,
            public_signing_key,
            public_encryption_key,
            nonce_trials_per_byte,
            extra_bytes,
            destination_ripe,
            encoding,
            message,
            ack,
            signature,
        })
    }

    /// The sender's pubkey as embedded in the message.
    pub fn sender_pubkey(&self) -> Pubkey {
        Pubkey {
            version: self.address_version,
            stream: self.stream,
            behavior_bitfield: self.behavior_bitfield,
            public_signing_key: self.public_signing_key,
            public_encryption_key: self.public_encryption_key,
            nonce_trials_per_byte: self.nonce_trials_per_byte,
            extra_bytes: self.extra_bytes,
            signature: Vec::new(),
        }
    }
}

/// The decrypted body of a broadcast: like [`MsgData`] minus the
/// destination and acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastData {
    pub address_version: u64,
    pub stream: u64,
    pub behavior_bitfield: u32,
    pub public_signing_key: [u8; 65],
    pub public_encryption_key: [u8; 65],
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
    pub encoding: u64,
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
}

impl BroadcastData {
    pub fn signed_fields(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(192 + self.message.len());
        put_var_int(&mut buf, self.address_version);
        put_var_int(&mut buf, self.stream);
        put_u32(&mut buf, self.behavior_bitfield);
        buf.extend_from_slice(&self.public_signing_key[1..]);
        buf.extend_from_slice(&self.public_encryption_key[1..]);
        if self.address_version >= 3 {
            put_var_int(&mut buf, self.nonce_trials_per_byte);
            put_var_int(&mut buf, self.extra_bytes);
        }
        put_var_int(&mut buf, self.encoding);
        put_var_bytes(&mut buf, &self.message);
        buf
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.signed_fields();
        put_var_bytes(&mut buf, &self.signature);
        buf
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut dec = Decoder::new(bytes);
        let address_version = dec.var_int()?;
        let stream = dec.var_int()?;
        let behavior_bitfield = dec.u32()?;
        let mut public_signing_key = [4u8; 65];
        public_signing_key[1..].copy_from_slice(dec.bytes(64)?);
        let mut public_encryption_key = [4u8; 65];
        public_encryption_key[1..].copy_from_slice(dec.bytes(64)?);
        let (nonce_trials_per_byte, extra_bytes) = if address_version >= 3 {
            (dec.var_int()?, dec.var_int()?)
        } else {
            (0, 0)
        };
        let encoding = dec.var_int()?;
        let message = dec.var_bytes(MAX_PAYLOAD_SIZE)?;
        let signature = dec.var_bytes(1024)?;
        dec.finish()?;
        Ok(BroadcastData {
            address_version,
            stream,
            behavior_bitfield,
            public_signing_key,
            public_encryption_key,
            nonce_trials_per_byte,
            extra_bytes,
            encoding,
            message,
            signature,
        })
    }

    pub fn sender_pubkey(&self) -> Pubkey {
        Pubkey {
            version: self.address_version,
            stream: self.stream,
            behavior_bitfield: self.behavior_bitfield,
            public_signing_key: self.public_signing_key,
            public_encryption_key: self.public_encryption_key,
            nonce_trials_per_byte: self.nonce_trials_per_byte,
            extra_bytes: self.extra_bytes,
            signature: Vec::new(),
        }
    }
}

/// Signature input for any signed payload: object header (expires_time
/// through stream) followed by the payload's signed fields.
pub fn signing_input(signed_header: &[u8], signed_fields: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(signed_header.len() + signed_fields.len());
    buf.extend_from_slice(signed_header);
    buf.extend_from_slice(signed_fields);
    buf
}

/// Signature check shared by pubkey, msg and broadcast payloads; must
/// run before any side-effecting use of the payload.
pub fn verify_signature(
    crypto: &dyn Cryptography,
    public_signing_key: &[u8],
    signed_header: &[u8],
    signed_fields: &[u8],
    signature: &[u8],
) -> CoreResult<()> {
    let input = signing_input(signed_header, signed_fields);
    if crypto.verify(public_signing_key, signature, &input) {
        Ok(())
    } else {
        Err(CoreError::SignatureInvalid)
    }
}
