//! The flood-fill unit: a PoW-bearing, content-addressed object.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{put_u32, put_u64, put_var_int, Decoder, MAX_PAYLOAD_SIZE};
use crate::crypto::Cryptography;
use crate::error::{CoreError, CoreResult};
use crate::payload::ObjectPayload;

/// Content address of an object: the first 32 bytes of
/// `sha512(sha512(object_bytes))`, nonce included.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InventoryVector(pub [u8; 32]);

impl InventoryVector {
    pub fn of_object(crypto: &dyn Cryptography, object_bytes: &[u8]) -> Self {
        let digest = crypto.double_sha512(&[object_bytes]);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest[..32]);
        InventoryVector(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for InventoryVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for InventoryVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iv:{}", &hex::encode(self.0)[..16])
    }
}

/// The four object kinds of wire protocol version 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    GetPubkey,
    Pubkey,
    Msg,
    Broadcast,
}

impl ObjectType {
    pub fn from_u32(value: u32) -> CoreResult<Self> {
        match value {
            0 => Ok(ObjectType::GetPubkey),
            1 => Ok(ObjectType::Pubkey),
            2 => Ok(ObjectType::Msg),
            3 => Ok(ObjectType::Broadcast),
            other => Err(CoreError::parse(format!("unknown object type {}", other))),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            ObjectType::GetPubkey => 0,
            ObjectType::Pubkey => 1,
            ObjectType::Msg => 2,
            ObjectType::Broadcast => 3,
        }
    }

    /// Protocol ceiling on `expires_time - now` for new objects of this
    /// type.
    pub fn max_ttl(self) -> u64 {
        match self {
            ObjectType::GetPubkey => 2 * 24 * 3600,
            ObjectType::Pubkey => 28 * 24 * 3600,
            ObjectType::Msg => 216_000, // 2.5 days
            ObjectType::Broadcast => 2 * 24 * 3600,
        }
    }
}

/// Tolerated clock skew when accepting objects: slightly stale or
/// slightly too-far-in-the-future expiry times are allowed.
pub const EXPIRY_GRACE_PAST: u64 = 5 * 60;
pub const EXPIRY_GRACE_FUTURE: u64 = 3 * 3600;

/// A parsed object envelope plus its typed payload.
///
/// The codec is a strict inverse of the parser, so an object decoded
/// from the network re-encodes to the identical bytes and keeps its
/// inventory vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub nonce: [u8; 8],
    pub expires_time: u64,
    pub version: u64,
    pub stream: u64,
    pub payload: ObjectPayload,
}

impl Object {
    pub fn object_type(&self) -> ObjectType {
        self.payload.object_type()
    }

    /// Serializes the whole object, nonce first.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.nonce);
        self.encode_after_nonce(&mut buf);
        buf
    }

    /// Serializes everything after the nonce; the input to the PoW
    /// initial hash.
    pub fn encode_after_nonce(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.expires_time);
        put_u32(buf, self.object_type().as_u32());
        put_var_int(buf, self.version);
        put_var_int(buf, self.stream);
        self.payload.encode(buf);
    }

    /// The envelope fields every signature covers: `expires_time`
    /// through `stream`.
    pub fn signed_header(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        put_u64(&mut buf, self.expires_time);
        put_u32(&mut buf, self.object_type().as_u32());
        put_var_int(&mut buf, self.version);
        put_var_int(&mut buf, self.stream);
        buf
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(CoreError::Oversize(bytes.len()));
        }
        let mut dec = Decoder::new(bytes);
        let nonce = dec.array::<8>()?;
        let expires_time = dec.u64()?;
        let object_type = ObjectType::from_u32(dec.u32()?)?;
        let version = dec.var_int()?;
        let stream = dec.var_int()?;
        let payload = ObjectPayload::decode(object_type, version, stream, &mut dec)?;
        dec.finish()?;
        Ok(Object {
            nonce,
            expires_time,
            version,
            stream,
            payload,
        })
    }

    pub fn inventory_vector(&self, crypto: &dyn Cryptography) -> InventoryVector {
        InventoryVector::of_object(crypto, &self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCryptography;
    use crate::payload::{GetPubkey, ObjectPayload};

    fn sample_object() -> Object {
        Object {
            nonce: [0, 0, 0, 0, 0, 0, 0, 42],
            expires_time: 1_700_000_000,
            version: 3,
            stream: 1,
            payload: ObjectPayload::GetPubkey(GetPubkey::Ripe([7u8; 20])),
        }
    }

    #[test]
    fn envelope_round_trip() {
        let object = sample_object();
        let bytes = object.encode();
        let parsed = Object::decode(&bytes).unwrap();
        assert_eq!(parsed, object);
        assert_eq!(parsed.encode(), bytes);
    }

    #[test]
    fn envelope_layout_is_fixed() {
        let bytes = sample_object().encode();
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 42]);
        assert_eq!(u64::from_be_bytes(bytes[8..16].try_into().unwrap()), 1_700_000_000);
        assert_eq!(u32::from_be_bytes(bytes[16..20].try_into().unwrap()), 0);
        assert_eq!(bytes[20], 3); // version varint
        assert_eq!(bytes[21], 1); // stream varint
    }

    #[test]
    fn iv_is_double_sha512_prefix() {
        let crypto = DefaultCryptography::new();
        let object = sample_object();
        let bytes = object.encode();
        let digest = crypto.double_sha512(&[&bytes]);
        assert_eq!(object.inventory_vector(&crypto).as_bytes(), &digest[..32]);
    }

    #[test]
    fn nonce_changes_the_iv() {
        let crypto = DefaultCryptography::new();
        let mut object = sample_object();
        let before = object.inventory_vector(&crypto);
        object.nonce = [1; 8];
        assert_ne!(before, object.inventory_vector(&crypto));
    }

    #[test]
    fn unknown_object_type_is_rejected() {
        let mut bytes = sample_object().encode();
        bytes[19] = 9; // objectType = 9
        assert!(matches!(Object::decode(&bytes), Err(CoreError::Parse(_))));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = sample_object().encode();
        bytes.push(0);
        assert!(Object::decode(&bytes).is_err());
    }

    #[test]
    fn oversize_object_is_rejected() {
        let bytes = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            Object::decode(&bytes),
            Err(CoreError::Oversize(_))
        ));
    }
}
