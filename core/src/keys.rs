//! Signing/encryption key pairs and their derived identity.

use tracing::debug;

use crate::address::{BitmessageAddress, RIPE_LENGTH};
use crate::codec::{put_u32, put_var_bytes, put_var_int, Decoder};
use crate::crypto::Cryptography;
use crate::error::CoreResult;
use crate::pow::{NETWORK_EXTRA_BYTES, NETWORK_NONCE_TRIALS_PER_BYTE};

/// Latest address/pubkey version this node generates.
pub const LATEST_ADDRESS_VERSION: u64 = 4;

/// Behavior bits a pubkey advertises. The protocol counts bits from the
/// most significant end of the 32-bit field, hence the subtraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// The owner expects the destination ripe to precede the encrypted
    /// msg data addressed to them.
    IncludeDestination,
    /// The owner sends acknowledgements instead of dropping them.
    DoesAck,
}

impl Feature {
    const ALL: [Feature; 2] = [Feature::IncludeDestination, Feature::DoesAck];

    fn bit(self) -> u32 {
        let bit_number = match self {
            Feature::IncludeDestination => 30,
            Feature::DoesAck => 31,
        };
        1 << (31 - bit_number)
    }

    pub fn bitfield(features: &[Feature]) -> u32 {
        features.iter().fold(0, |acc, f| acc | f.bit())
    }

    pub fn features(bitfield: u32) -> Vec<Feature> {
        Self::ALL
            .into_iter()
            .filter(|f| f.is_active(bitfield))
            .collect()
    }

    pub fn is_active(self, bitfield: u32) -> bool {
        bitfield & self.bit() != 0
    }
}

/// A correspondent's public key material, the answer to a getpubkey
/// request.
///
/// Keys are held in uncompressed 65-byte form (leading 0x04); the wire
/// codec reads and writes the 64-byte form the protocol uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pubkey {
    pub version: u64,
    pub stream: u64,
    pub behavior_bitfield: u32,
    pub public_signing_key: [u8; 65],
    pub public_encryption_key: [u8; 65],
    /// v3+: difficulty the owner demands for messages addressed to them.
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
    /// v3+: DER signature over object header + pubkey data.
    pub signature: Vec<u8>,
}

impl Pubkey {
    pub fn ripe(&self, crypto: &dyn Cryptography) -> [u8; RIPE_LENGTH] {
        let digest = crypto.sha512(&[&self.public_signing_key, &self.public_encryption_key]);
        crypto.ripemd160(&digest)
    }

    pub fn address(&self, crypto: &dyn Cryptography) -> BitmessageAddress {
        BitmessageAddress::new(self.version, self.stream, self.ripe(crypto))
    }

    pub fn does_ack(&self) -> bool {
        Feature::DoesAck.is_active(self.behavior_bitfield)
    }

    /// The fields covered by the pubkey signature, without the object
    /// header: behavior, both keys, and for v3+ the difficulty terms.
    pub fn signed_fields(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 128 + 8);
        put_u32(&mut buf, self.behavior_bitfield);
        buf.extend_from_slice(&self.public_signing_key[1..]);
        buf.extend_from_slice(&self.public_encryption_key[1..]);
        if self.version >= 3 {
            put_var_int(&mut buf, self.nonce_trials_per_byte);
            put_var_int(&mut buf, self.extra_bytes);
        }
        buf
    }

    /// Serializes the cleartext pubkey body (v2 stops after the keys,
    /// v3+ appends difficulty and signature).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.signed_fields());
        if self.version >= 3 {
            put_var_bytes(buf, &self.signature);
        }
    }

    pub fn decode(version: u64, stream: u64, dec: &mut Decoder<'_>) -> CoreResult<Self> {
        let behavior_bitfield = dec.u32()?;
        let mut public_signing_key = [4u8; 65];
        public_signing_key[1..].copy_from_slice(dec.bytes(64)?);
        let mut public_encryption_key = [4u8; 65];
        public_encryption_key[1..].copy_from_slice(dec.bytes(64)?);
        let (nonce_trials_per_byte, extra_bytes, signature) = if version >= 3 {
            let ntpb = dec.var_int()?;
            let eb = dec.var_int()?;
            let signature = dec.var_bytes(1024)?;
            (ntpb, eb, signature)
        } else {
            (0, 0, Vec::new())
        };
        Ok(Pubkey {
            version,
            stream,
            behavior_bitfield,
            public_signing_key,
            public_encryption_key,
            nonce_trials_per_byte,
            extra_bytes,
            signature,
        })
    }
}

/// A local identity: both private keys plus the derived pubkey.
#[derive(Clone)]
pub struct PrivateKey {
    pub private_signing_key: [u8; 32],
    pub private_encryption_key: [u8; 32],
    pub pubkey: Pubkey,
}

impl PrivateKey {
    /// Generates an identity from OS randomness (a 1024-byte seed).
    pub fn random(
        crypto: &dyn Cryptography,
        version: u64,
        stream: u64,
        shorter: bool,
        features: &[Feature],
    ) -> CoreResult<Self> {
        let seed = crypto.random_bytes(1024);
        let mut cursor = 0u64;
        Self::derive_next(crypto, &seed, &mut cursor, version, stream, shorter, features)
    }

    /// Derives `count` identities from a passphrase. Pure in all its
    /// arguments: the same inputs yield the same keys in the same
    /// order, on any machine. The nonce cursor keeps advancing across
    /// accepted keys, so key *n+1* continues where key *n* stopped.
    pub fn deterministic(
        crypto: &dyn Cryptography,
        passphrase: &str,
        count: usize,
        version: u64,
        stream: u64,
        shorter: bool,
    ) -> CoreResult<Vec<Self>> {
        let seed = passphrase.as_bytes();
        let mut cursor = 0u64;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(Self::derive_next(
                crypto,
                seed,
                &mut cursor,
                version,
                stream,
                shorter,
                &[Feature::DoesAck],
            )?);
        }
        Ok(keys)
    }

    /// Walks nonce pairs `(n, n+1)` until the derived ripe starts with
    /// a zero byte (two for "shorter" addresses), then leaves the
    /// cursor behind the accepted pair.
    fn derive_next(
        crypto: &dyn Cryptography,
        seed: &[u8],
        cursor: &mut u64,
        version: u64,
        stream: u64,
        shorter: bool,
        features: &[Feature],
    ) -> CoreResult<Self> {
        loop {
            let signing_nonce = *cursor;
            let encryption_nonce = *cursor + 1;
            *cursor += 2;

            let private_signing_key = hash_to_key(crypto, seed, signing_nonce);
            let private_encryption_key = hash_to_key(crypto, seed, encryption_nonce);

            // A truncated SHA-512 can land outside the curve order with
            // negligible probability; skip the pair when it does.
            let Ok(public_signing_key) = crypto.create_public_key(&private_signing_key) else {
                continue;
            };
            let Ok(public_encryption_key) = crypto.create_public_key(&private_encryption_key)
            else {
                continue;
            };

            let digest = crypto.sha512(&[&public_signing_key, &public_encryption_key]);
            let ripe = crypto.ripemd160(&digest);
            let acceptable = ripe[0] == 0 && (!shorter || ripe[1] == 0);
            if !acceptable {
                continue;
            }

            debug!(nonce = signing_nonce, "derived identity key pair");
            return Ok(PrivateKey {
                private_signing_key,
                private_encryption_key,
                pubkey: Pubkey {
                    version,
                    stream,
                    behavior_bitfield: Feature::bitfield(features),
                    public_signing_key,
                    public_encryption_key,
                    nonce_trials_per_byte: NETWORK_NONCE_TRIALS_PER_BYTE,
                    extra_bytes: NETWORK_EXTRA_BYTES,
                    signature: Vec::new(),
                },
            });
        }
    }

    pub fn address(&self, crypto: &dyn Cryptography) -> BitmessageAddress {
        self.pubkey.address(crypto)
    }

    /// Signs `data` with the signing key.
    pub fn sign(&self, crypto: &dyn Cryptography, data: &[u8]) -> CoreResult<Vec<u8>> {
        crypto.sign(&self.private_signing_key, data)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Private scalars stay out of logs.
        f.debug_struct("PrivateKey")
            .field("pubkey", &self.pubkey)
            .finish_non_exhaustive()
    }
}

fn hash_to_key(crypto: &dyn Cryptography, seed: &[u8], nonce: u64) -> [u8; 32] {
    let mut nonce_bytes = Vec::with_capacity(9);
    put_var_int(&mut nonce_bytes, nonce);
    let digest = crypto.sha512(&[seed, &nonce_bytes]);
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCryptography;

    #[test]
    fn bitfield_round_trip_for_every_subset() {
        let subsets: &[&[Feature]] = &[
            &[],
            &[Feature::IncludeDestination],
            &[Feature::DoesAck],
            &[Feature::IncludeDestination, Feature::DoesAck],
        ];
        for subset in subsets {
            let bitfield = Feature::bitfield(subset);
            let mut recovered = Feature::features(bitfield);
            recovered.sort_by_key(|f| f.bit());
            let mut expected = subset.to_vec();
            expected.sort_by_key(|f| f.bit());
            assert_eq!(recovered, expected);
        }
    }

    #[test]
    fn feature_bits_count_from_msb() {
        assert_eq!(Feature::DoesAck.bit(), 0x0000_0001);
        assert_eq!(Feature::IncludeDestination.bit(), 0x0000_0002);
    }

    #[test]
    fn random_key_has_zero_ripe_prefix() {
        let crypto = DefaultCryptography::new();
        let key = PrivateKey::random(&crypto, 4, 1, false, &[Feature::DoesAck]).unwrap();
        let ripe = key.pubkey.ripe(&crypto);
        assert_eq!(ripe[0], 0);
        assert_eq!(
            crypto.create_public_key(&key.private_signing_key).unwrap(),
            key.pubkey.public_signing_key
        );
        assert_eq!(
            crypto
                .create_public_key(&key.private_encryption_key)
                .unwrap(),
            key.pubkey.public_encryption_key
        );
    }

    #[test]
    fn deterministic_generation_is_pure() {
        let crypto = DefaultCryptography::new();
        let first = PrivateKey::deterministic(&crypto, "test", 2, 4, 1, false).unwrap();
        let second = PrivateKey::deterministic(&crypto, "test", 2, 4, 1, false).unwrap();
        assert_eq!(first.len(), 2);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.private_signing_key, b.private_signing_key);
            assert_eq!(a.private_encryption_key, b.private_encryption_key);
            assert_eq!(a.pubkey, b.pubkey);
        }
        // The cursor advanced: the two keys differ.
        assert_ne!(first[0].private_signing_key, first[1].private_signing_key);
    }

    #[test]
    fn deterministic_address_is_well_formed() {
        let crypto = DefaultCryptography::new();
        let keys = PrivateKey::deterministic(&crypto, "test", 1, 4, 1, false).unwrap();
        assert_eq!(keys.len(), 1);
        let address = keys[0].address(&crypto);
        assert_eq!(address.ripe[0], 0);
        assert!(address.encode(&crypto).starts_with("BM-"));
    }

    #[test]
    fn different_passphrases_differ() {
        let crypto = DefaultCryptography::new();
        let a = PrivateKey::deterministic(&crypto, "test", 1, 4, 1, false).unwrap();
        let b = PrivateKey::deterministic(&crypto, "other", 1, 4, 1, false).unwrap();
        assert_ne!(a[0].private_signing_key, b[0].private_signing_key);
    }

    #[test]
    fn pubkey_codec_round_trip_v3() {
        let crypto = DefaultCryptography::new();
        let key = PrivateKey::random(&crypto, 3, 1, false, &[Feature::DoesAck]).unwrap();
        let mut pubkey = key.pubkey.clone();
        pubkey.signature = vec![0x30, 0x02, 0x01, 0x00];

        let mut buf = Vec::new();
        pubkey.encode(&mut buf);
        let mut dec = Decoder::new(&buf);
        let parsed = Pubkey::decode(3, 1, &mut dec).unwrap();
        assert!(dec.is_empty());
        assert_eq!(parsed, pubkey);
    }

    #[test]
    fn pubkey_codec_round_trip_v2_has_no_signature() {
        let crypto = DefaultCryptography::new();
        let key = PrivateKey::random(&crypto, 2, 1, false, &[]).unwrap();
        let mut pubkey = key.pubkey.clone();
        pubkey.version = 2;
        pubkey.nonce_trials_per_byte = 0;
        pubkey.extra_bytes = 0;

        let mut buf = Vec::new();
        pubkey.encode(&mut buf);
        assert_eq!(buf.len(), 4 + 64 + 64);
        let mut dec = Decoder::new(&buf);
        let parsed = Pubkey::decode(2, 1, &mut dec).unwrap();
        assert_eq!(parsed, pubkey);
    }
}
