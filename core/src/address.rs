//! Textual Bitmessage addresses and the keys derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{put_var_int, Decoder};
use crate::crypto::Cryptography;
use crate::error::{CoreError, CoreResult};

pub const RIPE_LENGTH: usize = 20;
const CHECKSUM_LENGTH: usize = 4;

/// `(version, stream, ripe)` — everything a peer may know about a
/// correspondent before their pubkey arrives.
///
/// The textual form is `BM-` plus Base58 of
/// `varint(version) || varint(stream) || ripe || checksum`, the ripe
/// stripped of leading zero bytes (all of them for v4+, at most two
/// for earlier versions) and the checksum being the first four bytes
/// of the double SHA-512 of the preceding data.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitmessageAddress {
    pub version: u64,
    pub stream: u64,
    pub ripe: [u8; RIPE_LENGTH],
}

impl BitmessageAddress {
    pub fn new(version: u64, stream: u64, ripe: [u8; RIPE_LENGTH]) -> Self {
        Self {
            version,
            stream,
            ripe,
        }
    }

    fn stripped_ripe(&self) -> &[u8] {
        let zeros = self.ripe.iter().take_while(|b| **b == 0).count();
        let strip = if self.version >= 4 { zeros } else { zeros.min(2) };
        &self.ripe[strip..]
    }

    /// `varint(version) || varint(stream) || ripe`, the full 20-byte
    /// ripe; input to tag and decryption-key derivation.
    fn derivation_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(2 + RIPE_LENGTH);
        put_var_int(&mut data, self.version);
        put_var_int(&mut data, self.stream);
        data.extend_from_slice(&self.ripe);
        data
    }

    /// Textual `BM-…` form.
    pub fn encode(&self, crypto: &dyn Cryptography) -> String {
        let mut data = Vec::with_capacity(2 + RIPE_LENGTH + CHECKSUM_LENGTH);
        put_var_int(&mut data, self.version);
        put_var_int(&mut data, self.stream);
        data.extend_from_slice(self.stripped_ripe());
        let checksum = crypto.double_sha512(&[&data]);
        data.extend_from_slice(&checksum[..CHECKSUM_LENGTH]);
        format!("BM-{}", bs58::encode(data).into_string())
    }

    /// Parses and checksum-verifies a textual address.
    pub fn parse(crypto: &dyn Cryptography, text: &str) -> CoreResult<Self> {
        let body = text.strip_prefix("BM-").unwrap_or(text);
        let data = bs58::decode(body)
            .into_vec()
            .map_err(|_| CoreError::parse("address is not valid Base58"))?;
        if data.len() < CHECKSUM_LENGTH + 2 {
            return Err(CoreError::parse("address too short"));
        }
        let (payload, checksum) = data.split_at(data.len() - CHECKSUM_LENGTH);
        let expected = crypto.double_sha512(&[payload]);
        if checksum != &expected[..CHECKSUM_LENGTH] {
            return Err(CoreError::parse("address checksum mismatch"));
        }

        let mut dec = Decoder::new(payload);
        let version = dec.var_int()?;
        let stream = dec.var_int()?;
        let stripped = dec.take_rest();
        if stripped.len() > RIPE_LENGTH {
            return Err(CoreError::parse("ripe longer than 20 bytes"));
        }
        let mut ripe = [0u8; RIPE_LENGTH];
        ripe[RIPE_LENGTH - stripped.len()..].copy_from_slice(stripped);
        Ok(Self {
            version,
            stream,
            ripe,
        })
    }

    /// Private scalar the owner of a v4 address uses to decrypt pubkey
    /// objects addressed to it: the first half of the double SHA-512 of
    /// the address data.
    pub fn derive_decryption_key(&self, crypto: &dyn Cryptography) -> [u8; 32] {
        let digest = crypto.double_sha512(&[&self.derivation_data()]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest[..32]);
        key
    }

    /// Public 32-byte identifier of v4 pubkeys and tagged broadcasts:
    /// the second half of the same digest, publishable without
    /// revealing the decryption scalar.
    pub fn tag(&self, crypto: &dyn Cryptography) -> [u8; 32] {
        let digest = crypto.double_sha512(&[&self.derivation_data()]);
        let mut tag = [0u8; 32];
        tag.copy_from_slice(&digest[32..]);
        tag
    }

    /// Symmetric-envelope keypair for broadcasts from this address: any
    /// subscriber can derive it from the textual address alone.
    pub fn broadcast_keys(&self, crypto: &dyn Cryptography) -> CoreResult<([u8; 32], [u8; 65])> {
        let private = self.derive_decryption_key(crypto);
        let public = crypto.create_public_key(&private)?;
        Ok((private, public))
    }
}

impl fmt::Debug for BitmessageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmessageAddress")
            .field("version", &self.version)
            .field("stream", &self.stream)
            .field("ripe", &hex::encode(self.ripe))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCryptography;

    fn ripe_with_leading_zero() -> [u8; RIPE_LENGTH] {
        let mut ripe = [0x5Au8; RIPE_LENGTH];
        ripe[0] = 0;
        ripe
    }

    #[test]
    fn round_trip_v4() {
        let crypto = DefaultCryptography::new();
        let addr = BitmessageAddress::new(4, 1, ripe_with_leading_zero());
        let text = addr.encode(&crypto);
        assert!(text.starts_with("BM-"));
        let parsed = BitmessageAddress::parse(&crypto, &text).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn round_trip_v3_with_two_leading_zeros() {
        let crypto = DefaultCryptography::new();
        let mut ripe = [0x33u8; RIPE_LENGTH];
        ripe[0] = 0;
        ripe[1] = 0;
        let addr = BitmessageAddress::new(3, 1, ripe);
        let parsed = BitmessageAddress::parse(&crypto, &addr.encode(&crypto)).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn checksum_corruption_is_detected() {
        let crypto = DefaultCryptography::new();
        let addr = BitmessageAddress::new(4, 1, ripe_with_leading_zero());
        let text = addr.encode(&crypto);

        // Flip one character at every position; each corruption must be
        // caught by Base58 or the checksum.
        let body: Vec<char> = text.chars().collect();
        for i in 3..body.len() {
            let mut corrupted = body.clone();
            corrupted[i] = if corrupted[i] == '2' { '3' } else { '2' };
            let corrupted: String = corrupted.iter().collect();
            if corrupted == text {
                continue;
            }
            assert!(
                BitmessageAddress::parse(&crypto, &corrupted).is_err(),
                "corruption at {} went undetected",
                i
            );
        }
    }

    #[test]
    fn prefix_is_optional_on_parse() {
        let crypto = DefaultCryptography::new();
        let addr = BitmessageAddress::new(4, 1, ripe_with_leading_zero());
        let text = addr.encode(&crypto);
        let bare = text.strip_prefix("BM-").unwrap();
        assert_eq!(BitmessageAddress::parse(&crypto, bare).unwrap(), addr);
    }

    #[test]
    fn tag_and_decryption_key_are_distinct_halves() {
        let crypto = DefaultCryptography::new();
        let addr = BitmessageAddress::new(4, 1, ripe_with_leading_zero());
        let key = addr.derive_decryption_key(&crypto);
        let tag = addr.tag(&crypto);
        assert_ne!(key, tag);
        // Deterministic across calls.
        assert_eq!(tag, addr.tag(&crypto));
    }

    #[test]
    fn different_streams_give_different_tags() {
        let crypto = DefaultCryptography::new();
        let a = BitmessageAddress::new(4, 1, ripe_with_leading_zero());
        let b = BitmessageAddress::new(4, 2, ripe_with_leading_zero());
        assert_ne!(a.tag(&crypto), b.tag(&crypto));
    }
}
