//! The encryption envelope shared by msg, v4 pubkey and broadcast
//! payloads.
//!
//! Wire layout: `IV(16) || curveType(u16, 0x02CA) || xLen(u16) || x ||
//! yLen(u16) || y || ciphertext || mac(32)`. The x/y pair is the
//! ephemeral public point; key material is `sha512(X)` of the ECDH
//! shared point, split into an AES-256-CBC key (first half) and an
//! HMAC-SHA-256 key (second half). The MAC covers everything before it.

use crate::codec::{put_u16, Decoder};
use crate::crypto::Cryptography;
use crate::error::{CoreError, CoreResult};

const CURVE_SECP256K1: u16 = 0x02CA;
const MAC_LENGTH: usize = 32;
const COORD_LENGTH: usize = 32;

/// An encrypted payload together with the ephemeral key that unlocks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoBox {
    pub iv: [u8; 16],
    pub curve_type: u16,
    /// Ephemeral x/y coordinates exactly as transmitted; decoding keeps
    /// the original byte strings so re-encoding is bit-identical.
    pub x: Vec<u8>,
    pub y: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub mac: [u8; 32],
}

impl CryptoBox {
    /// Encrypts `plaintext` to the holder of `recipient_public_key`
    /// (64- or 65-byte encryption key) under a fresh ephemeral key.
    pub fn encrypt(
        crypto: &dyn Cryptography,
        recipient_public_key: &[u8],
        plaintext: &[u8],
    ) -> CoreResult<Self> {
        let mut ephemeral_private = [0u8; 32];
        ephemeral_private.copy_from_slice(&crypto.random_bytes(32));
        let ephemeral_public = crypto.create_public_key(&ephemeral_private)?;

        let shared = crypto.multiply(recipient_public_key, &ephemeral_private)?;
        let (key_e, key_m) = derive_keys(crypto, &shared);

        let mut iv = [0u8; 16];
        iv.copy_from_slice(&crypto.random_bytes(16));
        let ciphertext = crypto.aes256_cbc_encrypt(&key_e, &iv, plaintext);

        let x = ephemeral_public[1..1 + COORD_LENGTH].to_vec();
        let y = ephemeral_public[1 + COORD_LENGTH..].to_vec();
        let mut boxed = CryptoBox {
            iv,
            curve_type: CURVE_SECP256K1,
            x,
            y,
            ciphertext,
            mac: [0u8; 32],
        };
        boxed.mac = crypto.hmac_sha256(&key_m, &boxed.mac_input());
        Ok(boxed)
    }

    /// Attempts decryption with `private_key`. A MAC mismatch means the
    /// payload is not addressed to this key, which is the normal case
    /// during trial decryption and reported as `DecryptionFailed`.
    pub fn decrypt(&self, crypto: &dyn Cryptography, private_key: &[u8; 32]) -> CoreResult<Vec<u8>> {
        if self.curve_type != CURVE_SECP256K1 {
            return Err(CoreError::parse(format!(
                "unsupported curve type 0x{:04X}",
                self.curve_type
            )));
        }
        let ephemeral = self.ephemeral_public_key()?;
        let shared = crypto
            .multiply(&ephemeral, private_key)
            .map_err(|_| CoreError::DecryptionFailed)?;
        let (key_e, key_m) = derive_keys(crypto, &shared);

        let expected = crypto.hmac_sha256(&key_m, &self.mac_input());
        if expected != self.mac {
            return Err(CoreError::DecryptionFailed);
        }
        crypto.aes256_cbc_decrypt(&key_e, &self.iv, &self.ciphertext)
    }

    /// Reassembles the 65-byte ephemeral key, left-padding short
    /// coordinates back to 32 bytes.
    fn ephemeral_public_key(&self) -> CoreResult<[u8; 65]> {
        let mut out = [0u8; 65];
        out[0] = 0x04;
        pad_coordinate(&self.x, &mut out[1..33])?;
        pad_coordinate(&self.y, &mut out[33..65])?;
        Ok(out)
    }

    fn mac_input(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 6 + self.x.len() + self.y.len() + self.ciphertext.len());
        buf.extend_from_slice(&self.iv);
        put_u16(&mut buf, self.curve_type);
        put_u16(&mut buf, self.x.len() as u16);
        buf.extend_from_slice(&self.x);
        put_u16(&mut buf, self.y.len() as u16);
        buf.extend_from_slice(&self.y);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.mac_input());
        buf.extend_from_slice(&self.mac);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Parses an envelope from `bytes`; the ciphertext is everything
    /// between the ephemeral key and the trailing MAC.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut dec = Decoder::new(bytes);
        let iv = dec.array::<16>()?;
        let curve_type = dec.u16()?;
        let x_len = dec.u16()? as usize;
        if x_len > COORD_LENGTH {
            return Err(CoreError::parse(format!("x coordinate of {} bytes", x_len)));
        }
        let x = dec.bytes(x_len)?.to_vec();
        let y_len = dec.u16()? as usize;
        if y_len > COORD_LENGTH {
            return Err(CoreError::parse(format!("y coordinate of {} bytes", y_len)));
        }
        let y = dec.bytes(y_len)?.to_vec();
        if dec.remaining() < MAC_LENGTH {
            return Err(CoreError::parse("encrypted payload too short for MAC"));
        }
        let ciphertext = dec.bytes(dec.remaining() - MAC_LENGTH)?.to_vec();
        let mac = dec.array::<32>()?;
        dec.finish()?;
        Ok(CryptoBox {
            iv,
            curve_type,
            x,
            y,
            ciphertext,
            mac,
        })
    }
}

/// `sha512(X)` of the shared point: AES key first, MAC key second.
fn derive_keys(crypto: &dyn Cryptography, shared_point: &[u8; 65]) -> ([u8; 32], [u8; 32]) {
    let digest = crypto.sha512(&[&shared_point[1..33]]);
    let mut key_e = [0u8; 32];
    let mut key_m = [0u8; 32];
    key_e.copy_from_slice(&digest[..32]);
    key_m.copy_from_slice(&digest[32..]);
    (key_e, key_m)
}

fn pad_coordinate(coord: &[u8], out: &mut [u8]) -> CoreResult<()> {
    if coord.len() > out.len() {
        return Err(CoreError::parse("coordinate longer than 32 bytes"));
    }
    let offset = out.len() - coord.len();
    out[offset..].copy_from_slice(coord);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCryptography;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let crypto = DefaultCryptography::new();
        let private = [11u8; 32];
        let public = crypto.create_public_key(&private).unwrap();

        let boxed = CryptoBox::encrypt(&crypto, &public, b"the quick brown fox").unwrap();
        let plain = boxed.decrypt(&crypto, &private).unwrap();
        assert_eq!(plain, b"the quick brown fox");
    }

    #[test]
    fn wrong_key_is_decryption_failed() {
        let crypto = DefaultCryptography::new();
        let private = [11u8; 32];
        let public = crypto.create_public_key(&private).unwrap();

        let boxed = CryptoBox::encrypt(&crypto, &public, b"addressed elsewhere").unwrap();
        let other = [12u8; 32];
        assert!(matches!(
            boxed.decrypt(&crypto, &other),
            Err(CoreError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_the_mac() {
        let crypto = DefaultCryptography::new();
        let private = [11u8; 32];
        let public = crypto.create_public_key(&private).unwrap();

        let mut boxed = CryptoBox::encrypt(&crypto, &public, b"payload").unwrap();
        boxed.ciphertext[0] ^= 0xFF;
        assert!(matches!(
            boxed.decrypt(&crypto, &private),
            Err(CoreError::DecryptionFailed)
        ));
    }

    #[test]
    fn wire_round_trip_is_bit_exact() {
        let crypto = DefaultCryptography::new();
        let private = [11u8; 32];
        let public = crypto.create_public_key(&private).unwrap();

        let boxed = CryptoBox::encrypt(&crypto, &public, b"roundtrip").unwrap();
        let bytes = boxed.to_bytes();
        let parsed = CryptoBox::decode(&bytes).unwrap();
        assert_eq!(parsed, boxed);
        assert_eq!(parsed.to_bytes(), bytes);
        assert_eq!(parsed.decrypt(&crypto, &private).unwrap(), b"roundtrip");
    }

    #[test]
    fn short_coordinates_are_left_padded() {
        let crypto = DefaultCryptography::new();
        let private = [11u8; 32];
        let public = crypto.create_public_key(&private).unwrap();

        // Some senders strip leading zero bytes from the ephemeral
        // coordinates; keep encrypting until we hold such a key, then
        // re-author the envelope the way that sender would.
        let mut boxed = loop {
            let candidate = CryptoBox::encrypt(&crypto, &public, b"pad me").unwrap();
            if candidate.x[0] == 0 {
                break candidate;
            }
        };
        let shared = crypto
            .multiply(&boxed.ephemeral_public_key().unwrap(), &private)
            .unwrap();
        let (_, key_m) = derive_keys(&crypto, &shared);
        boxed.x.remove(0);
        boxed.mac = crypto.hmac_sha256(&key_m, &boxed.mac_input());

        let plain = boxed.decrypt(&crypto, &private).unwrap();
        assert_eq!(plain, b"pad me");
    }

    #[test]
    fn truncated_envelope_is_parse_error() {
        assert!(CryptoBox::decode(&[0u8; 20]).is_err());
    }
}
