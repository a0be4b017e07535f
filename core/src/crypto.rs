//! The cryptography capability consumed by the rest of the core.
//!
//! Constructors take an `Arc<dyn Cryptography>` explicitly; nothing in
//! the workspace reaches for process-global state. [`DefaultCryptography`]
//! is the production implementation; tests may substitute their own.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{CoreError, CoreResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<sha2::Sha256>;

/// Length of an uncompressed secp256k1 public key, 0x04 prefix included.
pub const PUBLIC_KEY_LEN: usize = 65;

/// Hashes, randomness, secp256k1 operations and AES-256-CBC, behind one
/// seam so the protocol code never names an algorithm crate directly.
pub trait Cryptography: Send + Sync {
    /// SHA-512 over the concatenation of `chunks`.
    fn sha512(&self, chunks: &[&[u8]]) -> [u8; 64];

    /// SHA-512 applied twice.
    fn double_sha512(&self, chunks: &[&[u8]]) -> [u8; 64] {
        let first = self.sha512(chunks);
        self.sha512(&[&first])
    }

    fn ripemd160(&self, data: &[u8]) -> [u8; 20];

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> [u8; 32];

    fn random_bytes(&self, n: usize) -> Vec<u8>;

    fn random_nonce(&self) -> u64;

    /// Uncompressed secp256k1 public key (65 bytes, leading 0x04) for a
    /// 32-byte private key.
    fn create_public_key(&self, private_key: &[u8; 32]) -> CoreResult<[u8; 65]>;

    /// DER-encoded ECDSA signature over SHA-256(data).
    fn sign(&self, private_key: &[u8; 32], data: &[u8]) -> CoreResult<Vec<u8>>;

    /// Signature check; malformed keys or signatures verify as false.
    fn verify(&self, public_key: &[u8], signature: &[u8], data: &[u8]) -> bool;

    /// EC point multiplication: `public_key * private_key`, returned as
    /// an uncompressed point. The ECDH primitive of the encryption
    /// envelope.
    fn multiply(&self, public_key: &[u8], private_key: &[u8; 32]) -> CoreResult<[u8; 65]>;

    fn aes256_cbc_encrypt(&self, key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8>;

    fn aes256_cbc_decrypt(
        &self,
        key: &[u8; 32],
        iv: &[u8; 16],
        ciphertext: &[u8],
    ) -> CoreResult<Vec<u8>>;
}

/// Accepts a 64-byte raw public key and restores the 0x04 prefix; keys
/// arrive in both forms on the wire.
pub fn normalize_public_key(key: &[u8]) -> CoreResult<[u8; 65]> {
    match key.len() {
        65 if key[0] == 0x04 => {
            let mut out = [0u8; 65];
            out.copy_from_slice(key);
            Ok(out)
        }
        64 => {
            let mut out = [0u8; 65];
            out[0] = 0x04;
            out[1..].copy_from_slice(key);
            Ok(out)
        }
        n => Err(CoreError::parse(format!("public key of {} bytes", n))),
    }
}

/// Production implementation backed by sha2/ripemd/hmac/aes/secp256k1.
pub struct DefaultCryptography {
    secp: Secp256k1<secp256k1::All>,
}

impl DefaultCryptography {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }
}

impl Default for DefaultCryptography {
    fn default() -> Self {
        Self::new()
    }
}

impl Cryptography for DefaultCryptography {
    fn sha512(&self, chunks: &[&[u8]]) -> [u8; 64] {
        let mut hasher = Sha512::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    fn ripemd160(&self, data: &[u8]) -> [u8; 20] {
        Ripemd160::digest(data).into()
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> [u8; 32] {
        let mut mac =
            HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    fn random_bytes(&self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        rand::thread_rng().fill_bytes(&mut out);
        out
    }

    fn random_nonce(&self) -> u64 {
        rand::random()
    }

    fn create_public_key(&self, private_key: &[u8; 32]) -> CoreResult<[u8; 65]> {
        let secret = SecretKey::from_slice(private_key)
            .map_err(|e| CoreError::parse(format!("invalid private key: {}", e)))?;
        Ok(PublicKey::from_secret_key(&self.secp, &secret).serialize_uncompressed())
    }

    fn sign(&self, private_key: &[u8; 32], data: &[u8]) -> CoreResult<Vec<u8>> {
        let secret = SecretKey::from_slice(private_key)
            .map_err(|e| CoreError::parse(format!("invalid private key: {}", e)))?;
        let digest: [u8; 32] = Sha256::digest(data).into();
        let message = Message::from_digest(digest);
        let signature = self.secp.sign_ecdsa(&message, &secret);
        Ok(signature.serialize_der().to_vec())
    }

    fn verify(&self, public_key: &[u8], signature: &[u8], data: &[u8]) -> bool {
        let Ok(key) = normalize_public_key(public_key) else {
            return false;
        };
        let Ok(key) = PublicKey::from_slice(&key) else {
            return false;
        };
        let Ok(signature) = Signature::from_der(signature) else {
            return false;
        };
        let digest: [u8; 32] = Sha256::digest(data).into();
        let message = Message::from_digest(digest);
        self.secp.verify_ecdsa(&message, &signature, &key).is_ok()
    }

    fn multiply(&self, public_key: &[u8], private_key: &[u8; 32]) -> CoreResult<[u8; 65]> {
        let key = normalize_public_key(public_key)?;
        let point = PublicKey::from_slice(&key)
            .map_err(|e| CoreError::parse(format!("invalid public key: {}", e)))?;
        let scalar = Scalar::from_be_bytes(*private_key)
            .map_err(|_| CoreError::parse("private key out of curve order"))?;
        let product = point
            .mul_tweak(&self.secp, &scalar)
            .map_err(|_| CoreError::DecryptionFailed)?;
        Ok(product.serialize_uncompressed())
    }

    fn aes256_cbc_encrypt(&self, key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    fn aes256_cbc_decrypt(
        &self,
        key: &[u8; 32],
        iv: &[u8; 16],
        ciphertext: &[u8],
    ) -> CoreResult<Vec<u8>> {
        Aes256CbcDec::new(key.into(), iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CoreError::DecryptionFailed)
    }
}
