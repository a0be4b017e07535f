//! Proof-of-work target math and verification.
//!
//! The nonce search itself lives in the `bitmessage-pow` worker crate;
//! this module owns the arithmetic both sides must agree on.

use crate::crypto::Cryptography;
use crate::error::{CoreError, CoreResult};

/// Network-wide minimum difficulty.
pub const NETWORK_NONCE_TRIALS_PER_BYTE: u64 = 1000;
pub const NETWORK_EXTRA_BYTES: u64 = 1000;

/// Bytes of the nonce field at the start of every object.
pub const NONCE_LENGTH: usize = 8;

/// Upper bound the first eight bytes of the PoW hash must not exceed.
///
/// `target = 2^64 / (ntpb * (len + eb + ttl * (len + eb) / 2^16))`
/// where `len` is the object length excluding the nonce. Intermediate
/// math runs in u128 so the 2^64 dividend is exact. Callers enforcing
/// the network floor take `max(announced, NETWORK_*)` before calling.
pub fn pow_target(payload_length: u64, ttl: u64, nonce_trials_per_byte: u64, extra_bytes: u64) -> u64 {
    let ntpb = nonce_trials_per_byte as u128;
    let eb = extra_bytes as u128;
    let len = payload_length as u128;
    let padded = len + eb;
    let denominator = ntpb * (padded + (ttl as u128 * padded) / 65536);
    let target = (1u128 << 64) / denominator.max(1);
    target.min(u64::MAX as u128) as u64
}

/// SHA-512 over everything after the nonce; the value the solver grinds
/// against.
pub fn initial_hash(crypto: &dyn Cryptography, object_bytes: &[u8]) -> CoreResult<[u8; 64]> {
    if object_bytes.len() < NONCE_LENGTH {
        return Err(CoreError::parse("object shorter than its nonce"));
    }
    Ok(crypto.sha512(&[&object_bytes[NONCE_LENGTH..]]))
}

/// The numeric PoW value of a nonce against an initial hash: the first
/// eight bytes of `sha512(sha512(nonce || initial_hash))`, big-endian.
pub fn pow_value(crypto: &dyn Cryptography, nonce: &[u8; 8], initial_hash: &[u8; 64]) -> u64 {
    let digest = crypto.double_sha512(&[nonce, initial_hash]);
    u64::from_be_bytes(digest[..8].try_into().expect("slice of 8 bytes"))
}

/// Verifies the leading nonce of a serialized object against the target
/// implied by its length and remaining time to live.
pub fn check_proof_of_work(
    crypto: &dyn Cryptography,
    object_bytes: &[u8],
    expires_time: u64,
    now: u64,
    nonce_trials_per_byte: u64,
    extra_bytes: u64,
) -> CoreResult<bool> {
    if object_bytes.len() < NONCE_LENGTH {
        return Err(CoreError::parse("object shorter than its nonce"));
    }
    let nonce: [u8; 8] = object_bytes[..NONCE_LENGTH]
        .try_into()
        .expect("checked length");
    let ttl = expires_time.saturating_sub(now);
    let target = pow_target(
        (object_bytes.len() - NONCE_LENGTH) as u64,
        ttl,
        nonce_trials_per_byte,
        extra_bytes,
    );
    let hash = initial_hash(crypto, object_bytes)?;
    Ok(pow_value(crypto, &nonce, &hash) <= target)
}
