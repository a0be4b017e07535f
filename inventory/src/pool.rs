//! The shared object pool every peer session validates against.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{debug, warn};

use bitmessage_core::object::{EXPIRY_GRACE_FUTURE, EXPIRY_GRACE_PAST};
use bitmessage_core::payload::verify_signature;
use bitmessage_core::pow::check_proof_of_work;
use bitmessage_core::repository::{InventoryRepository, StoredObject};
use bitmessage_core::{
    CoreError, CoreResult, Cryptography, InventoryVector, Object, ObjectPayload, ObjectType,
    PubkeyPayload,
};

/// Difficulty the inventory demands of incoming objects.
#[derive(Debug, Clone)]
pub struct AcceptancePolicy {
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
}

impl Default for AcceptancePolicy {
    fn default() -> Self {
        Self {
            nonce_trials_per_byte: bitmessage_core::pow::NETWORK_NONCE_TRIALS_PER_BYTE,
            extra_bytes: bitmessage_core::pow::NETWORK_EXTRA_BYTES,
        }
    }
}

/// Outcome of [`Inventory::store_object`].
#[derive(Debug)]
pub enum StoreResult {
    /// New and valid; callers should gossip it onward.
    Accepted(StoredObject),
    /// Already present (or recently pruned); silently dropped.
    Duplicate,
    /// Failed validation; must not be re-gossiped.
    Rejected(CoreError),
}

impl StoreResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StoreResult::Accepted(_))
    }
}

/// Content-addressed set of currently-valid objects.
///
/// Storage goes through the repository seam; this type owns the
/// acceptance pipeline (parse → expiry window → proof-of-work →
/// signature) and the at-most-once guarantee: a vector that was
/// stored, rejected or pruned is suppressed from re-acceptance for at
/// least its remaining lifetime.
pub struct Inventory {
    repo: Arc<dyn InventoryRepository>,
    crypto: Arc<dyn Cryptography>,
    policy: AcceptancePolicy,
    /// Vector → unix time until which re-announcements are ignored.
    suppressed: DashMap<InventoryVector, u64>,
}

impl Inventory {
    pub fn new(
        repo: Arc<dyn InventoryRepository>,
        crypto: Arc<dyn Cryptography>,
        policy: AcceptancePolicy,
    ) -> Self {
        Self {
            repo,
            crypto,
            policy,
            suppressed: DashMap::new(),
        }
    }

    pub async fn contains(&self, iv: &InventoryVector) -> bool {
        self.repo.contains(iv).await.unwrap_or(false)
    }

    pub async fn get_object(&self, iv: &InventoryVector) -> Option<Vec<u8>> {
        match self.repo.get_object(iv).await {
            Ok(found) => found.map(|o| o.bytes),
            Err(e) => {
                warn!("inventory lookup failed: {}", e);
                None
            }
        }
    }

    pub async fn get_inventory(&self, stream: u64) -> CoreResult<Vec<InventoryVector>> {
        self.repo.get_inventory(stream).await
    }

    pub async fn get_objects(
        &self,
        stream: u64,
        version: Option<u64>,
        types: &[ObjectType],
    ) -> CoreResult<Vec<InventoryVector>> {
        self.repo.find(stream, version, types).await
    }

    /// Of the vectors a peer offered, the ones worth requesting:
    /// unknown here and not under suppression.
    pub async fn missing(&self, offered: &[InventoryVector]) -> CoreResult<Vec<InventoryVector>> {
        let now = unix_now();
        let mut candidates = Vec::with_capacity(offered.len());
        for iv in offered {
            if !self.is_suppressed(iv, now) {
                candidates.push(*iv);
            }
        }
        self.repo.missing(&candidates).await
    }

    /// Validates and stores a received object.
    pub async fn store_object(&self, bytes: &[u8]) -> StoreResult {
        self.store_object_at(bytes, unix_now()).await
    }

    /// As [`store_object`](Self::store_object) with an explicit clock.
    pub async fn store_object_at(&self, bytes: &[u8], now: u64) -> StoreResult {
        let object = match Object::decode(bytes) {
            Ok(object) => object,
            Err(e) => return StoreResult::Rejected(e),
        };
        let iv = InventoryVector::of_object(self.crypto.as_ref(), bytes);

        if self.is_suppressed(&iv, now) {
            return StoreResult::Duplicate;
        }
        match self.repo.contains(&iv).await {
            Ok(true) => return StoreResult::Duplicate,
            Ok(false) => {}
            Err(e) => return StoreResult::Rejected(e),
        }

        if let Err(e) = self.validate(&object, bytes, now) {
            // Remember the vector so peers re-announcing the bad object
            // are not believed a second time.
            self.suppress(iv, now + object.object_type().max_ttl());
            return StoreResult::Rejected(e);
        }

        let stored = StoredObject {
            iv,
            stream: object.stream,
            object_type: object.object_type(),
            version: object.version,
            expires_time: object.expires_time,
            bytes: bytes.to_vec(),
        };
        if let Err(e) = self.repo.store(stored.clone()).await {
            return StoreResult::Rejected(e);
        }
        debug!(%iv, kind = ?object.object_type(), "object accepted");
        StoreResult::Accepted(stored)
    }

    /// Expiry window, proof-of-work and (where visible) signature.
    fn validate(&self, object: &Object, bytes: &[u8], now: u64) -> CoreResult<()> {
        if object.expires_time + EXPIRY_GRACE_PAST < now {
            return Err(CoreError::ProtocolViolation("object already expired".into()));
        }
        let horizon = now + object.object_type().max_ttl() + EXPIRY_GRACE_FUTURE;
        if object.expires_time > horizon {
            return Err(CoreError::ProtocolViolation(
                "expiry too far in the future".into(),
            ));
        }

        let ok = check_proof_of_work(
            self.crypto.as_ref(),
            bytes,
            object.expires_time,
            now,
            self.policy.nonce_trials_per_byte,
            self.policy.extra_bytes,
        )?;
        if !ok {
            return Err(CoreError::PowInvalid);
        }

        // v2 pubkeys carry no signature and encrypted payloads carry
        // theirs inside the ciphertext; only cleartext v3 pubkeys are
        // checkable here.
        if let ObjectPayload::Pubkey(PubkeyPayload::Plain(pubkey)) = &object.payload {
            if pubkey.version >= 3 {
                verify_signature(
                    self.crypto.as_ref(),
                    &pubkey.public_signing_key,
                    &object.signed_header(),
                    &pubkey.signed_fields(),
                    &pubkey.signature,
                )?;
            }
        }
        Ok(())
    }

    /// Drops expired objects, keeps suppressing their vectors, and
    /// returns how many were removed.
    pub async fn cleanup(&self) -> CoreResult<usize> {
        self.cleanup_at(unix_now()).await
    }

    pub async fn cleanup_at(&self, now: u64) -> CoreResult<usize> {
        let removed = self.repo.remove_expired(now).await?;
        for object in &removed {
            self.suppress(object.iv, now + object.object_type.max_ttl());
        }
        self.suppressed.retain(|_, until| *until > now);
        if !removed.is_empty() {
            debug!(count = removed.len(), "pruned expired objects");
        }
        Ok(removed.len())
    }

    fn is_suppressed(&self, iv: &InventoryVector, now: u64) -> bool {
        self.suppressed
            .get(iv)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    fn suppress(&self, iv: InventoryVector, until: u64) {
        self.suppressed.insert(iv, until);
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
