//! The message pipeline: encrypt outgoing, trial-decrypt incoming,
//! generate and correlate acknowledgements, schedule retransmissions.
//!
//! All state transitions of a [`Plaintext`] happen here, on one task;
//! peer sessions only ever hand objects over a channel.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use bitmessage_core::payload::{signing_input, verify_signature};
use bitmessage_core::pow::pow_target;
use bitmessage_core::repository::{
    AddressEntry, AddressRepository, MessageRepository, PowItem, PowPurpose,
    ProofOfWorkRepository, StoredObject,
};
use bitmessage_core::{
    BitmessageAddress, BroadcastData, BroadcastPayload, CoreError, CoreResult, CryptoBox,
    Cryptography, Feature, GetPubkey, Label, LabelKind, MessageEncoding, MessageStatus, MsgData,
    Object, ObjectPayload, ObjectType, Plaintext, PlaintextType, Pubkey, PubkeyPayload,
};
use bitmessage_core::plaintext::MAX_RETRIES;
use bitmessage_inventory::AcceptancePolicy;
use bitmessage_network::NetworkAgent;
use bitmessage_pow::{PowJob, PowService, PowSolution};

/// How long a getpubkey request stays in the network.
const GETPUBKEY_TTL: u64 = 2 * 24 * 3600;
/// How long a published pubkey stays valid.
const PUBKEY_TTL: u64 = 28 * 24 * 3600;
/// First retry interval while waiting for a pubkey; doubles up to the
/// pubkey lifetime.
const PUBKEY_REQUEST_INTERVAL: u64 = 2 * 24 * 3600;
/// Object version of person-to-person messages.
const MSG_VERSION: u64 = 1;

pub struct MessagePipeline {
    crypto: Arc<dyn Cryptography>,
    agent: Arc<NetworkAgent>,
    messages: Arc<dyn MessageRepository>,
    addresses: Arc<dyn AddressRepository>,
    pow_items: Arc<dyn ProofOfWorkRepository>,
    pow: PowService,
    policy: AcceptancePolicy,
}

impl MessagePipeline {
    pub fn new(
        crypto: Arc<dyn Cryptography>,
        agent: Arc<NetworkAgent>,
        messages: Arc<dyn MessageRepository>,
        addresses: Arc<dyn AddressRepository>,
        pow_items: Arc<dyn ProofOfWorkRepository>,
        pow: PowService,
        policy: AcceptancePolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            crypto,
            agent,
            messages,
            addresses,
            pow_items,
            pow,
            policy,
        })
    }

    /// Drives the pipeline: accepted objects in, solved nonces in, and
    /// a periodic retransmission sweep.
    pub fn run(
        self: Arc<Self>,
        mut accepted_rx: mpsc::Receiver<StoredObject>,
        mut solutions_rx: mpsc::UnboundedReceiver<PowSolution>,
        retry_interval: Duration,
    ) {
        tokio::spawn(async move {
            let mut tick = interval(retry_interval);
            tick.reset();
            loop {
                tokio::select! {
                    Some(stored) = accepted_rx.recv() => {
                        if let Err(e) = self.handle_object(&stored).await {
                            warn!(iv = %stored.iv, "object handling failed: {}", e);
                        }
                    }
                    Some(solution) = solutions_rx.recv() => {
                        if let Err(e) = self.handle_solution(&solution).await {
                            warn!("solution handling failed: {}", e);
                        }
                    }
                    _ = tick.tick() => {
                        if let Err(e) = self.process_retries_at(unix_now()).await {
                            warn!("retry sweep failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Requeues jobs that were pending when the node last stopped.
    pub async fn resume_pending_pow(&self) -> CoreResult<()> {
        for item in self.pow_items.pending().await? {
            debug!("resuming queued proof of work");
            self.pow.enqueue(PowJob {
                initial_hash: item.initial_hash,
                target: item.target,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Accepts a composed message and walks it as far as currently
    /// possible: straight to PoW when the recipient's pubkey is known,
    /// or into PUBKEY_REQUESTED otherwise.
    pub async fn send(&self, mut message: Plaintext) -> CoreResult<()> {
        let now = unix_now();
        self.messages.save(&mut message).await?;

        match message.kind {
            PlaintextType::Broadcast => self.send_broadcast(message, now).await,
            PlaintextType::Msg => {
                let recipient = message.to.clone().ok_or_else(|| {
                    CoreError::FatalConfig("msg without a recipient".into())
                })?;
                match self.known_pubkey(&recipient).await? {
                    Some(pubkey) => self.begin_send(message, &pubkey, now).await,
                    None => self.request_pubkey(message, &recipient, now).await,
                }
            }
        }
    }

    /// Deletes an outbound message, cancelling any nonce search still
    /// queued or running for it.
    pub async fn delete_message(&self, id: u64) -> CoreResult<()> {
        for item in self.pow_items.pending().await? {
            let references = match &item.purpose {
                PowPurpose::Message { message_id }
                | PowPurpose::Acknowledgement { message_id }
                | PowPurpose::Broadcast { message_id } => *message_id == id,
                _ => false,
            };
            if references {
                self.pow.cancel(item.initial_hash);
                self.pow_items.remove(&item.initial_hash).await?;
            }
        }
        self.messages.remove(id).await
    }

    async fn known_pubkey(&self, address: &BitmessageAddress) -> CoreResult<Option<Pubkey>> {
        Ok(self
            .addresses
            .get(address)
            .await?
            .and_then(|entry| entry.pubkey))
    }

    /// Emits a getpubkey object and parks the message until the answer
    /// arrives.
    async fn request_pubkey(
        &self,
        mut message: Plaintext,
        recipient: &BitmessageAddress,
        now: u64,
    ) -> CoreResult<()> {
        message.status = MessageStatus::PubkeyRequested;
        message.next_try = Some(now + PUBKEY_REQUEST_INTERVAL);
        self.messages.save(&mut message).await?;

        if self.addresses.get(recipient).await?.is_none() {
            self.addresses
                .save(AddressEntry::contact(recipient.clone()))
                .await?;
        }

        let payload = if recipient.version >= 4 {
            GetPubkey::Tag(recipient.tag(self.crypto.as_ref()))
        } else {
            GetPubkey::Ripe(recipient.ripe)
        };
        let object = Object {
            nonce: [0; 8],
            expires_time: now + GETPUBKEY_TTL,
            version: recipient.version,
            stream: recipient.stream,
            payload: ObjectPayload::GetPubkey(payload),
        };
        info!(recipient = %recipient.encode(self.crypto.as_ref()), "requesting pubkey");
        self.queue_pow(
            &object,
            PowPurpose::PubkeyRequest {
                recipient: recipient.clone(),
            },
            now,
        )
        .await
    }

    /// Starts the actual transmission: an acknowledgement object is
    /// ground first when the recipient answers acks, then the message
    /// itself.
    async fn begin_send(
        &self,
        mut message: Plaintext,
        recipient_pubkey: &Pubkey,
        now: u64,
    ) -> CoreResult<()> {
        message.status = MessageStatus::DoingProofOfWork;

        if message.kind == PlaintextType::Msg && recipient_pubkey.does_ack() {
            if message.ack_data.is_empty() {
                message.ack_data = self.crypto.random_bytes(32);
            }
            let message_id = self.save_returning_id(&mut message).await?;

            // The embedded ack is a complete msg object the recipient
            // will inject back into the flood; its payload is what we
            // later match incoming objects against.
            let ack_object = Object {
                nonce: [0; 8],
                expires_time: now + message.ttl,
                version: MSG_VERSION,
                stream: message.from.stream,
                payload: ObjectPayload::Msg {
                    encrypted: message.ack_data.clone(),
                },
            };
            self.queue_pow(&ack_object, PowPurpose::Acknowledgement { message_id }, now)
                .await
        } else {
            self.messages.save(&mut message).await?;
            self.encrypt_and_queue(message, recipient_pubkey, Vec::new(), now)
                .await
        }
    }

    /// Builds, signs and encrypts the msg object, then queues its PoW.
    async fn encrypt_and_queue(
        &self,
        mut message: Plaintext,
        recipient_pubkey: &Pubkey,
        ack_bytes: Vec<u8>,
        now: u64,
    ) -> CoreResult<()> {
        let identity = self.identity(&message.from).await?;
        let recipient = message.to.clone().ok_or_else(|| {
            CoreError::FatalConfig("msg without a recipient".into())
        })?;

        let mut data = MsgData {
            msg_version: MSG_VERSION,
            address_version: identity.pubkey.version,
            stream: identity.pubkey.stream,
            behavior_bitfield: identity.pubkey.behavior_bitfield,
            public_signing_key: identity.pubkey.public_signing_key,
            public_encryption_key: identity.pubkey.public_encryption_key,
            nonce_trials_per_byte: identity.pubkey.nonce_trials_per_byte,
            extra_bytes: identity.pubkey.extra_bytes,
            destination_ripe: recipient.ripe,
            encoding: message.encoding.as_u64(),
            message: message.message.clone(),
            ack: ack_bytes,
            signature: Vec::new(),
        };

        let mut object = Object {
            nonce: [0; 8],
            expires_time: now + message.ttl,
            version: MSG_VERSION,
            stream: recipient.stream,
            payload: ObjectPayload::Msg {
                encrypted: Vec::new(),
            },
        };
        data.signature = identity.sign(
            self.crypto.as_ref(),
            &signing_input(&object.signed_header(), &data.signed_fields()),
        )?;
        message.signature = Some(data.signature.clone());

        let boxed = CryptoBox::encrypt(
            self.crypto.as_ref(),
            &recipient_pubkey.public_encryption_key,
            &data.encode(),
        )?;
        object.payload = ObjectPayload::Msg {
            encrypted: boxed.to_bytes(),
        };

        message.status = MessageStatus::DoingProofOfWork;
        let message_id = self.save_returning_id(&mut message).await?;

        let initial = self
            .queue_pow_with_difficulty(
                &object,
                PowPurpose::Message { message_id },
                now,
                recipient_pubkey.nonce_trials_per_byte,
                recipient_pubkey.extra_bytes,
            )
            .await?;
        message.initial_hash = Some(initial.to_vec());
        self.messages.save(&mut message).await
    }

    /// Builds and queues a broadcast readable by anyone who knows the
    /// sender's address.
    async fn send_broadcast(&self, mut message: Plaintext, now: u64) -> CoreResult<()> {
        let identity = self.identity(&message.from).await?;
        let address = message.from.clone();

        let mut data = BroadcastData {
            address_version: identity.pubkey.version,
            stream: identity.pubkey.stream,
            behavior_bitfield: identity.pubkey.behavior_bitfield,
            public_signing_key: identity.pubkey.public_signing_key,
            public_encryption_key: identity.pubkey.public_encryption_key,
            nonce_trials_per_byte: identity.pubkey.nonce_trials_per_byte,
            extra_bytes: identity.pubkey.extra_bytes,
            encoding: message.encoding.as_u64(),
            message: message.message.clone(),
            signature: Vec::new(),
        };

        let version = if address.version >= 4 { 5 } else { 4 };
        let mut object = Object {
            nonce: [0; 8],
            expires_time: now + message.ttl,
            version,
            stream: address.stream,
            payload: ObjectPayload::Broadcast(BroadcastPayload::Plain {
                encrypted: Vec::new(),
            }),
        };
        data.signature = identity.sign(
            self.crypto.as_ref(),
            &signing_input(&object.signed_header(), &data.signed_fields()),
        )?;
        message.signature = Some(data.signature.clone());

        let (_, broadcast_public) = address.broadcast_keys(self.crypto.as_ref())?;
        let boxed = CryptoBox::encrypt(self.crypto.as_ref(), &broadcast_public, &data.encode())?;
        object.payload = if version == 5 {
            ObjectPayload::Broadcast(BroadcastPayload::Tagged {
                tag: address.tag(self.crypto.as_ref()),
                encrypted: boxed.to_bytes(),
            })
        } else {
            ObjectPayload::Broadcast(BroadcastPayload::Plain {
                encrypted: boxed.to_bytes(),
            })
        };

        message.status = MessageStatus::DoingProofOfWork;
        let message_id = self.save_returning_id(&mut message).await?;
        self.queue_pow(&object, PowPurpose::Broadcast { message_id }, now)
            .await
    }

    async fn queue_pow(
        &self,
        object: &Object,
        purpose: PowPurpose,
        now: u64,
    ) -> CoreResult<()> {
        self.queue_pow_with_difficulty(object, purpose, now, 0, 0)
            .await?;
        Ok(())
    }

    /// Computes the target, persists the queue item and hands the job
    /// to the engine. Returns the initial hash for correlation.
    async fn queue_pow_with_difficulty(
        &self,
        object: &Object,
        purpose: PowPurpose,
        now: u64,
        announced_ntpb: u64,
        announced_eb: u64,
    ) -> CoreResult<[u8; 64]> {
        let mut after_nonce = Vec::new();
        object.encode_after_nonce(&mut after_nonce);

        let ntpb = announced_ntpb.max(self.policy.nonce_trials_per_byte);
        let eb = announced_eb.max(self.policy.extra_bytes);
        let ttl = object.expires_time.saturating_sub(now);
        let target = pow_target(after_nonce.len() as u64, ttl, ntpb, eb);
        let initial = self.crypto.sha512(&[&after_nonce]);

        self.pow_items
            .enqueue(PowItem {
                initial_hash: initial,
                target,
                object_after_nonce: after_nonce,
                purpose,
            })
            .await?;
        self.pow.enqueue(PowJob {
            initial_hash: initial,
            target,
        });
        Ok(initial)
    }

    /// A nonce came back: reassemble the object and act on its purpose.
    pub async fn handle_solution(&self, solution: &PowSolution) -> CoreResult<()> {
        let Some(item) = self.pow_items.get(&solution.initial_hash).await? else {
            debug!("solution for an unknown (cancelled?) job");
            return Ok(());
        };
        let mut bytes = Vec::with_capacity(8 + item.object_after_nonce.len());
        bytes.extend_from_slice(&solution.nonce);
        bytes.extend_from_slice(&item.object_after_nonce);
        let now = unix_now();

        match &item.purpose {
            PowPurpose::Message { message_id } => {
                let iv = self.agent.broadcast_object(&bytes).await?;
                if let Some(mut message) = self.messages.get(*message_id).await? {
                    message.status = MessageStatus::Sent;
                    message.sent = Some(now);
                    message.iv = Some(iv);
                    message.next_try = Some(if message.retries == 0 {
                        now + message.ttl / 2
                    } else {
                        now + message.ttl * (1u64 << message.retries.min(31))
                    });
                    self.messages.save(&mut message).await?;
                    info!(iv = %iv, "message sent");
                }
            }
            PowPurpose::Acknowledgement { message_id } => {
                // The ack is not broadcast by us; it rides inside the
                // message and the recipient releases it.
                if let Some(message) = self.messages.get(*message_id).await? {
                    let recipient = message.to.clone().ok_or_else(|| {
                        CoreError::FatalConfig("msg without a recipient".into())
                    })?;
                    let Some(pubkey) = self.known_pubkey(&recipient).await? else {
                        warn!("pubkey vanished while grinding the ack");
                        return Ok(());
                    };
                    self.encrypt_and_queue(message, &pubkey, bytes, now).await?;
                }
            }
            PowPurpose::Broadcast { message_id } => {
                let iv = self.agent.broadcast_object(&bytes).await?;
                if let Some(mut message) = self.messages.get(*message_id).await? {
                    message.status = MessageStatus::Sent;
                    message.sent = Some(now);
                    message.iv = Some(iv);
                    message.next_try = None; // broadcasts are fire-and-forget
                    self.messages.save(&mut message).await?;
                    info!(iv = %iv, "broadcast sent");
                }
            }
            PowPurpose::PubkeyAnnouncement { address } => {
                let iv = self.agent.broadcast_object(&bytes).await?;
                info!(iv = %iv, address = %address.encode(self.crypto.as_ref()), "pubkey published");
            }
            PowPurpose::PubkeyRequest { recipient } => {
                let iv = self.agent.broadcast_object(&bytes).await?;
                debug!(iv = %iv, recipient = %recipient.encode(self.crypto.as_ref()), "getpubkey sent");
            }
        }
        self.pow_items.remove(&solution.initial_hash).await
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Dispatches an object the inventory just accepted.
    pub async fn handle_object(&self, stored: &StoredObject) -> CoreResult<()> {
        match stored.object_type {
            ObjectType::Msg => self.handle_msg(stored).await,
            ObjectType::Pubkey => self.handle_pubkey(stored).await,
            ObjectType::GetPubkey => self.handle_getpubkey(stored).await,
            ObjectType::Broadcast => self.handle_broadcast(stored).await,
        }
    }

    async fn handle_msg(&self, stored: &StoredObject) -> CoreResult<()> {
        let object = Object::decode(&stored.bytes)?;
        let ObjectPayload::Msg { encrypted } = &object.payload else {
            return Ok(());
        };

        // Acknowledgement correlation first: the payload of an ack
        // object is exactly the ack data we embedded when sending.
        if let Some(mut sent) = self.messages.find_by_ack_data(encrypted).await? {
            if sent.status == MessageStatus::Sent {
                sent.status = MessageStatus::SentAcknowledged;
                sent.next_try = None;
                self.messages.save(&mut sent).await?;
                info!(id = ?sent.id, "message acknowledged");
            }
            return Ok(());
        }

        // Trial decryption against every local identity.
        for entry in self.addresses.identities().await? {
            let Some(key) = &entry.private_key else { continue };
            let Ok(boxed) = CryptoBox::decode(encrypted) else {
                // Opaque payload that is not an encryption envelope
                // (e.g. somebody's ack); nothing to decrypt.
                return Ok(());
            };
            let Ok(plain) = boxed.decrypt(self.crypto.as_ref(), &key.private_encryption_key)
            else {
                continue;
            };
            let data = MsgData::decode(&plain)?;
            if data.destination_ripe != entry.address.ripe {
                warn!("decryptable msg addressed to a different ripe");
                continue;
            }
            verify_signature(
                self.crypto.as_ref(),
                &data.public_signing_key,
                &object.signed_header(),
                &data.signed_fields(),
                &data.signature,
            )?;
            self.deliver_msg(stored, &object, &entry, &data).await?;
            return Ok(());
        }
        // Not addressed to us; the normal case in a flood network.
        Ok(())
    }

    async fn deliver_msg(
        &self,
        stored: &StoredObject,
        object: &Object,
        identity: &AddressEntry,
        data: &MsgData,
    ) -> CoreResult<()> {
        let now = unix_now();
        let sender_pubkey = data.sender_pubkey();
        let sender = sender_pubkey.address(self.crypto.as_ref());
        // Knowing the sender's pubkey lets the user reply without a
        // getpubkey round-trip.
        self.addresses
            .attach_pubkey(&sender, sender_pubkey.clone())
            .await?;

        let mut received = Plaintext {
            id: None,
            kind: PlaintextType::Msg,
            from: sender.clone(),
            to: Some(identity.address.clone()),
            encoding: MessageEncoding::from_u64(data.encoding)
                .unwrap_or(MessageEncoding::Trivial),
            message: data.message.clone(),
            ack_data: Vec::new(),
            iv: Some(stored.iv),
            initial_hash: None,
            status: MessageStatus::Received,
            sent: None,
            received: Some(now),
            ttl: object.expires_time.saturating_sub(now),
            retries: 0,
            next_try: None,
            labels: vec![
                self.ensure_label(LabelKind::Inbox, "inbox").await?,
                self.ensure_label(LabelKind::Unread, "unread").await?,
            ],
            signature: Some(data.signature.clone()),
        };
        self.messages.save(&mut received).await?;
        info!(from = %sender.encode(self.crypto.as_ref()), "message received");

        // Release the sender's acknowledgement back into the flood,
        // provided it really is a well-formed object and this identity
        // answers acks at all.
        let we_ack = identity
            .pubkey
            .as_ref()
            .map(|p| Feature::DoesAck.is_active(p.behavior_bitfield))
            .unwrap_or(true);
        let wants_ack = !data.ack.is_empty() && we_ack;
        if wants_ack {
            match Object::decode(&data.ack) {
                Ok(_) => match self.agent.broadcast_object(&data.ack).await {
                    Ok(iv) => debug!(iv = %iv, "acknowledgement injected"),
                    Err(CoreError::Duplicate) => {}
                    Err(e) => warn!("acknowledgement rejected: {}", e),
                },
                Err(e) => debug!("embedded ack is not an object: {}", e),
            }
        }
        Ok(())
    }

    async fn handle_pubkey(&self, stored: &StoredObject) -> CoreResult<()> {
        let object = Object::decode(&stored.bytes)?;
        let ObjectPayload::Pubkey(payload) = &object.payload else {
            return Ok(());
        };

        let waiting = self
            .messages
            .find_by_status(MessageStatus::PubkeyRequested, None)
            .await?;
        for mut message in waiting {
            let Some(recipient) = message.to.clone() else { continue };
            let Some(pubkey) = self.match_pubkey(&object, payload, &recipient)? else {
                continue;
            };
            info!(recipient = %recipient.encode(self.crypto.as_ref()), "pubkey arrived");
            self.addresses
                .attach_pubkey(&recipient, pubkey.clone())
                .await?;

            message.retries = 0;
            message.next_try = None;
            let now = unix_now();
            self.begin_send(message, &pubkey, now).await?;
        }
        Ok(())
    }

    /// Checks whether a pubkey object answers a given address, either
    /// in cleartext (v2/v3, already signature-checked on acceptance)
    /// or after decrypting the v4 envelope.
    fn match_pubkey(
        &self,
        object: &Object,
        payload: &PubkeyPayload,
        recipient: &BitmessageAddress,
    ) -> CoreResult<Option<Pubkey>> {
        match payload {
            PubkeyPayload::Plain(pubkey) => {
                if object.version != recipient.version {
                    return Ok(None);
                }
                if pubkey.ripe(self.crypto.as_ref()) != recipient.ripe {
                    return Ok(None);
                }
                Ok(Some(pubkey.clone()))
            }
            PubkeyPayload::Encrypted { tag, encrypted } => {
                if recipient.version < 4 || *tag != recipient.tag(self.crypto.as_ref()) {
                    return Ok(None);
                }
                let key = recipient.derive_decryption_key(self.crypto.as_ref());
                let plain = CryptoBox::decode(encrypted)?.decrypt(self.crypto.as_ref(), &key)?;
                let mut dec = bitmessage_core::codec::Decoder::new(&plain);
                let pubkey = Pubkey::decode(object.version, object.stream, &mut dec)?;
                dec.finish()?;
                verify_signature(
                    self.crypto.as_ref(),
                    &pubkey.public_signing_key,
                    &object.signed_header(),
                    &pubkey.signed_fields(),
                    &pubkey.signature,
                )?;
                if pubkey.ripe(self.crypto.as_ref()) != recipient.ripe {
                    return Err(CoreError::SignatureInvalid);
                }
                Ok(Some(pubkey))
            }
        }
    }

    /// Answers getpubkey requests that target one of our identities.
    async fn handle_getpubkey(&self, stored: &StoredObject) -> CoreResult<()> {
        let object = Object::decode(&stored.bytes)?;
        let ObjectPayload::GetPubkey(request) = &object.payload else {
            return Ok(());
        };

        for entry in self.addresses.identities().await? {
            let matches = match request {
                GetPubkey::Ripe(ripe) => {
                    object.version == entry.address.version && *ripe == entry.address.ripe
                }
                GetPubkey::Tag(tag) => {
                    entry.address.version >= 4 && *tag == entry.address.tag(self.crypto.as_ref())
                }
            };
            if matches {
                self.publish_pubkey(&entry).await?;
            }
        }
        Ok(())
    }

    /// Signs and queues a pubkey object for one of our identities.
    pub async fn publish_pubkey(&self, entry: &AddressEntry) -> CoreResult<()> {
        let identity = entry
            .private_key
            .clone()
            .ok_or_else(|| CoreError::FatalConfig("cannot publish a contact".into()))?;
        let address = &entry.address;
        let now = unix_now();

        let mut pubkey = identity.pubkey.clone();
        let mut object = Object {
            nonce: [0; 8],
            expires_time: now + PUBKEY_TTL,
            version: address.version,
            stream: address.stream,
            payload: ObjectPayload::Pubkey(PubkeyPayload::Plain(pubkey.clone())),
        };
        if pubkey.version >= 3 {
            pubkey.signature = identity.sign(
                self.crypto.as_ref(),
                &signing_input(&object.signed_header(), &pubkey.signed_fields()),
            )?;
        }

        object.payload = if address.version >= 4 {
            let mut body = Vec::new();
            pubkey.encode(&mut body);
            let (_, derived_public) = address.broadcast_keys(self.crypto.as_ref())?;
            let boxed = CryptoBox::encrypt(self.crypto.as_ref(), &derived_public, &body)?;
            ObjectPayload::Pubkey(PubkeyPayload::Encrypted {
                tag: address.tag(self.crypto.as_ref()),
                encrypted: boxed.to_bytes(),
            })
        } else {
            ObjectPayload::Pubkey(PubkeyPayload::Plain(pubkey))
        };

        self.queue_pow(
            &object,
            PowPurpose::PubkeyAnnouncement {
                address: address.clone(),
            },
            now,
        )
        .await
    }

    async fn handle_broadcast(&self, stored: &StoredObject) -> CoreResult<()> {
        let object = Object::decode(&stored.bytes)?;
        let ObjectPayload::Broadcast(payload) = &object.payload else {
            return Ok(());
        };

        for subscription in self.addresses.subscriptions().await? {
            let address = &subscription.address;
            let encrypted = match payload {
                BroadcastPayload::Tagged { tag, encrypted } => {
                    if address.version < 4 || *tag != address.tag(self.crypto.as_ref()) {
                        continue;
                    }
                    encrypted
                }
                BroadcastPayload::Plain { encrypted } => {
                    if address.version >= 4 {
                        continue;
                    }
                    encrypted
                }
            };
            let (broadcast_private, _) = address.broadcast_keys(self.crypto.as_ref())?;
            let Ok(boxed) = CryptoBox::decode(encrypted) else { continue };
            let Ok(plain) = boxed.decrypt(self.crypto.as_ref(), &broadcast_private) else {
                continue;
            };
            let data = BroadcastData::decode(&plain)?;
            let sender_pubkey = data.sender_pubkey();
            if sender_pubkey.ripe(self.crypto.as_ref()) != address.ripe {
                warn!("broadcast key mismatch; impersonation attempt?");
                continue;
            }
            verify_signature(
                self.crypto.as_ref(),
                &data.public_signing_key,
                &object.signed_header(),
                &data.signed_fields(),
                &data.signature,
            )?;

            let now = unix_now();
            let mut received = Plaintext {
                id: None,
                kind: PlaintextType::Broadcast,
                from: address.clone(),
                to: None,
                encoding: MessageEncoding::from_u64(data.encoding)
                    .unwrap_or(MessageEncoding::Trivial),
                message: data.message.clone(),
                ack_data: Vec::new(),
                iv: Some(stored.iv),
                initial_hash: None,
                status: MessageStatus::Received,
                sent: None,
                received: Some(now),
                ttl: object.expires_time.saturating_sub(now),
                retries: 0,
                next_try: None,
                labels: vec![
                    self.ensure_label(LabelKind::Broadcast, "broadcasts").await?,
                    self.ensure_label(LabelKind::Unread, "unread").await?,
                ],
                signature: Some(data.signature.clone()),
            };
            self.messages.save(&mut received).await?;
            info!(from = %address.encode(self.crypto.as_ref()), "broadcast received");
            return Ok(());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retransmission
    // ------------------------------------------------------------------

    /// One sweep of the retry scheduler: unacknowledged messages past
    /// their timer are rebuilt, pending pubkey requests re-emitted.
    pub async fn process_retries_at(&self, now: u64) -> CoreResult<()> {
        for mut message in self.messages.find_to_resend(now).await? {
            if message.retries >= MAX_RETRIES {
                // Give up silently; the message stays SENT.
                message.next_try = None;
                self.messages.save(&mut message).await?;
                continue;
            }
            let Some(recipient) = message.to.clone() else { continue };
            let Some(pubkey) = self.known_pubkey(&recipient).await? else {
                continue;
            };
            message.retries += 1;
            info!(id = ?message.id, retry = message.retries, "resending unacknowledged message");
            self.begin_send(message, &pubkey, now).await?;
        }

        for mut message in self
            .messages
            .find_by_status(MessageStatus::PubkeyRequested, None)
            .await?
        {
            if message.next_try.map(|t| t >= now).unwrap_or(true) {
                continue;
            }
            let Some(recipient) = message.to.clone() else { continue };
            message.retries += 1;
            let backoff = (PUBKEY_REQUEST_INTERVAL << message.retries.min(4)).min(PUBKEY_TTL);
            message.next_try = Some(now + backoff);
            self.messages.save(&mut message).await?;
            self.request_pubkey_again(&recipient, now).await?;
        }
        Ok(())
    }

    /// Re-emits a getpubkey without touching message state.
    async fn request_pubkey_again(
        &self,
        recipient: &BitmessageAddress,
        now: u64,
    ) -> CoreResult<()> {
        let payload = if recipient.version >= 4 {
            GetPubkey::Tag(recipient.tag(self.crypto.as_ref()))
        } else {
            GetPubkey::Ripe(recipient.ripe)
        };
        let object = Object {
            nonce: [0; 8],
            expires_time: now + GETPUBKEY_TTL,
            version: recipient.version,
            stream: recipient.stream,
            payload: ObjectPayload::GetPubkey(payload),
        };
        self.queue_pow(
            &object,
            PowPurpose::PubkeyRequest {
                recipient: recipient.clone(),
            },
            now,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn identity(
        &self,
        address: &BitmessageAddress,
    ) -> CoreResult<bitmessage_core::PrivateKey> {
        self.addresses
            .get(address)
            .await?
            .and_then(|entry| entry.private_key)
            .ok_or_else(|| {
                CoreError::FatalConfig(format!(
                    "no private key for {}",
                    address.encode(self.crypto.as_ref())
                ))
            })
    }

    async fn save_returning_id(&self, message: &mut Plaintext) -> CoreResult<u64> {
        self.messages.save(message).await?;
        message
            .id
            .ok_or_else(|| CoreError::Repository("repository assigned no id".into()))
    }

    async fn ensure_label(&self, kind: LabelKind, name: &str) -> CoreResult<u64> {
        for label in self.messages.labels().await? {
            if label.kind == Some(kind) {
                return Ok(label.id);
            }
        }
        let label = Label {
            id: 0,
            name: name.to_string(),
            kind: Some(kind),
            color: 0,
        };
        self.messages.save_label(&label).await?;
        for label in self.messages.labels().await? {
            if label.kind == Some(kind) {
                return Ok(label.id);
            }
        }
        Err(CoreError::Repository("label was not persisted".into()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
