//! Cross-module protocol vectors: address derivation, varint widths,
//! and the envelope/payload invariants a conforming peer relies on.

use bitmessage_core::codec::{put_var_int, Decoder};
use bitmessage_core::crypto::Cryptography;
use bitmessage_core::crypto_box::CryptoBox;
use bitmessage_core::object::EXPIRY_GRACE_PAST;
use bitmessage_core::payload::{signing_input, verify_signature};
use bitmessage_core::pow::{initial_hash, pow_target, pow_value};
use bitmessage_core::{
    BitmessageAddress, DefaultCryptography, Feature, InventoryVector, MsgData, Object,
    ObjectPayload, ObjectType, PrivateKey,
};

#[test]
fn deterministic_test_identity() {
    // passphrase "test", one key, version 4, stream 1, regular length.
    let crypto = DefaultCryptography::new();
    let keys = PrivateKey::deterministic(&crypto, "test", 1, 4, 1, false).unwrap();
    assert_eq!(keys.len(), 1);

    let key = &keys[0];
    let ripe = key.pubkey.ripe(&crypto);
    assert_eq!(ripe[0], 0);

    let address = key.address(&crypto);
    assert_eq!(address.version, 4);
    assert_eq!(address.stream, 1);
    assert!(address.encode(&crypto).starts_with("BM-"));

    // Textual round-trip preserves the tuple.
    let parsed = BitmessageAddress::parse(&crypto, &address.encode(&crypto)).unwrap();
    assert_eq!(parsed, address);
}

#[test]
fn shorter_identities_have_two_zero_bytes() {
    let crypto = DefaultCryptography::new();
    let keys = PrivateKey::deterministic(&crypto, "test", 1, 4, 1, true).unwrap();
    let ripe = keys[0].pubkey.ripe(&crypto);
    assert_eq!(&ripe[..2], &[0, 0]);
}

#[test]
fn var_int_width_table() {
    let values = [
        0u64,
        252,
        253,
        0xFFFF,
        0x1_0000,
        0xFFFF_FFFF,
        0x1_0000_0000,
    ];
    let widths = [1usize, 1, 3, 3, 5, 5, 9];

    let mut stream = Vec::new();
    for value in values {
        put_var_int(&mut stream, value);
    }
    assert_eq!(stream.len(), widths.iter().sum::<usize>());

    let mut dec = Decoder::new(&stream);
    for (value, width) in values.iter().zip(widths) {
        let before = dec.position();
        assert_eq!(dec.var_int().unwrap(), *value);
        assert_eq!(dec.position() - before, width);
    }
    assert!(dec.is_empty());
}

#[test]
fn object_iv_matches_double_sha512() {
    let crypto = DefaultCryptography::new();
    let object = Object {
        nonce: [0, 1, 2, 3, 4, 5, 6, 7],
        expires_time: 1_800_000_000,
        version: 4,
        stream: 1,
        payload: ObjectPayload::GetPubkey(bitmessage_core::GetPubkey::Tag([0xAB; 32])),
    };
    let bytes = object.encode();
    let digest = crypto.double_sha512(&[&bytes]);
    let iv = InventoryVector::of_object(&crypto, &bytes);
    assert_eq!(iv.as_bytes(), &digest[..32]);
    assert_eq!(object.inventory_vector(&crypto), iv);
}

#[test]
fn pow_solution_stays_below_target() {
    let crypto = DefaultCryptography::new();
    let body = vec![0x42u8; 64];
    let mut object = vec![0u8; 8];
    object.extend_from_slice(&body);

    let hash = initial_hash(&crypto, &object).unwrap();
    let target = pow_target(body.len() as u64, 0, 1, 16);

    let mut nonce = 0u64;
    let solved = loop {
        let candidate = nonce.to_be_bytes();
        if pow_value(&crypto, &candidate, &hash) <= target {
            break candidate;
        }
        nonce += 1;
    };
    assert!(pow_value(&crypto, &solved, &hash) <= target);
}

#[test]
fn end_to_end_msg_encryption_and_signature() {
    let crypto = DefaultCryptography::new();
    let alice = PrivateKey::deterministic(&crypto, "alice", 1, 4, 1, false)
        .unwrap()
        .remove(0);
    let bob = PrivateKey::deterministic(&crypto, "bob", 1, 4, 1, false)
        .unwrap()
        .remove(0);

    let now = 1_800_000_000u64;
    let mut data = MsgData {
        msg_version: 1,
        address_version: alice.pubkey.version,
        stream: 1,
        behavior_bitfield: Feature::bitfield(&[Feature::DoesAck]),
        public_signing_key: alice.pubkey.public_signing_key,
        public_encryption_key: alice.pubkey.public_encryption_key,
        nonce_trials_per_byte: 1000,
        extra_bytes: 1000,
        destination_ripe: bob.pubkey.ripe(&crypto),
        encoding: 2,
        message: b"Subject:test\nBody:hello bob".to_vec(),
        ack: Vec::new(),
        signature: Vec::new(),
    };

    let shell = Object {
        nonce: [0; 8],
        expires_time: now + 216_000,
        version: 1,
        stream: 1,
        payload: ObjectPayload::Msg {
            encrypted: Vec::new(),
        },
    };
    data.signature = alice
        .sign(
            &crypto,
            &signing_input(&shell.signed_header(), &data.signed_fields()),
        )
        .unwrap();

    let boxed = CryptoBox::encrypt(
        &crypto,
        &bob.pubkey.public_encryption_key,
        &data.encode(),
    )
    .unwrap();
    let object = Object {
        payload: ObjectPayload::Msg {
            encrypted: boxed.to_bytes(),
        },
        ..shell
    };

    // The wire round-trip is bit-exact.
    let bytes = object.encode();
    let received = Object::decode(&bytes).unwrap();
    assert_eq!(received.encode(), bytes);
    assert_eq!(received.object_type(), ObjectType::Msg);

    // Bob trial-decrypts, parses and verifies the signature.
    let ObjectPayload::Msg { encrypted } = &received.payload else {
        panic!("expected msg payload");
    };
    let opened = CryptoBox::decode(encrypted)
        .unwrap()
        .decrypt(&crypto, &bob.private_encryption_key)
        .unwrap();
    let parsed = MsgData::decode(&opened).unwrap();
    assert_eq!(parsed, data);
    assert_eq!(parsed.destination_ripe, bob.pubkey.ripe(&crypto));
    verify_signature(
        &crypto,
        &parsed.public_signing_key,
        &received.signed_header(),
        &parsed.signed_fields(),
        &parsed.signature,
    )
    .unwrap();

    // Carol cannot.
    let carol = PrivateKey::deterministic(&crypto, "carol", 1, 4, 1, false)
        .unwrap()
        .remove(0);
    assert!(CryptoBox::decode(encrypted)
        .unwrap()
        .decrypt(&crypto, &carol.private_encryption_key)
        .is_err());
}

#[test]
fn expiry_grace_constants() {
    // Acceptance windows used by the inventory; pinned here so a drift
    // in either constant shows up as a failed protocol vector.
    assert_eq!(EXPIRY_GRACE_PAST, 300);
    assert_eq!(ObjectType::Msg.max_ttl(), 216_000);
    assert_eq!(ObjectType::Pubkey.max_ttl(), 28 * 24 * 3600);
}
