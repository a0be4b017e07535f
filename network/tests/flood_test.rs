//! End-to-end propagation across real sockets: handshake, INV/GETDATA
//! exchange and multi-hop flooding.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use bitmessage_core::pow::{initial_hash, pow_target, pow_value};
use bitmessage_core::repository::{KnownNode, NodeRegistry};
use bitmessage_core::{
    Cryptography, DefaultCryptography, GetPubkey, InventoryVector, Object, ObjectPayload,
};
use bitmessage_inventory::{AcceptancePolicy, Inventory};
use bitmessage_network::{NetworkAgent, NetworkConfig};
use bitmessage_storage::{MemoryInventoryRepository, MemoryNodeRegistry};

fn easy_policy() -> AcceptancePolicy {
    AcceptancePolicy {
        nonce_trials_per_byte: 1,
        extra_bytes: 8,
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A solved getpubkey object nobody will try to answer.
fn solved_object(seed: u8) -> Vec<u8> {
    let crypto = DefaultCryptography::new();
    let policy = easy_policy();
    let now = unix_now();
    let mut object = Object {
        nonce: [0; 8],
        expires_time: now + 3600,
        version: 3,
        stream: 1,
        payload: ObjectPayload::GetPubkey(GetPubkey::Ripe([seed; 20])),
    };
    let bytes = object.encode();
    let hash = initial_hash(&crypto, &bytes).unwrap();
    let target = pow_target(
        (bytes.len() - 8) as u64,
        3600,
        policy.nonce_trials_per_byte,
        policy.extra_bytes,
    );
    let mut nonce = 0u64;
    loop {
        let candidate = nonce.to_be_bytes();
        if pow_value(&crypto, &candidate, &hash) <= target {
            object.nonce = candidate;
            return object.encode();
        }
        nonce += 1;
    }
}

struct TestNode {
    agent: Arc<NetworkAgent>,
    inventory: Arc<Inventory>,
    registry: Arc<MemoryNodeRegistry>,
    listen: Option<SocketAddr>,
}

async fn start_node(seeds: &[SocketAddr]) -> TestNode {
    let crypto: Arc<dyn Cryptography> = Arc::new(DefaultCryptography::new());
    let inventory = Arc::new(Inventory::new(
        Arc::new(MemoryInventoryRepository::new()),
        crypto.clone(),
        easy_policy(),
    ));
    let registry = Arc::new(MemoryNodeRegistry::new());

    let now = unix_now();
    let seeds: Vec<KnownNode> = seeds
        .iter()
        .map(|addr| KnownNode {
            ip: addr.ip(),
            port: addr.port(),
            stream: 1,
            services: 1,
            last_seen: now,
        })
        .collect();
    registry.offer(&seeds).await.unwrap();

    let config = NetworkConfig {
        port: 0, // ephemeral
        ..NetworkConfig::default()
    };
    let (agent, mut accepted_rx) =
        NetworkAgent::new(config, crypto, inventory.clone(), registry.clone());
    // Drain the pipeline channel so ingestion never backs up.
    tokio::spawn(async move { while accepted_rx.recv().await.is_some() {} });

    let bound = agent.start().await.unwrap();
    let listen = bound.map(|addr| SocketAddr::new("127.0.0.1".parse().unwrap(), addr.port()));
    TestNode {
        agent,
        inventory,
        registry,
        listen,
    }
}

async fn wait_for_active(node: &TestNode, count: usize) {
    timeout(Duration::from_secs(20), async {
        loop {
            if node.agent.active_peer_count().await >= count {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("peers never became active");
}

async fn wait_for_object(node: &TestNode, iv: &InventoryVector) {
    timeout(Duration::from_secs(20), async {
        loop {
            if node.inventory.contains(iv).await {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("object never propagated");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn object_floods_between_two_nodes() {
    let alice = start_node(&[]).await;
    let bob = start_node(&[alice.listen.unwrap()]).await;

    wait_for_active(&alice, 1).await;
    wait_for_active(&bob, 1).await;

    let bytes = solved_object(1);
    let iv = alice.agent.broadcast_object(&bytes).await.unwrap();

    wait_for_object(&bob, &iv).await;
    assert_eq!(bob.inventory.get_object(&iv).await.unwrap(), bytes);

    // Idempotent on arrival: re-broadcasting is reported as duplicate.
    assert!(matches!(
        alice.agent.broadcast_object(&bytes).await,
        Err(bitmessage_core::CoreError::Duplicate)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn object_floods_across_a_chain_of_three() {
    // carol ── bob ── alice; no direct alice↔carol link.
    let alice = start_node(&[]).await;
    let bob = start_node(&[alice.listen.unwrap()]).await;
    let carol = start_node(&[bob.listen.unwrap()]).await;

    wait_for_active(&alice, 1).await;
    wait_for_active(&bob, 2).await;
    wait_for_active(&carol, 1).await;

    let bytes = solved_object(2);
    let iv = alice.agent.broadcast_object(&bytes).await.unwrap();

    // One INV round per hop: alice→bob, then bob→carol.
    wait_for_object(&bob, &iv).await;
    wait_for_object(&carol, &iv).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gossiped_addresses_reach_the_registry() {
    let alice = start_node(&[]).await;
    let bob = start_node(&[alice.listen.unwrap()]).await;
    wait_for_active(&bob, 1).await;

    // Bob learned of alice from his seed list; alice in turn learns
    // bob's listening endpoint existence through the session registry
    // bookkeeping once the session is up.
    timeout(Duration::from_secs(20), async {
        loop {
            let known = alice.registry.known_nodes(1, 16).await.unwrap();
            if !known.is_empty() {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("alice never learned any peer");
    let _ = bob;
}
