//! Wires the capability, repositories, inventory, PoW engine, network
//! agent and pipeline into one running node.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use bitmessage_core::repository::{
    AddressRepository, InventoryRepository, MessageRepository, NodeRegistry,
    ProofOfWorkRepository,
};
use bitmessage_core::{Cryptography, DefaultCryptography, StoredObject};
use bitmessage_inventory::Inventory;
use bitmessage_network::NetworkAgent;
use bitmessage_pow::{PowService, PowSolution};
use bitmessage_storage::{
    open_database, MemoryAddressRepository, MemoryMessageRepository, MemoryPowRepository,
    SledInventoryRepository, SledNodeRegistry,
};

use crate::config::NodeConfig;
use crate::pipeline::MessagePipeline;

const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The repository set a node runs against. [`Repositories::open`]
/// builds the default mix: sled for what must survive restarts,
/// memory for the rest.
pub struct Repositories {
    pub inventory: Arc<dyn InventoryRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub addresses: Arc<dyn AddressRepository>,
    pub nodes: Arc<dyn NodeRegistry>,
    pub pow: Arc<dyn ProofOfWorkRepository>,
}

impl Repositories {
    pub fn open(datadir: &Path) -> Result<Self> {
        std::fs::create_dir_all(datadir)
            .with_context(|| format!("creating data directory {}", datadir.display()))?;
        let db = open_database(datadir).context("opening node database")?;
        Ok(Self {
            inventory: Arc::new(SledInventoryRepository::open(&db)?),
            messages: Arc::new(MemoryMessageRepository::new()),
            addresses: Arc::new(MemoryAddressRepository::new()),
            nodes: Arc::new(SledNodeRegistry::open(&db)?),
            pow: Arc::new(MemoryPowRepository::new()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inventory: Arc::new(bitmessage_storage::MemoryInventoryRepository::new()),
            messages: Arc::new(MemoryMessageRepository::new()),
            addresses: Arc::new(MemoryAddressRepository::new()),
            nodes: Arc::new(bitmessage_storage::MemoryNodeRegistry::new()),
            pow: Arc::new(MemoryPowRepository::new()),
        }
    }
}

pub struct Node {
    config: NodeConfig,
    pub crypto: Arc<dyn Cryptography>,
    pub inventory: Arc<Inventory>,
    pub agent: Arc<NetworkAgent>,
    pub pipeline: Arc<MessagePipeline>,
    pub repositories: Repositories,
    channels: Option<(mpsc::Receiver<StoredObject>, mpsc::UnboundedReceiver<PowSolution>)>,
}

impl Node {
    /// Assembles a node. The cryptography capability is created first
    /// and threaded into every component, so nothing can run before it
    /// exists.
    pub fn new(config: NodeConfig, repositories: Repositories) -> Result<Self> {
        config.validate()?;
        let crypto: Arc<dyn Cryptography> = Arc::new(DefaultCryptography::new());

        let inventory = Arc::new(Inventory::new(
            repositories.inventory.clone(),
            crypto.clone(),
            config.acceptance_policy(),
        ));
        let (agent, accepted_rx) = NetworkAgent::new(
            config.network(),
            crypto.clone(),
            inventory.clone(),
            repositories.nodes.clone(),
        );
        let (pow, solutions_rx) = PowService::start(crypto.clone(), config.pow_threads());
        let pipeline = MessagePipeline::new(
            crypto.clone(),
            agent.clone(),
            repositories.messages.clone(),
            repositories.addresses.clone(),
            repositories.pow.clone(),
            pow,
            config.acceptance_policy(),
        );

        Ok(Self {
            config,
            crypto,
            inventory,
            agent,
            pipeline,
            repositories,
            channels: Some((accepted_rx, solutions_rx)),
        })
    }

    /// Starts networking and the pipeline task; returns the listening
    /// address when the listener is enabled.
    pub async fn start(&mut self) -> Result<Option<SocketAddr>> {
        let (accepted_rx, solutions_rx) = self
            .channels
            .take()
            .context("node was already started")?;

        self.pipeline.resume_pending_pow().await?;
        self.pipeline
            .clone()
            .run(accepted_rx, solutions_rx, RETRY_SWEEP_INTERVAL);
        let listen = self.agent.start().await?;
        info!(
            streams = ?self.config.streams,
            "node up"
        );
        Ok(listen)
    }

    /// Blocks until ctrl-c.
    pub async fn run_until_shutdown(&mut self) -> Result<()> {
        self.start().await?;
        tokio::signal::ctrl_c().await.context("signal handler")?;
        info!("shutting down");
        Ok(())
    }
}
