//! Process wiring for one broker's generation control plane.
//!
//! [`BrokerNode::start`] brings the pieces up in dependency order:
//!
//! ```text
//! topology ─► transport ◄── listener ── manager ◄── store
//!                 │                        ▲
//!                 ▼                        │
//!           gossip server ── reads ────────┘
//!                 │
//!                 ▼
//!       wait for peers up ─► sweeper ─► ready
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::GossipConfig;
use crate::generation::{
    GenerationManager, GenerationStore, MemoryGenerationStore, ProposalSweeper, TransitionDriver,
};
use crate::gossip::{GossipError, GossipServer, GossipTransport};
use crate::topology::{StaticTopology, Topology};

const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error(transparent)]
    Gossip(#[from] GossipError),
}

/// A running broker node.
pub struct BrokerNode {
    config: GossipConfig,
    topology: Arc<StaticTopology>,
    manager: Arc<GenerationManager>,
    transport: Arc<GossipTransport>,
    server: Arc<GossipServer>,
    driver: Arc<TransitionDriver>,
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl BrokerNode {
    /// Start a node and block until at least one peer is reachable.
    ///
    /// Fails when no peer answers within `wait_for_up_max_wait`; the caller
    /// should exit rather than serve under a partial view of the cluster.
    pub async fn start(config: GossipConfig) -> Result<Self, NodeError> {
        Self::start_with_store(config, Arc::new(MemoryGenerationStore::new())).await
    }

    pub async fn start_with_store(
        config: GossipConfig,
        store: Arc<dyn GenerationStore>,
    ) -> Result<Self, NodeError> {
        config.validate().map_err(NodeError::InvalidConfig)?;

        let topology = Arc::new(StaticTopology::new(
            config.ordinal,
            config.advertised_host.clone(),
            config.peers.clone(),
        ));
        let manager = Arc::new(GenerationManager::new(config.ordinal, store.clone()));
        let transport = GossipTransport::new(
            topology.clone() as Arc<dyn Topology>,
            config.peer_timeouts(),
        );
        transport.register_listener(manager.clone())?;

        let server = Arc::new(
            GossipServer::bind(
                &config.listen_addr(),
                store,
                transport.clone(),
                config.max_concurrent_streams,
            )
            .await?,
        );
        let local_addr = server.local_addr().map_err(|source| GossipError::Bind {
            addr: config.listen_addr(),
            source,
        })?;

        let mut tasks = Vec::new();
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "Gossip server stopped");
                }
            })
        };
        tasks.push(("gossip_server", server_task));

        if let Err(e) = transport
            .wait_for_peers_up(config.wait_for_up_interval, config.wait_for_up_max_wait)
            .await
        {
            error!(error = %e, "No peer reachable, giving up");
            server.shutdown();
            return Err(e.into());
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let sweeper = ProposalSweeper::new(
            manager.clone(),
            transport.clone(),
            config.proposal_timeout,
            config.proposal_sweep_interval,
        );
        let sweeper_shutdown = shutdown_tx.subscribe();
        tasks.push((
            "proposal_sweeper",
            tokio::spawn(async move { sweeper.run(sweeper_shutdown).await }),
        ));

        let driver = Arc::new(TransitionDriver::new(
            manager.clone(),
            transport.clone(),
            config.transition_timeout,
        ));

        info!(
            ordinal = %config.ordinal,
            addr = %local_addr,
            peers = config.peers.len(),
            "Broker node started"
        );

        Ok(Self {
            config,
            topology,
            manager,
            transport,
            server,
            driver,
            local_addr,
            shutdown_tx,
            tasks,
        })
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Leader-side entry point for changing range ownership.
    pub fn driver(&self) -> &Arc<TransitionDriver> {
        &self.driver
    }

    pub fn manager(&self) -> &Arc<GenerationManager> {
        &self.manager
    }

    pub fn transport(&self) -> &Arc<GossipTransport> {
        &self.transport
    }

    /// Peer membership; [`StaticTopology::set_peers`] rebuilds connections.
    pub fn topology(&self) -> &Arc<StaticTopology> {
        &self.topology
    }

    /// Address the gossip server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the server and the sweeper, then wait for both to finish.
    pub async fn shutdown(self) {
        info!(ordinal = %self.config.ordinal, "Broker node shutting down");
        self.server.shutdown();
        let _ = self.shutdown_tx.send(());

        for (name, handle) in self.tasks {
            match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "Task failed during shutdown"),
                Err(_) => warn!(task = name, "Task did not stop in time"),
            }
        }
    }
}
