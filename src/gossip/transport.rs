//! Outbound side of the gossip transport.
//!
//! # Connection Set
//!
//! The per-peer connections form an immutable map published through an
//! [`ArcSwap`]. Callers load the current snapshot without locking; the
//! connection manager builds a complete replacement map on every topology
//! change and publishes it in one store. Only the manager mutates the set,
//! and it does so under its own exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use hyper::Method;
use tracing::{debug, info, warn};

use super::connection::{PeerConnection, PeerTimeouts};
use super::error::{ErrorBody, GossipError, GossipResult};
use super::messages::{self, ProposeRequest, TxRequest};
use super::{GenListener, GenerationGossiper};
use crate::constants::WAIT_FOR_UP_LOG_INTERVAL;
use crate::metrics::record_gossip_call;
use crate::topology::{Topology, TopologyListener};
use crate::types::{BrokerInfo, Generation, GenerationSlot, Ordinal, Token, TransactionId};

type ConnectionMap = HashMap<Ordinal, Arc<PeerConnection>>;

/// HTTP/2 implementation of [`GenerationGossiper`].
pub struct GossipTransport {
    local: Ordinal,
    topology: Arc<dyn Topology>,
    timeouts: PeerTimeouts,
    connections: ArcSwap<ConnectionMap>,
    /// Serializes connection-set rebuilds.
    manager: Mutex<()>,
    listener: OnceLock<Arc<dyn GenListener>>,
}

impl GossipTransport {
    /// Build the transport and subscribe it to topology changes.
    pub fn new(topology: Arc<dyn Topology>, timeouts: PeerTimeouts) -> Arc<Self> {
        let transport = Arc::new(Self {
            local: topology.local_broker().ordinal,
            topology: topology.clone(),
            timeouts,
            connections: ArcSwap::from_pointee(HashMap::new()),
            manager: Mutex::new(()),
            listener: OnceLock::new(),
        });
        transport.rebuild_connections();

        let listener: std::sync::Weak<dyn TopologyListener> = Arc::downgrade(&transport) as _;
        topology.register_listener(listener);
        transport
    }

    pub fn local_ordinal(&self) -> Ordinal {
        self.local
    }

    /// Bind the single inbound listener. A second registration is a wiring
    /// bug and fails.
    pub fn register_listener(&self, listener: Arc<dyn GenListener>) -> GossipResult<()> {
        self.listener
            .set(listener)
            .map_err(|_| GossipError::ListenerAlreadyRegistered)
    }

    pub fn listener(&self) -> GossipResult<Arc<dyn GenListener>> {
        self.listener
            .get()
            .cloned()
            .ok_or(GossipError::ListenerNotRegistered)
    }

    /// Ordinals with a connection in the current snapshot.
    pub fn connected_peers(&self) -> Vec<Ordinal> {
        let mut peers: Vec<_> = self.connections.load().keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    /// Replace the connection set to match the topology's current peers.
    ///
    /// The peer list is read under the manager lock, so notifications that
    /// arrive out of order still converge on the latest membership. Peers
    /// whose address is unchanged keep their session; removed or
    /// re-addressed peers are closed, failing their in-flight calls.
    fn rebuild_connections(&self) {
        let _guard = self.manager.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.connections.load_full();
        let peers = self.topology.peers();

        let mut next = ConnectionMap::with_capacity(peers.len());
        for peer in peers.iter().filter(|p| p.ordinal != self.local) {
            let Some(address) = self.topology.peer_address(peer.ordinal) else {
                warn!(ordinal = %peer.ordinal, "No address for peer, skipping");
                continue;
            };
            let connection = match current.get(&peer.ordinal) {
                Some(existing) if existing.address() == address && !existing.is_closed() => {
                    existing.clone()
                }
                _ => Arc::new(PeerConnection::new(peer.ordinal, address, self.timeouts)),
            };
            next.insert(peer.ordinal, connection);
        }

        for (ordinal, connection) in current.iter() {
            let kept = next
                .get(ordinal)
                .is_some_and(|c| Arc::ptr_eq(c, connection));
            if !kept {
                connection.close();
            }
        }

        info!(peers = next.len(), "Peer connection set rebuilt");
        self.connections.store(Arc::new(next));
    }

    fn connection(&self, ordinal: Ordinal) -> GossipResult<Arc<PeerConnection>> {
        self.connections
            .load()
            .get(&ordinal)
            .cloned()
            .ok_or(GossipError::UnknownPeer(ordinal))
    }

    /// One request to `ordinal`, mapping non-2xx answers to typed errors.
    async fn call(
        &self,
        operation: &'static str,
        ordinal: Ordinal,
        method: Method,
        path: String,
        body: Option<Vec<u8>>,
    ) -> GossipResult<Bytes> {
        let started = Instant::now();
        let result: GossipResult<Bytes> = async {
            let connection = self.connection(ordinal)?;
            let (status, bytes) = connection.request(method, &path, body).await?;
            if status.is_success() {
                return Ok(bytes);
            }
            let body = serde_json::from_slice::<ErrorBody>(&bytes)
                .unwrap_or_else(|_| ErrorBody::internal(format!("HTTP {status}")));
            Err(GossipError::from_body(ordinal, body))
        }
        .await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.as_metric_label(),
        };
        record_gossip_call(operation, outcome, started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(operation, ordinal = %ordinal, error = %e, "Gossip call failed");
        }
        result
    }

    /// Probe the peer's `/status` endpoint.
    pub async fn is_peer_up(&self, ordinal: Ordinal) -> bool {
        self.call(
            "status",
            ordinal,
            Method::GET,
            messages::STATUS_PATH.to_string(),
            None,
        )
        .await
        .is_ok()
    }

    /// Block until at least one peer answers its status probe.
    ///
    /// The peer list is re-read on every poll. Returns as soon as the
    /// topology has no peers. Fails with [`GossipError::NoPeerUp`] once
    /// `max_wait` elapses; callers treat that as fatal.
    pub async fn wait_for_peers_up(
        &self,
        interval: Duration,
        max_wait: Duration,
    ) -> GossipResult<()> {
        let started = Instant::now();
        let mut last_log = started;
        loop {
            let peers = self.topology.peers();
            if peers.is_empty() {
                info!("No peer detected (dev mode)");
                return Ok(());
            }

            let probes = peers.iter().map(|p| self.is_peer_up(p.ordinal));
            let up: Vec<bool> = join_all(probes).await;
            if let Some((peer, _)) = peers.iter().zip(&up).find(|(_, up)| **up) {
                info!(
                    peer = %peer,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Peer is up"
                );
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= max_wait {
                return Err(GossipError::NoPeerUp { waited });
            }
            if last_log.elapsed() >= WAIT_FOR_UP_LOG_INTERVAL {
                info!("Waiting for peer after {} seconds", waited.as_secs());
                last_log = Instant::now();
            }
            tokio::time::sleep(interval).await;
        }
    }
}

impl TopologyListener for GossipTransport {
    fn on_topology_change(&self, peers: &[BrokerInfo]) {
        debug!(notified = peers.len(), "Topology change received");
        self.rebuild_connections();
    }
}

#[async_trait]
impl GenerationGossiper for GossipTransport {
    async fn get_generations(&self, ordinal: Ordinal, token: Token) -> GossipResult<GenerationSlot> {
        let bytes = self
            .call(
                "get_generations",
                ordinal,
                Method::GET,
                messages::generations_path(token),
                None,
            )
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn set_generation_as_proposed(
        &self,
        ordinal: Ordinal,
        generation: &Generation,
        expected_tx: Option<TransactionId>,
    ) -> GossipResult<()> {
        let body = serde_json::to_vec(&ProposeRequest {
            generation: generation.clone(),
            expected_tx,
        })?;
        self.call(
            "propose",
            ordinal,
            Method::POST,
            messages::generations_path(generation.start),
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn set_as_accepted(&self, ordinal: Ordinal, generation: &Generation) -> GossipResult<()> {
        let body = serde_json::to_vec(generation)?;
        self.call(
            "accept",
            ordinal,
            Method::POST,
            messages::accept_path(generation.start),
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn set_as_committed(
        &self,
        ordinal: Ordinal,
        token: Token,
        tx: TransactionId,
    ) -> GossipResult<()> {
        let body = serde_json::to_vec(&TxRequest { tx })?;
        self.call(
            "commit",
            ordinal,
            Method::POST,
            messages::commit_path(token),
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn set_as_cancelled(
        &self,
        ordinal: Ordinal,
        token: Token,
        tx: TransactionId,
    ) -> GossipResult<()> {
        let body = serde_json::to_vec(&TxRequest { tx })?;
        self.call(
            "cancel",
            ordinal,
            Method::POST,
            messages::cancel_path(token),
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn catch_up(
        &self,
        ordinal: Ordinal,
        record: &Generation,
        expected_tx: Option<TransactionId>,
    ) -> GossipResult<()> {
        let body = serde_json::to_vec(&ProposeRequest {
            generation: record.clone(),
            expected_tx,
        })?;
        self.call(
            "catch_up",
            ordinal,
            Method::POST,
            messages::catch_up_path(record.start),
            Some(body),
        )
        .await
        .map(|_| ())
    }
}
