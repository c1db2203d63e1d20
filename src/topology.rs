//! Cluster membership as seen by the generation protocol.
//!
//! Discovery itself lives outside this crate. [`Topology`] is the seam it
//! plugs into; [`StaticTopology`] is the configuration-driven implementation
//! used by [`BrokerNode`](crate::node::BrokerNode) and the tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::types::{BrokerInfo, Generation, Ordinal, ReplicationInfo, Token};

/// Receives the full peer list after every membership change.
pub trait TopologyListener: Send + Sync {
    fn on_topology_change(&self, peers: &[BrokerInfo]);
}

/// Read-only view of cluster membership.
pub trait Topology: Send + Sync {
    /// This broker.
    fn local_broker(&self) -> BrokerInfo;

    /// Every broker except this one, ordered by ordinal.
    fn peers(&self) -> Vec<BrokerInfo>;

    /// `host:port` of the peer's gossip endpoint.
    fn peer_address(&self, ordinal: Ordinal) -> Option<String>;

    /// Subscribe to membership changes. Listeners are held weakly and
    /// dropped once their owner goes away.
    fn register_listener(&self, listener: Weak<dyn TopologyListener>);

    /// Every broker including this one, ordered by ordinal.
    fn brokers(&self) -> Vec<BrokerInfo> {
        let mut brokers = self.peers();
        brokers.push(self.local_broker());
        brokers.sort_by_key(|b| b.ordinal);
        brokers
    }

    fn broker(&self, ordinal: Ordinal) -> Option<BrokerInfo> {
        self.brokers().into_iter().find(|b| b.ordinal == ordinal)
    }
}

/// Membership fixed at startup and replaced wholesale by [`set_peers`].
///
/// [`set_peers`]: StaticTopology::set_peers
pub struct StaticTopology {
    local: BrokerInfo,
    peers: ArcSwap<BTreeMap<Ordinal, String>>,
    listeners: Mutex<Vec<Weak<dyn TopologyListener>>>,
}

impl StaticTopology {
    pub fn new(
        local_ordinal: Ordinal,
        local_host: impl Into<String>,
        peers: impl IntoIterator<Item = (Ordinal, String)>,
    ) -> Self {
        Self {
            local: BrokerInfo {
                ordinal: local_ordinal,
                host_name: local_host.into(),
                is_self: true,
            },
            peers: ArcSwap::from_pointee(
                peers
                    .into_iter()
                    .filter(|(ordinal, _)| *ordinal != local_ordinal)
                    .collect(),
            ),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Replace the peer set and notify every live listener.
    pub fn set_peers(&self, peers: impl IntoIterator<Item = (Ordinal, String)>) {
        let peers: BTreeMap<_, _> = peers
            .into_iter()
            .filter(|(ordinal, _)| *ordinal != self.local.ordinal)
            .collect();
        info!(peer_count = peers.len(), "Topology changed");
        self.peers.store(Arc::new(peers));

        let snapshot = self.peers();
        let live: Vec<Arc<dyn TopologyListener>> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        debug!(listeners = live.len(), "Notifying topology listeners");
        for listener in live {
            listener.on_topology_change(&snapshot);
        }
    }
}

fn host_of(address: &str) -> &str {
    address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
}

impl Topology for StaticTopology {
    fn local_broker(&self) -> BrokerInfo {
        self.local.clone()
    }

    fn peers(&self) -> Vec<BrokerInfo> {
        self.peers
            .load()
            .iter()
            .map(|(ordinal, address)| BrokerInfo {
                ordinal: *ordinal,
                host_name: host_of(address).to_string(),
                is_self: false,
            })
            .collect()
    }

    fn peer_address(&self, ordinal: Ordinal) -> Option<String> {
        self.peers.load().get(&ordinal).cloned()
    }

    fn register_listener(&self, listener: Weak<dyn TopologyListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}

/// Resolve the replica set of the committed `generation` covering `token`.
///
/// Returns `None` if the token lies outside the range or a replica is not
/// part of the current topology.
pub fn replication_info(
    generation: &Generation,
    token: Token,
    topology: &dyn Topology,
) -> Option<ReplicationInfo> {
    if !generation.contains(token) {
        return None;
    }
    let leader = topology.broker(generation.leader)?;
    let followers = generation
        .followers
        .iter()
        .map(|ordinal| topology.broker(*ordinal))
        .collect::<Option<Vec<_>>>()?;
    Some(ReplicationInfo {
        leader,
        followers,
        token,
    })
}
