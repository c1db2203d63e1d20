//! Broker node example.
//!
//! Runs the generation gossip server of one broker and, optionally, claims
//! a token range for it.
//!
//! ## Running
//!
//! Three brokers (in separate terminals):
//! ```bash
//! BROKER_ORDINAL=1 GOSSIP_PORT=7001 GOSSIP_PEERS="2=127.0.0.1:7002,3=127.0.0.1:7003" cargo run --example node
//! BROKER_ORDINAL=3 GOSSIP_PORT=7003 GOSSIP_PEERS="1=127.0.0.1:7001,2=127.0.0.1:7002" cargo run --example node
//! BROKER_ORDINAL=2 GOSSIP_PORT=7002 GOSSIP_PEERS="1=127.0.0.1:7001,3=127.0.0.1:7003" \
//!     CLAIM_RANGE="0..100" CLAIM_FOLLOWERS="3" cargo run --example node
//! ```
//!
//! With JSON logging:
//! ```bash
//! LOG_FORMAT=json RUST_LOG=ringbroker=debug cargo run --example node
//! ```
//!
//! ## Endpoints
//!
//! - `GET /status` - Liveness probe used by peers
//! - `GET /metrics` - Prometheus metrics
//! - `GET /generations/{token}` - Local `[committed, proposed]` view of a range

use ringbroker::config::GossipConfig;
use ringbroker::generation::TransitionPlan;
use ringbroker::node::BrokerNode;
use ringbroker::telemetry::{LogFormat, init_logging};
use ringbroker::types::{Ordinal, Token};
use tracing::{error, info};

/// Parse `CLAIM_RANGE` (`start..end`) and `CLAIM_FOLLOWERS` (`3,4`).
fn claim_from_env(leader: Ordinal) -> Result<Option<TransitionPlan>, Box<dyn std::error::Error>> {
    let Ok(range) = std::env::var("CLAIM_RANGE") else {
        return Ok(None);
    };
    let (start, end) = range
        .split_once("..")
        .ok_or_else(|| format!("Invalid CLAIM_RANGE '{range}': expected start..end"))?;
    let start: Token = start.parse().map_err(|e| format!("Invalid CLAIM_RANGE start: {e}"))?;
    let end: Token = end.parse().map_err(|e| format!("Invalid CLAIM_RANGE end: {e}"))?;

    let followers = std::env::var("CLAIM_FOLLOWERS")
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<Ordinal>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Invalid CLAIM_FOLLOWERS: {e}"))?;

    Ok(Some(TransitionPlan::new(start, end, leader, followers)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let config = GossipConfig::from_env()?;
    let claim = claim_from_env(config.ordinal)?;

    info!(
        ordinal = %config.ordinal,
        listen = %config.listen_addr(),
        peers = ?config.peers,
        "Starting broker node"
    );

    let node = BrokerNode::start(config).await?;

    if let Some(plan) = claim {
        match node.driver().run(plan).await {
            Ok(report) => info!(generation = %report.generation, "Range claimed"),
            Err(e) => error!(error = %e, "Failed to claim range"),
        }
    }

    info!(addr = %node.local_addr(), "Node is running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;

    node.shutdown().await;
    Ok(())
}
