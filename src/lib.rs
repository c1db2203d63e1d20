//! # Ringbroker
//! Generation ownership for a token-ring broker cluster.
//!
//! Every broker owns ranges of a signed 64-bit token ring. Who leads a range,
//! and which brokers follow it, is recorded in a versioned [`Generation`].
//! Generations change through a transaction-guarded lifecycle
//! (`Proposed → Accepted → Committed`, or `Cancelled`) that the range's new
//! leader drives across its followers over an HTTP/2 gossip transport.
//!
//! The crate provides:
//! - a compare-and-swap [`GenerationStore`](generation::GenerationStore) per token,
//! - the pure transition rules in [`generation::state_machine`],
//! - the peer transport ([`gossip::GossipTransport`]) and server ([`gossip::GossipServer`]),
//! - the leader-side [`TransitionDriver`](generation::TransitionDriver),
//! - [`BrokerNode`](node::BrokerNode), which wires all of it together.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use ringbroker::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GossipConfig::from_env()?;
//!     let node = BrokerNode::start(config).await?;
//!
//!     let plan = TransitionPlan::new(Token(0), Token(100), Ordinal(2), vec![Ordinal(3)]);
//!     let report = node.driver().run(plan).await?;
//!     println!("committed {}", report.generation);
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! See `demos/node.rs` for a runnable broker process.
//!
//! [`Generation`]: types::Generation

#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod generation;
pub mod gossip;
pub mod metrics;
pub mod node;
pub mod retry;
pub mod telemetry;
pub mod topology;
pub mod types;

pub mod prelude {
    //! Main export of node structures
    pub use crate::config::GossipConfig;
    pub use crate::error::{GenerationError, GenerationResult, RejectReason};
    pub use crate::generation::{
        GenerationManager, GenerationStore, MemoryGenerationStore, Transition, TransitionDriver,
        TransitionError, TransitionPlan, TransitionReport,
    };
    pub use crate::gossip::{GenListener, GenerationGossiper, GossipError, GossipResult};
    pub use crate::node::BrokerNode;
    pub use crate::topology::{StaticTopology, Topology};
    pub use crate::types::{
        BrokerInfo, GenStatus, Generation, GenerationSlot, Ordinal, Token, TransactionId,
    };

    pub use bytes;
}
