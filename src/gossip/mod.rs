//! Peer-to-peer RPC carrying generation proposals and commits.
//!
//! The transport is a carrier, not a decision-maker: outbound calls go
//! through [`GenerationGossiper`], inbound writes are handed to the single
//! registered [`GenListener`], and reads are served from the local
//! [`GenerationStore`](crate::generation::GenerationStore).

pub mod connection;
pub mod error;
pub mod messages;
pub mod server;
pub mod transport;

use async_trait::async_trait;

pub use connection::{PeerConnection, PeerTimeouts};
pub use error::{ErrorBody, ErrorKind, GossipError, GossipResult};
pub use server::GossipServer;
pub use transport::GossipTransport;

use crate::error::GenerationResult;
use crate::types::{Generation, GenerationSlot, Ordinal, Token, TransactionId};

/// Outbound generation RPCs, one peer per call.
#[async_trait]
pub trait GenerationGossiper: Send + Sync {
    /// Read the peer's local view of `token`.
    async fn get_generations(&self, ordinal: Ordinal, token: Token) -> GossipResult<GenerationSlot>;

    /// Push a proposal. The peer stores it and acknowledges it as accepted.
    async fn set_generation_as_proposed(
        &self,
        ordinal: Ordinal,
        generation: &Generation,
        expected_tx: Option<TransactionId>,
    ) -> GossipResult<()>;

    /// Move the peer's stored proposal with the same tx to accepted.
    async fn set_as_accepted(&self, ordinal: Ordinal, generation: &Generation) -> GossipResult<()>;

    /// Confirm the accepted transaction `tx` as committed.
    async fn set_as_committed(
        &self,
        ordinal: Ordinal,
        token: Token,
        tx: TransactionId,
    ) -> GossipResult<()>;

    /// Cancel the in-flight transaction `tx`.
    async fn set_as_cancelled(
        &self,
        ordinal: Ordinal,
        token: Token,
        tx: TransactionId,
    ) -> GossipResult<()>;

    /// Hand a peer that missed a commit the committed `record`.
    async fn catch_up(
        &self,
        ordinal: Ordinal,
        record: &Generation,
        expected_tx: Option<TransactionId>,
    ) -> GossipResult<()>;
}

/// Local business logic invoked for inbound generation writes.
#[async_trait]
pub trait GenListener: Send + Sync {
    async fn on_remote_set_as_proposed(
        &self,
        generation: Generation,
        expected_tx: Option<TransactionId>,
    ) -> GenerationResult<()>;

    async fn on_remote_set_as_accepted(&self, generation: Generation) -> GenerationResult<()>;

    async fn on_remote_set_as_committed(&self, token: Token, tx: TransactionId)
    -> GenerationResult<()>;

    async fn on_remote_set_as_cancelled(&self, token: Token, tx: TransactionId)
    -> GenerationResult<()>;

    async fn on_remote_catch_up(
        &self,
        record: Generation,
        expected_tx: Option<TransactionId>,
    ) -> GenerationResult<()>;
}
