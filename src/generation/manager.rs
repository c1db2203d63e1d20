//! Local generation logic shared by inbound RPC handlers, the leader driver
//! and the proposal sweeper.
//!
//! Every write goes through [`GenerationStore::transition`], so the state
//! machine verdict and the compare-and-swap happen under the same per-range
//! exclusion.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::state_machine::Transition;
use super::store::{GenerationStore, TransitionOutcome};
use crate::error::{GenerationError, GenerationResult};
use crate::gossip::GenListener;
use crate::metrics::{CAS_CONFLICTS, record_transition};
use crate::types::{GenStatus, Generation, GenerationSlot, Ordinal, Token, TransactionId};

/// Applies generation transitions to the local store.
pub struct GenerationManager {
    local: Ordinal,
    store: Arc<dyn GenerationStore>,
}

impl GenerationManager {
    pub fn new(local: Ordinal, store: Arc<dyn GenerationStore>) -> Self {
        Self { local, store }
    }

    pub fn local_ordinal(&self) -> Ordinal {
        self.local
    }

    pub fn store(&self) -> &Arc<dyn GenerationStore> {
        &self.store
    }

    /// Local view of the range starting at `token`.
    pub fn get(&self, token: Token) -> GenerationSlot {
        self.store.get(token)
    }

    /// Apply one transition and report what was written.
    pub fn apply(&self, token: Token, transition: Transition) -> GenerationResult<TransitionOutcome> {
        let tx = transition.tx();
        let target = transition.target_status();

        match self.store.transition(token, &transition) {
            Ok(TransitionOutcome::Written { record, superseded }) => {
                if let Some(old) = &superseded {
                    info!(
                        token = %token,
                        old_tx = %old.tx,
                        new_tx = %record.tx,
                        "Superseded in-flight proposal"
                    );
                    record_transition(GenStatus::Cancelled.as_str());
                }
                info!(
                    token = %token,
                    tx = %tx,
                    version = record.version,
                    leader = %record.leader,
                    status = %record.status,
                    "Generation transition written"
                );
                record_transition(record.status.as_str());
                Ok(TransitionOutcome::Written { record, superseded })
            }
            Ok(TransitionOutcome::Unchanged) => {
                debug!(token = %token, tx = %tx, status = %target, "Transition already applied");
                Ok(TransitionOutcome::Unchanged)
            }
            Err(e) => {
                if e.is_conflict() {
                    CAS_CONFLICTS.inc();
                }
                warn!(token = %token, tx = %tx, status = %target, error = %e, "Generation transition refused");
                Err(e)
            }
        }
    }

    /// Store a new proposal made by this node.
    pub fn propose(
        &self,
        generation: Generation,
        expected_tx: Option<TransactionId>,
    ) -> GenerationResult<TransitionOutcome> {
        self.apply(
            generation.start,
            Transition::Propose {
                generation,
                expected_tx,
            },
        )
    }

    /// Proposals older than `cutoff_micros` that are still in flight.
    pub fn expired_proposals(&self, cutoff_micros: i64) -> Vec<Generation> {
        self.store
            .in_flight()
            .into_iter()
            .filter(|g| g.timestamp < cutoff_micros)
            .collect()
    }
}

#[async_trait]
impl GenListener for GenerationManager {
    /// Store the proposal, then acknowledge it as accepted under the same
    /// transaction.
    async fn on_remote_set_as_proposed(
        &self,
        generation: Generation,
        expected_tx: Option<TransactionId>,
    ) -> GenerationResult<()> {
        let token = generation.start;
        let tx = generation.tx;
        debug!(
            token = %token,
            tx = %tx,
            tx_leader = %generation.tx_leader,
            "Remote proposal received"
        );
        self.propose(generation, expected_tx)?;
        self.apply(token, Transition::Accept { tx })?;
        Ok(())
    }

    async fn on_remote_set_as_accepted(&self, generation: Generation) -> GenerationResult<()> {
        let slot = self.store.get(generation.start);
        if slot.proposed.as_ref().is_some_and(|p| p.tx == generation.tx)
            || slot.committed.as_ref().is_some_and(|c| c.tx == generation.tx)
        {
            self.apply(generation.start, Transition::Accept { tx: generation.tx })?;
            return Ok(());
        }
        // An unknown transaction never replaces another leader's proposal.
        if slot.active_proposal().is_some() {
            let err = GenerationError::Conflict {
                token: generation.start,
                expected: Some(generation.tx),
                actual: slot.current_tx(),
            };
            CAS_CONFLICTS.inc();
            warn!(token = %generation.start, tx = %generation.tx, error = %err, "Accept for unknown transaction refused");
            return Err(err);
        }
        // Nothing in flight: take the record as a proposal against the
        // settled slot, then accept it.
        let expected_tx = slot.current_tx();
        self.on_remote_set_as_proposed(generation.with_status(GenStatus::Proposed), expected_tx)
            .await
    }

    async fn on_remote_set_as_committed(
        &self,
        token: Token,
        tx: TransactionId,
    ) -> GenerationResult<()> {
        self.apply(token, Transition::Commit { tx }).map(|_| ())
    }

    async fn on_remote_set_as_cancelled(
        &self,
        token: Token,
        tx: TransactionId,
    ) -> GenerationResult<()> {
        match self.apply(token, Transition::Cancel { tx }) {
            Ok(_) => Ok(()),
            // The proposal never reached this node or was already replaced.
            Err(GenerationError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn on_remote_catch_up(
        &self,
        record: Generation,
        expected_tx: Option<TransactionId>,
    ) -> GenerationResult<()> {
        info!(
            token = %record.start,
            tx = %record.tx,
            version = record.version,
            "Catching up on missed commit"
        );
        self.apply(
            record.start,
            Transition::CatchUp {
                record,
                expected_tx,
            },
        )
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::MemoryGenerationStore;

    fn manager() -> GenerationManager {
        GenerationManager::new(Ordinal(3), Arc::new(MemoryGenerationStore::new()))
    }

    fn proposal(version: u32) -> Generation {
        Generation {
            start: Token(0),
            end: Token(100),
            version,
            timestamp: Generation::now_micros(),
            leader: Ordinal(2),
            followers: vec![Ordinal(3)],
            tx: TransactionId::new(),
            tx_leader: Ordinal(2),
            status: GenStatus::Proposed,
            to_delete: false,
        }
    }

    #[tokio::test]
    async fn test_remote_proposal_is_stored_accepted() {
        let m = manager();
        let g = proposal(1);
        m.on_remote_set_as_proposed(g.clone(), None).await.unwrap();

        let slot = m.get(Token(0));
        assert_eq!(slot.proposed, Some(g.with_status(GenStatus::Accepted)));
        assert!(slot.committed.is_none());
    }

    #[tokio::test]
    async fn test_remote_proposal_redelivery_is_noop() {
        let m = manager();
        let g = proposal(1);
        m.on_remote_set_as_proposed(g.clone(), None).await.unwrap();
        m.on_remote_set_as_proposed(g.clone(), None).await.unwrap();
        assert_eq!(m.get(Token(0)).proposed.unwrap().status, GenStatus::Accepted);
    }

    #[tokio::test]
    async fn test_remote_commit_twice_is_noop() {
        let m = manager();
        let g = proposal(1);
        m.on_remote_set_as_proposed(g.clone(), None).await.unwrap();
        m.on_remote_set_as_committed(Token(0), g.tx).await.unwrap();
        m.on_remote_set_as_committed(Token(0), g.tx).await.unwrap();

        let committed = m.get(Token(0)).committed.unwrap();
        assert_eq!(committed.version, 1);
        assert_eq!(committed.status, GenStatus::Committed);
    }

    #[tokio::test]
    async fn test_remote_accept_of_unseen_record_stores_it() {
        let m = manager();
        let g = proposal(1).with_status(GenStatus::Accepted);
        m.on_remote_set_as_accepted(g.clone()).await.unwrap();
        assert_eq!(m.get(Token(0)).proposed, Some(g));
    }

    #[tokio::test]
    async fn test_remote_accept_of_foreign_tx_does_not_replace_proposal() {
        let m = manager();
        let held = proposal(1);
        m.on_remote_set_as_proposed(held.clone(), None).await.unwrap();
        let before = m.get(Token(0));

        let mut foreign = proposal(1).with_status(GenStatus::Accepted);
        foreign.leader = Ordinal(4);
        foreign.tx_leader = Ordinal(4);
        let err = m.on_remote_set_as_accepted(foreign.clone()).await.unwrap_err();
        assert_eq!(
            err,
            GenerationError::Conflict {
                token: Token(0),
                expected: Some(foreign.tx),
                actual: Some(held.tx),
            }
        );
        assert_eq!(m.get(Token(0)), before);
    }

    #[tokio::test]
    async fn test_remote_accept_after_cancelled_proposal_stores_it() {
        let m = manager();
        let held = proposal(1);
        m.on_remote_set_as_proposed(held.clone(), None).await.unwrap();
        m.on_remote_set_as_cancelled(Token(0), held.tx).await.unwrap();

        let next = proposal(1).with_status(GenStatus::Accepted);
        m.on_remote_set_as_accepted(next.clone()).await.unwrap();
        assert_eq!(m.get(Token(0)).proposed, Some(next));
    }

    #[tokio::test]
    async fn test_cancel_of_unknown_tx_is_ignored() {
        let m = manager();
        let g = proposal(1);
        m.on_remote_set_as_proposed(g.clone(), None).await.unwrap();
        m.on_remote_set_as_cancelled(Token(0), TransactionId::new())
            .await
            .unwrap();
        assert_eq!(m.get(Token(0)).proposed.unwrap().status, GenStatus::Accepted);

        m.on_remote_set_as_cancelled(Token(0), g.tx).await.unwrap();
        assert_eq!(m.get(Token(0)).proposed.unwrap().status, GenStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_catch_up_then_next_commit_applies() {
        let m = manager();
        let missed = proposal(1);
        m.on_remote_set_as_proposed(missed.clone(), None).await.unwrap();

        // The commit of v1 never arrived, v2 is next
        m.on_remote_catch_up(missed.with_status(GenStatus::Committed), Some(missed.tx))
            .await
            .unwrap();
        let next = proposal(2);
        m.on_remote_set_as_proposed(next.clone(), Some(missed.tx))
            .await
            .unwrap();
        m.on_remote_set_as_committed(Token(0), next.tx).await.unwrap();

        let slot = m.get(Token(0));
        assert_eq!(slot.committed.unwrap().tx, next.tx);
        assert!(slot.proposed.is_none());
    }

    #[test]
    fn test_supersede_stale_proposal() {
        let m = manager();
        let first = proposal(1);
        m.propose(first.clone(), None).unwrap();

        let second = proposal(1);
        let outcome = m.propose(second.clone(), Some(first.tx)).unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Written {
                record: second.clone(),
                superseded: Some(first.with_status(GenStatus::Cancelled)),
            }
        );
        assert_eq!(m.get(Token(0)).proposed, Some(second));
    }

    #[test]
    fn test_expired_proposals_filters_by_age() {
        let m = manager();
        let mut old = proposal(1);
        old.timestamp = 1_000;
        m.propose(old.clone(), None).unwrap();

        assert_eq!(m.expired_proposals(2_000), vec![old]);
        assert!(m.expired_proposals(500).is_empty());
    }
}
