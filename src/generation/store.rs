//! Local generation store.
//!
//! Authoritative per-range record of the committed and proposed generation.
//! Writes are optimistic compare-and-swaps on the slot's current transaction
//! id, serialized per range. New proposals also take a store-wide lock so
//! the overlap check against other ranges and the write are one step.
//!
//! Slots are keyed by the range's start token.

use std::sync::{Mutex, PoisonError};

use dashmap::DashMap;

use super::state_machine::{self, Decision, Transition};
use crate::error::{GenerationError, GenerationResult, RejectReason};
use crate::types::{GenStatus, Generation, GenerationSlot, Token, TransactionId};

/// Result of a state-machine-guarded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The slot was updated with `record`.
    Written {
        record: Generation,
        /// In-flight proposal replaced by `record`, as cancelled.
        superseded: Option<Generation>,
    },
    /// The transition had already been applied.
    Unchanged,
}

impl TransitionOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, TransitionOutcome::Written { .. })
    }
}

/// Storage of generation records by token.
///
/// Implementations must run every write for one range inside an exclusive
/// section keyed by that range, and must never expose a partially written
/// slot to readers.
pub trait GenerationStore: Send + Sync {
    /// Snapshot of the committed and proposed generations for `token`.
    fn get(&self, token: Token) -> GenerationSlot;

    /// Compare-and-swap `generation` into its slot.
    ///
    /// Succeeds only if the slot's current transaction equals `expected_tx`
    /// (`None` for an empty slot). A committed record replaces the committed
    /// position and clears any proposal at or below its version; any other
    /// status replaces the proposal.
    fn put(
        &self,
        generation: Generation,
        expected_tx: Option<TransactionId>,
    ) -> GenerationResult<()>;

    /// Evaluate `transition` with the state machine and write the result,
    /// atomically with respect to other writes on the same range.
    fn transition(
        &self,
        token: Token,
        transition: &Transition,
    ) -> GenerationResult<TransitionOutcome>;

    /// Every proposal still `Proposed` or `Accepted`, across all ranges.
    fn in_flight(&self) -> Vec<Generation>;
}

/// In-memory [`GenerationStore`] backed by a sharded map.
///
/// Each write holds the shard lock of its range for the duration of the
/// compare-and-swap only.
#[derive(Debug, Default)]
pub struct MemoryGenerationStore {
    slots: DashMap<Token, GenerationSlot>,
    /// Held across the overlap scan and the write of a new proposal.
    proposals: Mutex<()>,
}

impl MemoryGenerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ranges with any history.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// First live record in another slot that shares a token with
    /// `generation`.
    ///
    /// Active proposals and committed records count; cancelled proposals and
    /// retired ranges do not. Must not be called while holding a slot entry.
    fn find_overlap(&self, generation: &Generation) -> Option<(Token, TransactionId)> {
        self.slots
            .iter()
            .filter(|entry| *entry.key() != generation.start)
            .find_map(|entry| {
                let slot = entry.value();
                slot.active_proposal()
                    .into_iter()
                    .chain(slot.committed.as_ref().filter(|c| !c.to_delete))
                    .find(|record| record.overlaps(generation))
                    .map(|record| (*entry.key(), record.tx))
            })
    }
}

/// Compare the slot's current transaction and write `record` on match.
fn compare_and_write(
    token: Token,
    slot: &mut GenerationSlot,
    record: Generation,
    expected_tx: Option<TransactionId>,
) -> GenerationResult<()> {
    let actual = slot.current_tx();
    if actual != expected_tx {
        return Err(GenerationError::Conflict {
            token,
            expected: expected_tx,
            actual,
        });
    }
    if record.status == GenStatus::Committed {
        slot.proposed = slot.proposed.take().filter(|p| p.version > record.version);
        slot.committed = Some(record);
    } else {
        slot.proposed = Some(record);
    }
    Ok(())
}

impl GenerationStore for MemoryGenerationStore {
    fn get(&self, token: Token) -> GenerationSlot {
        self.slots
            .get(&token)
            .map(|slot| slot.clone())
            .unwrap_or_default()
    }

    fn put(
        &self,
        generation: Generation,
        expected_tx: Option<TransactionId>,
    ) -> GenerationResult<()> {
        let token = generation.start;
        let mut slot = self.slots.entry(token).or_default();
        compare_and_write(token, &mut slot, generation, expected_tx)
    }

    fn transition(
        &self,
        token: Token,
        transition: &Transition,
    ) -> GenerationResult<TransitionOutcome> {
        let incoming = match transition {
            Transition::Propose { generation, .. } => Some(generation),
            Transition::CatchUp { record, .. } => Some(record),
            _ => None,
        };
        if let Some(generation) = incoming.filter(|g| g.start != token) {
            return Err(GenerationError::Rejected {
                token,
                reason: RejectReason::Malformed(format!(
                    "generation starts at {}, not {}",
                    generation.start, token
                )),
            });
        }

        let _proposal_guard = match transition {
            Transition::Propose { generation, .. } => {
                let guard = self
                    .proposals
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some((start, tx)) = self.find_overlap(generation) {
                    return Err(GenerationError::Rejected {
                        token,
                        reason: RejectReason::Overlap { start, tx },
                    });
                }
                Some(guard)
            }
            _ => None,
        };

        let mut slot = self.slots.entry(token).or_default();
        match state_machine::evaluate(&slot, transition) {
            Decision::Accept {
                record,
                expected_tx,
                superseded,
            } => {
                // A caught-up record was committed elsewhere; the local copy
                // of its proposal may lag behind Accepted.
                let previous = slot
                    .proposed
                    .as_ref()
                    .filter(|p| p.tx == record.tx)
                    .filter(|_| !matches!(transition, Transition::CatchUp { .. }))
                    .map(|p| p.status);
                if let Some(previous) = previous {
                    if !state_machine::is_legal(previous, record.status) {
                        return Err(GenerationError::Rejected {
                            token,
                            reason: RejectReason::TerminalState {
                                status: previous,
                                requested: record.status,
                            },
                        });
                    }
                }
                compare_and_write(token, &mut slot, record.clone(), expected_tx)?;
                Ok(TransitionOutcome::Written { record, superseded })
            }
            Decision::Unchanged => Ok(TransitionOutcome::Unchanged),
            Decision::Reject(reason) => Err(GenerationError::Rejected { token, reason }),
            Decision::Conflict { expected, actual } => Err(GenerationError::Conflict {
                token,
                expected,
                actual,
            }),
        }
    }

    fn in_flight(&self) -> Vec<Generation> {
        self.slots
            .iter()
            .filter_map(|entry| entry.value().active_proposal().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::Ordinal;

    fn proposal(start: i64, version: u32) -> Generation {
        Generation {
            start: Token(start),
            end: Token(start + 100),
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

    #[test]
    fn test_get_unknown_token_is_empty() {
        let store = MemoryGenerationStore::new();
        assert_eq!(store.get(Token(7)), GenerationSlot::default());
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_on_empty_slot_requires_no_expected_tx() {
        let store = MemoryGenerationStore::new();
        let g = proposal(0, 1);
        let err = store.put(g.clone(), Some(TransactionId::new())).unwrap_err();
        assert!(err.is_conflict());
        assert!(store.get(Token(0)).is_empty());

        store.put(g.clone(), None).unwrap();
        assert_eq!(store.get(Token(0)).proposed, Some(g));
    }

    #[test]
    fn test_put_conflict_leaves_slot_unchanged() {
        let store = MemoryGenerationStore::new();
        let first = proposal(0, 1);
        store.put(first.clone(), None).unwrap();

        let err = store.put(proposal(0, 1), None).unwrap_err();
        assert_eq!(
            err,
            GenerationError::Conflict {
                token: Token(0),
                expected: None,
                actual: Some(first.tx),
            }
        );
        assert_eq!(store.get(Token(0)).proposed, Some(first));
    }

    #[test]
    fn test_committed_put_clears_proposal() {
        let store = MemoryGenerationStore::new();
        let g = proposal(0, 1);
        store.put(g.clone(), None).unwrap();
        store
            .put(g.with_status(GenStatus::Committed), Some(g.tx))
            .unwrap();
        let slot = store.get(Token(0));
        assert_eq!(slot.committed.unwrap().status, GenStatus::Committed);
        assert!(slot.proposed.is_none());
    }

    #[test]
    fn test_full_lifecycle_through_transitions() {
        let store = MemoryGenerationStore::new();
        let g = proposal(0, 1);
        let token = Token(0);

        store
            .transition(
                token,
                &Transition::Propose {
                    generation: g.clone(),
                    expected_tx: None,
                },
            )
            .unwrap();
        store.transition(token, &Transition::Accept { tx: g.tx }).unwrap();
        let outcome = store.transition(token, &Transition::Commit { tx: g.tx }).unwrap();
        assert!(outcome.is_written());

        let slot = store.get(token);
        let committed = slot.committed.unwrap();
        assert_eq!(committed.status, GenStatus::Committed);
        assert_eq!(committed.version, 1);
        assert!(slot.proposed.is_none());

        // Replaying the commit is a no-op
        assert_eq!(
            store.transition(token, &Transition::Commit { tx: g.tx }).unwrap(),
            TransitionOutcome::Unchanged
        );
    }

    #[test]
    fn test_transition_rejects_token_mismatch() {
        let store = MemoryGenerationStore::new();
        let err = store
            .transition(
                Token(5),
                &Transition::Propose {
                    generation: proposal(0, 1),
                    expected_tx: None,
                },
            )
            .unwrap_err();
        assert!(err.is_rejected());
    }

    #[test]
    fn test_commit_with_foreign_tx_leaves_record() {
        let store = MemoryGenerationStore::new();
        let g = proposal(0, 1);
        store.put(g.with_status(GenStatus::Accepted), None).unwrap();

        let err = store
            .transition(
                Token(0),
                &Transition::Commit {
                    tx: TransactionId::new(),
                },
            )
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            store.get(Token(0)).proposed,
            Some(g.with_status(GenStatus::Accepted))
        );
    }

    #[test]
    fn test_in_flight_lists_active_proposals_only() {
        let store = MemoryGenerationStore::new();
        let active = proposal(0, 1);
        let cancelled = proposal(1000, 1).with_status(GenStatus::Cancelled);
        store.put(active.clone(), None).unwrap();
        store.put(cancelled, None).unwrap();

        assert_eq!(store.in_flight(), vec![active]);
    }

    #[test]
    fn test_concurrent_puts_same_expected_tx_single_winner() {
        for _ in 0..50 {
            let store = Arc::new(MemoryGenerationStore::new());
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    std::thread::spawn(move || {
                        let g = proposal(0, 1);
                        store.put(g.clone(), None).map(|_| g)
                    })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(winners.len(), 1);
            assert!(
                results
                    .iter()
                    .filter_map(|r| r.as_ref().err())
                    .all(|e| e.is_conflict())
            );
            assert_eq!(store.get(Token(0)).proposed.as_ref(), Some(winners[0]));
        }
    }

    #[test]
    fn test_unrelated_ranges_do_not_conflict() {
        let store = MemoryGenerationStore::new();
        store.put(proposal(0, 1), None).unwrap();
        store.put(proposal(100, 1), None).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.in_flight().len(), 2);
    }

    fn propose(
        store: &MemoryGenerationStore,
        generation: &Generation,
    ) -> GenerationResult<TransitionOutcome> {
        store.transition(
            generation.start,
            &Transition::Propose {
                generation: generation.clone(),
                expected_tx: store.get(generation.start).current_tx(),
            },
        )
    }

    #[test]
    fn test_overlapping_proposal_with_other_start_is_rejected() {
        let store = MemoryGenerationStore::new();
        let first = proposal(0, 1);
        propose(&store, &first).unwrap();

        let mut second = proposal(50, 1);
        second.end = Token(150);
        let err = propose(&store, &second).unwrap_err();
        assert_eq!(
            err,
            GenerationError::Rejected {
                token: Token(50),
                reason: RejectReason::Overlap {
                    start: Token(0),
                    tx: first.tx,
                },
            }
        );
        assert!(store.get(Token(50)).is_empty());
        assert_eq!(store.in_flight(), vec![first]);
    }

    #[test]
    fn test_overlap_check_covers_committed_and_wrapping_ranges() {
        let store = MemoryGenerationStore::new();
        let mut wrapping = proposal(0, 1);
        wrapping.start = Token(i64::MAX - 10);
        wrapping.end = Token(-50);
        propose(&store, &wrapping).unwrap();
        store
            .transition(wrapping.start, &Transition::Accept { tx: wrapping.tx })
            .unwrap();
        store
            .transition(wrapping.start, &Transition::Commit { tx: wrapping.tx })
            .unwrap();

        let mut head = proposal(-100, 1);
        head.end = Token(0);
        let err = propose(&store, &head).unwrap_err();
        assert!(matches!(
            err,
            GenerationError::Rejected {
                reason: RejectReason::Overlap { tx, .. },
                ..
            } if tx == wrapping.tx
        ));

        // Adjacent ranges share no token
        let mut adjacent = proposal(-50, 1);
        adjacent.end = Token(0);
        propose(&store, &adjacent).unwrap();
    }

    #[test]
    fn test_cancelled_and_retired_ranges_do_not_block_reshaping() {
        let store = MemoryGenerationStore::new();
        let cancelled = proposal(0, 1);
        propose(&store, &cancelled).unwrap();
        store
            .transition(Token(0), &Transition::Cancel { tx: cancelled.tx })
            .unwrap();

        let mut retired = proposal(200, 1).with_status(GenStatus::Committed);
        retired.to_delete = true;
        store.put(retired, None).unwrap();

        let mut wide = proposal(50, 1);
        wide.end = Token(250);
        propose(&store, &wide).unwrap();
        assert_eq!(store.in_flight(), vec![wide]);
    }

    #[test]
    fn test_concurrent_overlapping_proposals_single_winner() {
        for _ in 0..50 {
            let store = Arc::new(MemoryGenerationStore::new());
            let handles: Vec<_> = [0i64, 50]
                .into_iter()
                .map(|start| {
                    let store = store.clone();
                    std::thread::spawn(move || propose(&store, &proposal(start, 1)))
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert_eq!(store.in_flight().len(), 1);
        }
    }

    #[test]
    fn test_catch_up_installs_missed_commit() {
        let store = MemoryGenerationStore::new();
        let missed = proposal(0, 1);
        propose(&store, &missed).unwrap();
        store
            .transition(Token(0), &Transition::Accept { tx: missed.tx })
            .unwrap();

        let record = missed.with_status(GenStatus::Committed);
        let outcome = store
            .transition(
                Token(0),
                &Transition::CatchUp {
                    record: record.clone(),
                    expected_tx: Some(missed.tx),
                },
            )
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Written {
                record: record.clone(),
                superseded: None,
            }
        );
        let slot = store.get(Token(0));
        assert_eq!(slot.committed, Some(record));
        assert!(slot.proposed.is_none());
    }

    #[test]
    fn test_catch_up_keeps_newer_proposal() {
        let store = MemoryGenerationStore::new();
        let newer = proposal(0, 3);
        propose(&store, &newer).unwrap();

        let record = proposal(0, 2).with_status(GenStatus::Committed);
        store
            .transition(
                Token(0),
                &Transition::CatchUp {
                    record: record.clone(),
                    expected_tx: Some(newer.tx),
                },
            )
            .unwrap();
        let slot = store.get(Token(0));
        assert_eq!(slot.committed, Some(record));
        assert_eq!(slot.proposed, Some(newer));
    }
}
