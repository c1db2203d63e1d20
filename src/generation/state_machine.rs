//! Generation state machine.
//!
//! Pure validation over values it is given: no I/O, no hidden state. Both the
//! store-side handlers and the leader driver consult it before writing.
//!
//! # State Transitions
//!
//! ```text
//! Proposed -> Accepted   (follower acknowledges, same Tx)
//! Proposed -> Cancelled  (superseded by new Tx, or timeout)
//! Accepted -> Committed  (leader observes all required acks)
//! Accepted -> Cancelled  (superseded, or commit never arrives)
//! ```
//!
//! No transition leaves `Committed` or `Cancelled`.
//!
//! A replica that missed a commit takes the committed record directly
//! ([`Transition::CatchUp`]); the record settles every proposal at or below
//! its version.

use crate::error::RejectReason;
use crate::types::{GenStatus, Generation, GenerationSlot, TransactionId};

/// Returns true if the transition table permits `from -> to`.
pub fn is_legal(from: GenStatus, to: GenStatus) -> bool {
    matches!(
        (from, to),
        (GenStatus::Proposed, GenStatus::Accepted)
            | (GenStatus::Proposed, GenStatus::Cancelled)
            | (GenStatus::Accepted, GenStatus::Committed)
            | (GenStatus::Accepted, GenStatus::Cancelled)
    )
}

/// A requested change to the generation slot of one range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Store a new proposal, compare-and-swapping on `expected_tx`.
    Propose {
        generation: Generation,
        expected_tx: Option<TransactionId>,
    },
    /// Move the stored proposal with `tx` to `Accepted`.
    Accept { tx: TransactionId },
    /// Move the accepted proposal with `tx` to `Committed`.
    Commit { tx: TransactionId },
    /// Move the in-flight proposal with `tx` to `Cancelled`.
    Cancel { tx: TransactionId },
    /// Install a record another replica already committed, compare-and-swapping
    /// on `expected_tx`.
    CatchUp {
        record: Generation,
        expected_tx: Option<TransactionId>,
    },
}

impl Transition {
    /// Status the transition drives the record to.
    pub fn target_status(&self) -> GenStatus {
        match self {
            Transition::Propose { .. } => GenStatus::Proposed,
            Transition::Accept { .. } => GenStatus::Accepted,
            Transition::Commit { .. } => GenStatus::Committed,
            Transition::Cancel { .. } => GenStatus::Cancelled,
            Transition::CatchUp { .. } => GenStatus::Committed,
        }
    }

    pub fn tx(&self) -> TransactionId {
        match self {
            Transition::Propose { generation, .. } => generation.tx,
            Transition::CatchUp { record, .. } => record.tx,
            Transition::Accept { tx } | Transition::Commit { tx } | Transition::Cancel { tx } => *tx,
        }
    }
}

/// Verdict of the state machine for one transition against one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Permitted. Persist `record` by compare-and-swap on `expected_tx`.
    Accept {
        record: Generation,
        expected_tx: Option<TransactionId>,
        /// In-flight proposal replaced by a new transaction, as cancelled.
        superseded: Option<Generation>,
    },
    /// Already applied; re-delivery is a no-op success.
    Unchanged,
    /// Invalid transition.
    Reject(RejectReason),
    /// Transaction mismatch.
    Conflict {
        expected: Option<TransactionId>,
        actual: Option<TransactionId>,
    },
}

/// Evaluate `transition` against the currently stored `slot`.
pub fn evaluate(slot: &GenerationSlot, transition: &Transition) -> Decision {
    match transition {
        Transition::Propose {
            generation,
            expected_tx,
        } => evaluate_propose(slot, generation, *expected_tx),
        Transition::Accept { tx } => evaluate_accept(slot, *tx),
        Transition::Commit { tx } => evaluate_commit(slot, *tx),
        Transition::Cancel { tx } => evaluate_cancel(slot, *tx),
        Transition::CatchUp {
            record,
            expected_tx,
        } => evaluate_catch_up(slot, record, *expected_tx),
    }
}

/// Structural checks every proposal must pass.
pub fn validate_generation(generation: &Generation) -> Result<(), RejectReason> {
    if generation.version == 0 {
        return Err(RejectReason::Malformed("version must start at 1".into()));
    }
    if generation.followers.contains(&generation.leader) {
        return Err(RejectReason::Malformed(format!(
            "leader {} listed as follower",
            generation.leader
        )));
    }
    let mut seen = generation.followers.clone();
    seen.sort_unstable();
    seen.dedup();
    if seen.len() != generation.followers.len() {
        return Err(RejectReason::Malformed("duplicate followers".into()));
    }
    Ok(())
}

fn evaluate_propose(
    slot: &GenerationSlot,
    generation: &Generation,
    expected_tx: Option<TransactionId>,
) -> Decision {
    if generation.status != GenStatus::Proposed {
        return Decision::Reject(RejectReason::InvalidStatus {
            expected: GenStatus::Proposed,
            actual: generation.status,
        });
    }
    if let Err(reason) = validate_generation(generation) {
        return Decision::Reject(reason);
    }

    // Re-delivery of a proposal this slot already holds
    if let Some(proposed) = slot.proposed.as_ref().filter(|p| p.tx == generation.tx) {
        return match proposed.status {
            GenStatus::Cancelled => Decision::Reject(RejectReason::TerminalState {
                status: GenStatus::Cancelled,
                requested: GenStatus::Proposed,
            }),
            _ => Decision::Unchanged,
        };
    }
    if slot.committed.as_ref().is_some_and(|c| c.tx == generation.tx) {
        return Decision::Unchanged;
    }

    let actual = slot.current_tx();
    if actual != expected_tx {
        return Decision::Conflict {
            expected: expected_tx,
            actual,
        };
    }

    let last = slot.last_committed_version();
    if generation.version <= last {
        return Decision::Reject(RejectReason::StaleVersion {
            expected: last + 1,
            actual: generation.version,
        });
    }

    Decision::Accept {
        record: generation.clone(),
        expected_tx,
        superseded: slot
            .active_proposal()
            .map(|p| p.with_status(GenStatus::Cancelled)),
    }
}

fn evaluate_accept(slot: &GenerationSlot, tx: TransactionId) -> Decision {
    match slot.proposed.as_ref().filter(|p| p.tx == tx) {
        Some(proposed) => match proposed.status {
            GenStatus::Proposed => Decision::Accept {
                record: proposed.with_status(GenStatus::Accepted),
                expected_tx: Some(tx),
                superseded: None,
            },
            GenStatus::Accepted | GenStatus::Committed => Decision::Unchanged,
            GenStatus::Cancelled => Decision::Reject(RejectReason::TerminalState {
                status: GenStatus::Cancelled,
                requested: GenStatus::Accepted,
            }),
        },
        None if slot.committed.as_ref().is_some_and(|c| c.tx == tx) => Decision::Unchanged,
        None => Decision::Conflict {
            expected: Some(tx),
            actual: slot.current_tx(),
        },
    }
}

fn evaluate_commit(slot: &GenerationSlot, tx: TransactionId) -> Decision {
    if slot.committed.as_ref().is_some_and(|c| c.tx == tx) {
        return Decision::Unchanged;
    }
    let Some(proposed) = slot.proposed.as_ref().filter(|p| p.tx == tx) else {
        return Decision::Conflict {
            expected: Some(tx),
            actual: slot.current_tx(),
        };
    };

    match proposed.status {
        GenStatus::Accepted => {
            let expected = slot.last_committed_version() + 1;
            if proposed.version != expected {
                return Decision::Reject(RejectReason::StaleVersion {
                    expected,
                    actual: proposed.version,
                });
            }
            Decision::Accept {
                record: proposed.with_status(GenStatus::Committed),
                expected_tx: Some(tx),
                superseded: None,
            }
        }
        GenStatus::Proposed => Decision::Reject(RejectReason::NotAccepted {
            status: GenStatus::Proposed,
        }),
        status => Decision::Reject(RejectReason::TerminalState {
            status,
            requested: GenStatus::Committed,
        }),
    }
}

fn evaluate_cancel(slot: &GenerationSlot, tx: TransactionId) -> Decision {
    if slot.committed.as_ref().is_some_and(|c| c.tx == tx) {
        return Decision::Reject(RejectReason::CommittedImmutable { tx });
    }
    match slot.proposed.as_ref().filter(|p| p.tx == tx) {
        Some(proposed) if proposed.status.is_active() => Decision::Accept {
            record: proposed.with_status(GenStatus::Cancelled),
            expected_tx: Some(tx),
            superseded: None,
        },
        Some(_) => Decision::Unchanged,
        None => Decision::Conflict {
            expected: Some(tx),
            actual: slot.current_tx(),
        },
    }
}

fn evaluate_catch_up(
    slot: &GenerationSlot,
    record: &Generation,
    expected_tx: Option<TransactionId>,
) -> Decision {
    if record.status != GenStatus::Committed {
        return Decision::Reject(RejectReason::InvalidStatus {
            expected: GenStatus::Committed,
            actual: record.status,
        });
    }
    if let Err(reason) = validate_generation(record) {
        return Decision::Reject(reason);
    }
    if slot.committed.as_ref().is_some_and(|c| c.tx == record.tx) {
        return Decision::Unchanged;
    }

    let actual = slot.current_tx();
    if actual != expected_tx {
        return Decision::Conflict {
            expected: expected_tx,
            actual,
        };
    }

    let last = slot.last_committed_version();
    if record.version <= last {
        return Decision::Reject(RejectReason::StaleVersion {
            expected: last + 1,
            actual: record.version,
        });
    }

    Decision::Accept {
        record: record.clone(),
        expected_tx,
        superseded: slot
            .active_proposal()
            .filter(|p| p.tx != record.tx && p.version <= record.version)
            .map(|p| p.with_status(GenStatus::Cancelled)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ordinal, Token};

    fn proposal(version: u32) -> Generation {
        Generation {
            start: Token(0),
            end: Token(100),
            version,
            timestamp: 0,
            leader: Ordinal(2),
            followers: vec![Ordinal(3)],
            tx: TransactionId::new(),
            tx_leader: Ordinal(2),
            status: GenStatus::Proposed,
            to_delete: false,
        }
    }

    fn slot(committed: Option<Generation>, proposed: Option<Generation>) -> GenerationSlot {
        GenerationSlot {
            committed,
            proposed,
        }
    }

    #[test]
    fn test_transition_table() {
        use GenStatus::*;
        let all = [Cancelled, Proposed, Accepted, Committed];
        let legal = [
            (Proposed, Accepted),
            (Proposed, Cancelled),
            (Accepted, Committed),
            (Accepted, Cancelled),
        ];
        for from in all {
            for to in all {
                assert_eq!(is_legal(from, to), legal.contains(&(from, to)), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_propose_on_empty_slot() {
        let g = proposal(1);
        let decision = evaluate(
            &GenerationSlot::default(),
            &Transition::Propose {
                generation: g.clone(),
                expected_tx: None,
            },
        );
        assert_eq!(
            decision,
            Decision::Accept {
                record: g,
                expected_tx: None,
                superseded: None
            }
        );
    }

    #[test]
    fn test_propose_with_wrong_expected_tx_conflicts() {
        let committed = proposal(1).with_status(GenStatus::Committed);
        let s = slot(Some(committed.clone()), None);
        let decision = evaluate(
            &s,
            &Transition::Propose {
                generation: proposal(2),
                expected_tx: Some(TransactionId::new()),
            },
        );
        assert!(matches!(
            decision,
            Decision::Conflict { actual: Some(tx), .. } if tx == committed.tx
        ));
    }

    #[test]
    fn test_propose_against_empty_slot_with_expected_tx_conflicts() {
        let decision = evaluate(
            &GenerationSlot::default(),
            &Transition::Propose {
                generation: proposal(1),
                expected_tx: Some(TransactionId::new()),
            },
        );
        assert!(matches!(decision, Decision::Conflict { actual: None, .. }));
    }

    #[test]
    fn test_propose_stale_version_rejected() {
        let committed = proposal(3).with_status(GenStatus::Committed);
        let s = slot(Some(committed.clone()), None);
        let decision = evaluate(
            &s,
            &Transition::Propose {
                generation: proposal(3),
                expected_tx: Some(committed.tx),
            },
        );
        assert_eq!(
            decision,
            Decision::Reject(RejectReason::StaleVersion {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_propose_supersedes_active_proposal() {
        let stale = proposal(1).with_status(GenStatus::Accepted);
        let s = slot(None, Some(stale.clone()));
        let fresh = proposal(1);
        match evaluate(
            &s,
            &Transition::Propose {
                generation: fresh.clone(),
                expected_tx: Some(stale.tx),
            },
        ) {
            Decision::Accept {
                record, superseded, ..
            } => {
                assert_eq!(record, fresh);
                let superseded = superseded.unwrap();
                assert_eq!(superseded.tx, stale.tx);
                assert_eq!(superseded.status, GenStatus::Cancelled);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_propose_after_cancelled_has_nothing_to_supersede() {
        let cancelled = proposal(1).with_status(GenStatus::Cancelled);
        let s = slot(None, Some(cancelled.clone()));
        let decision = evaluate(
            &s,
            &Transition::Propose {
                generation: proposal(1),
                expected_tx: Some(cancelled.tx),
            },
        );
        assert!(matches!(
            decision,
            Decision::Accept {
                superseded: None,
                ..
            }
        ));
    }

    #[test]
    fn test_propose_redelivery_is_unchanged() {
        let g = proposal(1);
        let s = slot(None, Some(g.with_status(GenStatus::Accepted)));
        let decision = evaluate(
            &s,
            &Transition::Propose {
                generation: g,
                expected_tx: None,
            },
        );
        assert_eq!(decision, Decision::Unchanged);
    }

    #[test]
    fn test_propose_requires_proposed_status() {
        let g = proposal(1).with_status(GenStatus::Committed);
        let decision = evaluate(
            &GenerationSlot::default(),
            &Transition::Propose {
                generation: g,
                expected_tx: None,
            },
        );
        assert!(matches!(
            decision,
            Decision::Reject(RejectReason::InvalidStatus { .. })
        ));
    }

    #[test]
    fn test_propose_rejects_leader_in_followers() {
        let mut g = proposal(1);
        g.followers.push(g.leader);
        let decision = evaluate(
            &GenerationSlot::default(),
            &Transition::Propose {
                generation: g,
                expected_tx: None,
            },
        );
        assert!(matches!(
            decision,
            Decision::Reject(RejectReason::Malformed(_))
        ));
    }

    #[test]
    fn test_accept_same_tx() {
        let g = proposal(1);
        let s = slot(None, Some(g.clone()));
        match evaluate(&s, &Transition::Accept { tx: g.tx }) {
            Decision::Accept {
                record,
                expected_tx,
                ..
            } => {
                assert_eq!(record.status, GenStatus::Accepted);
                assert_eq!(expected_tx, Some(g.tx));
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_accept_other_tx_conflicts() {
        let g = proposal(1);
        let s = slot(None, Some(g));
        assert!(matches!(
            evaluate(
                &s,
                &Transition::Accept {
                    tx: TransactionId::new()
                }
            ),
            Decision::Conflict { .. }
        ));
    }

    #[test]
    fn test_accept_cancelled_rejected() {
        let g = proposal(1).with_status(GenStatus::Cancelled);
        let s = slot(None, Some(g.clone()));
        assert!(matches!(
            evaluate(&s, &Transition::Accept { tx: g.tx }),
            Decision::Reject(RejectReason::TerminalState { .. })
        ));
    }

    #[test]
    fn test_commit_requires_accepted() {
        let g = proposal(1);
        let s = slot(None, Some(g.clone()));
        assert_eq!(
            evaluate(&s, &Transition::Commit { tx: g.tx }),
            Decision::Reject(RejectReason::NotAccepted {
                status: GenStatus::Proposed
            })
        );
    }

    #[test]
    fn test_commit_version_must_follow_last_committed() {
        let committed = proposal(1).with_status(GenStatus::Committed);
        let skipping = proposal(3).with_status(GenStatus::Accepted);
        let s = slot(Some(committed), Some(skipping.clone()));
        assert_eq!(
            evaluate(&s, &Transition::Commit { tx: skipping.tx }),
            Decision::Reject(RejectReason::StaleVersion {
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_commit_first_version_is_one() {
        let accepted = proposal(1).with_status(GenStatus::Accepted);
        let s = slot(None, Some(accepted.clone()));
        match evaluate(&s, &Transition::Commit { tx: accepted.tx }) {
            Decision::Accept { record, .. } => {
                assert_eq!(record.status, GenStatus::Committed);
                assert_eq!(record.version, 1);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_commit_redelivery_is_unchanged() {
        let committed = proposal(1).with_status(GenStatus::Committed);
        let s = slot(Some(committed.clone()), None);
        assert_eq!(
            evaluate(&s, &Transition::Commit { tx: committed.tx }),
            Decision::Unchanged
        );
    }

    #[test]
    fn test_commit_unknown_tx_conflicts() {
        let accepted = proposal(1).with_status(GenStatus::Accepted);
        let s = slot(None, Some(accepted.clone()));
        let other = TransactionId::new();
        assert_eq!(
            evaluate(&s, &Transition::Commit { tx: other }),
            Decision::Conflict {
                expected: Some(other),
                actual: Some(accepted.tx),
            }
        );
    }

    #[test]
    fn test_cancel_active_proposal() {
        let accepted = proposal(1).with_status(GenStatus::Accepted);
        let s = slot(None, Some(accepted.clone()));
        match evaluate(&s, &Transition::Cancel { tx: accepted.tx }) {
            Decision::Accept { record, .. } => assert_eq!(record.status, GenStatus::Cancelled),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_cancel_committed_rejected() {
        let committed = proposal(1).with_status(GenStatus::Committed);
        let s = slot(Some(committed.clone()), None);
        assert_eq!(
            evaluate(&s, &Transition::Cancel { tx: committed.tx }),
            Decision::Reject(RejectReason::CommittedImmutable { tx: committed.tx })
        );
    }

    #[test]
    fn test_cancel_twice_is_unchanged() {
        let cancelled = proposal(1).with_status(GenStatus::Cancelled);
        let s = slot(None, Some(cancelled.clone()));
        assert_eq!(
            evaluate(&s, &Transition::Cancel { tx: cancelled.tx }),
            Decision::Unchanged
        );
    }

    #[test]
    fn test_catch_up_settles_stale_proposal() {
        let missed = proposal(1).with_status(GenStatus::Accepted);
        let s = slot(None, Some(missed.clone()));
        let record = missed.with_status(GenStatus::Committed);
        assert_eq!(
            evaluate(
                &s,
                &Transition::CatchUp {
                    record: record.clone(),
                    expected_tx: Some(missed.tx),
                }
            ),
            Decision::Accept {
                record,
                expected_tx: Some(missed.tx),
                superseded: None,
            }
        );
    }

    #[test]
    fn test_catch_up_reports_foreign_proposal_as_superseded() {
        let foreign = proposal(1).with_status(GenStatus::Accepted);
        let s = slot(None, Some(foreign.clone()));
        let record = proposal(2).with_status(GenStatus::Committed);
        match evaluate(
            &s,
            &Transition::CatchUp {
                record,
                expected_tx: Some(foreign.tx),
            },
        ) {
            Decision::Accept { superseded, .. } => {
                assert_eq!(superseded, Some(foreign.with_status(GenStatus::Cancelled)));
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_catch_up_requires_cas_and_newer_version() {
        let committed = proposal(2).with_status(GenStatus::Committed);
        let s = slot(Some(committed.clone()), None);

        let older = proposal(2).with_status(GenStatus::Committed);
        assert_eq!(
            evaluate(
                &s,
                &Transition::CatchUp {
                    record: older,
                    expected_tx: Some(committed.tx),
                }
            ),
            Decision::Reject(RejectReason::StaleVersion {
                expected: 3,
                actual: 2
            })
        );

        let newer = proposal(3).with_status(GenStatus::Committed);
        assert!(matches!(
            evaluate(
                &s,
                &Transition::CatchUp {
                    record: newer,
                    expected_tx: None,
                }
            ),
            Decision::Conflict { actual: Some(tx), .. } if tx == committed.tx
        ));

        assert_eq!(
            evaluate(
                &s,
                &Transition::CatchUp {
                    record: committed.clone(),
                    expected_tx: None,
                }
            ),
            Decision::Unchanged
        );
    }

    #[test]
    fn test_catch_up_rejects_uncommitted_record() {
        let decision = evaluate(
            &GenerationSlot::default(),
            &Transition::CatchUp {
                record: proposal(1).with_status(GenStatus::Accepted),
                expected_tx: None,
            },
        );
        assert!(matches!(
            decision,
            Decision::Reject(RejectReason::InvalidStatus { .. })
        ));
    }
}
