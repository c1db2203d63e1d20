//! Leader-side orchestration of one range transition.
//!
//! # Attempt Lifecycle
//!
//! ```text
//! Init -> ProposalSent -> CommitSent -> Done
//!              |
//!              v
//!           Aborted   (any follower conflict, rejection, exhausted
//!                      retries, or the attempt deadline)
//! ```
//!
//! Every follower named in the generation must accept before the leader
//! commits. A failed attempt leaves the local proposal in flight; the next
//! attempt supersedes it, or the proposal sweeper cancels it.
//!
//! A follower that missed a commit is handed this node's committed record
//! before the next proposal reaches it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::manager::GenerationManager;
use super::state_machine::Transition;
use crate::error::GenerationError;
use crate::gossip::{GenerationGossiper, GossipError, GossipResult};
use crate::metrics::record_attempt;
use crate::retry;
use crate::types::{GenStatus, Generation, Ordinal, Token, TransactionId};

/// Where an attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Init,
    ProposalSent,
    CommitSent,
    Done,
    Aborted,
}

/// Desired ownership of a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub start: Token,
    pub end: Token,
    pub leader: Ordinal,
    pub followers: Vec<Ordinal>,
    /// Retire the range with this generation.
    pub to_delete: bool,
}

impl TransitionPlan {
    pub fn new(start: Token, end: Token, leader: Ordinal, followers: Vec<Ordinal>) -> Self {
        Self {
            start,
            end,
            leader,
            followers,
            to_delete: false,
        }
    }
}

/// Result of one follower exchange.
#[derive(Debug)]
pub struct FollowerOutcome {
    pub ordinal: Ordinal,
    pub result: GossipResult<()>,
}

/// A committed transition.
#[derive(Debug)]
pub struct TransitionReport {
    pub generation: Generation,
    /// Followers that never confirmed the commit. The next attempt that
    /// names them hands them the committed record first.
    pub commit_failures: Vec<FollowerOutcome>,
}

fn failed(outcomes: &[FollowerOutcome]) -> usize {
    outcomes.iter().filter(|o| o.result.is_err()).count()
}

/// Why an attempt was aborted.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The local store refused the proposal or the commit.
    #[error("local transition refused: {0}")]
    Local(#[from] GenerationError),

    /// At least one follower did not accept.
    #[error("{} of {} followers did not accept transaction {tx}", failed(.outcomes), .outcomes.len())]
    FollowersFailed {
        tx: TransactionId,
        outcomes: Vec<FollowerOutcome>,
    },

    #[error("attempt timed out in state {state:?} after {after:?}")]
    TimedOut { state: AttemptState, after: Duration },
}

impl TransitionError {
    /// True if a concurrent transaction won, locally or on a follower.
    pub fn is_conflict(&self) -> bool {
        match self {
            TransitionError::Local(e) => e.is_conflict(),
            TransitionError::FollowersFailed { outcomes, .. } => outcomes
                .iter()
                .any(|o| o.result.as_ref().is_err_and(GossipError::is_conflict)),
            TransitionError::TimedOut { .. } => false,
        }
    }

    pub fn as_metric_label(&self) -> &'static str {
        match self {
            TransitionError::Local(e) => e.as_metric_label(),
            TransitionError::FollowersFailed { .. } => "followers_failed",
            TransitionError::TimedOut { .. } => "timeout",
        }
    }
}

/// Drives propose, accept and commit for ranges led from this node.
pub struct TransitionDriver {
    manager: Arc<GenerationManager>,
    gossiper: Arc<dyn GenerationGossiper>,
    attempt_timeout: Duration,
}

impl TransitionDriver {
    pub fn new(
        manager: Arc<GenerationManager>,
        gossiper: Arc<dyn GenerationGossiper>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            gossiper,
            attempt_timeout,
        }
    }

    /// Run one attempt to move the range to `plan`.
    ///
    /// Safe to call again after any error; a new attempt mints a new
    /// transaction and supersedes this node's stale proposal.
    pub async fn run(&self, plan: TransitionPlan) -> Result<TransitionReport, TransitionError> {
        let result = self.attempt(plan).await;
        match &result {
            Ok(_) => record_attempt("committed"),
            Err(e) => record_attempt(e.as_metric_label()),
        }
        result
    }

    async fn attempt(&self, plan: TransitionPlan) -> Result<TransitionReport, TransitionError> {
        let local = self.manager.local_ordinal();

        // Init
        let slot = self.manager.get(plan.start);
        let expected_tx = slot.current_tx();
        let generation = Generation {
            start: plan.start,
            end: plan.end,
            version: slot.last_committed_version() + 1,
            timestamp: Generation::now_micros(),
            leader: plan.leader,
            followers: plan.followers,
            tx: TransactionId::new(),
            tx_leader: local,
            status: GenStatus::Proposed,
            to_delete: plan.to_delete,
        };
        info!(
            token = %generation.start,
            tx = %generation.tx,
            version = generation.version,
            leader = %generation.leader,
            state = ?AttemptState::Init,
            "Starting generation transition"
        );
        self.manager.propose(generation.clone(), expected_tx)?;

        // ProposalSent
        let targets: Vec<Ordinal> = generation.replicas().filter(|o| *o != local).collect();
        debug!(tx = %generation.tx, followers = ?targets, state = ?AttemptState::ProposalSent, "Fanning out proposal");
        let fan_out = join_all(
            targets
                .iter()
                .map(|ordinal| self.propose_to(*ordinal, &generation, expected_tx)),
        );
        let outcomes: Vec<FollowerOutcome> =
            match tokio::time::timeout(self.attempt_timeout, fan_out).await {
                Ok(results) => targets
                    .iter()
                    .zip(results)
                    .map(|(ordinal, result)| FollowerOutcome {
                        ordinal: *ordinal,
                        result,
                    })
                    .collect(),
                Err(_) => {
                    warn!(tx = %generation.tx, state = ?AttemptState::Aborted, "Transition attempt timed out");
                    return Err(TransitionError::TimedOut {
                        state: AttemptState::ProposalSent,
                        after: self.attempt_timeout,
                    });
                }
            };

        if failed(&outcomes) > 0 {
            for outcome in &outcomes {
                if let Err(e) = &outcome.result {
                    warn!(tx = %generation.tx, ordinal = %outcome.ordinal, error = %e, "Follower did not accept");
                }
            }
            warn!(tx = %generation.tx, state = ?AttemptState::Aborted, "Transition aborted");
            return Err(TransitionError::FollowersFailed {
                tx: generation.tx,
                outcomes,
            });
        }

        // CommitSent
        self.manager
            .apply(generation.start, Transition::Accept { tx: generation.tx })?;
        self.manager
            .apply(generation.start, Transition::Commit { tx: generation.tx })?;
        debug!(tx = %generation.tx, state = ?AttemptState::CommitSent, "Committed locally, gossiping commit");

        let commits = join_all(targets.iter().map(|ordinal| {
            let ordinal = *ordinal;
            let gossiper = self.gossiper.clone();
            let (token, tx) = (generation.start, generation.tx);
            async move {
                let result = retry::with_policy("commit", retry::commit_policy(), || {
                    gossiper.set_as_committed(ordinal, token, tx)
                })
                .await;
                FollowerOutcome { ordinal, result }
            }
        }))
        .await;
        let commit_failures: Vec<FollowerOutcome> =
            commits.into_iter().filter(|o| o.result.is_err()).collect();
        for failure in &commit_failures {
            if let Err(e) = &failure.result {
                warn!(tx = %generation.tx, ordinal = %failure.ordinal, error = %e, "Follower missed commit");
            }
        }

        // Done
        let committed = generation.with_status(GenStatus::Committed);
        info!(
            token = %committed.start,
            tx = %committed.tx,
            version = committed.version,
            state = ?AttemptState::Done,
            "Generation committed"
        );
        Ok(TransitionReport {
            generation: committed,
            commit_failures,
        })
    }

    /// Read the follower's view, bring it up to this node's committed record
    /// if it lags, then push the proposal against it.
    async fn propose_to(
        &self,
        ordinal: Ordinal,
        generation: &Generation,
        leader_expected: Option<TransactionId>,
    ) -> GossipResult<()> {
        let local = self.manager.local_ordinal();
        retry::with_policy("follower", retry::follower_policy(), || async move {
            let mut view = self.gossiper.get_generations(ordinal, generation.start).await?;
            let holds_tx = view.proposed.as_ref().is_some_and(|p| p.tx == generation.tx)
                || view.committed.as_ref().is_some_and(|c| c.tx == generation.tx);
            if holds_tx {
                // A lost response to an earlier push; re-send to reach Accepted.
                return self
                    .gossiper
                    .set_generation_as_proposed(ordinal, generation, view.current_tx())
                    .await;
            }

            if view.last_committed_version() + 1 < generation.version {
                let record = self
                    .manager
                    .get(generation.start)
                    .committed
                    .filter(|c| c.version > view.last_committed_version());
                if let Some(record) = record {
                    info!(
                        ordinal = %ordinal,
                        token = %record.start,
                        follower_version = view.last_committed_version(),
                        version = record.version,
                        "Follower missed a commit, sending committed record"
                    );
                    self.gossiper
                        .catch_up(ordinal, &record, view.current_tx())
                        .await?;
                    view = self.gossiper.get_generations(ordinal, generation.start).await?;
                }
            }

            let follower_tx = view.current_tx();
            if follower_tx != leader_expected {
                if let Some(active) = view.active_proposal().filter(|p| p.tx_leader != local) {
                    return Err(GossipError::Conflict {
                        ordinal,
                        message: format!(
                            "peer holds in-flight transaction {} from {}",
                            active.tx, active.tx_leader
                        ),
                    });
                }
                // Another leader committed past what this node has seen.
                if view.last_committed_version() >= generation.version {
                    return Err(GossipError::Conflict {
                        ordinal,
                        message: format!(
                            "peer already committed version {}",
                            view.last_committed_version()
                        ),
                    });
                }
            }
            self.gossiper
                .set_generation_as_proposed(ordinal, generation, follower_tx)
                .await
        })
        .await
    }
}
