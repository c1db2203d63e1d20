//! Background cancellation of stale proposals.
//!
//! A proposal that neither commits nor gets superseded within the proposal
//! timeout is cancelled locally. When this node initiated the transaction,
//! the cancellation is also pushed to the other replicas, best effort.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::manager::GenerationManager;
use super::state_machine::Transition;
use super::store::TransitionOutcome;
use crate::gossip::GenerationGossiper;
use crate::metrics::PROPOSALS_EXPIRED;
use crate::retry;
use crate::types::{Generation, Ordinal};

pub struct ProposalSweeper {
    manager: Arc<GenerationManager>,
    gossiper: Arc<dyn GenerationGossiper>,
    proposal_timeout: Duration,
    interval: Duration,
}

impl ProposalSweeper {
    pub fn new(
        manager: Arc<GenerationManager>,
        gossiper: Arc<dyn GenerationGossiper>,
        proposal_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            gossiper,
            proposal_timeout,
            interval,
        }
    }

    /// Cancel every proposal older than the timeout as of `now_micros`.
    ///
    /// Returns the number of proposals cancelled.
    pub async fn sweep_once(&self, now_micros: i64) -> usize {
        let timeout_micros = i64::try_from(self.proposal_timeout.as_micros()).unwrap_or(i64::MAX);
        let cutoff = now_micros.saturating_sub(timeout_micros);
        let local = self.manager.local_ordinal();

        let mut cancelled = 0;
        for proposal in self.manager.expired_proposals(cutoff) {
            match self
                .manager
                .apply(proposal.start, Transition::Cancel { tx: proposal.tx })
            {
                Ok(TransitionOutcome::Written { .. }) => {
                    cancelled += 1;
                    PROPOSALS_EXPIRED.inc();
                    info!(
                        token = %proposal.start,
                        tx = %proposal.tx,
                        status = %proposal.status,
                        "Cancelled expired proposal"
                    );
                    if proposal.tx_leader == local {
                        self.notify_replicas(&proposal, local).await;
                    }
                }
                Ok(TransitionOutcome::Unchanged) => {}
                // Raced with a commit or a newer proposal.
                Err(e) => debug!(token = %proposal.start, tx = %proposal.tx, error = %e, "Expired proposal moved on"),
            }
        }
        cancelled
    }

    async fn notify_replicas(&self, proposal: &Generation, local: Ordinal) {
        let notifications = proposal.replicas().filter(|o| *o != local).map(|ordinal| {
            let gossiper = self.gossiper.clone();
            let (token, tx) = (proposal.start, proposal.tx);
            async move {
                let result = retry::with_policy("notify", retry::notify_policy(), || {
                    gossiper.set_as_cancelled(ordinal, token, tx)
                })
                .await;
                if let Err(e) = result {
                    warn!(ordinal = %ordinal, tx = %tx, error = %e, "Failed to gossip cancellation");
                }
            }
        });
        join_all(notifications).await;
    }

    /// Sweep every interval until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        // Spread nodes started together across the interval.
        let interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX).max(1);
        let initial = Duration::from_millis(fastrand::u64(0..interval_ms));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + initial, self.interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Proposal sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let cancelled = self.sweep_once(Generation::now_micros()).await;
                    if cancelled > 0 {
                        info!(cancelled, "Proposal sweep complete");
                    }
                }
            }
        }
    }
}
