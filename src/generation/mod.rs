//! Generation ownership: the per-range record of who leads and who follows,
//! and the transaction-guarded lifecycle that changes it.
//!
//! - [`store`]: per-range compare-and-swap storage
//! - [`state_machine`]: pure transition rules
//! - [`manager`]: local application of transitions, inbound listener
//! - [`driver`]: leader-side propose, accept, commit
//! - [`sweeper`]: cancellation of stale proposals

pub mod driver;
pub mod manager;
pub mod state_machine;
pub mod store;
pub mod sweeper;

pub use driver::{
    AttemptState, FollowerOutcome, TransitionDriver, TransitionError, TransitionPlan,
    TransitionReport,
};
pub use manager::GenerationManager;
pub use state_machine::{Decision, Transition};
pub use store::{GenerationStore, MemoryGenerationStore, TransitionOutcome};
pub use sweeper::ProposalSweeper;
