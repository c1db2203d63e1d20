//! Centralized protocol and configuration constants.
//!
//! # Categories
//!
//! - **Network Constants**: peer connection and request deadlines
//! - **Startup Constants**: the wait-for-peers barrier
//! - **Protocol Constants**: transition and proposal lifetimes
//! - **Data Frame Constants**: limits of the binary forwarding frame

use std::time::Duration;

// =============================================================================
// Network Constants
// =============================================================================

/// Default gossip listen port.
pub const DEFAULT_GOSSIP_PORT: u16 = 7946;

/// TCP connect plus HTTP/2 handshake deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline of a single peer request, body included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Concurrent HTTP/2 streams a peer may open on one connection.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 2048;

// =============================================================================
// Startup Constants
// =============================================================================

/// Poll interval of the wait-for-peers barrier.
pub const WAIT_FOR_UP_INTERVAL: Duration = Duration::from_millis(200);

/// Ceiling of the wait-for-peers barrier before the node gives up.
pub const WAIT_FOR_UP_MAX_WAIT: Duration = Duration::from_secs(600);

/// How often the barrier reports that it is still waiting.
pub const WAIT_FOR_UP_LOG_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// Protocol Constants
// =============================================================================

/// Deadline for collecting follower acknowledgements in one attempt.
pub const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(30);

/// Age after which an uncommitted proposal is cancelled.
pub const DEFAULT_PROPOSAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between stale-proposal sweeps.
pub const DEFAULT_PROPOSAL_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

// =============================================================================
// Data Frame Constants
// =============================================================================

/// Fixed bytes per item before the name: token, generation id, range index
/// and name length.
pub const FRAME_ITEM_HEADER_SIZE: usize = 8 + 4 + 1 + 1;

/// Longest stream name a frame can carry (1-byte length prefix).
pub const MAX_FRAME_NAME_LEN: usize = u8::MAX as usize;

/// Most items in one frame (2-byte count prefix).
pub const MAX_FRAME_ITEMS: usize = u16::MAX as usize;
