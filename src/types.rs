//! Type-safe wrappers for ring and ownership primitives.
//!
//! These newtypes keep tokens, broker ordinals and transaction ids from
//! being mixed up even though some of them share an integer representation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A position on the cluster's hash ring.
///
/// Ranges are half-open, `[start, end)`. The ring wraps, so a range whose
/// `end` is lower than or equal to its `start` covers the tail of the ring
/// plus the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub i64);

impl Token {
    /// Lowest position on the ring.
    pub const MIN: Self = Token(i64::MIN);

    /// Highest position on the ring.
    pub const MAX: Self = Token(i64::MAX);

    #[inline]
    pub const fn new(value: i64) -> Self {
        Token(value)
    }

    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for Token {
    fn from(value: i64) -> Self {
        Token(value)
    }
}

impl From<Token> for i64 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Token {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Token)
    }
}

/// Stable cluster-wide identifier of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ordinal(pub u32);

impl Ordinal {
    #[inline]
    pub const fn new(value: u32) -> Self {
        Ordinal(value)
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for Ordinal {
    fn from(value: u32) -> Self {
        Ordinal(value)
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Ordinal {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(Ordinal)
    }
}

/// Globally unique identifier guarding a generation's optimistic-concurrency
/// lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    /// Mint a fresh random transaction id.
    pub fn new() -> Self {
        TransactionId(Uuid::new_v4())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TransactionId {
    fn from(value: Uuid) -> Self {
        TransactionId(value)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a generation.
///
/// ```text
/// Proposed -> Accepted -> Committed
///     |           |
///     v           v
///  Cancelled   Cancelled
/// ```
///
/// `Committed` and `Cancelled` are terminal. On the wire the status is its
/// integer discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GenStatus {
    Cancelled = 0,
    Proposed = 1,
    Accepted = 2,
    Committed = 3,
}

impl TryFrom<u8> for GenStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(GenStatus::Cancelled),
            1 => Ok(GenStatus::Proposed),
            2 => Ok(GenStatus::Accepted),
            3 => Ok(GenStatus::Committed),
            other => Err(other),
        }
    }
}

impl Serialize for GenStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        (*self as u8).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for GenStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        GenStatus::try_from(value).map_err(|v| {
            serde::de::Error::custom(format!("unknown generation status {v}"))
        })
    }
}

impl GenStatus {
    /// Returns true for the statuses of an in-flight transaction.
    pub fn is_active(&self) -> bool {
        matches!(self, GenStatus::Proposed | GenStatus::Accepted)
    }

    /// Returns true if no transition can leave this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, GenStatus::Cancelled | GenStatus::Committed)
    }

    /// Returns a string label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            GenStatus::Cancelled => "cancelled",
            GenStatus::Proposed => "proposed",
            GenStatus::Accepted => "accepted",
            GenStatus::Committed => "committed",
        }
    }
}

impl fmt::Display for GenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of ownership for a token range at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    pub start: Token,
    pub end: Token,
    /// Increases by one with every committed generation of the range.
    pub version: u32,
    /// Creation time in microseconds since the Unix epoch.
    pub timestamp: i64,
    pub leader: Ordinal,
    pub followers: Vec<Ordinal>,
    pub tx: TransactionId,
    /// Broker that initiated the transaction. May differ from `leader`
    /// when another node drives a takeover.
    pub tx_leader: Ordinal,
    pub status: GenStatus,
    #[serde(default)]
    pub to_delete: bool,
}

impl Generation {
    /// Returns true if `token` falls inside `[start, end)`, honouring ring
    /// wrap-around.
    pub fn contains(&self, token: Token) -> bool {
        if self.start < self.end {
            token >= self.start && token < self.end
        } else {
            token >= self.start || token < self.end
        }
    }

    /// Returns true if the two ranges share at least one token.
    pub fn overlaps(&self, other: &Generation) -> bool {
        self.contains(other.start) || other.contains(self.start)
    }

    /// Every broker that holds a replica of the range, leader first.
    pub fn replicas(&self) -> impl Iterator<Item = Ordinal> + '_ {
        std::iter::once(self.leader).chain(self.followers.iter().copied())
    }

    /// Returns a copy of this generation carrying another status.
    pub fn with_status(&self, status: GenStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Microseconds since the Unix epoch, the unit of `timestamp`.
    pub fn now_micros() -> i64 {
        chrono::Utc::now().timestamp_micros()
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}) v{} leader={} followers={:?} tx={} status={}",
            self.start, self.end, self.version, self.leader, self.followers, self.tx, self.status
        )
    }
}

/// A node's local view of one token range.
///
/// Serialized on the wire as the two-element array `[committed, proposed]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Option<Generation>, Option<Generation>)")]
#[serde(into = "(Option<Generation>, Option<Generation>)")]
pub struct GenerationSlot {
    pub committed: Option<Generation>,
    /// The latest proposal, in flight or cancelled. Cleared on commit.
    pub proposed: Option<Generation>,
}

impl GenerationSlot {
    pub fn is_empty(&self) -> bool {
        self.committed.is_none() && self.proposed.is_none()
    }

    /// The transaction a compare-and-swap on this slot must present.
    pub fn current_tx(&self) -> Option<TransactionId> {
        self.proposed
            .as_ref()
            .or(self.committed.as_ref())
            .map(|g| g.tx)
    }

    /// Version of the committed generation, 0 if none.
    pub fn last_committed_version(&self) -> u32 {
        self.committed.as_ref().map(|g| g.version).unwrap_or(0)
    }

    /// The in-flight proposal, if it is still `Proposed` or `Accepted`.
    pub fn active_proposal(&self) -> Option<&Generation> {
        self.proposed.as_ref().filter(|g| g.status.is_active())
    }
}

impl From<(Option<Generation>, Option<Generation>)> for GenerationSlot {
    fn from((committed, proposed): (Option<Generation>, Option<Generation>)) -> Self {
        Self {
            committed,
            proposed,
        }
    }
}

impl From<GenerationSlot> for (Option<Generation>, Option<Generation>) {
    fn from(slot: GenerationSlot) -> Self {
        (slot.committed, slot.proposed)
    }
}

/// Information about a broker in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerInfo {
    pub ordinal: Ordinal,
    /// Reachable host name, e.g. `broker-1`.
    pub host_name: String,
    /// Whether the broker refers to this instance.
    pub is_self: bool,
}

impl fmt::Display for BrokerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.host_name, self.ordinal)
    }
}

/// Resolved replica set for a token. Derived from the committed generation
/// plus topology, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationInfo {
    pub leader: BrokerInfo,
    pub followers: Vec<BrokerInfo>,
    pub token: Token,
}

/// Locates a piece of replicated data: a stream, for a token, produced under
/// a given generation version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicDataId {
    pub name: String,
    pub token: Token,
    pub gen_id: u32,
    pub range_index: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation(start: i64, end: i64) -> Generation {
        Generation {
            start: Token(start),
            end: Token(end),
            version: 1,
            timestamp: 0,
            leader: Ordinal(2),
            followers: vec![Ordinal(3)],
            tx: TransactionId::new(),
            tx_leader: Ordinal(2),
            status: GenStatus::Proposed,
            to_delete: false,
        }
    }

    #[test]
    fn test_contains_plain_range() {
        let g = generation(0, 100);
        assert!(g.contains(Token(0)));
        assert!(g.contains(Token(99)));
        assert!(!g.contains(Token(100)));
        assert!(!g.contains(Token(-1)));
    }

    #[test]
    fn test_contains_wrapping_range() {
        let g = generation(100, -100);
        assert!(g.contains(Token(100)));
        assert!(g.contains(Token(i64::MAX)));
        assert!(g.contains(Token(i64::MIN)));
        assert!(!g.contains(Token(-100)));
        assert!(!g.contains(Token(0)));
    }

    #[test]
    fn test_generation_json_field_names() {
        let g = generation(0, 100);
        let json = serde_json::to_value(&g).unwrap();
        assert_eq!(json["start"], 0);
        assert_eq!(json["txLeader"], 2);
        assert_eq!(json["toDelete"], false);
        assert_eq!(json["status"], 1);
        assert_eq!(json["tx"], g.tx.to_string());
    }

    #[test]
    fn test_status_wire_values() {
        let statuses = [
            (GenStatus::Cancelled, "0"),
            (GenStatus::Proposed, "1"),
            (GenStatus::Accepted, "2"),
            (GenStatus::Committed, "3"),
        ];
        for (status, wire) in statuses {
            assert_eq!(serde_json::to_string(&status).unwrap(), wire);
            assert_eq!(serde_json::from_str::<GenStatus>(wire).unwrap(), status);
        }
        assert!(serde_json::from_str::<GenStatus>("4").is_err());
        assert!(serde_json::from_str::<GenStatus>("\"Proposed\"").is_err());
    }

    #[test]
    fn test_overlaps() {
        let base = generation(0, 100);
        assert!(base.overlaps(&generation(50, 150)));
        assert!(generation(50, 150).overlaps(&base));
        assert!(!base.overlaps(&generation(100, 200)));
        assert!(!base.overlaps(&generation(-100, 0)));

        // [i64::MAX - 10, -50) wraps through the head of the ring
        let wrapping = generation(i64::MAX - 10, -50);
        assert!(wrapping.overlaps(&generation(-60, 0)));
        assert!(!wrapping.overlaps(&generation(-50, 0)));
        assert!(wrapping.overlaps(&generation(i64::MAX - 1, i64::MAX)));
    }

    #[test]
    fn test_empty_slot_serializes_as_two_nulls() {
        let json = serde_json::to_string(&GenerationSlot::default()).unwrap();
        assert_eq!(json, "[null,null]");
        let slot: GenerationSlot = serde_json::from_str("[null,null]").unwrap();
        assert!(slot.is_empty());
    }

    #[test]
    fn test_current_tx_prefers_proposal() {
        let committed = generation(0, 100).with_status(GenStatus::Committed);
        let proposed = generation(0, 100);
        let slot = GenerationSlot {
            committed: Some(committed.clone()),
            proposed: None,
        };
        assert_eq!(slot.current_tx(), Some(committed.tx));

        let slot = GenerationSlot {
            committed: Some(committed),
            proposed: Some(proposed.clone()),
        };
        assert_eq!(slot.current_tx(), Some(proposed.tx));
        assert_eq!(slot.last_committed_version(), 1);
    }

    #[test]
    fn test_status_classes() {
        assert!(GenStatus::Proposed.is_active());
        assert!(GenStatus::Accepted.is_active());
        assert!(GenStatus::Committed.is_terminal());
        assert!(GenStatus::Cancelled.is_terminal());
        assert!(!GenStatus::Committed.is_active());
    }

    #[test]
    fn test_token_parse() {
        assert_eq!(" -42 ".parse::<Token>().unwrap(), Token(-42));
        assert!("abc".parse::<Token>().is_err());
    }
}
