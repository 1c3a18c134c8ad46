//! # xdn-types: Core types for `xdn`
//!
//! This crate contains identifiers shared across the `xdn` system:
//! - Node and service identities ([`NodeId`], [`ServiceName`])
//! - Membership versioning ([`Epoch`])
//! - Request identity for idempotent retries ([`RequestId`], [`RequestIdGenerator`])
//! - Membership groups ([`NodeGroup`], [`NodeSet`])

use std::{
    borrow::Borrow,
    collections::BTreeSet,
    fmt::{Debug, Display},
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Node Identifier - Clone (opaque string)
// ============================================================================

/// Opaque identifier of a node (active replica or reconfigurator).
///
/// Node ids are compared by exact string equality. They never contain
/// the characters `:` `.` or `/` when used inside a vector clock, since
/// those are separators in the clock's text form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Lets maps keyed by `NodeId` be queried with a plain `&str`.
impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// A sorted, duplicate-free set of nodes.
///
/// Sorted order keeps placement and source selection deterministic.
pub type NodeSet = BTreeSet<NodeId>;

/// Builds a [`NodeSet`] from anything that yields node ids.
pub fn node_set<I, N>(nodes: I) -> NodeSet
where
    I: IntoIterator<Item = N>,
    N: Into<NodeId>,
{
    nodes.into_iter().map(Into::into).collect()
}

// ============================================================================
// Service Name - Clone (unique key of a replicated service)
// ============================================================================

/// The client-visible name of a replicated service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ServiceName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

// ============================================================================
// Epoch - Copy (8-byte value)
// ============================================================================

/// Membership version of a service name.
///
/// Starts at zero when the name is created and increases by exactly one
/// with every accepted reconfiguration.
///
/// # Invariants
///
/// - Epochs of a name only increase
/// - A state transfer unit produced under epoch `e` installs membership `e`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch(u64);

impl Epoch {
    /// The epoch of a freshly created name.
    pub const ZERO: Epoch = Epoch(0);

    pub fn new(epoch: u64) -> Self {
        Self(epoch)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next epoch (incremented by 1).
    pub fn next(&self) -> Self {
        Epoch(self.0.saturating_add(1))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl From<u64> for Epoch {
    fn from(epoch: u64) -> Self {
        Self(epoch)
    }
}

impl From<Epoch> for u64 {
    fn from(epoch: Epoch) -> Self {
        epoch.0
    }
}

// ============================================================================
// Request Identifier - Copy (8-byte value)
// ============================================================================

/// Caller-assigned identity of a request.
///
/// Request ids are the sole idempotence key for state transfer: a unit
/// re-delivered with the same id is reported as already applied.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<RequestId> for u64 {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

/// Hands out strictly increasing request ids.
///
/// Seeded from wall-clock milliseconds so ids issued by a restarted
/// process do not collide with ids it issued before the restart.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    /// Creates a generator whose first id is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Creates a generator seeded from the current wall-clock time.
    pub fn from_wall_clock() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(1);
        Self::starting_at(millis)
    }

    /// Returns a fresh id.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::from_wall_clock()
    }
}

// ============================================================================
// Node Group - Copy (small enum)
// ============================================================================

/// The two membership groups every service name has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeGroup {
    /// Nodes serving application requests for the name.
    ActiveReplicas,
    /// Nodes deciding lifecycle and membership changes for the name.
    Reconfigurators,
}

impl NodeGroup {
    /// The group that is not `self`.
    pub fn other(self) -> NodeGroup {
        match self {
            NodeGroup::ActiveReplicas => NodeGroup::Reconfigurators,
            NodeGroup::Reconfigurators => NodeGroup::ActiveReplicas,
        }
    }
}

impl Display for NodeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeGroup::ActiveReplicas => write!(f, "active-replicas"),
            NodeGroup::Reconfigurators => write!(f, "reconfigurators"),
        }
    }
}
