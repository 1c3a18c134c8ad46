//! # xdn-reconfig: Reconfiguration coordinator for `xdn`
//!
//! The [`Coordinator`] owns one lifecycle state machine per service name and
//! moves names through it only on decisions returned by an external
//! [`Consensus`] primitive. Joining nodes receive their state as
//! [`StateTransferUnit`](xdn_transfer::StateTransferUnit)s over a
//! [`Transport`].
//!
//! ## Lifecycle
//!
//! ```text
//!            Create                  MembershipChange
//!   ABSENT ──────────► ACTIVE(e) ─────────────────────► RECONFIGURING(e)
//!                        │  ▲                                │
//!                        │  └──── decided: ACTIVE(e+1) ──────┤
//!                        │  └──── failed:  ACTIVE(e)  ◄──────┘
//!                 Delete │
//!                        ▼
//!                     DELETED (tombstone, never reused)
//! ```
//!
//! ## Reconfiguration
//!
//! 1. Reject the request if the name is not `ACTIVE` (a name already
//!    `RECONFIGURING` yields [`ReconfigError::ReconfigurationConflict`])
//! 2. Read the current state from a surviving member
//! 3. Send it, tagged with epoch `e+1`, to every added node, retrying each
//!    within a bounded budget
//! 4. Propose the new membership; on decision the name becomes `ACTIVE(e+1)`
//! 5. Only then tell removed nodes to stop serving
//!
//! Any failure before the decision rolls the name back to `ACTIVE(e)`. When
//! consensus never answers, the outcome is unknown: the name is released at
//! `ACTIVE(e)` but added nodes keep their state, and retrying the same change
//! learns the decision.
//!
//! ## Key Components
//!
//! - [`config`]: replication factors, timeouts, retry budget
//! - [`consensus`]: the agreement seam and [`LocalConsensus`]
//! - [`transport`]: the delivery seam and the in-memory [`MemoryCluster`]
//! - [`replica`]: [`ReplicaNode`], a node applying units through its ledger
//! - [`placement`]: deterministic placement of names onto node pools

pub mod config;
pub mod consensus;
mod coordinator;
pub mod placement;
pub mod replica;
pub mod transport;
mod types;

#[cfg(test)]
mod simulation;

pub use config::{CoordinatorConfig, TimeoutConfig};
pub use consensus::{Consensus, ConsensusError, Decision, LocalConsensus, Proposal};
pub use coordinator::Coordinator;
pub use replica::{AckOutcome, ReplicaNode, TransferAck};
pub use transport::{MemoryCluster, NetworkFaults, StopKind, Transport, TransportError};
pub use types::{Ack, Lifecycle, MembershipChange, NodeConfigAck, ServiceRecord};

use std::time::Duration;

use xdn_types::{Epoch, NodeGroup, ServiceName};

// ============================================================================
// Error Types
// ============================================================================

/// Errors returned by coordinator operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconfigError {
    /// The name is absent or deleted.
    #[error("service name {0} not found")]
    NotFound(ServiceName),

    /// The name already exists.
    #[error("service name {0} already exists")]
    AlreadyExists(ServiceName),

    /// The name was deleted and cannot be created again.
    #[error("service name {name} was deleted at {epoch} and cannot be reused")]
    Tombstoned { name: ServiceName, epoch: Epoch },

    /// Another operation on the name is in flight.
    #[error("service name {name} is busy: {in_flight}")]
    ReconfigurationConflict {
        name: ServiceName,
        in_flight: &'static str,
    },

    /// A node-config change for the group is already in flight.
    #[error("a {0} node-config change is already in flight")]
    NodeConfigConflict(NodeGroup),

    /// State could not be moved to a new member; the change was rolled back.
    #[error("state transfer for {name} failed: {reason}")]
    TransferFailure { name: ServiceName, reason: String },

    /// The change request is inconsistent with the current membership.
    #[error("invalid change for {name}: {reason}")]
    InvalidChange { name: ServiceName, reason: String },

    /// The node-config change is inconsistent with the current pool.
    #[error("invalid {group} node-config change: {reason}")]
    InvalidNodeConfig { group: NodeGroup, reason: String },

    /// The pool of the group has no nodes to place a name on.
    #[error("no {0} available")]
    NoCapacity(NodeGroup),

    /// Consensus refused or could not decide the proposal.
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// Consensus did not answer within the configured timeout on any
    /// attempt. The proposal may still have been decided.
    #[error("no decision within {0:?}, outcome unknown")]
    DecisionTimeout(Duration),

    /// Every node that could serve the request failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A record could not be encoded for transfer.
    #[error("encoding failed: {0}")]
    Encode(String),
}

impl ReconfigError {
    /// True for failures that may succeed when the whole request is retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconfigError::ReconfigurationConflict { .. }
                | ReconfigError::NodeConfigConflict(_)
                | ReconfigError::TransferFailure { .. }
                | ReconfigError::DecisionTimeout(_)
                | ReconfigError::Consensus(ConsensusError::Unavailable(_))
                | ReconfigError::Transport(_)
        )
    }

    /// False when the failed operation may nonetheless have been decided.
    pub fn outcome_known(&self) -> bool {
        !matches!(self, ReconfigError::DecisionTimeout(_))
    }
}

/// Result type for coordinator operations.
pub type ReconfigResult<T> = Result<T, ReconfigError>;

#[cfg(test)]
mod tests;
