//! Records and requests owned by the coordinator.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use xdn_types::{Epoch, NodeGroup, NodeId, NodeSet, ServiceName};

use crate::ReconfigError;

// ============================================================================
// Service Record
// ============================================================================

/// The decided membership of one service name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: ServiceName,
    pub epoch: Epoch,
    pub active: NodeSet,
    pub reconfigurators: NodeSet,
}

impl ServiceRecord {
    /// A freshly created record at epoch zero.
    pub fn new(name: ServiceName, active: NodeSet, reconfigurators: NodeSet) -> Self {
        Self {
            name,
            epoch: Epoch::ZERO,
            active,
            reconfigurators,
        }
    }

    /// The member set of `group`.
    pub fn members(&self, group: NodeGroup) -> &NodeSet {
        match group {
            NodeGroup::ActiveReplicas => &self.active,
            NodeGroup::Reconfigurators => &self.reconfigurators,
        }
    }

    /// The record that results from installing `members` for `group` at the
    /// next epoch.
    pub fn with_members(&self, group: NodeGroup, members: NodeSet) -> Self {
        let mut next = self.clone();
        next.epoch = self.epoch.next();
        match group {
            NodeGroup::ActiveReplicas => next.active = members,
            NodeGroup::Reconfigurators => next.reconfigurators = members,
        }
        next
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Observable lifecycle of a service name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    /// No record exists (including while a create is undecided).
    Absent,
    /// Serving at a decided epoch.
    Active,
    /// A membership change is in flight.
    Reconfiguring,
    /// Deleted; the name is tombstoned.
    Deleted,
}

impl Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Absent => write!(f, "ABSENT"),
            Lifecycle::Active => write!(f, "ACTIVE"),
            Lifecycle::Reconfiguring => write!(f, "RECONFIGURING"),
            Lifecycle::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Internal per-name state, including the in-flight guards for create and
/// delete that the observable [`Lifecycle`] folds away.
#[derive(Debug, Clone)]
pub(crate) enum NameState {
    Creating,
    Active(ServiceRecord),
    Reconfiguring {
        record: ServiceRecord,
        pending: MembershipChange,
    },
    Deleting(ServiceRecord),
    Deleted {
        final_epoch: Epoch,
    },
}

impl NameState {
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        match self {
            NameState::Creating => Lifecycle::Absent,
            NameState::Active(_) | NameState::Deleting(_) => Lifecycle::Active,
            NameState::Reconfiguring { .. } => Lifecycle::Reconfiguring,
            NameState::Deleted { .. } => Lifecycle::Deleted,
        }
    }

    /// The last decided record, while one is being served.
    pub(crate) fn record(&self) -> Option<&ServiceRecord> {
        match self {
            NameState::Active(record)
            | NameState::Deleting(record)
            | NameState::Reconfiguring { record, .. } => Some(record),
            NameState::Creating | NameState::Deleted { .. } => None,
        }
    }
}

// ============================================================================
// Membership Change
// ============================================================================

/// A request to add and remove members of one group of one name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub name: ServiceName,
    pub group: NodeGroup,
    #[serde(default)]
    pub add: NodeSet,
    #[serde(default)]
    pub remove: NodeSet,
}

impl MembershipChange {
    pub fn new(name: ServiceName, group: NodeGroup, add: NodeSet, remove: NodeSet) -> Self {
        Self {
            name,
            group,
            add,
            remove,
        }
    }

    /// Checks the change against the current members and returns the
    /// resulting member set.
    pub fn resolve(&self, current: &NodeSet) -> Result<NodeSet, ReconfigError> {
        let invalid = |reason: String| ReconfigError::InvalidChange {
            name: self.name.clone(),
            reason,
        };

        if self.add.is_empty() && self.remove.is_empty() {
            return Err(invalid("change adds and removes nothing".into()));
        }
        if let Some(node) = self.add.intersection(&self.remove).next() {
            return Err(invalid(format!("{node} is both added and removed")));
        }
        if let Some(node) = self.add.iter().find(|n| current.contains(*n)) {
            return Err(invalid(format!("{node} is already a member")));
        }
        if let Some(node) = self.remove.iter().find(|n| !current.contains(*n)) {
            return Err(invalid(format!("{node} is not a member")));
        }

        let next: NodeSet = current
            .difference(&self.remove)
            .chain(self.add.iter())
            .cloned()
            .collect();
        if next.is_empty() {
            return Err(invalid(format!("{} would be left without members", self.group)));
        }
        Ok(next)
    }
}

// ============================================================================
// Acknowledgments
// ============================================================================

/// Final outcome of one per-name operation, stamped with the causal clock
/// of the name's reconfigurators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub record: ServiceRecord,
    pub stamp: xdn_clock::VectorClock,
}

/// Outcome of a node-config reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfigAck {
    pub group: NodeGroup,
    /// The pool of the group after the change.
    pub pool: NodeSet,
    /// Names whose membership was migrated.
    pub migrated: Vec<ServiceName>,
    /// Names whose migration failed, with the reason.
    pub failed: Vec<(ServiceName, String)>,
    pub summary: String,
}

impl NodeConfigAck {
    pub fn is_failed(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Formats a node set as `[a, b, c]`.
pub(crate) fn display_nodes(nodes: &NodeSet) -> String {
    let names: Vec<&str> = nodes.iter().map(NodeId::as_str).collect();
    format!("[{}]", names.join(", "))
}
