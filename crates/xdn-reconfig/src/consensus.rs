//! The agreement seam.
//!
//! The coordinator never commits a lifecycle or membership change on its
//! own: it proposes the change and acts only on the returned [`Decision`].
//! Implementations must totally order decisions; the coordinator relies on
//! that order, on the epoch check described on [`Consensus::propose`], and
//! on replays of a decided proposal returning the original decision.
//!
//! [`LocalConsensus`] is the single-node implementation: it decides every
//! valid proposal immediately, in submission order.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use xdn_types::{Epoch, NodeGroup, NodeSet, ServiceName};

use crate::types::ServiceRecord;

// ============================================================================
// Proposals and Decisions
// ============================================================================

/// A change submitted for agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Proposal {
    /// Create one or more names at epoch zero.
    Create { records: Vec<ServiceRecord> },

    /// Tombstone a name that is at `epoch`.
    Delete { name: ServiceName, epoch: Epoch },

    /// Install `members` for `group` of `name` at `epoch`.
    Membership {
        name: ServiceName,
        group: NodeGroup,
        epoch: Epoch,
        members: NodeSet,
    },

    /// Replace the node pool of `group`.
    NodePool { group: NodeGroup, pool: NodeSet },
}

/// An agreed proposal and its position in the decision order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub slot: u64,
    pub proposal: Proposal,
}

/// Errors from the agreement primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// No decision could be reached right now.
    #[error("consensus unavailable: {0}")]
    Unavailable(String),

    /// The proposal conflicts with an earlier decision.
    #[error("proposal rejected: {0}")]
    Rejected(String),
}

/// The external agreement primitive.
pub trait Consensus: Send + Sync {
    /// Submits a proposal and resolves once it is decided or refused.
    ///
    /// A `Membership` proposal must carry exactly the epoch following the
    /// last decided epoch of its name; anything else is rejected, which is
    /// what makes a stale retry harmless.
    ///
    /// Proposing a value identical to one already decided resolves to that
    /// earlier decision. The coordinator re-proposes after a decision
    /// timeout and relies on this to learn a decision whose reply was lost.
    fn propose(
        &self,
        proposal: Proposal,
    ) -> impl Future<Output = Result<Decision, ConsensusError>> + Send;
}

// ============================================================================
// Local Consensus
// ============================================================================

#[derive(Debug, Default)]
struct LocalLog {
    decisions: Vec<Decision>,
    epochs: HashMap<ServiceName, Epoch>,
    deleted: HashSet<ServiceName>,
    pending_failures: u32,
}

/// Single-node agreement: every valid proposal is decided on submission.
///
/// Keeps the full decision log for inspection, and can be told to refuse
/// the next proposals to exercise the coordinator's failure paths.
#[derive(Debug, Default)]
pub struct LocalConsensus {
    log: Mutex<LocalLog>,
}

impl LocalConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` proposals fail with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.lock().pending_failures = count;
    }

    /// Returns a copy of every decision so far, in order.
    pub fn decisions(&self) -> Vec<Decision> {
        self.lock().decisions.clone()
    }

    /// Number of decisions so far.
    pub fn len(&self) -> usize {
        self.lock().decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn decide(&self, proposal: Proposal) -> Result<Decision, ConsensusError> {
        let mut log = self.lock();

        if log.pending_failures > 0 {
            log.pending_failures -= 1;
            warn!(?proposal, "injected consensus failure");
            return Err(ConsensusError::Unavailable("injected failure".into()));
        }

        // Pools may legitimately return to an earlier value, so only
        // per-name proposals are matched against the log.
        let replay = match &proposal {
            Proposal::NodePool { .. } => None,
            _ => log.decisions.iter().rev().find(|d| d.proposal == proposal),
        };
        if let Some(earlier) = replay {
            debug!(slot = earlier.slot, "replayed proposal already decided");
            return Ok(earlier.clone());
        }

        match &proposal {
            Proposal::Create { records } => {
                if let Some(record) = records.iter().find(|r| log.epochs.contains_key(&r.name)) {
                    return Err(ConsensusError::Rejected(format!(
                        "{} was already created",
                        record.name
                    )));
                }
                for record in records {
                    log.epochs.insert(record.name.clone(), record.epoch);
                }
            }
            Proposal::Membership { name, epoch, .. } => {
                let Some(decided) = log.epochs.get(name).copied() else {
                    return Err(ConsensusError::Rejected(format!("{name} does not exist")));
                };
                if log.deleted.contains(name) {
                    return Err(ConsensusError::Rejected(format!("{name} was deleted")));
                }
                if *epoch != decided.next() {
                    return Err(ConsensusError::Rejected(format!(
                        "{name} is at {decided}, cannot install {epoch}"
                    )));
                }
                log.epochs.insert(name.clone(), *epoch);
            }
            Proposal::Delete { name, epoch } => {
                if log.epochs.get(name) != Some(epoch) || log.deleted.contains(name) {
                    return Err(ConsensusError::Rejected(format!(
                        "{name} is not live at {epoch}"
                    )));
                }
                log.deleted.insert(name.clone());
            }
            Proposal::NodePool { .. } => {}
        }

        let decision = Decision {
            slot: log.decisions.len() as u64,
            proposal,
        };
        debug!(slot = decision.slot, "decided");
        log.decisions.push(decision.clone());
        Ok(decision)
    }

    fn lock(&self) -> MutexGuard<'_, LocalLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Consensus for LocalConsensus {
    fn propose(
        &self,
        proposal: Proposal,
    ) -> impl Future<Output = Result<Decision, ConsensusError>> + Send {
        let result = self.decide(proposal);
        std::future::ready(result)
    }
}

impl<C: Consensus> Consensus for std::sync::Arc<C> {
    fn propose(
        &self,
        proposal: Proposal,
    ) -> impl Future<Output = Result<Decision, ConsensusError>> + Send {
        (**self).propose(proposal)
    }
}
