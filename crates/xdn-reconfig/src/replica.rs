//! A node hosting per-name state.
//!
//! Active replicas host the application state of the names they serve;
//! reconfigurators host each name's [`ServiceRecord`](crate::ServiceRecord)
//! as JSON. Both receive it the same way: as a [`StateTransferUnit`] that is
//! applied at most once per request id.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use xdn_transfer::{ApplyLedger, ApplyOutcome, LedgerConfig, StateApplier, StateTransferUnit};
use xdn_types::{Epoch, NodeId, RequestId, ServiceName};

use crate::transport::TransportError;

/// Acknowledgment of one received transfer unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAck {
    pub node: NodeId,
    pub request_id: RequestId,
    pub outcome: AckOutcome,
}

/// Serializable mirror of [`ApplyOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckOutcome {
    Applied,
    AlreadyApplied,
    Stale { installed: Epoch },
}

impl AckOutcome {
    /// True if the node now holds the unit's state.
    pub fn is_acknowledgeable(&self) -> bool {
        !matches!(self, AckOutcome::Stale { .. })
    }
}

impl From<ApplyOutcome> for AckOutcome {
    fn from(outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Applied => AckOutcome::Applied,
            ApplyOutcome::AlreadyApplied => AckOutcome::AlreadyApplied,
            ApplyOutcome::Stale { installed } => AckOutcome::Stale { installed },
        }
    }
}

#[derive(Debug, Clone)]
struct Hosted {
    state: String,
    epoch: Epoch,
}

/// One node's hosted names and its apply ledger.
pub struct ReplicaNode {
    id: NodeId,
    hosted: HashMap<ServiceName, Hosted>,
    ledger: ApplyLedger,
    applier: Arc<dyn StateApplier>,
    apply_runs: HashMap<ServiceName, u64>,
}

impl std::fmt::Debug for ReplicaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaNode")
            .field("id", &self.id)
            .field("hosted", &self.hosted.len())
            .finish_non_exhaustive()
    }
}

impl ReplicaNode {
    pub fn new(id: NodeId, applier: Arc<dyn StateApplier>, ledger: LedgerConfig) -> Self {
        Self {
            id,
            hosted: HashMap::new(),
            ledger: ApplyLedger::new(ledger),
            applier,
            apply_runs: HashMap::new(),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Decodes and applies an encoded transfer unit.
    pub fn handle_transfer(&mut self, encoded: &str) -> Result<TransferAck, TransportError> {
        let unit = StateTransferUnit::decode(encoded)
            .map_err(|e| TransportError::Rejected(e.to_string()))?
            .ok_or_else(|| TransportError::Rejected("not a state transfer unit".into()))?;

        let outcome = self.ledger.apply_once(&unit, |unit| {
            let current = self.hosted.get(unit.service_name()).map(|h| h.state.as_str());
            let state = unit.apply_to(self.applier.as_ref(), current);
            self.hosted.insert(
                unit.service_name().clone(),
                Hosted {
                    state,
                    epoch: unit.epoch(),
                },
            );
            *self.apply_runs.entry(unit.service_name().clone()).or_default() += 1;
        });

        debug!(
            node = %self.id,
            service = %unit.service_name(),
            request = %unit.request_id(),
            ?outcome,
            "state transfer unit received"
        );

        Ok(TransferAck {
            node: self.id.clone(),
            request_id: unit.request_id(),
            outcome: outcome.into(),
        })
    }

    /// Stops serving `name` if the hosted copy is not newer than `epoch`.
    ///
    /// Returns true if the name was torn down.
    pub fn stop(&mut self, name: &ServiceName, epoch: Epoch) -> bool {
        match self.hosted.get(name) {
            Some(hosted) if hosted.epoch <= epoch => {
                self.hosted.remove(name);
                info!(node = %self.id, service = %name, %epoch, "stopped serving");
                true
            }
            Some(hosted) => {
                debug!(
                    node = %self.id,
                    service = %name,
                    hosted = %hosted.epoch,
                    stop = %epoch,
                    "ignoring stop for older epoch"
                );
                false
            }
            None => false,
        }
    }

    /// Drops everything known about `name`, including its ledger entries.
    pub fn forget(&mut self, name: &ServiceName) {
        self.hosted.remove(name);
        self.ledger.forget(name);
    }

    /// Applies an application request to the hosted state and returns the
    /// resulting state as the response.
    pub fn handle_app(&mut self, name: &ServiceName, request: &str) -> Result<String, TransportError> {
        let hosted = self
            .hosted
            .get_mut(name)
            .ok_or_else(|| TransportError::NotServing {
                node: self.id.clone(),
                name: name.clone(),
            })?;
        hosted.state = self.applier.apply(Some(&hosted.state), request);
        Ok(hosted.state.clone())
    }

    pub fn state_of(&self, name: &ServiceName) -> Option<&str> {
        self.hosted.get(name).map(|h| h.state.as_str())
    }

    pub fn epoch_of(&self, name: &ServiceName) -> Option<Epoch> {
        self.hosted.get(name).map(|h| h.epoch)
    }

    pub fn is_serving(&self, name: &ServiceName) -> bool {
        self.hosted.contains_key(name)
    }

    /// Number of times a unit for `name` was actually applied.
    pub fn apply_runs(&self, name: &ServiceName) -> u64 {
        self.apply_runs.get(name).copied().unwrap_or(0)
    }

    pub fn served_names(&self) -> impl Iterator<Item = &ServiceName> {
        self.hosted.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xdn_transfer::ReplaceState;

    fn node() -> ReplicaNode {
        ReplicaNode::new(NodeId::from("n4"), Arc::new(ReplaceState), LedgerConfig::default())
    }

    fn encoded(id: u64, epoch: u64, state: &str) -> String {
        StateTransferUnit::new(
            ServiceName::from("svcA"),
            state,
            RequestId::new(id),
            Epoch::new(epoch),
        )
        .encode()
    }

    #[test]
    fn replayed_unit_is_already_applied() {
        let mut n4 = node();
        let name = ServiceName::from("svcA");

        let first = n4.handle_transfer(&encoded(10, 1, "s1")).unwrap();
        assert_eq!(first.outcome, AckOutcome::Applied);

        let replay = n4.handle_transfer(&encoded(10, 1, "s1")).unwrap();
        assert_eq!(replay.outcome, AckOutcome::AlreadyApplied);

        assert_eq!(n4.apply_runs(&name), 1);
        assert_eq!(n4.state_of(&name), Some("s1"));
    }

    #[test]
    fn foreign_envelope_is_rejected() {
        let mut n4 = node();
        assert!(matches!(
            n4.handle_transfer("VectorTimestamp/AR0:1/"),
            Err(TransportError::Rejected(_))
        ));
        assert!(matches!(
            n4.handle_transfer("xdn:31303:{}"),
            Err(TransportError::Rejected(_))
        ));
    }

    #[test]
    fn stop_ignores_older_epoch() {
        let mut n4 = node();
        let name = ServiceName::from("svcA");
        n4.handle_transfer(&encoded(1, 2, "s")).unwrap();

        assert!(!n4.stop(&name, Epoch::new(1)));
        assert!(n4.is_serving(&name));
        assert!(n4.stop(&name, Epoch::new(2)));
        assert!(!n4.is_serving(&name));
    }

    #[test]
    fn app_requests_need_a_hosted_name() {
        let mut n4 = node();
        let name = ServiceName::from("svcA");
        assert!(matches!(
            n4.handle_app(&name, "x"),
            Err(TransportError::NotServing { .. })
        ));

        n4.handle_transfer(&encoded(1, 0, "s")).unwrap();
        assert_eq!(n4.handle_app(&name, "x").unwrap(), "x");
        assert_eq!(n4.epoch_of(&name), Some(Epoch::ZERO));
    }
}
