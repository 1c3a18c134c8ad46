//! The delivery seam between the coordinator and the nodes.
//!
//! The coordinator talks to nodes only through [`Transport`]. Every call may
//! fail or never resolve; the coordinator bounds each call with a timeout and
//! retries where the protocol allows it.
//!
//! [`MemoryCluster`] hosts [`ReplicaNode`]s in process and injects faults:
//!
//! - nodes can be marked down (calls fail fast with `Unreachable`)
//! - transfers to a node can be held until released
//! - requests and acknowledgments can be lost with a seeded probability
//!   (a lost message never resolves, exactly like a silent network)
//!
//! Stop messages are never lost; only down nodes miss them.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rand::{Rng, SeedableRng, rngs::SmallRng};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace};
use xdn_transfer::{LedgerConfig, ReplaceState, StateApplier};
use xdn_types::{Epoch, NodeId, ServiceName};

use crate::replica::{ReplicaNode, TransferAck};

// ============================================================================
// Transport Trait
// ============================================================================

/// Errors surfaced by a transport call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The node cannot be reached.
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    /// The node does not serve the name.
    #[error("node {node} does not serve {name}")]
    NotServing { node: NodeId, name: ServiceName },

    /// The node refused the message.
    #[error("rejected: {0}")]
    Rejected(String),

    /// No reply arrived in time.
    #[error("no reply from {0} in time")]
    TimedOut(NodeId),
}

/// Why a node is told to stop serving a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// The node left the name's membership; its ledger is kept.
    Handover,
    /// The name was deleted; everything about it is dropped.
    Delete,
}

/// Message delivery to individual nodes.
pub trait Transport: Send + Sync {
    /// Delivers an encoded state transfer unit and waits for its acknowledgment.
    fn send_transfer(
        &self,
        to: &NodeId,
        encoded_unit: String,
    ) -> impl Future<Output = Result<TransferAck, TransportError>> + Send;

    /// Reads the current state a node holds for `name`.
    fn fetch_state(
        &self,
        from: &NodeId,
        name: &ServiceName,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Tells a node to stop serving `name` as of `epoch`.
    fn send_stop(
        &self,
        to: &NodeId,
        name: &ServiceName,
        epoch: Epoch,
        kind: StopKind,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Forwards an opaque application request and waits for the response.
    fn forward_app(
        &self,
        to: &NodeId,
        name: &ServiceName,
        request: String,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;
}

// ============================================================================
// Network Faults
// ============================================================================

/// Probabilities of silent message loss in a [`MemoryCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NetworkFaults {
    /// Probability that a request never reaches the node (0.0 to 1.0).
    pub drop_probability: f64,
    /// Probability that a delivered request's reply is lost (0.0 to 1.0).
    pub ack_drop_probability: f64,
}

impl NetworkFaults {
    /// No loss.
    pub fn reliable() -> Self {
        Self::default()
    }

    /// Loses requests and replies with the same probability.
    pub fn lossy(probability: f64) -> Self {
        Self {
            drop_probability: probability,
            ack_drop_probability: probability,
        }
    }
}

// ============================================================================
// Memory Cluster
// ============================================================================

enum Delivery<T> {
    Delivered(T),
    Lost,
}

struct ClusterInner {
    nodes: BTreeMap<NodeId, ReplicaNode>,
    down: HashSet<NodeId>,
    gates: HashMap<NodeId, watch::Sender<bool>>,
    faults: NetworkFaults,
    rng: SmallRng,
    transfers_sent: HashMap<NodeId, u64>,
}

impl ClusterInner {
    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.r#gen::<f64>() < probability
    }

    /// Runs `handle` on a reachable node, subject to request and reply loss.
    fn deliver<T>(
        &mut self,
        to: &NodeId,
        handle: impl FnOnce(&mut ReplicaNode) -> Result<T, TransportError>,
    ) -> Result<Delivery<Result<T, TransportError>>, TransportError> {
        if self.down.contains(to) {
            return Err(TransportError::Unreachable(to.clone()));
        }
        if self.roll(self.faults.drop_probability) {
            trace!(node = %to, "request lost");
            return Ok(Delivery::Lost);
        }
        let node = self
            .nodes
            .get_mut(to)
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
        let reply = handle(node);
        if self.roll(self.faults.ack_drop_probability) {
            trace!(node = %to, "reply lost");
            return Ok(Delivery::Lost);
        }
        Ok(Delivery::Delivered(reply))
    }
}

/// In-process nodes behind a fault-injecting [`Transport`].
///
/// Cloning yields another handle to the same cluster.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Mutex<ClusterInner>>,
    applier: Arc<dyn StateApplier>,
    ledger: LedgerConfig,
}

impl std::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryCluster")
            .field("nodes", &inner.nodes.keys().collect::<Vec<_>>())
            .field("down", &inner.down)
            .field("faults", &inner.faults)
            .finish_non_exhaustive()
    }
}

impl MemoryCluster {
    /// Creates an empty, reliable cluster whose nodes replace state on apply.
    pub fn new(seed: u64) -> Self {
        Self::with_applier(seed, Arc::new(ReplaceState), LedgerConfig::default())
    }

    pub fn with_applier(seed: u64, applier: Arc<dyn StateApplier>, ledger: LedgerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClusterInner {
                nodes: BTreeMap::new(),
                down: HashSet::new(),
                gates: HashMap::new(),
                faults: NetworkFaults::reliable(),
                rng: SmallRng::seed_from_u64(seed),
                transfers_sent: HashMap::new(),
            })),
            applier,
            ledger,
        }
    }

    /// Adds nodes; ids that already exist are left untouched.
    pub fn add_nodes<I, N>(&self, ids: I)
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let mut inner = self.lock();
        for id in ids {
            let id = id.into();
            if !inner.nodes.contains_key(&id) {
                let node = ReplicaNode::new(id.clone(), Arc::clone(&self.applier), self.ledger);
                inner.nodes.insert(id, node);
            }
        }
    }

    pub fn set_faults(&self, faults: NetworkFaults) {
        self.lock().faults = faults;
    }

    /// Marks a node down or back up.
    pub fn set_down(&self, id: &NodeId, down: bool) {
        let mut inner = self.lock();
        if down {
            inner.down.insert(id.clone());
        } else {
            inner.down.remove(id);
        }
    }

    /// Holds transfers to `id` until [`release`](Self::release) is called.
    pub fn hold(&self, id: &NodeId) {
        let (sender, _) = watch::channel(false);
        self.lock().gates.insert(id.clone(), sender);
    }

    /// Releases transfers held for `id`.
    pub fn release(&self, id: &NodeId) {
        if let Some(gate) = self.lock().gates.remove(id) {
            gate.send_replace(true);
        }
    }

    /// Inspects a node.
    pub fn with_node<R>(&self, id: &NodeId, inspect: impl FnOnce(&ReplicaNode) -> R) -> Option<R> {
        self.lock().nodes.get(id).map(inspect)
    }

    /// Nodes currently serving `name`.
    pub fn serving(&self, name: &ServiceName) -> Vec<NodeId> {
        self.lock()
            .nodes
            .values()
            .filter(|node| node.is_serving(name))
            .map(|node| node.id().clone())
            .collect()
    }

    /// Transfer sends attempted towards `id`, including lost ones.
    pub fn transfers_sent(&self, id: &NodeId) -> u64 {
        self.lock().transfers_sent.get(id).copied().unwrap_or(0)
    }

    fn gate(&self, id: &NodeId) -> Option<watch::Receiver<bool>> {
        self.lock().gates.get(id).map(watch::Sender::subscribe)
    }

    fn lock(&self) -> MutexGuard<'_, ClusterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn resolve<T>(
    delivery: Result<Delivery<Result<T, TransportError>>, TransportError>,
) -> Result<T, TransportError> {
    match delivery? {
        Delivery::Delivered(reply) => reply,
        Delivery::Lost => std::future::pending().await,
    }
}

impl Transport for MemoryCluster {
    fn send_transfer(
        &self,
        to: &NodeId,
        encoded_unit: String,
    ) -> impl Future<Output = Result<TransferAck, TransportError>> + Send {
        async move {
            if let Some(mut gate) = self.gate(to) {
                debug!(node = %to, "transfer held");
                // A dropped gate counts as released.
                let _released = gate.wait_for(|open| *open).await.is_ok();
            }

            let delivery = {
                let mut inner = self.lock();
                *inner.transfers_sent.entry(to.clone()).or_default() += 1;
                inner.deliver(to, |node| node.handle_transfer(&encoded_unit))
            };
            resolve(delivery).await
        }
    }

    fn fetch_state(
        &self,
        from: &NodeId,
        name: &ServiceName,
    ) -> impl Future<Output = Result<String, TransportError>> + Send {
        async move {
            let delivery = self.lock().deliver(from, |node| {
                node.state_of(name)
                    .map(str::to_string)
                    .ok_or_else(|| TransportError::NotServing {
                        node: from.clone(),
                        name: name.clone(),
                    })
            });
            resolve(delivery).await
        }
    }

    fn send_stop(
        &self,
        to: &NodeId,
        name: &ServiceName,
        epoch: Epoch,
        kind: StopKind,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let result = {
            let mut inner = self.lock();
            if inner.down.contains(to) {
                Err(TransportError::Unreachable(to.clone()))
            } else if let Some(node) = inner.nodes.get_mut(to) {
                let stopped = node.stop(name, epoch);
                if kind == StopKind::Delete && stopped {
                    node.forget(name);
                }
                Ok(())
            } else {
                Err(TransportError::Unreachable(to.clone()))
            }
        };
        std::future::ready(result)
    }

    fn forward_app(
        &self,
        to: &NodeId,
        name: &ServiceName,
        request: String,
    ) -> impl Future<Output = Result<String, TransportError>> + Send {
        async move {
            let delivery = self
                .lock()
                .deliver(to, |node| node.handle_app(name, &request));
            resolve(delivery).await
        }
    }
}
