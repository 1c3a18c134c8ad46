//! In-process composition of a coordinator, its cluster, and its clients.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use xdn_clock::VectorClock;
use xdn_reconfig::{Coordinator, CoordinatorConfig, LocalConsensus, MemoryCluster, NetworkFaults};
use xdn_transfer::ReplaceState;
use xdn_types::{NodeGroup, NodeId, RequestIdGenerator, node_set};

use crate::{
    client::{CallbackRegistry, Client, ClientConfig},
    error::{ClientError, ClientResult},
    message::{Request, Response},
};

/// A client of the in-process cluster.
pub type LocalClient = Client<LocalConsensus, MemoryCluster>;

// ============================================================================
// Cluster Spec
// ============================================================================

/// Description of an in-process cluster and an optional request script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    /// Seed for fault injection.
    pub seed: u64,
    pub active_nodes: Vec<NodeId>,
    pub reconfigurators: Vec<NodeId>,
    pub coordinator: CoordinatorConfig,
    pub client: ClientConfig,
    /// Probability that a message between coordinator and node is lost.
    pub drop_probability: f64,
    /// Requests to run in order.
    pub script: Vec<Request>,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            seed: 0,
            active_nodes: ["AR0", "AR1", "AR2"].into_iter().map(NodeId::from).collect(),
            reconfigurators: ["RC0", "RC1", "RC2"].into_iter().map(NodeId::from).collect(),
            coordinator: CoordinatorConfig::simulation(),
            client: ClientConfig::simulation(),
            drop_probability: 0.0,
            script: Vec::new(),
        }
    }
}

impl ClusterSpec {
    pub fn from_json(json: &str) -> ClientResult<Self> {
        let spec: Self =
            serde_json::from_str(json).map_err(|e| ClientError::InvalidSpec(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.reconfigurators.is_empty() {
            return Err(ClientError::InvalidSpec(format!(
                "no {} configured",
                NodeGroup::Reconfigurators
            )));
        }
        if let Some(node) = self
            .active_nodes
            .iter()
            .find(|n| self.reconfigurators.contains(*n))
        {
            return Err(ClientError::InvalidSpec(format!(
                "{node} is listed as both an active replica and a reconfigurator"
            )));
        }
        if let Some(node) = self
            .reconfigurators
            .iter()
            .find(|n| !VectorClock::accepts_node(n.as_str()))
        {
            return Err(ClientError::InvalidSpec(format!(
                "reconfigurator id {node} must not contain ':' '.' or '/'"
            )));
        }
        if !(0.0..=1.0).contains(&self.drop_probability) {
            return Err(ClientError::InvalidSpec(format!(
                "drop probability {} is not in [0, 1]",
                self.drop_probability
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// One result of a scripted run.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub request: Request,
    pub outcome: ClientResult<Response>,
}

/// Owns a cluster, its coordinator, and the callback registry every client
/// of this harness shares.
#[derive(Debug)]
pub struct Harness {
    spec: ClusterSpec,
    cluster: MemoryCluster,
    coordinator: Arc<Coordinator<LocalConsensus, MemoryCluster>>,
    registry: Arc<CallbackRegistry>,
    request_ids: Arc<RequestIdGenerator>,
}

impl Harness {
    pub fn new(spec: ClusterSpec) -> ClientResult<Self> {
        spec.validate()?;

        let cluster = MemoryCluster::with_applier(
            spec.seed,
            Arc::new(ReplaceState),
            spec.coordinator.ledger(),
        );
        cluster.add_nodes(spec.active_nodes.iter().cloned());
        cluster.add_nodes(spec.reconfigurators.iter().cloned());
        cluster.set_faults(NetworkFaults::lossy(spec.drop_probability));

        let coordinator_id = spec.reconfigurators[0].clone();
        let coordinator = Coordinator::new(
            coordinator_id,
            spec.coordinator,
            LocalConsensus::new(),
            cluster.clone(),
            node_set(spec.active_nodes.iter().cloned()),
            node_set(spec.reconfigurators.iter().cloned()),
        );

        info!(
            active = spec.active_nodes.len(),
            reconfigurators = spec.reconfigurators.len(),
            seed = spec.seed,
            "harness started"
        );

        Ok(Self {
            spec,
            cluster,
            coordinator: Arc::new(coordinator),
            registry: Arc::new(CallbackRegistry::new()),
            request_ids: Arc::new(RequestIdGenerator::starting_at(1)),
        })
    }

    /// A new client sharing this harness's registry.
    pub fn client(&self) -> LocalClient {
        Client::new(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.registry),
            Arc::clone(&self.request_ids),
            self.spec.client,
        )
    }

    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    pub fn coordinator(&self) -> &Coordinator<LocalConsensus, MemoryCluster> {
        &self.coordinator
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Starts nodes so they can be added to a pool later.
    pub fn start_nodes<I, N>(&self, ids: I)
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        self.cluster.add_nodes(ids);
    }

    /// Runs the configured script with one client, in order.
    ///
    /// Nodes a request adds are started before the request is sent. A failed
    /// step does not stop the script.
    pub async fn run_script(&self) -> Vec<ScriptStep> {
        let client = self.client();
        let mut steps = Vec::with_capacity(self.spec.script.len());
        for request in &self.spec.script {
            match request {
                Request::NodeConfig { add, .. } => self.start_nodes(add.iter().cloned()),
                Request::Reconfigure { change } => self.start_nodes(change.add.iter().cloned()),
                _ => {}
            }
            let outcome = client.request(request.clone()).await;
            steps.push(ScriptStep {
                request: request.clone(),
                outcome,
            });
        }
        steps
    }
}
