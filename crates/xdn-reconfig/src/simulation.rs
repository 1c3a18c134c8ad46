//! Randomized membership churn over a lossy in-memory cluster.
//!
//! Each run is driven by a seeded [`SmallRng`] and paused tokio time, so a
//! failing seed replays exactly. After every operation the harness checks:
//!
//! - a successful change moves the epoch forward by exactly one
//! - a failed change leaves the record untouched
//! - no name is ever left without active replicas
//! - removed members stop serving, added members hold the current state
//! - an added member applies exactly one unit per successful change
//! - causal stamps of successive decisions strictly increase

use std::collections::HashMap;

use rand::{Rng, SeedableRng, rngs::SmallRng, seq::IteratorRandom};
use xdn_clock::VectorClock;
use xdn_types::{NodeGroup, NodeId, NodeSet, RequestIdGenerator, ServiceName, node_set};

use crate::{
    Coordinator, CoordinatorConfig, Lifecycle, LocalConsensus, MembershipChange, MemoryCluster,
    NetworkFaults, ServiceRecord,
};

const POOL: [&str; 6] = ["n1", "n2", "n3", "n4", "n5", "n6"];
const RECONFIGURATORS: [&str; 3] = ["RC0", "RC1", "RC2"];
const NAMES: usize = 4;

struct Simulation {
    rng: SmallRng,
    cluster: MemoryCluster,
    coordinator: Coordinator<LocalConsensus, MemoryCluster>,
    stamps: HashMap<ServiceName, VectorClock>,
    succeeded: usize,
    failed: usize,
}

impl Simulation {
    async fn new(seed: u64, drop_probability: f64) -> Self {
        let cluster = MemoryCluster::new(seed);
        cluster.add_nodes(POOL);
        cluster.add_nodes(RECONFIGURATORS);

        let coordinator = Coordinator::new(
            NodeId::from("RC0"),
            CoordinatorConfig::simulation(),
            LocalConsensus::new(),
            cluster.clone(),
            node_set(POOL),
            node_set(RECONFIGURATORS),
        )
        .with_request_ids(RequestIdGenerator::starting_at(seed.wrapping_mul(1_000)));

        let mut stamps = HashMap::new();
        for i in 0..NAMES {
            let name = ServiceName::new(format!("svc{i}"));
            let ack = coordinator
                .create(name.clone(), initial_state(&name))
                .await
                .expect("create over a reliable network");
            stamps.insert(name, ack.stamp);
        }
        cluster.set_faults(NetworkFaults::lossy(drop_probability));

        Self {
            rng: SmallRng::seed_from_u64(seed),
            cluster,
            coordinator,
            stamps,
            succeeded: 0,
            failed: 0,
        }
    }

    fn random_change(&mut self) -> MembershipChange {
        let name = ServiceName::new(format!("svc{}", self.rng.gen_range(0..NAMES)));
        let record = self.coordinator.record(&name).expect("simulated names stay active");

        let outsider = node_set(POOL)
            .difference(&record.active)
            .cloned()
            .choose(&mut self.rng);
        let member: NodeSet = record.active.iter().cloned().choose(&mut self.rng).into_iter().collect();

        let (add, remove) = match (outsider, self.rng.gen_range(0..3)) {
            (Some(node), 0) => (NodeSet::from([node]), NodeSet::new()),
            (Some(node), 1) => (NodeSet::from([node]), member),
            (_, _) if record.active.len() > 1 => (NodeSet::new(), member),
            (outsider, _) => (outsider.into_iter().collect(), NodeSet::new()),
        };

        MembershipChange::new(name, NodeGroup::ActiveReplicas, add, remove)
    }

    fn apply_runs(&self, name: &ServiceName, nodes: &NodeSet) -> HashMap<NodeId, u64> {
        nodes
            .iter()
            .map(|node| {
                let runs = self.cluster.with_node(node, |n| n.apply_runs(name));
                (node.clone(), runs.unwrap_or(0))
            })
            .collect()
    }

    async fn step(&mut self) {
        let change = self.random_change();
        let name = change.name.clone();
        let before = self.coordinator.record(&name).expect("record before change");
        let runs_before = self.apply_runs(&name, &change.add);

        match self.coordinator.reconfigure(change.clone()).await {
            Ok(ack) => {
                self.succeeded += 1;
                self.check_success(&before, &change, &ack.record, &runs_before);

                let previous = self.stamps.insert(name.clone(), ack.stamp.clone());
                if let Some(previous) = previous {
                    assert!(previous.is_less_than(&ack.stamp), "stamps must increase");
                }
            }
            Err(error) => {
                self.failed += 1;
                assert!(
                    error.is_retryable(),
                    "valid change failed permanently: {error}"
                );
                let after = self.coordinator.record(&name).expect("record after failure");
                assert_eq!(after, before, "failed change must not alter the record");
                for (node, runs) in self.apply_runs(&name, &change.add) {
                    assert!(runs - runs_before[&node] <= 1, "{node} applied twice");
                }
            }
        }

        assert_eq!(
            self.coordinator.lifecycle(&name),
            Lifecycle::Active,
            "{name} must settle back to ACTIVE"
        );
    }

    fn check_success(
        &self,
        before: &ServiceRecord,
        change: &MembershipChange,
        after: &ServiceRecord,
        runs_before: &HashMap<NodeId, u64>,
    ) {
        let name = &change.name;
        assert_eq!(after.epoch, before.epoch.next(), "epoch must advance by one");
        assert!(!after.active.is_empty(), "{name} left without replicas");

        let serving = self.cluster.serving(name);
        for node in &change.remove {
            assert!(!serving.contains(node), "{node} still serves {name}");
        }
        for node in &change.add {
            let runs = self.apply_runs(name, &NodeSet::from([node.clone()]))[node];
            assert_eq!(runs - runs_before[node], 1, "{node} must apply exactly once");
            let epoch = self.cluster.with_node(node, |n| n.epoch_of(name)).flatten();
            assert_eq!(epoch, Some(after.epoch));
        }
        let expected = initial_state(name);
        for node in &after.active {
            let state = self
                .cluster
                .with_node(node, |n| n.state_of(name).map(str::to_string))
                .flatten();
            assert_eq!(state.as_deref(), Some(expected.as_str()), "{node} lost state of {name}");
        }
    }
}

fn initial_state(name: &ServiceName) -> String {
    format!("state-of-{name}")
}

async fn run(seed: u64, drop_probability: f64, steps: usize) -> (usize, usize) {
    let mut sim = Simulation::new(seed, drop_probability).await;
    for _ in 0..steps {
        sim.step().await;
    }
    (sim.succeeded, sim.failed)
}

#[tokio::test(start_paused = true)]
async fn churn_on_reliable_network_always_succeeds() {
    for seed in 0..8 {
        let (succeeded, failed) = run(seed, 0.0, 40).await;
        assert_eq!(failed, 0, "seed {seed}");
        assert_eq!(succeeded, 40);
    }
}

#[tokio::test(start_paused = true)]
async fn churn_on_lossy_network_keeps_invariants() {
    for seed in 0..8 {
        let (succeeded, _failed) = run(seed, 0.15, 60).await;
        assert!(succeeded > 0, "seed {seed} made no progress");
    }
}

#[tokio::test(start_paused = true)]
async fn churn_on_very_lossy_network_keeps_invariants() {
    run(99, 0.5, 40).await;
}
