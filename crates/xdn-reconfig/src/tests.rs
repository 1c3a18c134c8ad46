//! Coordinator tests against an in-memory cluster.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use xdn_clock::CausalOrdering;
use xdn_types::{Epoch, NodeGroup, NodeId, NodeSet, RequestId, RequestIdGenerator, ServiceName, node_set};

use crate::*;

const RCS: [&str; 3] = ["RC0", "RC1", "RC2"];

type TestCoordinator<T = MemoryCluster> = Coordinator<LocalConsensus, T>;

fn cluster(active: &[&str]) -> MemoryCluster {
    let cluster = MemoryCluster::new(42);
    cluster.add_nodes(active.iter().copied());
    cluster.add_nodes(RCS);
    cluster
}

fn coordinator_over<T: Transport>(transport: T, pool: &[&str], config: CoordinatorConfig) -> TestCoordinator<T> {
    Coordinator::new(
        NodeId::from("RC0"),
        config,
        LocalConsensus::new(),
        transport,
        node_set(pool.iter().copied()),
        node_set(RCS),
    )
    .with_request_ids(RequestIdGenerator::starting_at(1))
}

fn coordinator(cluster: &MemoryCluster, pool: &[&str]) -> TestCoordinator {
    coordinator_over(cluster.clone(), pool, CoordinatorConfig::simulation())
}

/// Simulation timings, but patient enough for a test to inspect a held transfer.
fn patient() -> CoordinatorConfig {
    CoordinatorConfig::simulation().with_timeouts(TimeoutConfig {
        ack_timeout: Duration::from_secs(30),
        ..TimeoutConfig::simulation()
    })
}

fn name(s: &str) -> ServiceName {
    ServiceName::from(s)
}

fn id(s: &str) -> NodeId {
    NodeId::from(s)
}

fn change(svc: &str, add: &[&str], remove: &[&str]) -> MembershipChange {
    MembershipChange::new(
        name(svc),
        NodeGroup::ActiveReplicas,
        node_set(add.iter().copied()),
        node_set(remove.iter().copied()),
    )
}

async fn wait_for_lifecycle<T: Transport>(
    coordinator: &TestCoordinator<T>,
    svc: &ServiceName,
    expected: Lifecycle,
) {
    for _ in 0..1_000 {
        if coordinator.lifecycle(svc) == expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("{svc} never reached {expected}");
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn create_places_name_and_installs_state() {
    let cluster = cluster(&["n1", "n2", "n3"]);
    let coordinator = coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("svcA");

    let ack = coordinator.create(svc.clone(), "init".into()).await.unwrap();

    assert_eq!(ack.record.epoch, Epoch::ZERO);
    assert_eq!(ack.record.active, node_set(["n1", "n2", "n3"]));
    assert_eq!(ack.record.reconfigurators, node_set(RCS));
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Active);

    for node in ["n1", "n2", "n3"] {
        let state = cluster.with_node(&id(node), |n| n.state_of(&svc).map(str::to_string));
        assert_eq!(state.flatten().as_deref(), Some("init"));
    }
    // Reconfigurators hold the record itself.
    let stored = cluster
        .with_node(&id("RC1"), |n| n.state_of(&svc).map(str::to_string))
        .flatten()
        .unwrap();
    let record: ServiceRecord = serde_json::from_str(&stored).unwrap();
    assert_eq!(record, ack.record);
}

#[tokio::test]
async fn create_respects_replication_factor() {
    let cluster = cluster(&["n1", "n2", "n3", "n4", "n5"]);
    let coordinator = coordinator_over(
        cluster.clone(),
        &["n1", "n2", "n3", "n4", "n5"],
        CoordinatorConfig::simulation().with_replication(2, 1),
    );

    let ack = coordinator.create(name("svcA"), "s".into()).await.unwrap();
    assert_eq!(ack.record.active.len(), 2);
    assert_eq!(ack.record.reconfigurators.len(), 1);
    assert_eq!(cluster.serving(&name("svcA")).len(), 3);
}

#[tokio::test]
async fn create_existing_name_fails() {
    let cluster = cluster(&["n1"]);
    let coordinator = coordinator(&cluster, &["n1"]);

    coordinator.create(name("svcA"), "s".into()).await.unwrap();
    assert_eq!(
        coordinator.create(name("svcA"), "t".into()).await,
        Err(ReconfigError::AlreadyExists(name("svcA")))
    );
}

#[tokio::test]
async fn create_with_empty_pool_has_no_capacity() {
    let cluster = cluster(&[]);
    let coordinator = coordinator(&cluster, &[]);

    assert_eq!(
        coordinator.create(name("svcA"), "s".into()).await,
        Err(ReconfigError::NoCapacity(NodeGroup::ActiveReplicas))
    );
    assert_eq!(coordinator.lifecycle(&name("svcA")), Lifecycle::Absent);
}

#[tokio::test]
async fn undecided_create_leaves_name_absent() {
    let cluster = cluster(&["n1", "n2"]);
    let coordinator = coordinator(&cluster, &["n1", "n2"]);
    let svc = name("svcA");
    coordinator.consensus().fail_next(1);

    let result = coordinator.create(svc.clone(), "s".into()).await;
    assert!(matches!(
        result,
        Err(ReconfigError::Consensus(ConsensusError::Unavailable(_)))
    ));
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Absent);
    assert!(cluster.serving(&svc).is_empty());

    // Nothing was decided, so the name is free.
    coordinator.create(svc.clone(), "s".into()).await.unwrap();
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Active);
}

#[tokio::test]
async fn create_fails_when_a_replica_is_down() {
    let cluster = cluster(&["n1", "n2"]);
    cluster.set_down(&id("n2"), true);
    let coordinator = coordinator(&cluster, &["n1", "n2"]);
    let svc = name("svcA");

    let result = coordinator.create(svc.clone(), "s".into()).await;
    assert!(matches!(result, Err(ReconfigError::TransferFailure { .. })));
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Absent);
    assert!(cluster.serving(&svc).is_empty());
    assert!(coordinator.consensus().is_empty());
}

#[tokio::test]
async fn batch_create_reports_each_name() {
    let cluster = cluster(&["n1", "n2", "n3"]);
    let coordinator = coordinator(&cluster, &["n1", "n2", "n3"]);
    coordinator.create(name("taken"), "s".into()).await.unwrap();
    let decisions_before = coordinator.consensus().len();

    let results = coordinator
        .create_batch(vec![
            (name("a"), "sa".into()),
            (name("taken"), "x".into()),
            (name("b"), "sb".into()),
        ])
        .await;

    let names: Vec<_> = results.iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, vec![name("a"), name("taken"), name("b")]);
    assert_eq!(results[1].1, Err(ReconfigError::AlreadyExists(name("taken"))));

    let a = results[0].1.as_ref().unwrap();
    let b = results[2].1.as_ref().unwrap();
    assert_eq!(a.record.reconfigurators, b.record.reconfigurators);

    // One decision for the whole batch.
    assert_eq!(coordinator.consensus().len(), decisions_before + 1);
    assert_eq!(coordinator.lifecycle(&name("a")), Lifecycle::Active);
    assert_eq!(coordinator.lifecycle(&name("b")), Lifecycle::Active);
}

#[tokio::test]
async fn batch_failure_does_not_roll_back_other_names() {
    let cluster = cluster(&["n1", "n2", "n3"]);
    let coordinator = coordinator_over(
        cluster.clone(),
        &["n1", "n2", "n3"],
        CoordinatorConfig::simulation().with_replication(1, 3),
    );

    // Find a name that lands on n3, then take n3 down.
    let doomed = (0..)
        .map(|i| name(&format!("svc{i}")))
        .find(|n| placement::place(n, &node_set(["n1", "n2", "n3"]), 1) == node_set(["n3"]))
        .unwrap();
    let healthy = (0..)
        .map(|i| name(&format!("svc{i}")))
        .find(|n| placement::place(n, &node_set(["n1", "n2", "n3"]), 1) == node_set(["n1"]))
        .unwrap();
    cluster.set_down(&id("n3"), true);

    let results = coordinator
        .create_batch(vec![(doomed.clone(), "s".into()), (healthy.clone(), "s".into())])
        .await;

    assert!(matches!(results[0].1, Err(ReconfigError::TransferFailure { .. })));
    assert!(results[1].1.is_ok());
    assert_eq!(coordinator.lifecycle(&doomed), Lifecycle::Absent);
    assert_eq!(coordinator.lifecycle(&healthy), Lifecycle::Active);
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn deleted_name_is_not_found() {
    let cluster = cluster(&["n1", "n2", "n3"]);
    let coordinator = coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("svcA");

    coordinator.create(svc.clone(), "state".into()).await.unwrap();
    assert_eq!(
        coordinator.active_replicas(&svc).unwrap(),
        node_set(["n1", "n2", "n3"])
    );

    coordinator.delete(svc.clone()).await.unwrap();

    assert_eq!(
        coordinator.active_replicas(&svc),
        Err(ReconfigError::NotFound(svc.clone()))
    );
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Deleted);
    assert!(cluster.serving(&svc).is_empty());
}

#[tokio::test]
async fn deleted_name_is_tombstoned() {
    let cluster = cluster(&["n1"]);
    let coordinator = coordinator(&cluster, &["n1"]);
    let svc = name("svcA");

    coordinator.create(svc.clone(), "s".into()).await.unwrap();
    coordinator.delete(svc.clone()).await.unwrap();

    assert_eq!(
        coordinator.create(svc.clone(), "s".into()).await,
        Err(ReconfigError::Tombstoned {
            name: svc.clone(),
            epoch: Epoch::ZERO
        })
    );
    assert_eq!(
        coordinator.delete(svc.clone()).await,
        Err(ReconfigError::NotFound(svc.clone()))
    );
    assert_eq!(
        coordinator.reconfigure(change("svcA", &["n1"], &[])).await,
        Err(ReconfigError::NotFound(svc))
    );
}

#[tokio::test]
async fn absent_name_is_not_found() {
    let cluster = cluster(&["n1"]);
    let coordinator = coordinator(&cluster, &["n1"]);
    let svc = name("ghost");

    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Absent);
    assert_eq!(
        coordinator.active_replicas(&svc),
        Err(ReconfigError::NotFound(svc.clone()))
    );
    assert_eq!(
        coordinator.delete(svc.clone()).await,
        Err(ReconfigError::NotFound(svc))
    );
}

#[tokio::test]
async fn undecided_delete_keeps_name_active() {
    let cluster = cluster(&["n1"]);
    let coordinator = coordinator(&cluster, &["n1"]);
    let svc = name("svcA");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();
    coordinator.consensus().fail_next(1);

    assert!(coordinator.delete(svc.clone()).await.is_err());
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Active);
    assert_eq!(cluster.serving(&svc), vec![id("RC0"), id("RC1"), id("RC2"), id("n1")]);
}

// ============================================================================
// Membership Change
// ============================================================================

#[tokio::test]
async fn node_config_change_migrates_name() {
    let cluster = cluster(&["n1", "n2", "n3", "n4"]);
    let coordinator = Arc::new(coordinator_over(
        cluster.clone(),
        &["n1", "n2", "n3"],
        patient(),
    ));
    let svc = name("n");
    let n4 = id("n4");

    coordinator.create(svc.clone(), "state-0".into()).await.unwrap();
    cluster.hold(&n4);

    let in_flight = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move {
            coordinator
                .reconfigure_node_config(
                    NodeGroup::ActiveReplicas,
                    node_set(["n4"]),
                    node_set(["n1"]),
                )
                .await
        }
    });

    wait_for_lifecycle(&coordinator, &svc, Lifecycle::Reconfiguring).await;
    let pending = coordinator.pending_change(&svc).unwrap();
    assert_eq!(pending.add, node_set(["n4"]));
    assert_eq!(pending.remove, node_set(["n1"]));
    // Nothing is committed while the transfer is outstanding.
    assert_eq!(coordinator.record(&svc).unwrap().epoch, Epoch::ZERO);
    assert!(cluster.serving(&svc).contains(&id("n1")));

    cluster.release(&n4);
    let ack = in_flight.await.unwrap().unwrap();

    assert!(!ack.is_failed());
    assert_eq!(ack.migrated, vec![svc.clone()]);
    assert_eq!(ack.pool, node_set(["n2", "n3", "n4"]));
    assert!(ack.summary.contains("migrated 1 name(s), 0 failed"));

    let record = coordinator.record(&svc).unwrap();
    assert_eq!(record.epoch, Epoch::new(1));
    assert_eq!(record.active, node_set(["n2", "n3", "n4"]));
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Active);

    assert_eq!(cluster.with_node(&n4, |n| n.apply_runs(&svc)), Some(1));
    assert_eq!(
        cluster.with_node(&n4, |n| n.state_of(&svc).map(str::to_string)).flatten().as_deref(),
        Some("state-0")
    );
    assert!(!cluster.serving(&svc).contains(&id("n1")));
    assert_eq!(coordinator.pool(NodeGroup::ActiveReplicas), node_set(["n2", "n3", "n4"]));
}

#[tokio::test]
async fn second_change_conflicts_until_first_resolves() {
    let cluster = cluster(&["n1", "n2", "n3", "n4", "n5"]);
    let coordinator = Arc::new(coordinator_over(
        cluster.clone(),
        &["n1", "n2", "n3", "n4", "n5"],
        patient(),
    ));
    let svc = name("n");

    let created = coordinator.create(svc.clone(), "s".into()).await.unwrap();
    let outsiders: Vec<NodeId> = coordinator
        .pool(NodeGroup::ActiveReplicas)
        .difference(&created.record.active)
        .cloned()
        .collect();
    let [first_add, second_add] = [outsiders[0].clone(), outsiders[1].clone()];
    let member = created.record.active.iter().next().unwrap().clone();
    cluster.hold(&first_add);

    let first = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        let change = MembershipChange::new(
            svc.clone(),
            NodeGroup::ActiveReplicas,
            NodeSet::from([first_add.clone()]),
            NodeSet::from([member]),
        );
        async move { coordinator.reconfigure(change).await }
    });
    wait_for_lifecycle(&coordinator, &svc, Lifecycle::Reconfiguring).await;

    let second = MembershipChange::new(
        svc.clone(),
        NodeGroup::ActiveReplicas,
        NodeSet::from([second_add.clone()]),
        NodeSet::new(),
    );
    let conflict = coordinator.reconfigure(second.clone()).await;
    assert!(matches!(
        conflict,
        Err(ReconfigError::ReconfigurationConflict { ref name, .. }) if name == &svc
    ));
    assert!(conflict.unwrap_err().is_retryable());

    cluster.release(&first_add);
    assert_eq!(first.await.unwrap().unwrap().record.epoch, Epoch::new(1));

    let ack = coordinator.reconfigure(second).await.unwrap();
    assert_eq!(ack.record.epoch, Epoch::new(2));
    assert!(ack.record.active.contains(&second_add));
    assert!(ack.record.active.contains(&first_add));
}

#[tokio::test]
async fn concurrent_node_config_changes_conflict() {
    let cluster = cluster(&["n1", "n2", "n3", "n4", "n5"]);
    let coordinator = Arc::new(coordinator_over(
        cluster.clone(),
        &["n1", "n2", "n3"],
        patient(),
    ));
    coordinator.create(name("n"), "s".into()).await.unwrap();
    cluster.hold(&id("n4"));

    let first = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move {
            coordinator
                .reconfigure_node_config(NodeGroup::ActiveReplicas, node_set(["n4"]), node_set(["n1"]))
                .await
        }
    });
    wait_for_lifecycle(&coordinator, &name("n"), Lifecycle::Reconfiguring).await;

    let second = coordinator
        .reconfigure_node_config(NodeGroup::ActiveReplicas, node_set(["n5"]), NodeSet::new())
        .await;
    assert_eq!(
        second.unwrap_err(),
        ReconfigError::NodeConfigConflict(NodeGroup::ActiveReplicas)
    );

    cluster.release(&id("n4"));
    assert!(!first.await.unwrap().unwrap().is_failed());

    let retried = coordinator
        .reconfigure_node_config(NodeGroup::ActiveReplicas, node_set(["n5"]), NodeSet::new())
        .await
        .unwrap();
    assert!(!retried.is_failed());
    assert!(retried.pool.contains(&id("n5")));
    assert_eq!(coordinator.record(&name("n")).unwrap().epoch, Epoch::new(1));
}

#[tokio::test]
async fn transfer_failure_restores_membership() {
    let cluster = cluster(&["n1", "n2", "n3", "n4"]);
    let coordinator = coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();
    cluster.set_down(&id("n4"), true);

    let result = coordinator.reconfigure(change("n", &["n4"], &["n1"])).await;

    assert!(matches!(result, Err(ReconfigError::TransferFailure { ref name, .. }) if name == &svc));
    let record = coordinator.record(&svc).unwrap();
    assert_eq!(record.epoch, Epoch::ZERO);
    assert_eq!(record.active, node_set(["n1", "n2", "n3"]));
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Active);
    assert!(cluster.serving(&svc).contains(&id("n1")));
    assert_eq!(
        cluster.transfers_sent(&id("n4")),
        u64::from(coordinator.config().transfer_attempts())
    );
}

#[tokio::test]
async fn undecided_change_stops_added_nodes() {
    let cluster = cluster(&["n1", "n2", "n3", "n4"]);
    let coordinator = coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();
    coordinator.consensus().fail_next(1);

    let result = coordinator.reconfigure(change("n", &["n4"], &["n1"])).await;

    assert!(matches!(
        result,
        Err(ReconfigError::Consensus(ConsensusError::Unavailable(_)))
    ));
    assert_eq!(coordinator.record(&svc).unwrap().epoch, Epoch::ZERO);
    assert!(!cluster.serving(&svc).contains(&id("n4")));
    assert!(cluster.serving(&svc).contains(&id("n1")));
    // n4 applied the unit once before the rollback.
    assert_eq!(cluster.with_node(&id("n4"), |n| n.apply_runs(&svc)), Some(1));

    // A retry of the whole operation succeeds.
    let ack = coordinator.reconfigure(change("n", &["n4"], &["n1"])).await.unwrap();
    assert_eq!(ack.record.epoch, Epoch::new(1));
    assert_eq!(cluster.with_node(&id("n4"), |n| n.apply_runs(&svc)), Some(2));
}

/// Decides every proposal at once but answers the first `late` of them only
/// after `delay`, as a consensus whose replies are slower than the
/// coordinator's decision timeout.
#[derive(Debug)]
struct LateReplies {
    inner: LocalConsensus,
    late: AtomicU32,
    delay: Duration,
}

impl LateReplies {
    fn new(delay: Duration) -> Self {
        Self {
            inner: LocalConsensus::new(),
            late: AtomicU32::new(0),
            delay,
        }
    }

    fn delay_next(&self, count: u32) {
        self.late.store(count, Ordering::SeqCst);
    }
}

impl Consensus for LateReplies {
    fn propose(
        &self,
        proposal: Proposal,
    ) -> impl Future<Output = Result<Decision, ConsensusError>> + Send {
        async move {
            let decided = self.inner.propose(proposal).await;
            let late = self
                .late
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if late {
                tokio::time::sleep(self.delay).await;
            }
            decided
        }
    }
}

fn late_coordinator(cluster: &MemoryCluster, pool: &[&str]) -> Coordinator<LateReplies, MemoryCluster> {
    let config = CoordinatorConfig::simulation();
    let delay = config.timeouts.decision_timeout * 4;
    Coordinator::new(
        NodeId::from("RC0"),
        config,
        LateReplies::new(delay),
        cluster.clone(),
        node_set(pool.iter().copied()),
        node_set(RCS),
    )
    .with_request_ids(RequestIdGenerator::starting_at(1))
}

#[tokio::test(start_paused = true)]
async fn late_decision_is_learned_by_reproposing() {
    let cluster = cluster(&["n1", "n2", "n3", "n4"]);
    let coordinator = late_coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();
    coordinator.consensus().delay_next(1);

    let ack = coordinator.reconfigure(change("n", &["n4"], &["n1"])).await.unwrap();

    assert_eq!(ack.record.epoch, Epoch::new(1));
    assert_eq!(ack.record.active, node_set(["n2", "n3", "n4"]));
    // The second proposal resolved to the first decision.
    assert_eq!(coordinator.consensus().inner.len(), 2);
    assert!(cluster.serving(&svc).contains(&id("n4")));
    assert!(!cluster.serving(&svc).contains(&id("n1")));
}

#[tokio::test(start_paused = true)]
async fn unknown_outcome_keeps_added_nodes_until_retry() {
    let cluster = cluster(&["n1", "n2", "n3", "n4"]);
    let coordinator = late_coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();
    coordinator
        .consensus()
        .delay_next(coordinator.config().decision_attempts());

    let result = coordinator.reconfigure(change("n", &["n4"], &["n1"])).await;

    assert!(matches!(result, Err(ReconfigError::DecisionTimeout(_))));
    assert!(result.unwrap_err().is_retryable());
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Active);
    assert_eq!(coordinator.record(&svc).unwrap().epoch, Epoch::ZERO);
    // Consensus decided epoch 1 with n4, so n4 must still hold the state.
    assert_eq!(coordinator.consensus().inner.len(), 2);
    assert!(cluster.serving(&svc).contains(&id("n4")));
    assert_eq!(
        cluster.with_node(&id("n4"), |n| n.epoch_of(&svc)),
        Some(Some(Epoch::new(1)))
    );

    // The same change replays the decided membership instead of being refused.
    let ack = coordinator.reconfigure(change("n", &["n4"], &["n1"])).await.unwrap();
    assert_eq!(ack.record.epoch, Epoch::new(1));
    assert_eq!(coordinator.consensus().inner.len(), 2);
    assert!(!cluster.serving(&svc).contains(&id("n1")));

    // The name is not stuck: the next epoch is accepted.
    let ack = coordinator.reconfigure(change("n", &["n1"], &["n2"])).await.unwrap();
    assert_eq!(ack.record.epoch, Epoch::new(2));
}

#[tokio::test(start_paused = true)]
async fn create_with_unknown_outcome_can_be_retried() {
    let cluster = cluster(&["n1", "n2", "n3"]);
    let coordinator = late_coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("svcA");
    coordinator
        .consensus()
        .delay_next(coordinator.config().decision_attempts());

    let result = coordinator.create(svc.clone(), "s".into()).await;

    assert!(matches!(result, Err(ReconfigError::DecisionTimeout(_))));
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Absent);
    assert!(cluster.serving(&svc).contains(&id("n1")));

    let ack = coordinator.create(svc.clone(), "s".into()).await.unwrap();
    assert_eq!(ack.record.epoch, Epoch::ZERO);
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Active);
    assert_eq!(coordinator.consensus().inner.len(), 1);
}

#[tokio::test]
async fn invalid_change_is_rejected_without_transition() {
    let cluster = cluster(&["n1", "n2"]);
    let coordinator = coordinator(&cluster, &["n1", "n2"]);
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();

    for bad in [
        change("n", &[], &[]),
        change("n", &["n1"], &[]),
        change("n", &[], &["n9"]),
        change("n", &[], &["n1", "n2"]),
    ] {
        assert!(matches!(
            coordinator.reconfigure(bad).await,
            Err(ReconfigError::InvalidChange { .. })
        ));
        assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Active);
    }
    assert_eq!(coordinator.record(&svc).unwrap().epoch, Epoch::ZERO);
}

#[tokio::test]
async fn reconfigurator_change_moves_the_record() {
    let cluster = cluster(&["n1"]);
    cluster.add_nodes(["RC3"]);
    let coordinator = coordinator(&cluster, &["n1"]);
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();

    let ack = coordinator
        .reconfigure(MembershipChange::new(
            svc.clone(),
            NodeGroup::Reconfigurators,
            node_set(["RC3"]),
            node_set(["RC0"]),
        ))
        .await
        .unwrap();

    assert_eq!(ack.record.reconfigurators, node_set(["RC1", "RC2", "RC3"]));
    let stored = cluster
        .with_node(&id("RC3"), |n| n.state_of(&svc).map(str::to_string))
        .flatten()
        .unwrap();
    let record: ServiceRecord = serde_json::from_str(&stored).unwrap();
    assert_eq!(record, ack.record);
    assert!(!cluster.serving(&svc).contains(&id("RC0")));

    // The stamp now ranges over the new reconfigurator set.
    assert!(ack.stamp.contains("RC3"));
    assert!(!ack.stamp.contains("RC0"));
    assert_eq!(ack.stamp.counter("RC2"), 1);
}

#[tokio::test]
async fn node_config_reports_failed_names() {
    let cluster = cluster(&["n1", "n2", "n3", "n4"]);
    cluster.set_down(&id("n4"), true);
    let coordinator = coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();

    let ack = coordinator
        .reconfigure_node_config(NodeGroup::ActiveReplicas, node_set(["n4"]), node_set(["n1"]))
        .await
        .unwrap();

    assert!(ack.is_failed());
    assert_eq!(ack.failed[0].0, svc);
    assert!(ack.summary.contains("0 name(s), 1 failed"));
    assert!(ack.summary.contains("n:"));
    assert_eq!(coordinator.record(&svc).unwrap().active, node_set(["n1", "n2", "n3"]));
    // n1 still serves the name, so it stays in the pool.
    assert_eq!(ack.pool, node_set(["n1", "n2", "n3", "n4"]));
    assert_eq!(
        coordinator.pool(NodeGroup::ActiveReplicas),
        node_set(["n1", "n2", "n3", "n4"])
    );
    assert!(ack.summary.contains("[n1] kept"));
}

#[tokio::test]
async fn repeated_removal_migrates_leftover_names() {
    let cluster = cluster(&["n1", "n2", "n3", "n4"]);
    cluster.set_down(&id("n4"), true);
    let coordinator = coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();

    let first = coordinator
        .reconfigure_node_config(NodeGroup::ActiveReplicas, node_set(["n4"]), node_set(["n1"]))
        .await
        .unwrap();
    assert!(first.is_failed());

    cluster.set_down(&id("n4"), false);
    let retry = coordinator
        .reconfigure_node_config(NodeGroup::ActiveReplicas, NodeSet::new(), node_set(["n1"]))
        .await
        .unwrap();

    assert!(!retry.is_failed());
    assert_eq!(retry.migrated, vec![svc.clone()]);
    assert_eq!(retry.pool, node_set(["n2", "n3", "n4"]));
    assert_eq!(coordinator.active_replicas(&svc).unwrap(), node_set(["n2", "n3", "n4"]));
    assert!(!cluster.serving(&svc).contains(&id("n1")));
}

#[tokio::test]
async fn invalid_node_config_is_rejected() {
    let cluster = cluster(&["n1"]);
    let coordinator = coordinator(&cluster, &["n1"]);

    for (add, remove) in [
        (NodeSet::new(), NodeSet::new()),
        (node_set(["n1"]), NodeSet::new()),
        (NodeSet::new(), node_set(["n7"])),
        (NodeSet::new(), node_set(["n1"])),
    ] {
        assert!(matches!(
            coordinator
                .reconfigure_node_config(NodeGroup::ActiveReplicas, add, remove)
                .await,
            Err(ReconfigError::InvalidNodeConfig { .. })
        ));
    }
    assert!(coordinator.consensus().is_empty());
    assert_eq!(coordinator.pool(NodeGroup::ActiveReplicas), node_set(["n1"]));
}

#[tokio::test]
async fn nodes_cannot_join_both_groups() {
    let cluster = cluster(&["n1", "n2", "n3"]);
    let coordinator = coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("n");
    coordinator.create(svc.clone(), "app".into()).await.unwrap();

    assert!(matches!(
        coordinator
            .reconfigure_node_config(NodeGroup::Reconfigurators, node_set(["n1"]), NodeSet::new())
            .await,
        Err(ReconfigError::InvalidNodeConfig { .. })
    ));
    let rc_change = MembershipChange::new(
        svc.clone(),
        NodeGroup::Reconfigurators,
        node_set(["n2"]),
        NodeSet::new(),
    );
    assert!(matches!(
        coordinator.reconfigure(rc_change).await,
        Err(ReconfigError::InvalidChange { .. })
    ));
    assert!(matches!(
        coordinator.reconfigure(change("n", &["RC1"], &[])).await,
        Err(ReconfigError::InvalidChange { .. })
    ));

    // The application state on n1 and n2 was never replaced by a record.
    for node in ["n1", "n2"] {
        let state = cluster.with_node(&id(node), |n| n.state_of(&svc).map(str::to_string));
        assert_eq!(state.flatten().as_deref(), Some("app"));
    }
    assert_eq!(coordinator.lifecycle(&svc), Lifecycle::Active);
    assert_eq!(coordinator.pool(NodeGroup::Reconfigurators), node_set(RCS));
}

#[tokio::test]
async fn reconfigurator_ids_must_fit_a_vector_clock() {
    let cluster = cluster(&["n1"]);
    cluster.add_nodes(["RC:3"]);
    let coordinator = coordinator(&cluster, &["n1"]);
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();

    assert!(matches!(
        coordinator
            .reconfigure_node_config(NodeGroup::Reconfigurators, node_set(["RC:3"]), NodeSet::new())
            .await,
        Err(ReconfigError::InvalidNodeConfig { .. })
    ));
    let rc_change = MembershipChange::new(
        svc.clone(),
        NodeGroup::Reconfigurators,
        node_set(["RC:3"]),
        node_set(["RC0"]),
    );
    assert!(matches!(
        coordinator.reconfigure(rc_change).await,
        Err(ReconfigError::InvalidChange { .. })
    ));
    assert_eq!(coordinator.record(&svc).unwrap().reconfigurators, node_set(RCS));
}

#[test]
#[should_panic(expected = "both an active replica and a reconfigurator")]
fn overlapping_pools_panic() {
    let _ = coordinator_over(MemoryCluster::new(1), &["n1", "RC0"], CoordinatorConfig::simulation());
}

#[tokio::test]
async fn node_config_grows_names_to_replication_factor() {
    let cluster = cluster(&["n1", "n2"]);
    let coordinator = coordinator(&cluster, &["n1"]);
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();
    assert_eq!(coordinator.active_replicas(&svc).unwrap(), node_set(["n1"]));

    let ack = coordinator
        .reconfigure_node_config(NodeGroup::ActiveReplicas, node_set(["n2"]), NodeSet::new())
        .await
        .unwrap();

    assert_eq!(ack.migrated, vec![svc.clone()]);
    assert_eq!(coordinator.active_replicas(&svc).unwrap(), node_set(["n1", "n2"]));
}

// ============================================================================
// Transfer Retries
// ============================================================================

/// Wraps a cluster and tampers with the first acknowledgment from one node.
#[derive(Debug)]
struct FlakyAcks {
    cluster: MemoryCluster,
    target: NodeId,
    stale: bool,
    tampered: AtomicBool,
}

impl FlakyAcks {
    fn losing(cluster: &MemoryCluster, target: &str) -> Self {
        Self {
            cluster: cluster.clone(),
            target: id(target),
            stale: false,
            tampered: AtomicBool::new(false),
        }
    }

    fn stale(cluster: &MemoryCluster, target: &str) -> Self {
        Self {
            stale: true,
            ..Self::losing(cluster, target)
        }
    }
}

impl Transport for FlakyAcks {
    fn send_transfer(
        &self,
        to: &NodeId,
        encoded_unit: String,
    ) -> impl Future<Output = Result<TransferAck, TransportError>> + Send {
        async move {
            let ack = self.cluster.send_transfer(to, encoded_unit).await?;
            if to == &self.target && !self.tampered.swap(true, Ordering::SeqCst) {
                if !self.stale {
                    return std::future::pending().await;
                }
                return Ok(TransferAck {
                    request_id: RequestId::new(ack.request_id.as_u64() + 1_000),
                    ..ack
                });
            }
            Ok(ack)
        }
    }

    fn fetch_state(
        &self,
        from: &NodeId,
        name: &ServiceName,
    ) -> impl Future<Output = Result<String, TransportError>> + Send {
        self.cluster.fetch_state(from, name)
    }

    fn send_stop(
        &self,
        to: &NodeId,
        name: &ServiceName,
        epoch: Epoch,
        kind: StopKind,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        self.cluster.send_stop(to, name, epoch, kind)
    }

    fn forward_app(
        &self,
        to: &NodeId,
        name: &ServiceName,
        request: String,
    ) -> impl Future<Output = Result<String, TransportError>> + Send {
        self.cluster.forward_app(to, name, request)
    }
}

#[tokio::test(start_paused = true)]
async fn lost_ack_is_resent_and_applied_once() {
    let cluster = cluster(&["n1", "n2", "n3", "n4"]);
    let coordinator = coordinator_over(
        FlakyAcks::losing(&cluster, "n4"),
        &["n1", "n2", "n3"],
        CoordinatorConfig::simulation(),
    );
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();

    let ack = coordinator.reconfigure(change("n", &["n4"], &["n1"])).await.unwrap();

    assert_eq!(ack.record.epoch, Epoch::new(1));
    assert_eq!(cluster.transfers_sent(&id("n4")), 2);
    // The resent unit carried the same request id and was not applied again.
    assert_eq!(cluster.with_node(&id("n4"), |n| n.apply_runs(&svc)), Some(1));
}

#[tokio::test(start_paused = true)]
async fn stale_ack_is_ignored() {
    let cluster = cluster(&["n1", "n2", "n3", "n4"]);
    let coordinator = coordinator_over(
        FlakyAcks::stale(&cluster, "n4"),
        &["n1", "n2", "n3"],
        CoordinatorConfig::simulation(),
    );
    let svc = name("n");
    coordinator.create(svc.clone(), "s".into()).await.unwrap();

    let ack = coordinator.reconfigure(change("n", &["n4"], &["n1"])).await.unwrap();

    assert_eq!(ack.record.active, node_set(["n2", "n3", "n4"]));
    assert_eq!(cluster.transfers_sent(&id("n4")), 2);
    assert_eq!(cluster.with_node(&id("n4"), |n| n.apply_runs(&svc)), Some(1));
}

// ============================================================================
// Application Requests and Stamps
// ============================================================================

#[tokio::test]
async fn app_request_reaches_an_active_replica() {
    let cluster = cluster(&["n1", "n2", "n3"]);
    let coordinator = coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("svcA");
    coordinator.create(svc.clone(), "init".into()).await.unwrap();

    assert_eq!(coordinator.app_request(&svc, "v1".into()).await.unwrap(), "v1");

    cluster.set_down(&id("n1"), true);
    assert_eq!(coordinator.app_request(&svc, "v2".into()).await.unwrap(), "v2");

    for node in ["n2", "n3"] {
        cluster.set_down(&id(node), true);
    }
    assert!(matches!(
        coordinator.app_request(&svc, "v3".into()).await,
        Err(ReconfigError::Transport(TransportError::Unreachable(_)))
    ));

    assert_eq!(
        coordinator.app_request(&name("ghost"), "x".into()).await,
        Err(ReconfigError::NotFound(name("ghost")))
    );
}

#[tokio::test]
async fn stamps_advance_with_every_decision() {
    let cluster = cluster(&["n1", "n2", "n3", "n4"]);
    let coordinator = coordinator(&cluster, &["n1", "n2", "n3"]);
    let svc = name("n");

    let created = coordinator.create(svc.clone(), "s".into()).await.unwrap();
    let changed = coordinator.reconfigure(change("n", &["n4"], &["n1"])).await.unwrap();
    let deleted = coordinator.delete(svc.clone()).await.unwrap();

    assert_eq!(created.stamp.compare(&changed.stamp).unwrap(), CausalOrdering::Less);
    assert!(changed.stamp.is_less_than(&deleted.stamp));
    assert!(created.stamp.is_less_than(&deleted.stamp));
    assert_eq!(coordinator.stamp(&svc), Some(deleted.stamp));
}

#[tokio::test]
async fn names_reconfigure_independently() {
    let cluster = cluster(&["n1", "n2", "n3", "n4"]);
    let coordinator = Arc::new(coordinator(&cluster, &["n1", "n2", "n3"]));
    for svc in ["a", "b"] {
        coordinator.create(name(svc), "s".into()).await.unwrap();
    }

    let a = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.reconfigure(change("a", &["n4"], &["n1"])).await }
    });
    let b = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.reconfigure(change("b", &["n4"], &["n2"])).await }
    });

    assert_eq!(a.await.unwrap().unwrap().record.epoch, Epoch::new(1));
    assert_eq!(b.await.unwrap().unwrap().record.epoch, Epoch::new(1));
    assert_eq!(coordinator.records().len(), 2);
}
