//! The per-name reconfiguration state machine.

use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};
use xdn_clock::{SharedVectorClock, VectorClock};
use xdn_transfer::StateTransferUnit;
use xdn_types::{Epoch, NodeGroup, NodeId, NodeSet, RequestIdGenerator, ServiceName};

use crate::{
    ReconfigError, ReconfigResult,
    config::CoordinatorConfig,
    consensus::{Consensus, Decision, Proposal},
    placement,
    transport::{StopKind, Transport, TransportError},
    types::{
        Ack, Lifecycle, MembershipChange, NameState, NodeConfigAck, ServiceRecord, display_nodes,
    },
};

#[derive(Debug, Clone, Default)]
struct Pools {
    active: NodeSet,
    reconfigurators: NodeSet,
}

impl Pools {
    fn get(&self, group: NodeGroup) -> &NodeSet {
        match group {
            NodeGroup::ActiveReplicas => &self.active,
            NodeGroup::Reconfigurators => &self.reconfigurators,
        }
    }

    fn set(&mut self, group: NodeGroup, pool: NodeSet) {
        match group {
            NodeGroup::ActiveReplicas => self.active = pool,
            NodeGroup::Reconfigurators => self.reconfigurators = pool,
        }
    }
}

/// Clears a node-config in-flight flag when dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Owns the lifecycle of every service name.
///
/// All methods take `&self`: per-name state lives behind short critical
/// sections that are never held across a suspension point, so operations on
/// different names run concurrently while each name moves through its
/// transitions one at a time.
#[derive(Debug)]
pub struct Coordinator<C, T> {
    id: NodeId,
    config: CoordinatorConfig,
    consensus: C,
    transport: T,
    names: Mutex<HashMap<ServiceName, NameState>>,
    stamps: Mutex<HashMap<ServiceName, SharedVectorClock>>,
    pools: Mutex<Pools>,
    active_pool_change: AtomicBool,
    rc_pool_change: AtomicBool,
    request_ids: RequestIdGenerator,
}

impl<C: Consensus, T: Transport> Coordinator<C, T> {
    /// Creates a coordinator over the given node pools.
    ///
    /// # Panics
    ///
    /// Panics if a node is in both pools. A node holds one copy of each
    /// name, so it cannot host a name's state and its record at once.
    /// Also panics if a reconfigurator id cannot appear in a vector clock
    /// (see [`VectorClock::accepts_node`]).
    pub fn new(
        id: NodeId,
        config: CoordinatorConfig,
        consensus: C,
        transport: T,
        active_pool: NodeSet,
        reconfigurator_pool: NodeSet,
    ) -> Self {
        assert!(
            active_pool.is_disjoint(&reconfigurator_pool),
            "a node cannot be both an active replica and a reconfigurator"
        );
        assert!(
            reconfigurator_pool
                .iter()
                .all(|n| VectorClock::accepts_node(n.as_str())),
            "reconfigurator ids must not contain ':' '.' or '/'"
        );
        info!(
            coordinator = %id,
            active = %display_nodes(&active_pool),
            reconfigurators = %display_nodes(&reconfigurator_pool),
            "coordinator started"
        );
        Self {
            id,
            config,
            consensus,
            transport,
            names: Mutex::new(HashMap::new()),
            stamps: Mutex::new(HashMap::new()),
            pools: Mutex::new(Pools {
                active: active_pool,
                reconfigurators: reconfigurator_pool,
            }),
            active_pool_change: AtomicBool::new(false),
            rc_pool_change: AtomicBool::new(false),
            request_ids: RequestIdGenerator::from_wall_clock(),
        }
    }

    /// Replaces the request id source, e.g. with a fixed start for simulation.
    pub fn with_request_ids(mut self, request_ids: RequestIdGenerator) -> Self {
        self.request_ids = request_ids;
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn consensus(&self) -> &C {
        &self.consensus
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current lifecycle of `name`.
    pub fn lifecycle(&self, name: &ServiceName) -> Lifecycle {
        self.names()
            .get(name)
            .map_or(Lifecycle::Absent, NameState::lifecycle)
    }

    /// Snapshot of the last decided record of a served name.
    pub fn record(&self, name: &ServiceName) -> Option<ServiceRecord> {
        self.names().get(name).and_then(NameState::record).cloned()
    }

    /// The membership change in flight for `name`, if any.
    pub fn pending_change(&self, name: &ServiceName) -> Option<MembershipChange> {
        match self.names().get(name) {
            Some(NameState::Reconfiguring { pending, .. }) => Some(pending.clone()),
            _ => None,
        }
    }

    /// Snapshots of every served name's record, sorted by name.
    pub fn records(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<_> = self
            .names()
            .values()
            .filter_map(NameState::record)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// The active replicas of `name`.
    ///
    /// Fails with `NotFound` for absent and deleted names. Never changes state.
    pub fn active_replicas(&self, name: &ServiceName) -> ReconfigResult<NodeSet> {
        self.record(name)
            .map(|record| record.active)
            .ok_or_else(|| ReconfigError::NotFound(name.clone()))
    }

    /// The latest causal stamp issued for `name`.
    pub fn stamp(&self, name: &ServiceName) -> Option<VectorClock> {
        self.stamps().get(name).map(SharedVectorClock::snapshot)
    }

    /// Current node pool of `group`.
    pub fn pool(&self, group: NodeGroup) -> NodeSet {
        self.pools().get(group).clone()
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Creates `name` with `initial_state` on replicas chosen by placement.
    #[instrument(skip_all, fields(coordinator = %self.id, service = %name))]
    pub async fn create(&self, name: ServiceName, initial_state: String) -> ReconfigResult<Ack> {
        let record = self.prepare_create(&name, None)?;
        self.install(&record, &initial_state).await?;

        let proposal = Proposal::Create {
            records: vec![record.clone()],
        };
        if let Err(e) = self.decide(proposal).await {
            self.abandon_create(&record, e.outcome_known()).await;
            return Err(e);
        }
        Ok(self.finish_create(record))
    }

    /// Creates several names under one decision.
    ///
    /// All names share the reconfigurator set placed for the first name.
    /// Each name succeeds or fails on its own: a name that cannot be
    /// installed is reported failed without affecting the others, and
    /// nothing already installed is rolled back for the sake of another name.
    #[instrument(skip_all, fields(coordinator = %self.id, batch = entries.len()))]
    pub async fn create_batch(
        &self,
        entries: Vec<(ServiceName, String)>,
    ) -> Vec<(ServiceName, ReconfigResult<Ack>)> {
        let shared_rcs = entries.first().map(|(first, _)| {
            let pools = self.pools();
            placement::place(first, &pools.reconfigurators, self.config.rc_replication_factor)
        });

        let mut outcomes = Vec::with_capacity(entries.len());
        let mut installed = Vec::new();
        for (index, (name, state)) in entries.into_iter().enumerate() {
            let prepared = self.prepare_create(&name, shared_rcs.as_ref());
            let result = match prepared {
                Ok(record) => self.install(&record, &state).await.map(|()| record),
                Err(e) => Err(e),
            };
            match result {
                Ok(record) => installed.push((index, record)),
                Err(e) => outcomes.push((index, name, Err(e))),
            }
        }

        if !installed.is_empty() {
            let proposal = Proposal::Create {
                records: installed.iter().map(|(_, r)| r.clone()).collect(),
            };
            match self.decide(proposal).await {
                Ok(_) => {
                    for (index, record) in installed {
                        let name = record.name.clone();
                        outcomes.push((index, name, Ok(self.finish_create(record))));
                    }
                }
                Err(e) => {
                    for (index, record) in installed {
                        self.abandon_create(&record, e.outcome_known()).await;
                        outcomes.push((index, record.name, Err(e.clone())));
                    }
                }
            }
        }

        outcomes.sort_by_key(|(index, _, _)| *index);
        outcomes
            .into_iter()
            .map(|(_, name, result)| (name, result))
            .collect()
    }

    fn prepare_create(
        &self,
        name: &ServiceName,
        shared_rcs: Option<&NodeSet>,
    ) -> ReconfigResult<ServiceRecord> {
        let (active, reconfigurators) = {
            let pools = self.pools();
            let active = placement::place(name, &pools.active, self.config.replication_factor);
            let reconfigurators = match shared_rcs {
                Some(rcs) => rcs.clone(),
                None => placement::place(
                    name,
                    &pools.reconfigurators,
                    self.config.rc_replication_factor,
                ),
            };
            (active, reconfigurators)
        };
        if active.is_empty() {
            return Err(ReconfigError::NoCapacity(NodeGroup::ActiveReplicas));
        }
        if reconfigurators.is_empty() {
            return Err(ReconfigError::NoCapacity(NodeGroup::Reconfigurators));
        }

        let mut names = self.names();
        match names.get(name) {
            None => {}
            Some(NameState::Deleted { final_epoch }) => {
                return Err(ReconfigError::Tombstoned {
                    name: name.clone(),
                    epoch: *final_epoch,
                });
            }
            Some(NameState::Creating) => {
                return Err(ReconfigError::ReconfigurationConflict {
                    name: name.clone(),
                    in_flight: "create",
                });
            }
            Some(_) => return Err(ReconfigError::AlreadyExists(name.clone())),
        }
        names.insert(name.clone(), NameState::Creating);

        Ok(ServiceRecord::new(name.clone(), active, reconfigurators))
    }

    /// Sends the initial state to the active replicas and the record to the
    /// reconfigurators. Abandons the create on failure.
    async fn install(&self, record: &ServiceRecord, initial_state: &str) -> ReconfigResult<()> {
        let result = self.install_units(record, initial_state).await;
        if result.is_err() {
            self.abandon_create(record, true).await;
        }
        result
    }

    async fn install_units(&self, record: &ServiceRecord, initial_state: &str) -> ReconfigResult<()> {
        let record_json = encode_record(record)?;
        for node in &record.active {
            self.transfer(node, &record.name, initial_state, record.epoch)
                .await?;
        }
        for node in &record.reconfigurators {
            self.transfer(node, &record.name, &record_json, record.epoch)
                .await?;
        }
        Ok(())
    }

    /// Forgets a create that was not decided.
    ///
    /// Installed nodes are torn down only when the create is known to be
    /// undecided. After a decision timeout the create may still have been
    /// decided, so the nodes keep their state and an identical retry picks
    /// up the earlier decision.
    async fn abandon_create(&self, record: &ServiceRecord, teardown: bool) {
        if teardown {
            warn!(service = %record.name, "abandoning create");
            let nodes: Vec<NodeId> = record
                .active
                .iter()
                .chain(&record.reconfigurators)
                .cloned()
                .collect();
            self.stop_all(&nodes, &record.name, record.epoch, StopKind::Delete)
                .await;
        } else {
            warn!(service = %record.name, "create outcome unknown, keeping installed state");
        }

        let mut names = self.names();
        if matches!(names.get(&record.name), Some(NameState::Creating)) {
            names.remove(&record.name);
        }
    }

    fn finish_create(&self, record: ServiceRecord) -> Ack {
        self.names()
            .insert(record.name.clone(), NameState::Active(record.clone()));
        let stamp = self.stamp_decision(&record);
        info!(
            service = %record.name,
            active = %display_nodes(&record.active),
            reconfigurators = %display_nodes(&record.reconfigurators),
            "created"
        );
        Ack { record, stamp }
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Deletes `name`; the name is tombstoned and can never be created again.
    #[instrument(skip_all, fields(coordinator = %self.id, service = %name))]
    pub async fn delete(&self, name: ServiceName) -> ReconfigResult<Ack> {
        let record = {
            let mut names = self.names();
            let record = match names.get(&name) {
                Some(NameState::Active(record)) => record.clone(),
                Some(NameState::Reconfiguring { .. }) => {
                    return Err(conflict(&name, "reconfiguration"));
                }
                Some(NameState::Creating) => return Err(conflict(&name, "create")),
                Some(NameState::Deleting(_)) => return Err(conflict(&name, "delete")),
                Some(NameState::Deleted { .. }) | None => {
                    return Err(ReconfigError::NotFound(name));
                }
            };
            names.insert(name.clone(), NameState::Deleting(record.clone()));
            record
        };

        let proposal = Proposal::Delete {
            name: name.clone(),
            epoch: record.epoch,
        };
        if let Err(e) = self.decide(proposal).await {
            warn!(error = %e, "delete not decided, name stays active");
            self.names().insert(name, NameState::Active(record));
            return Err(e);
        }

        self.names().insert(
            name.clone(),
            NameState::Deleted {
                final_epoch: record.epoch,
            },
        );
        let stamp = self.stamp_decision(&record);

        let nodes: Vec<NodeId> = record
            .active
            .iter()
            .chain(&record.reconfigurators)
            .cloned()
            .collect();
        self.stop_all(&nodes, &name, record.epoch, StopKind::Delete)
            .await;

        info!(epoch = %record.epoch, "deleted");
        Ok(Ack { record, stamp })
    }

    // ========================================================================
    // Membership Change
    // ========================================================================

    /// Adds and removes members of one group of a name, moving state to the
    /// added members before the new membership is proposed.
    #[instrument(
        skip_all,
        fields(coordinator = %self.id, service = %change.name, group = %change.group)
    )]
    pub async fn reconfigure(&self, change: MembershipChange) -> ReconfigResult<Ack> {
        let (record, members) = self.begin_change(&change)?;
        let next = record.with_members(change.group, members);
        info!(
            from = %record.epoch,
            to = %next.epoch,
            add = %display_nodes(&change.add),
            remove = %display_nodes(&change.remove),
            "reconfiguring"
        );

        if let Err(e) = self.migrate(&record, &next, &change).await {
            if e.outcome_known() {
                warn!(error = %e, "reconfiguration failed, rolling back");
                let added: Vec<NodeId> = change.add.iter().cloned().collect();
                self.stop_all(&added, &change.name, next.epoch, StopKind::Handover)
                    .await;
            } else {
                // The membership may have been decided; added nodes keep
                // their state until a retry of the same change learns the
                // outcome.
                warn!(error = %e, "reconfiguration outcome unknown, releasing the name");
            }
            self.names()
                .insert(change.name.clone(), NameState::Active(record));
            return Err(e);
        }

        self.names()
            .insert(change.name.clone(), NameState::Active(next.clone()));
        let stamp = self.stamp_decision(&next);

        // The new membership is live; departing members may now stop.
        let removed: Vec<NodeId> = change.remove.iter().cloned().collect();
        self.stop_all(&removed, &change.name, next.epoch, StopKind::Handover)
            .await;

        info!(epoch = %next.epoch, members = %display_nodes(next.members(change.group)), "reconfigured");
        Ok(Ack {
            record: next,
            stamp,
        })
    }

    fn begin_change(&self, change: &MembershipChange) -> ReconfigResult<(ServiceRecord, NodeSet)> {
        let other_pool = self.pool(change.group.other());
        let mut names = self.names();
        let record = match names.get(&change.name) {
            Some(NameState::Active(record)) => record.clone(),
            Some(NameState::Reconfiguring { .. }) => {
                return Err(conflict(&change.name, "reconfiguration"));
            }
            Some(NameState::Creating) => return Err(conflict(&change.name, "create")),
            Some(NameState::Deleting(_)) => return Err(conflict(&change.name, "delete")),
            Some(NameState::Deleted { .. }) | None => {
                return Err(ReconfigError::NotFound(change.name.clone()));
            }
        };
        let other = change.group.other();
        if let Some(node) = change
            .add
            .iter()
            .find(|n| other_pool.contains(*n) || record.members(other).contains(*n))
        {
            return Err(ReconfigError::InvalidChange {
                name: change.name.clone(),
                reason: format!("{node} belongs to {other}"),
            });
        }
        if let Some(node) = unstampable(change.group, &change.add) {
            return Err(ReconfigError::InvalidChange {
                name: change.name.clone(),
                reason: format!("{node} cannot stamp decisions"),
            });
        }
        let members = change.resolve(record.members(change.group))?;
        names.insert(
            change.name.clone(),
            NameState::Reconfiguring {
                record: record.clone(),
                pending: change.clone(),
            },
        );
        Ok((record, members))
    }

    async fn migrate(
        &self,
        record: &ServiceRecord,
        next: &ServiceRecord,
        change: &MembershipChange,
    ) -> ReconfigResult<()> {
        let payload = match change.group {
            NodeGroup::ActiveReplicas => self.fetch_state(record, &change.remove).await?,
            NodeGroup::Reconfigurators => encode_record(next)?,
        };

        for node in &change.add {
            self.transfer(node, &change.name, &payload, next.epoch)
                .await?;
        }

        self.decide(Proposal::Membership {
            name: change.name.clone(),
            group: change.group,
            epoch: next.epoch,
            members: next.members(change.group).clone(),
        })
        .await?;
        Ok(())
    }

    /// Reads the name's state from a member, preferring members that stay.
    async fn fetch_state(
        &self,
        record: &ServiceRecord,
        departing: &NodeSet,
    ) -> ReconfigResult<String> {
        let sources = record
            .active
            .difference(departing)
            .chain(record.active.intersection(departing));

        let ack_timeout = self.config.timeouts.ack_timeout;
        for source in sources {
            match timeout(ack_timeout, self.transport.fetch_state(source, &record.name)).await {
                Ok(Ok(state)) => {
                    debug!(source = %source, "fetched state");
                    return Ok(state);
                }
                Ok(Err(e)) => warn!(source = %source, error = %e, "state source failed"),
                Err(_) => warn!(source = %source, "state source timed out"),
            }
        }
        Err(ReconfigError::TransferFailure {
            name: record.name.clone(),
            reason: "no member could supply the current state".into(),
        })
    }

    /// Sends one unit to `to`, resending it until acknowledged or the retry
    /// budget is spent.
    ///
    /// Resends reuse the unit's request id, so a node that applied an earlier
    /// copy acknowledges without applying again. Acknowledgments for any
    /// other request are stale and ignored.
    async fn transfer(
        &self,
        to: &NodeId,
        name: &ServiceName,
        payload: &str,
        epoch: Epoch,
    ) -> ReconfigResult<()> {
        let unit = StateTransferUnit::new(name.clone(), payload, self.request_ids.next_id(), epoch);
        let encoded = unit.encode();
        let attempts = self.config.transfer_attempts();
        let mut last_error = String::from("no acknowledgment");

        for attempt in 1..=attempts {
            let sent = timeout(
                self.config.timeouts.ack_timeout,
                self.transport.send_transfer(to, encoded.clone()),
            )
            .await;

            match sent {
                Ok(Ok(ack)) if ack.request_id == unit.request_id() && &ack.node == to => {
                    if ack.outcome.is_acknowledgeable() {
                        debug!(node = %to, request = %unit.request_id(), outcome = ?ack.outcome, "transfer acknowledged");
                        return Ok(());
                    }
                    return Err(ReconfigError::TransferFailure {
                        name: name.clone(),
                        reason: format!("{to} holds a newer epoch ({:?})", ack.outcome),
                    });
                }
                Ok(Ok(ack)) => {
                    debug!(node = %to, stale = %ack.request_id, "ignoring stale acknowledgment");
                }
                Ok(Err(TransportError::Rejected(reason))) => {
                    return Err(ReconfigError::TransferFailure {
                        name: name.clone(),
                        reason: format!("{to} rejected the unit: {reason}"),
                    });
                }
                Ok(Err(e)) => {
                    warn!(node = %to, attempt, error = %e, "transfer failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(node = %to, attempt, "transfer timed out");
                    last_error = TransportError::TimedOut(to.clone()).to_string();
                }
            }

            if attempt < attempts {
                sleep(self.config.timeouts.retry_backoff).await;
            }
        }

        Err(ReconfigError::TransferFailure {
            name: name.clone(),
            reason: format!("{to} did not acknowledge after {attempts} attempt(s): {last_error}"),
        })
    }

    // ========================================================================
    // Node Config
    // ========================================================================

    /// Adds and removes nodes from a group's pool, then migrates every name
    /// that loses members or is below its replication factor.
    ///
    /// The pool change itself is decided first; per-name migrations follow
    /// and are reported individually in the returned summary. A removed
    /// node that still serves a name whose migration failed is put back in
    /// the pool, so repeating the removal later migrates what is left.
    #[instrument(skip_all, fields(coordinator = %self.id, %group))]
    pub async fn reconfigure_node_config(
        &self,
        group: NodeGroup,
        add: NodeSet,
        remove: NodeSet,
    ) -> ReconfigResult<NodeConfigAck> {
        let flag = match group {
            NodeGroup::ActiveReplicas => &self.active_pool_change,
            NodeGroup::Reconfigurators => &self.rc_pool_change,
        };
        if flag.swap(true, Ordering::AcqRel) {
            return Err(ReconfigError::NodeConfigConflict(group));
        }
        let _in_flight = InFlight(flag);

        let old_pool = self.pool(group);
        let other_pool = self.pool(group.other());
        let new_pool = resolve_pool(group, &old_pool, &other_pool, &add, &remove)?;

        self.decide(Proposal::NodePool {
            group,
            pool: new_pool.clone(),
        })
        .await?;
        self.pools().set(group, new_pool.clone());
        info!(
            from = %display_nodes(&old_pool),
            to = %display_nodes(&new_pool),
            "node pool changed"
        );

        let factor = match group {
            NodeGroup::ActiveReplicas => self.config.replication_factor,
            NodeGroup::Reconfigurators => self.config.rc_replication_factor,
        };

        let mut migrated = Vec::new();
        let mut failed = Vec::new();
        for record in self.records() {
            let members = record.members(group);
            let departing: NodeSet = members.intersection(&remove).cloned().collect();
            let staying = members.len() - departing.len();
            let additions = placement::replacements(
                &record.name,
                &new_pool,
                members,
                factor.saturating_sub(staying),
            );
            if departing.is_empty() && additions.is_empty() {
                continue;
            }

            let change = MembershipChange::new(record.name.clone(), group, additions, departing);
            match self.reconfigure(change).await {
                Ok(_) => migrated.push(record.name),
                Err(e) => failed.push((record.name, e.to_string())),
            }
        }

        let mut pool = new_pool;
        let stranded = self.still_serving(group, &remove);
        if !stranded.is_empty() {
            let kept: NodeSet = pool.union(&stranded).cloned().collect();
            match self
                .decide(Proposal::NodePool {
                    group,
                    pool: kept.clone(),
                })
                .await
            {
                Ok(_) => {
                    warn!(kept = %display_nodes(&stranded), "removed nodes still serve names, kept in pool");
                    self.pools().set(group, kept.clone());
                    pool = kept;
                }
                Err(e) => warn!(error = %e, "could not keep unmigrated nodes in the pool"),
            }
        }

        let mut summary = format!(
            "{group} pool {} -> {}: migrated {} name(s), {} failed",
            display_nodes(&old_pool),
            display_nodes(&pool),
            migrated.len(),
            failed.len()
        );
        for (name, reason) in &failed {
            let _ = write!(summary, "; {name}: {reason}");
        }
        if !stranded.is_empty() && stranded.iter().all(|n| pool.contains(n)) {
            let _ = write!(
                summary,
                "; {} kept until their names migrate",
                display_nodes(&stranded)
            );
        }

        Ok(NodeConfigAck {
            group,
            pool,
            migrated,
            failed,
            summary,
        })
    }

    /// The nodes of `candidates` that are still members of some name in `group`.
    fn still_serving(&self, group: NodeGroup, candidates: &NodeSet) -> NodeSet {
        let names = self.names();
        candidates
            .iter()
            .filter(|node| {
                names
                    .values()
                    .filter_map(NameState::record)
                    .any(|record| record.members(group).contains(*node))
            })
            .cloned()
            .collect()
    }

    // ========================================================================
    // Application Requests
    // ========================================================================

    /// Forwards an opaque application request to every active replica of
    /// `name` and returns the first response.
    pub async fn app_request(&self, name: &ServiceName, request: String) -> ReconfigResult<String> {
        let active = self.active_replicas(name)?;
        let ack_timeout = self.config.timeouts.ack_timeout;

        let mut response = None;
        let mut last_error = None;
        for node in &active {
            match timeout(ack_timeout, self.transport.forward_app(node, name, request.clone())).await {
                Ok(Ok(reply)) => {
                    response.get_or_insert(reply);
                }
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => last_error = Some(TransportError::TimedOut(node.clone())),
            }
        }

        match (response, last_error) {
            (Some(reply), _) => Ok(reply),
            (None, Some(e)) => Err(e.into()),
            (None, None) => Err(ReconfigError::NotFound(name.clone())),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Proposes `proposal` and waits for its decision.
    ///
    /// A timed-out proposal is proposed again unchanged: consensus resolves
    /// a replay of a decided proposal to the original decision, so a reply
    /// that arrived late is learned here instead of being mistaken for a
    /// refusal. `DecisionTimeout` means the outcome is still unknown.
    async fn decide(&self, proposal: Proposal) -> ReconfigResult<Decision> {
        let decision_timeout = self.config.timeouts.decision_timeout;
        let attempts = self.config.decision_attempts();
        for attempt in 1..=attempts {
            match timeout(decision_timeout, self.consensus.propose(proposal.clone())).await {
                Ok(Ok(decision)) => {
                    if attempt > 1 {
                        info!(attempt, slot = decision.slot, "decision learned after timeout");
                    }
                    return Ok(decision);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => warn!(attempt, "decision timed out"),
            }
        }
        Err(ReconfigError::DecisionTimeout(decision_timeout))
    }

    async fn stop_all(&self, nodes: &[NodeId], name: &ServiceName, epoch: Epoch, kind: StopKind) {
        for node in nodes {
            if let Err(e) = self.transport.send_stop(node, name, epoch, kind).await {
                warn!(node = %node, service = %name, error = %e, "stop not delivered");
            }
        }
    }

    /// Ticks the name's clock at the reconfigurator responsible for the
    /// record's epoch and returns the resulting stamp.
    fn stamp_decision(&self, record: &ServiceRecord) -> VectorClock {
        let mut stamps = self.stamps();
        let shared = stamps
            .entry(record.name.clone())
            .or_insert_with(|| {
                SharedVectorClock::new(VectorClock::new(record.reconfigurators.iter().cloned()))
            });

        let current = shared.snapshot();
        let same_nodes =
            current.len() == record.reconfigurators.len()
                && record.reconfigurators.iter().all(|n| current.contains(n.as_str()));
        if !same_nodes {
            shared.replace(current.rebased(record.reconfigurators.iter().cloned()));
        }

        match placement::stamping_node(&record.reconfigurators, record.epoch) {
            Some(node) => shared.tick(node.as_str()).unwrap_or_else(|_| shared.snapshot()),
            None => shared.snapshot(),
        }
    }

    fn names(&self) -> MutexGuard<'_, HashMap<ServiceName, NameState>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stamps(&self) -> MutexGuard<'_, HashMap<ServiceName, SharedVectorClock>> {
        self.stamps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pools(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn conflict(name: &ServiceName, in_flight: &'static str) -> ReconfigError {
    ReconfigError::ReconfigurationConflict {
        name: name.clone(),
        in_flight,
    }
}

fn encode_record(record: &ServiceRecord) -> ReconfigResult<String> {
    serde_json::to_string(record).map_err(|e| ReconfigError::Encode(e.to_string()))
}

/// A reconfigurator id in `nodes` that a vector clock would reject.
fn unstampable(group: NodeGroup, nodes: &NodeSet) -> Option<&NodeId> {
    match group {
        NodeGroup::ActiveReplicas => None,
        NodeGroup::Reconfigurators => nodes.iter().find(|n| !VectorClock::accepts_node(n.as_str())),
    }
}

fn resolve_pool(
    group: NodeGroup,
    pool: &NodeSet,
    other_pool: &NodeSet,
    add: &NodeSet,
    remove: &NodeSet,
) -> ReconfigResult<NodeSet> {
    let invalid = |reason: String| ReconfigError::InvalidNodeConfig { group, reason };

    if add.is_empty() && remove.is_empty() {
        return Err(invalid("change adds and removes nothing".into()));
    }
    if let Some(node) = add.intersection(remove).next() {
        return Err(invalid(format!("{node} is both added and removed")));
    }
    if let Some(node) = add.iter().find(|n| pool.contains(*n)) {
        return Err(invalid(format!("{node} is already in the pool")));
    }
    if let Some(node) = add.iter().find(|n| other_pool.contains(*n)) {
        return Err(invalid(format!("{node} belongs to {}", group.other())));
    }
    if let Some(node) = unstampable(group, add) {
        return Err(invalid(format!("{node} cannot stamp decisions")));
    }
    if let Some(node) = remove.iter().find(|n| !pool.contains(*n)) {
        return Err(invalid(format!("{node} is not in the pool")));
    }

    let next: NodeSet = pool.difference(remove).chain(add).cloned().collect();
    if next.is_empty() {
        return Err(invalid("pool would be empty".into()));
    }
    Ok(next)
}
