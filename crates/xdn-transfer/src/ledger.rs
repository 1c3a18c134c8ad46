//! Per-replica record of applied state transfer units.
//!
//! A unit may reach a replica more than once: the coordinator resends it
//! when an acknowledgment is lost, and a timed-out attempt can still be
//! delivered after the retry. The ledger makes re-delivery harmless.
//!
//! # Retention
//!
//! Request ids are issued in increasing order, so when a name exceeds
//! `max_entries_per_name` the lowest ids are dropped first. The highest
//! epoch ever applied for a name is kept separately and is never trimmed.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;
use xdn_types::{Epoch, RequestId, ServiceName};

use crate::unit::StateTransferUnit;

// ============================================================================
// Constants
// ============================================================================

/// Default number of request ids remembered per service name.
pub const DEFAULT_MAX_ENTRIES_PER_NAME: usize = 10_000;

// ============================================================================
// ApplyOutcome
// ============================================================================

/// Result of offering a unit to a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The unit was applied for the first time.
    Applied,

    /// A unit with the same request id was applied before; nothing ran.
    AlreadyApplied,

    /// The replica already installed a newer epoch of this name; nothing ran.
    Stale { installed: Epoch },
}

impl ApplyOutcome {
    /// Returns true unless the unit was rejected as stale.
    ///
    /// Both a first apply and a duplicate leave the replica holding the
    /// unit's state, so both may be acknowledged.
    pub fn is_acknowledgeable(&self) -> bool {
        !matches!(self, ApplyOutcome::Stale { .. })
    }
}

// ============================================================================
// LedgerConfig
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Request ids remembered per service name before the oldest are dropped.
    pub max_entries_per_name: usize,
}

impl LedgerConfig {
    /// Small bound for simulation runs.
    pub fn simulation() -> Self {
        Self {
            max_entries_per_name: 64,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_entries_per_name: DEFAULT_MAX_ENTRIES_PER_NAME,
        }
    }
}

// ============================================================================
// ApplyLedger
// ============================================================================

#[derive(Debug, Clone, Default)]
struct NameEntries {
    applied: BTreeMap<RequestId, Epoch>,
    highest_epoch: Epoch,
}

/// Tracks which request ids a replica has applied, per service name.
///
/// Not thread-safe; owned by the replica it describes.
#[derive(Debug, Clone, Default)]
pub struct ApplyLedger {
    names: HashMap<ServiceName, NameEntries>,
    config: LedgerConfig,
}

impl ApplyLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            names: HashMap::new(),
            config,
        }
    }

    /// Returns the epoch a request id was applied under, if it was.
    pub fn check(&self, name: &ServiceName, id: RequestId) -> Option<Epoch> {
        self.names.get(name)?.applied.get(&id).copied()
    }

    /// Highest epoch applied for `name`.
    pub fn highest_epoch(&self, name: &ServiceName) -> Option<Epoch> {
        self.names.get(name).map(|entries| entries.highest_epoch)
    }

    /// Records an applied request id.
    ///
    /// Returns `false` if the id was already recorded; the original entry
    /// is preserved.
    pub fn record(&mut self, name: &ServiceName, id: RequestId, epoch: Epoch) -> bool {
        let max = self.config.max_entries_per_name;
        let entries = self.names.entry(name.clone()).or_default();
        if entries.applied.contains_key(&id) {
            return false;
        }

        entries.applied.insert(id, epoch);
        entries.highest_epoch = entries.highest_epoch.max(epoch);

        while entries.applied.len() > max {
            entries.applied.pop_first();
        }

        true
    }

    /// Runs `apply` for `unit` unless the unit was already applied or is
    /// older than what the replica holds, and records it on success.
    pub fn apply_once<F>(&mut self, unit: &StateTransferUnit, apply: F) -> ApplyOutcome
    where
        F: FnOnce(&StateTransferUnit),
    {
        let name = unit.service_name();

        if self.check(name, unit.request_id()).is_some() {
            debug!(service = %name, request = %unit.request_id(), "state transfer unit already applied");
            return ApplyOutcome::AlreadyApplied;
        }

        let installed = self.highest_epoch(name).unwrap_or(Epoch::ZERO);
        if unit.epoch() < installed {
            debug!(
                service = %name,
                unit_epoch = %unit.epoch(),
                installed = %installed,
                "rejecting stale state transfer unit"
            );
            return ApplyOutcome::Stale { installed };
        }

        apply(unit);
        self.record(name, unit.request_id(), unit.epoch());
        ApplyOutcome::Applied
    }

    /// Drops every entry for `name`.
    pub fn forget(&mut self, name: &ServiceName) -> bool {
        self.names.remove(name).is_some()
    }

    /// Number of request ids remembered for `name`.
    pub fn len_for(&self, name: &ServiceName) -> usize {
        self.names.get(name).map_or(0, |entries| entries.applied.len())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }
}
