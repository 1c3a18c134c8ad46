//! Coordinator configuration.
//!
//! Replication factors decide how many nodes a newly created name is placed
//! on; timeouts bound the two suspension points of every operation (waiting
//! for a consensus decision and waiting for a transfer acknowledgment).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use xdn_transfer::LedgerConfig;

// ============================================================================
// Coordinator Configuration
// ============================================================================

/// Configuration for a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Active replicas assigned to a newly created name.
    pub replication_factor: usize,

    /// Reconfigurators assigned to a newly created name.
    pub rc_replication_factor: usize,

    /// Retransmissions of a state transfer unit after the first send.
    pub transfer_retries: u32,

    /// Re-proposals of an identical proposal whose decision timed out.
    pub decision_retries: u32,

    /// Protocol timeouts.
    pub timeouts: TimeoutConfig,

    /// Request ids each node remembers per name.
    pub ledger_max_entries_per_name: usize,
}

impl CoordinatorConfig {
    /// Creates a configuration with the given replication factors.
    ///
    /// # Panics
    ///
    /// Panics if either factor is zero.
    pub fn new(replication_factor: usize, rc_replication_factor: usize) -> Self {
        assert!(replication_factor > 0, "replication factor must be positive");
        assert!(
            rc_replication_factor > 0,
            "reconfigurator replication factor must be positive"
        );
        Self {
            replication_factor,
            rc_replication_factor,
            ..Self::default()
        }
    }

    /// Configuration for deterministic simulation: short timeouts, small ledgers.
    pub fn simulation() -> Self {
        Self {
            transfer_retries: 3,
            decision_retries: 2,
            timeouts: TimeoutConfig::simulation(),
            ledger_max_entries_per_name: LedgerConfig::simulation().max_entries_per_name,
            ..Self::default()
        }
    }

    /// Configuration for local development.
    pub fn development() -> Self {
        Self {
            timeouts: TimeoutConfig::development(),
            ..Self::default()
        }
    }

    /// Sets the timeout configuration.
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the number of transfer retransmissions.
    pub fn with_transfer_retries(mut self, retries: u32) -> Self {
        self.transfer_retries = retries;
        self
    }

    /// Sets the number of re-proposals after a decision timeout.
    pub fn with_decision_retries(mut self, retries: u32) -> Self {
        self.decision_retries = retries;
        self
    }

    /// Sets both replication factors.
    pub fn with_replication(mut self, active: usize, reconfigurators: usize) -> Self {
        self.replication_factor = active;
        self.rc_replication_factor = reconfigurators;
        self
    }

    /// Ledger configuration handed to every node.
    pub fn ledger(&self) -> LedgerConfig {
        LedgerConfig {
            max_entries_per_name: self.ledger_max_entries_per_name,
        }
    }

    /// Total sends of one unit before a transfer is declared failed.
    pub fn transfer_attempts(&self) -> u32 {
        self.transfer_retries.saturating_add(1)
    }

    /// Total proposals of one change before its outcome is declared unknown.
    pub fn decision_attempts(&self) -> u32 {
        self.decision_retries.saturating_add(1)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            rc_replication_factor: 3,
            transfer_retries: 5,
            decision_retries: 2,
            timeouts: TimeoutConfig::default(),
            ledger_max_entries_per_name: LedgerConfig::default().max_entries_per_name,
        }
    }
}

// ============================================================================
// Timeout Configuration
// ============================================================================

/// Timeouts for coordinator suspension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Time to wait for consensus to decide a proposal.
    pub decision_timeout: Duration,

    /// Time to wait for a node to acknowledge one send of a transfer unit.
    pub ack_timeout: Duration,

    /// Pause between retransmissions of an unacknowledged unit.
    pub retry_backoff: Duration,
}

impl TimeoutConfig {
    /// Uses very short intervals for fast test execution.
    pub fn simulation() -> Self {
        Self {
            decision_timeout: Duration::from_millis(50),
            ack_timeout: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(1),
        }
    }

    pub fn development() -> Self {
        Self {
            decision_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_millis(250),
            retry_backoff: Duration::from_millis(50),
        }
    }

    /// Longer intervals to ride out network variability.
    pub fn production() -> Self {
        Self {
            decision_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::production()
    }
}
