//! # xdn-transfer: State transfer for `xdn`
//!
//! A [`StateTransferUnit`] carries an opaque statediff for one service name
//! to a replica that is joining the name's active set. The envelope
//! (service name, request id, epoch) is interpreted here; the payload is not.
//!
//! ## Wire form
//!
//! ```text
//! xdn:31303:{"sn":"<service name>","sd":"<statediff>","id":<request id>}
//! ```
//!
//! Units produced under a non-zero epoch additionally carry `"ep":<epoch>`.
//! Readers that predate the field treat it as epoch zero.
//!
//! ## Idempotence
//!
//! A unit is identified solely by its request id. Each replica keeps an
//! [`ApplyLedger`] of the ids it has applied per name and reports a
//! re-delivered unit as [`ApplyOutcome::AlreadyApplied`] instead of running
//! the applier a second time.
//!
//! ```text
//! unit arrives ──► ledger.check(name, id) ──► seen?  ──► AlreadyApplied
//!                          │ new
//!                          ▼
//!                  applier.apply(state, sd)
//!                          │
//!                          ▼
//!                  ledger.record(name, id, epoch) ──► Applied
//! ```

mod apply;
mod ledger;
mod unit;

pub use apply::{ReplaceState, StateApplier};
pub use ledger::{ApplyLedger, ApplyOutcome, DEFAULT_MAX_ENTRIES_PER_NAME, LedgerConfig};
pub use unit::{ENVELOPE_PREFIX, StateTransferUnit, TYPE_TAG, UnitParseError};
