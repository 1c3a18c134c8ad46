//! The state transfer unit and its text envelope.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xdn_types::{Epoch, RequestId, ServiceName};

use crate::apply::StateApplier;

/// Leading component shared by every `xdn` envelope type.
pub const ENVELOPE_PREFIX: &str = "xdn";

/// Envelope type tag of a state transfer unit.
pub const TYPE_TAG: u32 = 31303;

/// Errors from decoding a unit whose envelope prefix matched.
#[derive(Debug, Error)]
pub enum UnitParseError {
    /// The JSON body is malformed or lacks a required field.
    #[error("malformed state transfer unit: {0}")]
    Json(#[from] serde_json::Error),

    /// The `sn` field is present but empty.
    #[error("state transfer unit has an empty service name")]
    EmptyServiceName,
}

/// JSON body of the envelope. The request id travels as a signed 64-bit
/// integer; ids above `i64::MAX` appear negative on the wire and decode back
/// to the same id.
#[derive(Serialize, Deserialize)]
struct WireUnit {
    sn: String,
    sd: String,
    id: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    ep: u64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &u64) -> bool {
    *value == 0
}

#[allow(clippy::cast_possible_wrap)]
fn id_to_wire(id: RequestId) -> i64 {
    id.as_u64() as i64
}

#[allow(clippy::cast_sign_loss)]
fn id_from_wire(id: i64) -> RequestId {
    RequestId::new(id as u64)
}

// ============================================================================
// State Transfer Unit
// ============================================================================

/// An addressed, immutable unit of opaque state for one service name.
///
/// Equality and hashing consider only the request id.
#[derive(Debug, Clone)]
pub struct StateTransferUnit {
    service_name: ServiceName,
    statediff: String,
    request_id: RequestId,
    epoch: Epoch,
}

impl StateTransferUnit {
    pub fn new(
        service_name: ServiceName,
        statediff: impl Into<String>,
        request_id: RequestId,
        epoch: Epoch,
    ) -> Self {
        Self {
            service_name,
            statediff: statediff.into(),
            request_id,
            epoch,
        }
    }

    pub fn service_name(&self) -> &ServiceName {
        &self.service_name
    }

    pub fn statediff(&self) -> &str {
        &self.statediff
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// The epoch whose membership this unit installs.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Computes the state that results from applying this unit to `current`.
    pub fn apply_to<A>(&self, applier: &A, current: Option<&str>) -> String
    where
        A: StateApplier + ?Sized,
    {
        applier.apply(current, &self.statediff)
    }

    // ========================================================================
    // Envelope
    // ========================================================================

    /// Encodes the unit as `xdn:31303:<json>`.
    pub fn encode(&self) -> String {
        let wire = WireUnit {
            sn: self.service_name.as_str().to_string(),
            sd: self.statediff.clone(),
            id: id_to_wire(self.request_id),
            ep: self.epoch.as_u64(),
        };
        // Serializing a struct of strings and integers cannot fail.
        let json = serde_json::to_string(&wire).unwrap_or_default();
        format!("{ENVELOPE_PREFIX}:{TYPE_TAG}:{json}")
    }

    /// Decodes an envelope.
    ///
    /// Returns `Ok(None)` if `encoded` is not a state transfer unit, so
    /// callers can probe several envelope types in turn.
    pub fn decode(encoded: &str) -> Result<Option<Self>, UnitParseError> {
        let Some(json) = strip_envelope(encoded) else {
            return Ok(None);
        };

        let wire: WireUnit = serde_json::from_str(json)?;
        if wire.sn.is_empty() {
            return Err(UnitParseError::EmptyServiceName);
        }

        Ok(Some(Self {
            service_name: ServiceName::from(wire.sn),
            statediff: wire.sd,
            request_id: id_from_wire(wire.id),
            epoch: Epoch::new(wire.ep),
        }))
    }
}

fn strip_envelope(encoded: &str) -> Option<&str> {
    let rest = encoded.strip_prefix(ENVELOPE_PREFIX)?.strip_prefix(':')?;
    let (tag, json) = rest.split_once(':')?;
    (tag.parse::<u32>().ok()? == TYPE_TAG).then_some(json)
}

impl PartialEq for StateTransferUnit {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for StateTransferUnit {}

impl Hash for StateTransferUnit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.request_id.hash(state);
    }
}
