//! Client error types.

use std::time::Duration;

use thiserror::Error;
use xdn_reconfig::ReconfigError;
use xdn_types::RequestId;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur while waiting on a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// No response arrived within the wait bound.
    #[error("{request} timed out after {waited:?}")]
    Timeout { request: RequestId, waited: Duration },

    /// The request was abandoned without a response.
    #[error("{0} was dropped before a response arrived")]
    Dropped(RequestId),

    /// Retransmission stopped before the expected outcome was observed.
    #[error("gave up on {kind} after {attempts} attempt(s)")]
    RetriesExhausted { kind: &'static str, attempts: u32 },

    /// A cluster description could not be used.
    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),

    /// The coordinator refused the request outright.
    #[error(transparent)]
    Reconfig(#[from] ReconfigError),
}

impl ClientError {
    /// True for errors after which the same request may be sent again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Timeout { .. } | ClientError::Dropped(_) => true,
            ClientError::RetriesExhausted { .. } | ClientError::InvalidSpec(_) => false,
            ClientError::Reconfig(e) => e.is_retryable(),
        }
    }
}
