//! Clock error types.

use thiserror::Error;
use xdn_types::NodeId;

/// Result type for fallible clock operations.
pub type ClockResult<T> = Result<T, ClockError>;

/// Errors from operations that relate two clocks or address a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    /// The clocks range over different node sets.
    #[error("incomparable vector clocks: {left} nodes vs {right} nodes with differing membership")]
    Incomparable { left: usize, right: usize },

    /// The node is not a member of the clock.
    #[error("unknown node {0} in vector clock")]
    UnknownNode(NodeId),
}

/// Errors from decoding the `VectorTimestamp/.../` text form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockParseError {
    /// The input does not start with `VectorTimestamp/`.
    #[error("missing VectorTimestamp/ prefix")]
    MissingPrefix,

    /// The input does not end with the closing `/`.
    #[error("missing closing '/'")]
    MissingSuffix,

    /// No `id:counter` pairs between the delimiters.
    #[error("vector clock has no entries")]
    Empty,

    /// A pair without exactly one `:` or with an empty node id.
    #[error("invalid pair {0:?}: expected <id>:<counter>")]
    InvalidPair(String),

    /// A counter that is not a non-negative 64-bit integer.
    #[error("invalid counter {value:?} for node {node}")]
    InvalidCounter { node: String, value: String },

    /// The same node id appears in more than one pair.
    #[error("node {0} appears more than once")]
    DuplicateNode(String),
}
