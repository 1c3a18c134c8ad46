//! Requests a client submits and the responses that resolve them.
//!
//! ## Requests
//! - [`Request::Create`] / [`Request::CreateBatch`] - create names
//! - [`Request::Delete`] - delete (tombstone) a name
//! - [`Request::ActiveReplicas`] - read a name's active replicas
//! - [`Request::Reconfigure`] - change one name's membership
//! - [`Request::NodeConfig`] - change a node pool and migrate affected names
//! - [`Request::App`] - opaque application request
//!
//! Every request resolves to exactly one [`Response`]. Responses are matched
//! by variant, never by inspecting a payload.

use serde::{Deserialize, Serialize};
use xdn_clock::VectorClock;
use xdn_reconfig::{Ack, MembershipChange, NodeConfigAck, ReconfigError, ReconfigResult};
use xdn_types::{Epoch, NodeGroup, NodeSet, ServiceName};

// ============================================================================
// Requests
// ============================================================================

/// A request to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Create {
        name: ServiceName,
        initial_state: String,
    },
    CreateBatch {
        entries: Vec<NameAndState>,
    },
    Delete {
        name: ServiceName,
    },
    ActiveReplicas {
        name: ServiceName,
    },
    Reconfigure {
        change: MembershipChange,
    },
    NodeConfig {
        group: NodeGroup,
        #[serde(default)]
        add: NodeSet,
        #[serde(default)]
        remove: NodeSet,
    },
    App {
        name: ServiceName,
        request: String,
    },
}

/// One entry of a batched create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAndState {
    pub name: ServiceName,
    pub initial_state: String,
}

impl Request {
    pub fn create(name: impl Into<ServiceName>, initial_state: impl Into<String>) -> Self {
        Request::Create {
            name: name.into(),
            initial_state: initial_state.into(),
        }
    }

    pub fn create_batch<I, N, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<ServiceName>,
        S: Into<String>,
    {
        Request::CreateBatch {
            entries: entries
                .into_iter()
                .map(|(name, state)| NameAndState {
                    name: name.into(),
                    initial_state: state.into(),
                })
                .collect(),
        }
    }

    pub fn delete(name: impl Into<ServiceName>) -> Self {
        Request::Delete { name: name.into() }
    }

    pub fn active_replicas(name: impl Into<ServiceName>) -> Self {
        Request::ActiveReplicas { name: name.into() }
    }

    pub fn app(name: impl Into<ServiceName>, request: impl Into<String>) -> Self {
        Request::App {
            name: name.into(),
            request: request.into(),
        }
    }

    pub fn node_config(group: NodeGroup, add: NodeSet, remove: NodeSet) -> Self {
        Request::NodeConfig { group, add, remove }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Create { .. } => "create",
            Request::CreateBatch { .. } => "create_batch",
            Request::Delete { .. } => "delete",
            Request::ActiveReplicas { .. } => "active_replicas",
            Request::Reconfigure { .. } => "reconfigure",
            Request::NodeConfig { .. } => "node_config",
            Request::App { .. } => "app",
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// The outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Created(NameAck),
    BatchCreated {
        results: Vec<NameAck>,
    },
    Deleted(NameAck),
    ActiveReplicasInfo {
        name: ServiceName,
        failed: bool,
        #[serde(default)]
        replicas: NodeSet,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        epoch: Option<Epoch>,
    },
    ReconfigureAck {
        failed: bool,
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stamp: Option<VectorClock>,
    },
    AppResponse {
        name: ServiceName,
        response: String,
    },
    AppError {
        name: ServiceName,
        message: String,
    },
}

/// Per-name acknowledgment of a create or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAck {
    pub name: ServiceName,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamp: Option<VectorClock>,
}

impl NameAck {
    pub(crate) fn from_result(name: ServiceName, result: ReconfigResult<Ack>) -> Self {
        match result {
            Ok(ack) => Self {
                name,
                failed: false,
                message: None,
                stamp: Some(ack.stamp),
            },
            Err(e) => Self {
                name,
                failed: true,
                message: Some(e.to_string()),
                stamp: None,
            },
        }
    }
}

impl Response {
    /// True if the request did not take effect.
    pub fn is_failed(&self) -> bool {
        match self {
            Response::Created(ack) | Response::Deleted(ack) => ack.failed,
            Response::BatchCreated { results } => results.iter().any(|ack| ack.failed),
            Response::ActiveReplicasInfo { failed, .. } | Response::ReconfigureAck { failed, .. } => {
                *failed
            }
            Response::AppResponse { .. } => false,
            Response::AppError { .. } => true,
        }
    }

    pub(crate) fn from_reconfigure(result: ReconfigResult<Ack>) -> Self {
        match result {
            Ok(ack) => Response::ReconfigureAck {
                failed: false,
                summary: format!(
                    "{} at {}: active {:?}, reconfigurators {:?}",
                    ack.record.name,
                    ack.record.epoch,
                    names(&ack.record.active),
                    names(&ack.record.reconfigurators),
                ),
                stamp: Some(ack.stamp),
            },
            Err(e) => Response::reconfigure_failed(&e),
        }
    }

    pub(crate) fn from_node_config(result: ReconfigResult<NodeConfigAck>) -> Self {
        match result {
            Ok(ack) => Response::ReconfigureAck {
                failed: ack.is_failed(),
                summary: ack.summary,
                stamp: None,
            },
            Err(e) => Response::reconfigure_failed(&e),
        }
    }

    fn reconfigure_failed(error: &ReconfigError) -> Self {
        Response::ReconfigureAck {
            failed: true,
            summary: error.to_string(),
            stamp: None,
        }
    }
}

fn names(nodes: &NodeSet) -> Vec<&str> {
    nodes.iter().map(xdn_types::NodeId::as_str).collect()
}
