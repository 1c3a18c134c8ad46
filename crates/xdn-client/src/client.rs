//! Asynchronous request submission with per-request callbacks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use xdn_reconfig::{Consensus, Coordinator, Transport};
use xdn_types::{NodeSet, RequestId, RequestIdGenerator, ServiceName};

use crate::{
    error::{ClientError, ClientResult},
    message::{NameAck, Request, Response},
};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Longest wait for a single response.
    pub request_timeout: Duration,
    /// Pause between retransmissions.
    pub retry_interval: Duration,
    /// Sends of one request before giving up.
    pub max_retries: u32,
}

impl ClientConfig {
    /// Short waits for deterministic simulation.
    pub fn simulation() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(10),
            max_retries: 20,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(500),
            max_retries: 10,
        }
    }
}

// ============================================================================
// Callback Registry
// ============================================================================

/// Outstanding requests, each waiting on a single-shot channel.
///
/// A response resolves its request at most once: the first
/// [`complete`](Self::complete) removes the entry, so a late or duplicate
/// response for the same id finds nothing and is dropped.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Response>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` and returns the receiving end of its callback.
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<Response> {
        let (sender, receiver) = oneshot::channel();
        if self.lock().insert(id, sender).is_some() {
            warn!(request = %id, "request id registered twice, earlier waiter dropped");
        }
        receiver
    }

    /// Resolves `id` with `response`. Returns false if nothing was waiting.
    pub fn complete(&self, id: RequestId, response: Response) -> bool {
        let Some(sender) = self.lock().remove(&id) else {
            debug!(request = %id, "late response dropped");
            return false;
        };
        sender.send(response).is_ok()
    }

    /// Forgets `id` without resolving it.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Number of requests still waiting.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Response>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Client
// ============================================================================

/// A submitted request awaiting its response.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    receiver: oneshot::Receiver<Response>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

/// Submits requests to a [`Coordinator`] and waits on their callbacks.
///
/// Several clients may share one [`CallbackRegistry`]; request ids are drawn
/// from a shared generator so they never collide.
#[derive(Debug)]
pub struct Client<C, T> {
    coordinator: Arc<Coordinator<C, T>>,
    registry: Arc<CallbackRegistry>,
    request_ids: Arc<RequestIdGenerator>,
    config: ClientConfig,
}

impl<C, T> Clone for Client<C, T> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            registry: Arc::clone(&self.registry),
            request_ids: Arc::clone(&self.request_ids),
            config: self.config,
        }
    }
}

impl<C, T> Client<C, T>
where
    C: Consensus + 'static,
    T: Transport + 'static,
{
    pub fn new(
        coordinator: Arc<Coordinator<C, T>>,
        registry: Arc<CallbackRegistry>,
        request_ids: Arc<RequestIdGenerator>,
        config: ClientConfig,
    ) -> Self {
        Self {
            coordinator,
            registry,
            request_ids,
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Submits `request` without waiting for it.
    ///
    /// The request runs on its own task and resolves the returned handle
    /// once the coordinator has finished with it.
    pub fn send(&self, request: Request) -> RequestHandle {
        let id = self.request_ids.next_id();
        let receiver = self.registry.register(id);
        debug!(request = %id, kind = request.kind(), "request sent");

        let coordinator = Arc::clone(&self.coordinator);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let response = execute(&coordinator, request).await;
            registry.complete(id, response);
        });

        RequestHandle { id, receiver }
    }

    /// Waits up to `timeout` for `handle`'s response.
    ///
    /// On timeout the callback is unregistered, so a response that arrives
    /// later is dropped rather than delivered to a stale waiter.
    pub async fn wait(&self, handle: RequestHandle, timeout: Duration) -> ClientResult<Response> {
        let RequestHandle { id, receiver } = handle;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::Dropped(id)),
            Err(_) => {
                self.registry.cancel(id);
                Err(ClientError::Timeout {
                    request: id,
                    waited: timeout,
                })
            }
        }
    }

    /// Sends `request` and waits for its response with the configured timeout.
    pub async fn request(&self, request: Request) -> ClientResult<Response> {
        let handle = self.send(request);
        self.wait(handle, self.config.request_timeout).await
    }

    /// Resends `request` until a response satisfies `done`.
    ///
    /// Timeouts and unsatisfying responses both count as attempts. Suited to
    /// reads, and to writes whose predicate also accepts what a repeat of an
    /// already applied write reports.
    pub async fn request_until<F>(&self, request: Request, done: F) -> ClientResult<Response>
    where
        F: Fn(&Response) -> bool,
    {
        let kind = request.kind();
        for attempt in 1..=self.config.max_retries {
            match self.request(request.clone()).await {
                Ok(response) if done(&response) => return Ok(response),
                Ok(response) => debug!(kind, attempt, ?response, "retrying"),
                Err(e) if e.is_retryable() => debug!(kind, attempt, error = %e, "retrying"),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
        Err(ClientError::RetriesExhausted {
            kind,
            attempts: self.config.max_retries,
        })
    }

    /// Retries until `name` reports active replicas.
    pub async fn wait_for_exists(&self, name: &ServiceName) -> ClientResult<Response> {
        self.request_until(Request::active_replicas(name.clone()), |r| !r.is_failed())
            .await
    }

    /// Retries until `name` reports no active replicas.
    pub async fn wait_for_not_exists(&self, name: &ServiceName) -> ClientResult<Response> {
        self.request_until(Request::active_replicas(name.clone()), Response::is_failed)
            .await
    }
}

/// Runs one request against the coordinator.
async fn execute<C: Consensus, T: Transport>(
    coordinator: &Coordinator<C, T>,
    request: Request,
) -> Response {
    match request {
        Request::Create {
            name,
            initial_state,
        } => {
            let result = coordinator.create(name.clone(), initial_state).await;
            Response::Created(NameAck::from_result(name, result))
        }
        Request::CreateBatch { entries } => {
            let entries = entries
                .into_iter()
                .map(|e| (e.name, e.initial_state))
                .collect();
            let results = coordinator
                .create_batch(entries)
                .await
                .into_iter()
                .map(|(name, result)| NameAck::from_result(name, result))
                .collect();
            Response::BatchCreated { results }
        }
        Request::Delete { name } => {
            let result = coordinator.delete(name.clone()).await;
            Response::Deleted(NameAck::from_result(name, result))
        }
        Request::ActiveReplicas { name } => match coordinator.record(&name) {
            Some(record) => Response::ActiveReplicasInfo {
                name,
                failed: false,
                replicas: record.active,
                epoch: Some(record.epoch),
            },
            None => Response::ActiveReplicasInfo {
                name,
                failed: true,
                replicas: NodeSet::new(),
                epoch: None,
            },
        },
        Request::Reconfigure { change } => {
            Response::from_reconfigure(coordinator.reconfigure(change).await)
        }
        Request::NodeConfig { group, add, remove } => Response::from_node_config(
            coordinator.reconfigure_node_config(group, add, remove).await,
        ),
        Request::App { name, request } => match coordinator.app_request(&name, request).await {
            Ok(response) => Response::AppResponse { name, response },
            Err(e) => Response::AppError {
                name,
                message: e.to_string(),
            },
        },
    }
}
