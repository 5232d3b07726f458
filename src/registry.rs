//! Request/response correlation over the jobs topics.
//!
//! [`JobsClient`] is the typed face of the jobs service: it publishes requests
//! (each stamped with a `clientToken`) and registers handlers for the
//! `accepted`/`rejected` response topics and the next-changed event topic.
//! Subscribing resolves only once the transport acknowledged it; callers must
//! finish subscribing before publishing the request whose response they need.
//!
//! [`CorrelationRegistry`] keeps requests that are awaited directly (the
//! pending-jobs listing) keyed by client token. Responses are delivered at
//! least once: unmatched or repeated tokens are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{OnceCell, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    GetPendingJobExecutionsRequest, GetPendingJobExecutionsResponse, JobId,
    NextJobExecutionChangedEvent, RejectedError, StartNextJobExecutionResponse,
    StartNextPendingJobExecutionRequest, UpdateJobExecutionRequest, UpdateJobExecutionResponse,
};
use crate::topics::{JobTopics, Response, SINGLE_LEVEL_WILDCARD, job_id_from_update_response};
use crate::transport::{Message, MessageHandler, QoS, Transport};

// ---------------------------------------------------------------------------
// Correlation registry
// ---------------------------------------------------------------------------

/// Final outcome of a correlated request.
#[derive(Debug, Clone)]
pub enum Outcome {
    Accepted(Value),
    Rejected(RejectedError),
}

struct PendingRequest {
    operation: &'static str,
    tx: oneshot::Sender<Outcome>,
}

/// Outstanding requests keyed by client token. Cheap to clone.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new pending request under a fresh client token.
    pub fn register(&self, operation: &'static str) -> RequestHandle {
        let token = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock()
            .insert(token.clone(), PendingRequest { operation, tx });
        RequestHandle {
            token,
            operation,
            rx,
            registry: self.clone(),
        }
    }

    /// Deliver an outcome. Returns false when no request is waiting on `token`
    /// (already resolved, timed out, or never ours).
    pub fn resolve(&self, token: &str, outcome: Outcome) -> bool {
        let Some(pending) = self.lock().remove(token) else {
            return false;
        };
        debug!(operation = pending.operation, token, "request resolved");
        pending.tx.send(outcome).is_ok()
    }

    pub fn forget(&self, token: &str) {
        self.lock().remove(token);
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

/// Waitable handle for one registered request. Dropping it forgets the request.
pub struct RequestHandle {
    token: String,
    operation: &'static str,
    rx: oneshot::Receiver<Outcome>,
    registry: CorrelationRegistry,
}

impl RequestHandle {
    pub fn client_token(&self) -> &str {
        &self.token
    }

    /// Wait for the accepted payload, a rejection, or the deadline.
    pub async fn wait(mut self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(Outcome::Accepted(value))) => Ok(value),
            Ok(Ok(Outcome::Rejected(rejected))) => Err(rejected.into_error(self.operation)),
            Ok(Err(_)) => Err(Error::Other(format!(
                "{} request abandoned",
                self.operation
            ))),
            Err(_) => Err(Error::Timeout(format!("{} response", self.operation))),
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.registry.forget(&self.token);
    }
}

// ---------------------------------------------------------------------------
// Jobs client
// ---------------------------------------------------------------------------

/// The jobs request kinds, each with its own request topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    GetPending,
    StartNext,
    Update(JobId),
}

impl RequestKind {
    pub fn operation(&self) -> &'static str {
        match self {
            RequestKind::GetPending => "get-pending",
            RequestKind::StartNext => "start-next",
            RequestKind::Update(_) => "update",
        }
    }

    fn topic(&self, topics: &JobTopics) -> String {
        match self {
            RequestKind::GetPending => topics.get_pending(),
            RequestKind::StartNext => topics.start_next(),
            RequestKind::Update(job_id) => topics.update(job_id.as_str()),
        }
    }

    fn response_topic(&self, topics: &JobTopics, response: Response) -> String {
        match self {
            RequestKind::GetPending => topics.get_pending_response(response),
            RequestKind::StartNext => topics.start_next_response(response),
            RequestKind::Update(job_id) => topics.update_response(job_id.as_str(), response),
        }
    }
}

fn decode<M: DeserializeOwned>(message: &Message) -> Result<M> {
    Ok(serde_json::from_slice(&message.payload)?)
}

fn with_client_token(payload: Value, token: &str) -> Result<Value> {
    match payload {
        Value::Object(mut map) => {
            map.insert("clientToken".to_string(), Value::String(token.to_string()));
            Ok(Value::Object(map))
        }
        other => Err(Error::Other(format!(
            "request payload must be a JSON object, got {other}"
        ))),
    }
}

/// Typed jobs operations for one thing over a shared transport.
pub struct JobsClient<T: Transport> {
    transport: Arc<T>,
    thing_name: String,
    topics: JobTopics,
    registry: CorrelationRegistry,
    qos: QoS,
    get_pending_ready: Arc<OnceCell<()>>,
}

impl<T: Transport> Clone for JobsClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            thing_name: self.thing_name.clone(),
            topics: self.topics.clone(),
            registry: self.registry.clone(),
            qos: self.qos,
            get_pending_ready: Arc::clone(&self.get_pending_ready),
        }
    }
}

impl<T: Transport> JobsClient<T> {
    pub fn new(transport: Arc<T>, thing_name: &str) -> Self {
        Self {
            transport,
            thing_name: thing_name.to_string(),
            topics: JobTopics::new(thing_name),
            registry: CorrelationRegistry::new(),
            qos: QoS::AtLeastOnce,
            get_pending_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    pub fn topics(&self) -> &JobTopics {
        &self.topics
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Publish a request and return its client token. A `clientToken` already
    /// in the payload is kept; otherwise a fresh one is generated.
    pub async fn submit_request(&self, kind: &RequestKind, payload: Value) -> Result<String> {
        let token = payload
            .get("clientToken")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.publish_with_token(kind, payload, &token).await?;
        Ok(token)
    }

    async fn publish_with_token(&self, kind: &RequestKind, payload: Value, token: &str) -> Result<()> {
        let topic = kind.topic(&self.topics);
        let payload = with_client_token(payload, token)?;
        let bytes = serde_json::to_vec(&payload)?;
        self.transport.publish(&topic, bytes, self.qos).await?;
        debug!(operation = kind.operation(), %topic, token, "request published");
        Ok(())
    }

    /// Publish a request and wait for its correlated outcome. The response
    /// topics for `kind` must already be routed into the registry.
    pub async fn request(&self, kind: &RequestKind, payload: Value, timeout: Duration) -> Result<Value> {
        let handle = self.registry.register(kind.operation());
        self.publish_with_token(kind, payload, handle.client_token())
            .await?;
        handle.wait(timeout).await
    }

    /// Register `handler` for `filter` and wait for the acknowledgement.
    pub async fn await_subscription(&self, filter: &str, handler: MessageHandler) -> Result<()> {
        self.transport.subscribe(filter, self.qos, handler).await?;
        info!(%filter, "subscribed");
        Ok(())
    }

    /// Route the accepted/rejected topics of `kind` into the registry.
    pub async fn correlate_responses(&self, kind: &RequestKind) -> Result<()> {
        let registry = self.registry.clone();
        let operation = kind.operation();
        let on_accepted: MessageHandler = Arc::new(move |message: Message| {
            match decode::<Value>(&message) {
                Ok(value) => {
                    let token = value
                        .get("clientToken")
                        .and_then(Value::as_str)
                        .map(str::to_owned);
                    match token {
                        Some(token) => {
                            if !registry.resolve(&token, Outcome::Accepted(value)) {
                                debug!(operation, %token, "dropping unmatched response");
                            }
                        }
                        None => debug!(operation, "dropping response without client token"),
                    }
                }
                Err(e) => warn!(operation, error = %e, "malformed accepted response"),
            }
        });

        let registry = self.registry.clone();
        let on_rejected: MessageHandler = Arc::new(move |message: Message| {
            match decode::<RejectedError>(&message) {
                Ok(rejected) => match rejected.client_token.clone() {
                    Some(token) => {
                        if !registry.resolve(&token, Outcome::Rejected(rejected)) {
                            debug!(operation, %token, "dropping unmatched rejection");
                        }
                    }
                    None => warn!(
                        operation,
                        code = %rejected.code,
                        message = %rejected.message,
                        "rejection without client token"
                    ),
                },
                Err(e) => warn!(operation, error = %e, "malformed rejected response"),
            }
        });

        self.await_subscription(&kind.response_topic(&self.topics, Response::Accepted), on_accepted)
            .await?;
        self.await_subscription(&kind.response_topic(&self.topics, Response::Rejected), on_rejected)
            .await
    }

    // -- typed operations ---------------------------------------------------

    pub async fn publish_start_next_pending_job_execution(
        &self,
        request: &StartNextPendingJobExecutionRequest,
    ) -> Result<String> {
        self.submit_request(&RequestKind::StartNext, to_value(request)?)
            .await
    }

    pub async fn publish_update_job_execution(
        &self,
        job_id: &JobId,
        request: &UpdateJobExecutionRequest,
    ) -> Result<String> {
        self.submit_request(&RequestKind::Update(job_id.clone()), to_value(request)?)
            .await
    }

    /// List in-progress and queued executions, waiting at most `timeout`.
    pub async fn get_pending_job_executions(
        &self,
        timeout: Duration,
    ) -> Result<GetPendingJobExecutionsResponse> {
        self.get_pending_ready
            .get_or_try_init(|| self.correlate_responses(&RequestKind::GetPending))
            .await?;
        let value = self
            .request(
                &RequestKind::GetPending,
                to_value(&GetPendingJobExecutionsRequest::default())?,
                timeout,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn subscribe_to_next_job_execution_changed_events<F>(&self, on_event: F) -> Result<()>
    where
        F: Fn(Result<NextJobExecutionChangedEvent>) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(move |message: Message| on_event(decode(&message)));
        self.await_subscription(&self.topics.notify_next(), handler)
            .await
    }

    pub async fn subscribe_to_start_next_accepted<F>(&self, on_accepted: F) -> Result<()>
    where
        F: Fn(Result<StartNextJobExecutionResponse>) + Send + Sync + 'static,
    {
        let handler: MessageHandler =
            Arc::new(move |message: Message| on_accepted(decode(&message)));
        self.await_subscription(
            &self.topics.start_next_response(Response::Accepted),
            handler,
        )
        .await
    }

    pub async fn subscribe_to_start_next_rejected<F>(&self, on_rejected: F) -> Result<()>
    where
        F: Fn(Result<RejectedError>) + Send + Sync + 'static,
    {
        let handler: MessageHandler =
            Arc::new(move |message: Message| on_rejected(decode(&message)));
        self.await_subscription(
            &self.topics.start_next_response(Response::Rejected),
            handler,
        )
        .await
    }

    /// Update responses for any job id (`+` wildcard); the id comes from the topic.
    pub async fn subscribe_to_update_accepted<F>(&self, on_accepted: F) -> Result<()>
    where
        F: Fn(Result<(JobId, UpdateJobExecutionResponse)>) + Send + Sync + 'static,
    {
        let handler: MessageHandler =
            Arc::new(move |message: Message| on_accepted(decode_update(&message)));
        self.await_subscription(
            &self
                .topics
                .update_response(SINGLE_LEVEL_WILDCARD, Response::Accepted),
            handler,
        )
        .await
    }

    pub async fn subscribe_to_update_rejected<F>(&self, on_rejected: F) -> Result<()>
    where
        F: Fn(Result<(JobId, RejectedError)>) + Send + Sync + 'static,
    {
        let handler: MessageHandler =
            Arc::new(move |message: Message| on_rejected(decode_update(&message)));
        self.await_subscription(
            &self
                .topics
                .update_response(SINGLE_LEVEL_WILDCARD, Response::Rejected),
            handler,
        )
        .await
    }
}

fn to_value<S: Serialize>(request: &S) -> Result<Value> {
    Ok(serde_json::to_value(request)?)
}

fn decode_update<M: DeserializeOwned>(message: &Message) -> Result<(JobId, M)> {
    let job_id = job_id_from_update_response(&message.topic).ok_or_else(|| {
        Error::Other(format!("no job id in update topic {}", message.topic))
    })?;
    Ok((JobId::from(job_id), decode(message)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_each_token_once() {
        let registry = CorrelationRegistry::new();
        let handle = registry.register("get-pending");
        let token = handle.client_token().to_string();
        assert_eq!(registry.pending_count(), 1);

        assert!(registry.resolve(&token, Outcome::Accepted(json!({"ok": true}))));
        assert!(!registry.resolve(&token, Outcome::Accepted(json!({"ok": true}))));

        let value = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn rejection_surfaces_code_and_message() {
        let registry = CorrelationRegistry::new();
        let handle = registry.register("get-pending");
        let token = handle.client_token().to_string();
        registry.resolve(
            &token,
            Outcome::Rejected(RejectedError::new("Throttled", "slow down")),
        );
        match handle.wait(Duration::from_secs(1)).await {
            Err(Error::Rejected { code, message, .. }) => {
                assert_eq!(code, "Throttled");
                assert_eq!(message, "slow down");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_removes_pending_request() {
        let registry = CorrelationRegistry::new();
        let handle = registry.register("get-pending");
        let token = handle.client_token().to_string();
        let result = handle.wait(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(registry.pending_count(), 0);
        assert!(!registry.resolve(&token, Outcome::Accepted(json!({}))));
    }

    #[test]
    fn dropped_handle_is_forgotten() {
        let registry = CorrelationRegistry::new();
        drop(registry.register("get-pending"));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn submit_keeps_a_caller_supplied_token() {
        let broker = crate::transport::memory::MemoryBroker::new();
        let client = JobsClient::new(Arc::new(broker.connect("agent")), "t1");
        let request = StartNextPendingJobExecutionRequest {
            client_token: Some("mine".to_string()),
            ..Default::default()
        };
        let token = client
            .publish_start_next_pending_job_execution(&request)
            .await
            .unwrap();
        assert_eq!(token, "mine");

        let fresh = client
            .publish_start_next_pending_job_execution(&StartNextPendingJobExecutionRequest::default())
            .await
            .unwrap();
        assert_ne!(fresh, "mine");
    }

    #[test]
    fn client_token_requires_object_payload() {
        let value = with_client_token(json!({"status": "SUCCEEDED"}), "t-1").unwrap();
        assert_eq!(value["clientToken"], "t-1");
        assert!(with_client_token(json!([1, 2]), "t-1").is_err());
    }
}
