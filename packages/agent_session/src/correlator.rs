//! RequestCorrelator: request/response exchanges over a channel, matched on
//! `requestId`.
//!
//! A request registers its pending entry before the payload goes out, so a
//! response can never race ahead of the bookkeeping. Each entry is removed
//! exactly once, by whichever of response, timeout, send failure or
//! cancellation gets to it first; that remover is the only one that answers
//! the caller.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RequestOptions;
use crate::connection::ConnectionManager;
use crate::error::SessionError;
use crate::router::{MetadataRouter, Subscription};
use crate::store::{Entity, EntityStore};
use crate::types::{ChannelId, ChannelStatus, MetadataMessage};

/// Generate a fresh correlation id.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// An outbound request: `{ messageType, requestId, <fields> }`.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub message_type: String,
    pub fields: Map<String, Value>,
    /// Generated when absent.
    pub request_id: Option<String>,
}

impl RequestSpec {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            fields: Map::new(),
            request_id: None,
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    fn payload(&self, request_id: &str) -> Value {
        let mut obj = self.fields.clone();
        obj.insert("messageType".into(), Value::String(self.message_type.clone()));
        obj.insert("requestId".into(), Value::String(request_id.to_string()));
        Value::Object(obj)
    }
}

/// Where the entity carried by a response goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTarget {
    /// Response field holding the entity, e.g. `document`.
    pub response_field: String,
    /// Entity type applied when the payload has none.
    pub entity_type: String,
    pub category: String,
    /// Category key; defaults to the entity id.
    pub key: Option<String>,
}

impl EntityTarget {
    pub fn new(
        response_field: impl Into<String>,
        entity_type: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            response_field: response_field.into(),
            entity_type: entity_type.into(),
            category: category.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

#[derive(Debug)]
enum Resolution {
    Payload(Value),
    Entity(Entity),
}

struct PendingRequest {
    channel: ChannelId,
    target: Option<EntityTarget>,
    respond_to: oneshot::Sender<Result<Resolution, SessionError>>,
    created_at: Instant,
}

struct CorrelatorInner {
    pending: Mutex<HashMap<String, PendingRequest>>,
    connections: Arc<ConnectionManager>,
    store: Arc<EntityStore>,
    options: RequestOptions,
}

impl CorrelatorInner {
    /// Match a routed message against the pending set. Unknown and
    /// already-settled ids are ignored.
    fn handle_response(&self, message: &MetadataMessage) {
        let Some(request_id) = message.data.get("requestId").and_then(Value::as_str) else {
            return;
        };
        let Some(pending) = self.pending.lock().remove(request_id) else {
            debug!(request_id, "response for unknown or settled request ignored");
            return;
        };
        if pending.channel != message.channel {
            debug!(
                request_id,
                sent_on = %pending.channel,
                answered_on = %message.channel,
                "response arrived on a different channel"
            );
        }

        let outcome = self.resolve(request_id, pending.target.as_ref(), &message.data);
        match &outcome {
            Ok(_) => info!(
                request_id,
                channel = %message.channel,
                elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                "request resolved"
            ),
            Err(e) => warn!(request_id, code = e.error_code(), "request rejected: {}", e),
        }
        let _ = pending.respond_to.send(outcome);
    }

    fn resolve(
        &self,
        request_id: &str,
        target: Option<&EntityTarget>,
        data: &Value,
    ) -> Result<Resolution, SessionError> {
        if let Some(error) = data.get("error").and_then(Value::as_str) {
            return Err(SessionError::Remote(error.to_string()));
        }
        let Some(target) = target else {
            return Ok(Resolution::Payload(data.clone()));
        };

        let raw = data.get(&target.response_field).ok_or_else(|| {
            SessionError::MalformedMessage(format!(
                "response to {request_id} has no `{}` field",
                target.response_field
            ))
        })?;
        let entity = Entity::from_payload(raw, &target.entity_type)?;
        let key = target.key.clone().unwrap_or_else(|| entity.id.clone());
        self.store
            .add_entity_to_category(&target.category, &key, entity.clone());
        Ok(Resolution::Entity(entity))
    }

    fn take(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.lock().remove(request_id)
    }
}

/// Drops the pending entry when the request future goes away before it
/// settles (outer timeout, `select!`, aborted task).
struct PendingGuard<'a> {
    inner: &'a CorrelatorInner,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.inner.take(&self.request_id).is_some() {
            debug!(request_id = %self.request_id, "request abandoned before it settled");
        }
    }
}

/// Sends correlated requests and settles them from routed responses.
pub struct RequestCorrelator {
    inner: Arc<CorrelatorInner>,
    _responses: Subscription,
}

impl RequestCorrelator {
    pub fn new(
        connections: Arc<ConnectionManager>,
        store: Arc<EntityStore>,
        router: &MetadataRouter,
        options: RequestOptions,
    ) -> Self {
        let inner = Arc::new(CorrelatorInner {
            pending: Mutex::new(HashMap::new()),
            connections,
            store,
            options,
        });
        let weak: Weak<CorrelatorInner> = Arc::downgrade(&inner);
        let responses = router.subscribe_all("request-correlator", None, move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_response(message);
            }
        });
        Self {
            inner,
            _responses: responses,
        }
    }

    /// Send `spec` on `channel` and wait for the correlated response payload.
    pub async fn request(&self, channel: &ChannelId, spec: RequestSpec) -> Result<Value, SessionError> {
        match self.submit(channel, spec, None).await? {
            Resolution::Payload(value) => Ok(value),
            Resolution::Entity(entity) => serde_json::to_value(entity)
                .map_err(|e| SessionError::MalformedMessage(e.to_string())),
        }
    }

    /// Send `spec`, then store the entity found under `target.response_field`
    /// of the response in `target.category` and return it.
    pub async fn fetch_entity(
        &self,
        channel: &ChannelId,
        spec: RequestSpec,
        target: EntityTarget,
    ) -> Result<Entity, SessionError> {
        match self.submit(channel, spec, Some(target)).await? {
            Resolution::Entity(entity) => Ok(entity),
            Resolution::Payload(_) => Err(SessionError::MalformedMessage(
                "response carried no entity".to_string(),
            )),
        }
    }

    async fn submit(
        &self,
        channel: &ChannelId,
        spec: RequestSpec,
        target: Option<EntityTarget>,
    ) -> Result<Resolution, SessionError> {
        let request_id = spec.request_id.clone().unwrap_or_else(new_request_id);
        let payload = spec.payload(&request_id);

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(&request_id) {
                return Err(SessionError::MalformedMessage(format!(
                    "request id {request_id} is already pending"
                )));
            }
            pending.insert(
                request_id.clone(),
                PendingRequest {
                    channel: channel.clone(),
                    target,
                    respond_to: tx,
                    created_at: Instant::now(),
                },
            );
        }
        let _abandon = PendingGuard {
            inner: &self.inner,
            request_id: request_id.clone(),
        };

        if let Err(e) = self.send_with_retry(channel, &request_id, &payload).await {
            // The response may still have won the race; its answer stands.
            if self.inner.take(&request_id).is_some() {
                return Err(e);
            }
            return rx.await.unwrap_or(Err(SessionError::SessionClosed));
        }
        debug!(request_id = %request_id, channel = %channel, message_type = %spec.message_type, "request sent");

        let timeout = self.inner.options.timeout;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(result) => result.unwrap_or(Err(SessionError::SessionClosed)),
            Err(_) => {
                if self.inner.take(&request_id).is_some() {
                    warn!(request_id = %request_id, channel = %channel, "request timed out");
                    return Err(SessionError::RequestTimeout {
                        request_id,
                        after: timeout,
                    });
                }
                rx.await.unwrap_or(Err(SessionError::SessionClosed))
            }
        }
    }

    /// Wait for readiness, then send. Transient send failures are retried a
    /// bounded number of times with the same request id.
    async fn send_with_retry(
        &self,
        channel: &ChannelId,
        request_id: &str,
        payload: &Value,
    ) -> Result<(), SessionError> {
        let options = &self.inner.options;
        let connections = &self.inner.connections;
        let mut attempt = 0;
        loop {
            if connections.status(channel) != Some(ChannelStatus::Connected) {
                debug!(request_id, channel = %channel, "waiting for channel readiness");
                connections
                    .wait_until_connected(channel, options.readiness_wait)
                    .await?;
            }
            match connections.send_message(channel, payload).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < options.max_retries => {
                    attempt += 1;
                    warn!(
                        request_id,
                        channel = %channel,
                        attempt,
                        "send failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(options.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Reject every pending request on `channel` with `error`.
    pub fn fail_channel(&self, channel: &ChannelId, error: SessionError) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.inner.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.channel == *channel)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = failed.len();
        for p in failed {
            let _ = p.respond_to.send(Err(error.clone()));
        }
        count
    }

    /// Reject every pending request with `SessionClosed`.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingRequest> = self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for p in drained {
            let _ = p.respond_to.send(Err(SessionError::SessionClosed));
        }
        if count > 0 {
            info!(count, "pending requests cancelled");
        }
        count
    }
}
