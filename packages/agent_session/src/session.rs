//! Session: owns one set of channels and the components built on them.
//!
//! `Session::start` wires the store, router, processor, connection manager
//! and correlator together and spawns the pump task. The pump is the only
//! consumer of inbound frames, so frames are processed one at a time in
//! arrival order.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, Connector, InboundFrame};
use crate::correlator::{EntityTarget, RequestCorrelator, RequestSpec};
use crate::error::SessionError;
use crate::processor::MessageProcessor;
use crate::router::{MetadataRouter, Subscription};
use crate::store::{Entity, EntityStore};
use crate::types::{
    ChannelId, ConnectionEvent, MetadataMessage, SessionEvent, SystemMessage, SystemMessageKind,
};

/// Message types carrying server-pushed entity updates.
pub const ENTITY_UPDATE_TYPES: [&str; 2] = ["ENTITY_UPDATE", "EntityUpdate"];

pub struct Session {
    config: SessionConfig,
    connections: Arc<ConnectionManager>,
    processor: Arc<MessageProcessor>,
    router: MetadataRouter,
    store: Arc<EntityStore>,
    correlator: RequestCorrelator,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    _entity_updates: Subscription,
}

impl Session {
    /// Build every component and start the pump. Must be called from within
    /// a tokio runtime.
    pub fn start(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let capacity = config.events.capacity;
        let (events, _) = broadcast::channel(capacity);

        let router = MetadataRouter::new();
        let store = Arc::new(EntityStore::new());
        let processor = Arc::new(MessageProcessor::new(
            router.clone(),
            events,
            config.events.legacy_system_messages,
        ));
        let (connections, inbound) =
            ConnectionManager::new(connector, config.connection.clone(), capacity);
        let connections = Arc::new(connections);
        let correlator = RequestCorrelator::new(
            connections.clone(),
            store.clone(),
            &router,
            config.requests.clone(),
        );

        let entity_updates = {
            let store = store.clone();
            let processor = Arc::downgrade(&processor);
            router.subscribe("entity-updates", ENTITY_UPDATE_TYPES, None, move |message| {
                apply_entity_update(&store, &processor, message);
            })
        };

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(run_pump(
            inbound,
            connections.subscribe(),
            processor.clone(),
            cancel.clone(),
        ));
        info!(
            endpoint = %config.connection.endpoint,
            capacity,
            "session started"
        );

        Self {
            config,
            connections,
            processor,
            router,
            store,
            correlator,
            cancel,
            pump: Mutex::new(Some(pump)),
            _entity_updates: entity_updates,
        }
    }

    /// Reconcile the open channels against `channels`. Requests still pending
    /// on a dropped channel are rejected and its history is forgotten.
    pub async fn open_channels(&self, channels: &[ChannelId]) {
        let wanted: HashSet<&ChannelId> = channels.iter().collect();
        let dropped: Vec<ChannelId> = self
            .connections
            .connection_states()
            .into_keys()
            .filter(|id| !wanted.contains(id))
            .collect();

        self.connections
            .initialize(self.config.connection.clone(), channels)
            .await;

        for channel in dropped {
            let failed = self.correlator.fail_channel(
                &channel,
                SessionError::ConnectionUnavailable {
                    channel: channel.clone(),
                },
            );
            self.processor.clear_channel(&channel);
            debug!(channel = %channel, failed, "channel dropped from session");
        }
    }

    pub fn reconnect(&self, channel: &ChannelId) -> Result<(), SessionError> {
        self.connections.reconnect(channel)
    }

    /// Subscribe to everything the session publishes.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.processor.subscribe()
    }

    pub async fn request(&self, channel: &ChannelId, spec: RequestSpec) -> Result<Value, SessionError> {
        self.correlator.request(channel, spec).await
    }

    pub async fn fetch_entity(
        &self,
        channel: &ChannelId,
        spec: RequestSpec,
        target: EntityTarget,
    ) -> Result<Entity, SessionError> {
        self.correlator.fetch_entity(channel, spec, target).await
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn processor(&self) -> &MessageProcessor {
        &self.processor
    }

    pub fn router(&self) -> &MetadataRouter {
        &self.router
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    /// Reject pending requests, close every channel, stop the pump and clear
    /// the entity store.
    pub async fn shutdown(&self) {
        let cancelled = self.correlator.cancel_all();
        self.connections.disconnect_all().await;

        self.cancel.cancel();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        self.store.clear();
        info!(cancelled, "session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reconcile a pushed entity and re-publish it for blanket observers.
fn apply_entity_update(
    store: &EntityStore,
    processor: &Weak<MessageProcessor>,
    message: &MetadataMessage,
) {
    let Some(raw) = message.data.get("entity") else {
        warn!(channel = %message.channel, "entity update without an entity");
        return;
    };
    let Some(entity_type) = raw.get("type").and_then(Value::as_str) else {
        warn!(channel = %message.channel, "entity update without an entity type");
        return;
    };
    let entity = match Entity::from_payload(raw, entity_type) {
        Ok(entity) => entity,
        Err(e) => {
            warn!(channel = %message.channel, "ignoring entity update: {}", e);
            return;
        }
    };

    let id = entity.id.clone();
    if !store.reconcile(entity) {
        return;
    }
    debug!(channel = %message.channel, id = %id, "entity update applied");
    if let Some(processor) = processor.upgrade() {
        processor.publish(SessionEvent::System(SystemMessage {
            kind: SystemMessageKind::EntityUpdate,
            channel: message.channel.clone(),
            payload: raw.clone(),
            timestamp: Utc::now(),
        }));
    }
}

async fn run_pump(
    mut inbound: mpsc::Receiver<InboundFrame>,
    mut connection_events: broadcast::Receiver<ConnectionEvent>,
    processor: Arc<MessageProcessor>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                match processor.process_frame(&frame) {
                    Ok(()) => {}
                    // Already published as a System event.
                    Err(SessionError::UnknownMessageType(_)) => {
                        debug!(channel = %frame.channel, "untyped metadata has no subscribers");
                    }
                    Err(e) => processor.report_error(&frame.channel, &e),
                }
            }
            event = connection_events.recv() => match event {
                Ok(event) => processor.publish(SessionEvent::Connection(event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("session pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntitySubscription;
    use crate::test_helpers::MemoryConnector;
    use crate::types::{ChannelStatus, Direction};
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn start(connector: &MemoryConnector) -> Session {
        Session::start(SessionConfig::default(), Arc::new(connector.clone()))
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not published in time")
    }

    #[tokio::test]
    async fn chat_and_metadata_flow_through() {
        let connector = MemoryConnector::new();
        let session = start(&connector);
        let mut events = session.events();
        let channel = ChannelId::from("step-1");

        let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();
        let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
        let _activity = session.router().subscribe("log", ["ActivityLog"], None, move |m| {
            let _ = activity_tx.send(m.clone());
        });
        let _ui = session.router().subscribe("ui", ["UI_UPDATE"], None, move |m| {
            let _ = ui_tx.send(m.clone());
        });

        session.open_channels(&[channel.clone()]).await;
        let remote = connector.take_remote(&channel).await;
        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::Connection(c) if c.status == ChannelStatus::Connected)
        })
        .await;

        remote
            .push_frame(json!({"content": "hello", "direction": "incoming", "threadId": "t-1"}))
            .await;
        remote
            .push_frame(json!({"data": {"messageType": "ActivityLog", "summary": "Fetching record"}}))
            .await;

        let chat = next_matching(&mut events, |e| matches!(e, SessionEvent::Chat(_))).await;
        let SessionEvent::Chat(chat) = chat else { unreachable!() };
        assert_eq!(chat.content, "hello");
        assert_eq!(chat.direction, Direction::Incoming);

        let routed = tokio::time::timeout(WAIT, activity_rx.recv()).await.unwrap().unwrap();
        assert_eq!(routed.message_type, "ActivityLog");
        assert_eq!(routed.data["summary"], "Fetching record");
        assert!(ui_rx.try_recv().is_err());

        assert_eq!(session.processor().history(&channel).len(), 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn fetch_document_end_to_end() {
        let connector = MemoryConnector::new();
        let session = Arc::new(start(&connector));
        let channel = ChannelId::from("step-1");
        session.open_channels(&[channel.clone()]).await;

        let request = {
            let session = session.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                session
                    .fetch_entity(
                        &channel,
                        RequestSpec::new("FetchDocument")
                            .field("documentId", "doc-9")
                            .with_request_id("r1"),
                        EntityTarget::new("document", "Document", "poa"),
                    )
                    .await
            })
        };

        let mut remote = connector.take_remote(&channel).await;
        let sent = remote.next_sent().await;
        assert_eq!(sent["requestId"], "r1");
        assert_eq!(sent["messageType"], "FetchDocument");
        remote
            .push_frame(json!({
                "messageType": "DocumentResponse",
                "requestId": "r1",
                "document": {"id": "doc-9", "title": "POA"},
            }))
            .await;

        let entity = request.await.unwrap().unwrap();
        assert_eq!(entity.field("title"), Some(&json!("POA")));
        let cached = session.store().get_entity_from_category("poa", "doc-9").unwrap();
        assert_eq!(cached, entity);
        assert_eq!(session.store().get_entity("doc-9"), Some(entity.clone()));
        assert_eq!(session.store().get_entities_by_type("Document"), vec![entity]);
    }

    #[tokio::test]
    async fn untyped_response_still_settles_its_request() {
        let connector = MemoryConnector::new();
        let session = Arc::new(start(&connector));
        let channel = ChannelId::from("step-1");
        session.open_channels(&[channel.clone()]).await;

        let request = {
            let session = session.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                session
                    .fetch_entity(
                        &channel,
                        RequestSpec::new("FetchDocument").with_request_id("r1"),
                        EntityTarget::new("document", "Document", "poa"),
                    )
                    .await
            })
        };

        let mut remote = connector.take_remote(&channel).await;
        remote.next_sent().await;
        remote
            .push_frame(json!({"requestId": "r1", "document": {"id": "doc-9"}}))
            .await;

        let entity = tokio::time::timeout(WAIT, request)
            .await
            .expect("untyped response left the request hanging")
            .unwrap()
            .unwrap();
        assert_eq!(entity.id, "doc-9");
        assert_eq!(session.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn malformed_frame_does_not_stop_the_pump() {
        let connector = MemoryConnector::new();
        let session = start(&connector);
        let mut events = session.events();
        let channel = ChannelId::from("a");
        session.open_channels(&[channel.clone()]).await;
        let remote = connector.take_remote(&channel).await;

        remote.push_text("{not json").await;
        remote.push_frame(json!(7)).await;
        remote.push_frame(json!({"content": "still here", "direction": 1})).await;

        let error = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::System(m) if m.kind == SystemMessageKind::Error)
        })
        .await;
        let SessionEvent::System(error) = error else { unreachable!() };
        assert_eq!(error.payload["code"], "malformed_message");

        let chat = next_matching(&mut events, |e| matches!(e, SessionEvent::Chat(_))).await;
        assert!(matches!(chat, SessionEvent::Chat(m) if m.content == "still here"));
    }

    #[tokio::test]
    async fn pushed_entity_updates_are_reconciled() {
        let connector = MemoryConnector::new();
        let session = start(&connector);
        let mut events = session.events();
        let channel = ChannelId::from("a");
        let (tx, mut changes) = mpsc::unbounded_channel();
        session
            .store()
            .subscribe_to_entities(EntitySubscription::new("watch", move |c| {
                let _ = tx.send(c.clone());
            }));
        session.open_channels(&[channel.clone()]).await;
        let remote = connector.take_remote(&channel).await;

        remote
            .push_frame(json!({
                "messageType": "ENTITY_UPDATE",
                "entity": {"id": "d", "type": "Document", "version": 2, "title": "new"},
            }))
            .await;
        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::System(m) if m.kind == SystemMessageKind::EntityUpdate)
        })
        .await;
        assert!(tokio::time::timeout(WAIT, changes.recv()).await.unwrap().is_some());

        // stale push is dropped
        remote
            .push_frame(json!({
                "type": "EntityUpdate",
                "entity": {"id": "d", "type": "Document", "version": 1, "title": "old"},
            }))
            .await;
        remote
            .push_frame(json!({"content": "marker", "direction": 0}))
            .await;
        next_matching(&mut events, |e| matches!(e, SessionEvent::Chat(_))).await;

        let cached = session.store().get_entity("d").unwrap();
        assert_eq!(cached.field("title"), Some(&json!("new")));
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn thread_history_and_updates() {
        let connector = MemoryConnector::new();
        let session = start(&connector);
        let mut events = session.events();
        let channel = ChannelId::from("a");
        session.open_channels(&[channel.clone()]).await;
        let remote = connector.take_remote(&channel).await;

        remote
            .push_frame(json!({"threadHistory": [
                {"content": "late", "direction": 1, "createdAt": "2024-05-02T00:00:00Z"},
                {"content": "early", "direction": 0, "createdAt": "2024-05-01T00:00:00Z"},
            ]}))
            .await;
        remote.push_frame(json!({"threadUpdate": {"threadId": "t-7"}})).await;

        next_matching(&mut events, |e| matches!(e, SessionEvent::ThreadUpdated { .. })).await;
        let contents: Vec<String> = session
            .processor()
            .history(&channel)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["early", "late"]);
        assert_eq!(session.processor().active_thread(&channel).as_deref(), Some("t-7"));
    }

    #[tokio::test]
    async fn dropping_a_channel_fails_its_requests() {
        let connector = MemoryConnector::new();
        let session = Arc::new(start(&connector));
        let channel = ChannelId::from("a");
        session.open_channels(&[channel.clone()]).await;
        session
            .connections()
            .wait_until_connected(&channel, WAIT)
            .await
            .unwrap();

        let request = {
            let session = session.clone();
            let channel = channel.clone();
            tokio::spawn(async move { session.request(&channel, RequestSpec::new("Ping")).await })
        };
        let mut remote = connector.take_remote(&channel).await;
        remote.next_sent().await;

        session.open_channels(&[]).await;
        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ConnectionUnavailable { .. }));
        assert!(session.connections().connection_states().is_empty());
    }

    #[tokio::test]
    async fn shutdown_rejects_pending_and_clears_store() {
        let connector = MemoryConnector::new();
        let session = Arc::new(start(&connector));
        let channel = ChannelId::from("a");
        session.open_channels(&[channel.clone()]).await;
        session.store().set_entity(Entity::new("x", "T"));

        let request = {
            let session = session.clone();
            let channel = channel.clone();
            tokio::spawn(async move { session.request(&channel, RequestSpec::new("Ping")).await })
        };
        let mut remote = connector.take_remote(&channel).await;
        remote.next_sent().await;

        session.shutdown().await;
        assert_eq!(request.await.unwrap().unwrap_err(), SessionError::SessionClosed);
        assert!(session.store().is_empty());
        assert!(
            session
                .connections()
                .connection_states()
                .values()
                .all(|s| s.status == ChannelStatus::Disconnected)
        );
    }

    #[tokio::test]
    async fn shutdown_releases_requests_waiting_for_readiness() {
        let connector = MemoryConnector::new();
        let channel = ChannelId::from("slow");
        let _gate = connector.gate(&channel);
        let mut config = SessionConfig::default();
        config.requests.readiness_wait = Duration::from_secs(3);
        let session = Arc::new(Session::start(config, Arc::new(connector.clone())));
        session.open_channels(&[channel.clone()]).await;

        let request = {
            let session = session.clone();
            let channel = channel.clone();
            tokio::spawn(async move { session.request(&channel, RequestSpec::new("Ping")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.correlator().pending_count(), 1);

        session.shutdown().await;
        let err = tokio::time::timeout(Duration::from_secs(1), request)
            .await
            .expect("request outlived shutdown")
            .unwrap()
            .unwrap_err();
        assert_eq!(err, SessionError::SessionClosed);
        assert_eq!(session.correlator().pending_count(), 0);
    }
}
