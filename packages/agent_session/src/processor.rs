//! MessageProcessor: turns inbound frames into chat history, system events and
//! routed metadata.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::InboundFrame;
use crate::error::SessionError;
use crate::router::MetadataRouter;
use crate::types::{
    ChannelId, Direction, MetadataMessage, ProcessedChatMessage, RawMessage, SessionEvent,
    SystemMessage, SystemMessageKind,
};

/// Resolved type for metadata that carries no recognizable tag.
pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN";

/// Where producers put the message type, highest priority first.
///
/// This list is closed. Producers that need another location should be fixed
/// instead of growing it.
const MESSAGE_TYPE_POINTERS: [&str; 6] = [
    "/messageType",
    "/type",
    "/metadata/messageType",
    "/metadata/type",
    "/Metadata/messageType",
    "/Metadata/type",
];

/// Resolve the message type tag of a metadata payload. The first location
/// holding a string wins; `None` when no location does.
pub fn extract_message_type(raw: &Value) -> Option<&str> {
    MESSAGE_TYPE_POINTERS
        .iter()
        .find_map(|pointer| raw.pointer(pointer).and_then(Value::as_str))
}

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    Chat(RawMessage),
    Metadata(Value),
    ThreadHistory(Vec<RawMessage>),
    ThreadUpdate(String),
}

/// Classify a decoded frame.
pub fn classify(frame: Value) -> Result<InboundKind, SessionError> {
    match frame {
        Value::Array(items) => Ok(InboundKind::ThreadHistory(decode_history(items))),
        Value::Object(mut obj) => {
            if let Some(Value::Array(items)) = obj.remove("threadHistory") {
                return Ok(InboundKind::ThreadHistory(decode_history(items)));
            }
            if let Some(thread_id) = obj
                .get("threadUpdate")
                .and_then(|t| t.get("threadId"))
                .and_then(Value::as_str)
            {
                return Ok(InboundKind::ThreadUpdate(thread_id.to_string()));
            }
            if obj.contains_key("content") && obj.contains_key("direction") {
                let raw = serde_json::from_value(Value::Object(obj))
                    .map_err(|e| SessionError::MalformedMessage(format!("chat message: {e}")))?;
                return Ok(InboundKind::Chat(raw));
            }
            if obj.len() == 1 && obj.get("data").is_some_and(Value::is_object) {
                if let Some(data) = obj.remove("data") {
                    return Ok(InboundKind::Metadata(data));
                }
            }
            Ok(InboundKind::Metadata(Value::Object(obj)))
        }
        other => Err(SessionError::MalformedMessage(format!(
            "expected object or array frame, got {other}"
        ))),
    }
}

/// Decode each entry on its own; undecodable entries are logged and skipped.
fn decode_history(items: Vec<Value>) -> Vec<RawMessage> {
    let total = items.len();
    let decoded: Vec<RawMessage> = items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value(item) {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!(index, "skipping malformed thread history entry: {}", e);
                None
            }
        })
        .collect();
    if decoded.len() != total {
        warn!(kept = decoded.len(), total, "thread history batch had malformed entries");
    }
    decoded
}

#[derive(Default)]
struct ProcessorState {
    histories: HashMap<ChannelId, Vec<ProcessedChatMessage>>,
    active_threads: HashMap<ChannelId, String>,
}

pub struct MessageProcessor {
    state: Mutex<ProcessorState>,
    router: MetadataRouter,
    events: broadcast::Sender<SessionEvent>,
    legacy_system_messages: bool,
}

impl MessageProcessor {
    pub fn new(
        router: MetadataRouter,
        events: broadcast::Sender<SessionEvent>,
        legacy_system_messages: bool,
    ) -> Self {
        Self {
            state: Mutex::new(ProcessorState::default()),
            router,
            events,
            legacy_system_messages,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Publish an event; having no listeners is not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Decode, classify and dispatch one inbound frame.
    pub fn process_frame(&self, frame: &InboundFrame) -> Result<(), SessionError> {
        let value: Value = serde_json::from_str(&frame.text)
            .map_err(|e| SessionError::MalformedMessage(format!("invalid json: {e}")))?;

        match classify(value)? {
            InboundKind::Chat(raw) => {
                self.process_message(&frame.channel, raw);
            }
            InboundKind::Metadata(raw) => {
                self.process_metadata(&frame.channel, raw)?;
            }
            InboundKind::ThreadHistory(list) => {
                self.process_thread_history(&frame.channel, list);
            }
            InboundKind::ThreadUpdate(thread_id) => {
                self.process_thread_update(&frame.channel, thread_id);
            }
        }
        Ok(())
    }

    /// Canonicalize and append a chat message to the channel's history.
    pub fn process_message(&self, channel: &ChannelId, raw: RawMessage) -> ProcessedChatMessage {
        let direction = Direction::from_wire(raw.direction.as_ref());
        let timestamp = raw.created_at().unwrap_or_else(Utc::now);
        let message = ProcessedChatMessage {
            id: Uuid::new_v4().to_string(),
            content: raw.content,
            direction,
            channel: channel.clone(),
            timestamp,
            workflow_id: raw.workflow_id,
            thread_id: raw.thread_id,
            participant_id: raw.participant_id,
            metadata: raw.metadata,
        };

        self.state
            .lock()
            .histories
            .entry(channel.clone())
            .or_default()
            .push(message.clone());

        self.publish(SessionEvent::Chat(message.clone()));
        message
    }

    /// Resolve the payload's type and deliver it.
    ///
    /// Typed messages go to the router (and, with legacy delivery on, to the
    /// event stream as METADATA system messages). Untyped messages reach the
    /// event stream and are reported as `UnknownMessageType`, except that an
    /// untyped payload carrying a `requestId` is still offered to wildcard
    /// subscriptions so the correlator can settle it.
    pub fn process_metadata(
        &self,
        channel: &ChannelId,
        raw: Value,
    ) -> Result<MetadataMessage, SessionError> {
        let timestamp = Utc::now();
        let message_type = extract_message_type(&raw)
            .unwrap_or(UNKNOWN_MESSAGE_TYPE)
            .to_string();
        let known = message_type != UNKNOWN_MESSAGE_TYPE;

        if self.legacy_system_messages || !known {
            self.publish(SessionEvent::System(SystemMessage {
                kind: SystemMessageKind::Metadata,
                channel: channel.clone(),
                payload: raw.clone(),
                timestamp,
            }));
        }

        let correlated = raw.get("requestId").is_some_and(Value::is_string);
        if !known && !correlated {
            return Err(SessionError::UnknownMessageType(raw.to_string()));
        }

        let message = MetadataMessage {
            message_type,
            channel: channel.clone(),
            data: raw,
            timestamp,
        };
        if !known {
            let delivered = self.router.route_untyped(&message);
            debug!(channel = %channel, delivered, "untyped response offered to wildcard subscribers");
            return Ok(message);
        }
        let delivered = self.router.route_message(&message);
        debug!(
            channel = %channel,
            message_type = %message.message_type,
            delivered,
            "metadata routed"
        );
        Ok(message)
    }

    /// Rebuild the channel's history from a batch, ordered by `createdAt`.
    pub fn process_thread_history(&self, channel: &ChannelId, mut raw_list: Vec<RawMessage>) -> usize {
        // Stable: entries without a timestamp sort first, keeping their relative order.
        raw_list.sort_by_key(RawMessage::created_at);

        self.state.lock().histories.insert(channel.clone(), Vec::new());

        let count = raw_list.len();
        for raw in raw_list {
            self.process_message(channel, raw);
        }
        debug!(channel = %channel, count, "thread history rebuilt");
        self.publish(SessionEvent::HistoryRebuilt {
            channel: channel.clone(),
            count,
        });
        count
    }

    pub fn process_thread_update(&self, channel: &ChannelId, thread_id: String) {
        self.state
            .lock()
            .active_threads
            .insert(channel.clone(), thread_id.clone());
        self.publish(SessionEvent::ThreadUpdated {
            channel: channel.clone(),
            thread_id,
        });
    }

    /// Surface a processing failure to observers as an ERROR system message.
    pub fn report_error(&self, channel: &ChannelId, error: &SessionError) {
        warn!(channel = %channel, code = error.error_code(), "failed to process inbound frame: {}", error);
        self.publish(SessionEvent::System(SystemMessage {
            kind: SystemMessageKind::Error,
            channel: channel.clone(),
            payload: json!({
                "code": error.error_code(),
                "message": error.to_string(),
            }),
            timestamp: Utc::now(),
        }));
    }

    pub fn history(&self, channel: &ChannelId) -> Vec<ProcessedChatMessage> {
        self.state
            .lock()
            .histories
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_thread(&self, channel: &ChannelId) -> Option<String> {
        self.state.lock().active_threads.get(channel).cloned()
    }

    /// Forget everything held for a channel.
    pub fn clear_channel(&self, channel: &ChannelId) {
        let mut state = self.state.lock();
        state.histories.remove(channel);
        state.active_threads.remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DirectionWire;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn processor() -> (MessageProcessor, MetadataRouter, broadcast::Receiver<SessionEvent>) {
        let router = MetadataRouter::new();
        let (tx, rx) = broadcast::channel(64);
        (MessageProcessor::new(router.clone(), tx, true), router, rx)
    }

    fn raw(content: &str, direction: Value, created_at: Value) -> RawMessage {
        serde_json::from_value(json!({
            "content": content,
            "direction": direction,
            "createdAt": created_at,
            "workflowId": "wf-1",
            "threadId": "t-1",
        }))
        .unwrap()
    }

    fn contents(history: &[ProcessedChatMessage]) -> Vec<&str> {
        history.iter().map(|m| m.content.as_str()).collect()
    }

    // ── message type extraction ─────────────────────────────────────────

    #[test]
    fn message_type_priority_order() {
        let all = json!({
            "messageType": "A",
            "type": "B",
            "metadata": { "messageType": "C", "type": "D" },
            "Metadata": { "messageType": "E", "type": "F" },
        });
        assert_eq!(extract_message_type(&all), Some("A"));

        assert_eq!(extract_message_type(&json!({"type": "B", "metadata": {"messageType": "C"}})), Some("B"));
        assert_eq!(extract_message_type(&json!({"metadata": {"messageType": "C", "type": "D"}})), Some("C"));
        assert_eq!(extract_message_type(&json!({"metadata": {"type": "D"}, "Metadata": {"messageType": "E"}})), Some("D"));
        assert_eq!(extract_message_type(&json!({"Metadata": {"messageType": "E", "type": "F"}})), Some("E"));
        assert_eq!(extract_message_type(&json!({"Metadata": {"type": "F"}})), Some("F"));
        assert_eq!(extract_message_type(&json!({"summary": "nothing"})), None);
    }

    #[test]
    fn message_type_skips_non_string_values() {
        assert_eq!(
            extract_message_type(&json!({"messageType": 5, "type": "B"})),
            Some("B")
        );
    }

    // ── classification ──────────────────────────────────────────────────

    #[test]
    fn classify_chat() {
        let kind = classify(json!({"content": "hi", "direction": 0})).unwrap();
        assert!(matches!(kind, InboundKind::Chat(raw) if raw.direction == Some(DirectionWire::Code(0))));
    }

    #[test]
    fn classify_history_forms() {
        let kind = classify(json!([{"content": "a", "direction": 0}])).unwrap();
        assert!(matches!(kind, InboundKind::ThreadHistory(list) if list.len() == 1));

        let kind = classify(json!({"threadHistory": [{"content": "a"}, {"content": "b"}]})).unwrap();
        assert!(matches!(kind, InboundKind::ThreadHistory(list) if list.len() == 2));
    }

    #[test]
    fn classify_thread_update() {
        let kind = classify(json!({"threadUpdate": {"threadId": "t-9"}})).unwrap();
        assert_eq!(kind, InboundKind::ThreadUpdate("t-9".into()));
    }

    #[test]
    fn classify_unwraps_data_envelope() {
        let kind = classify(json!({"data": {"messageType": "ActivityLog"}})).unwrap();
        assert_eq!(kind, InboundKind::Metadata(json!({"messageType": "ActivityLog"})));

        // data next to other keys is left as part of the payload
        let kind = classify(json!({"messageType": "X", "data": {}})).unwrap();
        assert_eq!(kind, InboundKind::Metadata(json!({"messageType": "X", "data": {}})));
    }

    #[test]
    fn classify_rejects_scalars() {
        assert!(matches!(classify(json!(42)), Err(SessionError::MalformedMessage(_))));
        assert!(matches!(classify(json!("text")), Err(SessionError::MalformedMessage(_))));
    }

    #[test]
    fn classify_skips_bad_history_entries() {
        let kind = classify(json!({"threadHistory": [
            {"content": "a", "direction": 0},
            {"content": 42, "direction": 0},
            {"content": "c", "direction": 1},
        ]}))
        .unwrap();
        let InboundKind::ThreadHistory(list) = kind else {
            panic!("expected thread history");
        };
        let contents: Vec<&str> = list.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "c"]);

        let kind = classify(json!([{"content": {"nested": true}}])).unwrap();
        assert_eq!(kind, InboundKind::ThreadHistory(Vec::new()));
    }

    // ── chat history ────────────────────────────────────────────────────

    #[test]
    fn history_is_append_only_in_processing_order() {
        let (p, _router, _rx) = processor();
        let ch = ChannelId::from("step-1");
        // deliberately out of timestamp order: processing order must win
        p.process_message(&ch, raw("second", json!(0), json!("2024-01-02T00:00:00Z")));
        p.process_message(&ch, raw("first", json!("outgoing"), json!("2024-01-01T00:00:00Z")));
        p.process_message(&ch, raw("third", json!(2), json!("2024-01-03T00:00:00Z")));

        let history = p.history(&ch);
        assert_eq!(contents(&history), vec!["second", "first", "third"]);
        assert_eq!(history[0].direction, Direction::Incoming);
        assert_eq!(history[1].direction, Direction::Outgoing);
        assert_eq!(history[2].direction, Direction::Handover);
        assert_ne!(history[0].id, history[1].id);
    }

    #[test]
    fn histories_are_per_channel() {
        let (p, _router, _rx) = processor();
        p.process_message(&ChannelId::from("a"), raw("to a", json!(0), json!(null)));
        p.process_message(&ChannelId::from("b"), raw("to b", json!(0), json!(null)));
        assert_eq!(contents(&p.history(&ChannelId::from("a"))), vec!["to a"]);
        assert_eq!(contents(&p.history(&ChannelId::from("b"))), vec!["to b"]);
        assert!(p.history(&ChannelId::from("c")).is_empty());
    }

    #[test]
    fn thread_history_is_sorted_by_created_at() {
        let (p, _router, mut rx) = processor();
        let ch = ChannelId::from("step-1");
        p.process_message(&ch, raw("stale", json!(0), json!(null)));

        let batch = vec![
            raw("c", json!(0), json!("2024-01-03T00:00:00Z")),
            raw("a", json!(1), json!(1_704_067_200_000i64)), // 2024-01-01
            raw("b", json!(0), json!("2024-01-02T00:00:00Z")),
        ];
        assert_eq!(p.process_thread_history(&ch, batch), 3);

        let history = p.history(&ch);
        assert_eq!(contents(&history), vec!["a", "b", "c"]);
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let mut rebuilt = false;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::HistoryRebuilt { count, .. } = event {
                assert_eq!(count, 3);
                rebuilt = true;
            }
        }
        assert!(rebuilt);
    }

    #[test]
    fn thread_history_is_order_independent() {
        let stamps = [
            "2024-03-01T00:00:00Z",
            "2024-01-01T00:00:00Z",
            "2024-02-01T00:00:00Z",
            "2024-01-15T00:00:00Z",
        ];
        let build = |order: &[usize]| -> Vec<RawMessage> {
            order
                .iter()
                .map(|&i| raw(stamps[i], json!(0), json!(stamps[i])))
                .collect()
        };

        let (p, _router, _rx) = processor();
        let ch = ChannelId::from("x");
        p.process_thread_history(&ch, build(&[0, 1, 2, 3]));
        let first = contents(&p.history(&ch)).join(",");
        p.process_thread_history(&ch, build(&[3, 2, 1, 0]));
        let second = contents(&p.history(&ch)).join(",");
        assert_eq!(first, second);
        assert!(first.starts_with("2024-01-01"));
    }

    #[test]
    fn thread_update_sets_active_thread() {
        let (p, _router, mut rx) = processor();
        let ch = ChannelId::from("a");
        p.process_thread_update(&ch, "t-42".into());
        assert_eq!(p.active_thread(&ch).as_deref(), Some("t-42"));
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::ThreadUpdated {
                channel: ch,
                thread_id: "t-42".into()
            }
        );
    }

    // ── metadata ────────────────────────────────────────────────────────

    #[test]
    fn metadata_is_delivered_twice() {
        let (p, router, mut rx) = processor();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = router.subscribe("ui", ["ActivityLog"], None, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let msg = p
            .process_metadata(&ChannelId::from("a"), json!({"messageType": "ActivityLog"}))
            .unwrap();
        assert_eq!(msg.message_type, "ActivityLog");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::System(SystemMessage { kind: SystemMessageKind::Metadata, .. })
        ));
    }

    #[test]
    fn legacy_path_can_be_disabled() {
        let router = MetadataRouter::new();
        let (tx, mut rx) = broadcast::channel(8);
        let p = MessageProcessor::new(router, tx, false);
        p.process_metadata(&ChannelId::from("a"), json!({"type": "INFO"}))
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unknown_type_only_reaches_generic_path() {
        let router = MetadataRouter::new();
        let (tx, mut rx) = broadcast::channel(8);
        let p = MessageProcessor::new(router.clone(), tx, false);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = router.subscribe_all("tap", None, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let err = p
            .process_metadata(&ChannelId::from("a"), json!({"summary": "untyped"}))
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownMessageType(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::System(_)));
    }

    #[test]
    fn thread_history_frame_keeps_good_entries() {
        let (p, _router, _rx) = processor();
        let ch = ChannelId::from("a");
        let frame = InboundFrame {
            channel: ch.clone(),
            text: json!({"threadHistory": [
                {"content": "first", "direction": 0, "createdAt": "2024-01-01T00:00:00Z"},
                {"content": 42},
                {"content": "third", "direction": 1, "createdAt": "2024-01-03T00:00:00Z"},
            ]})
            .to_string(),
            received_at: Utc::now(),
        };
        p.process_frame(&frame).unwrap();
        assert_eq!(contents(&p.history(&ch)), vec!["first", "third"]);
    }

    #[test]
    fn untyped_response_reaches_wildcard_only() {
        let router = MetadataRouter::new();
        let (tx, mut rx) = broadcast::channel(8);
        let p = MessageProcessor::new(router.clone(), tx, true);
        let (typed, wildcard) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let (t, w) = (typed.clone(), wildcard.clone());
        let _typed = router.subscribe("typed", [UNKNOWN_MESSAGE_TYPE], None, move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });
        let _tap = router.subscribe_all("tap", None, move |_| {
            w.fetch_add(1, Ordering::SeqCst);
        });

        let msg = p
            .process_metadata(&ChannelId::from("a"), json!({"requestId": "r1", "document": {}}))
            .unwrap();
        assert_eq!(msg.message_type, UNKNOWN_MESSAGE_TYPE);
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
        assert_eq!(typed.load(Ordering::SeqCst), 0);
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::System(_)));

        // a non-string requestId does not count
        assert!(matches!(
            p.process_metadata(&ChannelId::from("a"), json!({"requestId": 5})),
            Err(SessionError::UnknownMessageType(_))
        ));
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn process_frame_rejects_invalid_json() {
        let (p, _router, _rx) = processor();
        let frame = InboundFrame {
            channel: ChannelId::from("a"),
            text: "not json".into(),
            received_at: Utc::now(),
        };
        assert!(matches!(
            p.process_frame(&frame),
            Err(SessionError::MalformedMessage(_))
        ));
    }

    #[test]
    fn clear_channel_forgets_state() {
        let (p, _router, _rx) = processor();
        let ch = ChannelId::from("a");
        p.process_message(&ch, raw("x", json!(0), json!(null)));
        p.process_thread_update(&ch, "t".into());
        p.clear_channel(&ch);
        assert!(p.history(&ch).is_empty());
        assert!(p.active_thread(&ch).is_none());
    }
}
