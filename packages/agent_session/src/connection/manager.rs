//! ConnectionManager: one logical link per channel.
//!
//! Each channel owns a supervisor task that opens the link, forwards inbound
//! frames to the session's inbound queue, and records the status transition
//! when the link ends. There is no automatic reconnect; the next
//! `initialize` call or an explicit `reconnect` opens the link again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionSettings;
use crate::error::SessionError;
use crate::types::{ChannelConnectionState, ChannelId, ChannelStatus, ConnectionEvent};

use super::transport::{Connector, Link, LinkEvent};

/// A frame received on a channel, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub channel: ChannelId,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Per-channel bookkeeping. Exactly one per channel id.
struct ChannelEntry {
    state: ChannelConnectionState,
    /// Readiness notification for waiters.
    status_tx: watch::Sender<ChannelStatus>,
    /// Present only while the link is up.
    outbound: Option<mpsc::Sender<String>>,
    cancel: CancellationToken,
    /// Fired by every teardown so readiness waiters give up right away.
    torn_down: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Bumped on every (re)open and teardown so stale tasks cannot
    /// overwrite newer state.
    generation: u64,
}

impl ChannelEntry {
    fn new(channel: ChannelId, generation: u64) -> Self {
        let (status_tx, _) = watch::channel(ChannelStatus::Connecting);
        Self {
            state: ChannelConnectionState {
                channel,
                status: ChannelStatus::Connecting,
                last_error: None,
                last_activity: Utc::now(),
            },
            status_tx,
            outbound: None,
            cancel: CancellationToken::new(),
            torn_down: CancellationToken::new(),
            task: None,
            generation,
        }
    }
}

type ChannelMap = Arc<Mutex<HashMap<ChannelId, ChannelEntry>>>;

/// Manages the set of live channel links for a session.
pub struct ConnectionManager {
    channels: ChannelMap,
    connector: Arc<dyn Connector>,
    settings: Mutex<ConnectionSettings>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    next_generation: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager. The returned receiver yields every inbound frame
    /// from every channel in arrival order.
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<InboundFrame>) {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
        let manager = Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            connector,
            settings: Mutex::new(settings),
            event_tx,
            inbound_tx,
            next_generation: AtomicU64::new(1),
        };
        (manager, inbound_rx)
    }

    /// Subscribe to channel status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Reconcile open channels against `channels`: open new ones, close the
    /// ones no longer listed, reopen listed channels that are Disconnected or
    /// in Error, and leave the rest untouched.
    pub async fn initialize(&self, settings: ConnectionSettings, channels: &[ChannelId]) {
        *self.settings.lock() = settings;

        let stale: Vec<ChannelId> = {
            let map = self.channels.lock();
            map.keys()
                .filter(|id| !channels.contains(id))
                .cloned()
                .collect()
        };
        for channel in stale {
            self.close_channel(&channel).await;
        }

        for channel in channels {
            let status = self.status(channel);
            match status {
                None => self.open_channel(channel.clone()),
                Some(ChannelStatus::Disconnected) | Some(ChannelStatus::Error) => {
                    self.open_channel(channel.clone())
                }
                Some(ChannelStatus::Connecting) | Some(ChannelStatus::Connected) => {
                    debug!(channel = %channel, "channel already active, leaving untouched");
                }
            }
        }
    }

    /// Manually reopen a channel that is Disconnected or in Error.
    pub fn reconnect(&self, channel: &ChannelId) -> Result<(), SessionError> {
        match self.status(channel) {
            None => Err(SessionError::UnknownChannel(channel.clone())),
            Some(ChannelStatus::Disconnected) | Some(ChannelStatus::Error) => {
                info!(channel = %channel, "manual reconnect");
                self.open_channel(channel.clone());
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Send a JSON payload. Valid only while the channel is Connected.
    pub async fn send_message(&self, channel: &ChannelId, payload: &Value) -> Result<(), SessionError> {
        let outbound = {
            let map = self.channels.lock();
            let entry = map
                .get(channel)
                .ok_or_else(|| SessionError::ConnectionUnavailable {
                    channel: channel.clone(),
                })?;
            match (&entry.state.status, &entry.outbound) {
                (ChannelStatus::Connected, Some(tx)) => tx.clone(),
                _ => {
                    return Err(SessionError::ConnectionUnavailable {
                        channel: channel.clone(),
                    });
                }
            }
        };

        let text = serde_json::to_string(payload)
            .map_err(|e| SessionError::MalformedMessage(e.to_string()))?;
        outbound
            .send(text)
            .await
            .map_err(|_| SessionError::Transport(format!("link for {} is closed", channel)))?;

        touch(&self.channels, channel);
        Ok(())
    }

    /// Tear down every channel. Returns once each one is Disconnected and its
    /// supervisor task has finished.
    pub async fn disconnect_all(&self) {
        let ids: Vec<ChannelId> = self.channels.lock().keys().cloned().collect();
        let mut tasks = Vec::new();
        for channel in &ids {
            if let Some(task) = self.teardown(channel, ChannelStatus::Disconnected, false) {
                tasks.push(task);
            }
        }
        for task in tasks {
            let _ = task.await;
        }
        info!(count = ids.len(), "all channels disconnected");
    }

    /// Immutable snapshot of every channel's state.
    pub fn connection_states(&self) -> HashMap<ChannelId, ChannelConnectionState> {
        self.channels
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state.clone()))
            .collect()
    }

    pub fn status(&self, channel: &ChannelId) -> Option<ChannelStatus> {
        self.channels.lock().get(channel).map(|e| e.state.status)
    }

    /// Wait until `channel` reaches Connected, at most `max_wait`.
    ///
    /// Completes on the transition itself (no polling). Fails with
    /// `ConnectionFailed` on deadline or if the channel is torn down while
    /// waiting.
    pub async fn wait_until_connected(
        &self,
        channel: &ChannelId,
        max_wait: Duration,
    ) -> Result<(), SessionError> {
        let (mut rx, torn_down) = {
            let map = self.channels.lock();
            let entry = map
                .get(channel)
                .ok_or_else(|| SessionError::UnknownChannel(channel.clone()))?;
            (entry.status_tx.subscribe(), entry.torn_down.clone())
        };

        let failed = || SessionError::ConnectionFailed {
            channel: channel.clone(),
            waited: max_wait,
        };
        let ready = async {
            tokio::select! {
                result = rx.wait_for(|s| *s == ChannelStatus::Connected) => result.is_ok(),
                _ = torn_down.cancelled() => false,
            }
        };
        match tokio::time::timeout(max_wait, ready).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(channel = %channel, "channel torn down while waiting for readiness");
                Err(failed())
            }
            Err(_) => {
                warn!(channel = %channel, waited_ms = max_wait.as_millis() as u64, "channel not ready in time");
                Err(failed())
            }
        }
    }

    /// Close one channel and forget it.
    async fn close_channel(&self, channel: &ChannelId) {
        if let Some(task) = self.teardown(channel, ChannelStatus::Disconnected, true) {
            let _ = task.await;
        }
        info!(channel = %channel, "channel closed");
    }

    /// Mark the channel with `status`, cancel its task and drop its link.
    /// Returns the task handle so the caller can await it outside the lock.
    fn teardown(&self, channel: &ChannelId, status: ChannelStatus, remove: bool) -> Option<JoinHandle<()>> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (task, event) = {
            let mut map = self.channels.lock();
            let entry = map.get_mut(channel)?;
            entry.generation = generation;
            entry.cancel.cancel();
            entry.torn_down.cancel();
            entry.torn_down = CancellationToken::new();
            entry.outbound = None;
            let task = entry.task.take();
            let event = apply_status(entry, status, None);
            if remove {
                map.remove(channel);
            }
            (task, event)
        };
        let _ = self.event_tx.send(event);
        task
    }

    /// Insert or reset the entry for `channel` and spawn its supervisor.
    fn open_channel(&self, channel: ChannelId) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let event = {
            let mut map = self.channels.lock();
            let entry = map
                .entry(channel.clone())
                .or_insert_with(|| ChannelEntry::new(channel.clone(), generation));
            entry.cancel.cancel();
            entry.cancel = cancel.clone();
            entry.generation = generation;
            entry.outbound = None;
            apply_status(entry, ChannelStatus::Connecting, None)
        };
        let _ = self.event_tx.send(event);
        info!(channel = %channel, "opening channel");

        let task = ChannelTask {
            channel: channel.clone(),
            generation,
            connector: self.connector.clone(),
            settings: self.settings.lock().clone(),
            channels: self.channels.clone(),
            event_tx: self.event_tx.clone(),
            inbound_tx: self.inbound_tx.clone(),
            cancel,
        };
        let handle = tokio::spawn(task.run());

        let mut map = self.channels.lock();
        match map.get_mut(&channel) {
            Some(entry) if entry.generation == generation => entry.task = Some(handle),
            _ => handle.abort(),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for entry in self.channels.lock().values() {
            entry.cancel.cancel();
        }
    }
}

/// Record a status transition on the entry and build its event.
fn apply_status(entry: &mut ChannelEntry, status: ChannelStatus, error: Option<String>) -> ConnectionEvent {
    let now = Utc::now();
    entry.state.status = status;
    if error.is_some() {
        entry.state.last_error = error.clone();
    }
    entry.state.last_activity = now;
    entry.status_tx.send_replace(status);
    ConnectionEvent {
        channel: entry.state.channel.clone(),
        status,
        error,
        at: now,
    }
}

fn touch(channels: &ChannelMap, channel: &ChannelId) {
    if let Some(entry) = channels.lock().get_mut(channel) {
        entry.state.last_activity = Utc::now();
    }
}

/// Everything a channel supervisor needs, moved into its task.
struct ChannelTask {
    channel: ChannelId,
    generation: u64,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    channels: ChannelMap,
    event_tx: broadcast::Sender<ConnectionEvent>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    cancel: CancellationToken,
}

impl ChannelTask {
    async fn run(self) {
        let connect = tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(&self.channel, &self.settings),
        );

        let link = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = connect => match result {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => {
                    warn!(channel = %self.channel, error = %e, "connect failed");
                    self.transition(ChannelStatus::Error, Some(e.to_string()));
                    return;
                }
                Err(_) => {
                    let msg = format!(
                        "connect timed out after {}ms",
                        self.settings.connect_timeout.as_millis()
                    );
                    warn!(channel = %self.channel, "{}", msg);
                    self.transition(ChannelStatus::Error, Some(msg));
                    return;
                }
            }
        };

        let Link {
            outbound,
            mut inbound,
        } = link;

        {
            let mut map = self.channels.lock();
            match map.get_mut(&self.channel) {
                Some(entry) if entry.generation == self.generation => {
                    entry.outbound = Some(outbound);
                }
                _ => return,
            }
        }
        if !self.transition(ChannelStatus::Connected, None) {
            return;
        }
        info!(channel = %self.channel, "channel connected");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = inbound.recv() => match event {
                    Some(LinkEvent::Frame(text)) => {
                        touch(&self.channels, &self.channel);
                        let frame = InboundFrame {
                            channel: self.channel.clone(),
                            text,
                            received_at: Utc::now(),
                        };
                        if self.inbound_tx.send(frame).await.is_err() {
                            debug!(channel = %self.channel, "inbound queue closed");
                            break;
                        }
                    }
                    Some(LinkEvent::Closed { reason }) => {
                        info!(channel = %self.channel, reason = ?reason, "link closed by remote");
                        self.transition(ChannelStatus::Disconnected, None);
                        break;
                    }
                    None => {
                        info!(channel = %self.channel, "link ended");
                        self.transition(ChannelStatus::Disconnected, None);
                        break;
                    }
                    Some(LinkEvent::Failed(msg)) => {
                        warn!(channel = %self.channel, error = %msg, "link failed");
                        self.transition(ChannelStatus::Error, Some(msg));
                        break;
                    }
                }
            }
        }
    }

    /// Apply a transition if this task still owns the channel. Returns false
    /// when a newer open or a teardown has superseded it.
    fn transition(&self, status: ChannelStatus, error: Option<String>) -> bool {
        let event = {
            let mut map = self.channels.lock();
            let Some(entry) = map.get_mut(&self.channel) else {
                return false;
            };
            if entry.generation != self.generation {
                return false;
            }
            if status != ChannelStatus::Connected {
                entry.outbound = None;
            }
            apply_status(entry, status, error)
        };
        let _ = self.event_tx.send(event);
        true
    }
}
