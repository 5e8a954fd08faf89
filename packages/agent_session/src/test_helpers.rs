//! In-memory connector for tests: every link is a pair of mpsc channels the
//! test drives from the "remote" side.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use crate::config::ConnectionSettings;
use crate::connection::{Connector, Link, LinkEvent};
use crate::error::SessionError;
use crate::types::ChannelId;

/// The remote half of an in-memory link.
pub struct RemoteEnd {
    /// Frames the session sent on this channel.
    pub sent: mpsc::Receiver<String>,
    push: mpsc::Sender<LinkEvent>,
}

impl RemoteEnd {
    pub async fn push_frame(&self, frame: Value) {
        self.push_text(&frame.to_string()).await;
    }

    pub async fn push_text(&self, text: &str) {
        self.push
            .send(LinkEvent::Frame(text.to_string()))
            .await
            .expect("link dropped");
    }

    pub async fn close(&self) {
        let _ = self.push.send(LinkEvent::Closed { reason: None }).await;
    }

    pub async fn fail(&self, msg: &str) {
        let _ = self.push.send(LinkEvent::Failed(msg.to_string())).await;
    }

    /// Stop accepting frames; later sends on this link fail.
    pub fn stop_reading(&mut self) {
        self.sent.close();
    }

    /// Next sent frame, parsed as JSON.
    pub async fn next_sent(&mut self) -> Value {
        let text = self.sent.recv().await.expect("link closed");
        serde_json::from_str(&text).expect("sent frame is not json")
    }
}

#[derive(Default)]
struct MemoryInner {
    remotes: HashMap<ChannelId, RemoteEnd>,
    failures: HashMap<ChannelId, String>,
    gates: HashMap<ChannelId, Arc<Notify>>,
    connects: HashMap<ChannelId, usize>,
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Mutex<MemoryInner>>,
    opened: Arc<Notify>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold connects for `channel` until the returned gate is notified.
    pub fn gate(&self, channel: &ChannelId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.inner.lock().gates.insert(channel.clone(), gate.clone());
        gate
    }

    /// Make the next connect for `channel` fail with a transport error.
    pub fn fail_next(&self, channel: &ChannelId, msg: &str) {
        self.inner
            .lock()
            .failures
            .insert(channel.clone(), msg.to_string());
    }

    pub fn connect_count(&self, channel: &ChannelId) -> usize {
        self.inner
            .lock()
            .connects
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for `channel` to open and take its remote end.
    pub async fn take_remote(&self, channel: &ChannelId) -> RemoteEnd {
        loop {
            let opened = self.opened.notified();
            if let Some(remote) = self.inner.lock().remotes.remove(channel) {
                return remote;
            }
            opened.await;
        }
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        channel: &'a ChannelId,
        _settings: &'a ConnectionSettings,
    ) -> BoxFuture<'a, Result<Link, SessionError>> {
        Box::pin(async move {
            let gate = {
                let mut inner = self.inner.lock();
                *inner.connects.entry(channel.clone()).or_default() += 1;
                inner.gates.get(channel).cloned()
            };
            if let Some(gate) = gate {
                gate.notified().await;
            }

            let failure = self.inner.lock().failures.remove(channel);
            if let Some(msg) = failure {
                return Err(SessionError::Transport(msg));
            }

            let (out_tx, out_rx) = mpsc::channel(64);
            let (in_tx, in_rx) = mpsc::channel(64);
            self.inner.lock().remotes.insert(
                channel.clone(),
                RemoteEnd {
                    sent: out_rx,
                    push: in_tx,
                },
            );
            self.opened.notify_waiters();

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
