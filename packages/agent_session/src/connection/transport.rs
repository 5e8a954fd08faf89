//! The seam between the connection manager and whatever moves bytes.

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::ConnectionSettings;
use crate::error::SessionError;
use crate::types::ChannelId;

/// What a link reports back to its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One inbound text frame (expected to be JSON).
    Frame(String),
    /// The remote side closed the link cleanly.
    Closed { reason: Option<String> },
    /// The link broke.
    Failed(String),
}

/// An open link for one channel. Dropping `outbound` asks the transport to
/// close the link.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<LinkEvent>,
}

/// Opens links to remote agents, one per channel.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        channel: &'a ChannelId,
        settings: &'a ConnectionSettings,
    ) -> BoxFuture<'a, Result<Link, SessionError>>;
}
