//! Agent Session - realtime session middleware for agent frontends
//!
//! This crate keeps one link per channel to a remote agent, turns what arrives
//! into chat history and typed metadata events, correlates request/response
//! exchanges, and caches the entities those exchanges return.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use agent_session::{
//!     ChannelId, EntityTarget, RequestSpec, Session, SessionConfig, WebSocketConnector,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let session = Session::start(SessionConfig::default(), Arc::new(WebSocketConnector::new()));
//!     let channel = ChannelId::from("step-1");
//!
//!     let _activity = session.router().subscribe("log", ["ActivityLog"], None, |msg| {
//!         println!("activity on {}: {}", msg.channel, msg.data);
//!     });
//!
//!     session.open_channels(&[channel.clone()]).await;
//!
//!     let document = session
//!         .fetch_entity(
//!             &channel,
//!             RequestSpec::new("FetchDocument").field("documentId", "doc-9"),
//!             EntityTarget::new("document", "Document", "poa"),
//!         )
//!         .await
//!         .unwrap();
//!     println!("fetched {}", document.id);
//!
//!     session.shutdown().await;
//! }
//! ```

pub mod config;
pub mod connection;
mod correlator;
mod error;
pub mod processor;
mod router;
mod session;
mod store;
mod types;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::{ConnectionSettings, EventOptions, RequestOptions, SessionConfig};
pub use connection::{ConnectionManager, Connector, InboundFrame, Link, LinkEvent, WebSocketConnector};
pub use correlator::{EntityTarget, RequestCorrelator, RequestSpec, new_request_id};
pub use error::SessionError;
pub use processor::{InboundKind, MessageProcessor};
pub use router::{MetadataRouter, Subscription};
pub use session::{ENTITY_UPDATE_TYPES, Session};
pub use store::{
    ChangeKind, Entity, EntityChange, EntityQuery, EntityStore, EntitySubscription, SortKey,
};
pub use types::{
    ChannelConnectionState, ChannelId, ChannelStatus, ConnectionEvent, Direction, DirectionWire,
    MetadataMessage, ProcessedChatMessage, RawMessage, SessionEvent, SystemMessage,
    SystemMessageKind, WireTimestamp,
};
