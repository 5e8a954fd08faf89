//! Per-channel links to remote agents.

mod manager;
mod transport;
mod websocket;

pub use manager::{ConnectionManager, InboundFrame};
pub use transport::{Connector, Link, LinkEvent};
pub use websocket::{WebSocketConnector, endpoint_url};
