//! WebSocket links over tokio-tungstenite.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::config::ConnectionSettings;
use crate::error::SessionError;
use crate::types::ChannelId;

use super::transport::{Connector, Link, LinkEvent};

const LINK_BUFFER: usize = 100;

/// Connects each channel to `settings.endpoint` with `{channel}` substituted.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Everything but RFC 3986 unreserved characters.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Build the URL for one channel, appending the auth token as a query parameter.
/// The channel id and token are percent-encoded.
pub fn endpoint_url(template: &str, channel: &ChannelId, auth_token: Option<&str>) -> String {
    let channel = utf8_percent_encode(channel.as_str(), COMPONENT).to_string();
    let mut url = template.replace("{channel}", &channel);
    if let Some(token) = auth_token {
        let sep = if url.contains('?') { '&' } else { '?' };
        url.push(sep);
        url.push_str("token=");
        url.extend(utf8_percent_encode(token, COMPONENT));
    }
    url
}

impl Connector for WebSocketConnector {
    fn connect<'a>(
        &'a self,
        channel: &'a ChannelId,
        settings: &'a ConnectionSettings,
    ) -> BoxFuture<'a, Result<Link, SessionError>> {
        Box::pin(async move {
            let url = endpoint_url(&settings.endpoint, channel, settings.auth_token.as_deref());
            debug!(channel = %channel, "opening websocket link");

            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            let (mut ws_write, mut ws_read) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_BUFFER);
            let (in_tx, in_rx) = mpsc::channel::<LinkEvent>(LINK_BUFFER);

            // Writer: drain outbound channel → socket. Ends when the sender is dropped.
            let writer_channel = channel.clone();
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                        warn!(channel = %writer_channel, "websocket write error: {}", e);
                        return;
                    }
                }
                let _ = ws_write.send(Message::Close(None)).await;
            });

            // Reader: socket → link events.
            let reader_channel = channel.clone();
            tokio::spawn(async move {
                loop {
                    let event = match ws_read.next().await {
                        Some(Ok(Message::Text(text))) => LinkEvent::Frame(text.as_str().to_string()),
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec())
                        {
                            Ok(text) => LinkEvent::Frame(text),
                            Err(_) => {
                                warn!(channel = %reader_channel, "dropping non-utf8 binary frame");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.as_str().to_string())
                                .filter(|r| !r.is_empty());
                            let _ = in_tx.send(LinkEvent::Closed { reason }).await;
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            let _ = in_tx.send(LinkEvent::Failed(e.to_string())).await;
                            break;
                        }
                        None => {
                            let _ = in_tx.send(LinkEvent::Closed { reason: None }).await;
                            break;
                        }
                    };
                    if in_tx.send(event).await.is_err() {
                        break;
                    }
                }
                debug!(channel = %reader_channel, "websocket reader finished");
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
