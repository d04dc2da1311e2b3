use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::RealtimeError;

/// A frame queued for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// What an open transport reports back. `Closed` or `Error` is emitted at
/// most once and is always the last event.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(String),
    Closed(Option<String>),
    Error(String),
}

/// An open transport. Dropping `outbound` closes the connection.
pub struct Transport {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Resolves once the transport is open.
    async fn open(&self, url: &str) -> Result<Transport, RealtimeError>;
}

/// Builds the realtime endpoint from the page origin: `https` origins are
/// upgraded to `wss`, plain `http` to `ws`.
pub fn endpoint_url(origin: &str, path: &str) -> Result<String, RealtimeError> {
    let uri: http::Uri = origin
        .trim_end_matches('/')
        .parse()
        .map_err(|e| RealtimeError::InvalidEndpoint(format!("{}: {}", origin, e)))?;

    let scheme = match uri.scheme_str() {
        Some("https") | Some("wss") => "wss",
        Some("http") | Some("ws") => "ws",
        Some(other) => {
            return Err(RealtimeError::InvalidEndpoint(format!(
                "unsupported scheme '{}' in {}",
                other, origin
            )))
        }
        None => {
            return Err(RealtimeError::InvalidEndpoint(format!(
                "origin {} has no scheme",
                origin
            )))
        }
    };

    let authority = uri.authority().ok_or_else(|| {
        RealtimeError::InvalidEndpoint(format!("origin {} has no host", origin))
    })?;

    if path.starts_with('/') {
        Ok(format!("{}://{}{}", scheme, authority, path))
    } else {
        Ok(format!("{}://{}/{}", scheme, authority, path))
    }
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<Transport, RealtimeError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;

        let (mut writer, mut reader) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if let Err(e) = writer.send(Message::Text(text.into())).await {
                            debug!("WebSocket write failed: {}", e);
                            break;
                        }
                    }
                    OutboundFrame::Close => break,
                }
            }
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(result) = reader.next().await {
                let event = match result {
                    Ok(Message::Text(text)) => TransportEvent::Frame(text.as_str().to_owned()),
                    Ok(Message::Close(frame)) => {
                        TransportEvent::Closed(frame.map(|f| f.reason.as_str().to_owned()))
                    }
                    Ok(_) => continue,
                    Err(e) => TransportEvent::Error(e.to_string()),
                };

                let terminal = !matches!(event, TransportEvent::Frame(_));
                if inbound_tx.send(event).is_err() || terminal {
                    return;
                }
            }
            let _ = inbound_tx.send(TransportEvent::Closed(None));
        });

        Ok(Transport {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
