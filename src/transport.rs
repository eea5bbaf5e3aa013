//! Streaming transport seam for the feed connection managers
//!
//! The feeds talk to the wire through [`FeedTransport`] so their state
//! machines can be driven by a scripted transport in tests. The production
//! implementation is a thin wrapper over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;

/// Decoded frame delivered by a feed socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// UTF-8 text payload.
    Text(String),
    /// Server-initiated close.
    Close,
    /// Any other frame kind; the feeds ignore these.
    Other,
}

/// One live streaming connection.
#[async_trait]
pub trait FeedSocket: Send {
    /// Sends a text frame.
    async fn send_text(&mut self, frame: &str) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Result<WireMessage, TransportError>>;

    /// Initiates a normal closure.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Connection factory injected into the feeds.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedSocket>, TransportError>;
}

/// Production transport backed by `tokio-tungstenite`.
pub struct WsTransport;

struct WsSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedSocket>, TransportError> {
        let (stream, _response) = connect_async(url).await?;
        Ok(Box::new(WsSocket { inner: stream }))
    }
}

#[async_trait]
impl FeedSocket for WsSocket {
    async fn send_text(&mut self, frame: &str) -> Result<(), TransportError> {
        self.inner.send(Message::Text(frame.to_string())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<WireMessage, TransportError>> {
        loop {
            return match self.inner.next().await? {
                Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text))),
                Ok(Message::Close(_)) => Some(Ok(WireMessage::Close)),
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.inner.send(Message::Pong(payload)).await {
                        return Some(Err(e.into()));
                    }
                    continue;
                }
                Ok(_) => Some(Ok(WireMessage::Other)),
                Err(e) => Some(Err(e.into())),
            };
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await?;
        Ok(())
    }
}
