//! Duplex transport to the clearing network
//!
//! `Connector` opens one `Connection` per batch. The WebSocket implementation
//! exchanges JSON text frames; undecodable frames are logged and skipped.

use crate::message::{ClientMessage, ServerMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// An open duplex connection
#[async_trait]
pub trait Connection: Send {
    /// Send one frame
    async fn send(&mut self, message: &ClientMessage) -> Result<()>;

    /// Receive the next frame; `None` when the peer closed the connection
    async fn recv(&mut self) -> Result<Option<ServerMessage>>;

    /// Release the connection (idempotent)
    async fn close(&mut self);
}

/// Opens connections to the clearing network
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// WebSocket connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Create connector for `url` (ws:// or wss://)
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let (stream, response) = connect_async(self.url.as_str()).await?;
        debug!(
            "Connected to clearing network {} (status {})",
            self.url,
            response.status()
        );
        Ok(Box::new(WsConnection {
            stream,
            closed: false,
        }))
    }
}

/// WebSocket connection
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        if self.closed {
            return Err(Error::Connection("connection already closed".to_string()));
        }
        self.stream.send(Message::Text(message.to_json()?)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        loop {
            let frame = match self.stream.next().await {
                None => return Ok(None),
                Some(frame) => frame?,
            };

            let text = match frame {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Skipping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => return Ok(None),
                // Ping/pong are answered by tungstenite itself
                _ => continue,
            };

            match ServerMessage::from_json(&text) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!("Skipping undecodable frame: {}", e),
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.close(None).await {
            debug!("Close handshake failed: {}", e);
        }
    }
}
