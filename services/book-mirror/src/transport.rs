//! Transport seam between the supervisor and the network
//!
//! The supervisor only ever sees text frames. `WsConnector` is the
//! production implementation over `tokio-tungstenite`; tests substitute a
//! scripted in-memory connector.

use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),
}

/// An open, bidirectional text-frame connection.
pub trait Transport: Send {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next text frame; `Ok(None)` once the peer has closed.
    ///
    /// Must be cancel-safe: dropping the future loses no frame.
    fn recv(&mut self) -> impl Future<Output = Result<Option<String>, TransportError>> + Send;

    /// Release the connection. Errors are swallowed.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Dials new transports.
pub trait Connector: Send + Sync {
    type Transport: Transport;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// WebSocket connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, url: &str) -> Result<WsTransport, TransportError> {
        let (stream, response) =
            connect_async(url)
                .await
                .map_err(|e| TransportError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        debug!(url, status = %response.status(), "WebSocket handshake complete");
        Ok(WsTransport { stream })
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Peer closed WebSocket");
                    return Ok(None);
                }
                // Control frames are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}
