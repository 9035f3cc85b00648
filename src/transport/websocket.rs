//! WebSocket transport to analyzer replicas.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::load_balancer::endpoint::Endpoint;
use crate::transport::{Connection, Connector, TransportError, TransportResult};

/// Connects to `ws://` / `wss://` replica endpoints.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &Endpoint) -> TransportResult<Box<dyn Connection>> {
        let (stream, response) = connect_async(endpoint.address.as_str())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        tracing::debug!(
            endpoint = %endpoint.id,
            status = %response.status(),
            "WebSocket connection established"
        );

        Ok(Box::new(WebSocketConnection {
            stream,
            closed: false,
        }))
    }
}

/// One WebSocket stream to a replica.
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if let Err(e) = self.stream.send(Message::Text(text.into())).await {
            self.closed = true;
            return Err(TransportError::Io(e.to_string()));
        }
        Ok(())
    }

    async fn recv_text(&mut self) -> Option<TransportResult<String>> {
        if self.closed {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|e| TransportError::InvalidFrame(e.to_string())),
                    );
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.closed = true;
                    return None;
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(TransportError::Io(e.to_string())));
                }
            }
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.close(None).await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
