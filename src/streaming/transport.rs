//! Event stream transport seam and the WebSocket implementation

use super::StreamError;
use async_trait::async_trait;
use std::time::Duration;

/// One open event stream
#[async_trait]
pub trait EventSocket: Send {
    /// Next text frame. `None` once the peer closed the stream.
    async fn next_message(&mut self) -> Option<Result<String, StreamError>>;

    /// Close the stream. Safe to call on an already closed socket.
    async fn close(&mut self);
}

/// Opens event sockets
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn EventSocket>, StreamError>;
}

#[cfg(feature = "ws-stream")]
pub use ws::WsTransport;

#[cfg(feature = "ws-stream")]
mod ws {
    use super::*;
    use futures_util::StreamExt;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tracing::{debug, trace, warn};

    /// `tokio-tungstenite` transport
    #[derive(Debug, Clone)]
    pub struct WsTransport {
        connect_timeout: Duration,
    }

    impl WsTransport {
        pub fn new(connect_timeout: Duration) -> Self {
            Self { connect_timeout }
        }
    }

    impl Default for WsTransport {
        fn default() -> Self {
            Self::new(Duration::from_secs(10))
        }
    }

    #[async_trait]
    impl EventTransport for WsTransport {
        async fn connect(&self, url: &str) -> Result<Box<dyn EventSocket>, StreamError> {
            let connect_err = |message: String| StreamError::Connect {
                url: url.to_string(),
                message,
            };

            let (ws, response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
                .await
                .map_err(|_| {
                    connect_err(format!("timed out after {}ms", self.connect_timeout.as_millis()))
                })?
                .map_err(|e| connect_err(e.to_string()))?;

            debug!(url, status = %response.status(), "WebSocket connected");
            Ok(Box::new(WsSocket {
                ws,
                closed: false,
            }))
        }
    }

    struct WsSocket {
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        closed: bool,
    }

    #[async_trait]
    impl EventSocket for WsSocket {
        async fn next_message(&mut self) -> Option<Result<String, StreamError>> {
            if self.closed {
                return None;
            }
            while let Some(msg) = self.ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        trace!(len = text.len(), "received websocket message");
                        return Some(Ok(text.to_string()));
                    }
                    Ok(Message::Binary(data)) => {
                        return Some(
                            String::from_utf8(data.to_vec())
                                .map_err(|e| StreamError::Decode(e.to_string())),
                        );
                    }
                    Ok(Message::Close(_)) => {
                        debug!("WebSocket closed by peer");
                        self.closed = true;
                        return None;
                    }
                    Ok(_) => {} // Ignore ping/pong frames
                    Err(e) => {
                        warn!(error = %e, "WebSocket error");
                        self.closed = true;
                        return Some(Err(StreamError::Transport(e.to_string())));
                    }
                }
            }
            self.closed = true;
            None
        }

        async fn close(&mut self) {
            if self.closed {
                return;
            }
            self.closed = true;
            if let Err(e) = self.ws.close(None).await {
                debug!(error = %e, "WebSocket close failed");
            }
        }
    }

}
