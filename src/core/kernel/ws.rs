use crate::core::errors::ClientError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, instrument, trace, warn};

/// WebSocket transport configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Capacity of the inbound and outbound frame channels
    pub message_buffer_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            message_buffer_size: 1024,
        }
    }
}

/// Lifecycle and data events delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Binary(Vec<u8>),
    /// Peer closed the connection; `code` is absent when no close frame arrived
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// An open duplex connection.
///
/// Frames pushed into `outbound` are written in order; `inbound` yields
/// events until the connection ends. Dropping `outbound` closes the socket.
#[derive(Debug)]
pub struct WsConnection {
    pub outbound: mpsc::Sender<Message>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Far end of an in-memory connection created by `WsConnection::pair`
#[derive(Debug)]
pub struct WsPeer {
    /// Frames the client wrote
    pub sent: mpsc::Receiver<Message>,
    /// Inject events as if they came from the server
    pub events: mpsc::Sender<TransportEvent>,
}

impl WsConnection {
    /// A connected pair of channels with no socket behind it
    pub fn pair(buffer: usize) -> (Self, WsPeer) {
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (in_tx, in_rx) = mpsc::channel(buffer);
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            WsPeer {
                sent: out_rx,
                events: in_tx,
            },
        )
    }
}

/// Opens connections to a URL; the seam the gateway session is tested through
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<WsConnection, ClientError>;
}

/// Tungstenite-based connector
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector {
    config: WsConfig,
}

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: WsConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    #[instrument(skip(self), fields(url = %url))]
    async fn connect(&self, url: &str) -> Result<WsConnection, ClientError> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| ClientError::NetworkError("WebSocket connection timeout".to_string()))?
            .map_err(|e| ClientError::NetworkError(format!("WebSocket connection failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.config.message_buffer_size);
        let (in_tx, in_rx) = mpsc::channel(self.config.message_buffer_size);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("Failed to send WebSocket message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
            debug!("WebSocket writer finished");
        });

        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            let event = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        trace!(len = text.len(), "Text frame");
                        if in_tx.send(TransportEvent::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        trace!(len = data.len(), "Binary frame");
                        if in_tx.send(TransportEvent::Binary(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = pong_tx.send(Message::Pong(data)).await {
                            warn!("Failed to queue pong response: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => TransportEvent::Closed {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.into_owned(),
                            },
                            None => TransportEvent::Closed {
                                code: None,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break TransportEvent::Error(format!("WebSocket error: {}", e)),
                    None => {
                        break TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        }
                    }
                }
            };
            let _ = in_tx.send(event).await;
        });

        Ok(WsConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
