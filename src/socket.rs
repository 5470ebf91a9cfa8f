//! Raw websocket plumbing underneath the reconnecting transport.
//!
//! [`Connector`] dials a single endpoint and hands back the write half of
//! the connection plus an event stream for reads and closure. The transport
//! never touches tokio-tungstenite directly, which keeps it drivable by the
//! scriptable connector the tests inject.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Close code synthesized when the peer vanishes without a close handshake.
pub const CLOSE_CODE_ABNORMAL: u16 = 1006;
/// Close code reported for TLS-level failures on an established connection.
pub const CLOSE_CODE_TLS_FAILURE: u16 = 1015;
/// Close code used when the peer closed without sending a status.
pub const CLOSE_CODE_NO_STATUS: u16 = 1005;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("invalid signaling URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("socket is closed")]
    SocketClosed,
    #[error("send failed: {0}")]
    Send(String),
}

/// Events produced by one live socket. The event channel ends after
/// `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A complete text frame arrived.
    Frame(String),
    /// The socket closed. `code` is the websocket close code, 1006 when the
    /// connection died without a close handshake.
    Closed { code: u16 },
}

/// Write half of one established connection.
#[async_trait]
pub trait Socket: Send + Sync {
    async fn send_frame(&self, frame: &str) -> Result<(), SocketError>;
    /// Starts a graceful close. Idempotent.
    async fn close(&self);
}

/// Dials one signaling endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        uri: &str,
    ) -> Result<(Arc<dyn Socket>, mpsc::Receiver<SocketEvent>), SocketError>;
}

/// Rejects URIs that could never be dialed, without dialing. Lets callers
/// fail construction instead of entering a retry loop.
pub fn validate_uri(uri: &str) -> Result<(), SocketError> {
    if !(uri.starts_with("ws://") || uri.starts_with("wss://")) {
        return Err(SocketError::InvalidUri {
            uri: uri.to_owned(),
            reason: "scheme must be ws or wss".to_owned(),
        });
    }
    uri.into_client_request()
        .map(|_| ())
        .map_err(|e| SocketError::InvalidUri {
            uri: uri.to_owned(),
            reason: e.to_string(),
        })
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Production connector speaking `wss` via tokio-tungstenite.
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        uri: &str,
    ) -> Result<(Arc<dyn Socket>, mpsc::Receiver<SocketEvent>), SocketError> {
        let request = uri
            .into_client_request()
            .map_err(|e| SocketError::InvalidUri {
                uri: uri.to_owned(),
                reason: e.to_string(),
            })?;
        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SocketError::Handshake(e.to_string()))?;
        let (sink, mut read) = stream.split();
        let (event_tx, event_rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let code = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if event_tx
                            .send(SocketEvent::Frame(text.as_str().to_owned()))
                            .await
                            .is_err()
                        {
                            // Receiver gone; the transport tore this socket down.
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| u16::from(f.code))
                            .unwrap_or(CLOSE_CODE_NO_STATUS);
                    }
                    // Pings are answered by tungstenite itself; binary frames
                    // are not part of the signaling protocol.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(target: "Socket", "Read error: {e}");
                        break close_code_for_error(&e);
                    }
                    None => break CLOSE_CODE_ABNORMAL,
                }
            };
            let _ = event_tx.send(SocketEvent::Closed { code }).await;
        });

        Ok((Arc::new(WsSocket { sink: Mutex::new(sink) }), event_rx))
    }
}

struct WsSocket {
    sink: Mutex<WsSink>,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send_frame(&self, frame: &str) -> Result<(), SocketError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::text(frame))
            .await
            .map_err(|e| SocketError::Send(e.to_string()))
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!(target: "Socket", "Close handshake send failed: {e}");
        }
    }
}

fn close_code_for_error(e: &tungstenite::Error) -> u16 {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            CLOSE_CODE_NO_STATUS
        }
        tungstenite::Error::Tls(_) => CLOSE_CODE_TLS_FAILURE,
        _ => CLOSE_CODE_ABNORMAL,
    }
}
