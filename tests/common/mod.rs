// tests/common/mod.rs
//
// Shared fixture: a scriptable in-memory connector standing in for the
// websocket stack. Tests decide per dial whether the gateway accepts,
// refuses, or never answers, and drive accepted connections by hand.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use callwire::socket::{Connector, Socket, SocketError, SocketEvent};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// What the fake gateway does with one dial attempt.
#[derive(Debug, Clone, Copy)]
pub enum ConnectScript {
    /// Complete the handshake and hand the test a [`GatewayLink`].
    Accept,
    /// Fail the handshake immediately.
    Refuse,
    /// Never answer, so only the connect timeout can end the attempt.
    Hang,
}

struct MockState {
    script: VecDeque<ConnectScript>,
    dialed: Vec<String>,
}

/// Scriptable [`Connector`]. Dials are answered from the script in order;
/// once the script runs out every dial is accepted.
pub struct MockConnector {
    state: Mutex<MockState>,
    links: mpsc::UnboundedSender<GatewayLink>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<GatewayLink>) {
        let (links, links_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            state: Mutex::new(MockState {
                script: VecDeque::new(),
                dialed: Vec::new(),
            }),
            links,
        });
        (connector, links_rx)
    }

    /// Appends steps to the dial script.
    pub fn script(&self, steps: impl IntoIterator<Item = ConnectScript>) {
        self.state.lock().unwrap().script.extend(steps);
    }

    /// Every URI dialed so far, in order.
    pub fn dialed(&self) -> Vec<String> {
        self.state.lock().unwrap().dialed.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        uri: &str,
    ) -> Result<(Arc<dyn Socket>, mpsc::Receiver<SocketEvent>), SocketError> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.dialed.push(uri.to_owned());
            state.script.pop_front().unwrap_or(ConnectScript::Accept)
        };
        match step {
            ConnectScript::Hang => std::future::pending().await,
            ConnectScript::Refuse => Err(SocketError::Handshake("connection refused".to_owned())),
            ConnectScript::Accept => {
                let (event_tx, event_rx) = mpsc::channel(64);
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let socket = Arc::new(MockSocket {
                    outbound: outbound_tx,
                    closed: AtomicBool::new(false),
                });
                let link = GatewayLink {
                    uri: uri.to_owned(),
                    outbound: outbound_rx,
                    remote: RemoteControl { events: event_tx },
                };
                // The test may have finished without caring about the link.
                let _ = self.links.send(link);
                Ok((socket, event_rx))
            }
        }
    }
}

pub struct MockSocket {
    outbound: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
}

#[async_trait]
impl Socket for MockSocket {
    async fn send_frame(&self, frame: &str) -> Result<(), SocketError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SocketError::SocketClosed);
        }
        self.outbound
            .send(frame.to_owned())
            .map_err(|_| SocketError::Send("link torn down".to_owned()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One accepted connection, as seen from the gateway side: the frames the
/// client wrote, plus a handle for injecting frames and closure.
pub struct GatewayLink {
    pub uri: String,
    pub outbound: mpsc::UnboundedReceiver<String>,
    pub remote: RemoteControl,
}

/// Drives the read side of one accepted connection.
#[derive(Clone)]
pub struct RemoteControl {
    events: mpsc::Sender<SocketEvent>,
}

impl RemoteControl {
    /// Delivers one raw text frame to the client.
    pub async fn frame(&self, text: &str) {
        self.events
            .send(SocketEvent::Frame(text.to_owned()))
            .await
            .expect("client stopped reading socket events");
    }

    /// Like [`RemoteControl::frame`], but reports failure instead of
    /// panicking. For background feeders that outlive the connection.
    pub async fn try_frame(&self, text: &str) -> bool {
        self.events
            .send(SocketEvent::Frame(text.to_owned()))
            .await
            .is_ok()
    }

    /// Delivers one `{type, payload}` frame to the client.
    pub async fn frame_json(&self, kind: &str, payload: Value) {
        let text = json!({ "type": kind, "payload": payload }).to_string();
        self.frame(&text).await;
    }

    /// Closes the connection with the given websocket close code.
    pub async fn close(&self, code: u16) {
        let _ = self.events.send(SocketEvent::Closed { code }).await;
    }
}

pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .try_init();
}

/// Next frame the client wrote, parsed as JSON. Panics if none arrives
/// within five (paused-clock) seconds.
pub async fn expect_frame(link: &mut GatewayLink) -> Value {
    let text = expect_raw_frame(link).await;
    serde_json::from_str(&text)
        .unwrap_or_else(|e| panic!("client wrote non-JSON frame {text:?}: {e}"))
}

/// Next frame the client wrote, verbatim.
pub async fn expect_raw_frame(link: &mut GatewayLink) -> String {
    tokio::time::timeout(Duration::from_secs(5), link.outbound.recv())
        .await
        .expect("timed out waiting for a client frame")
        .expect("client side of the link dropped")
}

/// Asserts the client writes nothing for `window`.
pub async fn expect_silence(link: &mut GatewayLink, window: Duration) {
    if let Ok(frame) = tokio::time::timeout(window, link.outbound.recv()).await {
        panic!("expected silence, client wrote {frame:?}");
    }
}

/// Next accepted connection. Panics if none is established within five
/// (paused-clock) seconds.
pub async fn expect_link(links: &mut mpsc::UnboundedReceiver<GatewayLink>) -> GatewayLink {
    tokio::time::timeout(Duration::from_secs(5), links.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Asserts no connection is established for `window`.
pub async fn expect_no_link(links: &mut mpsc::UnboundedReceiver<GatewayLink>, window: Duration) {
    if let Ok(Some(link)) = tokio::time::timeout(window, links.recv()).await {
        panic!("expected no connection, client dialed {}", link.uri);
    }
}
