//! Protocol stream: typed signaling operations over the reconnecting
//! transport.
//!
//! Owned and driven by the session task. The stream frames outbound
//! operations into `{type, payload, version}` envelopes, keeps the retry
//! queue for frames that could not be sent while disconnected, announces
//! identity after every (re)connect, and answers the newline heartbeat.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::protocol::{self, Envelope, HEARTBEAT_FRAME, Inbound};
use crate::socket::Connector;
use crate::transport::{Transport, TransportConfig, TransportEvent};

/// Upward events from the stream to the session.
#[derive(Debug)]
pub enum StreamEvent {
    /// The transport finished a (re)connect. The listen announce and the
    /// retry-queue flush have already happened.
    TransportOpen,
    TransportClosed { will_reconnect: bool },
    TransportError(SignalingError),
    Inbound(Inbound),
}

/// What became of a published frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// No healthy connection; the frame waits in the retry queue for the
    /// next flush.
    Queued,
    /// No healthy connection and the frame was not eligible for the retry
    /// queue.
    Dropped,
}

struct QueuedFrame {
    kind: &'static str,
    payload: Value,
}

pub struct PStream {
    transport: Transport,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    token: String,
    retry_queue: VecDeque<QueuedFrame>,
    open: bool,
    gateway: Option<String>,
    region: Option<String>,
}

impl PStream {
    /// Builds the stream and its transport. `token` is announced on every
    /// connect until replaced through [`PStream::set_token`].
    pub fn new(token: String, config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let (transport, transport_events) = Transport::new(config, connector);
        Self {
            transport,
            transport_events,
            token,
            retry_queue: VecDeque::new(),
            open: false,
            gateway: None,
            region: None,
        }
    }

    pub fn open(&self) {
        self.transport.open();
    }

    pub fn close(&self) {
        self.transport.close();
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Most recent gateway host hint reported by the far side.
    pub fn gateway(&self) -> Option<&str> {
        self.gateway.as_deref()
    }

    /// Most recent region hint reported by the far side.
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn update_preferred_uri(&self, uri: Option<String>) {
        self.transport.update_preferred_uri(uri);
    }

    pub fn update_uris(&self, uris: Vec<String>) {
        self.transport.update_uris(uris);
    }

    pub fn set_retry_after(&self, delay: Duration) {
        self.transport.set_retry_after(delay);
    }

    /// Cancel-safe wait for the next transport event. Feed the result to
    /// [`PStream::process`].
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.transport_events.recv().await
    }

    /// Runs one transport event to completion.
    pub async fn process(&mut self, event: TransportEvent) -> Option<StreamEvent> {
        match event {
            TransportEvent::Open => {
                self.open = true;
                self.announce().await;
                self.flush_retry_queue().await;
                Some(StreamEvent::TransportOpen)
            }
            TransportEvent::Message(frame) => self.handle_frame(&frame).await,
            TransportEvent::Error(error) => Some(StreamEvent::TransportError(error)),
            TransportEvent::Closed { will_reconnect } => {
                self.open = false;
                Some(StreamEvent::TransportClosed { will_reconnect })
            }
        }
    }

    /// Builds and sends one envelope. With no healthy connection,
    /// `should_retry` decides between the retry queue and dropping the
    /// frame.
    pub async fn publish(
        &mut self,
        kind: &'static str,
        payload: Value,
        should_retry: bool,
    ) -> PublishOutcome {
        let envelope = Envelope::new(kind, payload);
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "PStream", "Could not serialize '{kind}' frame: {e}");
                return PublishOutcome::Dropped;
            }
        };
        if self.transport.send(frame).await {
            return PublishOutcome::Sent;
        }
        if should_retry {
            debug!(target: "PStream", "Queueing '{kind}' frame until the transport recovers");
            self.retry_queue.push_back(QueuedFrame {
                kind,
                payload: envelope.payload,
            });
            PublishOutcome::Queued
        } else {
            debug!(target: "PStream", "Dropping '{kind}' frame; transport unavailable");
            PublishOutcome::Dropped
        }
    }

    /// Stores the new token and re-announces with it. The re-announce is
    /// never queued; a reconnect announces the stored token on its own.
    pub async fn set_token(&mut self, token: String) -> PublishOutcome {
        self.token = token;
        let payload = self.listen_payload();
        self.publish("listen", payload, false).await
    }

    /// Presence on (`audio: true`) or off (`audio: false`).
    pub async fn register(&mut self, audio: bool) -> PublishOutcome {
        self.publish("register", json!({ "audio": audio }), true).await
    }

    pub async fn invite(
        &mut self,
        call_sid: &str,
        sdp: &str,
        params: Value,
        reconnect_token: Option<&str>,
    ) -> PublishOutcome {
        let mut payload = json!({ "callsid": call_sid, "sdp": sdp, "params": params });
        if let Some(token) = reconnect_token {
            payload["reconnect"] = Value::String(token.to_owned());
        }
        self.publish("invite", payload, true).await
    }

    pub async fn answer(&mut self, call_sid: &str, sdp: &str) -> PublishOutcome {
        self.publish("answer", json!({ "callsid": call_sid, "sdp": sdp }), true)
            .await
    }

    /// Mid-call renegotiation. Never queued for retry.
    pub async fn reinvite(&mut self, call_sid: &str, sdp: &str) -> PublishOutcome {
        self.publish("reinvite", json!({ "callsid": call_sid, "sdp": sdp }), false)
            .await
    }

    pub async fn dtmf(&mut self, call_sid: &str, digits: &str) -> PublishOutcome {
        self.publish("dtmf", json!({ "callsid": call_sid, "dtmf": digits }), true)
            .await
    }

    pub async fn hangup(&mut self, call_sid: &str, message: Option<&str>) -> PublishOutcome {
        let mut payload = json!({ "callsid": call_sid });
        if let Some(message) = message {
            payload["message"] = Value::String(message.to_owned());
        }
        self.publish("hangup", payload, true).await
    }

    pub async fn reject(&mut self, call_sid: &str) -> PublishOutcome {
        self.publish("reject", json!({ "callsid": call_sid }), true).await
    }

    pub async fn send_message(
        &mut self,
        call_sid: &str,
        voice_event_sid: &str,
        content: Value,
        content_type: &str,
        message_type: &str,
    ) -> PublishOutcome {
        self.publish(
            "message",
            json!({
                "callsid": call_sid,
                "content": content,
                "contenttype": content_type,
                "messagetype": message_type,
                "voiceeventsid": voice_event_sid,
            }),
            true,
        )
        .await
    }

    /// Identity/capability announce: the first frame after every connect and
    /// after every token change.
    async fn announce(&mut self) {
        let payload = self.listen_payload();
        self.publish("listen", payload, false).await;
    }

    fn listen_payload(&self) -> Value {
        json!({
            "token": self.token,
            "client": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    /// Strict FIFO replay of frames queued while disconnected. A frame that
    /// fails again returns to the front of the queue.
    async fn flush_retry_queue(&mut self) {
        if self.retry_queue.is_empty() {
            return;
        }
        info!(target: "PStream", "Flushing {} queued frame(s)", self.retry_queue.len());
        while let Some(QueuedFrame { kind, payload }) = self.retry_queue.pop_front() {
            let envelope = Envelope::new(kind, payload);
            let frame = match envelope.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(target: "PStream", "Could not serialize queued '{kind}' frame: {e}");
                    continue;
                }
            };
            if !self.transport.send(frame).await {
                debug!(target: "PStream", "Transport dropped mid-flush; '{kind}' returns to the queue");
                self.retry_queue.push_front(QueuedFrame {
                    kind,
                    payload: envelope.payload,
                });
                break;
            }
        }
    }

    async fn handle_frame(&mut self, frame: &str) -> Option<StreamEvent> {
        if frame == HEARTBEAT_FRAME {
            // Answered in kind, never surfaced.
            self.transport.send(HEARTBEAT_FRAME.to_owned()).await;
            return None;
        }
        let raw = protocol::RawFrame::parse(frame)?;
        self.cache_endpoint_hints(&raw.payload);
        raw.into_inbound().map(StreamEvent::Inbound)
    }

    /// Gateway/region hints ride along on several frame types; remember the
    /// latest ones seen.
    fn cache_endpoint_hints(&mut self, payload: &Value) {
        if let Some(gateway) = payload.get("gateway").and_then(Value::as_str) {
            self.gateway = Some(gateway.to_owned());
        }
        if let Some(region) = payload.get("region").and_then(Value::as_str) {
            self.region = Some(region.to_owned());
        }
    }
}
