//! Wire framing for the gateway protocol: JSON envelopes plus the newline
//! heartbeat.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope version stamped on every outbound frame.
pub const PROTOCOL_VERSION: &str = "1.6";

/// Heartbeat frame, answered in kind and never parsed as JSON.
pub const HEARTBEAT_FRAME: &str = "\n";

/// Outbound `{type, payload, version}` envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub version: &'static str,
}

impl Envelope {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_owned(),
            payload,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One inbound frame split into its type and untyped payload. Interpretation
/// into [`Inbound`] happens separately so the payload can also be scanned
/// for endpoint hints.
#[derive(Debug, Deserialize)]
pub(crate) struct RawFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl RawFrame {
    pub(crate) fn parse(frame: &str) -> Option<Self> {
        match serde_json::from_str(frame) {
            Ok(raw) => Some(raw),
            Err(e) => {
                debug!(target: "PStream", "Dropping malformed frame: {e}");
                None
            }
        }
    }

    /// Interprets the frame. Unknown types and known types with malformed
    /// payloads are dropped with a log line.
    pub(crate) fn into_inbound(self) -> Option<Inbound> {
        let kind = self.kind;
        let payload = self.payload;
        match kind.as_str() {
            "ready" => Some(Inbound::Ready),
            "offline" => Some(Inbound::Offline),
            "close" => Some(Inbound::Close),
            "connected" => typed(&kind, payload).map(Inbound::Connected),
            "error" => typed(&kind, payload).map(Inbound::Error),
            "invite" => typed(&kind, payload).map(Inbound::Invite),
            "cancel" => typed::<CancelFrame>(&kind, payload).map(|c| Inbound::Cancel {
                call_sid: c.call_sid,
            }),
            "ringing" => Some(Inbound::CallSignal(CallSignal::new(
                CallSignalKind::Ringing,
                payload,
            ))),
            "ack" => Some(Inbound::CallSignal(CallSignal::new(
                CallSignalKind::Ack,
                payload,
            ))),
            "hangup" => Some(Inbound::CallSignal(CallSignal::new(
                CallSignalKind::Hangup,
                payload,
            ))),
            "status" => Some(Inbound::CallSignal(CallSignal::new(
                CallSignalKind::Status,
                payload,
            ))),
            other => {
                debug!(target: "PStream", "Ignoring frame of unknown type '{other}'");
                None
            }
        }
    }
}

fn typed<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Option<T> {
    match serde_json::from_value(payload) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!(target: "PStream", "Dropping '{kind}' frame with malformed payload: {e}");
            None
        }
    }
}

/// Parsed inbound frames. The set is closed; anything else is dropped at
/// parse time.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Registration confirmed by the gateway.
    Ready,
    /// Presence dropped by the gateway.
    Offline,
    /// Gateway-directed final close of this connection.
    Close,
    Connected(ConnectedInfo),
    Error(GatewayError),
    Invite(InviteFrame),
    Cancel { call_sid: String },
    CallSignal(CallSignal),
}

/// Payload of the `connected` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectedInfo {
    pub region: Option<String>,
    pub gateway: Option<String>,
    pub token: Option<TokenInfo>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TokenInfo {
    /// Remaining token lifetime in seconds, as reported by the gateway.
    pub ttl: u64,
}

/// Payload of an `error` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayError {
    pub error: GatewayErrorBody,
    #[serde(rename = "callsid")]
    pub call_sid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayErrorBody {
    pub code: u32,
    pub message: Option<String>,
    /// Server-directed reconnect pacing, in seconds.
    #[serde(rename = "retryafter")]
    pub retry_after: Option<u64>,
}

/// Payload of an `invite` frame. `callsid` and `sdp` are required; frames
/// missing either are dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct InviteFrame {
    #[serde(rename = "callsid")]
    pub call_sid: String,
    pub sdp: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
struct CancelFrame {
    #[serde(rename = "callsid")]
    call_sid: String,
}

/// Which per-call signal arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSignalKind {
    Ringing,
    Ack,
    Hangup,
    Status,
}

/// Per-call signal passed through to the call layer untouched apart from
/// the extracted call sid.
#[derive(Debug, Clone)]
pub struct CallSignal {
    pub kind: CallSignalKind,
    pub call_sid: Option<String>,
    pub payload: Value,
}

impl CallSignal {
    fn new(kind: CallSignalKind, payload: Value) -> Self {
        let call_sid = payload
            .get("callsid")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Self {
            kind,
            call_sid,
            payload,
        }
    }
}
