//! Closed event surface of the session.

use serde_json::Value;

use crate::error::SignalingError;
use crate::protocol::CallSignal;
use crate::session::SignalingState;

/// A queued incoming call offer. Handed off at most once: retrieval removes
/// it from the session's queue.
#[derive(Debug, Clone, PartialEq)]
pub struct CallInvite {
    pub call_sid: String,
    pub sdp: String,
    /// Caller-supplied parameters, passed through unmodified.
    pub parameters: Value,
}

/// Everything a session reports upward. Synchronous misuse never appears
/// here; it comes back as `Err` from the method that was misused.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Registration lifecycle change.
    State(SignalingState),
    /// The gateway finished its application-level handshake.
    GatewayConnected {
        region: Option<String>,
        gateway: Option<String>,
    },
    IncomingCall(CallInvite),
    InviteCancelled { call_sid: String },
    /// The access token expires within the configured lead time; fetch and
    /// apply a fresh one.
    TokenAboutToExpire,
    /// Asynchronously-arriving network or gateway failure.
    Error(SignalingError),
    /// Per-call signal passthrough for the call layer.
    CallSignal(CallSignal),
}
