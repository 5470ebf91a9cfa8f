//! Signaling session: the registration lifecycle over the protocol stream.
//!
//! One driver task owns the stream, the state machine, the pending
//! register/unregister waiters, the invite queue, and the re-registration
//! and token-expiry timers. The public [`SignalingSession`] handle sends
//! commands to it; everything asynchronous comes back as [`SessionEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::RngCore;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::edge;
use crate::error::{self, SignalingError};
use crate::events::{CallInvite, SessionEvent};
use crate::protocol::{CallSignal, CallSignalKind, ConnectedInfo, GatewayError, Inbound, InviteFrame};
use crate::pstream::{PStream, PublishOutcome, StreamEvent};
use crate::socket::{self, Connector, WsConnector};
use crate::transport::{TransportConfig, TransportEvent, deadline};

/// Presence refresh cadence while registered.
const REGISTRATION_INTERVAL: Duration = Duration::from_secs(30);

/// Registration lifecycle. `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Unregistered,
    Registering,
    Registered,
    Destroyed,
}

/// Inputs of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionTransition {
    RegistrationRequested,
    RegistrationConfirmed,
    WentOffline,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot apply {transition:?} while {from:?}")]
struct InvalidTransition {
    from: SignalingState,
    transition: SessionTransition,
}

/// The full transition table. Everything not listed is invalid.
fn apply_transition(
    state: SignalingState,
    transition: SessionTransition,
) -> Result<SignalingState, InvalidTransition> {
    let next = match (state, transition) {
        (SignalingState::Unregistered, SessionTransition::RegistrationRequested) => {
            SignalingState::Registering
        }
        // The gateway's confirmation is authoritative regardless of what the
        // session believed.
        (
            SignalingState::Unregistered | SignalingState::Registering | SignalingState::Registered,
            SessionTransition::RegistrationConfirmed,
        ) => SignalingState::Registered,
        (
            SignalingState::Unregistered | SignalingState::Registering | SignalingState::Registered,
            SessionTransition::WentOffline,
        ) => SignalingState::Unregistered,
        (
            SignalingState::Unregistered | SignalingState::Registering | SignalingState::Registered,
            SessionTransition::Destroy,
        ) => SignalingState::Destroyed,
        (state, transition) => return Err(InvalidTransition { from: state, transition }),
    };
    Ok(next)
}

type ReplyTo<T> = oneshot::Sender<T>;

enum SessionCommand {
    Open,
    Register(ReplyTo<Result<(), SignalingError>>),
    Unregister(ReplyTo<Result<(), SignalingError>>),
    Destroy(ReplyTo<()>),
    UpdateToken {
        token: String,
        reply: ReplyTo<Result<(), SignalingError>>,
    },
    UpdateOptions {
        options: SessionConfig,
        reply: ReplyTo<Result<(), SignalingError>>,
    },
    State(ReplyTo<SignalingState>),
    Invite {
        call_sid: String,
        sdp: String,
        params: Value,
        reply: ReplyTo<Result<(), SignalingError>>,
    },
    Answer {
        call_sid: String,
        sdp: String,
        reply: ReplyTo<Result<(), SignalingError>>,
    },
    Reinvite {
        call_sid: String,
        sdp: String,
        reply: ReplyTo<Result<(), SignalingError>>,
    },
    Reconnect {
        call_sid: String,
        sdp: String,
        reconnect_token: String,
        reply: ReplyTo<Result<(), SignalingError>>,
    },
    Reject {
        call_sid: String,
        reply: ReplyTo<Result<(), SignalingError>>,
    },
    Hangup {
        call_sid: String,
        message: Option<String>,
        reply: ReplyTo<Result<(), SignalingError>>,
    },
    Dtmf {
        call_sid: String,
        digits: String,
        reply: ReplyTo<Result<(), SignalingError>>,
    },
    SendMessage {
        call_sid: String,
        content: Value,
        content_type: String,
        message_type: String,
        reply: ReplyTo<Result<String, SignalingError>>,
    },
    TakeInvite {
        call_sid: String,
        reply: ReplyTo<Option<CallInvite>>,
    },
    TakeInvites(ReplyTo<Vec<CallInvite>>),
}

/// Handle to a running signaling session. Cloning is cheap; all clones talk
/// to the same driver.
#[derive(Clone)]
pub struct SignalingSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SignalingSession {
    /// Builds a session speaking `wss` to the real gateways.
    pub fn new(
        token: String,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SignalingError> {
        Self::with_connector(token, config, Arc::new(WsConnector))
    }

    /// Injection point for tests and alternative socket stacks.
    pub fn with_connector(
        token: String,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SignalingError> {
        if token.is_empty() {
            return Err(SignalingError::InvalidArgument(
                "token must be a non-empty string".to_owned(),
            ));
        }
        let uris = config.resolve_uris();
        if uris.is_empty() {
            return Err(SignalingError::InvalidArgument(
                "no signaling endpoints resolve from the given options".to_owned(),
            ));
        }
        for uri in &uris {
            socket::validate_uri(uri)
                .map_err(|e| SignalingError::InvalidArgument(e.to_string()))?;
        }

        let transport_config = TransportConfig {
            uris: uris.clone(),
            connect_timeout: config.connect_timeout,
            max_preferred_duration: if config.max_call_signaling_timeout.is_zero() {
                TransportConfig::default().max_preferred_duration
            } else {
                config.max_call_signaling_timeout
            },
            ..TransportConfig::default()
        };
        let stream = PStream::new(token, transport_config, connector);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            config,
            stream,
            commands: command_rx,
            events: event_tx,
            state: SignalingState::Unregistered,
            should_re_register: false,
            pending_register: None,
            pending_unregister: None,
            invites: Vec::new(),
            active_call: None,
            resolved_uris: uris,
            reregister_deadline: None,
            token_expiry_deadline: None,
        };
        tokio::spawn(driver.run());
        Ok((Self { commands: command_tx }, event_rx))
    }

    /// Starts connecting the signaling transport without registering.
    pub fn open(&self) -> Result<(), SignalingError> {
        self.send_command(SessionCommand::Open)
    }

    /// Registers for incoming calls. Resolves once the gateway confirms, or
    /// fails if the session goes offline first.
    pub async fn register(&self) -> Result<(), SignalingError> {
        self.round_trip(SessionCommand::Register).await?
    }

    /// Withdraws presence. Resolves once the gateway reports offline.
    pub async fn unregister(&self) -> Result<(), SignalingError> {
        self.round_trip(SessionCommand::Unregister).await?
    }

    /// Tears the session down. Terminal and idempotent.
    pub async fn destroy(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(SessionCommand::Destroy(reply)).is_ok() {
            let _ = done.await;
        }
    }

    /// Replaces the access token and re-announces with it.
    pub async fn update_token(&self, token: impl Into<String>) -> Result<(), SignalingError> {
        let token = token.into();
        self.round_trip(|reply| SessionCommand::UpdateToken { token, reply })
            .await?
    }

    /// Applies new options. Endpoint changes are rejected during an active
    /// call.
    pub async fn update_options(&self, options: SessionConfig) -> Result<(), SignalingError> {
        self.round_trip(|reply| SessionCommand::UpdateOptions { options, reply })
            .await?
    }

    pub async fn state(&self) -> SignalingState {
        self.round_trip(SessionCommand::State)
            .await
            .unwrap_or(SignalingState::Destroyed)
    }

    /// Offers an outbound call.
    pub async fn invite(
        &self,
        call_sid: impl Into<String>,
        sdp: impl Into<String>,
        params: Value,
    ) -> Result<(), SignalingError> {
        let (call_sid, sdp) = (call_sid.into(), sdp.into());
        self.round_trip(|reply| SessionCommand::Invite { call_sid, sdp, params, reply })
            .await?
    }

    /// Accepts a queued incoming call.
    pub async fn answer(
        &self,
        call_sid: impl Into<String>,
        sdp: impl Into<String>,
    ) -> Result<(), SignalingError> {
        let (call_sid, sdp) = (call_sid.into(), sdp.into());
        self.round_trip(|reply| SessionCommand::Answer { call_sid, sdp, reply })
            .await?
    }

    /// Renegotiates an active call. Fails rather than queueing when the
    /// transport is down.
    pub async fn reinvite(
        &self,
        call_sid: impl Into<String>,
        sdp: impl Into<String>,
    ) -> Result<(), SignalingError> {
        let (call_sid, sdp) = (call_sid.into(), sdp.into());
        self.round_trip(|reply| SessionCommand::Reinvite { call_sid, sdp, reply })
            .await?
    }

    /// Re-offers a call that survived a full signaling loss, carrying the
    /// reconnect token issued for it.
    pub async fn reconnect(
        &self,
        call_sid: impl Into<String>,
        sdp: impl Into<String>,
        reconnect_token: impl Into<String>,
    ) -> Result<(), SignalingError> {
        let (call_sid, sdp, reconnect_token) =
            (call_sid.into(), sdp.into(), reconnect_token.into());
        self.round_trip(|reply| SessionCommand::Reconnect {
            call_sid,
            sdp,
            reconnect_token,
            reply,
        })
        .await?
    }

    /// Declines a queued incoming call.
    pub async fn reject(&self, call_sid: impl Into<String>) -> Result<(), SignalingError> {
        let call_sid = call_sid.into();
        self.round_trip(|reply| SessionCommand::Reject { call_sid, reply })
            .await?
    }

    pub async fn hangup(
        &self,
        call_sid: impl Into<String>,
        message: Option<String>,
    ) -> Result<(), SignalingError> {
        let call_sid = call_sid.into();
        self.round_trip(|reply| SessionCommand::Hangup { call_sid, message, reply })
            .await?
    }

    pub async fn dtmf(
        &self,
        call_sid: impl Into<String>,
        digits: impl Into<String>,
    ) -> Result<(), SignalingError> {
        let (call_sid, digits) = (call_sid.into(), digits.into());
        self.round_trip(|reply| SessionCommand::Dtmf { call_sid, digits, reply })
            .await?
    }

    /// Sends a user-defined message into an active call. Returns the
    /// generated voice event sid for correlating acks.
    pub async fn send_message(
        &self,
        call_sid: impl Into<String>,
        content: Value,
        content_type: impl Into<String>,
        message_type: impl Into<String>,
    ) -> Result<String, SignalingError> {
        let (call_sid, content_type, message_type) =
            (call_sid.into(), content_type.into(), message_type.into());
        self.round_trip(|reply| SessionCommand::SendMessage {
            call_sid,
            content,
            content_type,
            message_type,
            reply,
        })
        .await?
    }

    /// Hands off a queued invite. At most one caller ever receives it.
    pub async fn take_invite(&self, call_sid: impl Into<String>) -> Option<CallInvite> {
        let call_sid = call_sid.into();
        self.round_trip(|reply| SessionCommand::TakeInvite { call_sid, reply })
            .await
            .unwrap_or(None)
    }

    /// Drains every queued invite.
    pub async fn take_invites(&self) -> Vec<CallInvite> {
        self.round_trip(SessionCommand::TakeInvites)
            .await
            .unwrap_or_default()
    }

    fn send_command(&self, command: SessionCommand) -> Result<(), SignalingError> {
        self.commands
            .send(command)
            .map_err(|_| destroyed_error())
    }

    async fn round_trip<T>(
        &self,
        make: impl FnOnce(ReplyTo<T>) -> SessionCommand,
    ) -> Result<T, SignalingError> {
        let (reply, answer) = oneshot::channel();
        self.send_command(make(reply))?;
        answer.await.map_err(|_| destroyed_error())
    }
}

fn destroyed_error() -> SignalingError {
    SignalingError::InvalidState("session is destroyed".to_owned())
}

fn generate_voice_event_sid() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    format!("EV{}", hex::encode(bytes))
}

struct Driver {
    config: SessionConfig,
    stream: PStream,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,

    state: SignalingState,
    /// Re-register automatically on the next successful reconnect.
    should_re_register: bool,
    pending_register: Option<ReplyTo<Result<(), SignalingError>>>,
    pending_unregister: Option<ReplyTo<Result<(), SignalingError>>>,
    invites: Vec<CallInvite>,
    active_call: Option<String>,
    resolved_uris: Vec<String>,

    reregister_deadline: Option<Instant>,
    token_expiry_deadline: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        debug!(target: "Session", "Driver started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.handle_destroy();
                        break;
                    }
                },
                event = self.stream.next_event() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        error!(target: "Session", "Transport driver vanished");
                        break;
                    }
                },
                _ = deadline(self.reregister_deadline), if self.reregister_deadline.is_some() => {
                    self.handle_reregister_tick().await;
                },
                _ = deadline(self.token_expiry_deadline), if self.token_expiry_deadline.is_some() => {
                    self.handle_token_expiring();
                },
            }
        }
        debug!(target: "Session", "Driver stopped");
    }

    /// Returns true when the driver should exit.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Open => self.stream.open(),
            SessionCommand::Register(reply) => self.handle_register(reply).await,
            SessionCommand::Unregister(reply) => self.handle_unregister(reply).await,
            SessionCommand::Destroy(reply) => {
                self.handle_destroy();
                let _ = reply.send(());
                return true;
            }
            SessionCommand::UpdateToken { token, reply } => {
                self.handle_update_token(token, reply).await;
            }
            SessionCommand::UpdateOptions { options, reply } => {
                self.handle_update_options(options, reply);
            }
            SessionCommand::State(reply) => {
                let _ = reply.send(self.state);
            }
            SessionCommand::Invite { call_sid, sdp, params, reply } => {
                let result = if call_sid.is_empty() {
                    Err(SignalingError::InvalidArgument(
                        "call sid must be a non-empty string".to_owned(),
                    ))
                } else {
                    self.active_call = Some(call_sid.clone());
                    let outcome = self.stream.invite(&call_sid, &sdp, params, None).await;
                    self.publish_result(outcome)
                };
                let _ = reply.send(result);
            }
            SessionCommand::Answer { call_sid, sdp, reply } => {
                self.invites.retain(|invite| invite.call_sid != call_sid);
                self.active_call = Some(call_sid.clone());
                let outcome = self.stream.answer(&call_sid, &sdp).await;
                let _ = reply.send(self.publish_result(outcome));
            }
            SessionCommand::Reinvite { call_sid, sdp, reply } => {
                let outcome = self.stream.reinvite(&call_sid, &sdp).await;
                let _ = reply.send(self.publish_result(outcome));
            }
            SessionCommand::Reconnect { call_sid, sdp, reconnect_token, reply } => {
                self.active_call = Some(call_sid.clone());
                let outcome = self
                    .stream
                    .invite(&call_sid, &sdp, json!({}), Some(&reconnect_token))
                    .await;
                let _ = reply.send(self.publish_result(outcome));
            }
            SessionCommand::Reject { call_sid, reply } => {
                self.invites.retain(|invite| invite.call_sid != call_sid);
                if self.active_call.as_deref() == Some(call_sid.as_str()) {
                    self.active_call = None;
                }
                let outcome = self.stream.reject(&call_sid).await;
                let _ = reply.send(self.publish_result(outcome));
            }
            SessionCommand::Hangup { call_sid, message, reply } => {
                if self.active_call.as_deref() == Some(call_sid.as_str()) {
                    self.active_call = None;
                }
                let outcome = self.stream.hangup(&call_sid, message.as_deref()).await;
                let _ = reply.send(self.publish_result(outcome));
            }
            SessionCommand::Dtmf { call_sid, digits, reply } => {
                let outcome = self.stream.dtmf(&call_sid, &digits).await;
                let _ = reply.send(self.publish_result(outcome));
            }
            SessionCommand::SendMessage { call_sid, content, content_type, message_type, reply } => {
                let voice_event_sid = generate_voice_event_sid();
                let outcome = self
                    .stream
                    .send_message(&call_sid, &voice_event_sid, content, &content_type, &message_type)
                    .await;
                let result = self.publish_result(outcome).map(|_| voice_event_sid);
                let _ = reply.send(result);
            }
            SessionCommand::TakeInvite { call_sid, reply } => {
                let position = self
                    .invites
                    .iter()
                    .position(|invite| invite.call_sid == call_sid);
                let _ = reply.send(position.map(|i| self.invites.remove(i)));
            }
            SessionCommand::TakeInvites(reply) => {
                let _ = reply.send(std::mem::take(&mut self.invites));
            }
        }
        false
    }

    async fn handle_register(&mut self, reply: ReplyTo<Result<(), SignalingError>>) {
        if self.try_transition(SessionTransition::RegistrationRequested).is_err() {
            let _ = reply.send(Err(SignalingError::InvalidState(format!(
                "register() requires an unregistered session (currently {:?})",
                self.state
            ))));
            return;
        }
        self.pending_register = Some(reply);
        self.begin_registration().await;
    }

    /// Shared by explicit register() and automatic re-registration. The
    /// state is already `Registering` when this runs.
    async fn begin_registration(&mut self) {
        self.reregister_deadline = Some(Instant::now() + REGISTRATION_INTERVAL);
        if self.stream.is_open() {
            self.send_presence(true).await;
        } else {
            // The presence announce follows once the transport reports open.
            self.stream.open();
        }
    }

    async fn handle_unregister(&mut self, reply: ReplyTo<Result<(), SignalingError>>) {
        if self.state != SignalingState::Registered {
            let _ = reply.send(Err(SignalingError::InvalidState(format!(
                "unregister() requires a registered session (currently {:?})",
                self.state
            ))));
            return;
        }
        self.reregister_deadline = None;
        self.pending_unregister = Some(reply);
        self.send_presence(false).await;
    }

    fn handle_destroy(&mut self) {
        if self.state == SignalingState::Destroyed {
            return;
        }
        info!(target: "Session", "Destroying session");
        let _ = self.try_transition(SessionTransition::Destroy);
        self.reregister_deadline = None;
        self.token_expiry_deadline = None;
        self.should_re_register = false;
        if let Some(reply) = self.pending_register.take() {
            let _ = reply.send(Err(destroyed_error()));
        }
        if let Some(reply) = self.pending_unregister.take() {
            let _ = reply.send(Err(destroyed_error()));
        }
        self.stream.close();
    }

    async fn handle_update_token(
        &mut self,
        token: String,
        reply: ReplyTo<Result<(), SignalingError>>,
    ) {
        if token.is_empty() {
            let _ = reply.send(Err(SignalingError::InvalidArgument(
                "token must be a non-empty string".to_owned(),
            )));
            return;
        }
        debug!(target: "Session", "Access token updated");
        let outcome = self.stream.set_token(token).await;
        let _ = reply.send(self.publish_result(outcome));
    }

    fn handle_update_options(
        &mut self,
        options: SessionConfig,
        reply: ReplyTo<Result<(), SignalingError>>,
    ) {
        let uris = options.resolve_uris();
        if uris.is_empty() {
            let _ = reply.send(Err(SignalingError::InvalidArgument(
                "no signaling endpoints resolve from the given options".to_owned(),
            )));
            return;
        }
        if uris != self.resolved_uris {
            if self.active_call.is_some() {
                let _ = reply.send(Err(SignalingError::InvalidState(
                    "signaling endpoints cannot change during an active call".to_owned(),
                )));
                return;
            }
            info!(target: "Session", "Signaling endpoint list updated");
            self.stream.update_uris(uris.clone());
            self.resolved_uris = uris;
        }
        self.config = options;
        let _ = reply.send(Ok(()));
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(stream_event) = self.stream.process(event).await else {
            return;
        };
        match stream_event {
            StreamEvent::TransportOpen => self.handle_transport_open().await,
            StreamEvent::TransportClosed { will_reconnect } => {
                self.handle_went_offline(will_reconnect);
            }
            StreamEvent::TransportError(error) => self.emit(SessionEvent::Error(error)),
            StreamEvent::Inbound(inbound) => self.handle_inbound(inbound).await,
        }
    }

    async fn handle_transport_open(&mut self) {
        debug!(target: "Session", "Signaling transport up");
        if self.should_re_register {
            self.should_re_register = false;
            info!(target: "Session", "Re-registering after connection loss");
            // Already Registering when a register() arrived mid-outage.
            let _ = self.try_transition(SessionTransition::RegistrationRequested);
        }
        if self.state == SignalingState::Registering {
            // Reached by the transition above or by a register() that raced
            // the connect; the presence announce waited for the transport.
            self.begin_registration().await;
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Ready => {
                debug!(target: "Session", "Registration confirmed");
                let _ = self.try_transition(SessionTransition::RegistrationConfirmed);
                if let Some(reply) = self.pending_register.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            Inbound::Offline => {
                info!(target: "Session", "Gateway reports presence offline");
                self.handle_went_offline(true);
            }
            Inbound::Close => {
                info!(target: "Session", "Gateway directed the connection to close");
                self.handle_went_offline(false);
                self.stream.close();
            }
            Inbound::Connected(info) => self.handle_gateway_connected(info).await,
            Inbound::Error(frame) => self.handle_gateway_error(frame),
            Inbound::Invite(frame) => self.handle_invite_frame(frame),
            Inbound::Cancel { call_sid } => self.handle_cancel(call_sid),
            Inbound::CallSignal(signal) => self.handle_call_signal(signal),
        }
    }

    /// Both kinds of going offline funnel here: gateway `offline`/`close`
    /// frames and transport-level closure. `allow_re_register` is false for
    /// deliberate teardowns.
    fn handle_went_offline(&mut self, allow_re_register: bool) {
        let was_live = self.state != SignalingState::Unregistered
            && self.state != SignalingState::Destroyed;
        let solicited = self.pending_unregister.is_some();
        if allow_re_register {
            if was_live && !solicited {
                self.should_re_register = true;
                debug!(target: "Session", "Will re-register on the next connection");
            }
        } else {
            self.should_re_register = false;
        }
        self.reregister_deadline = None;
        self.token_expiry_deadline = None;
        let _ = self.try_transition(SessionTransition::WentOffline);
        if let Some(reply) = self.pending_unregister.take() {
            let _ = reply.send(Ok(()));
        }
        if let Some(reply) = self.pending_register.take() {
            let _ = reply.send(Err(SignalingError::ConnectionDisconnected(
                "connection went offline before registration completed".to_owned(),
            )));
        }
    }

    async fn handle_gateway_connected(&mut self, info: ConnectedInfo) {
        info!(
            target: "Session",
            "Gateway handshake complete (region {:?})",
            info.region
        );
        if let Some(token_info) = info.token {
            let ttl = Duration::from_secs(token_info.ttl);
            let lead = ttl.saturating_sub(self.config.token_refresh);
            self.token_expiry_deadline = Some(Instant::now() + lead);
            debug!(target: "Session", "Token expiry warning armed in {lead:?}");
        }
        if let Some(region) = info.region.as_deref() {
            let edge_name = edge::edge_for_region(region);
            self.stream
                .update_preferred_uri(Some(edge::uri_for_edge(&edge_name)));
        }
        self.emit(SessionEvent::GatewayConnected {
            region: info.region,
            gateway: info.gateway,
        });
        // Offline without transport loss: the gateway handshake doubles as
        // the reconnect signal.
        if self.should_re_register {
            self.should_re_register = false;
            info!(target: "Session", "Re-registering after gateway handshake");
            let _ = self.try_transition(SessionTransition::RegistrationRequested);
            if self.state == SignalingState::Registering {
                self.begin_registration().await;
            }
        }
    }

    fn handle_gateway_error(&mut self, frame: GatewayError) {
        let error = error::map_gateway_error(
            frame.error.code,
            frame.error.message.clone(),
            self.config.improved_signaling_error_precision,
        );
        warn!(
            target: "Session",
            "Gateway error {} (call {:?}): {error}",
            frame.error.code,
            frame.call_sid
        );
        if matches!(error, SignalingError::AccessTokenExpired(_)) {
            // Periodic presence refresh stops until a fresh token arrives.
            self.reregister_deadline = None;
        }
        if let Some(seconds) = frame.error.retry_after {
            self.stream.set_retry_after(Duration::from_secs(seconds));
        }
        self.emit(SessionEvent::Error(error));
    }

    fn handle_invite_frame(&mut self, frame: InviteFrame) {
        if self.active_call.is_some() && !self.config.allow_incoming_while_busy {
            info!(
                target: "Session",
                "Busy; ignoring incoming invite for call {}",
                frame.call_sid
            );
            return;
        }
        let invite = CallInvite {
            call_sid: frame.call_sid,
            sdp: frame.sdp,
            parameters: frame.parameters,
        };
        // A re-sent invite for the same call replaces the stale offer.
        self.invites
            .retain(|queued| queued.call_sid != invite.call_sid);
        self.invites.push(invite.clone());
        self.emit(SessionEvent::IncomingCall(invite));
    }

    fn handle_cancel(&mut self, call_sid: String) {
        let before = self.invites.len();
        self.invites.retain(|invite| invite.call_sid != call_sid);
        if self.invites.len() == before {
            debug!(target: "Session", "Cancel for unknown call {call_sid}; ignoring");
            return;
        }
        self.emit(SessionEvent::InviteCancelled { call_sid });
    }

    fn handle_call_signal(&mut self, signal: CallSignal) {
        if signal.kind == CallSignalKind::Hangup
            && signal.call_sid.is_some()
            && signal.call_sid == self.active_call
        {
            self.active_call = None;
        }
        self.emit(SessionEvent::CallSignal(signal));
    }

    async fn handle_reregister_tick(&mut self) {
        match self.state {
            SignalingState::Registered => {
                self.reregister_deadline = Some(Instant::now() + REGISTRATION_INTERVAL);
                self.send_presence(true).await;
            }
            SignalingState::Registering => {
                self.reregister_deadline = Some(Instant::now() + REGISTRATION_INTERVAL);
            }
            _ => {
                self.reregister_deadline = None;
            }
        }
    }

    fn handle_token_expiring(&mut self) {
        // Fires at most once per arming.
        self.token_expiry_deadline = None;
        info!(target: "Session", "Access token approaching expiry");
        self.emit(SessionEvent::TokenAboutToExpire);
    }

    async fn send_presence(&mut self, available: bool) {
        debug!(target: "Session", "Sending presence (audio: {available})");
        let outcome = self.stream.register(available).await;
        let _ = self.publish_result(outcome);
    }

    /// Folds a publish outcome into the caller-visible result. Anything short
    /// of a live send is also reported as a transport-unavailable error
    /// event; queued frames still count as accepted because the stream
    /// replays them after reconnection.
    fn publish_result(&self, outcome: PublishOutcome) -> Result<(), SignalingError> {
        if outcome == PublishOutcome::Sent {
            return Ok(());
        }
        let error = SignalingError::TransportUnavailable(
            "no transport available to send or receive messages".to_owned(),
        );
        self.emit(SessionEvent::Error(error.clone()));
        match outcome {
            PublishOutcome::Queued => Ok(()),
            _ => Err(error),
        }
    }

    fn try_transition(&mut self, transition: SessionTransition) -> Result<(), InvalidTransition> {
        let next = apply_transition(self.state, transition)?;
        if next != self.state {
            debug!(
                target: "Session",
                "State {:?} -> {next:?} ({transition:?})",
                self.state
            );
            self.state = next;
            self.emit(SessionEvent::State(next));
        }
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
