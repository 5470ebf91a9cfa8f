//! Reconnecting websocket transport with ranked-endpoint fallback.
//!
//! A single driver task owns every piece of mutable state: the fallback
//! cursor, the preferred URI and its budget, both backoff strategies, and
//! the connect/heartbeat/stability timers. Callers talk to the driver
//! through a cheap-clone [`Transport`] handle; progress comes back as
//! [`TransportEvent`]s. Connect attempts run as detached tasks tagged with
//! a connection epoch so completions from a superseded attempt are
//! discarded instead of racing the current one.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::backoff::{Backoff, BackoffConfig, BackoffEvent};
use crate::error::SignalingError;
use crate::socket::{
    CLOSE_CODE_ABNORMAL, CLOSE_CODE_TLS_FAILURE, Connector, Socket, SocketError, SocketEvent,
};

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Connecting,
    Open,
}

/// Events emitted by the transport driver.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection finished its handshake and is ready for frames.
    Open,
    /// A complete inbound frame.
    Message(String),
    /// A non-fatal failure. The transport keeps reconnecting on its own.
    Error(SignalingError),
    /// The connection went down. `will_reconnect` is false only for
    /// caller-requested closes.
    Closed { will_reconnect: bool },
}

/// Tuning for the reconnecting transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Ranked fallback endpoints, tried in order through a wrapping cursor.
    pub uris: Vec<String>,
    /// Endpoint tried before the ranked list, for edge stickiness.
    pub preferred_uri: Option<String>,
    /// Time allowed for a single connect attempt.
    pub connect_timeout: Duration,
    /// Maximum quiet time on an open connection before it is presumed dead.
    pub heartbeat_timeout: Duration,
    /// Continuous-open time after which both backoff curves rewind.
    pub stability_threshold: Duration,
    /// Budget for retrying the preferred URI before the ranked list takes
    /// over for good.
    pub max_preferred_duration: Duration,
    pub preferred_backoff: BackoffConfig,
    pub primary_backoff: BackoffConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            uris: Vec::new(),
            preferred_uri: None,
            connect_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            stability_threshold: Duration::from_secs(10),
            max_preferred_duration: Duration::from_secs(15),
            preferred_backoff: BackoffConfig {
                max_delay: Duration::from_secs(10),
                ..BackoffConfig::default()
            },
            primary_backoff: BackoffConfig::default(),
        }
    }
}

enum Command {
    Open,
    Close,
    Send {
        frame: String,
        sent: oneshot::Sender<bool>,
    },
    UpdatePreferredUri(Option<String>),
    UpdateUris(Vec<String>),
    SetRetryAfter(Duration),
    State(oneshot::Sender<TransportState>),
}

/// Cheap-clone handle to the transport driver.
#[derive(Clone)]
pub struct Transport {
    commands: mpsc::UnboundedSender<Command>,
}

impl Transport {
    /// Spawns the driver task. Events arrive on the returned receiver.
    pub fn new(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(Driver::new(config, connector, command_rx, event_tx).run());
        (Self { commands: command_tx }, event_rx)
    }

    /// Starts connecting unless already connecting or open.
    pub fn open(&self) {
        let _ = self.commands.send(Command::Open);
    }

    /// Closes the connection and stops reconnecting.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Sends one frame. Returns false when no healthy connection exists;
    /// never errors.
    pub async fn send(&self, frame: String) -> bool {
        let (sent, outcome) = oneshot::channel();
        if self.commands.send(Command::Send { frame, sent }).is_err() {
            return false;
        }
        outcome.await.unwrap_or(false)
    }

    /// Sets or clears the endpoint tried before the ranked list. Takes
    /// effect on the next connect attempt.
    pub fn update_preferred_uri(&self, uri: Option<String>) {
        let _ = self.commands.send(Command::UpdatePreferredUri(uri));
    }

    /// Replaces the ranked fallback list and rewinds the cursor.
    pub fn update_uris(&self, uris: Vec<String>) {
        let _ = self.commands.send(Command::UpdateUris(uris));
    }

    /// Server-directed pacing: overrides the next reconnect delay.
    pub fn set_retry_after(&self, delay: Duration) {
        let _ = self.commands.send(Command::SetRetryAfter(delay));
    }

    pub async fn state(&self) -> TransportState {
        let (reply, state) = oneshot::channel();
        if self.commands.send(Command::State(reply)).is_err() {
            return TransportState::Closed;
        }
        state.await.unwrap_or(TransportState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Preferred,
    Primary,
}

struct ConnectOutcome {
    epoch: u64,
    uri: String,
    result: Result<(Arc<dyn Socket>, mpsc::Receiver<SocketEvent>), SocketError>,
}

struct Driver {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,

    state: TransportState,
    uris: Vec<String>,
    cursor: usize,
    preferred_uri: Option<String>,
    /// First connect attempt against the current preferred URI; basis of
    /// the preferred-duration budget.
    preferred_since: Option<Instant>,
    /// One rotation-free reconnect, earned by the last successful open and
    /// spent on the first fallback-eligible failure after it.
    free_retry_granted: bool,

    /// Monotonic connection epoch. Completions tagged with an older epoch
    /// are stale.
    epoch: u64,
    socket: Option<Arc<dyn Socket>>,
    socket_events: Option<mpsc::Receiver<SocketEvent>>,
    connect_results_tx: mpsc::UnboundedSender<ConnectOutcome>,
    connect_results: mpsc::UnboundedReceiver<ConnectOutcome>,

    preferred_backoff: Backoff,
    preferred_backoff_events: mpsc::UnboundedReceiver<BackoffEvent>,
    primary_backoff: Backoff,
    primary_backoff_events: mpsc::UnboundedReceiver<BackoffEvent>,

    connect_deadline: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
    stability_deadline: Option<Instant>,
}

impl Driver {
    fn new(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (preferred_backoff, preferred_backoff_events) =
            Backoff::new(config.preferred_backoff.clone());
        let (primary_backoff, primary_backoff_events) = Backoff::new(config.primary_backoff.clone());
        let (connect_results_tx, connect_results) = mpsc::unbounded_channel();
        Self {
            uris: config.uris.clone(),
            preferred_uri: config.preferred_uri.clone(),
            config,
            connector,
            commands,
            events,
            state: TransportState::Closed,
            cursor: 0,
            preferred_since: None,
            free_retry_granted: false,
            epoch: 0,
            socket: None,
            socket_events: None,
            connect_results_tx,
            connect_results,
            preferred_backoff,
            preferred_backoff_events,
            primary_backoff,
            primary_backoff_events,
            connect_deadline: None,
            heartbeat_deadline: None,
            stability_deadline: None,
        }
    }

    async fn run(mut self) {
        debug!(target: "Transport", "Driver started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                outcome = self.connect_results.recv() => {
                    if let Some(outcome) = outcome {
                        self.handle_connect_outcome(outcome).await;
                    }
                },
                event = next_socket_event(&mut self.socket_events) => {
                    self.handle_socket_event(event).await;
                },
                event = self.preferred_backoff_events.recv() => {
                    if let Some(BackoffEvent::Ready { .. }) = event {
                        self.handle_retry_ready(Strategy::Preferred).await;
                    }
                },
                event = self.primary_backoff_events.recv() => {
                    if let Some(BackoffEvent::Ready { .. }) = event {
                        self.handle_retry_ready(Strategy::Primary).await;
                    }
                },
                _ = deadline(self.connect_deadline), if self.connect_deadline.is_some() => {
                    self.handle_connect_timeout().await;
                },
                _ = deadline(self.heartbeat_deadline), if self.heartbeat_deadline.is_some() => {
                    self.handle_heartbeat_timeout().await;
                },
                _ = deadline(self.stability_deadline), if self.stability_deadline.is_some() => {
                    self.handle_stable_connection();
                },
            }
        }
        // All handles dropped: tear down quietly.
        self.teardown_socket().await;
        debug!(target: "Transport", "Driver stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open => self.handle_open().await,
            Command::Close => self.handle_close().await,
            Command::Send { frame, sent } => {
                let ok = self.try_send(&frame).await;
                let _ = sent.send(ok);
            }
            Command::UpdatePreferredUri(uri) => self.handle_update_preferred(uri),
            Command::UpdateUris(uris) => self.handle_update_uris(uris),
            Command::SetRetryAfter(delay) => self.handle_set_retry_after(delay),
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
        }
    }

    async fn handle_open(&mut self) {
        if self.state != TransportState::Closed {
            debug!(target: "Transport", "Open requested while {:?}; ignoring", self.state);
            return;
        }
        self.start_connect().await;
    }

    async fn handle_close(&mut self) {
        let was_active = self.state != TransportState::Closed;
        self.preferred_backoff.reset();
        self.primary_backoff.reset();
        self.preferred_since = None;
        self.free_retry_granted = false;
        // Invalidate any connect attempt still in flight.
        self.epoch += 1;
        self.teardown_socket().await;
        self.set_state(TransportState::Closed);
        if was_active {
            info!(target: "Transport", "Closed by request");
            self.emit(TransportEvent::Closed { will_reconnect: false });
        }
    }

    /// Hands one frame to the live connection. A failing socket is reset
    /// here, entering the reconnection path, and the frame is reported
    /// unsent.
    async fn try_send(&mut self, frame: &str) -> bool {
        if self.state != TransportState::Open {
            return false;
        }
        let Some(socket) = self.socket.clone() else {
            return false;
        };
        match socket.send_frame(frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "Transport", "Send failed: {e}; resetting the connection");
                self.teardown_socket().await;
                self.emit_error(SignalingError::ConnectionDisconnected(format!(
                    "send failed: {e}"
                )));
                self.emit(TransportEvent::Closed { will_reconnect: true });
                self.schedule_reconnect();
                false
            }
        }
    }

    fn handle_update_preferred(&mut self, uri: Option<String>) {
        if uri == self.preferred_uri {
            return;
        }
        debug!(target: "Transport", "Preferred endpoint set to {uri:?}");
        self.preferred_uri = uri;
        self.preferred_since = None;
    }

    fn handle_update_uris(&mut self, uris: Vec<String>) {
        debug!(target: "Transport", "Endpoint list replaced ({} entries)", uris.len());
        self.uris = uris;
        self.cursor = 0;
    }

    fn handle_set_retry_after(&mut self, delay: Duration) {
        debug!(target: "Transport", "Server-directed retry pacing: {delay:?}");
        if self.preferred_uri.is_some() {
            self.preferred_backoff.set_retry_after(delay);
        } else {
            self.primary_backoff.set_retry_after(delay);
        }
    }

    /// Spawns a connect attempt against the current target. The driver stays
    /// responsive; the result comes back as a [`ConnectOutcome`].
    async fn start_connect(&mut self) {
        let Some(uri) = self.target_uri() else {
            warn!(target: "Transport", "No signaling endpoints configured");
            self.emit_error(SignalingError::ConnectionError(
                "no signaling endpoints configured".to_owned(),
            ));
            return;
        };
        self.epoch += 1;
        self.set_state(TransportState::Connecting);
        self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
        info!(target: "Transport", "Connecting to {uri}");
        let connector = self.connector.clone();
        let results = self.connect_results_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = connector.connect(&uri).await;
            let _ = results.send(ConnectOutcome { epoch, uri, result });
        });
    }

    /// Preferred URI when set, otherwise the ranked list at the cursor.
    fn target_uri(&mut self) -> Option<String> {
        if let Some(preferred) = self.preferred_uri.clone() {
            if self.preferred_since.is_none() {
                self.preferred_since = Some(Instant::now());
            }
            return Some(preferred);
        }
        if self.uris.is_empty() {
            return None;
        }
        self.cursor %= self.uris.len();
        Some(self.uris[self.cursor].clone())
    }

    async fn handle_connect_outcome(&mut self, outcome: ConnectOutcome) {
        if outcome.epoch != self.epoch {
            debug!(target: "Transport", "Discarding stale connect result for {}", outcome.uri);
            if let Ok((socket, _)) = outcome.result {
                socket.close().await;
            }
            return;
        }
        match outcome.result {
            Ok((socket, socket_events)) => {
                self.connect_deadline = None;
                self.socket = Some(socket);
                self.socket_events = Some(socket_events);
                self.free_retry_granted = true;
                self.heartbeat_deadline = Some(Instant::now() + self.config.heartbeat_timeout);
                self.stability_deadline = Some(Instant::now() + self.config.stability_threshold);
                self.set_state(TransportState::Open);
                info!(target: "Transport", "Connection to {} open", outcome.uri);
                self.emit(TransportEvent::Open);
            }
            Err(e) => {
                warn!(target: "Transport", "Connect to {} failed: {e}", outcome.uri);
                self.connect_deadline = None;
                self.emit_error(SignalingError::ConnectionError(format!(
                    "connect to {} failed: {e}",
                    outcome.uri
                )));
                self.note_fallback_eligible_failure();
                self.schedule_reconnect();
            }
        }
    }

    async fn handle_socket_event(&mut self, event: Option<SocketEvent>) {
        match event {
            Some(SocketEvent::Frame(frame)) => {
                // Any complete frame proves the connection is alive.
                self.heartbeat_deadline = Some(Instant::now() + self.config.heartbeat_timeout);
                self.emit(TransportEvent::Message(frame));
            }
            Some(SocketEvent::Closed { code }) => self.handle_socket_closed(code).await,
            // The read pump ended without a close event; treat it as an
            // abnormal closure.
            None => self.handle_socket_closed(CLOSE_CODE_ABNORMAL).await,
        }
    }

    async fn handle_socket_closed(&mut self, code: u16) {
        warn!(target: "Transport", "Connection closed (code {code})");
        self.teardown_socket().await;
        self.emit_error(SignalingError::ConnectionDisconnected(format!(
            "websocket closed with code {code}"
        )));
        self.emit(TransportEvent::Closed { will_reconnect: true });
        if fallback_eligible(code) {
            self.note_fallback_eligible_failure();
        }
        self.schedule_reconnect();
    }

    async fn handle_connect_timeout(&mut self) {
        warn!(
            target: "Transport",
            "Connect attempt exceeded {:?}",
            self.config.connect_timeout
        );
        self.connect_deadline = None;
        // Abandon the in-flight attempt and move the cursor unconditionally.
        self.epoch += 1;
        self.advance_cursor();
        self.emit_error(SignalingError::ConnectionError(
            "connect attempt timed out".to_owned(),
        ));
        self.schedule_reconnect();
    }

    async fn handle_heartbeat_timeout(&mut self) {
        warn!(
            target: "Transport",
            "No frames for {:?}; presuming the connection dead",
            self.config.heartbeat_timeout
        );
        self.teardown_socket().await;
        self.emit_error(SignalingError::ConnectionDisconnected(
            "heartbeat timed out".to_owned(),
        ));
        self.emit(TransportEvent::Closed { will_reconnect: true });
        self.note_fallback_eligible_failure();
        self.schedule_reconnect();
    }

    fn handle_stable_connection(&mut self) {
        self.stability_deadline = None;
        debug!(target: "Transport", "Connection stable; rewinding backoff curves");
        self.preferred_backoff.reset();
        self.primary_backoff.reset();
    }

    /// A backoff timer fired. Stale fires (explicit close cancels cycles by
    /// resetting both strategies; opens change state) are ignored.
    async fn handle_retry_ready(&mut self, strategy: Strategy) {
        if self.state != TransportState::Closed {
            debug!(target: "Transport", "Retry fired while {:?}; ignoring", self.state);
            return;
        }
        if strategy == Strategy::Preferred {
            if let (Some(_), Some(since)) = (&self.preferred_uri, self.preferred_since) {
                if since.elapsed() >= self.config.max_preferred_duration {
                    info!(
                        target: "Transport",
                        "Preferred endpoint budget exhausted; the ranked list takes over"
                    );
                    self.preferred_uri = None;
                    self.preferred_since = None;
                }
            }
        }
        self.start_connect().await;
    }

    /// Consumes the free retry earned by the last successful open, or moves
    /// the fallback cursor.
    fn note_fallback_eligible_failure(&mut self) {
        if self.free_retry_granted {
            self.free_retry_granted = false;
            info!(target: "Transport", "Retrying the last healthy endpoint once before rotating");
        } else {
            self.advance_cursor();
        }
    }

    fn advance_cursor(&mut self) {
        if self.uris.is_empty() {
            return;
        }
        self.cursor = (self.cursor + 1) % self.uris.len();
        debug!(target: "Transport", "Fallback cursor moved to {}", self.cursor);
    }

    /// Arms whichever backoff strategy currently applies.
    fn schedule_reconnect(&mut self) {
        self.set_state(TransportState::Closed);
        if self.preferred_uri.is_some() {
            self.preferred_backoff.backoff();
        } else {
            self.primary_backoff.backoff();
        }
    }

    async fn teardown_socket(&mut self) {
        self.connect_deadline = None;
        self.heartbeat_deadline = None;
        self.stability_deadline = None;
        self.socket_events = None;
        if let Some(socket) = self.socket.take() {
            socket.close().await;
        }
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            debug!(target: "Transport", "State {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: SignalingError) {
        let _ = self.events.send(TransportEvent::Error(error));
    }
}

fn fallback_eligible(code: u16) -> bool {
    matches!(code, CLOSE_CODE_ABNORMAL | CLOSE_CODE_TLS_FAILURE)
}

/// Sleeps until the deadline, or forever when none is armed. Callers gate
/// the select arm on `is_some()`.
pub(crate) async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_socket_event(events: &mut Option<mpsc::Receiver<SocketEvent>>) -> Option<SocketEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_abnormal_and_tls_closures_rotate() {
        assert!(fallback_eligible(1006));
        assert!(fallback_eligible(1015));
        assert!(!fallback_eligible(1000));
        assert!(!fallback_eligible(1005));
        assert!(!fallback_eligible(4000));
    }

    #[test]
    fn default_config_keeps_the_preferred_curve_tighter() {
        let config = TransportConfig::default();
        assert!(config.preferred_backoff.max_delay < config.primary_backoff.max_delay);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }
}
