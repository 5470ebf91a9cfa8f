use std::time::Duration;

use crate::edge;

/// Options accepted by [`crate::session::SignalingSession`].
///
/// Timing knobs (`connect_timeout`, `max_call_signaling_timeout`) are read
/// once at construction; endpoint-affecting options apply live through
/// `update_options`.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Ranked edge names the signaling endpoint list is derived from. Empty
    /// means [`edge::DEFAULT_EDGE`].
    pub edges: Vec<String>,
    /// Explicit signaling endpoint override list. Non-empty wins over
    /// `edges`.
    pub chunder_uris: Vec<String>,
    /// Surface a queued incoming call while another call is active.
    pub allow_incoming_while_busy: bool,
    /// Cap on how long reconnecting signaling may stay pinned to its
    /// preferred edge before the ranked list takes over. Zero means the
    /// transport default.
    pub max_call_signaling_timeout: Duration,
    /// Lead time before token expiry at which `TokenAboutToExpire` fires.
    pub token_refresh: Duration,
    /// Map known gateway signaling codes to precise errors instead of the
    /// generic unknown-error bucket.
    pub improved_signaling_error_precision: bool,
    /// Time allowed for a single websocket connect attempt.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            edges: Vec::new(),
            chunder_uris: Vec::new(),
            allow_incoming_while_busy: false,
            max_call_signaling_timeout: Duration::ZERO,
            token_refresh: Duration::from_secs(10),
            improved_signaling_error_precision: false,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Candidate endpoint list in fallback order: the explicit override list
    /// when present, otherwise one URI per configured edge.
    pub fn resolve_uris(&self) -> Vec<String> {
        if !self.chunder_uris.is_empty() {
            return self.chunder_uris.clone();
        }
        edge::uris_for_edges(&self.edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_the_roaming_edge() {
        let uris = SessionConfig::default().resolve_uris();
        assert_eq!(uris, vec!["wss://roaming.gw.callwire.io/signal".to_owned()]);
    }

    #[test]
    fn explicit_uris_win_over_edges() {
        let config = SessionConfig {
            edges: vec!["de1".to_owned()],
            chunder_uris: vec!["wss://lab.example.com/signal".to_owned()],
            ..SessionConfig::default()
        };
        assert_eq!(
            config.resolve_uris(),
            vec!["wss://lab.example.com/signal".to_owned()]
        );
    }
}
