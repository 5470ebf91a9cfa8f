use thiserror::Error;

/// Closed taxonomy of errors surfaced by the signaling stack.
///
/// `InvalidState` and `InvalidArgument` describe caller misuse and come back
/// synchronously as `Err` from the method that was misused; they carry no
/// wire code. Every other variant describes an asynchronously-arriving
/// network or gateway problem and is delivered through the session's event
/// stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("signaling connection disconnected: {0}")]
    ConnectionDisconnected(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("access token invalid: {0}")]
    AccessTokenInvalid(String),
    #[error("access token expired: {0}")]
    AccessTokenExpired(String),
    #[error("signaling error {code}: {message}")]
    Signaling { code: u32, message: String },
    #[error("unknown signaling error (gateway code {code}): {message}")]
    Unknown { code: u32, message: String },
}

impl SignalingError {
    /// Stable numeric code for wire-mapped errors. Misuse errors have none.
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::InvalidState(_) | Self::InvalidArgument(_) => None,
            Self::ConnectionError(_) => Some(53000),
            Self::ConnectionDisconnected(_) => Some(53001),
            Self::TransportUnavailable(_) => Some(31009),
            Self::AuthenticationFailed(_) => Some(20151),
            Self::AccessTokenInvalid(_) => Some(20101),
            Self::AccessTokenExpired(_) => Some(20104),
            Self::Signaling { code, .. } => Some(*code),
            Self::Unknown { .. } => Some(31000),
        }
    }
}

/// Gateway codes that become [`SignalingError::Signaling`] when
/// `improved_signaling_error_precision` is enabled. Everything else lands in
/// the unknown-error bucket with its original code attached.
const PRECISE_SIGNALING_CODES: &[(u32, &str)] = &[
    (31480, "temporarily unavailable"),
    (31481, "call transaction does not exist"),
    (31484, "address incomplete"),
    (31486, "busy here"),
    (31487, "request terminated"),
    (31603, "declined"),
];

/// Maps a numeric error code reported by the gateway onto the closed
/// taxonomy.
pub fn map_gateway_error(
    code: u32,
    message: Option<String>,
    improved_precision: bool,
) -> SignalingError {
    let message = message.filter(|m| !m.is_empty());
    match code {
        20101 => SignalingError::AccessTokenInvalid(
            message.unwrap_or_else(|| "access token rejected by the gateway".into()),
        ),
        20104 => SignalingError::AccessTokenExpired(
            message.unwrap_or_else(|| "access token has expired".into()),
        ),
        20151 => SignalingError::AuthenticationFailed(
            message.unwrap_or_else(|| "gateway authentication failed".into()),
        ),
        31009 => SignalingError::TransportUnavailable(
            message.unwrap_or_else(|| "no transport available".into()),
        ),
        53000 => SignalingError::ConnectionError(
            message.unwrap_or_else(|| "signaling connection error".into()),
        ),
        53001 => SignalingError::ConnectionDisconnected(
            message.unwrap_or_else(|| "signaling connection disconnected".into()),
        ),
        _ => {
            if improved_precision {
                if let Some((_, name)) = PRECISE_SIGNALING_CODES.iter().find(|(c, _)| *c == code) {
                    return SignalingError::Signaling {
                        code,
                        message: message.unwrap_or_else(|| (*name).into()),
                    };
                }
            }
            SignalingError::Unknown {
                code,
                message: message.unwrap_or_else(|| "no additional detail".into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misuse_errors_have_no_wire_code() {
        assert_eq!(SignalingError::InvalidState("x".into()).code(), None);
        assert_eq!(SignalingError::InvalidArgument("x".into()).code(), None);
    }

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(SignalingError::ConnectionError("e".into()).code(), Some(53000));
        assert_eq!(
            SignalingError::ConnectionDisconnected("e".into()).code(),
            Some(53001)
        );
        assert_eq!(
            SignalingError::TransportUnavailable("e".into()).code(),
            Some(31009)
        );
        assert_eq!(SignalingError::AccessTokenExpired("e".into()).code(), Some(20104));
    }

    #[test]
    fn token_codes_map_to_dedicated_variants() {
        assert!(matches!(
            map_gateway_error(20104, None, false),
            SignalingError::AccessTokenExpired(_)
        ));
        assert!(matches!(
            map_gateway_error(20101, Some("bad jwt".into()), false),
            SignalingError::AccessTokenInvalid(m) if m == "bad jwt"
        ));
        assert!(matches!(
            map_gateway_error(20151, None, true),
            SignalingError::AuthenticationFailed(_)
        ));
    }

    #[test]
    fn precise_codes_require_the_precision_flag() {
        assert!(matches!(
            map_gateway_error(31486, None, false),
            SignalingError::Unknown { code: 31486, .. }
        ));
        let precise = map_gateway_error(31486, None, true);
        assert!(matches!(precise, SignalingError::Signaling { code: 31486, .. }));
        assert_eq!(precise.code(), Some(31486));
    }

    #[test]
    fn unrecognized_codes_fall_back_to_unknown() {
        let err = map_gateway_error(31999, Some("strange".into()), true);
        assert!(matches!(err, SignalingError::Unknown { code: 31999, ref message } if message == "strange"));
        assert_eq!(err.code(), Some(31000));
    }
}
