// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use super::status::TunnelDisconnectReason;

/// Type of error returned from tunnel connection operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("the operation was cancelled")]
    Cancelled,

    #[error("the connection is disposed")]
    Disposed,

    #[error("a different tunnel is already assigned to this connection")]
    TunnelConflict,

    #[error("the connection is already started")]
    AlreadyConnected,

    #[error("the tunnel is not currently connected")]
    NotConnected,

    #[error("{reason}: {error}")]
    HttpError {
        error: crate::management::HttpError,
        reason: &'static str,
    },

    #[error("the tunnel relay was disconnected: {0}")]
    TunnelRelayDisconnected(#[from] russh::Error),

    #[error("host key error: {0}")]
    HostKeyError(#[from] russh_keys::Error),

    #[error("websocket error: {0}")]
    WebSocketError(tungstenite::Error),

    #[error("error connecting to tunnel relay ({status_code}): {message}")]
    RelayConnectionError { status_code: u16, message: String },

    #[error("the tunnel endpoint relay URI is missing")]
    MissingRelayUri,

    #[error("invalid relay uri: {0}")]
    InvalidRelayUri(String),

    #[error("unable to select a tunnel endpoint: {0}")]
    EndpointSelection(&'static str),

    #[error("tunnel connection protocol error: {0}")]
    ProtocolError(String),

    #[error("tunnel authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    #[error("port {0} is not currently being forwarded")]
    PortNotForwarded(u16),

    #[error("the host was disconnected because another host connected to the tunnel")]
    TooManyConnections,

    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Error-text fragments that indicate a transient network failure worth
/// retrying.
const TRANSIENT_NETWORK_ERRORS: &[&str] = &[
    "ECONNRESET",
    "ENOTFOUND",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "EHOSTUNREACH",
    "EPIPE",
    "EAI_AGAIN",
    "EBUSY",
    "ESOCKETTIMEDOUT",
    "connection reset",
    "connection refused",
    "timed out",
    "host unreachable",
    "broken pipe",
];

impl TunnelError {
    /// Converts a websocket error, extracting the HTTP status code from a
    /// rejected upgrade response when the server produced one.
    pub(crate) fn from_websocket_error(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Http(response) => {
                let status_code = response.status().as_u16();
                let message = response
                    .body()
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_else(|| response.status().to_string());
                TunnelError::RelayConnectionError {
                    status_code,
                    message,
                }
            }
            e => TunnelError::WebSocketError(e),
        }
    }

    /// Gets the HTTP status code carried by the error, if any.
    pub(crate) fn http_status(&self) -> Option<u16> {
        match self {
            TunnelError::RelayConnectionError { status_code, .. } => Some(*status_code),
            TunnelError::HttpError { error, .. } => error.status_code(),
            _ => None,
        }
    }

    /// Whether this error represents cancellation or disposal.
    pub(crate) fn is_cancellation(&self) -> bool {
        matches!(self, TunnelError::Cancelled | TunnelError::Disposed)
    }

    /// Whether this is a secure-channel error.
    pub(crate) fn is_ssh_error(&self) -> bool {
        matches!(self, TunnelError::TunnelRelayDisconnected(_))
    }

    /// Whether a secure-channel error indicates the underlying transport was
    /// lost (recoverable by reconnecting), as opposed to a handshake or
    /// protocol failure.
    pub(crate) fn is_ssh_connection_lost(&self) -> bool {
        match self {
            TunnelError::TunnelRelayDisconnected(e) => matches!(
                e,
                russh::Error::IO(_)
                    | russh::Error::Disconnect
                    | russh::Error::HUP
                    | russh::Error::SendError
            ),
            _ => false,
        }
    }

    /// Whether the error text carries a known transient network-error token.
    pub(crate) fn has_transient_network_error(&self) -> bool {
        let text = self.to_string();
        TRANSIENT_NETWORK_ERRORS
            .iter()
            .any(|token| text.to_lowercase().contains(&token.to_lowercase()))
    }

    /// The disconnect reason this error maps to when it terminates a
    /// connection.
    pub(crate) fn disconnect_reason(&self) -> TunnelDisconnectReason {
        match self {
            TunnelError::Cancelled | TunnelError::Disposed => {
                TunnelDisconnectReason::ByApplication
            }
            TunnelError::ProtocolError(_) => TunnelDisconnectReason::ProtocolError,
            TunnelError::AuthenticationFailed(_) => TunnelDisconnectReason::AuthCancelledByUser,
            TunnelError::RelayConnectionError { status_code, .. } => match status_code {
                401 | 403 => TunnelDisconnectReason::AuthCancelledByUser,
                429 | 502 | 503 => TunnelDisconnectReason::ServiceNotAvailable,
                _ => TunnelDisconnectReason::ConnectionLost,
            },
            _ => TunnelDisconnectReason::ConnectionLost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_network_tokens_are_detected() {
        let err = TunnelError::IoError(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "read failed: ECONNRESET",
        ));
        assert!(err.has_transient_network_error());

        let err = TunnelError::MissingRelayUri;
        assert!(!err.has_transient_network_error());
    }

    #[test]
    fn relay_status_maps_to_disconnect_reason() {
        let unauthorized = TunnelError::RelayConnectionError {
            status_code: 401,
            message: "unauthorized".to_string(),
        };
        assert_eq!(
            unauthorized.disconnect_reason(),
            TunnelDisconnectReason::AuthCancelledByUser
        );

        let throttled = TunnelError::RelayConnectionError {
            status_code: 429,
            message: "too many requests".to_string(),
        };
        assert_eq!(
            throttled.disconnect_reason(),
            TunnelDisconnectReason::ServiceNotAvailable
        );
    }

    #[test]
    fn error_messages_carry_status_codes() {
        let err = TunnelError::RelayConnectionError {
            status_code: 403,
            message: "forbidden".to_string(),
        };
        assert!(err.to_string().contains("(403)"));
        assert_eq!(err.http_status(), Some(403));
    }
}
