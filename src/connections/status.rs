// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::fmt;

/// Connection status of a tunnel host or client.
///
/// Transitions form a DAG: `None -> Connecting <-> RefreshingTunnelAccessToken
/// -> Connected -> Disconnected`, where `Disconnected` is reachable from every
/// state and is terminal once the connection is disposed. A disconnected (but
/// not disposed) connection may go back to `Connecting` when it reconnects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The connection has not been started yet.
    #[default]
    None,

    /// The connection is in progress.
    Connecting,

    /// The tunnel access token is being refreshed before connecting. Entered
    /// only from `Connecting`.
    RefreshingTunnelAccessToken,

    /// The connection is established.
    Connected,

    /// The connection ended, either by request or by failure.
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConnectionStatus::None => write!(f, "None"),
            ConnectionStatus::Connecting => write!(f, "Connecting"),
            ConnectionStatus::RefreshingTunnelAccessToken => {
                write!(f, "RefreshingTunnelAccessToken")
            }
            ConnectionStatus::Connected => write!(f, "Connected"),
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Reason a tunnel connection disconnected, recorded when transitioning to
/// `ConnectionStatus::Disconnected` or when closing the secure-channel
/// session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelDisconnectReason {
    /// The connection was closed by this application, including dispose and
    /// cancellation.
    ByApplication,

    /// The transport dropped unexpectedly.
    ConnectionLost,

    /// The peer or the relay violated the connection protocol.
    ProtocolError,

    /// Authentication was rejected or could not be completed.
    AuthCancelledByUser,

    /// The relay service refused service (rate limited or unavailable).
    ServiceNotAvailable,

    /// Another host connected to the tunnel and displaced this one.
    TooManyConnections,
}

impl TunnelDisconnectReason {
    /// Maps the reason to the corresponding secure-channel disconnect code.
    pub(crate) fn to_ssh_disconnect(self) -> russh::Disconnect {
        match self {
            TunnelDisconnectReason::ByApplication => russh::Disconnect::ByApplication,
            TunnelDisconnectReason::ConnectionLost => russh::Disconnect::ConnectionLost,
            TunnelDisconnectReason::ProtocolError => russh::Disconnect::ProtocolError,
            TunnelDisconnectReason::AuthCancelledByUser => russh::Disconnect::AuthCancelledByUser,
            TunnelDisconnectReason::ServiceNotAvailable => russh::Disconnect::ServiceNotAvailable,
            TunnelDisconnectReason::TooManyConnections => russh::Disconnect::TooManyConnections,
        }
    }
}

impl fmt::Display for TunnelDisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TunnelDisconnectReason::ByApplication => write!(f, "closed by application"),
            TunnelDisconnectReason::ConnectionLost => write!(f, "connection lost"),
            TunnelDisconnectReason::ProtocolError => write!(f, "protocol error"),
            TunnelDisconnectReason::AuthCancelledByUser => write!(f, "authentication failed"),
            TunnelDisconnectReason::ServiceNotAvailable => write!(f, "service not available"),
            TunnelDisconnectReason::TooManyConnections => {
                write!(f, "another host connected to the tunnel")
            }
        }
    }
}
