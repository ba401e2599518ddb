// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::fmt;

/// Websocket sub-protocol for host connections, version 1.
pub const HOST_WEB_SOCKET_SUB_PROTOCOL: &str = "tunnel-relay-host";

/// Websocket sub-protocol for host connections, version 2.
pub const HOST_V2_WEB_SOCKET_SUB_PROTOCOL: &str = "tunnel-relay-host-v2-dev";

/// Websocket sub-protocol for client connections, version 1.
pub const CLIENT_WEB_SOCKET_SUB_PROTOCOL: &str = "tunnel-relay-client";

/// Websocket sub-protocol for client connections, version 2.
pub const CLIENT_V2_WEB_SOCKET_SUB_PROTOCOL: &str = "tunnel-relay-client-v2-dev";

/// Environment variable that pins the relay connection protocol version to
/// "1" or "2". Any other value selects "prefer v2, allow v1".
pub const PROTOCOL_VERSION_ENV: &str = "DEVTUNNELS_PROTOCOL_VERSION";

/// Which side of a tunnel a connection is on, selecting the relay
/// sub-protocol family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionSide {
    Client,
    Host,
}

/// Version of the relay connection protocol negotiated with the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionProtocol {
    /// One multiplexed secure channel per client, nested inside a channel of
    /// the host's relay session.
    V1,
    /// All clients and ports multiplexed by the relay directly on the outer
    /// session.
    V2,
}

impl ConnectionProtocol {
    /// The sub-protocol token this version uses for the given side.
    pub(crate) fn sub_protocol(self, side: ConnectionSide) -> &'static str {
        match (self, side) {
            (ConnectionProtocol::V1, ConnectionSide::Client) => CLIENT_WEB_SOCKET_SUB_PROTOCOL,
            (ConnectionProtocol::V2, ConnectionSide::Client) => CLIENT_V2_WEB_SOCKET_SUB_PROTOCOL,
            (ConnectionProtocol::V1, ConnectionSide::Host) => HOST_WEB_SOCKET_SUB_PROTOCOL,
            (ConnectionProtocol::V2, ConnectionSide::Host) => HOST_V2_WEB_SOCKET_SUB_PROTOCOL,
        }
    }

    /// Parses the sub-protocol negotiated by the relay.
    pub(crate) fn from_sub_protocol(sub_protocol: &str) -> Option<Self> {
        match sub_protocol {
            CLIENT_WEB_SOCKET_SUB_PROTOCOL | HOST_WEB_SOCKET_SUB_PROTOCOL => {
                Some(ConnectionProtocol::V1)
            }
            CLIENT_V2_WEB_SOCKET_SUB_PROTOCOL | HOST_V2_WEB_SOCKET_SUB_PROTOCOL => {
                Some(ConnectionProtocol::V2)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConnectionProtocol::V1 => write!(f, "v1"),
            ConnectionProtocol::V2 => write!(f, "v2"),
        }
    }
}

/// Sub-protocols to offer the relay, highest preference first, honoring the
/// version pin from the environment.
pub(crate) fn requested_sub_protocols(side: ConnectionSide) -> Vec<&'static str> {
    match std::env::var(PROTOCOL_VERSION_ENV).as_deref() {
        Ok("1") => vec![ConnectionProtocol::V1.sub_protocol(side)],
        Ok("2") => vec![ConnectionProtocol::V2.sub_protocol(side)],
        _ => vec![
            ConnectionProtocol::V2.sub_protocol(side),
            ConnectionProtocol::V1.sub_protocol(side),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiated_sub_protocols_round_trip() {
        for side in [ConnectionSide::Client, ConnectionSide::Host] {
            for version in [ConnectionProtocol::V1, ConnectionProtocol::V2] {
                let token = version.sub_protocol(side);
                assert_eq!(ConnectionProtocol::from_sub_protocol(token), Some(version));
            }
        }
        assert_eq!(ConnectionProtocol::from_sub_protocol("bogus"), None);
    }

    #[test]
    fn environment_pins_protocol_version() {
        std::env::set_var(PROTOCOL_VERSION_ENV, "1");
        assert_eq!(
            requested_sub_protocols(ConnectionSide::Client),
            vec![CLIENT_WEB_SOCKET_SUB_PROTOCOL]
        );

        std::env::set_var(PROTOCOL_VERSION_ENV, "2");
        assert_eq!(
            requested_sub_protocols(ConnectionSide::Host),
            vec![HOST_V2_WEB_SOCKET_SUB_PROTOCOL]
        );

        std::env::set_var(PROTOCOL_VERSION_ENV, "either");
        assert_eq!(
            requested_sub_protocols(ConnectionSide::Client),
            vec![
                CLIENT_V2_WEB_SOCKET_SUB_PROTOCOL,
                CLIENT_WEB_SOCKET_SUB_PROTOCOL
            ]
        );
        std::env::remove_var(PROTOCOL_VERSION_ENV);
    }
}
