// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod channel_stream;
mod client;
mod connection;
mod connector;
mod disconnect;
mod errors;
mod events;
mod host;
mod io;
mod listener;
mod messages;
mod protocol;
mod session;
mod ssh;
mod status;
mod ws;

pub use client::TunnelRelayTunnelClient;
pub use connection::ConnectionOptions;
pub use errors::TunnelError;
pub use events::{
    ConnectionEvents, ConnectionStatusChangedArgs, EventEmitter, EventSubscription,
    ForwardedPortConnectingArgs, PortForwardingArgs, RetryingTunnelConnectionArgs,
    TokenRefreshCallback, TunnelProgress, TunnelRefreshCallback,
};
pub use host::{process_host_id, RemoteForwarder, TunnelRelayTunnelHost};
pub use io::{BoxedTunnelStream, TunnelStream};
pub use protocol::{
    ConnectionProtocol, CLIENT_V2_WEB_SOCKET_SUB_PROTOCOL, CLIENT_WEB_SOCKET_SUB_PROTOCOL,
    HOST_V2_WEB_SOCKET_SUB_PROTOCOL, HOST_WEB_SOCKET_SUB_PROTOCOL, PROTOCOL_VERSION_ENV,
};
pub use status::{ConnectionStatus, TunnelDisconnectReason};
