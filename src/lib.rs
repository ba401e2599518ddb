// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Host and client connections to tunnels through the tunnel relay service.
//!
//! A tunnel associates a set of host endpoints, a set of forwarded ports, and
//! scoped access tokens. The [`connections`] module contains the connection
//! state machines: [`connections::TunnelRelayTunnelHost`] accepts client
//! connections to the ports of the local machine, and
//! [`connections::TunnelRelayTunnelClient`] dials those ports through the
//! relay as if they were local. The [`management`] module defines the
//! boundary to the tunnel management service that both sides use to look up
//! tunnels, register endpoints, and refresh access tokens.

pub mod connections;
pub mod contracts;
pub mod management;
