// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod tunnel;
mod tunnel_access_scopes;
mod tunnel_connection_mode;
mod tunnel_endpoint;
mod tunnel_event;
mod tunnel_port;
mod tunnel_protocol;

pub use tunnel::*;
pub use tunnel_access_scopes::*;
pub use tunnel_connection_mode::*;
pub use tunnel_endpoint::*;
pub use tunnel_event::*;
pub use tunnel_port::*;
pub use tunnel_protocol::*;
