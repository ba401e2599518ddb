// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::contracts::TunnelConnectionMode;
use serde::{Deserialize, Serialize};

// Parameters for connecting to a tunnel via a host endpoint.
//
// A tunnel endpoint specifies how and where hosts and clients can connect to a tunnel.
// A tunnel may have multiple endpoints for one host (or multiple hosts), and clients
// can select their preferred endpoint(s) from those depending on network environment
// or client capabilities.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
#[serde(rename_all(serialize = "camelCase", deserialize = "camelCase"))]
pub struct TunnelEndpoint {
    // Gets or sets the unique ID of this endpoint.
    pub id: Option<String>,

    // Gets or sets the connection mode of the endpoint.
    //
    // This property is required when creating or updating an endpoint.
    pub connection_mode: TunnelConnectionMode,

    // Gets or sets the ID of the host that is listening on this endpoint.
    //
    // This property is required when creating or updating an endpoint. Different hosts
    // may simultaneously accept connections at different endpoints for the same tunnel,
    // if enabled in tunnel options.
    pub host_id: String,

    // Gets or sets an array of public keys, which can be used by clients to authenticate
    // the host.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub host_public_keys: Vec<String>,

    // Gets or sets the relay URI clients use to connect to this endpoint.
    pub client_relay_uri: Option<String>,

    // Gets or sets the relay URI the host uses to accept connections on this endpoint.
    pub host_relay_uri: Option<String>,
}
