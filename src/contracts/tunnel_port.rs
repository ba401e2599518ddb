// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use serde::{Deserialize, Serialize};

// Data contract for tunnel port objects managed through the tunnel service REST API.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
#[serde(rename_all(serialize = "camelCase", deserialize = "camelCase"))]
pub struct TunnelPort {
    // Gets or sets the ID of the cluster the tunnel was created in.
    pub cluster_id: Option<String>,

    // Gets or sets the generated ID of the tunnel, unique within the cluster.
    pub tunnel_id: Option<String>,

    // Gets or sets the IP port number of the tunnel port.
    pub port_number: u16,

    // Gets or sets the protocol of the tunnel port.
    //
    // Should be one of the string constants from `tunnel_protocol`.
    pub protocol: Option<String>,
}

impl TunnelPort {
    /// Convenience constructor for a port with the given number and protocol.
    pub fn new(port_number: u16, protocol: &str) -> Self {
        TunnelPort {
            port_number,
            protocol: Some(protocol.to_string()),
            ..Default::default()
        }
    }
}
