// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::contracts::TunnelEndpoint;
use crate::contracts::TunnelPort;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Data contract for tunnel objects managed through the tunnel service REST API.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
#[serde(rename_all(serialize = "camelCase", deserialize = "camelCase"))]
pub struct Tunnel {
    // Gets or sets the ID of the cluster the tunnel was created in.
    pub cluster_id: Option<String>,

    // Gets or sets the generated ID of the tunnel, unique within the cluster.
    pub tunnel_id: Option<String>,

    // Gets or sets the optional short name (alias) of the tunnel.
    //
    // The name must be globally unique within the parent domain, and must be a valid
    // subdomain.
    pub name: Option<String>,

    // Gets or sets the optional parent domain of the tunnel, if it is not using the
    // default parent domain.
    pub domain: Option<String>,

    // Gets or sets a dictionary mapping from scopes to tunnel access tokens.
    pub access_tokens: Option<HashMap<String, String>>,

    // Gets or sets an array of endpoints where hosts are currently accepting client
    // connections to the tunnel.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub endpoints: Vec<TunnelEndpoint>,

    // Gets or sets a list of ports in the tunnel.
    //
    // This optional property enables getting info about all ports in a tunnel at the
    // same time as getting tunnel info. It is omitted when listing (multiple) tunnels.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ports: Vec<TunnelPort>,
}

impl Tunnel {
    /// Gets the access token for the given scope, if the tunnel carries one.
    pub fn access_token(&self, scope: &str) -> Option<&str> {
        self.access_tokens
            .as_ref()
            .and_then(|tokens| tokens.get(scope))
            .map(|s| s.as_str())
    }

    /// Replaces the access token for the given scope.
    pub fn set_access_token(&mut self, scope: &str, token: String) {
        self.access_tokens
            .get_or_insert_with(HashMap::new)
            .insert(scope.to_string(), token);
    }
}
