// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Data contract for tunnel client events reported to the tunnel service.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
#[serde(rename_all(serialize = "camelCase", deserialize = "camelCase"))]
pub struct TunnelEvent {
    // Gets or sets name of the event. This should be a short descriptive identifier.
    pub name: String,

    // Gets or sets the severity of the event: `SEVERITY_INFO`, `SEVERITY_WARNING`, or
    // `SEVERITY_ERROR`. If not specified, the default severity is "info".
    pub severity: Option<String>,

    // Gets or sets optional unstructured details about the event, such as a message or
    // description.
    pub details: Option<String>,

    // Gets or sets semi-structured event properties.
    pub properties: Option<HashMap<String, String>>,
}

impl TunnelEvent {
    pub fn named(name: &str) -> Self {
        TunnelEvent {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

// Default event severity.
pub const SEVERITY_INFO: &str = "info";

// Warning event severity.
pub const SEVERITY_WARNING: &str = "warning";

// Error event severity.
pub const SEVERITY_ERROR: &str = "error";
