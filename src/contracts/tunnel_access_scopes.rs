// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Defines scopes for tunnel access tokens.

// Allows creating tunnels. This scope is valid only in policies at the global, domain,
// or organization level; it is not relevant to an already-created tunnel or tunnel port.
pub const CREATE: &str = "create";

// Allows management operations on tunnels and tunnel ports.
pub const MANAGE: &str = "manage";

// Allows accepting connections on tunnels as a host.
pub const HOST: &str = "host";

// Allows inspecting tunnel connection activity and data.
pub const INSPECT: &str = "inspect";

// Allows connecting to tunnels as a client.
pub const CONNECT: &str = "connect";
