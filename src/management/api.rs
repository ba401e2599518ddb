// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use async_trait::async_trait;

use crate::contracts::{Tunnel, TunnelEndpoint, TunnelEvent};

use super::{HttpResult, TunnelLocator, TunnelRequestOptions};

/// The slice of the tunnel management service that connections depend on.
///
/// The connection layer never talks to the service REST API directly; it goes
/// through this trait so that hosting environments can substitute their own
/// transport (and tests can substitute recorders). `TunnelManagementClient`
/// is the standard HTTP implementation.
#[async_trait]
pub trait TunnelManagementApi: Send + Sync {
    /// Looks up a tunnel by ID or name. Returns `None` when the tunnel does
    /// not exist (or is not visible with the current authorization).
    async fn get_tunnel(
        &self,
        locator: &TunnelLocator,
        options: &TunnelRequestOptions,
    ) -> HttpResult<Option<Tunnel>>;

    /// Creates a new tunnel.
    async fn create_tunnel(
        &self,
        tunnel: Tunnel,
        options: &TunnelRequestOptions,
    ) -> HttpResult<Tunnel>;

    /// Creates or updates a host endpoint on the tunnel.
    async fn update_tunnel_endpoint(
        &self,
        tunnel: &Tunnel,
        endpoint: &TunnelEndpoint,
        options: &TunnelRequestOptions,
    ) -> HttpResult<TunnelEndpoint>;

    /// Deletes the tunnel endpoints registered under the given ID. Returns
    /// false when no matching endpoint existed.
    async fn delete_tunnel_endpoints(
        &self,
        tunnel: &Tunnel,
        endpoint_id: &str,
        options: &TunnelRequestOptions,
    ) -> HttpResult<bool>;

    /// Reports a client event to the service. Best-effort; callers are
    /// expected to ignore failures.
    async fn report_event(&self, tunnel: &Tunnel, event: TunnelEvent) -> HttpResult<()>;
}
