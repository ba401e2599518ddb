// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use async_trait::async_trait;

use super::{HttpError, HttpResult};

#[derive(Clone)]
pub enum Authorization {
    /// No authorization.
    Anonymous,
    /// Authentication scheme for AAD (or Microsoft account) access tokens.
    AAD(String),
    /// Authentication scheme for GitHub access tokens.
    Github(String),
    /// Authentication scheme for tunnel access tokens.
    Tunnel(String),
    /// Authentication scheme for classic OAuth bearer tokens.
    Bearer(String),
}

impl Authorization {
    pub fn as_header(&self) -> Option<String> {
        match self {
            Authorization::AAD(token) => Some(format!("aad {}", token)),
            Authorization::Github(token) => Some(format!("github {}", token)),
            Authorization::Tunnel(token) => Some(format!("tunnel {}", token)),
            Authorization::Bearer(token) => Some(format!("bearer {}", token)),
            Authorization::Anonymous => None,
        }
    }
}

/// Supplies user-level authorization for management requests. Tunnel access
/// tokens are passed per-request instead, via `TunnelRequestOptions`.
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    async fn get_authorization(&self) -> HttpResult<Authorization>;
}

pub struct StaticAuthorizationProvider(pub Authorization);

#[async_trait]
impl AuthorizationProvider for StaticAuthorizationProvider {
    async fn get_authorization(&self) -> HttpResult<Authorization> {
        Ok(self.0.clone())
    }
}

/// Adapts a callback returning a fresh user token into an
/// `AuthorizationProvider`.
pub struct DelegatedAuthorizationProvider<F>(pub F);

#[async_trait]
impl<F> AuthorizationProvider for DelegatedAuthorizationProvider<F>
where
    F: Fn() -> Result<Authorization, String> + Send + Sync,
{
    async fn get_authorization(&self) -> HttpResult<Authorization> {
        (self.0)().map_err(HttpError::AuthorizationError)
    }
}
