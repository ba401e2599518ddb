// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock,
};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use tokio_util::sync::CancellationToken;

use crate::contracts::Tunnel;
use crate::management::{TunnelLocator, TunnelManagementApi, TunnelRequestOptions};

use super::{connection::ConnectionBase, errors::TunnelError, status::ConnectionStatus};

/// Validity of an access token against the local wall-clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TokenState {
    /// No token is held for the scope.
    None,
    /// The token is present and not past its expiration.
    Valid,
    /// The token's expiration is in the past; it must be refreshed before
    /// use.
    Expired,
}

/// State a tunnel host or client session keeps between connection attempts:
/// the tunnel descriptor, the current access token for the session's scope,
/// and the optional management client used to refresh both.
pub(crate) struct TunnelSessionState {
    pub base: ConnectionBase,
    scope: &'static str,
    management: Option<Arc<dyn TunnelManagementApi>>,
    tunnel: RwLock<Option<Tunnel>>,
    access_token: Mutex<Option<String>>,
    reconnect_in_flight: AtomicBool,
}

impl TunnelSessionState {
    pub fn new(scope: &'static str, management: Option<Arc<dyn TunnelManagementApi>>) -> Self {
        TunnelSessionState {
            base: ConnectionBase::new(),
            scope,
            management,
            tunnel: RwLock::new(None),
            access_token: Mutex::new(None),
            reconnect_in_flight: AtomicBool::new(false),
        }
    }

    pub fn scope(&self) -> &'static str {
        self.scope
    }

    pub fn management(&self) -> Option<Arc<dyn TunnelManagementApi>> {
        self.management.clone()
    }

    pub fn tunnel(&self) -> Option<Tunnel> {
        self.tunnel.read().ok().and_then(|t| t.clone())
    }

    /// Assigns the tunnel this session connects to. A session is permanently
    /// associated with one tunnel; connecting again with a different tunnel
    /// is an error.
    pub fn assign_tunnel(&self, tunnel: Tunnel) -> Result<(), TunnelError> {
        let mut slot = self.tunnel.write().map_err(|_| TunnelError::Disposed)?;
        if let Some(existing) = &*slot {
            let same = existing.tunnel_id == tunnel.tunnel_id
                && existing.cluster_id == tunnel.cluster_id;
            if !same {
                return Err(TunnelError::TunnelConflict);
            }
        }
        self.store_access_token(&tunnel);
        *slot = Some(tunnel);
        Ok(())
    }

    /// Replaces the tunnel with a refreshed descriptor (same identity).
    pub fn replace_tunnel(&self, tunnel: Tunnel) {
        self.store_access_token(&tunnel);
        if let Ok(mut slot) = self.tunnel.write() {
            *slot = Some(tunnel);
        }
    }

    fn store_access_token(&self, tunnel: &Tunnel) {
        if let Some(token) = tunnel.access_token(self.scope) {
            if let Ok(mut slot) = self.access_token.lock() {
                *slot = Some(token.to_string());
            }
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token.lock().ok().and_then(|t| t.clone())
    }

    pub fn set_access_token(&self, token: String) {
        if let Ok(mut slot) = self.access_token.lock() {
            *slot = Some(token);
        }
        if let Ok(mut tunnel) = self.tunnel.write() {
            if let Some(tunnel) = tunnel.as_mut() {
                if let Some(token) = self.access_token() {
                    tunnel.set_access_token(self.scope, token);
                }
            }
        }
    }

    /// Checks the current access token's expiration against the local
    /// wall-clock.
    pub fn access_token_state(&self) -> TokenState {
        match self.access_token() {
            None => TokenState::None,
            Some(token) => match token_expiration(&token) {
                Some(expiration) if expiration <= unix_now() => TokenState::Expired,
                _ => TokenState::Valid,
            },
        }
    }

    /// Obtains a fresh access token for this session's scope, preferring an
    /// attached refresh callback, then the management client. Returns whether
    /// a valid token is now held. Transitions the status through
    /// `RefreshingTunnelAccessToken` while working.
    pub async fn refresh_tunnel_access_token(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<bool, TunnelError> {
        let previous_status = self.base.status();
        if previous_status == ConnectionStatus::Connecting {
            self.base
                .set_status(ConnectionStatus::RefreshingTunnelAccessToken, None)?;
        }
        let result = self.refresh_tunnel_access_token_inner(cancellation).await;
        if previous_status == ConnectionStatus::Connecting {
            self.base.set_status(ConnectionStatus::Connecting, None)?;
        }
        result
    }

    async fn refresh_tunnel_access_token_inner(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<bool, TunnelError> {
        if let Some(callback) = self.base.events.token_refresh_callback() {
            log::debug!("refreshing tunnel access token via callback");
            let token =
                callback(self.scope.to_string(), cancellation.clone()).await?;
            return match token {
                Some(token) => {
                    self.set_access_token(token);
                    Ok(self.access_token_state() == TokenState::Valid)
                }
                None => Ok(false),
            };
        }

        let (management, tunnel) = match (self.management(), self.tunnel()) {
            (Some(m), Some(t)) => (m, t),
            _ => return Ok(false),
        };
        log::debug!(
            "refreshing tunnel access token via the management service (scope {})",
            self.scope
        );

        let locator = TunnelLocator::try_from(&tunnel)
            .map_err(|_| TunnelError::EndpointSelection("tunnel has no name or ID"))?;
        let options = TunnelRequestOptions {
            token_scopes: vec![self.scope.to_string()],
            ..Default::default()
        };
        let refreshed = management
            .get_tunnel(&locator, &options)
            .await
            .map_err(|error| TunnelError::HttpError {
                error,
                reason: "failed to refresh tunnel access token",
            })?;

        match refreshed {
            Some(refreshed) => {
                let token = refreshed.access_token(self.scope).map(|t| t.to_string());
                self.replace_tunnel(refreshed);
                match token {
                    Some(token) => {
                        self.set_access_token(token);
                        Ok(self.access_token_state() == TokenState::Valid)
                    }
                    None => Ok(false),
                }
            }
            None => Ok(false),
        }
    }

    /// Re-fetches the tunnel, preferring an attached refresh callback, then
    /// the management client. Returns whether a refreshed descriptor was
    /// applied. The caller re-derives endpoint state afterwards.
    pub async fn refresh_tunnel(
        &self,
        include_ports: bool,
        cancellation: &CancellationToken,
    ) -> Result<bool, TunnelError> {
        let tunnel = match self.tunnel() {
            Some(tunnel) => tunnel,
            None => return Ok(false),
        };

        if let Some(callback) = self.base.events.tunnel_refresh_callback() {
            log::debug!("refreshing tunnel via callback");
            if let Some(refreshed) =
                callback(tunnel, include_ports, cancellation.clone()).await?
            {
                self.replace_tunnel(refreshed);
                return Ok(true);
            }
            return Ok(false);
        }

        let management = match self.management() {
            Some(management) => management,
            None => return Ok(false),
        };
        log::debug!("refreshing tunnel via the management service");

        let locator = TunnelLocator::try_from(&tunnel)
            .map_err(|_| TunnelError::EndpointSelection("tunnel has no name or ID"))?;
        let options = TunnelRequestOptions {
            include_ports,
            token_scopes: vec![self.scope.to_string()],
            ..Default::default()
        };
        let refreshed = management
            .get_tunnel(&locator, &options)
            .await
            .map_err(|error| TunnelError::HttpError {
                error,
                reason: "failed to refresh tunnel",
            })?;

        match refreshed {
            Some(refreshed) => {
                self.replace_tunnel(refreshed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Claims the single background-reconnect slot. The caller must call
    /// `finish_reconnecting` when the reconnect task completes.
    pub fn try_start_reconnecting(&self) -> bool {
        !self.base.is_disposed()
            && !self.reconnect_in_flight.swap(true, Ordering::SeqCst)
    }

    pub fn finish_reconnecting(&self) {
        self.reconnect_in_flight.store(false, Ordering::SeqCst);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Extracts the expiration claim from a JWT-shaped access token, if the token
/// has one. Tokens that aren't JWTs are treated as unexpiring.
pub(crate) fn token_expiration(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_u64()
}

#[cfg(test)]
mod tests {
    use base64::Engine;

    use crate::contracts::Tunnel;

    use super::{token_expiration, unix_now, TokenState, TunnelSessionState};

    pub(crate) fn make_jwt(exp: u64) -> String {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(format!("{{\"exp\":{}}}", exp).as_bytes());
        format!("{}.{}.", header, payload)
    }

    #[test]
    fn parses_jwt_expiration() {
        assert_eq!(token_expiration(&make_jwt(1234567890)), Some(1234567890));
        assert_eq!(token_expiration("opaque-token"), None);
        assert_eq!(token_expiration("a.b.c"), None);
    }

    #[test]
    fn expired_tokens_are_detected() {
        let state = TunnelSessionState::new("connect", None);
        assert_eq!(state.access_token_state(), TokenState::None);

        state.set_access_token(make_jwt(unix_now() + 3600));
        assert_eq!(state.access_token_state(), TokenState::Valid);

        state.set_access_token(make_jwt(unix_now().saturating_sub(60)));
        assert_eq!(state.access_token_state(), TokenState::Expired);

        // Opaque tokens have no parseable expiry and are assumed valid.
        state.set_access_token("opaque".to_string());
        assert_eq!(state.access_token_state(), TokenState::Valid);
    }

    #[test]
    fn assigning_a_different_tunnel_fails() {
        let state = TunnelSessionState::new("host", None);
        let tunnel = Tunnel {
            tunnel_id: Some("test".to_string()),
            cluster_id: Some("localhost".to_string()),
            ..Default::default()
        };
        state.assign_tunnel(tunnel.clone()).unwrap();
        state.assign_tunnel(tunnel).unwrap();

        let other = Tunnel {
            tunnel_id: Some("other".to_string()),
            cluster_id: Some("localhost".to_string()),
            ..Default::default()
        };
        assert!(state.assign_tunnel(other).is_err());
    }

    #[test]
    fn reconnect_slot_is_exclusive() {
        let state = TunnelSessionState::new("host", None);
        assert!(state.try_start_reconnecting());
        assert!(!state.try_start_reconnecting());
        state.finish_reconnecting();
        assert!(state.try_start_reconnecting());
    }
}
