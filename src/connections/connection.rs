// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use tokio_util::sync::CancellationToken;

use super::{
    errors::TunnelError,
    events::{ConnectionEvents, ConnectionStatusChangedArgs},
    status::{ConnectionStatus, TunnelDisconnectReason},
};

/// Options for connecting a tunnel host or client.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Whether failed connection attempts are retried with backoff.
    pub enable_retry: bool,

    /// Whether a dropped connection is re-established in the background.
    pub enable_reconnect: bool,

    /// Interval, in seconds, of the relay websocket keep-alive ping. `None`
    /// disables keep-alive.
    pub keep_alive_interval_seconds: Option<u32>,

    /// For clients: selects the host when a tunnel has endpoints from more
    /// than one host.
    pub host_id: Option<String>,

    /// For clients: whether forwarded ports get a local TCP listener in
    /// addition to being available via `connect_to_forwarded_port`.
    pub accept_local_connections: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            enable_retry: true,
            enable_reconnect: true,
            keep_alive_interval_seconds: Some(60),
            host_id: None,
            accept_local_connections: true,
        }
    }
}

struct StatusState {
    status: ConnectionStatus,
    disconnect_reason: Option<TunnelDisconnectReason>,
    disconnect_error: Option<String>,
}

/// Connection state shared by tunnel hosts and clients: the status machine,
/// the disconnect record, the dispose-scoped cancellation token, and the
/// event surface.
pub(crate) struct ConnectionBase {
    state: Mutex<StatusState>,
    disposed: AtomicBool,
    dispose_token: CancellationToken,
    pub events: std::sync::Arc<ConnectionEvents>,
}

impl ConnectionBase {
    pub fn new() -> Self {
        ConnectionBase {
            state: Mutex::new(StatusState {
                status: ConnectionStatus::None,
                disconnect_reason: None,
                disconnect_error: None,
            }),
            disposed: AtomicBool::new(false),
            dispose_token: CancellationToken::new(),
            events: std::sync::Arc::new(ConnectionEvents::default()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state
            .lock()
            .map(|s| s.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn disconnect_reason(&self) -> Option<TunnelDisconnectReason> {
        self.state.lock().ok().and_then(|s| s.disconnect_reason)
    }

    pub fn set_disconnect_reason(&self, reason: TunnelDisconnectReason) {
        if let Ok(mut state) = self.state.lock() {
            state.disconnect_reason = Some(reason);
        }
    }

    pub fn clear_disconnect_reason(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.disconnect_reason = None;
        }
    }

    pub fn disconnect_error(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.disconnect_error.clone())
    }

    pub fn record_disconnect_error(&self, error: &TunnelError) {
        if let Ok(mut state) = self.state.lock() {
            state.disconnect_error = Some(error.to_string());
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Token cancelled when the connection is disposed. Per-operation tokens
    /// are children of this one.
    pub fn dispose_token(&self) -> &CancellationToken {
        &self.dispose_token
    }

    /// A token cancelled by dispose or by the caller's optional token.
    pub fn operation_token(&self, cancellation: Option<CancellationToken>) -> CancellationToken {
        let token = self.dispose_token.child_token();
        if let Some(external) = cancellation {
            let linked = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = external.cancelled() => linked.cancel(),
                    _ = linked.cancelled() => {}
                }
            });
        }
        token
    }

    /// Transitions the connection status, firing `connection_status_changed`
    /// when the status actually changes. Fails when the connection is
    /// disposed, unless transitioning to `Disconnected`.
    pub fn set_status(
        &self,
        status: ConnectionStatus,
        error: Option<&TunnelError>,
    ) -> Result<(), TunnelError> {
        if self.is_disposed() && status != ConnectionStatus::Disconnected {
            return Err(TunnelError::Disposed);
        }

        let previous = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return Err(TunnelError::Disposed),
            };
            if state.status == status {
                return Ok(());
            }
            let previous = state.status;
            state.status = status;
            if let Some(error) = error {
                state.disconnect_error = Some(error.to_string());
            }
            previous
        };

        log::debug!("tunnel connection status: {} -> {}", previous, status);
        self.events
            .connection_status_changed
            .emit(&ConnectionStatusChangedArgs {
                previous_status: previous,
                status,
                disconnect_error: error.map(|e| e.to_string()),
            });
        Ok(())
    }

    /// Disposes the connection: cancels all scoped operations and settles the
    /// status at `Disconnected`. Idempotent; returns whether this call was
    /// the one that disposed.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.dispose_token.cancel();
        if self.disconnect_reason().is_none() {
            self.set_disconnect_reason(TunnelDisconnectReason::ByApplication);
        }
        self.set_status(ConnectionStatus::Disconnected, None).ok();
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::connections::{ConnectionStatus, TunnelError};

    use super::ConnectionBase;

    #[test]
    fn status_changes_fire_events_in_order() {
        let base = ConnectionBase::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = base.events.connection_status_changed.subscribe(move |args| {
            seen_clone
                .lock()
                .unwrap()
                .push((args.previous_status, args.status));
        });

        base.set_status(ConnectionStatus::Connecting, None).unwrap();
        base.set_status(ConnectionStatus::Connecting, None).unwrap();
        base.set_status(ConnectionStatus::Connected, None).unwrap();

        assert_eq!(
            &*seen.lock().unwrap(),
            &[
                (ConnectionStatus::None, ConnectionStatus::Connecting),
                (ConnectionStatus::Connecting, ConnectionStatus::Connected),
            ]
        );
    }

    #[test]
    fn dispose_is_idempotent_and_terminal() {
        let base = ConnectionBase::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        let _sub = base.events.connection_status_changed.subscribe(move |args| {
            if args.status == ConnectionStatus::Disconnected {
                *count_clone.lock().unwrap() += 1;
            }
        });

        assert!(base.dispose());
        assert!(!base.dispose());
        assert_eq!(*count.lock().unwrap(), 1);

        let err = base
            .set_status(ConnectionStatus::Connecting, None)
            .unwrap_err();
        assert!(matches!(err, TunnelError::Disposed));
        assert_eq!(base.status(), ConnectionStatus::Disconnected);
    }
}
