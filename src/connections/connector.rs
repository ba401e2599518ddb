// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{
    connection::ConnectionBase,
    errors::TunnelError,
    events::RetryingTunnelConnectionArgs,
    io::BoxedTunnelStream,
    protocol::ConnectionProtocol,
    status::{ConnectionStatus, TunnelDisconnectReason},
};

/// First retry waits this long; later retries double the delay.
pub(crate) const INITIAL_RETRY_DELAY_MS: u64 = 1000;

/// Retry delays never exceed this.
pub(crate) const MAX_RECONNECT_DELAY_MS: u64 = 13_000;

/// Rate-limited and unavailable responses give up after this many attempts.
const MAX_SERVICE_UNAVAILABLE_ATTEMPTS: u32 = 3;

/// Errors with no status code at all give up after this many in a row.
const MAX_NO_STATUS_ATTEMPTS: u32 = 5;

/// A connected relay stream together with the negotiated protocol version.
pub(crate) struct RelayStream {
    pub stream: BoxedTunnelStream,
    pub protocol: ConnectionProtocol,
}

/// The connector's view of a host or client session. One connection attempt
/// is `create_session_stream` followed by `configure_session`; the connector
/// owns retry, backoff, token refresh, and error classification around those.
#[async_trait]
pub(crate) trait RelaySession: Send + Sync {
    fn base(&self) -> &ConnectionBase;

    fn enable_retry(&self) -> bool;

    /// The access token scope this session connects with, named in
    /// authorization failures so callers know which token to mint.
    fn tunnel_access_scope(&self) -> &'static str;

    /// Opens the relay websocket and negotiates the connection protocol.
    async fn create_session_stream(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<RelayStream, TunnelError>;

    /// Establishes the secure-channel session over the stream and wires up
    /// channel handling. Takes ownership of the stream; on error the stream
    /// is dropped (closed).
    async fn configure_session(
        &self,
        stream: RelayStream,
        is_reconnect: bool,
        cancellation: &CancellationToken,
    ) -> Result<(), TunnelError>;

    /// Closes the current secure-channel session, if any, recording the
    /// reason. Idempotent.
    async fn close_session(&self, reason: TunnelDisconnectReason, error: Option<&TunnelError>);

    /// Obtains a fresh tunnel access token. Returns false when no refresh
    /// source is available.
    async fn refresh_tunnel_access_token(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<bool, TunnelError>;
}

/// Runs the connection loop for a session: transitions to `Connecting`, makes
/// `(create stream, configure session)` attempts with classified retry, and
/// settles the status at `Connected` or `Disconnected`.
pub(crate) async fn connect_tunnel_session(
    session: &dyn RelaySession,
    is_reconnect: bool,
    cancellation: CancellationToken,
) -> Result<(), TunnelError> {
    let base = session.base();
    base.set_status(ConnectionStatus::Connecting, None)?;

    match connect_loop(session, is_reconnect, &cancellation).await {
        Ok(()) => {
            base.clear_disconnect_reason();
            base.set_status(ConnectionStatus::Connected, None)?;
            Ok(())
        }
        Err(error) => {
            let reason = base
                .disconnect_reason()
                .unwrap_or_else(|| error.disconnect_reason());
            base.set_disconnect_reason(reason);
            base.record_disconnect_error(&error);
            base.set_status(ConnectionStatus::Disconnected, Some(&error))
                .ok();
            Err(error)
        }
    }
}

async fn connect_loop(
    session: &dyn RelaySession,
    mut is_reconnect: bool,
    cancellation: &CancellationToken,
) -> Result<(), TunnelError> {
    let base = session.base();
    let mut attempt: u32 = 0;
    let mut attempt_delay_ms = INITIAL_RETRY_DELAY_MS;
    let mut is_delay_needed = true;
    let mut token_refreshed = false;
    let mut no_status_error_count: u32 = 0;
    let mut last_error: Option<TunnelError> = None;

    loop {
        if cancellation.is_cancelled() || base.is_disposed() {
            base.set_disconnect_reason(TunnelDisconnectReason::ByApplication);
            return Err(if base.is_disposed() {
                TunnelError::Disposed
            } else {
                TunnelError::Cancelled
            });
        }

        if attempt > 0 {
            let error = match last_error.take() {
                Some(error) => error,
                None => return Err(TunnelError::Cancelled),
            };

            let args = RetryingTunnelConnectionArgs::new(&error, attempt_delay_ms);
            base.events.retrying_tunnel_connection.emit(&args);
            if !args.retry() || !session.enable_retry() {
                return Err(error);
            }

            let chosen_delay = args.delay_ms();
            if chosen_delay < INITIAL_RETRY_DELAY_MS {
                is_delay_needed = false;
            } else {
                attempt_delay_ms = chosen_delay;
            }

            if is_delay_needed {
                log::debug!(
                    "waiting {} ms before retrying tunnel connection (attempt {})",
                    attempt_delay_ms,
                    attempt
                );
                tokio::select! {
                    _ = sleep(Duration::from_millis(attempt_delay_ms)) => {}
                    _ = cancellation.cancelled() => {
                        base.set_disconnect_reason(TunnelDisconnectReason::ByApplication);
                        return Err(TunnelError::Cancelled);
                    }
                }
            }

            if attempt_delay_ms < MAX_RECONNECT_DELAY_MS {
                attempt_delay_ms = (attempt_delay_ms * 2).min(MAX_RECONNECT_DELAY_MS);
            }
        }

        attempt += 1;
        is_delay_needed = true;

        let attempt_result = async {
            let stream = session.create_session_stream(cancellation).await?;
            session
                .configure_session(stream, is_reconnect, cancellation)
                .await
        }
        .await;

        let error = match attempt_result {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let mut reason: Option<TunnelDisconnectReason> = None;
        let mut fail = false;
        let mut error = error;

        if error.is_cancellation() {
            reason = Some(TunnelDisconnectReason::ByApplication);
            fail = true;
            no_status_error_count = 0;
        } else if matches!(error, TunnelError::ProtocolError(_)) {
            // A failed resume of a dropped session; retry immediately as a
            // fresh connect.
            reason = Some(TunnelDisconnectReason::ProtocolError);
            is_reconnect = false;
            is_delay_needed = false;
            no_status_error_count = 0;
        } else if error.is_ssh_error() {
            no_status_error_count = 0;
            if !error.is_ssh_connection_lost() {
                reason = Some(TunnelDisconnectReason::ByApplication);
                fail = true;
            }
        } else if let Some(status_code) = error.http_status() {
            no_status_error_count = 0;
            match status_code {
                401 => {
                    reason = Some(TunnelDisconnectReason::AuthCancelledByUser);
                    if token_refreshed {
                        fail = true;
                    } else {
                        match session.refresh_tunnel_access_token(cancellation).await {
                            Ok(true) => {
                                token_refreshed = true;
                                is_delay_needed = false;
                            }
                            Ok(false) => fail = true,
                            Err(refresh_error) => {
                                log::warn!(
                                    "tunnel access token refresh failed: {}",
                                    refresh_error
                                );
                                error = refresh_error;
                                fail = true;
                            }
                        }
                    }
                }
                403 => {
                    reason = Some(TunnelDisconnectReason::AuthCancelledByUser);
                    error = forbidden_error(error, session.tunnel_access_scope());
                    fail = true;
                }
                404 => {
                    fail = true;
                }
                429 | 502 | 503 => {
                    reason = Some(TunnelDisconnectReason::ServiceNotAvailable);
                    if attempt > MAX_SERVICE_UNAVAILABLE_ATTEMPTS {
                        fail = true;
                    } else {
                        attempt_delay_ms = attempt_delay_ms.max(MAX_RECONNECT_DELAY_MS / 2);
                    }
                }
                _ => {
                    if !error.has_transient_network_error() {
                        fail = true;
                    }
                }
            }
        } else if error.has_transient_network_error() {
            no_status_error_count = 0;
        } else {
            // No status available at all; allow a few attempts in case the
            // network recovers, then give up.
            no_status_error_count += 1;
            if no_status_error_count >= MAX_NO_STATUS_ATTEMPTS {
                fail = true;
            }
        }

        if let Some(reason) = reason {
            base.set_disconnect_reason(reason);
            session.close_session(reason, Some(&error)).await;
        }

        if fail {
            return Err(error);
        }

        log::info!("error connecting to tunnel relay, retrying: {}", error);
        last_error = Some(error);
    }
}

fn forbidden_error(error: TunnelError, scope: &str) -> TunnelError {
    let message = match &error {
        TunnelError::RelayConnectionError { message, .. } => message.clone(),
        other => other.to_string(),
    };
    TunnelError::RelayConnectionError {
        status_code: 403,
        message: format!(
            "{}. Provide a fresh tunnel access token with '{}' scope.",
            message.trim_end_matches('.'),
            scope
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex,
        },
    };

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::connections::{
        connection::ConnectionBase, status::ConnectionStatus, ConnectionProtocol,
        TunnelDisconnectReason, TunnelError,
    };

    use super::{
        connect_tunnel_session, RelaySession, RelayStream, INITIAL_RETRY_DELAY_MS,
        MAX_RECONNECT_DELAY_MS,
    };

    struct MockSession {
        base: ConnectionBase,
        enable_retry: bool,
        attempts: Mutex<VecDeque<Result<(), TunnelError>>>,
        attempt_count: AtomicU32,
        refresh_results: Mutex<VecDeque<Result<bool, TunnelError>>>,
        refresh_count: AtomicU32,
        close_reasons: Mutex<Vec<TunnelDisconnectReason>>,
    }

    impl MockSession {
        fn new(attempts: Vec<Result<(), TunnelError>>) -> Arc<Self> {
            Arc::new(MockSession {
                base: ConnectionBase::new(),
                enable_retry: true,
                attempts: Mutex::new(attempts.into()),
                attempt_count: AtomicU32::new(0),
                refresh_results: Mutex::new(VecDeque::new()),
                refresh_count: AtomicU32::new(0),
                close_reasons: Mutex::new(Vec::new()),
            })
        }

        fn relay_error(status_code: u16) -> TunnelError {
            TunnelError::RelayConnectionError {
                status_code,
                message: "test".to_string(),
            }
        }

        fn connection_lost() -> TunnelError {
            TunnelError::TunnelRelayDisconnected(russh::Error::Disconnect)
        }
    }

    #[async_trait]
    impl RelaySession for MockSession {
        fn base(&self) -> &ConnectionBase {
            &self.base
        }

        fn enable_retry(&self) -> bool {
            self.enable_retry
        }

        fn tunnel_access_scope(&self) -> &'static str {
            "connect"
        }

        async fn create_session_stream(
            &self,
            _cancellation: &CancellationToken,
        ) -> Result<RelayStream, TunnelError> {
            self.attempt_count.fetch_add(1, Ordering::SeqCst);
            let next = self
                .attempts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()));
            next.map(|_| {
                let (near, _far) = tokio::io::duplex(64);
                RelayStream {
                    stream: Box::new(near),
                    protocol: ConnectionProtocol::V2,
                }
            })
        }

        async fn configure_session(
            &self,
            _stream: RelayStream,
            _is_reconnect: bool,
            _cancellation: &CancellationToken,
        ) -> Result<(), TunnelError> {
            Ok(())
        }

        async fn close_session(
            &self,
            reason: TunnelDisconnectReason,
            _error: Option<&TunnelError>,
        ) {
            self.close_reasons.lock().unwrap().push(reason);
        }

        async fn refresh_tunnel_access_token(
            &self,
            _cancellation: &CancellationToken,
        ) -> Result<bool, TunnelError> {
            self.refresh_count.fetch_add(1, Ordering::SeqCst);
            self.refresh_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(false))
        }
    }

    /// Subscribes a delay recorder that also zeroes the delay so tests run
    /// without sleeping.
    fn record_delays(session: &MockSession) -> (Arc<Mutex<Vec<u64>>>, crate::connections::EventSubscription) {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let delays_clone = delays.clone();
        let sub = session
            .base
            .events
            .retrying_tunnel_connection
            .subscribe(move |args| {
                delays_clone.lock().unwrap().push(args.delay_ms());
                args.set_delay_ms(0);
            });
        (delays, sub)
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let failures = (0..6)
            .map(|_| Err(MockSession::connection_lost()))
            .chain([Ok(())])
            .collect();
        let session = MockSession::new(failures);
        let (delays, _sub) = record_delays(&session);

        connect_tunnel_session(session.as_ref(), false, CancellationToken::new())
            .await
            .expect("expected connect to eventually succeed");

        assert_eq!(
            &*delays.lock().unwrap(),
            &[1000, 2000, 4000, 8000, 13000, 13000]
        );
        assert_eq!(session.base.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn unauthorized_refreshes_token_at_most_once() {
        let session = MockSession::new(vec![
            Err(MockSession::relay_error(401)),
            Err(MockSession::relay_error(401)),
        ]);
        session
            .refresh_results
            .lock()
            .unwrap()
            .push_back(Ok(true));
        let (_delays, _sub) = record_delays(&session);

        let err = connect_tunnel_session(session.as_ref(), false, CancellationToken::new())
            .await
            .expect_err("expected connect to fail");

        assert_eq!(err.http_status(), Some(401));
        assert_eq!(session.refresh_count.load(Ordering::SeqCst), 1);
        assert_eq!(session.attempt_count.load(Ordering::SeqCst), 2);
        assert_eq!(
            session.base.disconnect_reason(),
            Some(TunnelDisconnectReason::AuthCancelledByUser)
        );
        assert_eq!(session.base.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn unauthorized_without_refresh_source_fails() {
        let session = MockSession::new(vec![Err(MockSession::relay_error(401))]);
        let err = connect_tunnel_session(session.as_ref(), false, CancellationToken::new())
            .await
            .expect_err("expected connect to fail");
        assert_eq!(err.http_status(), Some(401));
        assert_eq!(session.refresh_count.load(Ordering::SeqCst), 1);
        assert_eq!(session.attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forbidden_names_required_scope() {
        let session = MockSession::new(vec![Err(MockSession::relay_error(403))]);
        let err = connect_tunnel_session(session.as_ref(), false, CancellationToken::new())
            .await
            .expect_err("expected connect to fail");
        assert!(err.to_string().contains("'connect' scope"));
        assert!(err.to_string().contains("(403)"));
    }

    #[tokio::test]
    async fn retry_disabled_fails_on_first_retryable_error() {
        let session = Arc::new(MockSession {
            enable_retry: false,
            base: ConnectionBase::new(),
            attempts: Mutex::new(vec![Err(MockSession::connection_lost()), Ok(())].into()),
            attempt_count: AtomicU32::new(0),
            refresh_results: Mutex::new(Default::default()),
            refresh_count: AtomicU32::new(0),
            close_reasons: Mutex::new(Vec::new()),
        });

        let err = connect_tunnel_session(session.as_ref(), false, CancellationToken::new())
            .await
            .expect_err("expected connect to fail");
        assert!(matches!(err, TunnelError::TunnelRelayDisconnected(_)));
        assert_eq!(session.attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn observer_can_veto_retry() {
        let session = MockSession::new(vec![
            Err(MockSession::connection_lost()),
            Ok(()),
        ]);
        let _sub = session
            .base
            .events
            .retrying_tunnel_connection
            .subscribe(|args| args.set_retry(false));

        let err = connect_tunnel_session(session.as_ref(), false, CancellationToken::new())
            .await
            .expect_err("expected connect to fail");
        assert!(matches!(err, TunnelError::TunnelRelayDisconnected(_)));
        assert_eq!(session.attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limited_retry_uses_half_max_delay() {
        let session = MockSession::new(vec![Err(MockSession::relay_error(429)), Ok(())]);
        let (delays, _sub) = record_delays(&session);

        connect_tunnel_session(session.as_ref(), false, CancellationToken::new())
            .await
            .expect("expected connect to succeed");

        assert_eq!(&*delays.lock().unwrap(), &[MAX_RECONNECT_DELAY_MS / 2]);
        assert_eq!(session.base.status(), ConnectionStatus::Connected);
        assert_eq!(
            session.close_reasons.lock().unwrap().as_slice(),
            &[TunnelDisconnectReason::ServiceNotAvailable]
        );
    }

    #[tokio::test]
    async fn service_unavailable_gives_up_after_three_attempts() {
        let failures = (0..5)
            .map(|_| Err(MockSession::relay_error(503)))
            .collect::<Vec<_>>();
        let session = MockSession::new(failures);
        let (_delays, _sub) = record_delays(&session);

        let err = connect_tunnel_session(session.as_ref(), false, CancellationToken::new())
            .await
            .expect_err("expected connect to fail");
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(session.attempt_count.load(Ordering::SeqCst), 4);
        assert_eq!(
            session.base.disconnect_reason(),
            Some(TunnelDisconnectReason::ServiceNotAvailable)
        );
    }

    #[tokio::test]
    async fn cancelled_token_aborts_connect() {
        let session = MockSession::new(vec![Ok(())]);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let err = connect_tunnel_session(session.as_ref(), false, cancellation)
            .await
            .expect_err("expected connect to fail");
        assert!(matches!(err, TunnelError::Cancelled));
        assert_eq!(session.attempt_count.load(Ordering::SeqCst), 0);
        assert_eq!(
            session.base.disconnect_reason(),
            Some(TunnelDisconnectReason::ByApplication)
        );
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let session = MockSession::new(vec![Err(MockSession::relay_error(404)), Ok(())]);
        let err = connect_tunnel_session(session.as_ref(), false, CancellationToken::new())
            .await
            .expect_err("expected connect to fail");
        assert_eq!(err.http_status(), Some(404));
        assert_eq!(session.attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_retry_delay_is_initial_delay() {
        let session = MockSession::new(vec![Err(MockSession::connection_lost()), Ok(())]);
        let (delays, _sub) = record_delays(&session);

        connect_tunnel_session(session.as_ref(), false, CancellationToken::new())
            .await
            .expect("expected connect to succeed");
        assert_eq!(&*delays.lock().unwrap(), &[INITIAL_RETRY_DELAY_MS]);
    }
}
