// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::contracts::Tunnel;

use super::{errors::TunnelError, io::BoxedTunnelStream, status::ConnectionStatus};

type HandlerList<T> = Mutex<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>;

/// Multicast event sink. Handlers fire synchronously in registration order;
/// a handler stays registered until its `EventSubscription` is dropped.
pub struct EventEmitter<T> {
    handlers: Arc<HandlerList<T>>,
    next_id: AtomicU64,
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        EventEmitter {
            handlers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: 'static> EventEmitter<T> {
    /// Registers a handler, returning a subscription that unregisters it on
    /// drop.
    pub fn subscribe(
        &self,
        handler: impl Fn(&T) + Send + Sync + 'static,
    ) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push((id, Arc::new(handler)));
        }

        let weak: Weak<HandlerList<T>> = Arc::downgrade(&self.handlers);
        EventSubscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(handlers) = weak.upgrade() {
                    if let Ok(mut handlers) = handlers.lock() {
                        handlers.retain(|(handler_id, _)| *handler_id != id);
                    }
                }
            })),
        }
    }

    /// Whether any handler is currently registered. Used to decide whether
    /// the connection can defer a decision to an observer.
    pub fn is_subscribed(&self) -> bool {
        self.handlers.lock().map(|h| !h.is_empty()).unwrap_or(false)
    }

    /// Fires the event to all handlers in registration order.
    pub fn emit(&self, args: &T) {
        let handlers: Vec<_> = match self.handlers.lock() {
            Ok(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(args);
        }
    }
}

/// Handle for a registered event handler; dropping it unregisters the
/// handler.
pub struct EventSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Arguments of the connection status changed event.
pub struct ConnectionStatusChangedArgs {
    pub previous_status: ConnectionStatus,
    pub status: ConnectionStatus,
    /// Message of the error that caused disconnection, when transitioning to
    /// `Disconnected` because of a failure.
    pub disconnect_error: Option<String>,
}

/// Arguments of the event raised before a failed connection attempt is
/// retried. Handlers may shorten or lengthen the delay, or veto the retry
/// entirely.
pub struct RetryingTunnelConnectionArgs {
    pub error: String,
    delay_ms: AtomicU64,
    retry: AtomicBool,
}

impl RetryingTunnelConnectionArgs {
    pub(crate) fn new(error: &TunnelError, delay_ms: u64) -> Self {
        RetryingTunnelConnectionArgs {
            error: error.to_string(),
            delay_ms: AtomicU64::new(delay_ms),
            retry: AtomicBool::new(true),
        }
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms.load(Ordering::Relaxed)
    }

    pub fn set_delay_ms(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    pub fn retry(&self) -> bool {
        self.retry.load(Ordering::Relaxed)
    }

    pub fn set_retry(&self, retry: bool) {
        self.retry.store(retry, Ordering::Relaxed);
    }
}

/// Arguments of the event raised before the client accepts forwarding of a
/// port. A handler may cancel forwarding of that specific port.
pub struct PortForwardingArgs {
    pub port: u16,
    cancel: AtomicBool,
}

impl PortForwardingArgs {
    pub(crate) fn new(port: u16) -> Self {
        PortForwardingArgs {
            port,
            cancel: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Arguments of the event raised while a forwarded-port stream is being
/// established. A handler may take the stream and replace it with a wrapped
/// one (for example to add inspection).
pub struct ForwardedPortConnectingArgs {
    pub port: u16,
    stream: Mutex<Option<BoxedTunnelStream>>,
}

impl ForwardedPortConnectingArgs {
    pub(crate) fn new(port: u16, stream: BoxedTunnelStream) -> Self {
        ForwardedPortConnectingArgs {
            port,
            stream: Mutex::new(Some(stream)),
        }
    }

    /// Takes the current stream; the handler must put a replacement back.
    pub fn take_stream(&self) -> Option<BoxedTunnelStream> {
        self.stream.lock().ok().and_then(|mut s| s.take())
    }

    /// Replaces the stream that the connection will hand to the caller.
    pub fn replace_stream(&self, stream: BoxedTunnelStream) {
        if let Ok(mut slot) = self.stream.lock() {
            *slot = Some(stream);
        }
    }

    pub(crate) fn into_stream(self) -> Option<BoxedTunnelStream> {
        self.stream.into_inner().ok().flatten()
    }
}

/// Progress markers reported while the connection performs multi-step
/// operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelProgress {
    StartingRefreshPorts,
    CompletedRefreshPorts,
}

/// Callback producing a fresh tunnel access token for the given scope, or
/// `None` to decline. One producer is expected; assigning a new callback
/// replaces the previous one.
pub type TokenRefreshCallback = Arc<
    dyn Fn(String, CancellationToken) -> BoxFuture<'static, Result<Option<String>, TunnelError>>
        + Send
        + Sync,
>;

/// Callback producing a refreshed tunnel descriptor, or `None` to decline.
pub type TunnelRefreshCallback = Arc<
    dyn Fn(Tunnel, bool, CancellationToken) -> BoxFuture<'static, Result<Option<Tunnel>, TunnelError>>
        + Send
        + Sync,
>;

/// The event surface of a tunnel connection.
#[derive(Default)]
pub struct ConnectionEvents {
    pub connection_status_changed: EventEmitter<ConnectionStatusChangedArgs>,
    pub retrying_tunnel_connection: EventEmitter<RetryingTunnelConnectionArgs>,
    pub port_forwarding: EventEmitter<PortForwardingArgs>,
    pub forwarded_port_connecting: EventEmitter<ForwardedPortConnectingArgs>,
    pub keep_alive_succeeded: EventEmitter<u32>,
    pub keep_alive_failed: EventEmitter<u32>,
    pub progress: EventEmitter<TunnelProgress>,
    pub(crate) refreshing_tunnel_access_token: Mutex<Option<TokenRefreshCallback>>,
    pub(crate) refreshing_tunnel: Mutex<Option<TunnelRefreshCallback>>,
}

impl ConnectionEvents {
    /// Sets (or clears) the producer of refreshed tunnel access tokens.
    pub fn set_refreshing_tunnel_access_token(&self, callback: Option<TokenRefreshCallback>) {
        if let Ok(mut slot) = self.refreshing_tunnel_access_token.lock() {
            *slot = callback;
        }
    }

    /// Sets (or clears) the producer of refreshed tunnel descriptors.
    pub fn set_refreshing_tunnel(&self, callback: Option<TunnelRefreshCallback>) {
        if let Ok(mut slot) = self.refreshing_tunnel.lock() {
            *slot = callback;
        }
    }

    pub(crate) fn token_refresh_callback(&self) -> Option<TokenRefreshCallback> {
        self.refreshing_tunnel_access_token
            .lock()
            .ok()
            .and_then(|cb| cb.clone())
    }

    pub(crate) fn tunnel_refresh_callback(&self) -> Option<TunnelRefreshCallback> {
        self.refreshing_tunnel.lock().ok().and_then(|cb| cb.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::EventEmitter;

    #[test]
    fn handlers_fire_in_registration_order() {
        let emitter: EventEmitter<u32> = EventEmitter::default();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let order1 = order.clone();
        let _sub1 = emitter.subscribe(move |v| order1.lock().unwrap().push(("first", *v)));
        let order2 = order.clone();
        let _sub2 = emitter.subscribe(move |v| order2.lock().unwrap().push(("second", *v)));

        emitter.emit(&7);

        assert_eq!(&*order.lock().unwrap(), &[("first", 7), ("second", 7)]);
    }

    #[test]
    fn dropping_subscription_unregisters_handler() {
        let emitter: EventEmitter<u32> = EventEmitter::default();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        let sub = emitter.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(emitter.is_subscribed());

        emitter.emit(&1);
        drop(sub);
        emitter.emit(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!emitter.is_subscribed());
    }
}
