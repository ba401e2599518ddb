// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::contracts::{Tunnel, TunnelConnectionMode, TunnelEndpoint};
use crate::management::TunnelManagementApi;

use super::{
    channel_stream::{ChannelStream, DisconnectedStreamsMap, ReconnectableStream},
    connection::{ConnectionBase, ConnectionOptions},
    connector::{self, RelaySession, RelayStream},
    errors::TunnelError,
    events::{ConnectionEvents, ForwardedPortConnectingArgs, PortForwardingArgs},
    io::BoxedTunnelStream,
    listener::create_tcp_listener,
    messages::RelayMessage,
    protocol::{requested_sub_protocols, ConnectionProtocol, ConnectionSide},
    session::{TokenState, TunnelSessionState},
    ssh::{
        self, connect_session_stream, AcceptAllServerKeys, RelaySessionHandler, ServerKeyPolicy,
    },
    status::{ConnectionStatus, TunnelDisconnectReason},
    ws::{connect_relay_websocket, AsyncRWWebSocket, AsyncRWWebSocketOptions},
};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Ping timeout for the relay websocket keep-alive.
const KEEP_ALIVE_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Stand-in ping interval when keep-alive is disabled.
const KEEP_ALIVE_DISABLED_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Client connection to a tunnel through the tunnel relay service.
///
/// After [`connect`](TunnelRelayTunnelClient::connect), ports forwarded by
/// the tunnel's host can be reached either through local TCP listeners or
/// directly via
/// [`connect_to_forwarded_port`](TunnelRelayTunnelClient::connect_to_forwarded_port).
pub struct TunnelRelayTunnelClient {
    inner: Arc<ClientInner>,
}

struct ClientEndpoint {
    host_id: String,
    relay_uri: String,
    host_public_keys: Vec<String>,
}

struct ClientSshSession {
    handle: Arc<russh::client::Handle<RelaySessionHandler>>,
    control: mpsc::UnboundedSender<RelayMessage>,
    tasks: Vec<JoinHandle<()>>,
}

struct ClientInner {
    self_weak: Weak<ClientInner>,
    state: TunnelSessionState,
    options: RwLock<ConnectionOptions>,
    endpoint: RwLock<Option<ClientEndpoint>>,
    protocol: RwLock<Option<ConnectionProtocol>>,
    ssh: tokio::sync::Mutex<Option<ClientSshSession>>,
    ports_tx: watch::Sender<HashSet<u16>>,
    ports_rx: watch::Receiver<HashSet<u16>>,
    cancelled_ports: Mutex<HashSet<u16>>,
    listeners: Mutex<HashMap<u16, JoinHandle<()>>>,
    disconnected_streams: DisconnectedStreamsMap,
    pending_refresh: Mutex<Option<oneshot::Sender<bool>>>,
    host_key_refreshed: AtomicBool,
}

impl TunnelRelayTunnelClient {
    pub fn new(management: Option<Arc<dyn TunnelManagementApi>>) -> Self {
        let (ports_tx, ports_rx) = watch::channel(HashSet::new());
        TunnelRelayTunnelClient {
            inner: Arc::new_cyclic(|self_weak| ClientInner {
                self_weak: self_weak.clone(),
                state: TunnelSessionState::new(crate::contracts::CONNECT, management),
                options: RwLock::new(ConnectionOptions::default()),
                endpoint: RwLock::new(None),
                protocol: RwLock::new(None),
                ssh: tokio::sync::Mutex::new(None),
                ports_tx,
                ports_rx,
                cancelled_ports: Mutex::new(HashSet::new()),
                listeners: Mutex::new(HashMap::new()),
                disconnected_streams: Arc::new(Mutex::new(HashMap::new())),
                pending_refresh: Mutex::new(None),
                host_key_refreshed: AtomicBool::new(false),
            }),
        }
    }

    /// The event surface of this connection.
    pub fn events(&self) -> &ConnectionEvents {
        &self.inner.state.base.events
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.state.base.status()
    }

    pub fn disconnect_reason(&self) -> Option<TunnelDisconnectReason> {
        self.inner.state.base.disconnect_reason()
    }

    /// The relay protocol version negotiated on the current connection.
    pub fn connection_protocol(&self) -> Option<ConnectionProtocol> {
        *self.inner.protocol.read().ok()?
    }

    /// Connects to the tunnel. The tunnel must carry a relay endpoint
    /// published by a host, and an access token with the `connect` scope (or
    /// a token refresh callback must be attached).
    pub async fn connect(
        &self,
        tunnel: Tunnel,
        options: ConnectionOptions,
        cancellation: Option<CancellationToken>,
    ) -> Result<(), TunnelError> {
        let inner = &self.inner;
        if inner.state.base.is_disposed() {
            return Err(TunnelError::Disposed);
        }
        match inner.state.base.status() {
            ConnectionStatus::None | ConnectionStatus::Disconnected => {}
            _ => return Err(TunnelError::AlreadyConnected),
        }

        inner.state.assign_tunnel(tunnel)?;
        if let Ok(mut slot) = inner.options.write() {
            *slot = options;
        }
        inner.select_endpoint()?;

        let token = inner.state.base.operation_token(cancellation);
        connector::connect_tunnel_session(inner.as_ref(), false, token).await
    }

    /// Resolves once the host advertises the given port.
    pub async fn wait_for_forwarded_port(
        &self,
        port: u16,
        cancellation: Option<CancellationToken>,
    ) -> Result<(), TunnelError> {
        let token = self.inner.state.base.operation_token(cancellation);
        let mut ports = self.inner.ports_rx.clone();
        loop {
            if ports.borrow().contains(&port) {
                return Ok(());
            }
            tokio::select! {
                changed = ports.changed() => {
                    changed.map_err(|_| TunnelError::NotConnected)?;
                }
                _ = token.cancelled() => return Err(TunnelError::Cancelled),
            }
        }
    }

    /// Opens a stream to a forwarded port, as if connecting to that port on
    /// the host's loopback interface.
    pub async fn connect_to_forwarded_port(
        &self,
        port: u16,
        cancellation: Option<CancellationToken>,
    ) -> Result<BoxedTunnelStream, TunnelError> {
        let token = self.inner.state.base.operation_token(cancellation);
        self.inner.connect_to_forwarded_port(port, &token).await
    }

    /// Requests that the host re-read the tunnel's ports from the management
    /// service and update its forwards.
    pub async fn refresh_ports(&self) -> Result<(), TunnelError> {
        self.inner.refresh_ports().await
    }

    /// Disconnects and releases all resources. Idempotent; no further events
    /// fire, and subsequent connects fail.
    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

impl ClientInner {
    /// Derives the relay endpoint from the current tunnel: endpoints are
    /// filtered to relay mode and the selected host. When several relay
    /// endpoints exist for the host, the first one in descriptor order is
    /// used.
    fn select_endpoint(&self) -> Result<ClientEndpoint, TunnelError> {
        let tunnel = self
            .state
            .tunnel()
            .ok_or(TunnelError::EndpointSelection("no tunnel is assigned"))?;
        let host_id = self.options.read().ok().and_then(|o| o.host_id.clone());

        let relay_endpoints: Vec<&TunnelEndpoint> = tunnel
            .endpoints
            .iter()
            .filter(|e| e.connection_mode == TunnelConnectionMode::TunnelRelay)
            .filter(|e| match &host_id {
                Some(host_id) => &e.host_id == host_id,
                None => true,
            })
            .collect();

        let distinct_hosts: HashSet<&str> =
            relay_endpoints.iter().map(|e| e.host_id.as_str()).collect();
        if distinct_hosts.len() > 1 {
            return Err(TunnelError::EndpointSelection(
                "the tunnel has multiple hosts; specify a host ID to connect to",
            ));
        }

        let endpoint = relay_endpoints
            .first()
            .ok_or(TunnelError::EndpointSelection(
                "the tunnel has no relay endpoints; the host may not be connected",
            ))?;
        let relay_uri = endpoint
            .client_relay_uri
            .clone()
            .ok_or(TunnelError::MissingRelayUri)?;

        let selected = ClientEndpoint {
            host_id: endpoint.host_id.clone(),
            relay_uri,
            host_public_keys: endpoint.host_public_keys.clone(),
        };
        if let Ok(mut slot) = self.endpoint.write() {
            *slot = Some(ClientEndpoint {
                host_id: selected.host_id.clone(),
                relay_uri: selected.relay_uri.clone(),
                host_public_keys: selected.host_public_keys.clone(),
            });
        }
        Ok(selected)
    }

    fn host_public_keys(&self) -> Vec<String> {
        self.endpoint
            .read()
            .ok()
            .and_then(|e| e.as_ref().map(|e| e.host_public_keys.clone()))
            .unwrap_or_default()
    }

    fn connection_protocol(&self) -> Option<ConnectionProtocol> {
        self.protocol.read().ok().and_then(|p| *p)
    }

    /// Checks a host public key against the tunnel endpoint, refreshing the
    /// tunnel once if the key is unknown (the host may have re-registered
    /// with a new key since this client fetched the tunnel).
    async fn verify_host_key(&self, key_base64: String) -> bool {
        if self.host_public_keys().iter().any(|k| k == &key_base64) {
            return true;
        }

        if !self.host_key_refreshed.swap(true, Ordering::SeqCst) {
            log::info!("host public key not found on the endpoint; refreshing the tunnel");
            let token = self.state.base.dispose_token().child_token();
            match self.state.refresh_tunnel(false, &token).await {
                Ok(true) => {
                    if self.select_endpoint().is_err() {
                        return false;
                    }
                    return self.host_public_keys().iter().any(|k| k == &key_base64);
                }
                Ok(false) => {}
                Err(e) => log::warn!("tunnel refresh for host key verification failed: {}", e),
            }
        }

        false
    }

    async fn connect_to_forwarded_port(
        &self,
        port: u16,
        cancellation: &CancellationToken,
    ) -> Result<BoxedTunnelStream, TunnelError> {
        if self
            .cancelled_ports
            .lock()
            .map(|p| p.contains(&port))
            .unwrap_or(false)
        {
            return Err(TunnelError::PortNotForwarded(port));
        }
        if cancellation.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }

        let stream = self.open_port_stream(port, true).await?;

        let args = ForwardedPortConnectingArgs::new(port, stream);
        self.state.base.events.forwarded_port_connecting.emit(&args);
        args.into_stream().ok_or_else(|| {
            TunnelError::ProtocolError(
                "a forwarded-port-connecting handler took the stream without replacing it"
                    .to_string(),
            )
        })
    }

    /// Opens a channel to the port and completes the connect handshake.
    /// In v2, end-to-end encryption is requested; when the host enables it,
    /// the returned stream runs a nested secure channel that survives
    /// channel loss via the disconnected-streams queue.
    async fn open_port_stream(
        &self,
        port: u16,
        wrap_reconnectable: bool,
    ) -> Result<BoxedTunnelStream, TunnelError> {
        let protocol = self
            .connection_protocol()
            .ok_or(TunnelError::NotConnected)?;
        let handle = {
            let ssh = self.ssh.lock().await;
            ssh.as_ref()
                .map(|s| s.handle.clone())
                .ok_or(TunnelError::NotConnected)?
        };

        let mut channel = handle
            .channel_open_direct_tcpip("127.0.0.1", u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(TunnelError::TunnelRelayDisconnected)?;

        if protocol == ConnectionProtocol::V1 {
            return Ok(Box::new(ChannelStream::new(channel)));
        }

        let request = RelayMessage::PortRelayConnectRequest {
            port: u32::from(port),
            access_token: self.state.access_token().unwrap_or_default(),
            is_e2e_encryption_requested: true,
        };
        channel
            .data(&request.encode()[..])
            .await
            .map_err(TunnelError::TunnelRelayDisconnected)?;

        let response = loop {
            match channel.wait().await {
                Some(russh::ChannelMsg::Data { data }) => break RelayMessage::decode(&data)?,
                Some(russh::ChannelMsg::Eof) | Some(russh::ChannelMsg::Close) | None => {
                    return Err(TunnelError::ProtocolError(
                        "the port channel closed before the connect response".to_string(),
                    ))
                }
                Some(_) => {}
            }
        };

        let e2e_enabled = match response {
            RelayMessage::PortRelayConnectResponse {
                is_e2e_encryption_enabled,
            } => is_e2e_encryption_enabled,
            other => {
                return Err(TunnelError::ProtocolError(format!(
                    "unexpected message in place of the connect response: {:?}",
                    other
                )))
            }
        };

        if !e2e_enabled {
            return Ok(Box::new(ChannelStream::new(channel)));
        }

        let nested = self.open_nested_secure_stream(channel).await?;
        if wrap_reconnectable {
            Ok(Box::new(ReconnectableStream::new(
                port,
                nested,
                self.disconnected_streams.clone(),
            )))
        } else {
            Ok(nested)
        }
    }

    /// Runs a nested secure channel over an established port channel. The
    /// nested server is the host itself, so its key is verified against the
    /// endpoint's host public keys.
    async fn open_nested_secure_stream(
        &self,
        channel: russh::Channel<russh::client::Msg>,
    ) -> Result<BoxedTunnelStream, TunnelError> {
        let transport = ChannelStream::new(channel);
        let policy: Arc<dyn ServerKeyPolicy> = Arc::new(ClientServerKeyPolicy {
            inner: self.self_weak.clone(),
        });

        let (mut nested, _ops) = connect_session_stream(
            ssh::encrypted_client_config(),
            transport,
            policy,
            &[],
        )
        .await
        .map_err(TunnelError::TunnelRelayDisconnected)?;

        if !nested
            .authenticate_none("tunnel")
            .await
            .map_err(TunnelError::TunnelRelayDisconnected)?
        {
            return Err(TunnelError::AuthenticationFailed(
                "the host rejected session authentication",
            ));
        }

        let data_channel = nested
            .channel_open_session()
            .await
            .map_err(TunnelError::TunnelRelayDisconnected)?;

        Ok(Box::new(NestedSecureStream {
            inner: ChannelStream::new(data_channel),
            _session: nested,
        }))
    }

    async fn refresh_ports(&self) -> Result<(), TunnelError> {
        if self.state.base.status() != ConnectionStatus::Connected {
            return Err(TunnelError::NotConnected);
        }
        let control = {
            let ssh = self.ssh.lock().await;
            ssh.as_ref()
                .map(|s| s.control.clone())
                .ok_or(TunnelError::NotConnected)?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending_refresh.lock() {
            *pending = Some(reply_tx);
        }
        control
            .send(RelayMessage::RefreshPortsRequest { want_reply: true })
            .map_err(|_| TunnelError::NotConnected)?;

        match reply_rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TunnelError::ProtocolError(
                "the host failed to refresh ports".to_string(),
            )),
            Err(_) => Err(TunnelError::NotConnected),
        }
    }

    /// Handles a port advertisement from the host. Observers may cancel
    /// forwarding of the port; otherwise parked encrypted streams reconnect
    /// and (optionally) a local listener starts.
    async fn on_port_added(&self, port: u16) {
        let args = PortForwardingArgs::new(port);
        self.state.base.events.port_forwarding.emit(&args);
        if args.is_cancelled() {
            log::info!("forwarding of port {} was cancelled by an observer", port);
            if let Ok(mut cancelled) = self.cancelled_ports.lock() {
                cancelled.insert(port);
            }
            return;
        }
        if let Ok(mut cancelled) = self.cancelled_ports.lock() {
            cancelled.remove(&port);
        }

        log::debug!("remote port {} is now being forwarded", port);
        self.ports_tx.send_modify(|ports| {
            ports.insert(port);
        });

        self.reconnect_disconnected_streams(port).await;

        let accept_local = self
            .options
            .read()
            .map(|o| o.accept_local_connections)
            .unwrap_or(true);
        if accept_local {
            self.start_port_listener(port);
        }
    }

    async fn on_port_removed(&self, port: u16) {
        log::debug!("remote port {} is no longer forwarded", port);
        self.ports_tx.send_modify(|ports| {
            ports.remove(&port);
        });
        if let Some(listener) = self.listeners.lock().ok().and_then(|mut l| l.remove(&port)) {
            listener.abort();
        }
        // The host stopped advertising the port, so parked encrypted streams
        // will never reconnect.
        let parked = self
            .disconnected_streams
            .lock()
            .ok()
            .and_then(|mut map| map.remove(&port))
            .unwrap_or_default();
        for stream in parked {
            stream.close();
        }
    }

    /// Re-establishes any encrypted streams for the port that lost their
    /// channel, splicing fresh nested sessions into the parked wrappers. If
    /// reconnection fails, the remaining parked streams are closed.
    async fn reconnect_disconnected_streams(&self, port: u16) {
        let parked = self
            .disconnected_streams
            .lock()
            .ok()
            .and_then(|mut map| map.remove(&port))
            .unwrap_or_default();
        if parked.is_empty() {
            return;
        }

        log::debug!(
            "reconnecting {} encrypted stream(s) for port {}",
            parked.len(),
            port
        );
        let mut failed = false;
        let mut parked = parked.into_iter();
        for stream in parked.by_ref() {
            if failed {
                stream.close();
                continue;
            }
            match self.open_port_stream(port, false).await {
                Ok(fresh) => stream.reconnect(fresh),
                Err(e) => {
                    log::warn!("failed to reconnect encrypted stream for port {}: {}", port, e);
                    stream.close();
                    failed = true;
                }
            }
        }
    }

    fn start_port_listener(&self, port: u16) {
        let mut listeners = match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(_) => return,
        };
        if listeners.contains_key(&port) {
            return;
        }

        let inner = self.self_weak.clone();
        let task = tokio::spawn(async move {
            let bound = match create_tcp_listener(LOOPBACK, port, true).await {
                Ok(bound) => bound,
                Err(e) => {
                    log::warn!("could not listen for forwarded port {}: {}", port, e);
                    return;
                }
            };
            if bound.port != port {
                log::info!(
                    "forwarded port {} is locally available on port {}",
                    port,
                    bound.port
                );
            }

            let mut accepts = Vec::new();
            for listener in bound.listeners {
                let inner = inner.clone();
                accepts.push(tokio::spawn(async move {
                    loop {
                        let (conn, peer) = match listener.accept().await {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                log::debug!("forwarded port accept failed: {}", e);
                                break;
                            }
                        };
                        let Some(inner) = inner.upgrade() else { break };
                        log::debug!("accepted connection from {} for port {}", peer, port);
                        tokio::spawn(async move {
                            let token = inner.state.base.dispose_token().child_token();
                            match inner.connect_to_forwarded_port(port, &token).await {
                                Ok(mut stream) => {
                                    let mut conn = conn;
                                    tokio::io::copy_bidirectional(&mut conn, &mut stream)
                                        .await
                                        .ok();
                                }
                                Err(e) => {
                                    log::debug!(
                                        "could not connect local connection to port {}: {}",
                                        port,
                                        e
                                    );
                                }
                            }
                        });
                    }
                }));
            }
            for accept in accepts {
                accept.await.ok();
            }
        });
        listeners.insert(port, task);
    }

    /// Runs the control channel: outgoing relay messages flow from the
    /// session to the channel, incoming frames update port state and settle
    /// refresh replies. Ends when the channel (and with it, the session)
    /// closes.
    async fn run_control_channel(
        self: Arc<Self>,
        mut channel: russh::Channel<russh::client::Msg>,
        mut outgoing: mpsc::UnboundedReceiver<RelayMessage>,
    ) {
        enum Op {
            Incoming(Option<russh::ChannelMsg>),
            Outgoing(Option<RelayMessage>),
        }

        loop {
            let op = tokio::select! {
                msg = channel.wait() => Op::Incoming(msg),
                message = outgoing.recv() => Op::Outgoing(message),
            };
            match op {
                Op::Incoming(Some(russh::ChannelMsg::Data { data })) => {
                    match RelayMessage::decode(&data) {
                        Ok(message) => self.handle_control_message(message).await,
                        Err(e) => log::warn!("invalid control message from host: {}", e),
                    }
                }
                Op::Incoming(Some(russh::ChannelMsg::Eof))
                | Op::Incoming(Some(russh::ChannelMsg::Close))
                | Op::Incoming(None) => break,
                Op::Incoming(Some(_)) => {}
                Op::Outgoing(Some(message)) => {
                    if channel.data(&message.encode()[..]).await.is_err() {
                        break;
                    }
                }
                Op::Outgoing(None) => break,
            }
        }

        log::debug!("tunnel client control channel ended");
        self.on_session_closed().await;
    }

    async fn handle_control_message(&self, message: RelayMessage) {
        match message {
            RelayMessage::PortRelayRequest { port, .. } => {
                self.on_port_added(port as u16).await;
            }
            RelayMessage::CancelPortRelayRequest { port, .. } => {
                self.on_port_removed(port as u16).await;
            }
            RelayMessage::RefreshPortsResponse { succeeded } => {
                if let Some(reply) = self.pending_refresh.lock().ok().and_then(|mut p| p.take())
                {
                    reply.send(succeeded).ok();
                }
            }
            other => {
                log::debug!("ignoring unexpected control message: {:?}", other);
            }
        }
    }

    /// Starts one background reconnect after the session drops, unless the
    /// connection is disposed or reconnection is disabled.
    async fn on_session_closed(&self) {
        {
            let mut ssh = self.ssh.lock().await;
            if ssh.take().is_none() {
                return;
            }
        }
        if self.state.base.is_disposed() {
            return;
        }

        if self.state.base.disconnect_reason().is_none() {
            self.state
                .base
                .set_disconnect_reason(TunnelDisconnectReason::ConnectionLost);
        }

        let enable_reconnect = self
            .options
            .read()
            .map(|o| o.enable_reconnect)
            .unwrap_or(false);
        if !enable_reconnect || !self.state.try_start_reconnecting() {
            self.state
                .base
                .set_status(ConnectionStatus::Disconnected, None)
                .ok();
            return;
        }

        log::info!("tunnel client connection lost; reconnecting");
        let Some(inner) = self.self_weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let token = inner.state.base.dispose_token().child_token();
            let result =
                connector::connect_tunnel_session(inner.as_ref(), true, token).await;
            inner.state.finish_reconnecting();
            if let Err(e) = result {
                log::warn!("tunnel client reconnect failed: {}", e);
            }
        });
    }

    async fn dispose(&self) {
        if !self.state.base.dispose() {
            return;
        }

        self.close_session(
            self.state
                .base
                .disconnect_reason()
                .unwrap_or(TunnelDisconnectReason::ByApplication),
            None,
        )
        .await;

        if let Ok(mut listeners) = self.listeners.lock() {
            for (_, listener) in listeners.drain() {
                listener.abort();
            }
        }
        let parked: Vec<_> = self
            .disconnected_streams
            .lock()
            .map(|mut map| map.drain().flat_map(|(_, streams)| streams).collect())
            .unwrap_or_default();
        for stream in parked {
            stream.close();
        }
    }
}

/// Host key check for the client's encrypted sessions.
struct ClientServerKeyPolicy {
    inner: Weak<ClientInner>,
}

#[async_trait]
impl ServerKeyPolicy for ClientServerKeyPolicy {
    async fn check_server_key(&self, key_base64: String) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.verify_host_key(key_base64).await,
            None => false,
        }
    }
}

/// Stream over a channel of a nested secure session; keeps the nested
/// session alive for the stream's lifetime.
struct NestedSecureStream {
    inner: ChannelStream,
    _session: russh::client::Handle<RelaySessionHandler>,
}

impl AsyncRead for NestedSecureStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for NestedSecureStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl RelaySession for ClientInner {
    fn base(&self) -> &ConnectionBase {
        &self.state.base
    }

    fn enable_retry(&self) -> bool {
        self.options.read().map(|o| o.enable_retry).unwrap_or(true)
    }

    fn tunnel_access_scope(&self) -> &'static str {
        self.state.scope()
    }

    async fn create_session_stream(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<RelayStream, TunnelError> {
        self.host_key_refreshed.store(false, Ordering::SeqCst);

        if self.state.access_token_state() == TokenState::Expired {
            log::info!("tunnel access token is expired; refreshing before connecting");
            self.state.refresh_tunnel_access_token(cancellation).await?;
        }

        let endpoint = self.select_endpoint()?;
        let sub_protocols = requested_sub_protocols(ConnectionSide::Client);
        let access_token = self.state.access_token();

        let (websocket, negotiated) = connect_relay_websocket(
            &endpoint.relay_uri,
            &sub_protocols,
            access_token.as_deref(),
        )
        .await?;

        let protocol = negotiated
            .as_deref()
            .and_then(ConnectionProtocol::from_sub_protocol)
            .or_else(|| {
                sub_protocols
                    .first()
                    .and_then(|p| ConnectionProtocol::from_sub_protocol(p))
            })
            .ok_or_else(|| {
                TunnelError::ProtocolError("no relay sub-protocol was negotiated".to_string())
            })?;
        if let Ok(mut slot) = self.protocol.write() {
            *slot = Some(protocol);
        }

        let keep_alive = self
            .options
            .read()
            .ok()
            .and_then(|o| o.keep_alive_interval_seconds);
        let stream = AsyncRWWebSocket::new(AsyncRWWebSocketOptions {
            websocket,
            ping_interval: keep_alive
                .map(|s| Duration::from_secs(u64::from(s)))
                .unwrap_or(KEEP_ALIVE_DISABLED_INTERVAL),
            ping_timeout: KEEP_ALIVE_PING_TIMEOUT,
            keep_alive_events: Some(self.state.base.events.clone()),
        });

        Ok(RelayStream {
            stream: Box::new(stream),
            protocol,
        })
    }

    async fn configure_session(
        &self,
        stream: RelayStream,
        _is_reconnect: bool,
        _cancellation: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let this = self.weak_self().ok_or(TunnelError::Disposed)?;

        let protocol = stream.protocol;
        let policy: Arc<dyn ServerKeyPolicy> = match protocol {
            // The v1 peer is the host itself: verify its key against the
            // tunnel endpoint.
            ConnectionProtocol::V1 => Arc::new(ClientServerKeyPolicy {
                inner: self.self_weak.clone(),
            }),
            // The v2 peer is the relay, already authenticated by TLS.
            ConnectionProtocol::V2 => Arc::new(AcceptAllServerKeys),
        };
        let config = match protocol {
            ConnectionProtocol::V1 => ssh::encrypted_client_config(),
            ConnectionProtocol::V2 => ssh::anonymous_relay_config(1),
        };

        let (mut handle, ops) =
            connect_session_stream(config, stream.stream, policy, &[])
                .await
                .map_err(TunnelError::TunnelRelayDisconnected)?;

        if protocol == ConnectionProtocol::V1 {
            let authenticated = handle
                .authenticate_none("tunnel")
                .await
                .map_err(TunnelError::TunnelRelayDisconnected)?;
            if !authenticated {
                return Err(TunnelError::AuthenticationFailed(
                    "the host rejected session authentication",
                ));
            }
        }

        let control_channel = handle
            .channel_open_session()
            .await
            .map_err(TunnelError::TunnelRelayDisconnected)?;
        let handle = Arc::new(handle);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            this.clone().run_control_channel(control_channel, control_rx),
        ));
        // Drain stray channel events so the handler queue never backs up.
        tasks.push(tokio::spawn(async move {
            let mut ops = ops;
            while ops.recv().await.is_some() {}
        }));

        let mut ssh = self.ssh.lock().await;
        *ssh = Some(ClientSshSession {
            handle,
            control: control_tx,
            tasks,
        });
        Ok(())
    }

    async fn close_session(&self, reason: TunnelDisconnectReason, error: Option<&TunnelError>) {
        if let Some(error) = error {
            self.state.base.record_disconnect_error(error);
        }
        if self.state.base.disconnect_reason().is_none() {
            self.state.base.set_disconnect_reason(reason);
        }

        let session = {
            let mut ssh = self.ssh.lock().await;
            ssh.take()
        };
        if let Some(session) = session {
            log::debug!("closing tunnel client session ({})", reason);
            session
                .handle
                .disconnect(reason.to_ssh_disconnect(), "closing session", "en")
                .await
                .ok();
            for task in session.tasks {
                task.abort();
            }
        }
    }

    async fn refresh_tunnel_access_token(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<bool, TunnelError> {
        self.state.refresh_tunnel_access_token(cancellation).await
    }
}

impl ClientInner {
    fn weak_self(&self) -> Option<Arc<ClientInner>> {
        self.self_weak.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use futures::FutureExt;

    use crate::contracts::{Tunnel, TunnelConnectionMode, TunnelEndpoint};
    use crate::connections::{ConnectionOptions, ConnectionStatus, TunnelError};

    use super::TunnelRelayTunnelClient;

    fn relay_endpoint(host_id: &str, uri: &str, keys: &[&str]) -> TunnelEndpoint {
        TunnelEndpoint {
            id: Some(format!("{}-endpoint", host_id)),
            connection_mode: TunnelConnectionMode::TunnelRelay,
            host_id: host_id.to_string(),
            host_public_keys: keys.iter().map(|k| k.to_string()).collect(),
            client_relay_uri: Some(uri.to_string()),
            host_relay_uri: None,
        }
    }

    fn test_tunnel(endpoints: Vec<TunnelEndpoint>) -> Tunnel {
        let mut tunnel = Tunnel {
            tunnel_id: Some("test".to_string()),
            cluster_id: Some("localhost".to_string()),
            endpoints,
            ..Default::default()
        };
        tunnel.set_access_token(crate::contracts::CONNECT, "connect-token".to_string());
        tunnel
    }

    #[tokio::test]
    async fn endpoint_selection_requires_a_single_host() {
        let client = TunnelRelayTunnelClient::new(None);
        client
            .inner
            .state
            .assign_tunnel(test_tunnel(vec![
                relay_endpoint("host1", "wss://relay.test/a", &[]),
                relay_endpoint("host2", "wss://relay.test/b", &[]),
            ]))
            .unwrap();

        let err = client.inner.select_endpoint().expect_err("expected error");
        assert!(matches!(err, TunnelError::EndpointSelection(_)));
    }

    #[tokio::test]
    async fn endpoint_selection_honors_host_id_option() {
        let client = TunnelRelayTunnelClient::new(None);
        client
            .inner
            .state
            .assign_tunnel(test_tunnel(vec![
                relay_endpoint("host1", "wss://relay.test/a", &[]),
                relay_endpoint("host2", "wss://relay.test/b", &[]),
            ]))
            .unwrap();
        client.inner.options.write().unwrap().host_id = Some("host2".to_string());

        let endpoint = client.inner.select_endpoint().unwrap();
        assert_eq!(endpoint.host_id, "host2");
        assert_eq!(endpoint.relay_uri, "wss://relay.test/b");
    }

    #[tokio::test]
    async fn endpoint_selection_takes_the_first_of_one_host() {
        let client = TunnelRelayTunnelClient::new(None);
        client
            .inner
            .state
            .assign_tunnel(test_tunnel(vec![
                relay_endpoint("host1", "wss://relay.test/first", &[]),
                relay_endpoint("host1", "wss://relay.test/second", &[]),
            ]))
            .unwrap();

        let endpoint = client.inner.select_endpoint().unwrap();
        assert_eq!(endpoint.relay_uri, "wss://relay.test/first");
    }

    #[tokio::test]
    async fn stale_host_key_is_resolved_by_one_tunnel_refresh() {
        let client = TunnelRelayTunnelClient::new(None);
        client
            .inner
            .state
            .assign_tunnel(test_tunnel(vec![relay_endpoint(
                "host1",
                "wss://relay.test/client",
                &["staleToken"],
            )]))
            .unwrap();
        client.inner.select_endpoint().unwrap();

        let refresh_count = Arc::new(AtomicU32::new(0));
        let refresh_count_clone = refresh_count.clone();
        client.events().set_refreshing_tunnel(Some(Arc::new(
            move |_tunnel, include_ports, _cancellation| {
                assert!(!include_ports);
                refresh_count_clone.fetch_add(1, Ordering::SeqCst);
                let refreshed = test_tunnel(vec![relay_endpoint(
                    "host1",
                    "wss://relay.test/client",
                    &["freshKey"],
                )]);
                async move { Ok(Some(refreshed)) }.boxed()
            },
        )));

        assert!(client.inner.verify_host_key("freshKey".to_string()).await);
        assert_eq!(refresh_count.load(Ordering::SeqCst), 1);

        // The refresh happens at most once per connection attempt.
        assert!(!client.inner.verify_host_key("otherKey".to_string()).await);
        assert_eq!(refresh_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn known_host_key_is_accepted_without_refresh() {
        let client = TunnelRelayTunnelClient::new(None);
        client
            .inner
            .state
            .assign_tunnel(test_tunnel(vec![relay_endpoint(
                "host1",
                "wss://relay.test/client",
                &["knownKey"],
            )]))
            .unwrap();
        client.inner.select_endpoint().unwrap();

        assert!(client.inner.verify_host_key("knownKey".to_string()).await);
    }

    #[tokio::test]
    async fn cancelled_port_forwarding_blocks_the_port() {
        let client = TunnelRelayTunnelClient::new(None);
        client.inner.options.write().unwrap().accept_local_connections = false;

        let _sub = client.events().port_forwarding.subscribe(|args| {
            if args.port == 2000 {
                args.cancel();
            }
        });

        client.inner.on_port_added(2000).await;
        client.inner.on_port_added(3000).await;

        assert!(!client.inner.ports_rx.borrow().contains(&2000));
        assert!(client.inner.ports_rx.borrow().contains(&3000));

        let err = client
            .connect_to_forwarded_port(2000, None)
            .await
            .expect_err("expected refusal");
        assert!(matches!(err, TunnelError::PortNotForwarded(2000)));

        // The accepted port resolves immediately for waiters.
        client.wait_for_forwarded_port(3000, None).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_forwarded_port_resolves_on_advertisement() {
        let client = TunnelRelayTunnelClient::new(None);
        client.inner.options.write().unwrap().accept_local_connections = false;

        let waiter = {
            let inner = client.inner.clone();
            tokio::spawn(async move {
                let mut ports = inner.ports_rx.clone();
                loop {
                    if ports.borrow().contains(&5000) {
                        return true;
                    }
                    if ports.changed().await.is_err() {
                        return false;
                    }
                }
            })
        };

        client.inner.on_port_added(5000).await;
        assert!(waiter.await.unwrap());
        client.wait_for_forwarded_port(5000, None).await.unwrap();
    }

    #[tokio::test]
    async fn removed_ports_stop_resolving() {
        let client = TunnelRelayTunnelClient::new(None);
        client.inner.options.write().unwrap().accept_local_connections = false;

        client.inner.on_port_added(4000).await;
        client.wait_for_forwarded_port(4000, None).await.unwrap();

        client.inner.on_port_removed(4000).await;
        assert!(!client.inner.ports_rx.borrow().contains(&4000));
    }

    #[tokio::test]
    async fn connect_rejects_when_already_connected() {
        let client = TunnelRelayTunnelClient::new(None);
        client
            .inner
            .state
            .base
            .set_status(ConnectionStatus::Connected, None)
            .unwrap();

        let err = client
            .connect(
                test_tunnel(vec![relay_endpoint("host1", "wss://relay.test/client", &[])]),
                ConnectionOptions::default(),
                None,
            )
            .await
            .expect_err("expected connect to fail");
        assert!(matches!(err, TunnelError::AlreadyConnected));
    }

    #[tokio::test]
    async fn operations_require_a_connection() {
        let client = TunnelRelayTunnelClient::new(None);
        let err = client.refresh_ports().await.expect_err("expected error");
        assert!(matches!(err, TunnelError::NotConnected));

        let err = client
            .connect_to_forwarded_port(8080, None)
            .await
            .expect_err("expected error");
        assert!(matches!(err, TunnelError::NotConnected));
    }

    #[tokio::test]
    async fn dispose_prevents_future_connects() {
        let client = TunnelRelayTunnelClient::new(None);
        client.dispose().await;
        client.dispose().await;

        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        let err = client
            .connect(
                test_tunnel(vec![relay_endpoint("host1", "wss://relay.test/client", &[])]),
                ConnectionOptions::default(),
                None,
            )
            .await
            .expect_err("expected connect to fail");
        assert!(matches!(err, TunnelError::Disposed));
    }

    #[test]
    fn port_forwarding_event_mutation_is_visible() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let client = TunnelRelayTunnelClient::new(None);
        let seen_clone = seen.clone();
        let _sub = client.events().port_forwarding.subscribe(move |args| {
            seen_clone.lock().unwrap().push((args.port, args.is_cancelled()));
        });
        assert!(client.events().port_forwarding.is_subscribed());
    }
}
