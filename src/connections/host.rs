// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, RwLock, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use russh::CryptoVec;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::contracts::{self, Tunnel, TunnelConnectionMode, TunnelEndpoint, TunnelEvent};
use crate::management::{TunnelManagementApi, NO_REQUEST_OPTIONS};

use super::{
    channel_stream::{AsyncRWChannel, ServerChannelStream},
    connection::{ConnectionBase, ConnectionOptions},
    connector::{self, RelaySession, RelayStream},
    disconnect::{DisconnectReasonCell, DisconnectSniffer},
    errors::TunnelError,
    events::{ConnectionEvents, TunnelProgress},
    messages::RelayMessage,
    protocol::{requested_sub_protocols, ConnectionProtocol, ConnectionSide},
    session::{TokenState, TunnelSessionState},
    ssh::{
        self, connect_session_stream, AcceptAllServerKeys, ChannelOp, RelayChannelKind,
        RelaySessionHandler,
    },
    status::{ConnectionStatus, TunnelDisconnectReason},
    ws::{connect_relay_websocket, AsyncRWWebSocket, AsyncRWWebSocketOptions},
};

/// Ping timeout for the relay websocket keep-alive.
const KEEP_ALIVE_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Stand-in ping interval when keep-alive is disabled.
const KEEP_ALIVE_DISABLED_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24 * 365);

static PROCESS_HOST_ID: OnceLock<String> = OnceLock::new();

/// The host identifier for this process, generated once at startup. All host
/// connections made by this process register endpoints under this ID.
pub fn process_host_id() -> &'static str {
    PROCESS_HOST_ID.get_or_init(|| Uuid::new_v4().to_string())
}

/// The host side of tunnel connections. A map of the moving pieces, since
/// there are a few layers stacked on top of each other:
///
/// ## Overall Communication
///
/// The host speaks a multiplexed secure-channel protocol over a binary
/// websocket to the relay. We use Tungstenite for the websocket, wrap it into
/// an AsyncRead/AsyncWrite type, and hand it to the secure-channel library,
/// russh. The relay authenticates both sides with tunnel access tokens, so
/// the outer session uses the "none" key exchange over the already-TLS
/// websocket.
///
/// In protocol v1, each connecting client gets its own nested SSH session:
/// the relay opens a channel of type "client-ssh-session-stream" on the
/// host's outer session, and the bytes of that channel are the client's own
/// SSH connection. For each one, the host runs an SSH server instance over
/// the channel (this nested session does a real key exchange, and clients
/// verify the host key against the tunnel endpoint). Once a client
/// authenticates, the host announces each forwarded port on the client's
/// control channel; the client opens "direct-tcpip" channels to connect.
///
/// In protocol v2, there is one session for everything: the host announces
/// ports to the relay on a control channel, and the relay opens a
/// "forwarded-tcpip" channel per client connection. The first frame on such
/// a channel names the target port and may request end-to-end encryption, in
/// which case the host runs a nested SSH server over the channel just like a
/// v1 client session.
///
/// ```text
///        ┌───────────┐     ┌───────┐      ┌───────┐
///        │Host (this)│     │Relay  │      │Client │
///        └─────┬─────┘     └───┬───┘      └───┬───┘
///              │ Connect ws    │              │
///              ├──────────────▶│  Connect ws  │
///              │               │◀─────────────┤
///              │ announce      │              │
///              ├──port────────▶│──advertise──▶│
///              │               │              │◀───asked to
///              │               │              │    connect
///              │◀───────per-connection────────┤
///      make    │           channel            │
/// local tcp ◀──┤               │              │
/// connection   │               │              │
///              │◀─ ─ ─ ─forward traffic─ ─ ─ ▶│
///              ▼               ▼              ▼
/// ```
///
/// ## How this Package Works
///
/// The host keeps the set of tunnel ports in shared state that the channel
/// handlers read when accepting connections, and a record per live client
/// session holding the sender for its control channel. `refresh_ports`
/// re-reads the tunnel and walks those records to announce added ports and
/// withdraw removed ones; the forwarder map tracks what each session is
/// currently forwarding.
pub struct TunnelRelayTunnelHost {
    inner: Arc<HostInner>,
}

/// A port forward established for one client session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteForwarder {
    pub local_port: u16,
    pub remote_port: u16,
}

/// One live client session (or, in v2, the relay session) and the sender
/// used to announce ports on its control channel.
struct SessionRecord {
    session_id: String,
    commands: mpsc::UnboundedSender<RelayMessage>,
    authenticated: Arc<AtomicBool>,
}

struct HostSshSession {
    handle: Arc<russh::client::Handle<RelaySessionHandler>>,
    tasks: Vec<JoinHandle<()>>,
}

struct HostInner {
    self_weak: Weak<HostInner>,
    state: TunnelSessionState,
    options: RwLock<ConnectionOptions>,
    host_id: String,
    host_keypair: russh_keys::key::KeyPair,
    host_public_key: String,
    endpoint_signature: Mutex<Option<String>>,
    host_relay_uri: Mutex<Option<String>>,
    endpoint_created: AtomicBool,
    protocol: RwLock<Option<ConnectionProtocol>>,
    ssh: tokio::sync::Mutex<Option<HostSshSession>>,
    current_ports: Arc<Mutex<HashSet<u16>>>,
    forwarders: Mutex<HashMap<(String, u16), RemoteForwarder>>,
    sessions: Mutex<Vec<Arc<SessionRecord>>>,
    session_tasks: Mutex<Vec<JoinHandle<()>>>,
    refuse_new_sessions: AtomicBool,
    sniffed_disconnect: DisconnectReasonCell,
}

impl TunnelRelayTunnelHost {
    pub fn new(management: Arc<dyn TunnelManagementApi>) -> Self {
        let host_keypair = ssh::generate_host_keypair();
        let host_public_key = ssh::host_public_key_base64(&host_keypair);
        TunnelRelayTunnelHost {
            inner: Arc::new_cyclic(|self_weak| HostInner {
                self_weak: self_weak.clone(),
                state: TunnelSessionState::new(contracts::HOST, Some(management)),
                options: RwLock::new(ConnectionOptions::default()),
                host_id: process_host_id().to_string(),
                host_keypair,
                host_public_key,
                endpoint_signature: Mutex::new(None),
                host_relay_uri: Mutex::new(None),
                endpoint_created: AtomicBool::new(false),
                protocol: RwLock::new(None),
                ssh: tokio::sync::Mutex::new(None),
                current_ports: Arc::new(Mutex::new(HashSet::new())),
                forwarders: Mutex::new(HashMap::new()),
                sessions: Mutex::new(Vec::new()),
                session_tasks: Mutex::new(Vec::new()),
                refuse_new_sessions: AtomicBool::new(false),
                sniffed_disconnect: DisconnectReasonCell::default(),
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

    /// The base64 public key clients use to authenticate this host.
    pub fn host_public_key(&self) -> &str {
        &self.inner.host_public_key
    }

    /// Registers this host on the tunnel and starts accepting client
    /// connections. Only one host connection per instance; a host displaced
    /// by another host (too many connections) cannot reconnect.
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
        if inner.state.base.disconnect_reason() == Some(TunnelDisconnectReason::TooManyConnections)
        {
            return Err(TunnelError::TooManyConnections);
        }
        match inner.state.base.status() {
            ConnectionStatus::None | ConnectionStatus::Disconnected => {}
            _ => return Err(TunnelError::AlreadyConnected),
        }

        inner.state.assign_tunnel(tunnel)?;
        if let Ok(mut slot) = inner.options.write() {
            *slot = options;
        }
        inner.reset_ports_from_tunnel();

        let token = inner.state.base.operation_token(cancellation);
        connector::connect_tunnel_session(inner.as_ref(), false, token).await
    }

    /// Re-reads the tunnel's ports from the management service and updates
    /// forwards on every connected client session.
    pub async fn refresh_ports(&self) -> Result<(), TunnelError> {
        self.inner.refresh_ports().await
    }

    /// The forwards currently established, keyed by (session id, local
    /// port).
    pub fn remote_forwarders(&self) -> HashMap<(String, u16), RemoteForwarder> {
        self.inner
            .forwarders
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    /// Unregisters the host endpoint and releases all resources. In-flight
    /// client sessions are drained first. The endpoint is left in place when
    /// another host displaced this one, since that host has already
    /// overwritten it.
    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

impl HostInner {
    fn reset_ports_from_tunnel(&self) {
        let ports: HashSet<u16> = self
            .state
            .tunnel()
            .map(|t| t.ports.iter().map(|p| p.port_number).collect())
            .unwrap_or_default();
        if let Ok(mut current) = self.current_ports.lock() {
            *current = ports;
        }
    }

    fn sorted_ports(&self) -> Vec<u16> {
        let ports: BTreeSet<u16> = self
            .current_ports
            .lock()
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();
        ports.into_iter().collect()
    }

    /// Registers (or re-registers) this host's endpoint on the tunnel. The
    /// update is skipped when nothing that affects the endpoint record has
    /// changed since the last registration.
    async fn ensure_endpoint_registered(&self) -> Result<String, TunnelError> {
        let tunnel = self
            .state
            .tunnel()
            .ok_or(TunnelError::EndpointSelection("no tunnel is assigned"))?;
        let signature = endpoint_signature(
            &tunnel,
            &self.host_id,
            std::slice::from_ref(&self.host_public_key),
        );

        let unchanged = self
            .endpoint_signature
            .lock()
            .map(|s| s.as_deref() == Some(signature.as_str()))
            .unwrap_or(false);
        if unchanged {
            if let Some(uri) = self.host_relay_uri.lock().ok().and_then(|u| u.clone()) {
                return Ok(uri);
            }
        }

        let management = self.state.management().ok_or(TunnelError::EndpointSelection(
            "a management client is required to host a tunnel",
        ))?;
        let endpoint = TunnelEndpoint {
            id: Some(self.host_id.clone()),
            connection_mode: TunnelConnectionMode::TunnelRelay,
            host_id: self.host_id.clone(),
            host_public_keys: vec![self.host_public_key.clone()],
            client_relay_uri: None,
            host_relay_uri: None,
        };

        log::debug!("registering tunnel endpoint for host {}", self.host_id);
        let updated = management
            .update_tunnel_endpoint(&tunnel, &endpoint, NO_REQUEST_OPTIONS)
            .await
            .map_err(|error| TunnelError::HttpError {
                error,
                reason: "failed to register the tunnel endpoint",
            })?;
        let uri = updated.host_relay_uri.ok_or(TunnelError::MissingRelayUri)?;

        if let Ok(mut slot) = self.endpoint_signature.lock() {
            *slot = Some(signature);
        }
        if let Ok(mut slot) = self.host_relay_uri.lock() {
            *slot = Some(uri.clone());
        }
        self.endpoint_created.store(true, Ordering::SeqCst);
        Ok(uri)
    }

    /// Starts a nested server session for a newly-connected v1 client.
    fn start_client_session(&self, rw: AsyncRWChannel<RelaySessionHandler>) {
        let session_id = Uuid::new_v4().to_string();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let record = Arc::new(SessionRecord {
            session_id: session_id.clone(),
            commands: commands_tx,
            authenticated: Arc::new(AtomicBool::new(false)),
        });
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push(record.clone());
        }

        let config = ssh::host_server_config(self.host_keypair.clone(), 1);
        let (handler, ops_rx) = HostServerHandler::new(
            ServerSessionMode::ClientSession,
            self.current_ports.clone(),
        );
        let host = self.self_weak.clone();
        let task = tokio::spawn(run_client_session(
            host, record, config, rw, handler, ops_rx, commands_rx,
        ));
        if let Ok(mut tasks) = self.session_tasks.lock() {
            tasks.push(task);
        }
    }

    /// Announces every current port on a session's control channel and
    /// records the forwards. Ports are announced in ascending order, one at
    /// a time.
    fn forward_all_ports_to_record(&self, record: &Arc<SessionRecord>) {
        record.authenticated.store(true, Ordering::SeqCst);
        let access_token = self.state.access_token().unwrap_or_default();
        for port in self.sorted_ports() {
            self.forward_port_to_record(record, port, &access_token);
        }
    }

    fn forward_port_to_record(&self, record: &Arc<SessionRecord>, port: u16, access_token: &str) {
        record
            .commands
            .send(RelayMessage::PortRelayRequest {
                address: "127.0.0.1".to_string(),
                port: u32::from(port),
                access_token: access_token.to_string(),
            })
            .ok();
        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.insert(
                (record.session_id.clone(), port),
                RemoteForwarder {
                    local_port: port,
                    remote_port: port,
                },
            );
        }
    }

    fn cancel_port_on_record(&self, record: &Arc<SessionRecord>, port: u16) {
        record
            .commands
            .send(RelayMessage::CancelPortRelayRequest {
                address: "127.0.0.1".to_string(),
                port: u32::from(port),
            })
            .ok();
        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.remove(&(record.session_id.clone(), port));
        }
    }

    fn remove_session(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.retain(|record| record.session_id != session_id);
        }
        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.retain(|(sid, _), _| sid != session_id);
        }
    }

    async fn refresh_ports(&self) -> Result<(), TunnelError> {
        if self.state.base.is_disposed() {
            return Err(TunnelError::Disposed);
        }

        self.state
            .base
            .events
            .progress
            .emit(&TunnelProgress::StartingRefreshPorts);
        let cancellation = self.state.base.dispose_token().child_token();
        let result = self.refresh_ports_inner(&cancellation).await;
        self.state
            .base
            .events
            .progress
            .emit(&TunnelProgress::CompletedRefreshPorts);
        self.report_refresh_event(result.is_ok());
        result
    }

    async fn refresh_ports_inner(&self, cancellation: &CancellationToken) -> Result<(), TunnelError> {
        self.state.refresh_tunnel(true, cancellation).await?;
        let tunnel = self.state.tunnel().ok_or(TunnelError::NotConnected)?;

        let new_ports: HashSet<u16> = tunnel.ports.iter().map(|p| p.port_number).collect();
        let old_ports = {
            let mut current = self
                .current_ports
                .lock()
                .map_err(|_| TunnelError::Disposed)?;
            std::mem::replace(&mut *current, new_ports.clone())
        };

        let added: BTreeSet<u16> = new_ports.difference(&old_ports).copied().collect();
        let removed: BTreeSet<u16> = old_ports.difference(&new_ports).copied().collect();
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        log::info!(
            "refreshing ports: {} added, {} removed",
            added.len(),
            removed.len()
        );

        let records: Vec<Arc<SessionRecord>> = self
            .sessions
            .lock()
            .map(|sessions| sessions.clone())
            .unwrap_or_default();
        let access_token = self.state.access_token().unwrap_or_default();

        for record in records {
            if !record.authenticated.load(Ordering::SeqCst) {
                continue;
            }
            for port in &added {
                self.forward_port_to_record(&record, *port, &access_token);
            }
            for port in &removed {
                self.cancel_port_on_record(&record, *port);
            }
        }
        Ok(())
    }

    fn report_refresh_event(&self, succeeded: bool) {
        let (management, tunnel) = match (self.state.management(), self.state.tunnel()) {
            (Some(management), Some(tunnel)) => (management, tunnel),
            _ => return,
        };
        let event = TunnelEvent {
            name: if succeeded {
                "refreshPorts"
            } else {
                "refreshPortsFailed"
            }
            .to_string(),
            severity: Some(
                if succeeded {
                    contracts::SEVERITY_INFO
                } else {
                    contracts::SEVERITY_WARNING
                }
                .to_string(),
            ),
            ..Default::default()
        };
        tokio::spawn(async move {
            management.report_event(&tunnel, event).await.ok();
        });
    }

    /// Handles the outer relay session ending for any reason, consuming the
    /// disconnect reason sniffed from the session stream (if the relay sent
    /// one) so a displaced host backs off instead of reconnecting.
    async fn on_relay_session_ended(&self) {
        let reason = self
            .sniffed_disconnect
            .take()
            .unwrap_or(TunnelDisconnectReason::ConnectionLost);
        self.handle_session_closed(reason).await;
    }

    /// Handles the outer session ending, with the reason when one is known.
    /// A host displaced by another host must not reconnect, and must leave
    /// the endpoint registration for the new host.
    async fn handle_session_closed(&self, reason: TunnelDisconnectReason) {
        let session = {
            let mut ssh = self.ssh.lock().await;
            ssh.take()
        };
        if let Some(session) = session {
            session
                .handle
                .disconnect(reason.to_ssh_disconnect(), "closing session", "en")
                .await
                .ok();
            for task in session.tasks {
                task.abort();
            }
        }
        if self.state.base.is_disposed() {
            return;
        }

        if self.state.base.disconnect_reason().is_none()
            || reason == TunnelDisconnectReason::TooManyConnections
        {
            self.state.base.set_disconnect_reason(reason);
        }

        if reason == TunnelDisconnectReason::TooManyConnections {
            log::warn!("another host connected to the tunnel; not reconnecting");
            self.state
                .base
                .set_status(ConnectionStatus::Disconnected, None)
                .ok();
            return;
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

        log::info!("tunnel host connection lost; reconnecting");
        let Some(inner) = self.self_weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let token = inner.state.base.dispose_token().child_token();
            let result = connector::connect_tunnel_session(inner.as_ref(), true, token).await;
            inner.state.finish_reconnecting();
            if let Err(e) = result {
                log::warn!("tunnel host reconnect failed: {}", e);
            }
        });
    }

    async fn dispose(&self) {
        self.refuse_new_sessions.store(true, Ordering::SeqCst);
        if !self.state.base.dispose() {
            return;
        }

        let session = {
            let mut ssh = self.ssh.lock().await;
            ssh.take()
        };
        if let Some(session) = session {
            session
                .handle
                .disconnect(russh::Disconnect::ByApplication, "host disposed", "en")
                .await
                .ok();
            for task in session.tasks {
                task.abort();
            }
        }

        // Drain in-flight client sessions before unregistering.
        let tasks: Vec<JoinHandle<()>> = self
            .session_tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            task.await.ok();
        }

        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.clear();
        }
        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.clear();
        }

        let too_many = self.state.base.disconnect_reason()
            == Some(TunnelDisconnectReason::TooManyConnections);
        if self.endpoint_created.load(Ordering::SeqCst) && !too_many {
            if let (Some(management), Some(tunnel)) =
                (self.state.management(), self.state.tunnel())
            {
                log::debug!("deleting tunnel endpoint for host {}", self.host_id);
                if let Err(e) = management
                    .delete_tunnel_endpoints(&tunnel, &self.host_id, NO_REQUEST_OPTIONS)
                    .await
                {
                    log::warn!("failed to delete tunnel endpoint: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl RelaySession for HostInner {
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
        if self.state.access_token_state() == TokenState::Expired {
            log::info!("tunnel access token is expired; refreshing before connecting");
            self.state.refresh_tunnel_access_token(cancellation).await?;
        }

        let uri = self.ensure_endpoint_registered().await?;
        let sub_protocols = requested_sub_protocols(ConnectionSide::Host);
        let access_token = self.state.access_token();

        let (websocket, negotiated) =
            connect_relay_websocket(&uri, &sub_protocols, access_token.as_deref()).await?;

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

        // Watch the session bytes for a relay-sent disconnect reason; it
        // decides whether a dropped session may reconnect.
        self.sniffed_disconnect.clear();
        let stream = DisconnectSniffer::new(stream, self.sniffed_disconnect.clone());

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
        let this = self.self_weak.upgrade().ok_or(TunnelError::Disposed)?;
        let protocol = stream.protocol;

        // The channel window is enlarged on the v1 outer session because
        // every client session is nested inside one of its channels.
        let window_multiplier = match protocol {
            ConnectionProtocol::V1 => 5,
            ConnectionProtocol::V2 => 1,
        };
        let accepted_kinds: &'static [RelayChannelKind] = match protocol {
            ConnectionProtocol::V1 => &[RelayChannelKind::ClientSshSessionStream],
            ConnectionProtocol::V2 => &[RelayChannelKind::ForwardedPort],
        };

        let (mut handle, ops) = connect_session_stream(
            ssh::anonymous_relay_config(window_multiplier),
            stream.stream,
            Arc::new(AcceptAllServerKeys),
            accepted_kinds,
        )
        .await
        .map_err(TunnelError::TunnelRelayDisconnected)?;

        let mut tasks = Vec::new();
        match protocol {
            ConnectionProtocol::V1 => {
                let handle = Arc::new(handle);
                tasks.push(tokio::spawn(run_v1_acceptor(
                    self.self_weak.clone(),
                    handle.clone(),
                    ops,
                )));
                let mut ssh = self.ssh.lock().await;
                *ssh = Some(HostSshSession { handle, tasks });
            }
            ConnectionProtocol::V2 => {
                let control_channel = handle
                    .channel_open_session()
                    .await
                    .map_err(TunnelError::TunnelRelayDisconnected)?;
                let handle = Arc::new(handle);

                let (commands_tx, commands_rx) = mpsc::unbounded_channel();
                let record = Arc::new(SessionRecord {
                    session_id: format!("relay-{}", Uuid::new_v4()),
                    commands: commands_tx,
                    authenticated: Arc::new(AtomicBool::new(true)),
                });
                if let Ok(mut sessions) = self.sessions.lock() {
                    sessions.push(record.clone());
                }

                tasks.push(tokio::spawn(run_host_control_channel(
                    self.self_weak.clone(),
                    control_channel,
                    commands_rx,
                )));
                tasks.push(tokio::spawn(run_v2_acceptor(
                    self.self_weak.clone(),
                    handle.clone(),
                    ops,
                )));

                // The relay session needs no authentication step; announce
                // all ports immediately.
                this.forward_all_ports_to_record(&record);

                let mut ssh = self.ssh.lock().await;
                *ssh = Some(HostSshSession { handle, tasks });
            }
        }
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
            log::debug!("closing tunnel host session ({})", reason);
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

fn endpoint_signature(tunnel: &Tunnel, host_id: &str, host_public_keys: &[String]) -> String {
    let has_ssh_port = tunnel
        .ports
        .iter()
        .any(|p| p.protocol.as_deref() == Some(contracts::SSH));
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        tunnel.tunnel_id.as_deref().unwrap_or_default(),
        tunnel.cluster_id.as_deref().unwrap_or_default(),
        tunnel.name.as_deref().unwrap_or_default(),
        tunnel.domain.as_deref().unwrap_or_default(),
        has_ssh_port,
        host_id,
        host_public_keys.join(","),
    )
}

/// Accepts v1 client session channels on the outer session and routes their
/// data into the nested server sessions.
async fn run_v1_acceptor(
    host: Weak<HostInner>,
    handle: Arc<russh::client::Handle<RelaySessionHandler>>,
    mut ops: mpsc::UnboundedReceiver<ChannelOp>,
) {
    let mut channels: HashMap<russh::ChannelId, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();

    while let Some(op) = ops.recv().await {
        match op {
            ChannelOp::Open(id, RelayChannelKind::ClientSshSessionStream) => {
                let Some(host_arc) = host.upgrade() else { break };
                if host_arc.refuse_new_sessions.load(Ordering::SeqCst) {
                    log::debug!("refusing new client session; host is closing");
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                channels.insert(id, tx);
                let rw = AsyncRWChannel::new(id, handle.clone(), rx);
                host_arc.start_client_session(rw);
                log::info!("opened new client session on channel {:?}", id);
            }
            ChannelOp::Open(id, kind) => {
                log::debug!("ignoring unexpected channel {:?} of kind {:?}", id, kind);
            }
            ChannelOp::Data(id, data) => {
                if let Some(tx) = channels.get(&id) {
                    if tx.send(data).is_err() {
                        channels.remove(&id);
                    }
                }
            }
            ChannelOp::Close(id) => {
                channels.remove(&id);
            }
        }
    }

    log::debug!("host relay session ended");
    if let Some(host_arc) = host.upgrade() {
        host_arc.on_relay_session_ended().await;
    }
}

/// Accepts v2 per-connection channels on the outer session, performing the
/// connect handshake on each and piping it to the local port (or a nested
/// encrypted session).
async fn run_v2_acceptor(
    host: Weak<HostInner>,
    handle: Arc<russh::client::Handle<RelaySessionHandler>>,
    mut ops: mpsc::UnboundedReceiver<ChannelOp>,
) {
    let mut channels: HashMap<russh::ChannelId, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();

    while let Some(op) = ops.recv().await {
        match op {
            ChannelOp::Open(id, RelayChannelKind::ForwardedPort) => {
                let Some(host_arc) = host.upgrade() else { break };
                if host_arc.refuse_new_sessions.load(Ordering::SeqCst) {
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                channels.insert(id, tx);
                tokio::spawn(handle_v2_port_channel(
                    host.clone(),
                    handle.clone(),
                    id,
                    rx,
                ));
            }
            ChannelOp::Open(id, kind) => {
                log::debug!("ignoring unexpected channel {:?} of kind {:?}", id, kind);
            }
            ChannelOp::Data(id, data) => {
                if let Some(tx) = channels.get(&id) {
                    if tx.send(data).is_err() {
                        channels.remove(&id);
                    }
                }
            }
            ChannelOp::Close(id) => {
                channels.remove(&id);
            }
        }
    }

    log::debug!("host relay session ended");
    if let Some(host_arc) = host.upgrade() {
        host_arc.on_relay_session_ended().await;
    }
}

/// One v2 per-connection channel: reads the connect request, confirms it,
/// then pipes bytes to the local port, optionally inside a nested encrypted
/// session.
async fn handle_v2_port_channel(
    host: Weak<HostInner>,
    handle: Arc<russh::client::Handle<RelaySessionHandler>>,
    id: russh::ChannelId,
    mut incoming: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let Some(first_frame) = incoming.recv().await else {
        return;
    };
    let request = match RelayMessage::decode(&first_frame) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("invalid connect request on port channel: {}", e);
            return;
        }
    };
    let (port, e2e_requested) = match request {
        RelayMessage::PortRelayConnectRequest {
            port,
            is_e2e_encryption_requested,
            ..
        } => (port as u16, is_e2e_encryption_requested),
        other => {
            log::warn!("unexpected first message on port channel: {:?}", other);
            return;
        }
    };

    let Some(host_arc) = host.upgrade() else { return };
    let allowed = host_arc
        .current_ports
        .lock()
        .map(|ports| ports.contains(&port))
        .unwrap_or(false);
    if !allowed {
        log::info!("rejecting connection to port {} that is not forwarded", port);
        return;
    }

    let response = RelayMessage::PortRelayConnectResponse {
        is_e2e_encryption_enabled: e2e_requested,
    };
    if handle
        .data(id, CryptoVec::from(response.encode()))
        .await
        .is_err()
    {
        return;
    }

    let rw = AsyncRWChannel::new(id, handle.clone(), incoming);
    if e2e_requested {
        // End-to-end encrypted connections get their own server session,
        // with a doubled window since they carry a whole re-framed stream.
        let config = ssh::host_server_config(host_arc.host_keypair.clone(), 2);
        let (handler, ops_rx) = HostServerHandler::new(
            ServerSessionMode::EncryptedPipe { target_port: port },
            host_arc.current_ports.clone(),
        );
        drop(host_arc);
        run_nested_server_session(port, config, rw, handler, ops_rx).await;
    } else {
        drop(host_arc);
        pipe_to_local_port(rw, port).await;
    }
}

/// Connects a stream to a local TCP port and copies bytes both ways.
async fn pipe_to_local_port<S>(mut stream: S, port: u16)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut tcp = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(tcp) => tcp,
        Err(e) => {
            log::info!("error connecting to local port {}: {}", port, e);
            return;
        }
    };
    log::debug!("forwarding connection to local port {}", port);
    tokio::io::copy_bidirectional(&mut stream, &mut tcp).await.ok();
}

/// Which role a host-side server session plays.
#[derive(Clone, Copy, Debug)]
enum ServerSessionMode {
    /// A v1 client's nested session: carries a control channel and
    /// direct-tcpip connections to forwarded ports.
    ClientSession,
    /// A nested end-to-end encrypted stream: session channels pipe to one
    /// fixed local port.
    EncryptedPipe { target_port: u16 },
}

/// Events a host-side server session handler reports to its session task.
enum ServerOp {
    Authenticated,
    SessionChannelOpen(russh::ChannelId, russh::server::Handle),
    DirectConnection {
        channel: russh::ChannelId,
        port: u16,
        handle: russh::server::Handle,
    },
    Data(russh::ChannelId, Vec<u8>),
    ChannelClosed(russh::ChannelId),
}

/// Handler for server sessions the host runs (v1 client sessions and nested
/// encrypted streams). Connecting clients use "none" auth; the relay has
/// already authorized them with a tunnel access token.
struct HostServerHandler {
    mode: ServerSessionMode,
    ports: Arc<Mutex<HashSet<u16>>>,
    ops: mpsc::UnboundedSender<ServerOp>,
}

impl HostServerHandler {
    fn new(
        mode: ServerSessionMode,
        ports: Arc<Mutex<HashSet<u16>>>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerOp>) {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        (HostServerHandler { mode, ports, ops }, ops_rx)
    }
}

impl russh::server::Handler for HostServerHandler {
    type Error = russh::Error;
    type FutureAuth = Pin<
        Box<
            dyn core::future::Future<Output = Result<(Self, russh::server::Auth), Self::Error>>
                + Send,
        >,
    >;
    type FutureUnit = Pin<
        Box<
            dyn core::future::Future<Output = Result<(Self, russh::server::Session), Self::Error>>
                + Send,
        >,
    >;
    type FutureBool = Pin<
        Box<
            dyn core::future::Future<
                    Output = Result<(Self, russh::server::Session, bool), Self::Error>,
                > + Send,
        >,
    >;

    fn finished_auth(self, auth: russh::server::Auth) -> Self::FutureAuth {
        async { Ok((self, auth)) }.boxed()
    }

    fn finished_bool(self, b: bool, s: russh::server::Session) -> Self::FutureBool {
        async move { Ok((self, s, b)) }.boxed()
    }

    fn finished(self, s: russh::server::Session) -> Self::FutureUnit {
        async { Ok((self, s)) }.boxed()
    }

    fn auth_none(self, _: &str) -> Self::FutureAuth {
        self.finished_auth(russh::server::Auth::Accept)
    }

    fn auth_succeeded(self, session: russh::server::Session) -> Self::FutureUnit {
        self.ops.send(ServerOp::Authenticated).ok();
        self.finished(session)
    }

    fn channel_open_session(
        self,
        channel: russh::ChannelId,
        session: russh::server::Session,
    ) -> Self::FutureBool {
        self.ops
            .send(ServerOp::SessionChannelOpen(channel, session.handle()))
            .ok();
        self.finished_bool(true, session)
    }

    fn channel_open_direct_tcpip(
        self,
        channel: russh::ChannelId,
        _host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: russh::server::Session,
    ) -> Self::FutureBool {
        let port = port_to_connect as u16;
        // Connections are only accepted to ports currently in the tunnel.
        // The port set may be concurrently refreshed; the check reads
        // whatever set is current at open time.
        let accept = matches!(self.mode, ServerSessionMode::ClientSession)
            && self
                .ports
                .lock()
                .map(|ports| ports.contains(&port))
                .unwrap_or(false);
        if accept {
            self.ops
                .send(ServerOp::DirectConnection {
                    channel,
                    port,
                    handle: session.handle(),
                })
                .ok();
        } else {
            log::info!("rejecting connection to port {} that is not forwarded", port);
        }
        self.finished_bool(accept, session)
    }

    fn data(
        self,
        channel: russh::ChannelId,
        data: &[u8],
        session: russh::server::Session,
    ) -> Self::FutureUnit {
        // Copy out of the frame buffer; it may be recycled as soon as this
        // callback returns.
        self.ops.send(ServerOp::Data(channel, data.to_vec())).ok();
        self.finished(session)
    }

    fn channel_eof(
        self,
        channel: russh::ChannelId,
        session: russh::server::Session,
    ) -> Self::FutureUnit {
        self.ops.send(ServerOp::ChannelClosed(channel)).ok();
        self.finished(session)
    }

    fn channel_close(
        self,
        channel: russh::ChannelId,
        session: russh::server::Session,
    ) -> Self::FutureUnit {
        self.ops.send(ServerOp::ChannelClosed(channel)).ok();
        self.finished(session)
    }
}

/// Runs one v1 client's nested server session: announces ports on the
/// client's control channel, answers refresh-ports requests, and pipes
/// direct-tcpip channels to local ports.
async fn run_client_session(
    host: Weak<HostInner>,
    record: Arc<SessionRecord>,
    config: Arc<russh::server::Config>,
    rw: AsyncRWChannel<RelaySessionHandler>,
    handler: HostServerHandler,
    mut ops: mpsc::UnboundedReceiver<ServerOp>,
    mut commands: mpsc::UnboundedReceiver<RelayMessage>,
) {
    log::debug!("starting to serve client session {}", record.session_id);
    let session = match russh::server::run_stream(config, rw, handler).await {
        Ok(session) => session,
        Err(e) => {
            log::error!("error handshaking client session: {}", e);
            if let Some(host_arc) = host.upgrade() {
                host_arc.remove_session(&record.session_id);
            }
            return;
        }
    };
    tokio::pin!(session);

    let mut control: Option<(russh::ChannelId, russh::server::Handle)> = None;
    let mut pending_control: Vec<RelayMessage> = Vec::new();
    let mut pipes: HashMap<russh::ChannelId, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();

    loop {
        tokio::select! {
            result = &mut session => {
                if let Err(e) = result {
                    log::debug!("client session ended with error: {}", e);
                }
                break;
            }
            op = ops.recv() => match op {
                None => break,
                Some(ServerOp::Authenticated) => {
                    log::debug!("client session {} authenticated", record.session_id);
                    if let Some(host_arc) = host.upgrade() {
                        host_arc.forward_all_ports_to_record(&record);
                    }
                }
                Some(ServerOp::SessionChannelOpen(id, handle)) => {
                    if control.is_none() {
                        let mut handle = handle;
                        for message in pending_control.drain(..) {
                            handle.data(id, CryptoVec::from(message.encode())).await.ok();
                        }
                        control = Some((id, handle));
                    }
                }
                Some(ServerOp::DirectConnection { channel, port, handle }) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    pipes.insert(channel, tx);
                    let stream = ServerChannelStream::new(channel, handle, rx);
                    tokio::spawn(pipe_to_local_port(stream, port));
                }
                Some(ServerOp::Data(id, data)) => {
                    let is_control =
                        control.as_ref().map(|(cid, _)| *cid == id).unwrap_or(false);
                    if is_control {
                        handle_client_control_frame(&host, &record, &mut control, &data).await;
                    } else if let Some(tx) = pipes.get(&id) {
                        if tx.send(data).is_err() {
                            pipes.remove(&id);
                        }
                    }
                }
                Some(ServerOp::ChannelClosed(id)) => {
                    pipes.remove(&id);
                    if control.as_ref().map(|(cid, _)| *cid == id).unwrap_or(false) {
                        control = None;
                    }
                }
            },
            command = commands.recv() => match command {
                None => break,
                Some(message) => {
                    match control.as_mut() {
                        Some((id, handle)) => {
                            handle.data(*id, CryptoVec::from(message.encode())).await.ok();
                        }
                        None => pending_control.push(message),
                    }
                }
            },
        }
    }

    log::debug!("client session {} closed", record.session_id);
    if let Some(host_arc) = host.upgrade() {
        host_arc.remove_session(&record.session_id);
    }
}

async fn handle_client_control_frame(
    host: &Weak<HostInner>,
    record: &Arc<SessionRecord>,
    control: &mut Option<(russh::ChannelId, russh::server::Handle)>,
    frame: &[u8],
) {
    let message = match RelayMessage::decode(frame) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("invalid control message from client: {}", e);
            return;
        }
    };
    match message {
        RelayMessage::RefreshPortsRequest { want_reply } => {
            log::debug!(
                "client session {} requested a port refresh",
                record.session_id
            );
            let succeeded = match host.upgrade() {
                Some(host_arc) => host_arc.refresh_ports().await.is_ok(),
                None => false,
            };
            if want_reply {
                if let Some((id, handle)) = control.as_mut() {
                    let reply = RelayMessage::RefreshPortsResponse { succeeded };
                    handle.data(*id, CryptoVec::from(reply.encode())).await.ok();
                }
            }
        }
        other => {
            log::debug!("ignoring unexpected control message: {:?}", other);
        }
    }
}

/// Runs a nested server session for an end-to-end encrypted connection;
/// session channels opened by the client are piped to the target port.
async fn run_nested_server_session(
    target_port: u16,
    config: Arc<russh::server::Config>,
    rw: AsyncRWChannel<RelaySessionHandler>,
    handler: HostServerHandler,
    mut ops: mpsc::UnboundedReceiver<ServerOp>,
) {
    let session = match russh::server::run_stream(config, rw, handler).await {
        Ok(session) => session,
        Err(e) => {
            log::error!("error handshaking encrypted stream session: {}", e);
            return;
        }
    };
    tokio::pin!(session);

    let mut pipes: HashMap<russh::ChannelId, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();

    loop {
        tokio::select! {
            result = &mut session => {
                if let Err(e) = result {
                    log::debug!("encrypted stream session ended with error: {}", e);
                }
                break;
            }
            op = ops.recv() => match op {
                None => break,
                Some(ServerOp::SessionChannelOpen(id, handle)) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    pipes.insert(id, tx);
                    let stream = ServerChannelStream::new(id, handle, rx);
                    tokio::spawn(pipe_to_local_port(stream, target_port));
                }
                Some(ServerOp::Data(id, data)) => {
                    if let Some(tx) = pipes.get(&id) {
                        if tx.send(data).is_err() {
                            pipes.remove(&id);
                        }
                    }
                }
                Some(ServerOp::ChannelClosed(id)) => {
                    pipes.remove(&id);
                }
                Some(_) => {}
            },
        }
    }
}

/// Runs the host's control channel to the relay (v2): announces ports and
/// answers refresh-ports requests arriving from clients through the relay.
async fn run_host_control_channel(
    host: Weak<HostInner>,
    mut channel: russh::Channel<russh::client::Msg>,
    mut commands: mpsc::UnboundedReceiver<RelayMessage>,
) {
    enum Op {
        Incoming(Option<russh::ChannelMsg>),
        Outgoing(Option<RelayMessage>),
    }

    loop {
        let op = tokio::select! {
            msg = channel.wait() => Op::Incoming(msg),
            message = commands.recv() => Op::Outgoing(message),
        };
        match op {
            Op::Incoming(Some(russh::ChannelMsg::Data { data })) => {
                let message = match RelayMessage::decode(&data) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("invalid control message from relay: {}", e);
                        continue;
                    }
                };
                match message {
                    RelayMessage::RefreshPortsRequest { want_reply } => {
                        let succeeded = match host.upgrade() {
                            Some(host_arc) => host_arc.refresh_ports().await.is_ok(),
                            None => false,
                        };
                        if want_reply {
                            let reply = RelayMessage::RefreshPortsResponse { succeeded };
                            if channel.data(&reply.encode()[..]).await.is_err() {
                                break;
                            }
                        }
                    }
                    other => {
                        log::debug!("ignoring unexpected control message: {:?}", other);
                    }
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

    log::debug!("host control channel ended");
    if let Some(host_arc) = host.upgrade() {
        host_arc.on_relay_session_ended().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::contracts::{Tunnel, TunnelEndpoint, TunnelEvent, TunnelPort};
    use crate::management::{
        HttpResult, TunnelLocator, TunnelManagementApi, TunnelRequestOptions,
    };

    use super::*;

    #[derive(Default)]
    struct MockManagement {
        get_calls: AtomicU32,
        endpoints_updated: AtomicU32,
        endpoints_deleted: AtomicU32,
        tunnel: Mutex<Tunnel>,
        refreshed_tunnels: Mutex<VecDeque<Tunnel>>,
    }

    #[async_trait]
    impl TunnelManagementApi for MockManagement {
        async fn get_tunnel(
            &self,
            _locator: &TunnelLocator,
            _options: &TunnelRequestOptions,
        ) -> HttpResult<Option<Tunnel>> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.refreshed_tunnels.lock().unwrap().pop_front();
            Ok(Some(
                next.unwrap_or_else(|| self.tunnel.lock().unwrap().clone()),
            ))
        }

        async fn create_tunnel(
            &self,
            tunnel: Tunnel,
            _options: &TunnelRequestOptions,
        ) -> HttpResult<Tunnel> {
            Ok(tunnel)
        }

        async fn update_tunnel_endpoint(
            &self,
            _tunnel: &Tunnel,
            endpoint: &TunnelEndpoint,
            _options: &TunnelRequestOptions,
        ) -> HttpResult<TunnelEndpoint> {
            self.endpoints_updated.fetch_add(1, Ordering::SeqCst);
            let mut updated = endpoint.clone();
            updated.host_relay_uri = Some("wss://relay.test/host".to_string());
            Ok(updated)
        }

        async fn delete_tunnel_endpoints(
            &self,
            _tunnel: &Tunnel,
            _endpoint_id: &str,
            _options: &TunnelRequestOptions,
        ) -> HttpResult<bool> {
            self.endpoints_deleted.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn report_event(&self, _tunnel: &Tunnel, _event: TunnelEvent) -> HttpResult<()> {
            Ok(())
        }
    }

    fn test_tunnel(ports: &[u16]) -> Tunnel {
        let mut tunnel = Tunnel {
            tunnel_id: Some("test".to_string()),
            cluster_id: Some("localhost".to_string()),
            ports: ports.iter().map(|p| TunnelPort::new(*p, "auto")).collect(),
            ..Default::default()
        };
        tunnel.set_access_token(crate::contracts::HOST, "host-token".to_string());
        tunnel
    }

    fn test_host(ports: &[u16]) -> (TunnelRelayTunnelHost, Arc<MockManagement>) {
        let management = Arc::new(MockManagement::default());
        *management.tunnel.lock().unwrap() = test_tunnel(ports);
        let host = TunnelRelayTunnelHost::new(management.clone());
        host.inner
            .state
            .assign_tunnel(test_tunnel(ports))
            .expect("expected to assign tunnel");
        host.inner.reset_ports_from_tunnel();
        (host, management)
    }

    fn test_session_record(id: &str) -> (Arc<SessionRecord>, mpsc::UnboundedReceiver<RelayMessage>)
    {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        (
            Arc::new(SessionRecord {
                session_id: id.to_string(),
                commands,
                authenticated: Arc::new(AtomicBool::new(true)),
            }),
            commands_rx,
        )
    }

    #[test]
    fn process_host_id_is_stable() {
        let first = process_host_id();
        let second = process_host_id();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn endpoint_signature_tracks_endpoint_content() {
        let tunnel = test_tunnel(&[80]);
        let base = endpoint_signature(&tunnel, "h1", &["k1".to_string()]);
        assert_eq!(base, endpoint_signature(&tunnel, "h1", &["k1".to_string()]));
        assert_ne!(base, endpoint_signature(&tunnel, "h2", &["k1".to_string()]));
        assert_ne!(base, endpoint_signature(&tunnel, "h1", &["k2".to_string()]));

        let mut ssh_tunnel = test_tunnel(&[]);
        ssh_tunnel.ports = vec![TunnelPort::new(22, crate::contracts::SSH)];
        assert_ne!(
            endpoint_signature(&ssh_tunnel, "h1", &["k1".to_string()]),
            base
        );
    }

    #[tokio::test]
    async fn endpoint_is_registered_once_per_signature() {
        let (host, management) = test_host(&[9985]);

        let first = host.inner.ensure_endpoint_registered().await.unwrap();
        let second = host.inner.ensure_endpoint_registered().await.unwrap();

        assert_eq!(first, "wss://relay.test/host");
        assert_eq!(first, second);
        assert_eq!(management.endpoints_updated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispose_deletes_the_registered_endpoint() {
        let (host, management) = test_host(&[9985]);
        host.inner.ensure_endpoint_registered().await.unwrap();

        host.dispose().await;
        host.dispose().await;

        assert_eq!(management.endpoints_deleted.load(Ordering::SeqCst), 1);
        assert_eq!(host.connection_status(), ConnectionStatus::Disconnected);
    }

    /// A displaced host sees the relay close the session with the SSH
    /// disconnect code for too many connections.
    async fn end_session_with_too_many_connections(host: &TunnelRelayTunnelHost) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut session_bytes = b"SSH-2.0-relay\r\n".to_vec();
        let mut payload = vec![1u8]; // SSH_MSG_DISCONNECT
        payload.extend_from_slice(&12u32.to_be_bytes()); // too many connections
        payload.extend_from_slice(&0u32.to_be_bytes()); // description
        payload.extend_from_slice(&0u32.to_be_bytes()); // language tag
        let padding = 4u8;
        session_bytes
            .extend_from_slice(&((1 + payload.len() + padding as usize) as u32).to_be_bytes());
        session_bytes.push(padding);
        session_bytes.extend_from_slice(&payload);
        session_bytes.extend_from_slice(&[0u8; 4]);

        let (mut relay, session) = tokio::io::duplex(4096);
        let mut stream =
            DisconnectSniffer::new(session, host.inner.sniffed_disconnect.clone());
        relay.write_all(&session_bytes).await.unwrap();
        drop(relay);
        let mut drained = Vec::new();
        stream.read_to_end(&mut drained).await.unwrap();

        host.inner.on_relay_session_ended().await;
    }

    #[tokio::test]
    async fn too_many_connections_blocks_reconnect_and_endpoint_delete() {
        let (host, management) = test_host(&[9985]);
        host.inner.ensure_endpoint_registered().await.unwrap();

        end_session_with_too_many_connections(&host).await;
        assert_eq!(
            host.disconnect_reason(),
            Some(TunnelDisconnectReason::TooManyConnections)
        );
        assert_eq!(host.connection_status(), ConnectionStatus::Disconnected);

        let err = host
            .connect(test_tunnel(&[9985]), ConnectionOptions::default(), None)
            .await
            .expect_err("expected connect to fail");
        assert!(matches!(err, TunnelError::TooManyConnections));

        host.dispose().await;
        assert_eq!(management.endpoints_deleted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unexplained_session_end_maps_to_connection_lost() {
        let (host, _management) = test_host(&[9985]);
        host.inner.options.write().unwrap().enable_reconnect = false;

        host.inner.on_relay_session_ended().await;

        assert_eq!(
            host.disconnect_reason(),
            Some(TunnelDisconnectReason::ConnectionLost)
        );
        assert_eq!(host.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn refresh_ports_adds_and_removes_forwarders() {
        let (host, management) = test_host(&[9985]);
        let (record, mut frames) = test_session_record("s1");
        host.inner.sessions.lock().unwrap().push(record.clone());

        host.inner.forward_all_ports_to_record(&record);
        assert!(matches!(
            frames.try_recv(),
            Ok(RelayMessage::PortRelayRequest { port: 9985, .. })
        ));

        management
            .refreshed_tunnels
            .lock()
            .unwrap()
            .push_back(test_tunnel(&[9985, 9986]));
        host.refresh_ports().await.unwrap();

        let forwarders = host.remote_forwarders();
        assert!(forwarders.contains_key(&("s1".to_string(), 9985)));
        assert!(forwarders.contains_key(&("s1".to_string(), 9986)));
        assert!(matches!(
            frames.try_recv(),
            Ok(RelayMessage::PortRelayRequest { port: 9986, .. })
        ));

        management
            .refreshed_tunnels
            .lock()
            .unwrap()
            .push_back(test_tunnel(&[9985]));
        host.refresh_ports().await.unwrap();

        let forwarders = host.remote_forwarders();
        assert!(forwarders.contains_key(&("s1".to_string(), 9985)));
        assert!(!forwarders.contains_key(&("s1".to_string(), 9986)));
        assert!(matches!(
            frames.try_recv(),
            Ok(RelayMessage::CancelPortRelayRequest { port: 9986, .. })
        ));
    }

    #[tokio::test]
    async fn refresh_ports_emits_progress_events() {
        let (host, _management) = test_host(&[9985]);
        let progress = Arc::new(Mutex::new(Vec::new()));
        let progress_clone = progress.clone();
        let _sub = host.events().progress.subscribe(move |p| {
            progress_clone.lock().unwrap().push(*p);
        });

        host.refresh_ports().await.unwrap();

        assert_eq!(
            &*progress.lock().unwrap(),
            &[
                TunnelProgress::StartingRefreshPorts,
                TunnelProgress::CompletedRefreshPorts
            ]
        );
    }

    #[tokio::test]
    async fn connect_rejects_second_connection_attempt() {
        let (host, _management) = test_host(&[9985]);
        host.inner
            .state
            .base
            .set_status(ConnectionStatus::Connected, None)
            .unwrap();

        let err = host
            .connect(test_tunnel(&[9985]), ConnectionOptions::default(), None)
            .await
            .expect_err("expected connect to fail");
        assert!(matches!(err, TunnelError::AlreadyConnected));
    }
}
