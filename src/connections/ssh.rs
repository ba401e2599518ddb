// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use russh_keys::PublicKeyBase64;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

/// Base channel window size for relay sessions. The relay multiplexes many
/// port streams over one session, so windows are kept large to avoid
/// channel congestion.
pub(crate) const SESSION_WINDOW_SIZE: u32 = 1024 * 1024 * 64;

/// Configuration for the secure-channel session over the relay websocket.
/// The websocket is already TLS-authenticated and the relay pre-authorizes
/// peers with tunnel access tokens, so the session itself uses the "none"
/// key exchange and no additional encryption.
pub(crate) fn anonymous_relay_config(window_multiplier: u32) -> Arc<russh::client::Config> {
    let config = russh::client::Config {
        anonymous: true,
        window_size: SESSION_WINDOW_SIZE.saturating_mul(window_multiplier),
        preferred: russh::Preferred {
            kex: &[russh::kex::NONE],
            key: &[russh_keys::key::NONE],
            cipher: &[russh::cipher::NONE],
            mac: russh::Preferred::DEFAULT.mac,
            compression: &["none"],
        },
        ..Default::default()
    };
    Arc::new(config)
}

/// Configuration for encrypted client sessions: the v1 client's session with
/// the host, and nested end-to-end encrypted streams in v2. These use a real
/// key exchange, and the host's key is checked by a `ServerKeyPolicy`.
pub(crate) fn encrypted_client_config() -> Arc<russh::client::Config> {
    let config = russh::client::Config {
        window_size: SESSION_WINDOW_SIZE,
        ..Default::default()
    };
    Arc::new(config)
}

/// Configuration for server sessions the host runs for its clients.
pub(crate) fn host_server_config(
    keypair: russh_keys::key::KeyPair,
    window_multiplier: u32,
) -> Arc<russh::server::Config> {
    let config = russh::server::Config {
        connection_timeout: None,
        auth_rejection_time: Duration::from_secs(5),
        keys: vec![keypair],
        window_size: SESSION_WINDOW_SIZE.saturating_mul(window_multiplier),
        preferred: russh::Preferred::COMPRESSED,
        limits: russh::Limits {
            rekey_read_limit: usize::MAX,
            rekey_time_limit: Duration::MAX,
            rekey_write_limit: usize::MAX,
        },
        ..Default::default()
    };
    Arc::new(config)
}

/// Generates the host's key pair. Clients authenticate the host against the
/// base64 public key published on the tunnel endpoint.
pub(crate) fn generate_host_keypair() -> russh_keys::key::KeyPair {
    russh_keys::key::KeyPair::generate_rsa(2048, russh_keys::key::SignatureHash::SHA2_512)
        .expect("expected to generate rsa keypair")
}

/// Base64 form of the public half of a key pair, as published on tunnel
/// endpoints.
pub(crate) fn host_public_key_base64(keypair: &russh_keys::key::KeyPair) -> String {
    keypair.public_key_base64()
}

/// Decides whether a server's public key is trusted. The client verifies the
/// host's key against the tunnel endpoint (refreshing the tunnel once if the
/// key is unknown); relay-terminated sessions accept any key because the
/// websocket TLS layer already authenticated the relay.
#[async_trait]
pub(crate) trait ServerKeyPolicy: Send + Sync {
    async fn check_server_key(&self, key_base64: String) -> bool;
}

pub(crate) struct AcceptAllServerKeys;

#[async_trait]
impl ServerKeyPolicy for AcceptAllServerKeys {
    async fn check_server_key(&self, _key_base64: String) -> bool {
        true
    }
}

/// Channel types the relay or a host opens toward this side of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RelayChannelKind {
    /// A per-client sub-session stream (v1 host side).
    ClientSshSessionStream,
    /// A per-connection forwarded port stream (v2 host side).
    ForwardedPort,
}

impl RelayChannelKind {
    fn from_channel_type(channel_type: &[u8]) -> Option<Self> {
        match channel_type {
            b"client-ssh-session-stream" => Some(RelayChannelKind::ClientSshSessionStream),
            b"forwarded-tcpip" => Some(RelayChannelKind::ForwardedPort),
            _ => None,
        }
    }
}

/// Type sent from the session handler back to the processing queue. This can
/// be a channel starting or stopping, or data on a channel.
#[derive(Debug)]
pub(crate) enum ChannelOp {
    Open(russh::ChannelId, RelayChannelKind),
    Close(russh::ChannelId),
    Data(russh::ChannelId, Vec<u8>),
}

/// Handler for the client side of relay secure-channel sessions. Channel
/// events are forwarded to the session's processing queue; server keys are
/// checked by the configured policy.
pub(crate) struct RelaySessionHandler {
    sender: mpsc::UnboundedSender<ChannelOp>,
    key_policy: Arc<dyn ServerKeyPolicy>,
    accepted_channel_kinds: &'static [RelayChannelKind],
}

impl RelaySessionHandler {
    pub fn new(
        key_policy: Arc<dyn ServerKeyPolicy>,
        accepted_channel_kinds: &'static [RelayChannelKind],
    ) -> (Self, mpsc::UnboundedReceiver<ChannelOp>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            RelaySessionHandler {
                sender,
                key_policy,
                accepted_channel_kinds,
            },
            receiver,
        )
    }
}

impl russh::client::Handler for RelaySessionHandler {
    type Error = russh::Error;

    async fn check_server_key(
        self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<(Self, bool), Self::Error> {
        let key_base64 = server_public_key.public_key_base64();
        let policy = self.key_policy.clone();
        let trusted = policy.check_server_key(key_base64).await;
        if !trusted {
            log::warn!("rejecting untrusted server public key");
        }
        Ok((self, trusted))
    }

    fn server_channel_handle_unknown(
        &self,
        channel: russh::ChannelId,
        channel_type: &[u8],
    ) -> bool {
        match RelayChannelKind::from_channel_type(channel_type) {
            Some(kind) if self.accepted_channel_kinds.contains(&kind) => {
                self.sender.send(ChannelOp::Open(channel, kind)).ok();
                true
            }
            _ => false,
        }
    }

    async fn channel_close(
        self,
        channel: russh::ChannelId,
        session: russh::client::Session,
    ) -> Result<(Self, russh::client::Session), Self::Error> {
        self.sender.send(ChannelOp::Close(channel)).ok();
        Ok((self, session))
    }

    async fn data(
        self,
        channel: russh::ChannelId,
        data: &[u8],
        session: russh::client::Session,
    ) -> Result<(Self, russh::client::Session), Self::Error> {
        // Copy out of the frame buffer; it may be recycled as soon as this
        // callback returns.
        self.sender
            .send(ChannelOp::Data(channel, data.to_vec()))
            .ok();
        Ok((self, session))
    }
}

/// Establishes the client side of a secure-channel session over an arbitrary
/// stream.
pub(crate) async fn connect_session_stream<S>(
    config: Arc<russh::client::Config>,
    stream: S,
    key_policy: Arc<dyn ServerKeyPolicy>,
    accepted_channel_kinds: &'static [RelayChannelKind],
) -> Result<
    (
        russh::client::Handle<RelaySessionHandler>,
        mpsc::UnboundedReceiver<ChannelOp>,
    ),
    russh::Error,
>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (handler, receiver) = RelaySessionHandler::new(key_policy, accepted_channel_kinds);
    let handle = russh::client::connect_stream(config, stream, handler).await?;
    Ok((handle, receiver))
}
