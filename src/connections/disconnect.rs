// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Extraction of the SSH disconnect reason from a relay session stream.
//!
//! The secure-channel library surfaces a peer's SSH_MSG_DISCONNECT as a
//! generic session error, dropping the reason code. The relay uses that
//! code to tell a displaced host it was dropped in favor of another host
//! (too many connections), and the host must react differently to that
//! reason, so the raw stream is watched for the disconnect packet before
//! the library consumes it.
//!
//! Relay sessions negotiate the "none" cipher over the TLS websocket, so
//! SSH packet framing on this stream is readable: after the version
//! exchange, each packet is a 4-byte length, a padding-length byte, and the
//! payload whose first byte is the message type. If the framing stops
//! making sense (a session that negotiated a real cipher, or a corrupt
//! length), watching is disabled and session loss keeps the generic
//! connection-lost reason.

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::Poll,
};

use tokio::io::{AsyncRead, AsyncWrite};

use super::status::TunnelDisconnectReason;

const SSH_MSG_DISCONNECT: u8 = 1;

// Disconnect reason codes from the SSH transport protocol.
const SSH_DISCONNECT_PROTOCOL_ERROR: u32 = 2;
const SSH_DISCONNECT_SERVICE_NOT_AVAILABLE: u32 = 7;
const SSH_DISCONNECT_BY_APPLICATION: u32 = 11;
const SSH_DISCONNECT_TOO_MANY_CONNECTIONS: u32 = 12;
const SSH_DISCONNECT_AUTH_CANCELLED_BY_USER: u32 = 13;

/// Packet lengths above this mean the stream is not carrying plaintext SSH
/// framing after all.
const MAX_PACKET_LENGTH: u32 = 1024 * 1024;

fn reason_from_code(code: u32) -> TunnelDisconnectReason {
    match code {
        SSH_DISCONNECT_TOO_MANY_CONNECTIONS => TunnelDisconnectReason::TooManyConnections,
        SSH_DISCONNECT_BY_APPLICATION => TunnelDisconnectReason::ByApplication,
        SSH_DISCONNECT_PROTOCOL_ERROR => TunnelDisconnectReason::ProtocolError,
        SSH_DISCONNECT_SERVICE_NOT_AVAILABLE => TunnelDisconnectReason::ServiceNotAvailable,
        SSH_DISCONNECT_AUTH_CANCELLED_BY_USER => TunnelDisconnectReason::AuthCancelledByUser,
        _ => TunnelDisconnectReason::ConnectionLost,
    }
}

/// Shared slot where a sniffed disconnect reason is published. The first
/// reason seen on a session wins.
#[derive(Clone, Default)]
pub(crate) struct DisconnectReasonCell(Arc<Mutex<Option<TunnelDisconnectReason>>>);

impl DisconnectReasonCell {
    pub fn take(&self) -> Option<TunnelDisconnectReason> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = None;
        }
    }

    fn publish(&self, reason: TunnelDisconnectReason) {
        if let Ok(mut slot) = self.0.lock() {
            slot.get_or_insert(reason);
        }
    }
}

enum SniffState {
    /// Waiting for the end of the "SSH-2.0-..." identification line.
    VersionExchange,
    /// Collecting the packet length, padding length, and message type.
    PacketHeader { header: [u8; 6], filled: usize },
    /// Collecting the reason code of a disconnect packet.
    DisconnectReason {
        code: [u8; 4],
        filled: usize,
        remaining: usize,
    },
    /// Consuming the rest of an uninteresting packet.
    SkipPacket { remaining: usize },
    /// The framing was unreadable; pass bytes through untouched.
    Disabled,
}

/// Read/write passthrough that watches the read side of a relay session for
/// an SSH disconnect packet and publishes its reason.
pub(crate) struct DisconnectSniffer<S> {
    inner: S,
    state: SniffState,
    reason: DisconnectReasonCell,
}

impl<S> DisconnectSniffer<S> {
    pub fn new(inner: S, reason: DisconnectReasonCell) -> Self {
        DisconnectSniffer {
            inner,
            state: SniffState::VersionExchange,
            reason,
        }
    }

    fn scan(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            match &mut self.state {
                SniffState::Disabled => return,
                SniffState::VersionExchange => {
                    match bytes.iter().position(|b| *b == b'\n') {
                        Some(end) => {
                            bytes = &bytes[end + 1..];
                            self.state = SniffState::PacketHeader {
                                header: [0; 6],
                                filled: 0,
                            };
                        }
                        None => return,
                    }
                }
                SniffState::PacketHeader { header, filled } => {
                    let n = (6 - *filled).min(bytes.len());
                    header[*filled..*filled + n].copy_from_slice(&bytes[..n]);
                    *filled += n;
                    bytes = &bytes[n..];
                    if *filled < 6 {
                        return;
                    }

                    let length =
                        u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
                    let message_type = header[5];
                    if length < 2 || length > MAX_PACKET_LENGTH {
                        log::debug!("session stream framing is unreadable; not watching for a disconnect reason");
                        self.state = SniffState::Disabled;
                        return;
                    }
                    // The padding-length byte and message type are part of
                    // the counted length.
                    let remaining = length as usize - 2;
                    self.state = if message_type == SSH_MSG_DISCONNECT && remaining >= 4 {
                        SniffState::DisconnectReason {
                            code: [0; 4],
                            filled: 0,
                            remaining,
                        }
                    } else if remaining == 0 {
                        SniffState::PacketHeader {
                            header: [0; 6],
                            filled: 0,
                        }
                    } else {
                        SniffState::SkipPacket { remaining }
                    };
                }
                SniffState::DisconnectReason {
                    code,
                    filled,
                    remaining,
                } => {
                    let n = (4 - *filled).min(bytes.len());
                    code[*filled..*filled + n].copy_from_slice(&bytes[..n]);
                    *filled += n;
                    *remaining -= n;
                    bytes = &bytes[n..];
                    if *filled < 4 {
                        return;
                    }

                    let code = u32::from_be_bytes(*code);
                    let reason = reason_from_code(code);
                    log::debug!("session peer sent disconnect (code {}): {}", code, reason);
                    self.reason.publish(reason);
                    let remaining = *remaining;
                    self.state = if remaining == 0 {
                        SniffState::PacketHeader {
                            header: [0; 6],
                            filled: 0,
                        }
                    } else {
                        SniffState::SkipPacket { remaining }
                    };
                }
                SniffState::SkipPacket { remaining } => {
                    let n = (*remaining).min(bytes.len());
                    *remaining -= n;
                    bytes = &bytes[n..];
                    if *remaining == 0 {
                        self.state = SniffState::PacketHeader {
                            header: [0; 6],
                            filled: 0,
                        };
                    }
                }
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DisconnectSniffer<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let received = &buf.filled()[before..];
                if !received.is_empty() {
                    me.scan(received);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DisconnectSniffer<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::connections::TunnelDisconnectReason;

    use super::{DisconnectReasonCell, DisconnectSniffer};

    /// Builds a plaintext SSH packet around the payload.
    fn ssh_packet(payload: &[u8]) -> Vec<u8> {
        let padding = 4u8;
        let length = (1 + payload.len() + padding as usize) as u32;
        let mut packet = Vec::new();
        packet.extend_from_slice(&length.to_be_bytes());
        packet.push(padding);
        packet.extend_from_slice(payload);
        packet.extend_from_slice(&vec![0u8; padding as usize]);
        packet
    }

    fn disconnect_payload(code: u32) -> Vec<u8> {
        let mut payload = vec![1u8];
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes()); // description
        payload.extend_from_slice(&0u32.to_be_bytes()); // language tag
        payload
    }

    async fn sniff(stream_bytes: &[u8], chunk: usize) -> Option<TunnelDisconnectReason> {
        let cell = DisconnectReasonCell::default();
        let (mut near, far) = tokio::io::duplex(4096);
        let mut sniffer = DisconnectSniffer::new(far, cell.clone());

        for chunk in stream_bytes.chunks(chunk) {
            near.write_all(chunk).await.unwrap();
        }
        drop(near);

        let mut sink = Vec::new();
        sniffer.read_to_end(&mut sink).await.unwrap();
        assert_eq!(sink, stream_bytes);
        cell.take()
    }

    #[tokio::test]
    async fn captures_too_many_connections_reason() {
        let mut bytes = b"SSH-2.0-relay\r\n".to_vec();
        bytes.extend(ssh_packet(&[20, 9, 9, 9])); // an uninteresting packet
        bytes.extend(ssh_packet(&disconnect_payload(12)));

        // Parsing is incremental; chunk boundaries must not matter.
        for chunk in [1, 3, 7, 4096] {
            assert_eq!(
                sniff(&bytes, chunk).await,
                Some(TunnelDisconnectReason::TooManyConnections)
            );
        }
    }

    #[tokio::test]
    async fn maps_other_disconnect_codes() {
        let mut bytes = b"SSH-2.0-relay\r\n".to_vec();
        bytes.extend(ssh_packet(&disconnect_payload(11)));
        assert_eq!(
            sniff(&bytes, 4096).await,
            Some(TunnelDisconnectReason::ByApplication)
        );

        let mut bytes = b"SSH-2.0-relay\r\n".to_vec();
        bytes.extend(ssh_packet(&disconnect_payload(999)));
        assert_eq!(
            sniff(&bytes, 4096).await,
            Some(TunnelDisconnectReason::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn unreadable_framing_disables_watching() {
        let mut bytes = b"SSH-2.0-relay\r\n".to_vec();
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&[0, 1]);
        bytes.extend(ssh_packet(&disconnect_payload(12)));

        assert_eq!(sniff(&bytes, 4096).await, None);
    }

    #[tokio::test]
    async fn no_disconnect_packet_yields_no_reason() {
        let mut bytes = b"SSH-2.0-relay\r\n".to_vec();
        bytes.extend(ssh_packet(&[80, 0, 0, 0, 1]));
        assert_eq!(sniff(&bytes, 4096).await, None);
    }
}
