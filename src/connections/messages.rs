// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Wire messages exchanged over relay control and port channels.
//!
//! These extend the port-forwarding framing of the secure channel: a
//! one-byte message type followed by SSH-style fields (big-endian u32
//! lengths/numbers, length-prefixed UTF-8 strings, one-byte booleans). Port
//! relay requests flow on a per-session control channel; the connect
//! request/response pair is exchanged as the first frames on a newly-opened
//! port channel.

use super::errors::TunnelError;

const MSG_PORT_RELAY_REQUEST: u8 = 1;
const MSG_CANCEL_PORT_RELAY_REQUEST: u8 = 2;
const MSG_PORT_RELAY_CONNECT_REQUEST: u8 = 3;
const MSG_PORT_RELAY_CONNECT_RESPONSE: u8 = 4;
const MSG_REFRESH_PORTS_REQUEST: u8 = 5;
const MSG_REFRESH_PORTS_RESPONSE: u8 = 6;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RelayMessage {
    /// Host requests the relay (and through it, clients) to forward a port.
    /// The access token authorizes the forward.
    PortRelayRequest {
        address: String,
        port: u32,
        access_token: String,
    },

    /// Host withdraws a previously forwarded port.
    CancelPortRelayRequest { address: String, port: u32 },

    /// First frame on a port channel: the connecting side names the target
    /// port, presents its access token (possibly empty), and asks for
    /// end-to-end encryption.
    PortRelayConnectRequest {
        port: u32,
        access_token: String,
        is_e2e_encryption_requested: bool,
    },

    /// Reply to `PortRelayConnectRequest`, confirming the channel and whether
    /// end-to-end encryption is enabled on it.
    PortRelayConnectResponse { is_e2e_encryption_enabled: bool },

    /// Client asks the host to re-read the tunnel's ports from the
    /// management service.
    RefreshPortsRequest { want_reply: bool },

    /// Host reply to `RefreshPortsRequest`.
    RefreshPortsResponse { succeeded: bool },
}

impl RelayMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            RelayMessage::PortRelayRequest {
                address,
                port,
                access_token,
            } => {
                buf.push(MSG_PORT_RELAY_REQUEST);
                put_string(&mut buf, address);
                put_u32(&mut buf, *port);
                put_string(&mut buf, access_token);
            }
            RelayMessage::CancelPortRelayRequest { address, port } => {
                buf.push(MSG_CANCEL_PORT_RELAY_REQUEST);
                put_string(&mut buf, address);
                put_u32(&mut buf, *port);
            }
            RelayMessage::PortRelayConnectRequest {
                port,
                access_token,
                is_e2e_encryption_requested,
            } => {
                buf.push(MSG_PORT_RELAY_CONNECT_REQUEST);
                put_u32(&mut buf, *port);
                put_string(&mut buf, access_token);
                put_bool(&mut buf, *is_e2e_encryption_requested);
            }
            RelayMessage::PortRelayConnectResponse {
                is_e2e_encryption_enabled,
            } => {
                buf.push(MSG_PORT_RELAY_CONNECT_RESPONSE);
                put_bool(&mut buf, *is_e2e_encryption_enabled);
            }
            RelayMessage::RefreshPortsRequest { want_reply } => {
                buf.push(MSG_REFRESH_PORTS_REQUEST);
                put_bool(&mut buf, *want_reply);
            }
            RelayMessage::RefreshPortsResponse { succeeded } => {
                buf.push(MSG_REFRESH_PORTS_RESPONSE);
                put_bool(&mut buf, *succeeded);
            }
        }
        buf
    }

    pub fn decode(frame: &[u8]) -> Result<Self, TunnelError> {
        let mut reader = Reader::new(frame);
        let message_type = reader.read_u8()?;
        let message = match message_type {
            MSG_PORT_RELAY_REQUEST => RelayMessage::PortRelayRequest {
                address: reader.read_string()?,
                port: reader.read_u32()?,
                access_token: reader.read_string()?,
            },
            MSG_CANCEL_PORT_RELAY_REQUEST => RelayMessage::CancelPortRelayRequest {
                address: reader.read_string()?,
                port: reader.read_u32()?,
            },
            MSG_PORT_RELAY_CONNECT_REQUEST => RelayMessage::PortRelayConnectRequest {
                port: reader.read_u32()?,
                access_token: reader.read_string()?,
                is_e2e_encryption_requested: reader.read_bool()?,
            },
            MSG_PORT_RELAY_CONNECT_RESPONSE => RelayMessage::PortRelayConnectResponse {
                is_e2e_encryption_enabled: reader.read_bool()?,
            },
            MSG_REFRESH_PORTS_REQUEST => RelayMessage::RefreshPortsRequest {
                want_reply: reader.read_bool()?,
            },
            MSG_REFRESH_PORTS_RESPONSE => RelayMessage::RefreshPortsResponse {
                succeeded: reader.read_bool()?,
            },
            other => {
                return Err(TunnelError::ProtocolError(format!(
                    "unknown relay message type {}",
                    other
                )))
            }
        };
        reader.expect_end()?;
        Ok(message)
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, offset: 0 }
    }

    fn truncated() -> TunnelError {
        TunnelError::ProtocolError("truncated relay message".to_string())
    }

    fn read_u8(&mut self) -> Result<u8, TunnelError> {
        let value = *self.data.get(self.offset).ok_or_else(Self::truncated)?;
        self.offset += 1;
        Ok(value)
    }

    fn read_bool(&mut self) -> Result<bool, TunnelError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_u32(&mut self) -> Result<u32, TunnelError> {
        let end = self.offset.checked_add(4).ok_or_else(Self::truncated)?;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or_else(Self::truncated)?;
        self.offset = end;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self) -> Result<String, TunnelError> {
        let len = self.read_u32()? as usize;
        let end = self.offset.checked_add(len).ok_or_else(Self::truncated)?;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or_else(Self::truncated)?;
        self.offset = end;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| TunnelError::ProtocolError("relay message string is not utf-8".to_string()))
    }

    fn expect_end(&self) -> Result<(), TunnelError> {
        if self.offset == self.data.len() {
            Ok(())
        } else {
            Err(TunnelError::ProtocolError(
                "unexpected trailing bytes in relay message".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_relay_request_wire_format() {
        let message = RelayMessage::PortRelayRequest {
            address: "127.0.0.1".to_string(),
            port: 9985,
            access_token: "tk".to_string(),
        };

        let encoded = message.encode();
        let mut expected = vec![1u8];
        expected.extend_from_slice(&9u32.to_be_bytes());
        expected.extend_from_slice(b"127.0.0.1");
        expected.extend_from_slice(&9985u32.to_be_bytes());
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(b"tk");
        assert_eq!(encoded, expected);

        assert_eq!(RelayMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn connect_request_allows_empty_token() {
        let message = RelayMessage::PortRelayConnectRequest {
            port: 2000,
            access_token: String::new(),
            is_e2e_encryption_requested: true,
        };

        let encoded = message.encode();
        assert_eq!(encoded[0], 3);
        assert_eq!(*encoded.last().unwrap(), 1);
        assert_eq!(RelayMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn connect_response_carries_e2e_flag() {
        let enabled = RelayMessage::PortRelayConnectResponse {
            is_e2e_encryption_enabled: true,
        };
        assert_eq!(enabled.encode(), vec![4u8, 1u8]);

        let disabled = RelayMessage::PortRelayConnectResponse {
            is_e2e_encryption_enabled: false,
        };
        assert_eq!(disabled.encode(), vec![4u8, 0u8]);
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        assert!(RelayMessage::decode(&[]).is_err());
        assert!(RelayMessage::decode(&[99]).is_err());
        // Truncated string length.
        assert!(RelayMessage::decode(&[1, 0, 0, 0, 5, b'a']).is_err());
        // Trailing garbage.
        let mut frame = RelayMessage::RefreshPortsResponse { succeeded: true }.encode();
        frame.push(0);
        assert!(RelayMessage::decode(&frame).is_err());
    }
}
