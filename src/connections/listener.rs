// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::net::TcpListener;

use super::errors::TunnelError;

/// How many successive port numbers are tried before giving up (or falling
/// back to an OS-assigned port).
const MAX_PORT_OFFSET: u16 = 9;

/// Listeners bound for one forwarded port: the primary socket plus an
/// IPv6/IPv4 companion when the configured address is a wildcard or loopback
/// address, so connections arrive over either protocol.
pub(crate) struct ForwardedPortListeners {
    pub listeners: Vec<TcpListener>,
    pub port: u16,
}

/// Binds a TCP listener for a forwarded port. When the preferred port is in
/// use, nearby ports are tried; when the caller permits a port change, the
/// final fallback asks the OS to pick one.
pub(crate) async fn create_tcp_listener(
    local_address: IpAddr,
    local_port: u16,
    can_change_port: bool,
) -> Result<ForwardedPortListeners, TunnelError> {
    let mut last_error: Option<io::Error> = None;

    for offset in 0..=MAX_PORT_OFFSET {
        let port = match local_port.checked_add(offset) {
            Some(port) => port,
            None => break,
        };
        match try_bind(local_address, port).await {
            Ok(listeners) => return Ok(listeners),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                log::debug!("port {} is in use, trying the next one", port);
                last_error = Some(e);
            }
            Err(e) => return Err(TunnelError::IoError(e)),
        }
        if local_port == 0 {
            break;
        }
    }

    if can_change_port {
        let listeners = try_bind(local_address, 0)
            .await
            .map_err(TunnelError::IoError)?;
        log::debug!(
            "port {} was unavailable, listening on {} instead",
            local_port,
            listeners.port
        );
        return Ok(listeners);
    }

    Err(TunnelError::IoError(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrInUse, "no port available")
    })))
}

async fn try_bind(local_address: IpAddr, port: u16) -> io::Result<ForwardedPortListeners> {
    let primary = TcpListener::bind((local_address, port)).await?;
    let port = primary.local_addr()?.port();
    let mut listeners = vec![primary];

    // When listening on a wildcard or loopback address, also listen on the
    // corresponding address of the other IP version, best-effort.
    if let Some(companion) = companion_address(local_address) {
        match TcpListener::bind((companion, port)).await {
            Ok(listener) => listeners.push(listener),
            Err(e) => log::debug!(
                "could not bind companion address {} port {}: {}",
                companion,
                port,
                e
            ),
        }
    }

    Ok(ForwardedPortListeners { listeners, port })
}

fn companion_address(local_address: IpAddr) -> Option<IpAddr> {
    match local_address {
        IpAddr::V4(v4) if v4 == Ipv4Addr::UNSPECIFIED => {
            Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        }
        IpAddr::V4(v4) if v4.is_loopback() => Some(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        IpAddr::V6(v6) if v6 == Ipv6Addr::UNSPECIFIED => {
            Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        }
        IpAddr::V6(v6) if v6.is_loopback() => Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::create_tcp_listener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn binds_requested_port() {
        let listeners = create_tcp_listener(LOCALHOST, 0, false)
            .await
            .expect("expected to bind");
        assert_ne!(listeners.port, 0);
    }

    #[tokio::test]
    async fn falls_forward_to_next_port_when_in_use() {
        let holder = create_tcp_listener(LOCALHOST, 0, false).await.unwrap();
        let taken = holder.port;
        // Ports near the top of the range can't offset past 65535.
        if taken > u16::MAX - 10 {
            return;
        }

        let listeners = create_tcp_listener(LOCALHOST, taken, false)
            .await
            .expect("expected to bind a nearby port");
        assert_ne!(listeners.port, taken);
        assert!(listeners.port > taken && listeners.port <= taken + 9);
    }

    #[tokio::test]
    async fn loopback_gets_an_ipv6_companion_when_available() {
        let listeners = create_tcp_listener(LOCALHOST, 0, false).await.unwrap();
        // The companion bind is best-effort; both outcomes are legal, but
        // there is never more than one companion.
        assert!(!listeners.listeners.is_empty() && listeners.listeners.len() <= 2);
    }

    #[tokio::test]
    async fn os_picks_port_when_range_is_exhausted() {
        // Hold ten consecutive ports so every offset fails.
        let base = create_tcp_listener(LOCALHOST, 0, false).await.unwrap();
        let start = base.port;
        if start > u16::MAX - 20 {
            return;
        }
        let mut holders = vec![base];
        for offset in 1..=9u16 {
            match tokio::net::TcpListener::bind((LOCALHOST, start + offset)).await {
                Ok(l) => holders.push(super::ForwardedPortListeners {
                    listeners: vec![l],
                    port: start + offset,
                }),
                // Held by another process; the port is still unavailable.
                Err(_) => {}
            }
        }

        let fallback = create_tcp_listener(LOCALHOST, start, true)
            .await
            .expect("expected OS-assigned fallback");
        assert!(fallback.port < start || fallback.port > start + 9);
    }
}
