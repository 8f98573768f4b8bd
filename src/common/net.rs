//! Network utility functions
//!
//! This module provides utility functions for network operations.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use log::debug;
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;

use super::error::{ProxyError, Result};

/// Parse a socket address
///
/// # Arguments
///
/// * `addr` - The address string to parse
///
/// # Returns
///
/// The parsed `SocketAddr`
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    // Try direct parsing first
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return Ok(socket_addr);
    }

    // Try using ToSocketAddrs trait
    match addr.to_socket_addrs() {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.next() {
                Ok(addr)
            } else {
                Err(ProxyError::Config(format!("Failed to parse address: {}", addr)))
            }
        }
        Err(e) => Err(ProxyError::Config(format!("Failed to parse address {}: {}", addr, e))),
    }
}

/// Resolve `host:port` without blocking the runtime
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = IpAddr::from_str(host) {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| ProxyError::Config(format!("No address found for {}:{}", host, port)))
}

/// Bind a listener with `SO_REUSEADDR` so a stopped proxy can be restarted at once
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let listener = TcpListener::from_std(socket.into())?;
    debug!("Bound listener on {}", addr);
    Ok(listener)
}

/// Open the outbound leg of a connection
///
/// # Arguments
///
/// * `target` - Resolved upstream address
/// * `interface` - Optional local address to bind before connecting
/// * `connect_timeout` - Deadline for the whole connect
pub async fn connect(
    target: SocketAddr,
    interface: Option<IpAddr>,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let socket = if target.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    if let Some(ip) = interface {
        socket.bind(SocketAddr::new(ip, 0))?;
    }

    let stream = timeout(connect_timeout, socket.connect(target))
        .await
        .map_err(|_| ProxyError::Timeout(format!("connect to {}", target)))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}
