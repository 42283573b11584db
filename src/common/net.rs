//! Network utility functions
//!
//! This module provides utility functions for network operations.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use tokio::net::TcpListener;

use super::error::{TapError, Result};

/// Listen backlog used for both listeners
const LISTEN_BACKLOG: i32 = 1024;

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
                Err(TapError::Config(format!("Failed to parse address: {}", addr)))
            }
        }
        Err(e) => Err(TapError::Config(format!("Failed to parse address {}: {}", addr, e))),
    }
}

/// Bind a TCP listener with `SO_REUSEADDR` set
///
/// Restarting the tap right after a previous run otherwise fails on sockets
/// still in `TIME_WAIT`.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener = TcpListener::from_std(socket.into())?;
    Ok(listener)
}
