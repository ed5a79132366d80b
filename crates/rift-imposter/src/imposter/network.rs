//! Listener setup for imposter ports.

use super::types::ImposterError;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Create a TCP listener with SO_REUSEADDR so a deleted imposter's port can be
/// bound again while old connections sit in TIME_WAIT.
pub fn create_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;
    socket.listen(1024)?; // Backlog size

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Resolve `host` and bind `port` on the first address that works.
pub async fn bind(host: &str, port: u16) -> Result<TcpListener, ImposterError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ImposterError::BindError(port, format!("cannot resolve {host}: {e}")))?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match create_listener(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = Some(e),
        }
    }
    Err(match last_error {
        Some(e) => bind_error(port, e),
        None => ImposterError::BindError(port, format!("{host} has no addresses")),
    })
}

fn bind_error(port: u16, error: std::io::Error) -> ImposterError {
    match error.kind() {
        ErrorKind::AddrInUse => ImposterError::PortInUse(port),
        ErrorKind::PermissionDenied => ImposterError::InsufficientAccess(port),
        _ => ImposterError::BindError(port, error.to_string()),
    }
}
