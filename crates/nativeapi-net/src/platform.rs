//! Cross-platform TCP socket configuration.
//!
//! [`SocketConfig`] holds the options applied to every accepted API client
//! (TCP_NODELAY, keepalive) and to the listening socket (SO_REUSEADDR,
//! dual-stack IPv6).

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

/// TCP socket options for the API listener and its clients.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable kernel TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Probes before the kernel declares the peer dead. Default: 3.
    pub keepalive_retries: u32,
    /// Enable `SO_REUSEADDR` on the listener. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Listen backlog. Default: 128.
    pub backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: 128,
        }
    }
}

/// Apply socket configuration to an accepted [`TcpStream`].
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);

        // Retries are supported on Linux and Windows but not macOS.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Create the API [`TcpListener`].
///
/// Sets `SO_REUSEADDR`, dual-stack mode when `addr` is IPv6, and non-blocking
/// mode before binding.
pub fn create_listener(
    addr: std::net::SocketAddr,
    config: &SocketConfig,
) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
