//! TCP listener for redirected client connections
//!
//! Two redirection modes are supported:
//!
//! - **TPROXY** (`transparent` set): the socket gets `IP_TRANSPARENT` so the
//!   kernel delivers connections addressed to arbitrary destinations. The
//!   accepted stream's local address is the client's original destination.
//! - **REDIRECT** (default): an iptables `REDIRECT`/`DNAT` rule rewrites the
//!   destination to the listener, and the original one is read back from
//!   conntrack with `SO_ORIGINAL_DST`.
//!
//! A connection whose destination is the listener itself was not redirected
//! at all; relaying it would dial the proxy again, so it is refused.

use std::fmt;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// `IP_TRANSPARENT` option number (`SOL_IP` level)
pub const IP_TRANSPARENT: libc::c_int = 19;

/// `SO_ORIGINAL_DST` option number (`SOL_IP` level)
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// `IP6T_SO_ORIGINAL_DST` option number (`SOL_IPV6` level)
pub const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

/// Create, bind, and start listening on the proxy socket
///
/// Must be called inside a tokio runtime.
///
/// # Errors
///
/// Returns `ProxyError::PermissionDenied` if transparent mode lacks
/// `CAP_NET_ADMIN`, `ProxyError::BindError` if the address is unavailable,
/// and other `ProxyError`s for socket setup failures.
pub fn bind_listener(config: &ProxyConfig) -> Result<TcpListener, ProxyError> {
    let addr = config.listen;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ProxyError::SocketCreation(e.to_string()))?;

    if config.transparent {
        set_ip_transparent(&socket)?;
    }

    socket
        .set_reuse_address(true)
        .map_err(|e| ProxyError::socket_option("SO_REUSEADDR", e.to_string()))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| ProxyError::socket_option("O_NONBLOCK", e.to_string()))?;

    socket.bind(&addr.into()).map_err(|e| ProxyError::BindError {
        addr,
        reason: e.to_string(),
    })?;

    let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
    socket
        .listen(backlog)
        .map_err(|e| ProxyError::socket_option("listen", e.to_string()))?;

    let listener = TcpListener::from_std(std::net::TcpListener::from(socket))
        .map_err(|e| ProxyError::SocketCreation(e.to_string()))?;

    info!(
        "Proxy listener ready on {} (backlog={}, transparent={})",
        listener.local_addr().unwrap_or(addr),
        config.backlog,
        config.transparent
    );
    Ok(listener)
}

fn set_ip_transparent(socket: &Socket) -> Result<(), ProxyError> {
    let one: libc::c_int = 1;

    // SAFETY: the fd is owned by `socket` and `one` outlives the call
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            IP_TRANSPARENT,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return Err(ProxyError::PermissionDenied);
        }
        return Err(ProxyError::socket_option("IP_TRANSPARENT", err.to_string()));
    }

    debug!("IP_TRANSPARENT enabled on proxy listener");
    Ok(())
}

/// Original destination of an accepted connection
///
/// With `transparent` this is the stream's local address; otherwise it is
/// read from conntrack with `SO_ORIGINAL_DST`.
///
/// # Errors
///
/// Returns the I/O error from `getsockname` or `getsockopt`. In REDIRECT
/// mode a connection that went through no NAT rule fails as well, either
/// from `getsockopt` or with `InvalidInput` when conntrack reports the
/// local address unchanged.
pub fn original_destination(stream: &TcpStream, transparent: bool) -> io::Result<SocketAddr> {
    let local = stream.local_addr()?;
    if transparent {
        return Ok(local);
    }
    let destination = match local {
        SocketAddr::V4(_) => redirected_destination_v4(stream.as_raw_fd())?,
        SocketAddr::V6(_) => redirected_destination_v6(stream.as_raw_fd())?,
    };
    if destination == local {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("connection to {local} was not redirected"),
        ));
    }
    Ok(destination)
}

fn redirected_destination_v4(fd: RawFd) -> io::Result<SocketAddr> {
    // SAFETY: sockaddr_in is plain old data
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    // SAFETY: `addr` and `len` are valid for the duration of the call
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

fn redirected_destination_v6(fd: RawFd) -> io::Result<SocketAddr> {
    // SAFETY: sockaddr_in6 is plain old data
    let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;

    // SAFETY: `addr` and `len` are valid for the duration of the call
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            IP6T_SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(addr.sin6_addr.s6_addr),
        u16::from_be(addr.sin6_port),
        addr.sin6_flowinfo,
        addr.sin6_scope_id,
    )))
}

/// Whether `destination` is the listener bound at `listen`
///
/// A wildcard listener owns its port on every local address, so any
/// loopback or unspecified destination on that port counts as well as an
/// exact match.
pub fn is_listener_address(destination: SocketAddr, listen: SocketAddr) -> bool {
    if destination.port() != listen.port() {
        return false;
    }
    if listen.ip().is_unspecified() {
        return destination.ip().is_loopback() || destination.ip().is_unspecified();
    }
    destination.ip() == listen.ip()
}

/// Finds where an accepted connection was headed
pub trait DestinationLookup: Send + Sync + fmt::Debug {
    /// Destination the client originally asked for
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the destination cannot be recovered.
    fn destination(&self, stream: &TcpStream) -> io::Result<SocketAddr>;
}

/// Reads the destination from the accepted socket itself
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketDestination {
    transparent: bool,
}

impl SocketDestination {
    /// Lookup for a listener in TPROXY (`true`) or REDIRECT (`false`) mode
    #[must_use]
    pub const fn new(transparent: bool) -> Self {
        Self { transparent }
    }
}

impl From<&ProxyConfig> for SocketDestination {
    fn from(config: &ProxyConfig) -> Self {
        Self::new(config.transparent)
    }
}

impl DestinationLookup for SocketDestination {
    fn destination(&self, stream: &TcpStream) -> io::Result<SocketAddr> {
        original_destination(stream, self.transparent)
    }
}
