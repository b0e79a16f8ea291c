//! Event families published on the bus

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Allocate the next id
            #[must_use]
            pub fn next() -> Self {
                static NEXT: AtomicU64 = AtomicU64::new(1);
                Self(NEXT.fetch_add(1, Ordering::Relaxed))
            }

            /// Numeric value
            #[must_use]
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identity of a proxy or adapter socket
    SocketId,
    "socket"
);
define_id!(
    /// Identity of a tunnel
    TunnelId,
    "tunnel"
);
define_id!(
    /// Identity of a proxy server
    ServerId,
    "server"
);

/// Events of the remote-facing socket
#[derive(Debug, Clone)]
pub enum AdapterSocketEvent {
    SocketOpened { socket: SocketId, host: String, port: u16 },
    DisconnectCalled { socket: SocketId },
    ForceDisconnectCalled { socket: SocketId },
    Disconnected { socket: SocketId },
    ReadData { socket: SocketId, len: usize },
    /// `len` is `None` for writes that carried no payload
    WroteData { socket: SocketId, len: Option<usize> },
    Connected { socket: SocketId },
    ReadyForForward { socket: SocketId },
    ErrorOccurred { socket: SocketId, error: Arc<io::Error> },
}

impl fmt::Display for AdapterSocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketOpened { socket, host, port } => {
                write!(f, "Adapter {socket} started connecting to {host}:{port}")
            }
            Self::DisconnectCalled { socket } => write!(f, "Adapter {socket} asked to disconnect"),
            Self::ForceDisconnectCalled { socket } => {
                write!(f, "Adapter {socket} asked to disconnect immediately")
            }
            Self::Disconnected { socket } => write!(f, "Adapter {socket} disconnected"),
            Self::ReadData { socket, len } => write!(f, "Adapter {socket} read {len} bytes"),
            Self::WroteData {
                socket,
                len: Some(len),
            } => write!(f, "Adapter {socket} wrote {len} bytes"),
            Self::WroteData { socket, len: None } => write!(f, "Adapter {socket} wrote data"),
            Self::Connected { socket } => write!(f, "Adapter {socket} connected to remote"),
            Self::ReadyForForward { socket } => write!(f, "Adapter {socket} is ready to forward"),
            Self::ErrorOccurred { socket, error } => {
                write!(f, "Adapter {socket} encountered an error: {error}")
            }
        }
    }
}

/// Events of the client-facing socket
#[derive(Debug, Clone)]
pub enum ProxySocketEvent {
    SocketOpened { socket: SocketId },
    DisconnectCalled { socket: SocketId },
    ForceDisconnectCalled { socket: SocketId },
    Disconnected { socket: SocketId },
    ReceivedRequest { socket: SocketId, host: String, port: u16 },
    ReadData { socket: SocketId, len: usize },
    WroteData { socket: SocketId, len: Option<usize> },
    AskedToRespondTo { socket: SocketId, adapter: SocketId },
    ReadyForForward { socket: SocketId },
    ErrorOccurred { socket: SocketId, error: Arc<io::Error> },
}

impl fmt::Display for ProxySocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketOpened { socket } => write!(f, "Proxy socket {socket} opened"),
            Self::DisconnectCalled { socket } => {
                write!(f, "Proxy socket {socket} asked to disconnect")
            }
            Self::ForceDisconnectCalled { socket } => {
                write!(f, "Proxy socket {socket} asked to disconnect immediately")
            }
            Self::Disconnected { socket } => write!(f, "Proxy socket {socket} disconnected"),
            Self::ReceivedRequest { socket, host, port } => {
                write!(f, "Proxy socket {socket} received request for {host}:{port}")
            }
            Self::ReadData { socket, len } => write!(f, "Proxy socket {socket} read {len} bytes"),
            Self::WroteData {
                socket,
                len: Some(len),
            } => write!(f, "Proxy socket {socket} wrote {len} bytes"),
            Self::WroteData { socket, len: None } => write!(f, "Proxy socket {socket} wrote data"),
            Self::AskedToRespondTo { socket, adapter } => {
                write!(f, "Proxy socket {socket} asked to respond to {adapter}")
            }
            Self::ReadyForForward { socket } => {
                write!(f, "Proxy socket {socket} is ready to forward")
            }
            Self::ErrorOccurred { socket, error } => {
                write!(f, "Proxy socket {socket} encountered an error: {error}")
            }
        }
    }
}

/// Tunnel lifecycle and relay events
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Opened { tunnel: TunnelId },
    CloseCalled { tunnel: TunnelId },
    ForceCloseCalled { tunnel: TunnelId },
    ReceivedRequest { tunnel: TunnelId, host: String, port: u16 },
    /// `count` is how many sides are ready after this signal
    ReceivedReadySignal { tunnel: TunnelId, count: u8 },
    ProxySocketReadData { tunnel: TunnelId, len: usize },
    ProxySocketWroteData { tunnel: TunnelId, len: Option<usize> },
    AdapterSocketReadData { tunnel: TunnelId, len: usize },
    AdapterSocketWroteData { tunnel: TunnelId, len: Option<usize> },
    ConnectedToRemote { tunnel: TunnelId, adapter: SocketId },
    UpdatingAdapterSocket { tunnel: TunnelId, from: SocketId, to: SocketId },
    Closed { tunnel: TunnelId },
}

impl fmt::Display for TunnelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened { tunnel } => write!(f, "{tunnel} opened"),
            Self::CloseCalled { tunnel } => write!(f, "{tunnel} asked to close"),
            Self::ForceCloseCalled { tunnel } => write!(f, "{tunnel} asked to close immediately"),
            Self::ReceivedRequest { tunnel, host, port } => {
                write!(f, "{tunnel} received request for {host}:{port}")
            }
            Self::ReceivedReadySignal { tunnel, count } => {
                write!(f, "{tunnel} received ready signal ({count}/2)")
            }
            Self::ProxySocketReadData { tunnel, len } => {
                write!(f, "{tunnel} read {len} bytes from proxy socket")
            }
            Self::ProxySocketWroteData { tunnel, len } => {
                write!(f, "{tunnel} wrote {} bytes to proxy socket", len.unwrap_or(0))
            }
            Self::AdapterSocketReadData { tunnel, len } => {
                write!(f, "{tunnel} read {len} bytes from adapter")
            }
            Self::AdapterSocketWroteData { tunnel, len } => {
                write!(f, "{tunnel} wrote {} bytes to adapter", len.unwrap_or(0))
            }
            Self::ConnectedToRemote { tunnel, adapter } => {
                write!(f, "{tunnel} connected to remote via {adapter}")
            }
            Self::UpdatingAdapterSocket { tunnel, from, to } => {
                write!(f, "{tunnel} replacing adapter {from} with {to}")
            }
            Self::Closed { tunnel } => write!(f, "{tunnel} closed"),
        }
    }
}

/// Events of the accepting server
#[derive(Debug, Clone)]
pub enum ProxyServerEvent {
    Started { server: ServerId, addr: SocketAddr },
    NewSocketAccepted { server: ServerId, peer: SocketAddr },
    TunnelClosed { server: ServerId, tunnel: TunnelId },
    Stopped { server: ServerId },
}

impl fmt::Display for ProxyServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { server, addr } => write!(f, "Proxy {server} listening on {addr}"),
            Self::NewSocketAccepted { server, peer } => {
                write!(f, "Proxy {server} accepted connection from {peer}")
            }
            Self::TunnelClosed { server, tunnel } => write!(f, "Proxy {server}: {tunnel} closed"),
            Self::Stopped { server } => write!(f, "Proxy {server} stopped"),
        }
    }
}

/// Any event carried by the bus
#[derive(Debug, Clone)]
pub enum Event {
    AdapterSocket(AdapterSocketEvent),
    ProxySocket(ProxySocketEvent),
    Tunnel(TunnelEvent),
    ProxyServer(ProxyServerEvent),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdapterSocket(event) => event.fmt(f),
            Self::ProxySocket(event) => event.fmt(f),
            Self::Tunnel(event) => event.fmt(f),
            Self::ProxyServer(event) => event.fmt(f),
        }
    }
}

impl From<AdapterSocketEvent> for Event {
    fn from(event: AdapterSocketEvent) -> Self {
        Self::AdapterSocket(event)
    }
}

impl From<ProxySocketEvent> for Event {
    fn from(event: ProxySocketEvent) -> Self {
        Self::ProxySocket(event)
    }
}

impl From<TunnelEvent> for Event {
    fn from(event: TunnelEvent) -> Self {
        Self::Tunnel(event)
    }
}

impl From<ProxyServerEvent> for Event {
    fn from(event: ProxyServerEvent) -> Self {
        Self::ProxyServer(event)
    }
}
