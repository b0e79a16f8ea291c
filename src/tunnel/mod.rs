//! Tunnel relay engine
//!
//! A [`Tunnel`] pairs a client-facing proxy socket with a remote-facing
//! adapter socket and relays bytes between them once both sides report ready.
//!
//! # Submodules
//!
//! - [`relay`]: The tunnel actor and its handle
//! - [`socket`]: Socket traits and the signals sockets report
//! - [`stream`]: Sockets over byte streams and the TCP dialer

pub mod relay;
pub mod socket;
pub mod stream;

pub use relay::{Tunnel, TunnelContext, TunnelHandle, TunnelState};
pub use socket::{
    AdapterFactory, AdapterSocket, ProxySocket, RelaySocket, SignalSender, SocketRole,
    SocketSignal,
};
pub use stream::{
    Dialer, DialerAdapterFactory, StreamAdapterSocket, StreamProxySocket, TcpDialer,
    DEFAULT_BUFFER_SIZE,
};
