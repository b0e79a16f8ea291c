//! Socket capabilities driven by a tunnel
//!
//! A tunnel owns two sockets: the client-facing [`ProxySocket`] and the
//! remote-facing [`AdapterSocket`]. The tunnel drives them through plain
//! method calls; each socket reports progress asynchronously by sending
//! [`SocketSignal`]s through the [`SignalSender`] it was opened with.
//!
//! # Signal ordering
//!
//! Implementations must honour these rules:
//!
//! - No `ReadData` or `WroteData` before the socket has been opened.
//! - One `ReadData` per `read_data` call at most; one `WroteData` per `write`.
//! - `DisconnectCalled` and `ForceDisconnectCalled` are sent at most once each,
//!   whether the close was requested by the tunnel or started by the socket.
//! - `Disconnected` is sent exactly once and is the last signal.
//! - An adapter that wants to retry through another adapter sends `Replace`
//!   instead of `Error`.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::event::{AdapterSocketEvent, EventBus, ProxySocketEvent, SocketId};
use crate::session::{ConnectSession, EventSource};

/// Which end of a tunnel a socket sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketRole {
    /// Client-facing
    Proxy,
    /// Remote-facing
    Adapter,
}

impl SocketRole {
    /// The other end
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Proxy => Self::Adapter,
            Self::Adapter => Self::Proxy,
        }
    }
}

impl From<SocketRole> for EventSource {
    fn from(role: SocketRole) -> Self {
        match role {
            SocketRole::Proxy => Self::Proxy,
            SocketRole::Adapter => Self::Adapter,
        }
    }
}

impl fmt::Display for SocketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        EventSource::from(*self).fmt(f)
    }
}

/// Progress reported by a socket to its tunnel
pub enum SocketSignal {
    /// The client asked for `host:port` (proxy sockets)
    ReceivedRequest { host: String, port: u16 },
    /// Connected to the remote (adapter sockets)
    Connected,
    /// Handshakes done; raw bytes may flow
    ReadyForForward,
    /// Data read in response to `read_data`
    ReadData(Bytes),
    /// A `write` completed
    WroteData(Option<usize>),
    /// A graceful close was started
    DisconnectCalled,
    /// An immediate close was started
    ForceDisconnectCalled,
    /// The socket is closed; always last
    Disconnected,
    /// An I/O error occurred
    Error(io::Error),
    /// Retry through a different adapter (adapter sockets)
    Replace(Box<dyn AdapterSocket>),
}

impl fmt::Debug for SocketSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReceivedRequest { host, port } => f
                .debug_struct("ReceivedRequest")
                .field("host", host)
                .field("port", port)
                .finish(),
            Self::Connected => f.write_str("Connected"),
            Self::ReadyForForward => f.write_str("ReadyForForward"),
            Self::ReadData(data) => f.debug_tuple("ReadData").field(&data.len()).finish(),
            Self::WroteData(len) => f.debug_tuple("WroteData").field(len).finish(),
            Self::DisconnectCalled => f.write_str("DisconnectCalled"),
            Self::ForceDisconnectCalled => f.write_str("ForceDisconnectCalled"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Error(err) => f.debug_tuple("Error").field(err).finish(),
            Self::Replace(adapter) => f.debug_tuple("Replace").field(&adapter.id()).finish(),
        }
    }
}

/// Channel end a socket reports through
///
/// Every signal is also mirrored onto the event bus as the matching
/// proxy-socket or adapter-socket event.
#[derive(Clone)]
pub struct SignalSender {
    socket: SocketId,
    role: SocketRole,
    tx: mpsc::UnboundedSender<(SocketId, SocketSignal)>,
    events: EventBus,
}

impl fmt::Debug for SignalSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSender")
            .field("socket", &self.socket)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl SignalSender {
    pub(crate) fn new(
        socket: SocketId,
        role: SocketRole,
        tx: mpsc::UnboundedSender<(SocketId, SocketSignal)>,
        events: EventBus,
    ) -> Self {
        Self {
            socket,
            role,
            tx,
            events,
        }
    }

    /// Create a sender with its own receiving end, for driving a socket
    /// without a tunnel
    #[must_use]
    pub fn channel(
        socket: SocketId,
        role: SocketRole,
        events: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<(SocketId, SocketSignal)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(socket, role, tx, events), rx)
    }

    /// Socket this sender reports for
    #[must_use]
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// Role of the reporting socket
    #[must_use]
    pub fn role(&self) -> SocketRole {
        self.role
    }

    /// Report a signal; returns `false` once the tunnel is gone
    pub fn send(&self, signal: SocketSignal) -> bool {
        self.mirror(&signal);
        self.tx.send((self.socket, signal)).is_ok()
    }

    fn mirror(&self, signal: &SocketSignal) {
        let socket = self.socket;
        match self.role {
            SocketRole::Proxy => {
                let event = match signal {
                    SocketSignal::ReceivedRequest { host, port } => ProxySocketEvent::ReceivedRequest {
                        socket,
                        host: host.clone(),
                        port: *port,
                    },
                    SocketSignal::ReadyForForward => ProxySocketEvent::ReadyForForward { socket },
                    SocketSignal::ReadData(data) => ProxySocketEvent::ReadData {
                        socket,
                        len: data.len(),
                    },
                    SocketSignal::WroteData(len) => ProxySocketEvent::WroteData { socket, len: *len },
                    SocketSignal::DisconnectCalled => ProxySocketEvent::DisconnectCalled { socket },
                    SocketSignal::ForceDisconnectCalled => {
                        ProxySocketEvent::ForceDisconnectCalled { socket }
                    }
                    SocketSignal::Disconnected => ProxySocketEvent::Disconnected { socket },
                    SocketSignal::Error(err) => ProxySocketEvent::ErrorOccurred {
                        socket,
                        error: Arc::new(copy_error(err)),
                    },
                    SocketSignal::Connected | SocketSignal::Replace(_) => return,
                };
                self.events.publish(event);
            }
            SocketRole::Adapter => {
                let event = match signal {
                    SocketSignal::Connected => AdapterSocketEvent::Connected { socket },
                    SocketSignal::ReadyForForward => AdapterSocketEvent::ReadyForForward { socket },
                    SocketSignal::ReadData(data) => AdapterSocketEvent::ReadData {
                        socket,
                        len: data.len(),
                    },
                    SocketSignal::WroteData(len) => {
                        AdapterSocketEvent::WroteData { socket, len: *len }
                    }
                    SocketSignal::DisconnectCalled => AdapterSocketEvent::DisconnectCalled { socket },
                    SocketSignal::ForceDisconnectCalled => {
                        AdapterSocketEvent::ForceDisconnectCalled { socket }
                    }
                    SocketSignal::Disconnected => AdapterSocketEvent::Disconnected { socket },
                    SocketSignal::Error(err) => AdapterSocketEvent::ErrorOccurred {
                        socket,
                        error: Arc::new(copy_error(err)),
                    },
                    SocketSignal::ReceivedRequest { .. } | SocketSignal::Replace(_) => return,
                };
                self.events.publish(event);
            }
        }
    }
}

fn copy_error(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}

/// Operations shared by both ends of a tunnel
pub trait RelaySocket: Send {
    /// Socket identity, stable for the socket's lifetime
    fn id(&self) -> SocketId;

    /// Read the next chunk; answered by one `ReadData`
    fn read_data(&mut self);

    /// Queue `data` for writing; answered by one `WroteData`
    fn write(&mut self, data: Bytes);

    /// Close after queued writes have drained
    fn disconnect(&mut self);

    /// Close now, dropping queued writes
    fn force_disconnect(&mut self);
}

/// Client-facing socket
pub trait ProxySocket: RelaySocket {
    /// Start serving the client; reports `ReceivedRequest` once the target is known
    fn open(&mut self, signals: SignalSender);

    /// The adapter connected; finish the client-side handshake and report
    /// `ReadyForForward`
    fn respond_to(&mut self, adapter: SocketId);
}

/// Remote-facing socket
pub trait AdapterSocket: RelaySocket {
    /// Start connecting to the session's target
    fn open(&mut self, session: Arc<ConnectSession>, signals: SignalSender);
}

/// Creates the adapter for a resolved request
pub trait AdapterFactory: Send + Sync {
    /// Build an unopened adapter for `session`
    fn create(&self, session: &ConnectSession) -> Box<dyn AdapterSocket>;
}

impl<F> AdapterFactory for F
where
    F: Fn(&ConnectSession) -> Box<dyn AdapterSocket> + Send + Sync,
{
    fn create(&self, session: &ConnectSession) -> Box<dyn AdapterSocket> {
        self(session)
    }
}
