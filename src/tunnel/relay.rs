//! Tunnel relay engine
//!
//! A [`Tunnel`] pairs one proxy socket with one adapter socket and relays
//! bytes between them. It runs as a single task that consumes socket signals
//! and close commands in order, so its state needs no locking.
//!
//! # Lifecycle
//!
//! ```text
//! Opened ──(both sides ready)──► Forwarding
//!    │                              │
//!    └──(close / disconnect / error)┴──► Closing ──(all sockets disconnected)──► Closed
//! ```
//!
//! # Forwarding
//!
//! Each direction is lockstep: data read from one side is written to the
//! other, and the next read on the source is issued only after that write
//! completes. At most one chunk per direction is buffered and a slow sink
//! throttles its source.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use super::socket::{
    AdapterFactory, AdapterSocket, ProxySocket, RelaySocket, SignalSender, SocketRole, SocketSignal,
};
use crate::error::TunnelError;
use crate::event::{
    AdapterSocketEvent, Event, EventBus, ProxySocketEvent, SocketId, TunnelEvent, TunnelId,
};
use crate::session::{ConnectSession, ResolveContext};

/// Tunnel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Waiting for the request and both ready signals
    Opened,
    /// Relaying data
    Forwarding,
    /// Waiting for sockets to report disconnection
    Closing,
    /// Both sockets disconnected
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Opened => "opened",
            Self::Forwarding => "forwarding",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Shared collaborators for every tunnel of a server
#[derive(Clone)]
pub struct TunnelContext {
    /// How requested hosts are resolved
    pub resolve: ResolveContext,
    /// Builds the adapter for each request
    pub adapters: Arc<dyn AdapterFactory>,
    /// Where lifecycle events go
    pub events: EventBus,
}

impl fmt::Debug for TunnelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelContext")
            .field("resolve", &self.resolve)
            .finish_non_exhaustive()
    }
}

enum TunnelCommand {
    Close,
    ForceClose,
}

/// Handle for closing a running tunnel
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    id: TunnelId,
    commands: mpsc::UnboundedSender<TunnelCommand>,
}

impl TunnelHandle {
    /// Tunnel this handle controls
    #[must_use]
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// Close both sides after pending writes drain
    pub fn close(&self) {
        let _ = self.commands.send(TunnelCommand::Close);
    }

    /// Close both sides immediately
    pub fn force_close(&self) {
        let _ = self.commands.send(TunnelCommand::ForceClose);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SideState {
    ready: bool,
    disconnect_requested: bool,
    force_requested: bool,
    disconnected: bool,
}

/// A relay between one proxy socket and one adapter socket
pub struct Tunnel {
    core: TunnelCore,
    signals: mpsc::UnboundedReceiver<(SocketId, SocketSignal)>,
    commands: mpsc::UnboundedReceiver<TunnelCommand>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.core.id)
            .field("state", &self.core.state)
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Create a tunnel around an accepted proxy socket
    #[must_use]
    pub fn new(proxy: Box<dyn ProxySocket>, context: TunnelContext) -> Self {
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        Self {
            core: TunnelCore {
                id: TunnelId::next(),
                proxy,
                adapter: None,
                session: None,
                context,
                state: TunnelState::Opened,
                proxy_side: SideState::default(),
                adapter_side: SideState::default(),
                adapter_replaced: false,
                signal_tx,
                command_tx,
            },
            signals,
            commands,
        }
    }

    /// Tunnel identity
    #[must_use]
    pub fn id(&self) -> TunnelId {
        self.core.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.core.state
    }

    /// Handle for closing the tunnel while it runs
    #[must_use]
    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            id: self.core.id,
            commands: self.core.command_tx.clone(),
        }
    }

    /// Run until both sockets have disconnected
    ///
    /// Returns the connection's session if a request was received.
    pub async fn run(self) -> Option<Arc<ConnectSession>> {
        let Self {
            mut core,
            mut signals,
            mut commands,
        } = self;

        core.open();

        while core.state != TunnelState::Closed {
            tokio::select! {
                biased;
                Some(command) = commands.recv() => core.on_command(command),
                Some((socket, signal)) = signals.recv() => core.on_signal(socket, signal),
                else => break,
            }
        }

        core.session
    }
}

struct TunnelCore {
    id: TunnelId,
    proxy: Box<dyn ProxySocket>,
    adapter: Option<Box<dyn AdapterSocket>>,
    session: Option<Arc<ConnectSession>>,
    context: TunnelContext,
    state: TunnelState,
    proxy_side: SideState,
    adapter_side: SideState,
    adapter_replaced: bool,
    signal_tx: mpsc::UnboundedSender<(SocketId, SocketSignal)>,
    command_tx: mpsc::UnboundedSender<TunnelCommand>,
}

impl TunnelCore {
    fn publish(&self, event: impl Into<Event>) {
        self.context.events.publish(event);
    }

    fn sender(&self, socket: SocketId, role: SocketRole) -> SignalSender {
        SignalSender::new(socket, role, self.signal_tx.clone(), self.context.events.clone())
    }

    fn side(&self, role: SocketRole) -> &SideState {
        match role {
            SocketRole::Proxy => &self.proxy_side,
            SocketRole::Adapter => &self.adapter_side,
        }
    }

    fn side_mut(&mut self, role: SocketRole) -> &mut SideState {
        match role {
            SocketRole::Proxy => &mut self.proxy_side,
            SocketRole::Adapter => &mut self.adapter_side,
        }
    }

    fn open(&mut self) {
        self.publish(TunnelEvent::Opened { tunnel: self.id });
        let socket = self.proxy.id();
        self.publish(ProxySocketEvent::SocketOpened { socket });
        let signals = self.sender(socket, SocketRole::Proxy);
        self.proxy.open(signals);
    }

    fn on_command(&mut self, command: TunnelCommand) {
        match command {
            TunnelCommand::Close => {
                self.publish(TunnelEvent::CloseCalled { tunnel: self.id });
                self.begin_closing();
                self.request_disconnect(SocketRole::Proxy, false);
                self.request_disconnect(SocketRole::Adapter, false);
            }
            TunnelCommand::ForceClose => {
                self.publish(TunnelEvent::ForceCloseCalled { tunnel: self.id });
                self.begin_closing();
                self.request_disconnect(SocketRole::Proxy, true);
                self.request_disconnect(SocketRole::Adapter, true);
            }
        }
        self.check_closed();
    }

    fn role_of(&self, socket: SocketId) -> Option<SocketRole> {
        if socket == self.proxy.id() {
            Some(SocketRole::Proxy)
        } else if self.adapter.as_ref().is_some_and(|a| a.id() == socket) {
            Some(SocketRole::Adapter)
        } else {
            None
        }
    }

    fn on_signal(&mut self, socket: SocketId, signal: SocketSignal) {
        let Some(role) = self.role_of(socket) else {
            trace!(tunnel = %self.id, %socket, "Ignoring {:?} from detached socket", signal);
            return;
        };

        match (role, signal) {
            (SocketRole::Proxy, SocketSignal::ReceivedRequest { host, port }) => {
                self.on_request(host, port);
            }
            (SocketRole::Adapter, SocketSignal::Connected) => self.on_connected(),
            (SocketRole::Adapter, SocketSignal::Replace(adapter)) => {
                if let Err(err) = self.update_adapter(adapter) {
                    error!(tunnel = %self.id, "{}", err);
                }
            }
            (role, SocketSignal::ReadyForForward) => self.on_ready(role),
            (role, SocketSignal::ReadData(data)) => self.on_read(role, data),
            (role, SocketSignal::WroteData(len)) => self.on_wrote(role, len),
            (role, SocketSignal::DisconnectCalled) => self.on_disconnect_called(role, false),
            (role, SocketSignal::ForceDisconnectCalled) => self.on_disconnect_called(role, true),
            (role, SocketSignal::Disconnected) => self.on_disconnected(role),
            (role, SocketSignal::Error(err)) => self.on_error(role, err),
            (role, signal) => {
                debug!(tunnel = %self.id, "Ignoring {:?} from {} socket", signal, role);
            }
        }
        self.check_closed();
    }

    fn on_request(&mut self, host: String, port: u16) {
        if self.session.is_some() || self.state != TunnelState::Opened {
            debug!(tunnel = %self.id, "Ignoring repeated request for {}:{}", host, port);
            return;
        }

        self.publish(TunnelEvent::ReceivedRequest {
            tunnel: self.id,
            host: host.clone(),
            port,
        });

        let session = match ConnectSession::new(host, port, &self.context.resolve) {
            Ok(session) => Arc::new(session),
            Err(err) => {
                warn!(tunnel = %self.id, "Rejecting request: {}", err);
                self.begin_closing();
                self.request_disconnect(SocketRole::Proxy, true);
                return;
            }
        };

        debug!(tunnel = %self.id, "Request for {}", session);
        let adapter = self.context.adapters.create(&session);
        self.session = Some(session);
        self.open_adapter(adapter);
    }

    fn open_adapter(&mut self, mut adapter: Box<dyn AdapterSocket>) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let socket = adapter.id();
        self.publish(AdapterSocketEvent::SocketOpened {
            socket,
            host: session.host().to_string(),
            port: session.port(),
        });
        adapter.open(session, self.sender(socket, SocketRole::Adapter));
        self.adapter = Some(adapter);
    }

    fn on_connected(&mut self) {
        let Some(adapter) = self.adapter.as_ref().map(|a| a.id()) else {
            return;
        };
        if self.state != TunnelState::Opened {
            return;
        }
        self.publish(TunnelEvent::ConnectedToRemote {
            tunnel: self.id,
            adapter,
        });
        self.publish(ProxySocketEvent::AskedToRespondTo {
            socket: self.proxy.id(),
            adapter,
        });
        self.proxy.respond_to(adapter);
    }

    fn on_ready(&mut self, role: SocketRole) {
        if self.state != TunnelState::Opened {
            trace!(tunnel = %self.id, "Ignoring ready signal from {} while {}", role, self.state);
            return;
        }
        if self.side(role).ready {
            trace!(tunnel = %self.id, "Duplicate ready signal from {}", role);
            return;
        }
        self.side_mut(role).ready = true;

        let count = u8::from(self.proxy_side.ready) + u8::from(self.adapter_side.ready);
        self.publish(TunnelEvent::ReceivedReadySignal {
            tunnel: self.id,
            count,
        });

        if count == 2 {
            debug!(tunnel = %self.id, "Both sides ready, forwarding");
            self.state = TunnelState::Forwarding;
            self.proxy.read_data();
            if let Some(adapter) = self.adapter.as_mut() {
                adapter.read_data();
            }
        }
    }

    fn on_read(&mut self, role: SocketRole, data: Bytes) {
        if !matches!(self.state, TunnelState::Forwarding | TunnelState::Closing) {
            trace!(tunnel = %self.id, "Dropping {} bytes read before forwarding", data.len());
            return;
        }
        let len = data.len();
        match role {
            SocketRole::Proxy => {
                self.publish(TunnelEvent::ProxySocketReadData {
                    tunnel: self.id,
                    len,
                });
                if self.adapter_side.disconnected || self.adapter_side.force_requested {
                    return;
                }
                if let Some(adapter) = self.adapter.as_mut() {
                    adapter.write(data);
                }
            }
            SocketRole::Adapter => {
                self.publish(TunnelEvent::AdapterSocketReadData {
                    tunnel: self.id,
                    len,
                });
                if self.proxy_side.disconnected || self.proxy_side.force_requested {
                    return;
                }
                self.proxy.write(data);
            }
        }
    }

    fn on_wrote(&mut self, role: SocketRole, len: Option<usize>) {
        match role {
            SocketRole::Proxy => {
                self.publish(TunnelEvent::ProxySocketWroteData {
                    tunnel: self.id,
                    len,
                });
            }
            SocketRole::Adapter => {
                self.publish(TunnelEvent::AdapterSocketWroteData {
                    tunnel: self.id,
                    len,
                });
            }
        }

        // The write drained; let its source read again
        if self.state != TunnelState::Forwarding {
            return;
        }
        match role.peer() {
            SocketRole::Proxy => self.proxy.read_data(),
            SocketRole::Adapter => {
                if let Some(adapter) = self.adapter.as_mut() {
                    adapter.read_data();
                }
            }
        }
    }

    fn on_disconnect_called(&mut self, role: SocketRole, force: bool) {
        {
            let side = self.side_mut(role);
            if force {
                side.force_requested = true;
            } else {
                side.disconnect_requested = true;
            }
        }
        // First close signal decides the side; later ones are no-ops
        if let Some(session) = &self.session {
            session.disconnected(None, role.into());
        }
        self.begin_closing();
        self.request_disconnect(role.peer(), force);
    }

    fn on_disconnected(&mut self, role: SocketRole) {
        self.side_mut(role).disconnected = true;
        if let Some(session) = &self.session {
            session.disconnected(None, role.into());
        }
        self.begin_closing();
        self.request_disconnect(role.peer(), false);
    }

    fn on_error(&mut self, role: SocketRole, err: std::io::Error) {
        debug!(tunnel = %self.id, "{} socket error: {}", role, err);
        if let Some(session) = &self.session {
            session.disconnected(Some(err), role.into());
        }
        self.begin_closing();
        self.request_disconnect(role.peer(), true);
    }

    fn begin_closing(&mut self) {
        if matches!(self.state, TunnelState::Opened | TunnelState::Forwarding) {
            self.state = TunnelState::Closing;
        }
    }

    fn request_disconnect(&mut self, role: SocketRole, force: bool) {
        let side = *self.side(role);
        if side.disconnected || side.force_requested || (!force && side.disconnect_requested) {
            return;
        }

        match role {
            SocketRole::Proxy => {
                if force {
                    self.proxy.force_disconnect();
                } else {
                    self.proxy.disconnect();
                }
            }
            SocketRole::Adapter => {
                let Some(adapter) = self.adapter.as_mut() else {
                    return;
                };
                if force {
                    adapter.force_disconnect();
                } else {
                    adapter.disconnect();
                }
            }
        }

        let side = self.side_mut(role);
        if force {
            side.force_requested = true;
        } else {
            side.disconnect_requested = true;
        }
    }

    fn check_closed(&mut self) {
        if self.state == TunnelState::Closed {
            return;
        }
        let adapter_done = self.adapter.is_none() || self.adapter_side.disconnected;
        if self.proxy_side.disconnected && adapter_done {
            self.state = TunnelState::Closed;
            debug!(tunnel = %self.id, "Closed");
            self.publish(TunnelEvent::Closed { tunnel: self.id });
        }
    }

    /// Swap the adapter for the one it handed over with `Replace`
    ///
    /// Valid once, while an adapter is open and before it reported ready.
    fn update_adapter(&mut self, adapter: Box<dyn AdapterSocket>) -> Result<(), TunnelError> {
        if self.adapter_replaced {
            return Err(TunnelError::InvalidTunnelState(format!(
                "{}: adapter socket was already replaced",
                self.id
            )));
        }
        if self.state != TunnelState::Opened {
            return Err(TunnelError::InvalidTunnelState(format!(
                "{}: cannot replace adapter socket while {}",
                self.id, self.state
            )));
        }
        if self.adapter_side.ready {
            return Err(TunnelError::InvalidTunnelState(format!(
                "{}: adapter socket already reported ready",
                self.id
            )));
        }
        let Some(from) = self.adapter.as_ref().map(|a| a.id()) else {
            return Err(TunnelError::InvalidTunnelState(format!(
                "{}: no adapter socket to replace",
                self.id
            )));
        };

        self.publish(TunnelEvent::UpdatingAdapterSocket {
            tunnel: self.id,
            from,
            to: adapter.id(),
        });
        debug!(tunnel = %self.id, "Replacing adapter {} with {}", from, adapter.id());

        self.adapter_replaced = true;
        self.adapter_side = SideState::default();
        self.adapter = None;
        self.open_adapter(adapter);
        Ok(())
    }
}
