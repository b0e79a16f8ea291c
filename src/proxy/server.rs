//! Accept loop that turns client connections into tunnels

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::{bind_listener, is_listener_address, DestinationLookup, SocketDestination};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::event::{EventBus, ProxyServerEvent, ServerId, TunnelId};
use crate::tunnel::{StreamProxySocket, Tunnel, TunnelContext, TunnelHandle};

/// How long tunnels get to close after shutdown before they are abandoned
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Live tunnels of one server, keyed by tunnel id
#[derive(Debug, Clone, Default)]
pub struct ActiveTunnels {
    inner: Arc<Mutex<HashMap<TunnelId, TunnelHandle>>>,
}

impl ActiveTunnels {
    fn insert(&self, handle: TunnelHandle) {
        self.inner.lock().insert(handle.id(), handle);
    }

    fn remove(&self, tunnel: TunnelId) -> bool {
        self.inner.lock().remove(&tunnel).is_some()
    }

    /// Number of tunnels still running
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no tunnel is running
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Force-close every running tunnel
    pub fn force_close_all(&self) {
        for handle in self.inner.lock().values() {
            handle.force_close();
        }
    }
}

/// Held by a tunnel task; unregisters the tunnel however the task ends
struct TunnelGuard {
    tunnel: TunnelId,
    server: ServerId,
    active: ActiveTunnels,
    events: EventBus,
    _permit: OwnedSemaphorePermit,
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        if self.active.remove(self.tunnel) {
            self.events.publish(ProxyServerEvent::TunnelClosed {
                server: self.server,
                tunnel: self.tunnel,
            });
        }
    }
}

/// Proxy server
///
/// Each accepted connection becomes a [`StreamProxySocket`] whose request is
/// the connection's original destination, driven by its own [`Tunnel`] task.
#[derive(Debug)]
pub struct ProxyServer {
    id: ServerId,
    listener: TcpListener,
    context: TunnelContext,
    destinations: Arc<dyn DestinationLookup>,
    active: ActiveTunnels,
    limit: Arc<Semaphore>,
    buffer_size: usize,
}

impl ProxyServer {
    /// Bind the listener described by `config`
    ///
    /// # Errors
    ///
    /// Returns `ProxyError` if the listener cannot be created.
    pub fn bind(config: &ProxyConfig, context: TunnelContext) -> Result<Self, ProxyError> {
        let listener = bind_listener(config)?;
        Ok(Self::from_listener(listener, config, context))
    }

    /// Serve on an already bound listener
    #[must_use]
    pub fn from_listener(
        listener: TcpListener,
        config: &ProxyConfig,
        context: TunnelContext,
    ) -> Self {
        Self {
            id: ServerId::next(),
            listener,
            context,
            destinations: Arc::new(SocketDestination::from(config)),
            active: ActiveTunnels::default(),
            limit: Arc::new(Semaphore::new(config.max_connections.max(1))),
            buffer_size: config.buffer_size,
        }
    }

    /// Replace how original destinations are recovered
    #[must_use]
    pub fn with_destination_lookup(mut self, destinations: Arc<dyn DestinationLookup>) -> Self {
        self.destinations = destinations;
        self
    }

    /// Server identity used in events
    #[must_use]
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns the I/O error from `getsockname`.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registry of this server's running tunnels
    #[must_use]
    pub fn active_tunnels(&self) -> ActiveTunnels {
        self.active.clone()
    }

    /// Accept connections until `shutdown` fires
    ///
    /// On shutdown every live tunnel is force-closed and awaited briefly.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Io` if the listener address cannot be read.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let addr = self.listener.local_addr()?;
        let server = self.id;
        let events = self.context.events.clone();
        events.publish(ProxyServerEvent::Started { server, addr });
        info!("{} accepting on {}", server, addr);

        let mut tunnels: JoinSet<()> = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(done) = tunnels.join_next(), if !tunnels.is_empty() => {
                    self.on_task_finished(done);
                    continue;
                }
                accepted = accept_with_permit(&self.listener, &self.limit) => accepted,
            };

            match accepted {
                Ok((stream, peer, permit)) => {
                    self.spawn_tunnel(stream, peer, addr, permit, &mut tunnels);
                }
                Err(e) => {
                    warn!("{} accept failed: {}", server, e);
                    // Back off so a persistent error (EMFILE) does not spin
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        info!("{} shutting down, closing {} tunnels", server, self.active.len());
        self.active.force_close_all();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(done) = tunnels.join_next().await {
                self.on_task_finished(done);
            }
        })
        .await;
        if drained.is_err() {
            warn!("{} abandoning {} tunnels", server, tunnels.len());
            tunnels.abort_all();
        }

        events.publish(ProxyServerEvent::Stopped { server });
        Ok(())
    }

    fn spawn_tunnel(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        listen: SocketAddr,
        permit: OwnedSemaphorePermit,
        tunnels: &mut JoinSet<()>,
    ) {
        self.context.events.publish(ProxyServerEvent::NewSocketAccepted {
            server: self.id,
            peer,
        });

        let destination = match self.destinations.destination(&stream) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Dropping connection from {}: no destination: {}", peer, e);
                return;
            }
        };
        if is_listener_address(destination, listen) {
            warn!(
                "Dropping connection from {}: destination {} is this listener",
                peer, destination
            );
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let socket = StreamProxySocket::new(stream, destination, self.buffer_size);
        let tunnel = Tunnel::new(Box::new(socket), self.context.clone());
        let handle = tunnel.handle();
        let id = handle.id();
        debug!(tunnel = %id, %peer, %destination, "Tunnel created");

        self.active.insert(handle);
        let guard = TunnelGuard {
            tunnel: id,
            server: self.id,
            active: self.active.clone(),
            events: self.context.events.clone(),
            _permit: permit,
        };
        tunnels.spawn(async move {
            let _guard = guard;
            if let Some(session) = tunnel.run().await {
                debug!(tunnel = %id, session = %session, "Tunnel finished");
            }
        });
    }

    fn on_task_finished(&self, done: Result<(), tokio::task::JoinError>) {
        if let Err(e) = done {
            if e.is_panic() {
                warn!("{} tunnel task panicked: {}", self.id, e);
            }
        }
    }
}

async fn accept_with_permit(
    listener: &TcpListener,
    limit: &Arc<Semaphore>,
) -> std::io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
    let permit = Arc::clone(limit)
        .acquire_owned()
        .await
        .map_err(|_| std::io::Error::other("connection limit closed"))?;
    let (stream, peer) = listener.accept().await?;
    Ok((stream, peer, permit))
}
