//! Sockets over byte streams
//!
//! [`StreamProxySocket`] wraps an accepted client stream whose destination is
//! already known (a transparently redirected connection). [`StreamAdapterSocket`]
//! dials the target through a [`Dialer`] and relays over the resulting stream.
//!
//! Both run the stream with two tasks: a reader that performs one read per
//! `read_data` call and a writer that drains queued writes in order. A
//! graceful disconnect flushes the queue and shuts the write half down; a
//! forced one cancels both tasks. Reaching EOF starts a graceful disconnect.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::socket::{
    AdapterFactory, AdapterSocket, ProxySocket, RelaySocket, SignalSender, SocketSignal,
};
use crate::event::SocketId;
use crate::session::ConnectSession;

/// Default read chunk size
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

enum WriteOp {
    Data(Bytes),
    Shutdown,
}

/// Close requests shared by a socket and its reader task
struct Closer {
    writes: mpsc::UnboundedSender<WriteOp>,
    cancel: CancellationToken,
    disconnect_called: AtomicBool,
    force_called: AtomicBool,
    finished: AtomicBool,
    signals: SignalSender,
}

impl Closer {
    fn graceful(&self) {
        if self.finished.load(Ordering::Acquire)
            || self.disconnect_called.swap(true, Ordering::AcqRel)
        {
            return;
        }
        self.signals.send(SocketSignal::DisconnectCalled);
        if self.writes.send(WriteOp::Shutdown).is_err() {
            self.cancel.cancel();
        }
    }

    fn force(&self) {
        if self.finished.load(Ordering::Acquire)
            || self.force_called.swap(true, Ordering::AcqRel)
        {
            return;
        }
        self.signals.send(SocketSignal::ForceDisconnectCalled);
        self.cancel.cancel();
    }
}

/// Channels and state of one stream-backed socket
struct StreamIo {
    buffer_size: usize,
    cancel: CancellationToken,
    reads: mpsc::UnboundedSender<()>,
    writes: mpsc::UnboundedSender<WriteOp>,
    pending: Option<(mpsc::UnboundedReceiver<()>, mpsc::UnboundedReceiver<WriteOp>)>,
    closer: Option<Arc<Closer>>,
}

impl StreamIo {
    fn new(buffer_size: usize) -> Self {
        let (reads, read_rx) = mpsc::unbounded_channel();
        let (writes, write_rx) = mpsc::unbounded_channel();
        Self {
            buffer_size: buffer_size.max(1),
            cancel: CancellationToken::new(),
            reads,
            writes,
            pending: Some((read_rx, write_rx)),
            closer: None,
        }
    }

    /// Bind the socket to its signal channel; returns the stream driver
    fn attach(&mut self, signals: SignalSender) -> Option<StreamDriver> {
        let (reads, writes) = self.pending.take()?;
        let closer = Arc::new(Closer {
            writes: self.writes.clone(),
            cancel: self.cancel.clone(),
            disconnect_called: AtomicBool::new(false),
            force_called: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            signals: signals.clone(),
        });
        self.closer = Some(Arc::clone(&closer));
        Some(StreamDriver {
            buffer_size: self.buffer_size,
            cancel: self.cancel.clone(),
            reads,
            writes,
            closer,
        })
    }

    fn signal(&self, signal: SocketSignal) {
        if let Some(closer) = &self.closer {
            if !closer.finished.load(Ordering::Acquire) {
                closer.signals.send(signal);
            }
        }
    }

    /// Report `Disconnected` unless already reported
    fn finish(closer: &Closer) {
        if !closer.finished.swap(true, Ordering::AcqRel) {
            closer.signals.send(SocketSignal::Disconnected);
        }
    }

    fn read_data(&self) {
        let _ = self.reads.send(());
    }

    fn write(&self, data: Bytes) {
        let _ = self.writes.send(WriteOp::Data(data));
    }

    fn disconnect(&self) {
        match &self.closer {
            Some(closer) => closer.graceful(),
            None => self.cancel.cancel(),
        }
    }

    fn force_disconnect(&self) {
        match &self.closer {
            Some(closer) => closer.force(),
            None => self.cancel.cancel(),
        }
    }
}

impl Drop for StreamIo {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs a stream until it closes, then reports `Disconnected`
struct StreamDriver {
    buffer_size: usize,
    cancel: CancellationToken,
    reads: mpsc::UnboundedReceiver<()>,
    writes: mpsc::UnboundedReceiver<WriteOp>,
    closer: Arc<Closer>,
}

impl StreamDriver {
    async fn run<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let Self {
            buffer_size,
            cancel,
            reads,
            writes,
            closer,
        } = self;
        let (read_half, write_half) = tokio::io::split(stream);

        let reader = read_loop(read_half, reads, buffer_size, &cancel, &closer);
        let writer = async {
            write_loop(write_half, writes, &cancel, &closer.signals).await;
            // Nothing more will be written; stop reading too
            cancel.cancel();
        };
        tokio::join!(reader, writer);

        StreamIo::finish(&closer);
    }

    /// Report `Disconnected` without ever having a stream
    fn abandon(self) {
        StreamIo::finish(&self.closer);
    }
}

async fn read_loop<S: AsyncRead>(
    mut reader: ReadHalf<S>,
    mut requests: mpsc::UnboundedReceiver<()>,
    buffer_size: usize,
    cancel: &CancellationToken,
    closer: &Closer,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            request = requests.recv() => {
                if request.is_none() {
                    return;
                }
            }
        }

        let read = tokio::select! {
            () = cancel.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                trace!("Stream reached EOF");
                closer.graceful();
                return;
            }
            Ok(n) => {
                trace!("Stream read {} bytes", n);
                closer
                    .signals
                    .send(SocketSignal::ReadData(Bytes::copy_from_slice(&buf[..n])));
            }
            Err(err) => {
                closer.signals.send(SocketSignal::Error(err));
                cancel.cancel();
                return;
            }
        }
    }
}

async fn write_loop<S: AsyncWrite>(
    mut writer: WriteHalf<S>,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    cancel: &CancellationToken,
    signals: &SignalSender,
) {
    loop {
        let op = tokio::select! {
            () = cancel.cancelled() => return,
            op = ops.recv() => op,
        };

        match op {
            Some(WriteOp::Data(data)) => {
                let len = data.len();
                let written = tokio::select! {
                    () = cancel.cancelled() => return,
                    written = writer.write_all(&data) => written,
                };
                if let Err(err) = written {
                    signals.send(SocketSignal::Error(err));
                    return;
                }
                signals.send(SocketSignal::WroteData(Some(len)));
            }
            Some(WriteOp::Shutdown) => {
                if let Err(err) = writer.shutdown().await {
                    debug!("Stream shutdown failed: {}", err);
                }
                return;
            }
            None => return,
        }
    }
}

/// Client-facing socket over an accepted stream
///
/// The destination is known up front, so the request is reported as soon as
/// the socket opens and no response has to be written to the client.
pub struct StreamProxySocket<S> {
    id: SocketId,
    stream: Option<S>,
    destination: SocketAddr,
    io: StreamIo,
}

impl<S> StreamProxySocket<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a stream whose original destination is `destination`
    #[must_use]
    pub fn new(stream: S, destination: SocketAddr, buffer_size: usize) -> Self {
        Self {
            id: SocketId::next(),
            stream: Some(stream),
            destination,
            io: StreamIo::new(buffer_size),
        }
    }

    /// Original destination of the connection
    #[must_use]
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

impl<S> RelaySocket for StreamProxySocket<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn id(&self) -> SocketId {
        self.id
    }

    fn read_data(&mut self) {
        self.io.read_data();
    }

    fn write(&mut self, data: Bytes) {
        self.io.write(data);
    }

    fn disconnect(&mut self) {
        self.io.disconnect();
    }

    fn force_disconnect(&mut self) {
        self.io.force_disconnect();
    }
}

impl<S> ProxySocket for StreamProxySocket<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn open(&mut self, signals: SignalSender) {
        let Some(driver) = self.io.attach(signals.clone()) else {
            return;
        };
        signals.send(SocketSignal::ReceivedRequest {
            host: self.destination.ip().to_string(),
            port: self.destination.port(),
        });
        match self.stream.take() {
            Some(stream) => {
                tokio::spawn(driver.run(stream));
            }
            None => driver.abandon(),
        }
    }

    fn respond_to(&mut self, _adapter: SocketId) {
        self.io.signal(SocketSignal::ReadyForForward);
    }
}

/// Opens streams to a session's target
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Stream type produced
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Connect to the target of `session`
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the target cannot be resolved or reached.
    async fn dial(&self, session: &ConnectSession) -> io::Result<Self::Stream>;
}

/// Direct TCP dialer
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    /// Create a dialer that gives up after `connect_timeout`
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, session: &ConnectSession) -> io::Result<TcpStream> {
        let ip = session.ip_address().await.map_err(io::Error::other)?;
        let addr = SocketAddr::new(ip, session.port());

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out after {:?}", self.connect_timeout),
                )
            })??;

        if let Err(err) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, err);
        }
        debug!("Connected to {} for {}", addr, session);
        Ok(stream)
    }
}

/// Remote-facing socket over a dialed stream
pub struct StreamAdapterSocket<D> {
    id: SocketId,
    dialer: Arc<D>,
    connected: Arc<AtomicBool>,
    io: StreamIo,
}

impl<D: Dialer> StreamAdapterSocket<D> {
    /// Create an adapter that dials through `dialer`
    #[must_use]
    pub fn new(dialer: Arc<D>, buffer_size: usize) -> Self {
        Self {
            id: SocketId::next(),
            dialer,
            connected: Arc::new(AtomicBool::new(false)),
            io: StreamIo::new(buffer_size),
        }
    }
}

impl<D: Dialer> RelaySocket for StreamAdapterSocket<D> {
    fn id(&self) -> SocketId {
        self.id
    }

    fn read_data(&mut self) {
        self.io.read_data();
    }

    fn write(&mut self, data: Bytes) {
        self.io.write(data);
    }

    fn disconnect(&mut self) {
        self.io.disconnect();
        // Nothing to flush yet; abort the dial
        if !self.connected.load(Ordering::Acquire) {
            self.io.cancel.cancel();
        }
    }

    fn force_disconnect(&mut self) {
        self.io.force_disconnect();
    }
}

impl<D: Dialer> AdapterSocket for StreamAdapterSocket<D> {
    fn open(&mut self, session: Arc<ConnectSession>, signals: SignalSender) {
        let Some(driver) = self.io.attach(signals.clone()) else {
            return;
        };
        let dialer = Arc::clone(&self.dialer);
        let connected = Arc::clone(&self.connected);
        let cancel = self.io.cancel.clone();

        tokio::spawn(async move {
            let dialed = tokio::select! {
                () = cancel.cancelled() => None,
                dialed = dialer.dial(&session) => Some(dialed),
            };
            match dialed {
                Some(Ok(stream)) => {
                    connected.store(true, Ordering::Release);
                    signals.send(SocketSignal::Connected);
                    signals.send(SocketSignal::ReadyForForward);
                    driver.run(stream).await;
                }
                Some(Err(err)) => {
                    debug!("Dial for {} failed: {}", session, err);
                    signals.send(SocketSignal::Error(err));
                    driver.abandon();
                }
                None => driver.abandon(),
            }
        });
    }
}

/// Builds a [`StreamAdapterSocket`] per request from a shared dialer
pub struct DialerAdapterFactory<D> {
    dialer: Arc<D>,
    buffer_size: usize,
}

impl<D: Dialer> DialerAdapterFactory<D> {
    /// Create a factory over `dialer`
    #[must_use]
    pub fn new(dialer: D, buffer_size: usize) -> Self {
        Self {
            dialer: Arc::new(dialer),
            buffer_size,
        }
    }

    /// Create a factory over a dialer the caller keeps a handle to
    #[must_use]
    pub fn from_shared(dialer: Arc<D>, buffer_size: usize) -> Self {
        Self {
            dialer,
            buffer_size,
        }
    }
}

impl<D: Dialer> AdapterFactory for DialerAdapterFactory<D> {
    fn create(&self, _session: &ConnectSession) -> Box<dyn AdapterSocket> {
        Box::new(StreamAdapterSocket::new(
            Arc::clone(&self.dialer),
            self.buffer_size,
        ))
    }
}
