//! UDP socket front for the FakeDNS server
//!
//! Lets a [`DnsServer`] serve ordinary UDP clients when no virtual IP stack
//! sits in front of it. Each received datagram is wrapped into an IPv4/UDP
//! packet addressed to the server's listener and offered to
//! [`DnsServer::input`]; response packets from the server's output channel are
//! unwrapped and sent back to their destination.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use smoltcp::wire::IpVersion;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::packet::{build_ipv4_udp, parse_ipv4_udp};
use super::server::DnsServer;

/// UDP socket bridged to a [`DnsServer`]
pub struct DnsUdpFront {
    socket: UdpSocket,
    server: Arc<DnsServer>,
}

impl DnsUdpFront {
    /// Bind on the server's listener address
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(server: Arc<DnsServer>) -> io::Result<Self> {
        let addr = SocketAddr::V4(server.listen_addr());
        Self::bind_to(addr, server).await
    }

    /// Bind on `addr` while still presenting queries to the server's listener
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind_to(addr: SocketAddr, server: Arc<DnsServer>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket, server })
    }

    /// Get the local address of the socket
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run until `cancel` fires or the server's output channel closes
    ///
    /// # Errors
    ///
    /// Currently never fails; receive errors are logged and retried.
    pub async fn run(
        self,
        mut output: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        let listen = self.server.listen_addr();
        let mut buffer = vec![0u8; 65_535];

        info!(
            "FakeDNS UDP front on {:?} serving {}",
            self.socket.local_addr().ok(),
            listen
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("FakeDNS UDP front cancelled");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buffer) => {
                    let (n, peer) = match received {
                        Ok(r) => r,
                        Err(err) => {
                            error!("FakeDNS UDP recv error: {}", err);
                            time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    self.offer(peer, listen, &buffer[..n]);
                }
                packet = output.recv() => {
                    let Some(packet) = packet else {
                        debug!("FakeDNS output closed; UDP front exiting");
                        return Ok(());
                    };
                    self.deliver(&packet).await;
                }
            }
        }
    }

    fn offer(&self, peer: SocketAddr, listen: SocketAddrV4, payload: &[u8]) {
        let SocketAddr::V4(peer) = peer else {
            debug!("FakeDNS UDP front ignores IPv6 client {}", peer);
            return;
        };

        trace!("FakeDNS UDP received {} bytes from {}", payload.len(), peer);
        match build_ipv4_udp(peer, listen, payload) {
            Ok(packet) => {
                if !self.server.input(&packet, IpVersion::Ipv4) {
                    debug!("FakeDNS declined datagram from {}", peer);
                }
            }
            Err(err) => debug!("FakeDNS UDP front dropped datagram from {}: {}", peer, err),
        }
    }

    async fn deliver(&self, packet: &[u8]) {
        let datagram = match parse_ipv4_udp(packet) {
            Ok(datagram) => datagram,
            Err(err) => {
                debug!("FakeDNS UDP front dropped output packet: {}", err);
                return;
            }
        };
        let destination = SocketAddr::V4(datagram.destination);
        if let Err(err) = self.socket.send_to(datagram.payload, destination).await {
            debug!("FakeDNS UDP send error to {}: {}", destination, err);
        }
    }
}
