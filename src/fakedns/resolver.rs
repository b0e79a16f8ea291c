//! Upstream DNS resolvers
//!
//! The DNS server broadcasts every remotely-resolved query to all registered
//! resolvers at once. Whatever a resolver returns is delivered back into the
//! server's serialized context; the first answer for a transaction wins.

use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::trace;

use crate::error::FakeDnsError;

/// Receive buffer for UDP responses (EDNS-sized)
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// An upstream that answers raw DNS queries
///
/// # Thread Safety
///
/// Implementations are shared across concurrently running resolution tasks.
#[async_trait]
pub trait DnsResolver: Send + Sync + Debug {
    /// Resolve a raw DNS query, returning the raw response
    ///
    /// # Errors
    ///
    /// Returns `FakeDnsError` on network failure, timeout, or an unusable answer.
    async fn resolve(&self, query: Bytes) -> Result<Bytes, FakeDnsError>;

    /// Stop accepting new queries
    fn stop(&self) {}
}

/// Plain UDP upstream resolver
///
/// Each query uses its own ephemeral socket so answers cannot cross.
#[derive(Debug)]
pub struct UdpResolver {
    server: SocketAddr,
    timeout: Duration,
    stopped: AtomicBool,
}

impl UdpResolver {
    /// Create a resolver for `server`
    #[must_use]
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self {
            server,
            timeout,
            stopped: AtomicBool::new(false),
        }
    }

    /// Upstream server address
    #[must_use]
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    fn bind_addr(&self) -> SocketAddr {
        if self.server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        }
    }
}

#[async_trait]
impl DnsResolver for UdpResolver {
    async fn resolve(&self, query: Bytes) -> Result<Bytes, FakeDnsError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(FakeDnsError::upstream(self.server, "resolver stopped"));
        }
        if query.len() < 2 {
            return Err(FakeDnsError::malformed("query shorter than a DNS header"));
        }

        let socket = UdpSocket::bind(self.bind_addr()).await?;
        socket.send_to(&query, self.server).await?;

        let mut recv_buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        let (len, src) = timeout(self.timeout, socket.recv_from(&mut recv_buf))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer from {} within {:?}", self.server, self.timeout),
                )
            })??;

        // Verify source address matches server
        if src != self.server {
            return Err(FakeDnsError::upstream(
                self.server,
                format!("response from unexpected source: {src}"),
            ));
        }
        if len < 2 || recv_buf[..2] != query[..2] {
            return Err(FakeDnsError::upstream(
                self.server,
                "response transaction ID does not match query",
            ));
        }

        trace!("Upstream {} answered with {} bytes", self.server, len);
        recv_buf.truncate(len);
        Ok(Bytes::from(recv_buf))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakedns::session::tests::query_bytes;
    use hickory_proto::rr::RecordType;

    async fn echo_upstream(rewrite_id: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            buf[2] |= 0x80; // QR bit
            if rewrite_id {
                buf[0] ^= 0xff;
            }
            socket.send_to(&buf[..n], peer).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_udp_resolver_roundtrip() {
        let upstream = echo_upstream(false).await;
        let resolver = UdpResolver::new(upstream, Duration::from_secs(2));
        let query = Bytes::from(query_bytes(0x4242, "example.com", RecordType::A));

        let response = resolver.resolve(query.clone()).await.unwrap();
        assert_eq!(response[..2], query[..2]);
        assert_eq!(response.len(), query.len());
    }

    #[tokio::test]
    async fn test_udp_resolver_id_mismatch() {
        let upstream = echo_upstream(true).await;
        let resolver = UdpResolver::new(upstream, Duration::from_secs(2));
        let query = Bytes::from(query_bytes(0x4242, "example.com", RecordType::A));

        let err = resolver.resolve(query).await.unwrap_err();
        assert!(matches!(err, FakeDnsError::Upstream { .. }));
    }

    #[tokio::test]
    async fn test_udp_resolver_timeout() {
        // Bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver = UdpResolver::new(silent.local_addr().unwrap(), Duration::from_millis(50));
        let query = Bytes::from(query_bytes(1, "example.com", RecordType::A));

        let err = resolver.resolve(query).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_stopped_resolver_refuses() {
        let resolver = UdpResolver::new("127.0.0.1:53".parse().unwrap(), Duration::from_secs(1));
        resolver.stop();
        let query = Bytes::from(query_bytes(1, "example.com", RecordType::A));
        assert!(resolver.resolve(query).await.is_err());
    }
}
