//! Connections accepted by the proxy server and dialed onward

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use fakeip_relay::config::ProxyConfig;
use fakeip_relay::event::{Event, EventBus, ProxyServerEvent};
use fakeip_relay::fakedns::DnsServer;
use fakeip_relay::proxy::{DestinationLookup, ProxyServer};
use fakeip_relay::rules::{DnsVerdict, StaticRule, StaticRuleMatcher};
use fakeip_relay::session::{ConnectSession, HostResolver, ResolveContext};
use fakeip_relay::tunnel::{Dialer, DialerAdapterFactory, TunnelContext};

use super::common::{ask, next_answer, start_server, test_config};

/// Stands in for conntrack: client address to original destination
#[derive(Debug, Default)]
struct NatTable {
    entries: Mutex<HashMap<SocketAddr, SocketAddr>>,
}

impl DestinationLookup for NatTable {
    fn destination(&self, stream: &TcpStream) -> io::Result<SocketAddr> {
        let peer = stream.peer_addr()?;
        self.entries
            .lock()
            .get(&peer)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no NAT entry"))
    }
}

#[derive(Debug, Default)]
struct LoopbackResolver;

#[async_trait]
impl HostResolver for LoopbackResolver {
    async fn lookup(&self, _host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
        Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
    }
}

/// Dials over TCP and remembers host and resolved target of every dial
#[derive(Debug, Default)]
struct RecordingDialer {
    dials: Mutex<Vec<(String, SocketAddr)>>,
}

#[async_trait]
impl Dialer for RecordingDialer {
    type Stream = TcpStream;

    async fn dial(&self, session: &ConnectSession) -> io::Result<TcpStream> {
        let ip = session.ip_address().await.map_err(io::Error::other)?;
        let target = SocketAddr::new(ip, session.port());
        self.dials.lock().push((session.host().to_string(), target));
        TcpStream::connect(target).await
    }
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

fn fake_dns() -> (Arc<DnsServer>, tokio::sync::mpsc::Receiver<bytes::Bytes>) {
    let matcher = StaticRuleMatcher::builder()
        .rule(StaticRule::new("relay", DnsVerdict::Fake).with_domain_suffix("relay.test"))
        .build()
        .unwrap();
    start_server(test_config(), matcher, None)
}

struct Proxy {
    addr: SocketAddr,
    nat: Arc<NatTable>,
    dialer: Arc<RecordingDialer>,
    events: broadcast::Receiver<Event>,
    shutdown: CancellationToken,
    running: tokio::task::JoinHandle<Result<(), fakeip_relay::ProxyError>>,
}

impl Proxy {
    fn start(dns: &Arc<DnsServer>) -> Self {
        let nat = Arc::new(NatTable::default());
        let dialer = Arc::new(RecordingDialer::default());
        let bus = EventBus::new(512);
        let events = bus.subscribe();
        let context = TunnelContext {
            resolve: ResolveContext::new(Arc::new(LoopbackResolver)).with_fake_ip(dns.clone()),
            adapters: Arc::new(DialerAdapterFactory::from_shared(dialer.clone(), 4096)),
            events: bus,
        };
        let config = ProxyConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..ProxyConfig::default()
        };
        let server = ProxyServer::bind(&config, context)
            .unwrap()
            .with_destination_lookup(nat.clone());
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(server.run(shutdown.clone()));
        Self {
            addr,
            nat,
            dialer,
            events,
            shutdown,
            running,
        }
    }

    /// Connect as if the client had asked for `destination`
    async fn connect_to(&self, destination: SocketAddr) -> TcpStream {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client = socket.local_addr().unwrap();
        self.nat.entries.lock().insert(client, destination);
        socket.connect(self.addr).await.unwrap()
    }

    async fn stop(mut self) -> Vec<Event> {
        self.shutdown.cancel();
        self.running.await.unwrap().unwrap();
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}

fn accepted(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::ProxyServer(ProxyServerEvent::NewSocketAccepted { .. })))
        .count()
}

#[tokio::test]
async fn test_fake_destination_dialed_from_accepted_connection() {
    let echo = echo_server().await;
    let (dns, mut answers) = fake_dns();
    ask(&dns, 0x7171, "echo.relay.test");
    let (fake_ip, _) = next_answer(&mut answers).await.first_a().unwrap();

    let proxy = Proxy::start(&dns);
    let mut client = proxy
        .connect_to(SocketAddr::new(IpAddr::V4(fake_ip), echo.port()))
        .await;

    client.write_all(b"accepted then dialed").await.unwrap();
    let mut buf = [0u8; 20];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"accepted then dialed");

    let dials = proxy.dialer.dials.lock().clone();
    assert_eq!(dials, vec![("echo.relay.test".to_string(), echo)]);
    assert!(dials.iter().all(|(_, target)| *target != proxy.addr));

    drop(client);
    let events = proxy.stop().await;
    assert_eq!(accepted(&events), 1);
}

#[tokio::test]
async fn test_destination_pointing_at_listener_is_not_dialed() {
    let (dns, _answers) = fake_dns();
    let proxy = Proxy::start(&dns);

    let mut client = proxy.connect_to(proxy.addr).await;
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(proxy.dialer.dials.lock().is_empty());
    let events = proxy.stop().await;
    assert_eq!(accepted(&events), 1);
}
