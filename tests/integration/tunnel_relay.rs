//! Connections to fake addresses relayed end to end

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;

use fakeip_relay::event::{Event, EventBus, TunnelEvent};
use fakeip_relay::fakedns::DnsServer;
use fakeip_relay::rules::{DnsVerdict, StaticRule, StaticRuleMatcher};
use fakeip_relay::session::{ConnectSession, EventSource, HostResolver, ResolveContext};
use fakeip_relay::tunnel::{DialerAdapterFactory, StreamProxySocket, TcpDialer, Tunnel, TunnelContext};

use super::common::{ask, next_answer, start_server, test_config};

/// Resolves every name to loopback and remembers what was asked
#[derive(Debug, Default)]
struct LoopbackResolver {
    asked: Mutex<Vec<String>>,
}

#[async_trait]
impl HostResolver for LoopbackResolver {
    async fn lookup(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
        self.asked.lock().push(host.to_string());
        Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
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

/// DNS server that fakes everything under `relay.test`
fn fake_dns() -> (Arc<DnsServer>, tokio::sync::mpsc::Receiver<bytes::Bytes>) {
    let matcher = StaticRuleMatcher::builder()
        .rule(StaticRule::new("relay", DnsVerdict::Fake).with_domain_suffix("relay.test"))
        .build()
        .unwrap();
    start_server(test_config(), matcher, None)
}

struct Relay {
    resolver: Arc<LoopbackResolver>,
    events: EventBus,
    context: TunnelContext,
}

impl Relay {
    fn new(dns: &Arc<DnsServer>) -> Self {
        let resolver = Arc::new(LoopbackResolver::default());
        let events = EventBus::new(512);
        let context = TunnelContext {
            resolve: ResolveContext::new(resolver.clone()).with_fake_ip(dns.clone()),
            adapters: Arc::new(DialerAdapterFactory::new(
                TcpDialer::new(Duration::from_secs(5)),
                4096,
            )),
            events: events.clone(),
        };
        Self {
            resolver,
            events,
            context,
        }
    }

    /// Client end of a tunnel whose original destination is `destination`
    fn connect(
        &self,
        destination: SocketAddr,
    ) -> (
        DuplexStream,
        tokio::task::JoinHandle<Option<Arc<ConnectSession>>>,
    ) {
        let (client, accepted) = tokio::io::duplex(4096);
        let socket = StreamProxySocket::new(accepted, destination, 4096);
        let tunnel = Tunnel::new(Box::new(socket), self.context.clone());
        (client, tokio::spawn(tunnel.run()))
    }
}

async fn finish(
    tunnel: tokio::task::JoinHandle<Option<Arc<ConnectSession>>>,
) -> Option<Arc<ConnectSession>> {
    tokio::time::timeout(Duration::from_secs(5), tunnel)
        .await
        .expect("tunnel did not close")
        .unwrap()
}

#[tokio::test]
async fn test_fake_destination_relayed_to_real_host() {
    let echo = echo_server().await;
    let (dns, mut answers) = fake_dns();
    ask(&dns, 0x4242, "echo.relay.test");
    let (fake_ip, _) = next_answer(&mut answers).await.first_a().unwrap();

    let relay = Relay::new(&dns);
    let mut events = relay.events.subscribe();
    let (mut client, tunnel) = relay.connect(SocketAddr::new(IpAddr::V4(fake_ip), echo.port()));

    client.write_all(b"hello over a fake address").await.unwrap();
    let mut buf = [0u8; 25];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello over a fake address");

    drop(client);
    let session = finish(tunnel).await.expect("session");

    assert_eq!(session.requested_host(), fake_ip.to_string());
    assert_eq!(session.host(), "echo.relay.test");
    assert_eq!(session.matched_rule().map(|r| r.tag()), Some("relay"));
    assert!(session.error().is_none());
    assert!(session.disconnected_by().is_some());
    assert_eq!(*relay.resolver.asked.lock(), vec!["echo.relay.test".to_string()]);

    let mut ready_signals = 0;
    let mut closed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::Tunnel(TunnelEvent::ReceivedReadySignal { .. }) => ready_signals += 1,
            Event::Tunnel(TunnelEvent::Closed { .. }) => closed = true,
            _ => {}
        }
    }
    assert_eq!(ready_signals, 2);
    assert!(closed);
}

#[tokio::test]
async fn test_unknown_fake_address_closes_client() {
    let (dns, _answers) = fake_dns();
    let relay = Relay::new(&dns);

    // Inside the pool but never handed out
    let stray = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 18, 0, 200)), 443);
    let (mut client, tunnel) = relay.connect(stray);

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(finish(tunnel).await.is_none());
    assert!(relay.resolver.asked.lock().is_empty());
}

#[tokio::test]
async fn test_unreachable_target_records_adapter_error() {
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (dns, mut answers) = fake_dns();
    ask(&dns, 0x5151, "down.relay.test");
    let (fake_ip, _) = next_answer(&mut answers).await.first_a().unwrap();

    let relay = Relay::new(&dns);
    let (mut client, tunnel) = relay.connect(SocketAddr::new(IpAddr::V4(fake_ip), closed_port));

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let session = finish(tunnel).await.expect("session");
    assert_eq!(session.host(), "down.relay.test");
    assert_eq!(
        session.error().map(io::Error::kind),
        Some(io::ErrorKind::ConnectionRefused)
    );
    assert_eq!(session.error_source(), Some(EventSource::Adapter));
}

#[tokio::test]
async fn test_close_handle_ends_idle_tunnel() {
    let echo = echo_server().await;
    let (dns, mut answers) = fake_dns();
    ask(&dns, 0x6161, "idle.relay.test");
    let (fake_ip, _) = next_answer(&mut answers).await.first_a().unwrap();

    let relay = Relay::new(&dns);
    let mut events = relay.events.subscribe();
    let (client, accepted) = tokio::io::duplex(4096);
    let socket = StreamProxySocket::new(
        accepted,
        SocketAddr::new(IpAddr::V4(fake_ip), echo.port()),
        4096,
    );
    let tunnel = Tunnel::new(Box::new(socket), relay.context.clone());
    let handle = tunnel.handle();
    let running = tokio::spawn(tunnel.run());

    // Wait until both sides are up before closing
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(
            event,
            Event::Tunnel(TunnelEvent::ReceivedReadySignal { count: 2, .. })
        ) {
            break;
        }
    }

    handle.close();
    let session = finish(running).await.expect("session");
    assert!(session.error().is_none());
    drop(client);
}
