//! Shared helpers for integration tests

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use fakeip_relay::fakedns::{
    build_ipv4_udp, parse_ipv4_udp, DnsServer, FakeDnsConfig, IpVersion, UdpResolver,
};
use fakeip_relay::rules::StaticRuleMatcher;

/// Client address written into query packets
pub const CLIENT: &str = "10.0.0.2:40000";

/// DNS listener used by every test server
pub const LISTENER: &str = "198.19.0.53:53";

/// Fake pool used by every test server
pub const POOL: &str = "198.18.0.0/24";

/// Raw DNS query for `name`
pub fn query(id: u16, name: &str, record_type: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(
        Name::from_ascii(format!("{name}.")).unwrap(),
        record_type,
    ));
    message.to_vec().unwrap()
}

/// Query wrapped in an IPv4/UDP packet from [`CLIENT`] to [`LISTENER`]
pub fn query_packet(id: u16, name: &str) -> Bytes {
    build_ipv4_udp(
        CLIENT.parse().unwrap(),
        LISTENER.parse().unwrap(),
        &query(id, name, RecordType::A),
    )
    .unwrap()
}

/// A decoded answer packet
#[derive(Debug)]
pub struct Answer {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub message: Message,
}

impl Answer {
    /// First A record and its TTL
    pub fn first_a(&self) -> Option<(Ipv4Addr, u32)> {
        self.message
            .answers()
            .iter()
            .find_map(|record| match record.data() {
                Some(RData::A(a)) => Some((a.0, record.ttl())),
                _ => None,
            })
    }
}

/// Wait for the next packet the server emits and decode it
pub async fn next_answer(output: &mut mpsc::Receiver<Bytes>) -> Answer {
    let packet = tokio::time::timeout(Duration::from_secs(5), output.recv())
        .await
        .expect("no answer from DNS server")
        .expect("DNS output closed");
    let datagram = parse_ipv4_udp(&packet).unwrap();
    Answer {
        source: datagram.source,
        destination: datagram.destination,
        message: Message::from_vec(datagram.payload).unwrap(),
    }
}

/// Started server over [`LISTENER`] and [`POOL`]
pub fn start_server(
    config: FakeDnsConfig,
    matcher: StaticRuleMatcher,
    upstream: Option<SocketAddr>,
) -> (Arc<DnsServer>, mpsc::Receiver<Bytes>) {
    let (output, packets) = mpsc::channel(64);
    let mut builder = DnsServer::builder(config).matcher(Arc::new(matcher));
    if let Some(upstream) = upstream {
        builder = builder.resolver(Arc::new(UdpResolver::new(
            upstream,
            Duration::from_secs(2),
        )));
    }
    let server = Arc::new(builder.build(output).unwrap());
    server.start();
    (server, packets)
}

/// Server config with the shared listener and pool
pub fn test_config() -> FakeDnsConfig {
    FakeDnsConfig::new(LISTENER.parse().unwrap()).with_pool(POOL.parse().unwrap())
}

/// Feed one A query to the server
pub fn ask(server: &DnsServer, id: u16, name: &str) {
    assert!(server.input(&query_packet(id, name), IpVersion::Ipv4));
}

/// UDP upstream that answers every A query with `ip`
pub async fn scripted_upstream(ip: Ipv4Addr) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let Ok(request) = Message::from_vec(&buf[..n]) else {
                continue;
            };
            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);
            response.set_recursion_available(true);
            for q in request.queries() {
                response.add_query(q.clone());
                response.add_answer(Record::from_rdata(q.name().clone(), 60, RData::A(A(ip))));
            }
            let _ = socket.send_to(&response.to_vec().unwrap(), peer).await;
        }
    });
    addr
}
