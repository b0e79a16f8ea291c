//! DNS queries answered by the server and mapped back by `ConnectSession`

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use hickory_proto::op::ResponseCode;
use ipnet::Ipv4Net;

use fakeip_relay::error::SessionError;
use fakeip_relay::fakedns::IpVersion;
use fakeip_relay::rules::{DnsVerdict, StaticRule, StaticRuleMatcher};
use fakeip_relay::session::{ConnectSession, ResolveContext};

use super::common::{
    ask, next_answer, query_packet, scripted_upstream, start_server, test_config, CLIENT,
    LISTENER, POOL,
};

fn fake_suffix(tag: &str, suffix: &str) -> StaticRuleMatcher {
    StaticRuleMatcher::builder()
        .rule(StaticRule::new(tag, DnsVerdict::Fake).with_domain_suffix(suffix))
        .default_verdict(DnsVerdict::Real)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_fake_answer_maps_back_to_domain() {
    let (server, mut output) = start_server(
        test_config().with_fake_ip_ttl(Duration::from_secs(120)),
        fake_suffix("relay", "relay.test"),
        None,
    );

    ask(&server, 0x0101, "Echo.Relay.Test");
    let answer = next_answer(&mut output).await;

    assert_eq!(answer.source, LISTENER.parse().unwrap());
    assert_eq!(answer.destination, CLIENT.parse().unwrap());
    assert_eq!(answer.message.id(), 0x0101);
    assert_eq!(answer.message.response_code(), ResponseCode::NoError);

    let (fake_ip, ttl) = answer.first_a().expect("fake A record");
    assert_eq!(ttl, 120);
    assert!(POOL.parse::<Ipv4Net>().unwrap().contains(&fake_ip));
    assert!(server.is_fake_ip(fake_ip));

    let context = ResolveContext::default().with_fake_ip(server.clone());
    let session = ConnectSession::new(fake_ip.to_string(), 443, &context).unwrap();
    assert_eq!(session.requested_host(), fake_ip.to_string());
    // Rules match case-insensitively; the host keeps the client's spelling
    assert_eq!(session.host(), "Echo.Relay.Test");
    assert_eq!(session.port(), 443);
    assert_eq!(session.matched_rule().map(|r| r.tag()), Some("relay"));
    assert_eq!(
        session.to_string(),
        format!("{fake_ip} -> Echo.Relay.Test:443")
    );

    let snapshot = server.snapshot().await;
    assert_eq!(snapshot.fake_sessions, 1);
    assert_eq!(snapshot.pending_sessions, 0);
    assert_eq!(snapshot.allocated_addresses, 1);
}

#[tokio::test]
async fn test_distinct_domains_get_distinct_addresses() {
    let (server, mut output) = start_server(test_config(), fake_suffix("all", "test"), None);

    ask(&server, 1, "a.test");
    ask(&server, 2, "b.test");
    let first = next_answer(&mut output).await.first_a().unwrap().0;
    let second = next_answer(&mut output).await.first_a().unwrap().0;
    assert_ne!(first, second);

    let hosts: Vec<String> = [first, second]
        .iter()
        .map(|ip| server.lookup_session_by_fake_ip(*ip).unwrap().domain())
        .collect();
    assert!(hosts.contains(&"a.test".to_string()));
    assert!(hosts.contains(&"b.test".to_string()));
}

#[tokio::test]
async fn test_address_rule_fakes_after_real_resolution() {
    let upstream = scripted_upstream(Ipv4Addr::new(93, 184, 216, 34)).await;
    let matcher = StaticRuleMatcher::builder()
        .rule(
            StaticRule::new("edge", DnsVerdict::Fake)
                .with_cidr("93.184.216.0/24".parse().unwrap())
                .with_country("US"),
        )
        .default_verdict(DnsVerdict::Unknown)
        .build()
        .unwrap();
    let (server, mut output) = start_server(test_config(), matcher, Some(upstream));

    ask(&server, 0x2222, "example.org");
    let answer = next_answer(&mut output).await;
    assert_eq!(answer.message.id(), 0x2222);
    let (fake_ip, _) = answer.first_a().unwrap();
    assert!(server.is_fake_ip(fake_ip));

    let context = ResolveContext::default().with_fake_ip(server.clone());
    let session = ConnectSession::new(fake_ip.to_string(), 80, &context).unwrap();
    assert_eq!(session.host(), "example.org");
    assert_eq!(session.matched_rule().map(|r| r.tag()), Some("edge"));
    assert_eq!(
        session.ip_address().await.unwrap(),
        IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))
    );
    assert_eq!(session.country().await, Some("US"));
}

#[tokio::test]
async fn test_real_verdict_forwards_upstream_answer() {
    let upstream = scripted_upstream(Ipv4Addr::new(203, 0, 113, 7)).await;
    let (server, mut output) = start_server(
        test_config(),
        fake_suffix("relay", "relay.test"),
        Some(upstream),
    );

    ask(&server, 0x3333, "www.example.net");
    let answer = next_answer(&mut output).await;
    assert_eq!(answer.message.id(), 0x3333);
    assert_eq!(answer.destination, CLIENT.parse().unwrap());
    assert_eq!(answer.first_a().map(|(ip, _)| ip), Some(Ipv4Addr::new(203, 0, 113, 7)));

    let snapshot = server.snapshot().await;
    assert_eq!(snapshot.fake_sessions, 0);
    assert_eq!(snapshot.pending_sessions, 0);
    assert_eq!(snapshot.allocated_addresses, 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_fake_address_is_inconsistent() {
    let (server, mut output) = start_server(
        test_config().with_fake_ip_ttl(Duration::from_secs(1)),
        fake_suffix("relay", "relay.test"),
        None,
    );

    ask(&server, 7, "gone.relay.test");
    let (fake_ip, _) = next_answer(&mut output).await.first_a().unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(server.snapshot().await.fake_sessions, 0);
    assert!(server.lookup_session_by_fake_ip(fake_ip).is_none());
    assert!(server.is_fake_ip(fake_ip));

    let context = ResolveContext::default().with_fake_ip(server.clone());
    match ConnectSession::new(fake_ip.to_string(), 443, &context) {
        Err(SessionError::InconsistentFakeIpState { address }) => assert_eq!(address, fake_ip),
        other => panic!("expected inconsistent fake-IP state, got {other:?}"),
    }

    // Without fake-IP handling the literal address passes through
    let context = context.with_fake_ip_enabled(false);
    let session = ConnectSession::new(fake_ip.to_string(), 443, &context).unwrap();
    assert_eq!(session.host(), fake_ip.to_string());
}

#[tokio::test]
async fn test_stopped_server_declines_packets() {
    let (server, _output) = start_server(test_config(), fake_suffix("x", "test"), None);
    server.stop();
    assert!(server.is_stopped());
    assert!(!server.input(&query_packet(9, "late.test"), IpVersion::Ipv4));
}
