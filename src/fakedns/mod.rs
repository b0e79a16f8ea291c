//! FakeDNS - fake-IP DNS resolution for transparent routing
//!
//! Queries for domains that should be proxied are answered with an address
//! from a private pool instead of the real one. When a connection later
//! arrives for that address, the proxy recovers the original domain, the rule
//! that matched it, and any country tag through
//! [`DnsServer::lookup_session_by_fake_ip`].
//!
//! ## Flow
//!
//! 1. The IP stack offers each packet to [`DnsServer::input`]. IPv4/UDP
//!    queries for the listener are taken; everything else is declined.
//! 2. A/CNAME queries are matched by domain. A `fake` verdict is answered
//!    immediately from the [`AddressPool`]; other verdicts are sent to every
//!    upstream [`DnsResolver`] at once.
//! 3. The first upstream answer wins. If the domain phase was `unknown`, the
//!    answer's first A record decides (`fake` or `real`).
//! 4. Response packets leave through the output channel passed to
//!    [`DnsServerBuilder::build`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fakeip_relay::fakedns::{DnsServer, DnsUdpFront, FakeDnsConfig, UdpResolver};
//!
//! let (tx, rx) = tokio::sync::mpsc::channel(1024);
//! let server = Arc::new(
//!     DnsServer::builder(FakeDnsConfig::default())
//!         .matcher(matcher)
//!         .resolver(Arc::new(UdpResolver::new("1.1.1.1:53".parse()?, timeout)))
//!         .build(tx)?,
//! );
//! server.start();
//! DnsUdpFront::bind(server).await?.run(rx, cancel).await?;
//! ```

pub mod cache;
pub mod config;
pub mod packet;
pub mod pool;
pub mod resolver;
pub mod server;
pub mod session;
pub mod udp_front;

pub use cache::SessionCache;
pub use config::FakeDnsConfig;
pub use packet::{build_ipv4_udp, parse_ipv4_udp, UdpDatagram, MAX_UDP_PAYLOAD};
pub use pool::AddressPool;
pub use resolver::{DnsResolver, UdpResolver};
pub use server::{build_fake_response, CacheSnapshot, DnsServer, DnsServerBuilder, ListenerRegistry};
pub use session::{DnsQuery, DnsSession, MatchResult};
pub use udp_front::DnsUdpFront;

pub use smoltcp::wire::IpVersion;
