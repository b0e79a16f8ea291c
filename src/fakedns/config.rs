//! FakeDNS server configuration
//!
//! Runtime settings for a [`DnsServer`](super::DnsServer), built directly or
//! from the `dns` section of the configuration file.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use ipnet::Ipv4Net;

use crate::config::DnsConfig;

/// Configuration for the FakeDNS server
#[derive(Debug, Clone)]
pub struct FakeDnsConfig {
    /// Address and port queries must be sent to
    pub listen: SocketAddrV4,
    /// Fake address range; `None` answers every query with real data
    pub pool: Option<Ipv4Net>,
    /// TTL written into fake A records
    ///
    /// Fake sessions stay cached for twice this long so clients that honour
    /// the TTL never connect to an address that was already recycled.
    pub fake_ip_ttl: Duration,
    /// How long a query waits for any upstream answer
    pub pending_session_lifetime: Duration,
}

impl Default for FakeDnsConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddrV4::new(Ipv4Addr::new(198, 19, 0, 53), 53),
            pool: Ipv4Net::new(Ipv4Addr::new(198, 18, 0, 0), 16).ok(),
            fake_ip_ttl: Duration::from_secs(300),
            pending_session_lifetime: Duration::from_secs(10),
        }
    }
}

impl FakeDnsConfig {
    /// Create a config listening on `listen` with default settings
    #[must_use]
    pub fn new(listen: SocketAddrV4) -> Self {
        Self {
            listen,
            ..Self::default()
        }
    }

    /// Set the fake address pool
    #[must_use]
    pub fn with_pool(mut self, pool: Ipv4Net) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Disable fake answers
    #[must_use]
    pub fn without_pool(mut self) -> Self {
        self.pool = None;
        self
    }

    /// Set the fake record TTL
    #[must_use]
    pub fn with_fake_ip_ttl(mut self, ttl: Duration) -> Self {
        self.fake_ip_ttl = ttl;
        self
    }

    /// Set the pending session lifetime
    #[must_use]
    pub fn with_pending_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.pending_session_lifetime = lifetime;
        self
    }

    /// TTL in whole seconds as written on the wire
    #[must_use]
    pub fn fake_ip_ttl_secs(&self) -> u32 {
        u32::try_from(self.fake_ip_ttl.as_secs()).unwrap_or(u32::MAX)
    }

    /// How long a fake session stays cached
    #[must_use]
    pub fn fake_session_lifetime(&self) -> Duration {
        self.fake_ip_ttl.saturating_mul(2)
    }
}

impl From<&DnsConfig> for FakeDnsConfig {
    fn from(config: &DnsConfig) -> Self {
        Self {
            listen: config.listen,
            pool: config.fake_ip_pool,
            fake_ip_ttl: config.fake_ip_ttl(),
            pending_session_lifetime: config.pending_session_lifetime(),
        }
    }
}
