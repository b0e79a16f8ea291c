//! Per-connection request context
//!
//! A [`ConnectSession`] is created for every accepted client connection. It
//! records the host the client asked for, swaps a fake address back to the
//! domain it stands for, and carries the routing decision made when that
//! domain was resolved so the same policy applies to the connection.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::SessionError;
use crate::fakedns::DnsSession;
use crate::rules::RuleHandle;

/// Which end of a tunnel something happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// Client-facing socket
    Proxy,
    /// Remote-facing socket
    Adapter,
    /// The tunnel itself
    Tunnel,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proxy => write!(f, "proxy"),
            Self::Adapter => write!(f, "adapter"),
            Self::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// Reverse lookup of fake addresses
pub trait FakeIpLookup: Send + Sync {
    /// Whether `addr` belongs to the fake address range
    fn is_fake_ip(&self, addr: Ipv4Addr) -> bool;

    /// DNS session that produced `addr`, if still cached
    fn lookup_session_by_fake_ip(&self, addr: Ipv4Addr) -> Option<Arc<DnsSession>>;
}

/// Forward name resolution
#[async_trait]
pub trait HostResolver: Send + Sync + fmt::Debug {
    /// Resolve `host` to one or more addresses
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the name cannot be resolved.
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Country lookup for an address
pub trait GeoIpLookup: Send + Sync {
    /// ISO country code for `ip`
    fn country(&self, ip: IpAddr) -> Option<String>;
}

/// Collaborators a [`ConnectSession`] resolves against
#[derive(Clone)]
pub struct ResolveContext {
    /// Fake-IP table, usually the DNS server
    pub fake_ip: Option<Arc<dyn FakeIpLookup>>,
    /// Forward resolver for domain hosts
    pub resolver: Arc<dyn HostResolver>,
    /// Country lookup
    pub geoip: Option<Arc<dyn GeoIpLookup>>,
    /// Whether literal addresses are checked against the fake-IP table
    pub fake_ip_enabled: bool,
}

impl Default for ResolveContext {
    fn default() -> Self {
        Self {
            fake_ip: None,
            resolver: Arc::new(SystemResolver),
            geoip: None,
            fake_ip_enabled: true,
        }
    }
}

impl fmt::Debug for ResolveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveContext")
            .field("fake_ip", &self.fake_ip.is_some())
            .field("resolver", &self.resolver)
            .field("geoip", &self.geoip.is_some())
            .field("fake_ip_enabled", &self.fake_ip_enabled)
            .finish()
    }
}

impl ResolveContext {
    /// Create a context using `resolver` for forward lookups
    #[must_use]
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver,
            ..Self::default()
        }
    }

    /// Attach the fake-IP table
    #[must_use]
    pub fn with_fake_ip(mut self, lookup: Arc<dyn FakeIpLookup>) -> Self {
        self.fake_ip = Some(lookup);
        self
    }

    /// Attach a country lookup
    #[must_use]
    pub fn with_geoip(mut self, geoip: Arc<dyn GeoIpLookup>) -> Self {
        self.geoip = Some(geoip);
        self
    }

    /// Enable or disable fake-IP handling
    #[must_use]
    pub fn with_fake_ip_enabled(mut self, enabled: bool) -> Self {
        self.fake_ip_enabled = enabled;
        self
    }
}

#[derive(Debug)]
struct DisconnectRecord {
    error: Option<io::Error>,
    source: EventSource,
}

/// Request context of one relayed connection
pub struct ConnectSession {
    requested_host: String,
    host: String,
    port: u16,
    fake_ip_enabled: bool,
    matched_rule: Option<RuleHandle>,
    fake_ip: Option<Arc<dyn FakeIpLookup>>,
    resolver: Arc<dyn HostResolver>,
    geoip: Option<Arc<dyn GeoIpLookup>>,
    ip_address: OnceCell<IpAddr>,
    country: OnceCell<Option<String>>,
    disconnect: OnceLock<DisconnectRecord>,
}

impl ConnectSession {
    /// Create a session for `host:port`
    ///
    /// With fake-IP enabled, a literal fake address is replaced by the domain
    /// it was handed out for and the DNS-time rule is inherited.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InconsistentFakeIpState` if `host` is a fake
    /// address with no cached DNS session.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        context: &ResolveContext,
    ) -> Result<Self, SessionError> {
        let host = host.into();
        let mut session = Self {
            requested_host: host.clone(),
            host,
            port,
            fake_ip_enabled: context.fake_ip_enabled,
            matched_rule: None,
            fake_ip: context.fake_ip.clone(),
            resolver: Arc::clone(&context.resolver),
            geoip: context.geoip.clone(),
            ip_address: OnceCell::new(),
            country: OnceCell::new(),
            disconnect: OnceLock::new(),
        };
        if session.fake_ip_enabled {
            session.resolve()?;
        }
        Ok(session)
    }

    fn resolve(&mut self) -> Result<(), SessionError> {
        let Some(lookup) = self.fake_ip.clone() else {
            return Ok(());
        };
        let Ok(address) = self.requested_host.parse::<Ipv4Addr>() else {
            return Ok(());
        };
        if !lookup.is_fake_ip(address) {
            return Ok(());
        }

        let dns = lookup
            .lookup_session_by_fake_ip(address)
            .ok_or(SessionError::InconsistentFakeIpState { address })?;

        self.host = dns.name();
        self.matched_rule = dns.matched_rule().cloned();
        if let Some(real) = dns.real_ip() {
            let _ = self.ip_address.set(IpAddr::V4(real));
        }
        if let Some(country) = dns.country_code() {
            let _ = self.country.set(Some(country.to_string()));
        }

        debug!(
            fake_ip = %address,
            host = %self.host,
            rule = ?self.matched_rule,
            "Fake address mapped back to domain"
        );
        Ok(())
    }

    /// Host as received from the client
    #[must_use]
    pub fn requested_host(&self) -> &str {
        &self.requested_host
    }

    /// Host to connect to
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Requested port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether fake-IP handling is on for this session
    #[must_use]
    pub fn fake_ip_enabled(&self) -> bool {
        self.fake_ip_enabled
    }

    /// Rule inherited from DNS resolution
    #[must_use]
    pub fn matched_rule(&self) -> Option<&RuleHandle> {
        self.matched_rule.as_ref()
    }

    /// Set the rule chosen for this connection
    pub fn set_matched_rule(&mut self, rule: RuleHandle) {
        self.matched_rule = Some(rule);
    }

    /// Check if `host` is an IP literal
    #[must_use]
    pub fn is_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// Real address to dial, resolved once
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Resolve` if forward resolution fails, or
    /// `SessionError::NoRealAddress` if it lands on a fake address whose DNS
    /// session holds no real address.
    pub async fn ip_address(&self) -> Result<IpAddr, SessionError> {
        self.ip_address
            .get_or_try_init(|| self.lookup_ip_address())
            .await
            .copied()
    }

    async fn lookup_ip_address(&self) -> Result<IpAddr, SessionError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let resolved = self
            .resolver
            .lookup(&self.host, self.port)
            .await
            .map_err(|source| SessionError::Resolve {
                host: self.host.clone(),
                source,
            })?;
        let ip = resolved
            .first()
            .copied()
            .ok_or_else(|| SessionError::Resolve {
                host: self.host.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
            })?;

        // Name resolution may itself go through the fake-IP server
        let (IpAddr::V4(v4), true, Some(lookup)) = (ip, self.fake_ip_enabled, &self.fake_ip) else {
            return Ok(ip);
        };
        if !lookup.is_fake_ip(v4) {
            return Ok(ip);
        }
        let Some(dns) = lookup.lookup_session_by_fake_ip(v4) else {
            return Ok(ip);
        };
        dns.real_ip()
            .map(IpAddr::V4)
            .ok_or_else(|| SessionError::NoRealAddress {
                host: self.host.clone(),
            })
    }

    /// Country of the dialed address, looked up once
    ///
    /// `None` if no country lookup is configured or the address resolves to
    /// no known country.
    pub async fn country(&self) -> Option<&str> {
        self.country
            .get_or_init(|| async {
                let geoip = self.geoip.as_ref()?;
                let ip = self.ip_address().await.ok()?;
                geoip.country(ip)
            })
            .await
            .as_deref()
    }

    /// Record that the connection ended
    ///
    /// Only the first call is kept. Returns whether this call was the first.
    pub fn disconnected(&self, error: Option<io::Error>, source: EventSource) -> bool {
        self.disconnect
            .set(DisconnectRecord { error, source })
            .is_ok()
    }

    /// Error that ended the connection
    #[must_use]
    pub fn error(&self) -> Option<&io::Error> {
        self.disconnect.get().and_then(|record| record.error.as_ref())
    }

    /// Side that reported the error
    #[must_use]
    pub fn error_source(&self) -> Option<EventSource> {
        self.disconnect
            .get()
            .filter(|record| record.error.is_some())
            .map(|record| record.source)
    }

    /// Side that first reported the disconnect
    #[must_use]
    pub fn disconnected_by(&self) -> Option<EventSource> {
        self.disconnect.get().map(|record| record.source)
    }
}

impl fmt::Debug for ConnectSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectSession")
            .field("requested_host", &self.requested_host)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("matched_rule", &self.matched_rule)
            .field("disconnected_by", &self.disconnected_by())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ConnectSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.requested_host == self.host {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{} -> {}:{}", self.requested_host, self.host, self.port)
        }
    }
}
