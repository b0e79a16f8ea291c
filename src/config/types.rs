//! Configuration types for fakeip-relay
//!
//! This module defines all configuration structures used by the relay.
//! Configuration is loaded from JSON files and validated at startup.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::rules::DnsVerdict;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Fake-IP DNS server
    #[serde(default)]
    pub dns: DnsConfig,

    /// Proxy listener and tunnels
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Event bus
    #[serde(default)]
    pub events: EventConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dns.validate()?;
        self.proxy.validate()?;
        self.log.validate()?;
        self.events.validate()?;
        Ok(())
    }

    /// Create a default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            dns: DnsConfig {
                upstreams: vec![SocketAddr::from(([1, 1, 1, 1], 53))],
                ..DnsConfig::default()
            },
            ..Self::default()
        }
    }
}

/// DNS server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Address the DNS server answers on
    #[serde(default = "default_dns_listen")]
    pub listen: SocketAddrV4,

    /// Range fake addresses are drawn from; `None` disables fake answers
    #[serde(default = "default_fake_ip_pool")]
    pub fake_ip_pool: Option<Ipv4Net>,

    /// TTL written into fake A records
    #[serde(default = "default_fake_ip_ttl_secs")]
    pub fake_ip_ttl_secs: u64,

    /// How long a query waits for an upstream answer
    #[serde(default = "default_pending_session_lifetime_secs")]
    pub pending_session_lifetime_secs: u64,

    /// Upstream DNS servers; every query is sent to all of them
    #[serde(default)]
    pub upstreams: Vec<SocketAddr>,

    /// Per-upstream receive timeout
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    /// Ordered DNS rules
    #[serde(default)]
    pub rules: Vec<DnsRuleConfig>,

    /// Verdict when no rule matches
    #[serde(default)]
    pub default_verdict: Option<DnsVerdict>,
}

impl DnsConfig {
    /// Validate DNS configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fake_ip_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "dns.fake_ip_ttl_secs must be greater than zero".into(),
            ));
        }
        if u32::try_from(self.fake_ip_ttl_secs).is_err() {
            return Err(ConfigError::ValidationError(
                "dns.fake_ip_ttl_secs does not fit a DNS TTL".into(),
            ));
        }
        if self.pending_session_lifetime_secs == 0 {
            return Err(ConfigError::ValidationError(
                "dns.pending_session_lifetime_secs must be greater than zero".into(),
            ));
        }
        if self.upstream_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dns.upstream_timeout_ms must be greater than zero".into(),
            ));
        }

        if let Some(pool) = self.fake_ip_pool {
            if pool.hosts().next().is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "dns.fake_ip_pool {pool} has no usable addresses"
                )));
            }
            if pool.contains(self.listen.ip()) {
                return Err(ConfigError::ValidationError(format!(
                    "dns.listen {} lies inside dns.fake_ip_pool {pool}",
                    self.listen
                )));
            }
        }

        let mut tags = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !tags.insert(rule.tag.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate DNS rule tag: {}",
                    rule.tag
                )));
            }
        }

        if self.default_verdict == Some(DnsVerdict::Pass) {
            return Err(ConfigError::ValidationError(
                "dns.default_verdict cannot be 'pass'".into(),
            ));
        }

        Ok(())
    }

    /// TTL for fake records
    #[must_use]
    pub fn fake_ip_ttl(&self) -> Duration {
        Duration::from_secs(self.fake_ip_ttl_secs)
    }

    /// Lifetime of a pending query
    #[must_use]
    pub fn pending_session_lifetime(&self) -> Duration {
        Duration::from_secs(self.pending_session_lifetime_secs)
    }

    /// Upstream receive timeout
    #[must_use]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen: default_dns_listen(),
            fake_ip_pool: default_fake_ip_pool(),
            fake_ip_ttl_secs: default_fake_ip_ttl_secs(),
            pending_session_lifetime_secs: default_pending_session_lifetime_secs(),
            upstreams: Vec::new(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            rules: Vec::new(),
            default_verdict: None,
        }
    }
}

/// One DNS rule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsRuleConfig {
    /// Rule tag, carried into sessions as the matched rule
    pub tag: String,

    /// Exact domains
    #[serde(default)]
    pub domains: Vec<String>,

    /// Domain suffixes (match the domain and its subdomains)
    #[serde(default)]
    pub domain_suffixes: Vec<String>,

    /// Networks matched against the resolved address
    #[serde(default)]
    pub cidrs: Vec<Ipv4Net>,

    /// Decision for matching queries
    pub verdict: DnsVerdict,

    /// Country code attached to matches
    #[serde(default)]
    pub country: Option<String>,
}

impl DnsRuleConfig {
    /// Validate a single rule
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tag.is_empty() {
            return Err(ConfigError::ValidationError(
                "DNS rule tag cannot be empty".into(),
            ));
        }
        if self.domains.is_empty() && self.domain_suffixes.is_empty() && self.cidrs.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "DNS rule '{}' has no domains, domain_suffixes or cidrs",
                self.tag
            )));
        }
        if self.verdict == DnsVerdict::Pass {
            return Err(ConfigError::ValidationError(format!(
                "DNS rule '{}' cannot use verdict 'pass'",
                self.tag
            )));
        }
        Ok(())
    }
}

/// Proxy listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Listen address
    #[serde(default = "default_proxy_listen")]
    pub listen: SocketAddr,

    /// Set `IP_TRANSPARENT` on the listener (Linux, needs `CAP_NET_ADMIN`)
    ///
    /// TPROXY connections carry their destination as the local address.
    /// Without this flag the destination is read with `SO_ORIGINAL_DST`,
    /// which expects an iptables `REDIRECT` rule in front of the listener.
    #[serde(default)]
    pub transparent: bool,

    /// TCP listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Maximum concurrent tunnels
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Outbound connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Read buffer size per socket
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Map fake destinations back to real ones
    #[serde(default = "default_true")]
    pub fake_ip_enabled: bool,
}

impl ProxyConfig {
    /// Validate proxy configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::ValidationError(
                "proxy.backlog must be greater than zero".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "proxy.max_connections must be greater than zero".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "proxy.connect_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.buffer_size < 512 || self.buffer_size > 1024 * 1024 {
            return Err(ConfigError::ValidationError(format!(
                "proxy.buffer_size {} out of range (512..=1048576)",
                self.buffer_size
            )));
        }
        Ok(())
    }

    /// Outbound connect timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_proxy_listen(),
            transparent: false,
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            buffer_size: default_buffer_size(),
            fake_ip_enabled: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include module targets
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the format is unknown.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown log format: {other}"
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventConfig {
    /// Broadcast channel capacity; slow observers lose the oldest events
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl EventConfig {
    /// Validate event configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if capacity is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "events.capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_dns_listen() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(198, 19, 0, 53), 53)
}

#[allow(clippy::unnecessary_wraps)]
fn default_fake_ip_pool() -> Option<Ipv4Net> {
    Ipv4Net::new(Ipv4Addr::new(198, 18, 0, 0), 16).ok()
}

fn default_fake_ip_ttl_secs() -> u64 {
    300
}

fn default_pending_session_lifetime_secs() -> u64 {
    10
}

fn default_upstream_timeout_ms() -> u64 {
    5000
}

fn default_proxy_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7893))
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    4096
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_event_capacity() -> usize {
    1024
}
