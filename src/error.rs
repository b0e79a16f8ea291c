//! Error types for fakeip-relay
//!
//! Errors are grouped by subsystem. Each group reports whether the failure is
//! recoverable so callers can decide between degrading, retrying, or giving up.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use thiserror::Error;

/// Top-level error type for fakeip-relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Fake-IP DNS errors
    #[error("FakeDNS error: {0}")]
    FakeDns(#[from] FakeDnsError),

    /// Connect session resolution errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Tunnel state machine errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Proxy listener errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::FakeDns(e) => e.is_recoverable(),
            Self::Session(e) => e.is_recoverable(),
            Self::Tunnel(e) => e.is_recoverable(),
            Self::Proxy(e) => e.is_recoverable(),
            Self::Io(e) => io_is_recoverable(e),
        }
    }
}

fn io_is_recoverable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
    )
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Fake-IP DNS errors
#[derive(Debug, Error)]
pub enum FakeDnsError {
    /// No free address left in the fake-IP pool
    #[error("Fake IP pool exhausted")]
    PoolExhausted,

    /// Packet could not be parsed as an IPv4/UDP DNS query
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Pending query was evicted before any upstream answered
    #[error("Upstream resolution timed out for transaction {transaction_id}")]
    UpstreamTimeout { transaction_id: u16 },

    /// A response could not be encoded
    #[error("Failed to build DNS response: {0}")]
    ResponseBuild(String),

    /// Another DNS server already owns this listener
    #[error("DNS listener {0} is already registered")]
    ListenerInUse(SocketAddrV4),

    /// The upstream answered with something unusable
    #[error("Upstream {server} error: {reason}")]
    Upstream { server: SocketAddr, reason: String },

    /// I/O error talking to an upstream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FakeDnsError {
    /// Create a malformed packet error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPacket(reason.into())
    }

    /// Create an upstream error
    pub fn upstream(server: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Upstream {
            server,
            reason: reason.into(),
        }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::PoolExhausted | Self::UpstreamTimeout { .. } | Self::Upstream { .. } => true,
            Self::MalformedPacket(_) | Self::ResponseBuild(_) | Self::ListenerInUse(_) => false,
            Self::Io(e) => io_is_recoverable(e),
        }
    }
}

/// Connect session resolution errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// A literal address is inside the fake range but no DNS session backs it
    #[error("Fake IP {address} has no cached DNS session")]
    InconsistentFakeIpState { address: Ipv4Addr },

    /// Forward name resolution failed
    #[error("Failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// The host resolved to a fake address whose real address is unknown
    #[error("No real address known for {host}")]
    NoRealAddress { host: String },
}

impl SessionError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InconsistentFakeIpState { .. } => false,
            Self::Resolve { source, .. } => io_is_recoverable(source),
            Self::NoRealAddress { .. } => true,
        }
    }
}

/// Tunnel state machine errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Operation not allowed in the tunnel's current state
    #[error("Invalid tunnel state: {0}")]
    InvalidTunnelState(String),
}

impl TunnelError {
    /// Tunnel state errors are programming errors
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Proxy listener errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to create the listening socket
    #[error("Failed to create socket: {0}")]
    SocketCreation(String),

    /// Failed to set a socket option
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// `IP_TRANSPARENT` requires `CAP_NET_ADMIN`
    #[error("Permission denied: transparent mode requires CAP_NET_ADMIN capability")]
    PermissionDenied,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => io_is_recoverable(e),
            _ => false,
        }
    }
}

/// Result type alias for fakeip-relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
