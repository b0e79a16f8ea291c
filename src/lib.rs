//! fakeip-relay: fake-IP DNS server and TCP relay
//!
//! This crate answers DNS queries with addresses drawn from a private pool,
//! remembers which domain each fake address stands for, and relays TCP
//! connections aimed at those addresses to the real destination.
//!
//! # Features
//!
//! - **Fake-IP DNS**: Per-query verdicts (fake, real, unknown, pass) from ordered rules
//! - **Reverse Lookup**: Fake destinations map back to domain, rule, and real address
//! - **Tunnel Relay**: Lockstep bidirectional forwarding between two sockets
//! - **Event Bus**: Typed lifecycle events for sockets, tunnels, and servers
//!
//! # Architecture
//!
//! ```text
//! DNS query → DnsServer → fake A record (198.18.x.y)
//!
//! Client → ProxyServer → Tunnel ─ ConnectSession (fake IP → domain) ─→ Adapter → Destination
//!                          ↓
//!                       EventBus
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fakeip_relay::config::load_config;
//! use fakeip_relay::fakedns::{DnsServer, FakeDnsConfig};
//! use fakeip_relay::rules::StaticRuleMatcher;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/fakeip-relay/config.json")?;
//! let matcher = StaticRuleMatcher::from_config(&config.dns)?;
//!
//! let (output, _packets) = tokio::sync::mpsc::channel(1024);
//! let server = DnsServer::builder(FakeDnsConfig::from(&config.dns))
//!     .matcher(Arc::new(matcher))
//!     .build(output)?;
//! server.start();
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`event`]: Event bus and event families
//! - [`fakedns`]: Fake-IP DNS server
//! - [`proxy`]: Client-facing listener and accept loop
//! - [`rules`]: DNS rule matching
//! - [`session`]: Per-connection target resolution
//! - [`tunnel`]: Relay engine and stream sockets

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod event;
pub mod fakedns;
pub mod proxy;
pub mod rules;
pub mod session;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use config::{Config, DnsConfig, ProxyConfig};
pub use error::{ConfigError, FakeDnsError, ProxyError, RelayError, SessionError, TunnelError};
pub use event::{Event, EventBus};
pub use fakedns::{AddressPool, DnsServer, DnsSession, FakeDnsConfig, ListenerRegistry};
pub use proxy::ProxyServer;
pub use rules::{DnsVerdict, RuleMatcher, StaticRuleMatcher};
pub use session::{ConnectSession, ResolveContext};
pub use tunnel::{Tunnel, TunnelContext, TunnelHandle, TunnelState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
