//! Configuration module for fakeip-relay
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use fakeip_relay::config::load_config;
//!
//! let config = load_config("/etc/fakeip-relay/config.json").unwrap();
//! println!("DNS listener: {}", config.dns.listen);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{Config, DnsConfig, DnsRuleConfig, EventConfig, LogConfig, ProxyConfig};
