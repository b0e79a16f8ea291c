//! Integration tests for fakeip-relay
//!
//! # Test Organization
//!
//! - `common`: DNS packet helpers and a scripted upstream
//! - `fake_ip_roundtrip`: Queries through the DNS server and back through `ConnectSession`
//! - `tunnel_relay`: Fake destinations relayed end to end over TCP
//! - `proxy_relay`: Accepted connections mapped to their destination and dialed
//!
//! All tests run on loopback and need no privileges.

pub mod common;
pub mod fake_ip_roundtrip;
pub mod proxy_relay;
pub mod tunnel_relay;
