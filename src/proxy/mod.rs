//! Client-facing proxy server
//!
//! - [`listener`]: Listening socket setup, optionally transparent
//! - [`server`]: Accept loop spawning one tunnel per connection

pub mod listener;
pub mod server;

pub use listener::{
    bind_listener, is_listener_address, original_destination, DestinationLookup, SocketDestination,
};
pub use server::ProxyServer;
