//! Fake IP address pool
//!
//! Addresses are handed out from a rotating cursor over the usable hosts of a
//! configured IPv4 network, so a released address is the last to be reused.
//! An address returned by [`AddressPool::fetch`] is never returned again until
//! it has been [`AddressPool::release`]d.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;

use crate::error::FakeDnsError;

/// Bounded pool of fake IPv4 addresses
#[derive(Debug)]
pub struct AddressPool {
    /// The network range for membership testing
    network: Ipv4Net,
    /// First usable host
    first: u32,
    /// Number of usable hosts
    size: u32,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    /// Offset of the next candidate from `first`
    cursor: u32,
    allocated: HashSet<Ipv4Addr>,
}

impl AddressPool {
    /// Create a pool over the usable hosts of `network`
    ///
    /// # Errors
    ///
    /// Returns `FakeDnsError::PoolExhausted` if the network has no usable host.
    pub fn new(network: Ipv4Net) -> Result<Self, FakeDnsError> {
        let mut hosts = network.hosts();
        let first = hosts.next().ok_or(FakeDnsError::PoolExhausted)?;
        let last = hosts.last().unwrap_or(first);
        let size = u32::from(last) - u32::from(first) + 1;

        Ok(Self {
            network,
            first: u32::from(first),
            size,
            state: Mutex::new(PoolState {
                cursor: 0,
                allocated: HashSet::new(),
            }),
        })
    }

    /// Allocate an unused address
    ///
    /// # Errors
    ///
    /// Returns `FakeDnsError::PoolExhausted` when every address is allocated.
    pub fn fetch(&self) -> Result<Ipv4Addr, FakeDnsError> {
        let mut state = self.state.lock();

        if state.allocated.len() as u64 >= u64::from(self.size) {
            return Err(FakeDnsError::PoolExhausted);
        }

        // A free slot exists, so this finds one within `size` steps
        for _ in 0..self.size {
            let addr = Ipv4Addr::from(self.first + state.cursor);
            state.cursor = (state.cursor + 1) % self.size;
            if state.allocated.insert(addr) {
                return Ok(addr);
            }
        }

        Err(FakeDnsError::PoolExhausted)
    }

    /// Return an address to the pool
    ///
    /// Returns `false` if the address was not allocated.
    pub fn release(&self, addr: Ipv4Addr) -> bool {
        self.state.lock().allocated.remove(&addr)
    }

    /// Check if an address is within this pool's range
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr)
    }

    /// Check if an address is currently handed out
    #[must_use]
    pub fn is_allocated(&self, addr: Ipv4Addr) -> bool {
        self.state.lock().allocated.contains(&addr)
    }

    /// Number of addresses currently handed out
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.state.lock().allocated.len()
    }

    /// Number of addresses still free
    #[must_use]
    pub fn available(&self) -> usize {
        self.size as usize - self.allocated_count()
    }

    /// Total number of usable addresses
    #[must_use]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Get the network range
    #[must_use]
    pub fn network(&self) -> Ipv4Net {
        self.network
    }
}
