//! Per-host per-protocol ephemeral port allocation.
//!
//! Every outbound source port a route uses, and every rule source port, is
//! accounted for here so host-side proxy listeners and the forwarder never
//! collide. Automatic allocation draws from the ephemeral range
//! `[49152, 65535]`; explicit allocation records the requested port
//! verbatim and fails if it is already held.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::protocols::Protocol;

/// First port of the ephemeral range.
pub const EPHEMERAL_MIN: u16 = 49152;
/// Last port of the ephemeral range.
pub const EPHEMERAL_MAX: u16 = 65535;

#[derive(Default)]
struct PortPool {
    next: u32,
    allocated: BTreeSet<u16>,
}

impl PortPool {
    fn allocate(&mut self, port: u16) -> Result<u16> {
        if self.allocated.len() >= u16::MAX as usize {
            return Err(Error::PoolDepleted);
        }

        if port != 0 {
            if !self.allocated.insert(port) {
                return Err(Error::conflict(format!("port {port} is already allocated")));
            }
            return Ok(port);
        }

        // Scan upward from the cursor; wrapping twice without finding a
        // free slot means the range is full.
        let mut wraps = 0;
        loop {
            if self.next >= EPHEMERAL_MAX as u32 {
                self.next = EPHEMERAL_MIN as u32;
                wraps += 1;
                if wraps == 2 {
                    return Err(Error::PoolDepleted);
                }
            } else if self.next < EPHEMERAL_MIN as u32 {
                self.next = EPHEMERAL_MIN as u32;
            } else {
                self.next += 1;
            }

            let candidate = self.next as u16;
            if self.allocated.insert(candidate) {
                return Ok(candidate);
            }
        }
    }

    fn release(&mut self, port: u16) {
        self.allocated.remove(&port);
    }
}

#[derive(Default)]
struct HostPools {
    tcp: PortPool,
    udp: PortPool,
}

/// Port allocator covering every managed host.
///
/// The outer map takes a read-mostly lock; each host's pools sit behind
/// their own mutex so concurrent allocations on different hosts do not
/// contend.
#[derive(Default)]
pub struct PortAllocator {
    hosts: RwLock<HashMap<String, Arc<Mutex<HostPools>>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn host_pools(&self, host_id: &str) -> Arc<Mutex<HostPools>> {
        if let Some(pools) = self.hosts.read().unwrap().get(host_id) {
            return Arc::clone(pools);
        }
        let mut hosts = self.hosts.write().unwrap();
        Arc::clone(hosts.entry(host_id.to_string()).or_default())
    }

    /// Allocate `port` on `host_id` for `proto`. Port 0 picks the next
    /// free ephemeral port; a nonzero port must not already be held.
    pub fn allocate(&self, host_id: &str, proto: Protocol, port: u16) -> Result<u16> {
        let pools = self.host_pools(host_id);
        let mut pools = pools.lock().unwrap();
        match proto {
            Protocol::Tcp => pools.tcp.allocate(port),
            Protocol::Udp => pools.udp.allocate(port),
        }
    }

    /// Release a previously allocated port. Idempotent.
    pub fn release(&self, host_id: &str, proto: Protocol, port: u16) {
        let pools = self.host_pools(host_id);
        let mut pools = pools.lock().unwrap();
        match proto {
            Protocol::Tcp => pools.tcp.release(port),
            Protocol::Udp => pools.udp.release(port),
        }
    }

    /// Drop every allocation belonging to `host_id`.
    pub fn forget_host(&self, host_id: &str) {
        self.hosts.write().unwrap().remove(host_id);
    }

    /// Number of ports currently held by `host_id` for `proto`.
    pub fn allocated_count(&self, host_id: &str, proto: Protocol) -> usize {
        let Some(pools) = self.hosts.read().unwrap().get(host_id).cloned() else {
            return 0;
        };
        let pools = pools.lock().unwrap();
        match proto {
            Protocol::Tcp => pools.tcp.allocated.len(),
            Protocol::Udp => pools.udp.allocated.len(),
        }
    }
}
