//! Immutable host table snapshot with sorted indexes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use super::Host;

/// Read-only snapshot published by the host controller: one sorted index
/// per lookup key, searched by binary search.
#[derive(Default)]
pub struct Table {
    by_id: Vec<Arc<Host>>,
    by_name: Vec<Arc<Host>>,
    by_ipv4: Vec<(Ipv4Addr, Arc<Host>)>,
    by_ipv6: Vec<(Ipv6Addr, Arc<Host>)>,
}

impl Table {
    pub(super) fn build(hosts: Vec<Arc<Host>>) -> Self {
        let mut by_id = hosts.clone();
        by_id.sort_by(|a, b| a.id.cmp(&b.id));

        let mut by_name = hosts.clone();
        by_name.sort_by(|a, b| a.name.cmp(&b.name));

        let mut by_ipv4 = Vec::new();
        let mut by_ipv6 = Vec::new();
        for host in &hosts {
            for &ip in &host.ipv4_addrs {
                by_ipv4.push((ip, Arc::clone(host)));
            }
            for &ip in &host.ipv6_addrs {
                by_ipv6.push((ip, Arc::clone(host)));
            }
        }
        by_ipv4.sort_by_key(|(ip, _)| ip.octets());
        by_ipv6.sort_by_key(|(ip, _)| ip.octets());

        Self { by_id, by_name, by_ipv4, by_ipv6 }
    }

    /// All hosts, ordered by name.
    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.by_name
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Match a host by a unique id prefix of at least 8 characters
    /// (a full id always matches itself).
    pub fn lookup_by_id(&self, id: &str) -> Option<Arc<Host>> {
        if id.len() < 8 {
            return None;
        }
        let idx = self.by_id.partition_point(|h| h.id.as_str() < id);
        let host = self.by_id.get(idx)?;
        if !host.id.starts_with(id) {
            return None;
        }
        Some(Arc::clone(host))
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Host>> {
        let idx = self
            .by_name
            .binary_search_by(|h| h.name.as_str().cmp(name))
            .ok()?;
        Some(Arc::clone(&self.by_name[idx]))
    }

    /// Id match first, then name.
    pub fn lookup_by_name_or_id(&self, key: &str) -> Option<Arc<Host>> {
        self.lookup_by_id(key).or_else(|| self.lookup_by_name(key))
    }

    pub fn lookup_by_ipv4(&self, ip: Ipv4Addr) -> Option<Arc<Host>> {
        let idx = self
            .by_ipv4
            .binary_search_by(|(addr, _)| addr.octets().cmp(&ip.octets()))
            .ok()?;
        Some(Arc::clone(&self.by_ipv4[idx].1))
    }

    pub fn lookup_by_ipv6(&self, ip: Ipv6Addr) -> Option<Arc<Host>> {
        let idx = self
            .by_ipv6
            .binary_search_by(|(addr, _)| addr.octets().cmp(&ip.octets()))
            .ok()?;
        Some(Arc::clone(&self.by_ipv6[idx].1))
    }

    /// Family-normalizing lookup: v4-mapped IPv6 addresses hit the IPv4
    /// index.
    pub fn lookup_by_ip(&self, ip: IpAddr) -> Option<Arc<Host>> {
        match ip {
            IpAddr::V4(v4) => self.lookup_by_ipv4(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self.lookup_by_ipv4(v4),
                None => self.lookup_by_ipv6(v6),
            },
        }
    }
}
