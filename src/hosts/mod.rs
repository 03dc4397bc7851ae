//! Managed hosts: the named endpoints of the virtual network.

mod controller;
mod table;
mod util;

pub use controller::Controller;
pub use table::Table;

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Serialize, Serializer};
use smoltcp::wire::EthernetAddress;

/// A managed logical endpoint with stable identity, MAC, and IPs.
///
/// Hosts are created through [`Controller::add_host`], which fills any
/// identity the caller leaves out; a stored host always has an id, a
/// name, a MAC, and at least one IPv6 address.
#[derive(Debug, Clone, Serialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    /// Local hosts live on the host-side `fd4c:bd56:5cee:8000::/64`
    /// subnet; remote hosts on `fd4c:bd56:5cee::/49`.
    pub local: bool,
    #[serde(serialize_with = "serialize_mac")]
    pub mac: EthernetAddress,
    pub ipv4_addrs: Vec<Ipv4Addr>,
    pub ipv6_addrs: Vec<Ipv6Addr>,
    pub up: bool,
}

impl Host {
    /// The host's primary (first) IPv4 address, if it has one.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4_addrs.first().copied()
    }

    /// The host's primary (first) IPv6 address.
    pub fn ipv6(&self) -> Option<Ipv6Addr> {
        self.ipv6_addrs.first().copied()
    }
}

fn serialize_mac<S: Serializer>(mac: &EthernetAddress, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(mac)
}

/// Request to insert a host. Unset identity fields are generated.
#[derive(Debug, Clone, Default)]
pub struct HostSpec {
    pub id: Option<String>,
    pub name: Option<String>,
    pub local: bool,
    pub mac: Option<EthernetAddress>,
    pub ipv4_addrs: Vec<Ipv4Addr>,
    pub ipv6_addrs: Vec<Ipv6Addr>,
    pub up: bool,
}

impl HostSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn ipv4(mut self, addr: Ipv4Addr) -> Self {
        self.ipv4_addrs.push(addr);
        self
    }

    pub fn ipv6(mut self, addr: Ipv6Addr) -> Self {
        self.ipv6_addrs.push(addr);
        self
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn up(mut self) -> Self {
        self.up = true;
        self
    }

    pub fn mac(mut self, mac: EthernetAddress) -> Self {
        self.mac = Some(mac);
        self
    }
}
