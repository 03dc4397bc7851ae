//! Connection-tracked bidirectional NAT routes.
//!
//! A [`Route`] is one direction of a tracked flow: packets matching its
//! inbound 4-tuple are rewritten to its outbound 4-tuple. Every route is
//! stored together with its reverse; both reference the same [`Flow`],
//! which carries last-seen time and counters and decides expiry.

mod controller;
mod flow;
mod table;

pub use controller::Controller;
pub use flow::{unix_now, Flow, FlowStats, FLOW_TIMEOUT_SECS};
pub use table::Table;

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

use crate::protocols::Protocol;

/// Normalize any address to the 16-byte form used as a table key
/// (IPv4 becomes its v4-mapped IPv6 equivalent).
pub fn normalize_ip(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Undo [`normalize_ip`]: a v4-mapped address comes back as IPv4.
pub fn denormalize_ip(ip: Ipv6Addr) -> IpAddr {
    match ip.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(ip),
    }
}

/// One (address, port) pair, address in 16-byte normal form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", denormalize_ip(self.ip), self.port)
    }
}

/// A directed (source, destination) endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream {
    pub src: Endpoint,
    pub dst: Endpoint,
}

/// Which side of its flow a stored route is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Rx,
    Tx,
}

/// A live NAT mapping for one direction of a flow.
#[derive(Debug)]
pub struct Route {
    pub protocol: Protocol,
    pub host_id: String,
    pub inbound: Stream,
    pub outbound: Stream,
    flow: Arc<Flow>,
    side: Side,
}

impl Route {
    /// The connection-tracking object shared with the reverse route.
    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    /// Account a packet forwarded through this route.
    pub fn routed_packet(&self, now: i64, size: u64) {
        match self.side {
            Side::Rx => self.flow.received_packet(now, size),
            Side::Tx => self.flow.sent_packet(now, size),
        }
    }

    /// The inbound/outbound streams of this route's reverse.
    pub fn reversed_streams(&self) -> (Stream, Stream) {
        reverse_streams(self.inbound, self.outbound)
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Route{{{}, {}, ({} -> {}) => ({} -> {})}}",
            self.host_id,
            self.protocol,
            self.inbound.src,
            self.inbound.dst,
            self.outbound.src,
            self.outbound.dst
        )
    }
}

/// Swap a route's streams: the reverse receives what this route emits.
pub(crate) fn reverse_streams(inbound: Stream, outbound: Stream) -> (Stream, Stream) {
    let rev_inbound = Stream {
        src: outbound.dst,
        dst: outbound.src,
    };
    let rev_outbound = Stream {
        src: inbound.dst,
        dst: inbound.src,
    };
    (rev_inbound, rev_outbound)
}

/// Request to install a route. IPs may be given in either family; ports
/// and addresses not marked optional must be set before `add_route`.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub protocol: Protocol,
    pub host_id: String,
    pub inbound_src: Option<(IpAddr, u16)>,
    pub inbound_dst: Option<(IpAddr, u16)>,
    pub outbound_src: Option<(IpAddr, u16)>,
    pub outbound_dst: Option<(IpAddr, u16)>,
}

impl RouteSpec {
    pub fn new(protocol: Protocol, host_id: impl Into<String>) -> Self {
        Self {
            protocol,
            host_id: host_id.into(),
            inbound_src: None,
            inbound_dst: None,
            outbound_src: None,
            outbound_dst: None,
        }
    }

    pub fn inbound_source(mut self, ip: IpAddr, port: u16) -> Self {
        self.inbound_src = Some((ip, port));
        self
    }

    pub fn inbound_destination(mut self, ip: IpAddr, port: u16) -> Self {
        self.inbound_dst = Some((ip, port));
        self
    }

    pub fn outbound_source(mut self, ip: IpAddr, port: u16) -> Self {
        self.outbound_src = Some((ip, port));
        self
    }

    pub fn outbound_destination(mut self, ip: IpAddr, port: u16) -> Self {
        self.outbound_dst = Some((ip, port));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(a: u8, port: u16) -> Endpoint {
        Endpoint {
            ip: Ipv4Addr::new(127, 0, 0, a).to_ipv6_mapped(),
            port,
        }
    }

    #[test]
    fn normalize_round_trips_both_families() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(denormalize_ip(normalize_ip(v4)), v4);

        let v6 = IpAddr::V6("fd4c:bd56:5cee:8000::1".parse().unwrap());
        assert_eq!(denormalize_ip(normalize_ip(v6)), v6);
    }

    #[test]
    fn reverse_is_an_involution() {
        let inbound = Stream { src: ep(1, 22001), dst: ep(2, 1024) };
        let outbound = Stream { src: ep(2, 22001), dst: ep(3, 1024) };

        let (rev_in, rev_out) = reverse_streams(inbound, outbound);
        assert_eq!(rev_in.src, outbound.dst);
        assert_eq!(rev_in.dst, outbound.src);

        let (orig_in, orig_out) = reverse_streams(rev_in, rev_out);
        assert_eq!(orig_in, inbound);
        assert_eq!(orig_out, outbound);
    }
}
