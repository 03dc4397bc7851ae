//! Immutable route table snapshot, sorted by inbound tuple.

use std::net::Ipv6Addr;
use std::sync::Arc;

use crate::protocols::Protocol;

use super::Route;

type InboundKey = (u8, [u8; 16], u16, [u8; 16], u16);

fn inbound_key(route: &Route) -> InboundKey {
    (
        route.protocol.as_u8(),
        route.inbound.src.ip.octets(),
        route.inbound.src.port,
        route.inbound.dst.ip.octets(),
        route.inbound.dst.port,
    )
}

/// Read-only snapshot published by the route controller.
#[derive(Default)]
pub struct Table {
    routes: Vec<Arc<Route>>,
}

impl Table {
    pub(super) fn build(mut routes: Vec<Arc<Route>>) -> Self {
        routes.sort_by_key(|r| inbound_key(r));
        Self { routes }
    }

    /// Find the route whose inbound tuple equals the given 4-tuple.
    pub fn lookup(
        &self,
        protocol: Protocol,
        src_ip: Ipv6Addr,
        dst_ip: Ipv6Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Option<Arc<Route>> {
        let target: InboundKey = (
            protocol.as_u8(),
            src_ip.octets(),
            src_port,
            dst_ip.octets(),
            dst_port,
        );
        let idx = self
            .routes
            .binary_search_by(|r| inbound_key(r).cmp(&target))
            .ok()?;
        Some(Arc::clone(&self.routes[idx]))
    }

    /// All routes in table order.
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
