//! Route controller: installs route pairs, publishes snapshots, expires
//! idle flows.

use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::error::{Error, Result};
use crate::ports::PortAllocator;

use super::flow::{Flow, FLOW_TIMEOUT_SECS};
use super::table::Table;
use super::{normalize_ip, reverse_streams, unix_now, Endpoint, Route, RouteSpec, Side, Stream};

pub struct Controller {
    ports: Arc<PortAllocator>,
    routes: Mutex<Vec<Arc<Route>>>,
    table: RwLock<Arc<Table>>,
}

impl Controller {
    pub fn new(ports: Arc<PortAllocator>) -> Self {
        Self {
            ports,
            routes: Mutex::new(Vec::new()),
            table: RwLock::new(Arc::new(Table::default())),
        }
    }

    /// Current snapshot. Hold the returned Arc, not the controller, for
    /// the duration of any lookups.
    pub fn table(&self) -> Arc<Table> {
        Arc::clone(&self.table.read().unwrap())
    }

    /// Validate and install a route together with its reverse. The
    /// outbound source port is drawn from the host's port pool (a zero
    /// port lets the allocator pick).
    pub fn add_route(&self, spec: RouteSpec) -> Result<Arc<Route>> {
        let mut routes = self.routes.lock().unwrap();

        if spec.host_id.is_empty() {
            return Err(Error::invalid("route host id must be set"));
        }
        let (in_src_ip, in_src_port) = spec
            .inbound_src
            .ok_or_else(|| Error::invalid("route inbound source must be set"))?;
        let (in_dst_ip, in_dst_port) = spec
            .inbound_dst
            .ok_or_else(|| Error::invalid("route inbound destination must be set"))?;
        let (out_dst_ip, out_dst_port) = spec
            .outbound_dst
            .ok_or_else(|| Error::invalid("route outbound destination must be set"))?;
        if in_src_port == 0 || in_dst_port == 0 || out_dst_port == 0 {
            return Err(Error::invalid("route ports must be nonzero"));
        }

        let inbound = Stream {
            src: Endpoint { ip: normalize_ip(in_src_ip), port: in_src_port },
            dst: Endpoint { ip: normalize_ip(in_dst_ip), port: in_dst_port },
        };
        // The outbound source defaults to the inbound destination: replies
        // come back addressed to the address the initiator targeted.
        let (out_src_ip, out_src_port) = match spec.outbound_src {
            Some((ip, port)) => (normalize_ip(ip), port),
            None => (inbound.dst.ip, 0),
        };
        let mut outbound = Stream {
            src: Endpoint { ip: out_src_ip, port: out_src_port },
            dst: Endpoint { ip: normalize_ip(out_dst_ip), port: out_dst_port },
        };

        outbound.src.port = self
            .ports
            .allocate(&spec.host_id, spec.protocol, outbound.src.port)?;

        let tab = self.table();
        let forward_taken = tab
            .lookup(spec.protocol, inbound.src.ip, inbound.dst.ip, inbound.src.port, inbound.dst.port)
            .is_some();
        let reverse_taken = tab
            .lookup(spec.protocol, outbound.dst.ip, outbound.src.ip, outbound.dst.port, outbound.src.port)
            .is_some();
        if forward_taken || reverse_taken {
            self.ports
                .release(&spec.host_id, spec.protocol, outbound.src.port);
            return Err(Error::conflict("route already exists"));
        }

        let flow = Arc::new(Flow::new(unix_now(), FLOW_TIMEOUT_SECS));
        let route = Arc::new(Route {
            protocol: spec.protocol,
            host_id: spec.host_id.clone(),
            inbound,
            outbound,
            flow: Arc::clone(&flow),
            side: Side::Rx,
        });
        let (rev_inbound, rev_outbound) = reverse_streams(inbound, outbound);
        let reverse = Arc::new(Route {
            protocol: spec.protocol,
            host_id: spec.host_id,
            inbound: rev_inbound,
            outbound: rev_outbound,
            flow,
            side: Side::Tx,
        });

        routes.push(Arc::clone(&route));
        routes.push(reverse);
        self.publish(&routes);

        Ok(route)
    }

    /// Drop every route pair whose flow has been idle past its timeout,
    /// releasing the outbound source ports they held.
    pub fn expire(&self, now: i64) {
        let mut routes = self.routes.lock().unwrap();

        let before = routes.len();
        routes.retain(|route| {
            let keep = !route.flow.expired(now);
            if !keep && route.side == Side::Rx {
                self.ports
                    .release(&route.host_id, route.protocol, route.outbound.src.port);
            }
            keep
        });

        if routes.len() != before {
            debug!(dropped = before - routes.len(), "routes: expired flows");
            self.publish(&routes);
        }
    }

    fn publish(&self, routes: &[Arc<Route>]) {
        let tab = Arc::new(Table::build(routes.to_vec()));
        *self.table.write().unwrap() = tab;
    }
}
