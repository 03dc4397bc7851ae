//! TCP/UDP forwarder: rule -> route -> rewrite -> emit -> meter.
//!
//! One state machine serves both protocols. A packet for a managed, up
//! host either matches a tracked route or, via a rule, installs a new
//! route pair; either way it is re-emitted with the route's outbound
//! addresses and accounted on the flow.

use std::net::IpAddr;
use std::sync::Arc;

use smoltcp::wire::EthernetAddress;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::codec;
use crate::protocols::Protocol;
use crate::routes::{denormalize_ip, normalize_ip, unix_now, Route, RouteSpec};

use super::{gateway_fallback_ip, Packet, VnetInner};

pub(super) async fn run_tcp(inner: Arc<VnetInner>, mut rx: mpsc::Receiver<Packet>) {
    loop {
        let pkt = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            pkt = rx.recv() => match pkt {
                Some(pkt) => pkt,
                None => break,
            },
        };
        handle(&inner, pkt, Protocol::Tcp).await;
    }
}

pub(super) async fn run_udp(inner: Arc<VnetInner>, mut rx: mpsc::Receiver<Packet>) {
    loop {
        let pkt = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            pkt = rx.recv() => match pkt {
                Some(pkt) => pkt,
                None => break,
            },
        };
        // DHCP replies arrive on UDP port 68 and belong to the lease
        // client, broadcast or not.
        if pkt.udp().map(|udp| udp.dst_port()) == Some(68) {
            inner.send_dhcp(pkt).await;
            continue;
        }
        handle(&inner, pkt, Protocol::Udp).await;
    }
}

async fn handle(inner: &VnetInner, pkt: Packet, proto: Protocol) {
    let Some(eth) = pkt.eth() else {
        return;
    };
    if eth.dst_addr() == EthernetAddress::BROADCAST {
        return;
    }
    let (eth_src, eth_dst) = (eth.src_addr(), eth.dst_addr());

    let Some(host) = pkt.dst_host.clone() else {
        trace!("{proto}: destination unknown");
        return;
    };
    if !host.up {
        debug!(mac = %eth_dst, "{}: destination is down", proto);
        return;
    }

    // The 4-tuple, in 16-byte normal form.
    let (src_ip, dst_ip) = if let Some(ip) = pkt.ipv4() {
        (
            normalize_ip(IpAddr::V4(ip.src_addr().0.into())),
            normalize_ip(IpAddr::V4(ip.dst_addr().0.into())),
        )
    } else if let Some(ip) = pkt.ipv6() {
        (ip.src_addr().0.into(), ip.dst_addr().0.into())
    } else {
        trace!("{proto}: no network layer");
        return;
    };
    let ports = match proto {
        Protocol::Tcp => pkt.tcp().map(|t| (t.src_port(), t.dst_port())),
        Protocol::Udp => pkt.udp().map(|u| (u.src_port(), u.dst_port())),
    };
    let Some((src_port, dst_port)) = ports else {
        return;
    };

    let route = match inner
        .routes
        .table()
        .lookup(proto, src_ip, dst_ip, src_port, dst_port)
    {
        Some(route) => route,
        None => {
            let Some(route) =
                install_route(inner, &host.id, proto, src_ip, dst_ip, src_port, dst_port)
            else {
                return;
            };
            route
        }
    };

    let Some(segment) = pkt.l4_segment() else {
        return;
    };
    let out_src = denormalize_ip(route.outbound.src.ip);
    let out_dst = denormalize_ip(route.outbound.dst.ip);

    let mut buf = inner.scratch.get();
    match codec::emit_forwarded(
        &mut buf,
        // Swap the received MACs: back toward the bridge we came from.
        eth_dst,
        eth_src,
        out_src,
        out_dst,
        proto,
        segment,
        route.outbound.src.port,
        route.outbound.dst.port,
    ) {
        Ok(len) => {
            inner.write_frame(&buf[..len]).await;
            route.routed_packet(unix_now(), pkt.frame().len() as u64);
        }
        Err(err) => debug!("{proto}: emit error: {err}"),
    }
}

/// Rule lookup plus route installation for the first packet of a flow.
fn install_route(
    inner: &VnetInner,
    host_id: &str,
    proto: Protocol,
    src_ip: std::net::Ipv6Addr,
    dst_ip: std::net::Ipv6Addr,
    src_port: u16,
    dst_port: u16,
) -> Option<Arc<Route>> {
    let Some(rule) = inner.rules.table().lookup(proto, host_id, dst_port) else {
        trace!("{proto}: no rule for {host_id}:{dst_port}");
        return None;
    };

    let rewrite_ip = match rule.dst_ip {
        Some(ip) => ip,
        None => {
            // No explicit target: forward to the gateway host, keeping
            // the address family of the original destination.
            let want_ipv4 = dst_ip.to_ipv4_mapped().is_some();
            match gateway_fallback_ip(inner, want_ipv4) {
                Some(ip) => ip,
                None => {
                    debug!("{proto}: no destination ip for rule {}", rule.id);
                    return None;
                }
            }
        }
    };

    let spec = RouteSpec::new(proto, host_id)
        .inbound_source(denormalize_ip(src_ip), src_port)
        .inbound_destination(denormalize_ip(dst_ip), dst_port)
        .outbound_destination(rewrite_ip, rule.dst_port);
    match inner.routes.add_route(spec) {
        Ok(route) => {
            debug!(%route, "{}: route installed", proto);
            Some(route)
        }
        Err(err) => {
            debug!("{proto}: route error: {err}");
            None
        }
    }
}
