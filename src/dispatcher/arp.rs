//! ARP: gateway discovery, proxy replies for the controller, peer
//! learning.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use smoltcp::wire::{
    ArpOperation, ArpRepr, EthernetAddress, EthernetProtocol, EthernetRepr, Ipv4Address,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::codec;

use super::{Packet, VnetInner};

pub(super) async fn run(inner: Arc<VnetInner>, mut rx: mpsc::Receiver<Packet>) {
    loop {
        let pkt = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            pkt = rx.recv() => match pkt {
                Some(pkt) => pkt,
                None => break,
            },
        };
        handle(&inner, pkt).await;
    }
}

async fn handle(inner: &VnetInner, pkt: Packet) {
    let Some(arp) = pkt.arp() else {
        return;
    };
    // Only Ethernet/IPv4 ARP is handled; parse() enforces the address
    // sizes.
    let Ok(repr) = ArpRepr::parse(&arp) else {
        return;
    };
    let ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr: sender_mac,
        source_protocol_addr: sender_ip,
        target_protocol_addr: target_ip,
        ..
    } = repr
    else {
        return;
    };

    match operation {
        ArpOperation::Request => handle_request(inner, &pkt, sender_mac, sender_ip, target_ip).await,
        ArpOperation::Reply => handle_reply(inner, sender_mac, sender_ip),
        _ => {}
    }
}

async fn handle_request(
    inner: &VnetInner,
    pkt: &Packet,
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Address,
    target_ip: Ipv4Address,
) {
    let Some(eth) = pkt.eth() else {
        return;
    };
    if eth.dst_addr() != EthernetAddress::BROADCAST {
        // Expect broadcast.
        return;
    }

    if sender_ip == target_ip {
        // Gratuitous announce: the first one we see names the gateway.
        if inner.system.gateway_mac().is_none() {
            let gateway_ip = Ipv4Addr::from(sender_ip.0);
            debug!(mac = %sender_mac, ip = %gateway_ip, "arp: learned gateway");
            inner.system.set_gateway_mac(sender_mac);
            inner.system.set_gateway_ipv4(gateway_ip);
        }
        return;
    }

    let (Some(controller_mac), Some(controller_ip)) =
        (inner.system.controller_mac(), inner.system.controller_ipv4())
    else {
        return;
    };
    if inner.system.gateway_mac().is_none() || inner.system.gateway_ipv4().is_none() {
        return;
    }
    if Ipv4Addr::from(target_ip.0) != controller_ip {
        return;
    }

    let eth = EthernetRepr {
        src_addr: controller_mac,
        dst_addr: sender_mac,
        ethertype: EthernetProtocol::Arp,
    };
    let arp = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: controller_mac,
        source_protocol_addr: Ipv4Address(controller_ip.octets()),
        target_hardware_addr: sender_mac,
        target_protocol_addr: sender_ip,
    };

    let mut buf = inner.scratch.get();
    match codec::emit_arp(&mut buf, &eth, &arp) {
        Ok(len) => {
            trace!(who = %Ipv4Addr::from(target_ip.0), to = %sender_mac, "arp: reply");
            inner.write_frame(&buf[..len]).await;
        }
        Err(err) => debug!("arp: emit error: {err}"),
    }
}

fn handle_reply(inner: &VnetInner, sender_mac: EthernetAddress, sender_ip: Ipv4Address) {
    let ip = IpAddr::V4(Ipv4Addr::from(sender_ip.0));
    trace!(%ip, mac = %sender_mac, "arp: learned peer");
    inner.peers.add_peer(ip, sender_mac);
}

/// Resolve `ip` to a MAC through the peer cache, probing with ARP
/// requests on misses: up to 3 attempts, each polling the cache for a
/// second at 10 ms granularity.
pub(crate) async fn lookup_hardware_addr_for_ip(
    inner: &Arc<VnetInner>,
    ip: IpAddr,
) -> Option<EthernetAddress> {
    if let Some(mac) = inner.peers.lookup(ip) {
        return Some(mac);
    }

    for _ in 0..3 {
        send_request(inner, ip).await;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(mac) = inner.peers.lookup(ip) {
                return Some(mac);
            }
        }
    }

    None
}

async fn send_request(inner: &VnetInner, ip: IpAddr) {
    let IpAddr::V4(target) = ip else {
        return;
    };
    let (Some(controller_mac), Some(controller_ip)) =
        (inner.system.controller_mac(), inner.system.controller_ipv4())
    else {
        return;
    };

    let eth = EthernetRepr {
        src_addr: controller_mac,
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::Arp,
    };
    let arp = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: controller_mac,
        source_protocol_addr: Ipv4Address(controller_ip.octets()),
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: Ipv4Address(target.octets()),
    };

    let mut buf = inner.scratch.get();
    match codec::emit_arp(&mut buf, &eth, &arp) {
        Ok(len) => inner.write_frame(&buf[..len]).await,
        Err(err) => debug!("arp: emit error: {err}"),
    }
}
