//! ICMPv4 echo responder for managed hosts.

use std::net::Ipv4Addr;
use std::sync::Arc;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{EthernetProtocol, EthernetRepr, Icmpv4Message, Icmpv4Repr};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::codec;

use super::{Packet, VnetInner};

pub(super) async fn run(inner: Arc<VnetInner>, mut rx: mpsc::Receiver<Packet>) {
    tokio::select! {
        _ = inner.shutdown.cancelled() => return,
        _ = inner.system.wait_for_controller_mac() => {}
    }
    debug!("icmp: running");

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
    // ICMPv6 is recognized by the demultiplexer but never answered.
    let Some(icmp) = pkt.icmpv4() else {
        return;
    };
    match icmp.msg_type() {
        Icmpv4Message::EchoRequest => handle_echo_request(inner, &pkt).await,
        other => trace!("icmp: ignoring type {other:?}"),
    }
}

async fn handle_echo_request(inner: &VnetInner, pkt: &Packet) {
    let (Some(eth), Some(ip), Some(icmp)) = (pkt.eth(), pkt.ipv4(), pkt.icmpv4()) else {
        return;
    };
    let src = Ipv4Addr::from(ip.src_addr().0);
    let dst = Ipv4Addr::from(ip.dst_addr().0);

    let Some(host) = inner.hosts.table().lookup_by_ipv4(dst) else {
        trace!(%dst, "icmp: echo for unknown host");
        return;
    };
    if !host.up {
        trace!(%dst, "icmp: echo for down host");
        return;
    }
    if host.ipv4_addrs.is_empty() {
        return;
    }
    let Some(controller_mac) = inner.system.controller_mac() else {
        return;
    };

    let Ok(Icmpv4Repr::EchoRequest { ident, seq_no, data }) =
        Icmpv4Repr::parse(&icmp, &ChecksumCapabilities::ignored())
    else {
        return;
    };
    debug!(%src, %dst, seq = seq_no, "icmp: echo reply");

    let eth_reply = EthernetRepr {
        src_addr: controller_mac,
        dst_addr: eth.src_addr(),
        ethertype: EthernetProtocol::Ipv4,
    };
    let icmp_reply = Icmpv4Repr::EchoReply { ident, seq_no, data };

    let mut buf = inner.scratch.get();
    match codec::emit_icmpv4(&mut buf, &eth_reply, dst, src, &icmp_reply) {
        Ok(len) => inner.write_frame(&buf[..len]).await,
        Err(err) => debug!("icmp: emit error: {err}"),
    }
}
