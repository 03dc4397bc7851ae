//! DHCP client obtaining the controller host's IPv4 lease.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use smoltcp::wire::{EthernetAddress, EthernetProtocol, EthernetRepr};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec;
use crate::codec::dhcp::{msg_type, opt, Message, MAX_MESSAGE_SIZE, OP_REPLY, OP_REQUEST};
use crate::error::Result;

use super::{Packet, VnetInner};

/// Re-negotiate the lease when the last one is older than this.
const RENEW_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Options we ask the server to provide.
const PARAMETER_REQUEST_LIST: [u8; 7] = [
    opt::SUBNET_MASK,
    opt::ROUTER,
    opt::DOMAIN_NAME_SERVER,
    opt::HOST_NAME,
    opt::DOMAIN_NAME,
    opt::BROADCAST_ADDRESS,
    opt::NTP_SERVERS,
];

const VENDOR_CLASS: &[u8] = b"swtchbrd 1.23.1";
const HOSTNAME: &[u8] = b"controller";

pub(super) async fn run(inner: Arc<VnetInner>, mut rx: mpsc::Receiver<Packet>) {
    // The gateway may never announce itself; keep the wait cancellable.
    tokio::select! {
        _ = inner.shutdown.cancelled() => return,
        _ = async {
            inner.system.wait_for_controller_mac().await;
            inner.system.wait_for_gateway_mac().await;
        } => {}
    }
    debug!("dhcp: running");

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            pkt = rx.recv() => match pkt {
                Some(pkt) => handle_reply(&inner, pkt).await,
                None => break,
            },
            _ = ticker.tick() => {
                if lease_is_fresh(&inner) {
                    continue;
                }
                if let Err(err) = send_discover(&inner).await {
                    warn!("dhcp: error: {err}");
                }
            }
        }
    }
}

fn lease_is_fresh(inner: &VnetInner) -> bool {
    match inner.system.controller_last_dhcp_renew() {
        Some(renewed) => {
            SystemTime::now()
                .duration_since(renewed)
                .unwrap_or_default()
                < RENEW_INTERVAL
        }
        None => false,
    }
}

async fn handle_reply(inner: &VnetInner, pkt: Packet) {
    let (Some(eth), Some(udp)) = (pkt.eth(), pkt.udp()) else {
        return;
    };
    // Only replies addressed to the controller are ours.
    if inner.system.controller_mac() != Some(eth.dst_addr()) {
        return;
    }

    let msg = match Message::parse(udp.payload()) {
        Ok(msg) => msg,
        Err(err) => {
            debug!("dhcp: error: {err}");
            return;
        }
    };
    if msg.op != OP_REPLY {
        return;
    }

    match msg.message_type() {
        Some(msg_type::OFFER) => {
            debug!(yiaddr = %msg.yiaddr, "dhcp: offer");
            if let Err(err) = handle_offer(inner, &msg).await {
                warn!("dhcp: error: {err}");
            }
        }
        Some(msg_type::ACK) => {
            debug!(yiaddr = %msg.yiaddr, "dhcp: ack");
            handle_ack(inner, &msg);
        }
        _ => {}
    }
}

async fn handle_offer(inner: &VnetInner, offer: &Message) -> Result<()> {
    if offer.yiaddr.is_unspecified() {
        return Ok(());
    }
    let Some(controller_mac) = inner.system.controller_mac() else {
        return Ok(());
    };

    let mut msg = Message {
        op: OP_REQUEST,
        xid: offer.xid,
        client_mac: controller_mac,
        ..Message::default()
    };
    msg.options
        .insert(opt::MESSAGE_TYPE, vec![msg_type::REQUEST]);
    msg.options
        .insert(opt::CLIENT_IDENTIFIER, client_identifier(controller_mac));
    msg.options
        .insert(opt::REQUESTED_IP, offer.yiaddr.octets().to_vec());
    if let Some(server_id) = offer.options.get(&opt::SERVER_IDENTIFIER) {
        msg.options.insert(opt::SERVER_IDENTIFIER, server_id.clone());
    }
    msg.options.insert(
        opt::MAX_MESSAGE_SIZE,
        MAX_MESSAGE_SIZE.to_be_bytes().to_vec(),
    );
    msg.options
        .insert(opt::PARAMETER_REQUEST_LIST, PARAMETER_REQUEST_LIST.to_vec());
    msg.options.insert(opt::VENDOR_CLASS, VENDOR_CLASS.to_vec());

    send(inner, &msg).await
}

fn handle_ack(inner: &VnetInner, ack: &Message) {
    if ack.yiaddr.is_unspecified() {
        return;
    }
    debug!(addr = %ack.yiaddr, "dhcp: leased");
    inner.system.set_controller_ipv4(ack.yiaddr);
}

async fn send_discover(inner: &VnetInner) -> Result<()> {
    let Some(controller_mac) = inner.system.controller_mac() else {
        return Ok(());
    };

    let mut xid = [0u8; 4];
    getrandom::fill(&mut xid)?;
    let mut msg = Message {
        op: OP_REQUEST,
        xid: u32::from_ne_bytes(xid),
        client_mac: controller_mac,
        ..Message::default()
    };
    msg.options
        .insert(opt::MESSAGE_TYPE, vec![msg_type::DISCOVER]);
    msg.options.insert(
        opt::MAX_MESSAGE_SIZE,
        MAX_MESSAGE_SIZE.to_be_bytes().to_vec(),
    );
    msg.options
        .insert(opt::CLIENT_IDENTIFIER, client_identifier(controller_mac));
    msg.options.insert(opt::HOST_NAME, HOSTNAME.to_vec());
    msg.options
        .insert(opt::PARAMETER_REQUEST_LIST, PARAMETER_REQUEST_LIST.to_vec());
    msg.options.insert(opt::VENDOR_CLASS, VENDOR_CLASS.to_vec());

    send(inner, &msg).await
}

/// Broadcast a client message: 0.0.0.0 (or the leased address once we
/// hold one) to 255.255.255.255, UDP 68 to 67.
async fn send(inner: &VnetInner, msg: &Message) -> Result<()> {
    let src = inner
        .system
        .controller_ipv4()
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    let eth = EthernetRepr {
        src_addr: msg.client_mac,
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::Ipv4,
    };

    let payload = msg.to_bytes();
    let mut buf = inner.scratch.get();
    let len = codec::emit_udp4(
        &mut buf,
        &eth,
        src,
        Ipv4Addr::BROADCAST,
        68,
        67,
        &payload,
    )?;
    inner.write_frame(&buf[..len]).await;
    Ok(())
}

fn client_identifier(mac: EthernetAddress) -> Vec<u8> {
    // Hardware type 1 (Ethernet) followed by the MAC.
    let mut id = Vec::with_capacity(7);
    id.push(1);
    id.extend_from_slice(&mac.0);
    id
}
