//! The packet dispatch pipeline.
//!
//! One reader task pulls frames off the interface and demultiplexes
//! them, layer by layer, onto single-consumer channels: Ethernet, ARP,
//! IPv4, ICMP, TCP, UDP, with UDP port 68 diverted to the DHCP client.
//! Handlers share state only through the tables and the system facts.
//! A root [`Shutdown`] tears every task down; the reader triggers it on
//! driver EOF.

mod arp;
mod dhcp;
mod forward;
mod icmp;
mod packet;

pub use packet::Packet;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use smoltcp::wire::EthernetAddress;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::codec::{self, LayerKind};
use crate::error::Result;
use crate::hosts::{self, Host, HostSpec};
use crate::iface::Interface;
use crate::peers::PeerCache;
use crate::pool::BufferPool;
use crate::ports::PortAllocator;
use crate::routes::{self, unix_now};
use crate::rules::{self, Rule};
use crate::shutdown::Shutdown;
use crate::system::SystemFacts;

/// Name of the synthetic host representing this process.
pub const CONTROLLER_HOST: &str = "controller";
/// Name of the synthetic host representing the host-side bridge.
pub const GATEWAY_HOST: &str = "gateway";

/// Controller identity on the management IPv4 subnet (172.18.0.0/16).
pub const CONTROLLER_IPV4: Ipv4Addr = Ipv4Addr::new(172, 18, 0, 2);
/// Controller address on the local IPv6 subnet.
pub const CONTROLLER_IPV6: Ipv6Addr = Ipv6Addr::new(0xfd4c, 0xbd56, 0x5cee, 0x8000, 0, 0, 0, 2);
/// Gateway address on the local IPv6 subnet.
pub const GATEWAY_IPV6: Ipv6Addr = Ipv6Addr::new(0xfd4c, 0xbd56, 0x5cee, 0x8000, 0, 0, 0, 1);

pub(crate) struct VnetInner {
    pub(crate) iface: Arc<dyn Interface>,
    pub(crate) pool: BufferPool,
    pub(crate) scratch: BufferPool,
    pub(crate) shutdown: Shutdown,
    pub(crate) system: Arc<SystemFacts>,
    pub(crate) ports: Arc<PortAllocator>,
    pub(crate) hosts: Arc<hosts::Controller>,
    pub(crate) rules: Arc<rules::Controller>,
    pub(crate) routes: Arc<routes::Controller>,
    pub(crate) peers: Arc<PeerCache>,
    chan_eth: mpsc::Sender<Packet>,
    chan_arp: mpsc::Sender<Packet>,
    chan_ipv4: mpsc::Sender<Packet>,
    chan_icmp: mpsc::Sender<Packet>,
    chan_tcp: mpsc::Sender<Packet>,
    chan_udp: mpsc::Sender<Packet>,
    chan_dhcp: mpsc::Sender<Packet>,
}

impl VnetInner {
    /// Route a descriptor to the channel of its next recognized layer.
    /// Unroutable descriptors are dropped (releasing their buffer), as
    /// are descriptors caught by teardown.
    pub(crate) async fn dispatch(&self, mut pkt: Packet) {
        let Some(kind) = pkt.next_layer() else {
            return;
        };
        let chan = match kind {
            LayerKind::Ethernet => &self.chan_eth,
            LayerKind::Arp => &self.chan_arp,
            LayerKind::Ipv4 => &self.chan_ipv4,
            LayerKind::Icmpv4 | LayerKind::Icmpv6 => &self.chan_icmp,
            LayerKind::Tcp => &self.chan_tcp,
            LayerKind::Udp => &self.chan_udp,
            // Recognized but not forwarded.
            LayerKind::Ipv6 => return,
        };
        tokio::select! {
            result = chan.send(pkt) => {
                if result.is_err() {
                    debug!("vnet: {kind:?} channel closed");
                }
            }
            _ = self.shutdown.cancelled() => {}
        }
    }

    pub(crate) async fn send_dhcp(&self, pkt: Packet) {
        tokio::select! {
            result = self.chan_dhcp.send(pkt) => {
                if result.is_err() {
                    debug!("vnet: dhcp channel closed");
                }
            }
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Write a serialized frame out the interface, logging failures.
    pub(crate) async fn write_frame(&self, frame: &[u8]) {
        if let Err(err) = self.iface.write_packet(frame, 0).await {
            debug!("vnet: write error: {err}");
        }
    }
}

/// The running virtual network: tables, facts, and the task pipeline.
pub struct Vnet {
    inner: Arc<VnetInner>,
    tasks: JoinSet<()>,
}

impl Vnet {
    /// Start the pipeline on `iface`. Seeds the controller host (the
    /// interface's MAC, 172.18.0.2, fd4c:bd56:5cee:8000::2) and the
    /// gateway host (fd4c:bd56:5cee:8000::1), then spawns the reader,
    /// the per-layer handlers, the 1 Hz route sweeper, and the closer.
    pub fn run(iface: Arc<dyn Interface>) -> Result<Self> {
        let shutdown = Shutdown::new();
        let ports = Arc::new(PortAllocator::new());
        let hosts = Arc::new(hosts::Controller::new(Arc::clone(&ports)));
        let rules = Arc::new(rules::Controller::new(Arc::clone(&ports)));
        let routes = Arc::new(routes::Controller::new(Arc::clone(&ports)));
        let peers = Arc::new(PeerCache::new());
        let system = Arc::new(SystemFacts::new());

        let controller_mac = iface.hardware_addr();
        system.set_controller_mac(controller_mac);

        let controller = hosts.add_host(
            HostSpec::named(CONTROLLER_HOST)
                .local()
                .up()
                .mac(controller_mac)
                .ipv4(CONTROLLER_IPV4)
                .ipv6(CONTROLLER_IPV6),
        )?;
        info!(name = %controller.name, id = %controller.id, "vnet: controller host");
        hosts.add_host(HostSpec::named(GATEWAY_HOST).local().up().ipv6(GATEWAY_IPV6))?;

        let max_packet_size = iface.max_packet_size();
        let (tx_eth, rx_eth) = mpsc::channel(1);
        let (tx_arp, rx_arp) = mpsc::channel(1);
        let (tx_ipv4, rx_ipv4) = mpsc::channel(1);
        let (tx_icmp, rx_icmp) = mpsc::channel(1);
        let (tx_tcp, rx_tcp) = mpsc::channel(1);
        let (tx_udp, rx_udp) = mpsc::channel(1);
        let (tx_dhcp, rx_dhcp) = mpsc::channel(1);

        let inner = Arc::new(VnetInner {
            pool: BufferPool::new(max_packet_size),
            scratch: BufferPool::new(max_packet_size),
            iface,
            shutdown,
            system,
            ports,
            hosts,
            rules,
            routes,
            peers,
            chan_eth: tx_eth,
            chan_arp: tx_arp,
            chan_ipv4: tx_ipv4,
            chan_icmp: tx_icmp,
            chan_tcp: tx_tcp,
            chan_udp: tx_udp,
            chan_dhcp: tx_dhcp,
        });

        let mut tasks = JoinSet::new();
        tasks.spawn(ethernet_task(Arc::clone(&inner), rx_eth));
        tasks.spawn(arp::run(Arc::clone(&inner), rx_arp));
        tasks.spawn(ipv4_task(Arc::clone(&inner), rx_ipv4));
        tasks.spawn(icmp::run(Arc::clone(&inner), rx_icmp));
        tasks.spawn(forward::run_tcp(Arc::clone(&inner), rx_tcp));
        tasks.spawn(forward::run_udp(Arc::clone(&inner), rx_udp));
        tasks.spawn(dhcp::run(Arc::clone(&inner), rx_dhcp));
        tasks.spawn(reader_task(Arc::clone(&inner)));
        tasks.spawn(sweeper_task(Arc::clone(&inner)));
        tasks.spawn(closer_task(Arc::clone(&inner)));

        info!(
            id = inner.iface.id(),
            mac = %controller_mac,
            "vnet: pipeline running"
        );

        Ok(Self { inner, tasks })
    }

    pub fn system(&self) -> Arc<SystemFacts> {
        Arc::clone(&self.inner.system)
    }

    pub fn hosts(&self) -> Arc<hosts::Controller> {
        Arc::clone(&self.inner.hosts)
    }

    pub fn rules(&self) -> Arc<rules::Controller> {
        Arc::clone(&self.inner.rules)
    }

    pub fn routes(&self) -> Arc<routes::Controller> {
        Arc::clone(&self.inner.routes)
    }

    pub fn peers(&self) -> Arc<PeerCache> {
        Arc::clone(&self.inner.peers)
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.inner.shutdown.clone()
    }

    /// Begin teardown of every pipeline task.
    pub fn shutdown(&self) {
        self.inner.shutdown.trigger();
    }

    /// Await quiescence of the whole pipeline.
    pub async fn wait(mut self) {
        while self.tasks.join_next().await.is_some() {}
    }

    /// Resolve an IPv4 peer's MAC, probing with ARP requests if the
    /// cache misses (3 attempts, polling for up to a second each).
    pub async fn lookup_hardware_addr_for_ip(&self, ip: IpAddr) -> Option<EthernetAddress> {
        arp::lookup_hardware_addr_for_ip(&self.inner, ip).await
    }

    /// Add a host (management surface).
    pub fn add_host(&self, spec: HostSpec) -> Result<Host> {
        self.inner.hosts.add_host(spec)
    }

    /// Remove a host, its rules, and every port it held.
    pub fn remove_host(&self, id_or_name: &str) -> Result<Host> {
        let removed = self.inner.hosts.remove_host(id_or_name)?;
        self.inner.rules.remove_rules_for_host(&removed.id);
        Ok(removed)
    }

    /// Mark a host up or down.
    pub fn set_host_state(&self, id_or_name: &str, up: bool) -> Result<()> {
        self.inner.hosts.set_state(id_or_name, up)
    }

    /// Install a forwarding rule.
    pub fn add_rule(&self, rule: Rule) -> Result<Rule> {
        self.inner.rules.add_rule(rule)
    }

    /// Remove every rule sourced at a host.
    pub fn clear_rules(&self, host_id: &str) {
        self.inner.rules.remove_rules_for_host(host_id)
    }
}

/// Reader: lease a buffer, read a frame, parse, dispatch. Transient
/// errors back off 10 ms; EOF tears the pipeline down.
async fn reader_task(inner: Arc<VnetInner>) {
    loop {
        let mut buf = inner.pool.get();
        let result = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = inner.iface.read_packet(&mut buf) => result,
        };
        match result {
            Ok(None) => break,
            Err(err) => {
                drop(buf);
                warn!("vnet: error during read: {err}");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(Some((len, flags))) => match codec::parse(&buf[..len]) {
                Ok(layers) => {
                    inner.dispatch(Packet::new(buf, len, flags, layers)).await;
                }
                Err(err) => debug!("vnet: {err}"),
            },
        }
    }
    // Driver EOF (or cancel) ends the stream for everyone.
    inner.shutdown.trigger();
}

/// The ethernet stage re-dispatches to whatever the frame carried.
async fn ethernet_task(inner: Arc<VnetInner>, mut rx: mpsc::Receiver<Packet>) {
    loop {
        let pkt = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            pkt = rx.recv() => match pkt {
                Some(pkt) => pkt,
                None => break,
            },
        };
        inner.dispatch(pkt).await;
    }
}

/// The IPv4 stage attaches the destination host, falling back to the
/// controller host when the destination is the controller's leased
/// address.
async fn ipv4_task(inner: Arc<VnetInner>, mut rx: mpsc::Receiver<Packet>) {
    loop {
        let mut pkt = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            pkt = rx.recv() => match pkt {
                Some(pkt) => pkt,
                None => break,
            },
        };

        let dst = pkt.ipv4().map(|ip| Ipv4Addr::from(ip.dst_addr().0));
        if let Some(dst) = dst {
            let tab = inner.hosts.table();
            pkt.dst_host = tab.lookup_by_ipv4(dst).or_else(|| {
                (inner.system.controller_ipv4() == Some(dst))
                    .then(|| tab.lookup_by_name(CONTROLLER_HOST))
                    .flatten()
            });
        }

        inner.dispatch(pkt).await;
    }
}

/// 1 Hz flow sweeper.
async fn sweeper_task(inner: Arc<VnetInner>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => inner.routes.expire(unix_now()),
        }
    }
}

/// Closes the interface once teardown fires, unblocking the reader.
async fn closer_task(inner: Arc<VnetInner>) {
    inner.shutdown.cancelled().await;
    if let Err(err) = inner.iface.close().await {
        warn!("vnet: error closing interface: {err}");
    }
}

/// The first address of the up gateway host in the given family, used
/// as the rewrite target for rules without an explicit destination.
pub(crate) fn gateway_fallback_ip(inner: &VnetInner, want_ipv4: bool) -> Option<IpAddr> {
    let gateway = inner.hosts.table().lookup_by_name(GATEWAY_HOST)?;
    if !gateway.up {
        return None;
    }
    if want_ipv4 {
        gateway.ipv4().map(IpAddr::V4)
    } else {
        gateway.ipv6().map(IpAddr::V6)
    }
}
