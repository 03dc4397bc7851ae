//! Packet descriptor handed between pipeline stages.

use std::sync::Arc;

use smoltcp::wire::{
    ArpPacket, EthernetFrame, Icmpv4Packet, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket,
};

use crate::codec::{LayerKind, ParsedLayers};
use crate::hosts::Host;
use crate::pool::PooledBuf;

/// One received frame: the pooled buffer, the driver flags word, the
/// parsed layer ranges, and the scratch destination-host slot the IPv4
/// stage fills in.
///
/// Ownership moves along the channel handoffs; dropping the descriptor
/// anywhere returns the buffer to its pool.
pub struct Packet {
    buf: PooledBuf,
    len: usize,
    pub flags: u32,
    pub dst_host: Option<Arc<Host>>,
    layers: ParsedLayers,
    cursor: usize,
}

impl Packet {
    pub fn new(buf: PooledBuf, len: usize, flags: u32, layers: ParsedLayers) -> Self {
        Self {
            buf,
            len,
            flags,
            dst_host: None,
            layers,
            cursor: 0,
        }
    }

    /// The received frame bytes.
    pub fn frame(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Advance to the next parsed layer, if any.
    pub fn next_layer(&mut self) -> Option<LayerKind> {
        let kind = self.layers.order.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(kind)
    }

    pub fn eth(&self) -> Option<EthernetFrame<&[u8]>> {
        let range = self.layers.eth.clone()?;
        Some(EthernetFrame::new_unchecked(&self.frame()[range]))
    }

    pub fn arp(&self) -> Option<ArpPacket<&[u8]>> {
        let range = self.layers.arp.clone()?;
        Some(ArpPacket::new_unchecked(&self.frame()[range]))
    }

    pub fn ipv4(&self) -> Option<Ipv4Packet<&[u8]>> {
        let range = self.layers.ipv4.clone()?;
        Some(Ipv4Packet::new_unchecked(&self.frame()[range]))
    }

    pub fn ipv6(&self) -> Option<Ipv6Packet<&[u8]>> {
        let range = self.layers.ipv6.clone()?;
        Some(Ipv6Packet::new_unchecked(&self.frame()[range]))
    }

    pub fn icmpv4(&self) -> Option<Icmpv4Packet<&[u8]>> {
        let range = self.layers.icmpv4.clone()?;
        Some(Icmpv4Packet::new_unchecked(&self.frame()[range]))
    }

    pub fn tcp(&self) -> Option<TcpPacket<&[u8]>> {
        let range = self.layers.tcp.clone()?;
        Some(TcpPacket::new_unchecked(&self.frame()[range]))
    }

    pub fn udp(&self) -> Option<UdpPacket<&[u8]>> {
        let range = self.layers.udp.clone()?;
        Some(UdpPacket::new_unchecked(&self.frame()[range]))
    }

    /// The whole TCP or UDP segment (header and payload).
    pub fn l4_segment(&self) -> Option<&[u8]> {
        let range = self.layers.tcp.clone().or_else(|| self.layers.udp.clone())?;
        Some(&self.frame()[range])
    }
}
