//! Frame parsing and serialization.
//!
//! Decoding walks a frame layer by layer (Ethernet, then ARP or IP, then
//! the transport) and records the byte range of every layer it
//! recognizes; accessors hand out smoltcp packet views over those ranges
//! without copying. Emission builds Ethernet and IP headers from smoltcp
//! reprs and computes every length and checksum. Forwarded TCP/UDP
//! segments are copied byte-for-byte with only the ports patched, so
//! original header options survive the rewrite.

pub mod dhcp;

mod checksum;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::Range;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr,
    Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, Ipv6Address,
    Ipv6Packet, Ipv6Repr, TcpPacket, UdpPacket,
};

use crate::error::{DriverError, Error, Result};
use crate::protocols::Protocol;

/// Length of an Ethernet II header.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// A protocol layer the demultiplexer can route on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Ethernet,
    Arp,
    Ipv4,
    Ipv6,
    Icmpv4,
    Icmpv6,
    Tcp,
    Udp,
}

/// Byte ranges of the layers recognized in one frame, in walk order.
#[derive(Debug, Clone, Default)]
pub struct ParsedLayers {
    pub order: Vec<LayerKind>,
    pub eth: Option<Range<usize>>,
    pub arp: Option<Range<usize>>,
    pub ipv4: Option<Range<usize>>,
    pub ipv6: Option<Range<usize>>,
    pub icmpv4: Option<Range<usize>>,
    pub icmpv6: Option<Range<usize>>,
    pub tcp: Option<Range<usize>>,
    pub udp: Option<Range<usize>>,
    pub l4_payload: Option<Range<usize>>,
}

/// Decode a frame starting at Ethernet.
pub fn parse(frame: &[u8]) -> Result<ParsedLayers> {
    let mut layers = ParsedLayers::default();

    let eth = EthernetFrame::new_checked(frame)
        .map_err(|e| Error::Parse(format!("ethernet: {e}")))?;
    layers.eth = Some(0..frame.len());
    layers.order.push(LayerKind::Ethernet);

    match eth.ethertype() {
        EthernetProtocol::Arp => {
            ArpPacket::new_checked(eth.payload()).map_err(|e| Error::Parse(format!("arp: {e}")))?;
            layers.arp = Some(ETHERNET_HEADER_LEN..frame.len());
            layers.order.push(LayerKind::Arp);
        }
        EthernetProtocol::Ipv4 => {
            let ip = Ipv4Packet::new_checked(eth.payload())
                .map_err(|e| Error::Parse(format!("ipv4: {e}")))?;
            let header_len = ip.header_len() as usize;
            let total_len = ip.total_len() as usize;
            layers.ipv4 = Some(ETHERNET_HEADER_LEN..ETHERNET_HEADER_LEN + total_len);
            layers.order.push(LayerKind::Ipv4);
            let l4 = ETHERNET_HEADER_LEN + header_len..ETHERNET_HEADER_LEN + total_len;
            parse_l4(frame, ip.next_header(), l4, &mut layers)?;
        }
        EthernetProtocol::Ipv6 => {
            let ip = Ipv6Packet::new_checked(eth.payload())
                .map_err(|e| Error::Parse(format!("ipv6: {e}")))?;
            let total_len = 40 + ip.payload_len() as usize;
            layers.ipv6 = Some(ETHERNET_HEADER_LEN..ETHERNET_HEADER_LEN + total_len);
            layers.order.push(LayerKind::Ipv6);

            let mut next = ip.next_header();
            let mut l4_start = ETHERNET_HEADER_LEN + 40;
            let l4_end = ETHERNET_HEADER_LEN + total_len;
            if next == IpProtocol::HopByHop {
                if l4_end.saturating_sub(l4_start) < 8 {
                    return Err(Error::Parse("ipv6: truncated hop-by-hop header".into()));
                }
                next = IpProtocol::from(frame[l4_start]);
                let ext_len = (frame[l4_start + 1] as usize + 1) * 8;
                if l4_start + ext_len > l4_end {
                    return Err(Error::Parse("ipv6: hop-by-hop overruns payload".into()));
                }
                l4_start += ext_len;
            }
            parse_l4(frame, next, l4_start..l4_end, &mut layers)?;
        }
        _ => {}
    }

    Ok(layers)
}

fn parse_l4(
    frame: &[u8],
    proto: IpProtocol,
    l4: Range<usize>,
    layers: &mut ParsedLayers,
) -> Result<()> {
    match proto {
        IpProtocol::Icmp => {
            Icmpv4Packet::new_checked(&frame[l4.clone()])
                .map_err(|e| Error::Parse(format!("icmpv4: {e}")))?;
            layers.icmpv4 = Some(l4);
            layers.order.push(LayerKind::Icmpv4);
        }
        IpProtocol::Icmpv6 => {
            // Recognized so the demultiplexer can route it; never decoded
            // further (ICMPv6 is not answered).
            layers.icmpv6 = Some(l4);
            layers.order.push(LayerKind::Icmpv6);
        }
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(&frame[l4.clone()])
                .map_err(|e| Error::Parse(format!("tcp: {e}")))?;
            let header_len = tcp.header_len() as usize;
            layers.l4_payload = Some(l4.start + header_len..l4.end);
            layers.tcp = Some(l4);
            layers.order.push(LayerKind::Tcp);
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(&frame[l4.clone()])
                .map_err(|e| Error::Parse(format!("udp: {e}")))?;
            let udp_len = udp.len() as usize;
            layers.udp = Some(l4.start..l4.start + udp_len);
            layers.l4_payload = Some(l4.start + 8..l4.start + udp_len);
            layers.order.push(LayerKind::Udp);
        }
        _ => {}
    }
    Ok(())
}

fn check_capacity(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(DriverError::PacketTooLarge.into());
    }
    Ok(())
}

/// Serialize an ARP frame. Returns the frame length.
pub fn emit_arp(buf: &mut [u8], eth: &EthernetRepr, arp: &ArpRepr) -> Result<usize> {
    let len = ETHERNET_HEADER_LEN + arp.buffer_len();
    check_capacity(buf, len)?;

    let mut frame = EthernetFrame::new_unchecked(&mut buf[..len]);
    eth.emit(&mut frame);
    let mut packet = ArpPacket::new_unchecked(frame.payload_mut());
    arp.emit(&mut packet);

    Ok(len)
}

/// Serialize an ICMPv4-over-IPv4 frame. Returns the frame length.
pub fn emit_icmpv4(
    buf: &mut [u8],
    eth: &EthernetRepr,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    icmp: &Icmpv4Repr<'_>,
) -> Result<usize> {
    let caps = ChecksumCapabilities::default();
    let ip = Ipv4Repr {
        src_addr: Ipv4Address(src.octets()),
        dst_addr: Ipv4Address(dst.octets()),
        next_header: IpProtocol::Icmp,
        payload_len: icmp.buffer_len(),
        hop_limit: 64,
    };
    let len = ETHERNET_HEADER_LEN + ip.buffer_len() + icmp.buffer_len();
    check_capacity(buf, len)?;

    let mut frame = EthernetFrame::new_unchecked(&mut buf[..len]);
    eth.emit(&mut frame);
    let mut ip_packet = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip.emit(&mut ip_packet, &caps);
    let mut icmp_packet = Icmpv4Packet::new_unchecked(ip_packet.payload_mut());
    icmp.emit(&mut icmp_packet, &caps);

    Ok(len)
}

/// Serialize a UDP-over-IPv4 frame around `payload`. Returns the frame
/// length.
pub fn emit_udp4(
    buf: &mut [u8],
    eth: &EthernetRepr,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<usize> {
    let udp_len = 8 + payload.len();
    let caps = ChecksumCapabilities::default();
    let ip = Ipv4Repr {
        src_addr: Ipv4Address(src.octets()),
        dst_addr: Ipv4Address(dst.octets()),
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let len = ETHERNET_HEADER_LEN + ip.buffer_len() + udp_len;
    check_capacity(buf, len)?;

    let mut frame = EthernetFrame::new_unchecked(&mut buf[..len]);
    eth.emit(&mut frame);
    let mut ip_packet = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip.emit(&mut ip_packet, &caps);

    let udp = ip_packet.payload_mut();
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[6..8].fill(0);
    udp[8..].copy_from_slice(payload);
    let sum = checksum::l4(&src.octets(), &dst.octets(), IpProtocol::Udp.into(), udp);
    udp[6..8].copy_from_slice(&udp_checksum_field(sum).to_be_bytes());

    Ok(len)
}

/// Serialize a forwarded TCP/UDP frame: fresh Ethernet and IP headers,
/// the original L4 segment with its ports patched and checksum
/// recomputed. The IP family follows `dst`. Returns the frame length.
#[allow(clippy::too_many_arguments)]
pub fn emit_forwarded(
    buf: &mut [u8],
    eth_src: EthernetAddress,
    eth_dst: EthernetAddress,
    src: IpAddr,
    dst: IpAddr,
    proto: Protocol,
    l4: &[u8],
    src_port: u16,
    dst_port: u16,
) -> Result<usize> {
    let min_header = match proto {
        Protocol::Tcp => 20,
        Protocol::Udp => 8,
    };
    if l4.len() < min_header {
        return Err(Error::Parse(format!("{proto}: truncated segment")));
    }
    let ip_proto = match proto {
        Protocol::Tcp => IpProtocol::Tcp,
        Protocol::Udp => IpProtocol::Udp,
    };
    let caps = ChecksumCapabilities::default();

    let (len, src_bytes, dst_bytes): (usize, Vec<u8>, Vec<u8>) = match dst {
        IpAddr::V4(dst) => {
            let IpAddr::V4(src) = src else {
                return Err(Error::invalid("source and destination families differ"));
            };
            let ip = Ipv4Repr {
                src_addr: Ipv4Address(src.octets()),
                dst_addr: Ipv4Address(dst.octets()),
                next_header: ip_proto,
                payload_len: l4.len(),
                hop_limit: 64,
            };
            let len = ETHERNET_HEADER_LEN + ip.buffer_len() + l4.len();
            check_capacity(buf, len)?;

            let mut frame = EthernetFrame::new_unchecked(&mut buf[..len]);
            let eth = EthernetRepr {
                src_addr: eth_src,
                dst_addr: eth_dst,
                ethertype: EthernetProtocol::Ipv4,
            };
            eth.emit(&mut frame);
            let mut ip_packet = Ipv4Packet::new_unchecked(frame.payload_mut());
            ip.emit(&mut ip_packet, &caps);
            ip_packet.payload_mut().copy_from_slice(l4);

            (len, src.octets().to_vec(), dst.octets().to_vec())
        }
        IpAddr::V6(dst) => {
            let src: Ipv6Addr = match src {
                IpAddr::V6(src) => src,
                IpAddr::V4(src) => src.to_ipv6_mapped(),
            };
            let ip = Ipv6Repr {
                src_addr: Ipv6Address(src.octets()),
                dst_addr: Ipv6Address(dst.octets()),
                next_header: ip_proto,
                payload_len: l4.len(),
                hop_limit: 64,
            };
            let len = ETHERNET_HEADER_LEN + ip.buffer_len() + l4.len();
            check_capacity(buf, len)?;

            let mut frame = EthernetFrame::new_unchecked(&mut buf[..len]);
            let eth = EthernetRepr {
                src_addr: eth_src,
                dst_addr: eth_dst,
                ethertype: EthernetProtocol::Ipv6,
            };
            eth.emit(&mut frame);
            let mut ip_packet = Ipv6Packet::new_unchecked(frame.payload_mut());
            ip.emit(&mut ip_packet);
            ip_packet.payload_mut().copy_from_slice(l4);

            (len, src.octets().to_vec(), dst.octets().to_vec())
        }
    };

    // Patch ports and recompute the transport checksum over the new
    // pseudo-header; everything else of the original segment is kept.
    let segment = &mut buf[len - l4.len()..len];
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
    let checksum_at = match proto {
        Protocol::Tcp => 16,
        Protocol::Udp => 6,
    };
    segment[checksum_at..checksum_at + 2].fill(0);
    let sum = checksum::l4(&src_bytes, &dst_bytes, ip_proto.into(), segment);
    let sum = match proto {
        Protocol::Tcp => sum,
        Protocol::Udp => udp_checksum_field(sum),
    };
    segment[checksum_at..checksum_at + 2].copy_from_slice(&sum.to_be_bytes());

    Ok(len)
}

// A computed UDP checksum of zero is transmitted as all-ones; zero on
// the wire means "no checksum".
fn udp_checksum_field(sum: u16) -> u16 {
    if sum == 0 {
        0xffff
    } else {
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::ArpOperation;

    const SRC_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x01]);
    const DST_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x02]);

    fn eth_repr(ethertype: EthernetProtocol) -> EthernetRepr {
        EthernetRepr {
            src_addr: SRC_MAC,
            dst_addr: DST_MAC,
            ethertype,
        }
    }

    #[test]
    fn arp_round_trip() {
        let arp = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: SRC_MAC,
            source_protocol_addr: Ipv4Address::new(10, 0, 0, 8),
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: Ipv4Address::new(10, 0, 0, 7),
        };
        let mut buf = [0u8; 64];
        let len = emit_arp(&mut buf, &eth_repr(EthernetProtocol::Arp), &arp).unwrap();

        let layers = parse(&buf[..len]).unwrap();
        assert_eq!(layers.order, vec![LayerKind::Ethernet, LayerKind::Arp]);
        let packet = ArpPacket::new_unchecked(&buf[layers.arp.unwrap()]);
        assert_eq!(ArpRepr::parse(&packet).unwrap(), arp);
    }

    #[test]
    fn icmpv4_round_trip() {
        let payload = b"ping";
        let icmp = Icmpv4Repr::EchoRequest {
            ident: 9,
            seq_no: 7,
            data: payload,
        };
        let mut buf = [0u8; 128];
        let len = emit_icmpv4(
            &mut buf,
            &eth_repr(EthernetProtocol::Ipv4),
            Ipv4Addr::new(10, 0, 0, 8),
            Ipv4Addr::new(10, 0, 0, 20),
            &icmp,
        )
        .unwrap();

        let layers = parse(&buf[..len]).unwrap();
        assert_eq!(
            layers.order,
            vec![LayerKind::Ethernet, LayerKind::Ipv4, LayerKind::Icmpv4]
        );

        let ip = Ipv4Packet::new_unchecked(&buf[layers.ipv4.clone().unwrap()]);
        assert_eq!(ip.src_addr(), Ipv4Address::new(10, 0, 0, 8));
        assert_eq!(ip.dst_addr(), Ipv4Address::new(10, 0, 0, 20));
        assert_eq!(ip.hop_limit(), 64);

        let icmp_packet = Icmpv4Packet::new_unchecked(&buf[layers.icmpv4.unwrap()]);
        let parsed = Icmpv4Repr::parse(&icmp_packet, &ChecksumCapabilities::default()).unwrap();
        match parsed {
            Icmpv4Repr::EchoRequest { ident, seq_no, data } => {
                assert_eq!((ident, seq_no), (9, 7));
                assert_eq!(data, payload);
            }
            other => panic!("unexpected icmp repr: {other:?}"),
        }
    }

    #[test]
    fn udp4_emit_parses_with_valid_checksum() {
        let mut buf = [0u8; 256];
        let len = emit_udp4(
            &mut buf,
            &eth_repr(EthernetProtocol::Ipv4),
            Ipv4Addr::new(0, 0, 0, 0),
            Ipv4Addr::new(255, 255, 255, 255),
            68,
            67,
            b"lease please",
        )
        .unwrap();

        let layers = parse(&buf[..len]).unwrap();
        assert_eq!(
            layers.order,
            vec![LayerKind::Ethernet, LayerKind::Ipv4, LayerKind::Udp]
        );
        let udp = UdpPacket::new_unchecked(&buf[layers.udp.clone().unwrap()]);
        assert_eq!(udp.src_port(), 68);
        assert_eq!(udp.dst_port(), 67);
        assert_eq!(&buf[layers.l4_payload.unwrap()], b"lease please");

        // Recomputing over the emitted segment with the checksum zeroed
        // reproduces the stored value.
        let seg = &buf[layers.udp.unwrap()];
        let mut copy = seg.to_vec();
        copy[6..8].fill(0);
        let sum = checksum::l4(
            &[0, 0, 0, 0],
            &[255, 255, 255, 255],
            IpProtocol::Udp.into(),
            &copy,
        );
        assert_eq!(udp.checksum(), udp_checksum_field(sum));
    }

    #[test]
    fn forwarded_tcp_keeps_segment_and_patches_ports() {
        // Hand-build a TCP segment with options (MSS) and payload.
        let mut segment = vec![0u8; 24 + 5];
        segment[0..2].copy_from_slice(&55555u16.to_be_bytes());
        segment[2..4].copy_from_slice(&80u16.to_be_bytes());
        segment[4..8].copy_from_slice(&7u32.to_be_bytes()); // seq
        segment[12] = 6 << 4; // data offset: 24 bytes
        segment[13] = 0x02; // SYN
        segment[20..24].copy_from_slice(&[2, 4, 0x05, 0xb4]); // MSS 1460
        segment[24..].copy_from_slice(b"hello");

        let mut buf = [0u8; 256];
        let len = emit_forwarded(
            &mut buf,
            SRC_MAC,
            DST_MAC,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 30)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            Protocol::Tcp,
            &segment,
            49160,
            8080,
        )
        .unwrap();

        let layers = parse(&buf[..len]).unwrap();
        assert_eq!(
            layers.order,
            vec![LayerKind::Ethernet, LayerKind::Ipv4, LayerKind::Tcp]
        );
        let tcp_range = layers.tcp.unwrap();
        let tcp = TcpPacket::new_unchecked(&buf[tcp_range.clone()]);
        assert_eq!(tcp.src_port(), 49160);
        assert_eq!(tcp.dst_port(), 8080);
        assert!(tcp.syn());
        assert_eq!(tcp.header_len(), 24);
        assert_eq!(&buf[layers.l4_payload.unwrap()], b"hello");
        // Option bytes survived untouched.
        assert_eq!(&buf[tcp_range.start + 20..tcp_range.start + 24], &[2, 4, 0x05, 0xb4]);

        // Transport checksum is valid over the new pseudo-header.
        let mut copy = buf[tcp_range.clone()].to_vec();
        let stored = u16::from_be_bytes([copy[16], copy[17]]);
        copy[16..18].fill(0);
        let sum = checksum::l4(
            &Ipv4Addr::new(10, 0, 0, 30).octets(),
            &Ipv4Addr::new(192, 168, 1, 10).octets(),
            IpProtocol::Tcp.into(),
            &copy,
        );
        assert_eq!(stored, sum);
    }

    #[test]
    fn forwarded_to_ipv6_destination_emits_ipv6() {
        let mut segment = vec![0u8; 8 + 3];
        segment[4..6].copy_from_slice(&11u16.to_be_bytes()); // udp len
        segment[8..].copy_from_slice(b"abc");

        let dst: Ipv6Addr = "fd4c:bd56:5cee::10".parse().unwrap();
        let mut buf = [0u8; 256];
        let len = emit_forwarded(
            &mut buf,
            SRC_MAC,
            DST_MAC,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 30)),
            IpAddr::V6(dst),
            Protocol::Udp,
            &segment,
            49152,
            53,
        )
        .unwrap();

        let layers = parse(&buf[..len]).unwrap();
        assert_eq!(
            layers.order,
            vec![LayerKind::Ethernet, LayerKind::Ipv6, LayerKind::Udp]
        );
        let udp = UdpPacket::new_unchecked(&buf[layers.udp.unwrap()]);
        assert_eq!(udp.src_port(), 49152);
        assert_eq!(udp.dst_port(), 53);
    }

    #[test]
    fn family_mismatch_is_rejected() {
        let segment = vec![0u8; 20];
        let mut buf = [0u8; 128];
        let err = emit_forwarded(
            &mut buf,
            SRC_MAC,
            DST_MAC,
            IpAddr::V6("fd4c:bd56:5cee::1".parse().unwrap()),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            Protocol::Tcp,
            &segment,
            1,
            2,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn truncated_frames_fail_to_parse() {
        assert!(parse(&[0u8; 10]).is_err());

        // Ethernet header claiming IPv4 with a short payload.
        let mut frame = vec![0u8; 20];
        frame[12] = 0x08;
        frame[13] = 0x00;
        assert!(parse(&frame).is_err());
    }

    #[test]
    fn unknown_ethertype_stops_after_ethernet() {
        let mut frame = vec![0u8; 64];
        frame[12] = 0x88;
        frame[13] = 0xb5;
        let layers = parse(&frame).unwrap();
        assert_eq!(layers.order, vec![LayerKind::Ethernet]);
    }
}
