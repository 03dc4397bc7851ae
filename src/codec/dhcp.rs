//! DHCP message codec (RFC 2131).
//!
//! Fixed 236-byte header, the magic cookie, then option TLVs terminated
//! by option 255. Unknown options are carried but ignored; messages stay
//! within 576 bytes.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use smoltcp::wire::EthernetAddress;

use crate::error::{Error, Result};

/// Magic cookie separating the fixed header from the options.
pub const MAGIC_COOKIE: u32 = 0x6382_5363;

/// Maximum DHCP message size we produce or advertise.
pub const MAX_MESSAGE_SIZE: u16 = 576;

/// BOOTP op field.
pub const OP_REQUEST: u8 = 1;
pub const OP_REPLY: u8 = 2;

/// Option codes used by the lease client.
pub mod opt {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DOMAIN_NAME_SERVER: u8 = 6;
    pub const HOST_NAME: u8 = 12;
    pub const DOMAIN_NAME: u8 = 15;
    pub const BROADCAST_ADDRESS: u8 = 28;
    pub const NTP_SERVERS: u8 = 42;
    pub const REQUESTED_IP: u8 = 50;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_IDENTIFIER: u8 = 54;
    pub const PARAMETER_REQUEST_LIST: u8 = 55;
    pub const MAX_MESSAGE_SIZE: u8 = 57;
    pub const VENDOR_CLASS: u8 = 60;
    pub const CLIENT_IDENTIFIER: u8 = 61;
    pub const END: u8 = 255;
}

/// Option 53 message type values.
pub mod msg_type {
    pub const DISCOVER: u8 = 1;
    pub const OFFER: u8 = 2;
    pub const REQUEST: u8 = 3;
    pub const ACK: u8 = 5;
}

const HEADER_LEN: usize = 236;
const MIN_MESSAGE_LEN: usize = HEADER_LEN + 4;

/// A decoded (or to-be-encoded) DHCP message.
#[derive(Debug, Clone)]
pub struct Message {
    pub op: u8,
    pub hardware_type: u8,
    pub hardware_len: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub client_mac: EthernetAddress,
    pub server_name: String,
    pub file: String,
    /// Options by code, emitted in ascending order.
    pub options: BTreeMap<u8, Vec<u8>>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            op: OP_REQUEST,
            hardware_type: 1, // Ethernet
            hardware_len: 6,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            client_mac: EthernetAddress([0; 6]),
            server_name: String::new(),
            file: String::new(),
            options: BTreeMap::new(),
        }
    }
}

impl Message {
    /// Decode a message from a UDP payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_MESSAGE_LEN {
            return Err(Error::Parse("dhcp: message too short".into()));
        }
        if BigEndian::read_u32(&data[236..240]) != MAGIC_COOKIE {
            return Err(Error::Parse("dhcp: bad magic cookie".into()));
        }

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&data[28..34]);

        let mut msg = Message {
            op: data[0],
            hardware_type: data[1],
            hardware_len: data[2],
            hops: data[3],
            xid: BigEndian::read_u32(&data[4..8]),
            secs: BigEndian::read_u16(&data[8..10]),
            flags: BigEndian::read_u16(&data[10..12]),
            ciaddr: read_ipv4(&data[12..16]),
            yiaddr: read_ipv4(&data[16..20]),
            siaddr: read_ipv4(&data[20..24]),
            giaddr: read_ipv4(&data[24..28]),
            client_mac: EthernetAddress(mac),
            server_name: read_padded_str(&data[44..108]),
            file: read_padded_str(&data[108..236]),
            options: BTreeMap::new(),
        };

        let mut rest = &data[240..];
        loop {
            let Some((&code, tail)) = rest.split_first() else {
                break;
            };
            rest = tail;
            match code {
                opt::PAD => continue,
                opt::END => break,
                _ => {
                    let Some((&len, tail)) = rest.split_first() else {
                        return Err(Error::Parse("dhcp: truncated option header".into()));
                    };
                    let len = len as usize;
                    if tail.len() < len {
                        return Err(Error::Parse("dhcp: truncated option value".into()));
                    }
                    msg.options.insert(code, tail[..len].to_vec());
                    rest = &tail[len..];
                }
            }
        }

        Ok(msg)
    }

    /// Encode the fixed header, cookie, options (ascending), and the end
    /// marker.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_MESSAGE_LEN + 64);

        buf.push(self.op);
        buf.push(self.hardware_type);
        buf.push(self.hardware_len);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.client_mac.0);
        buf.resize(44, 0); // chaddr padding to 16 bytes
        write_padded_str(&mut buf, &self.server_name, 64);
        write_padded_str(&mut buf, &self.file, 128);
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());

        for (&code, value) in &self.options {
            if code == opt::PAD || code == opt::END {
                continue;
            }
            buf.push(code);
            buf.push(value.len() as u8);
            buf.extend_from_slice(value);
        }
        buf.push(opt::END);

        buf
    }

    /// Value of the message-type option (53), if present and well formed.
    pub fn message_type(&self) -> Option<u8> {
        match self.options.get(&opt::MESSAGE_TYPE)?.as_slice() {
            [t] => Some(*t),
            _ => None,
        }
    }
}

fn read_ipv4(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

fn read_padded_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_padded_str(buf: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let take = bytes.len().min(width);
    buf.extend_from_slice(&bytes[..take]);
    buf.resize(buf.len() + width - take, 0);
}
