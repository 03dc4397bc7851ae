//! Peer cache: (ip -> mac) bindings learned from ARP replies.

use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use smoltcp::wire::EthernetAddress;

use crate::routes::normalize_ip;

/// How long a learned binding stays valid after its last observation.
pub const PEER_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
struct Peer {
    ip: [u8; 16],
    mac: EthernetAddress,
    expire_at: Instant,
}

/// TTL-bounded (ip -> mac) table, ordered by 16-byte IP.
#[derive(Default)]
pub struct PeerCache {
    peers: RwLock<Vec<Peer>>,
}

impl PeerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a binding.
    pub fn add_peer(&self, ip: IpAddr, mac: EthernetAddress) {
        self.add_peer_at(ip, mac, Instant::now());
    }

    fn add_peer_at(&self, ip: IpAddr, mac: EthernetAddress, now: Instant) {
        let key = normalize_ip(ip).octets();
        let peer = Peer {
            ip: key,
            mac,
            expire_at: now + PEER_TTL,
        };

        let mut peers = self.peers.write().unwrap();
        match peers.binary_search_by(|p| p.ip.cmp(&key)) {
            Ok(idx) => peers[idx] = peer,
            Err(idx) => peers.insert(idx, peer),
        }
    }

    /// Look up the MAC for `ip`, if known and not expired.
    pub fn lookup(&self, ip: IpAddr) -> Option<EthernetAddress> {
        self.lookup_at(ip, Instant::now())
    }

    fn lookup_at(&self, ip: IpAddr, now: Instant) -> Option<EthernetAddress> {
        let key = normalize_ip(ip).octets();
        let peers = self.peers.read().unwrap();
        let idx = peers.binary_search_by(|p| p.ip.cmp(&key)).ok()?;
        let peer = peers[idx];
        if peer.expire_at <= now {
            return None;
        }
        Some(peer.mac)
    }
}
