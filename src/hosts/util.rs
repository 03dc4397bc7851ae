//! Identity generation for inserted hosts.

use std::net::Ipv6Addr;

use smoltcp::wire::EthernetAddress;

use crate::error::Result;

/// Fixed /48 prefix of every synthesized IPv6 address.
pub(crate) const IPV6_PREFIX: [u8; 6] = [0xfd, 0x4c, 0xbd, 0x56, 0x5c, 0xee];

/// Generate a random unicast, locally administered MAC.
pub(crate) fn generate_mac() -> Result<EthernetAddress> {
    let mut addr = [0u8; 6];
    getrandom::fill(&mut addr)?;
    addr[0] = (addr[0] | 0x02) & !0x01;
    Ok(EthernetAddress(addr))
}

/// Generate an address under `fd4c:bd56:5cee::/48`; bytes 6-7 put local
/// hosts on the `8000::/64` subnet and remote hosts below it.
pub(crate) fn generate_ipv6(local: bool) -> Result<Ipv6Addr> {
    let mut addr = [0u8; 16];
    getrandom::fill(&mut addr)?;

    addr[..6].copy_from_slice(&IPV6_PREFIX);
    if local {
        addr[6] = 0x80;
        addr[7] = 0x00;
    } else {
        addr[6] = 0x00;
        addr[7] = 0x00;
    }

    Ok(Ipv6Addr::from(addr))
}

/// Generate a two-word host name, e.g. "nimble-otter".
pub(crate) fn generate_name() -> Result<String> {
    let adjective = ADJECTIVES[random_index(ADJECTIVES.len())?];
    let creature = CREATURES[random_index(CREATURES.len())?];
    Ok(format!("{adjective}-{creature}"))
}

fn random_index(len: usize) -> Result<usize> {
    let mut bytes = [0u8; 4];
    getrandom::fill(&mut bytes)?;
    Ok(u32::from_ne_bytes(bytes) as usize % len)
}

const ADJECTIVES: &[&str] = &[
    "able", "amber", "brave", "bright", "calm", "clever", "crisp", "daring",
    "deft", "eager", "fleet", "fond", "gentle", "glad", "grand", "happy",
    "keen", "kind", "light", "lively", "lucky", "merry", "mild", "nimble",
    "noble", "plain", "proud", "quick", "quiet", "rapid", "sharp", "shy",
    "solid", "steady", "swift", "tidy", "vivid", "warm", "wise", "witty",
];

const CREATURES: &[&str] = &[
    "badger", "bear", "beaver", "bison", "crane", "crow", "deer", "dove",
    "falcon", "ferret", "finch", "fox", "hare", "hawk", "heron", "ibis",
    "koala", "lark", "lemur", "lynx", "marten", "mole", "moose", "otter",
    "owl", "panda", "pike", "raven", "robin", "seal", "shrew", "sparrow",
    "stoat", "stork", "swan", "tern", "vole", "walrus", "weasel", "wren",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_unicast_and_locally_administered() {
        for _ in 0..32 {
            let mac = generate_mac().unwrap();
            assert_eq!(mac.0[0] & 0x01, 0, "unicast bit");
            assert_eq!(mac.0[0] & 0x02, 0x02, "locally administered bit");
        }
    }

    #[test]
    fn ipv6_carries_prefix_and_subnet_bits() {
        let local = generate_ipv6(true).unwrap().octets();
        assert_eq!(&local[..6], &IPV6_PREFIX);
        assert_eq!(&local[6..8], &[0x80, 0x00]);

        let remote = generate_ipv6(false).unwrap().octets();
        assert_eq!(&remote[..6], &IPV6_PREFIX);
        assert_eq!(&remote[6..8], &[0x00, 0x00]);
    }

    #[test]
    fn names_are_two_words() {
        let name = generate_name().unwrap();
        assert_eq!(name.split('-').count(), 2);
    }
}
