//! Shared system facts.
//!
//! Process-wide, learn-once values for the gateway and controller
//! identities. The ARP handler discovers the gateway, the DHCP client
//! leases the controller IPv4; everything else waits for the facts it
//! needs before going to work.

use std::net::Ipv4Addr;
use std::sync::RwLock;
use std::time::SystemTime;

use smoltcp::wire::EthernetAddress;
use tokio::sync::Notify;

#[derive(Default)]
struct Facts {
    gateway_mac: Option<EthernetAddress>,
    gateway_ipv4: Option<Ipv4Addr>,
    controller_mac: Option<EthernetAddress>,
    controller_ipv4: Option<Ipv4Addr>,
    controller_last_dhcp_renew: Option<SystemTime>,
}

/// Gateway/controller MAC+IPv4 facts with wait-until-known accessors.
///
/// Every `set_*` wakes all waiters; a waiter returns as soon as it
/// observes the field's transition from unknown to known.
#[derive(Default)]
pub struct SystemFacts {
    facts: RwLock<Facts>,
    notify: Notify,
}

macro_rules! fact_accessors {
    ($get:ident, $set:ident, $wait:ident, $field:ident, $ty:ty) => {
        pub fn $get(&self) -> Option<$ty> {
            self.facts.read().unwrap().$field
        }

        pub fn $set(&self, value: $ty) {
            self.facts.write().unwrap().$field = Some(value);
            self.notify.notify_waiters();
        }

        /// Blocks until the fact is known, then returns it.
        pub async fn $wait(&self) -> $ty {
            loop {
                // Register for wakeups before re-checking so a set between
                // the check and the await is never missed.
                let notified = self.notify.notified();
                if let Some(value) = self.$get() {
                    return value;
                }
                notified.await;
            }
        }
    };
}

impl SystemFacts {
    pub fn new() -> Self {
        Self::default()
    }

    fact_accessors!(gateway_mac, set_gateway_mac, wait_for_gateway_mac, gateway_mac, EthernetAddress);
    fact_accessors!(gateway_ipv4, set_gateway_ipv4, wait_for_gateway_ipv4, gateway_ipv4, Ipv4Addr);
    fact_accessors!(controller_mac, set_controller_mac, wait_for_controller_mac, controller_mac, EthernetAddress);

    pub fn controller_ipv4(&self) -> Option<Ipv4Addr> {
        self.facts.read().unwrap().controller_ipv4
    }

    /// Record the controller lease. Also stamps the DHCP renew time.
    pub fn set_controller_ipv4(&self, addr: Ipv4Addr) {
        {
            let mut facts = self.facts.write().unwrap();
            facts.controller_ipv4 = Some(addr);
            facts.controller_last_dhcp_renew = Some(SystemTime::now());
        }
        self.notify.notify_waiters();
    }

    pub async fn wait_for_controller_ipv4(&self) -> Ipv4Addr {
        loop {
            let notified = self.notify.notified();
            if let Some(addr) = self.controller_ipv4() {
                return addr;
            }
            notified.await;
        }
    }

    /// Last time a DHCP negotiation completed, if any.
    pub fn controller_last_dhcp_renew(&self) -> Option<SystemTime> {
        self.facts.read().unwrap().controller_last_dhcp_renew
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn facts_start_unknown() {
        let system = SystemFacts::new();
        assert!(system.gateway_mac().is_none());
        assert!(system.gateway_ipv4().is_none());
        assert!(system.controller_mac().is_none());
        assert!(system.controller_ipv4().is_none());
        assert!(system.controller_last_dhcp_renew().is_none());
    }

    #[test]
    fn set_controller_ipv4_stamps_renew_time() {
        let system = SystemFacts::new();
        system.set_controller_ipv4(Ipv4Addr::new(172, 18, 0, 5));
        assert_eq!(system.controller_ipv4(), Some(Ipv4Addr::new(172, 18, 0, 5)));
        assert!(system.controller_last_dhcp_renew().is_some());
    }

    #[tokio::test]
    async fn waiters_wake_on_set() {
        let system = Arc::new(SystemFacts::new());

        let waiter = Arc::clone(&system);
        let task = tokio::spawn(async move { waiter.wait_for_gateway_mac().await });

        // Give the waiter a chance to park first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mac = EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        system.set_gateway_mac(mac);

        let got = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(got, mac);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_known() {
        let system = SystemFacts::new();
        system.set_gateway_ipv4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(
            system.wait_for_gateway_ipv4().await,
            Ipv4Addr::new(10, 0, 0, 1)
        );
    }
}
