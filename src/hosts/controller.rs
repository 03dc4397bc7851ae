//! Host controller: owns the host map, publishes table snapshots.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ports::PortAllocator;

use super::table::Table;
use super::util::{generate_ipv6, generate_mac, generate_name};
use super::{Host, HostSpec};

pub struct Controller {
    ports: Arc<PortAllocator>,
    hosts: Mutex<HashMap<String, Host>>,
    table: RwLock<Arc<Table>>,
}

impl Controller {
    pub fn new(ports: Arc<PortAllocator>) -> Self {
        Self {
            ports,
            hosts: Mutex::new(HashMap::new()),
            table: RwLock::new(Arc::new(Table::default())),
        }
    }

    /// Current snapshot. Hold the returned Arc, not the controller, for
    /// the duration of any lookups.
    pub fn table(&self) -> Arc<Table> {
        Arc::clone(&self.table.read().unwrap())
    }

    /// Insert a host, generating any identity the request leaves out.
    pub fn add_host(&self, spec: HostSpec) -> Result<Host> {
        let mut hosts = self.hosts.lock().unwrap();
        let tab = self.table();

        if let Some(id) = &spec.id {
            if tab.lookup_by_id(id).is_some() {
                return Err(Error::conflict("host id is already in use"));
            }
        }
        if let Some(name) = &spec.name {
            if tab.lookup_by_name(name).is_some() {
                return Err(Error::conflict("host name is already in use"));
            }
        }
        for &ip in &spec.ipv4_addrs {
            if tab.lookup_by_ipv4(ip).is_some() {
                return Err(Error::conflict("host IPv4 is already in use"));
            }
        }
        for &ip in &spec.ipv6_addrs {
            if tab.lookup_by_ipv6(ip).is_some() {
                return Err(Error::conflict("host IPv6 is already in use"));
            }
        }

        let id = match spec.id {
            Some(id) => id,
            None => loop {
                let id = Uuid::new_v4().to_string();
                if tab.lookup_by_id(&id).is_none() {
                    break id;
                }
            },
        };
        let name = match spec.name {
            Some(name) => name,
            None => loop {
                let name = generate_name()?;
                if tab.lookup_by_name(&name).is_none() {
                    break name;
                }
            },
        };
        let mac = match spec.mac {
            Some(mac) => mac,
            None => generate_mac()?,
        };
        let mut ipv6_addrs = spec.ipv6_addrs;
        if ipv6_addrs.is_empty() {
            loop {
                let ip = generate_ipv6(spec.local)?;
                if tab.lookup_by_ipv6(ip).is_none() {
                    ipv6_addrs.push(ip);
                    break;
                }
            }
        }

        let host = Host {
            id: id.clone(),
            name,
            local: spec.local,
            mac,
            ipv4_addrs: spec.ipv4_addrs,
            ipv6_addrs,
            up: spec.up,
        };

        debug!(id = %host.id, name = %host.name, "hosts: insert");
        hosts.insert(id, host.clone());
        self.publish(&hosts);

        Ok(host)
    }

    /// Remove a host by id or name, releasing every port it holds.
    pub fn remove_host(&self, id_or_name: &str) -> Result<Host> {
        let mut hosts = self.hosts.lock().unwrap();

        let host = self
            .table()
            .lookup_by_name_or_id(id_or_name)
            .ok_or_else(|| Error::NotFound(format!("host {id_or_name}")))?;
        let removed = hosts
            .remove(&host.id)
            .ok_or_else(|| Error::NotFound(format!("host {id_or_name}")))?;

        self.ports.forget_host(&removed.id);
        self.publish(&hosts);

        Ok(removed)
    }

    /// Append an IPv4 address to a host. Re-adding an address the host
    /// already owns is a no-op.
    pub fn add_ipv4(&self, id_or_name: &str, ip: Ipv4Addr) -> Result<()> {
        let mut hosts = self.hosts.lock().unwrap();

        let tab = self.table();
        let host = tab
            .lookup_by_name_or_id(id_or_name)
            .ok_or_else(|| Error::NotFound(format!("host {id_or_name}")))?;
        if let Some(other) = tab.lookup_by_ipv4(ip) {
            if other.id != host.id {
                return Err(Error::conflict("host IPv4 is already in use"));
            }
            return Ok(());
        }

        let host = hosts
            .get_mut(&host.id)
            .ok_or_else(|| Error::NotFound(format!("host {id_or_name}")))?;
        host.ipv4_addrs.push(ip);
        self.publish(&hosts);

        Ok(())
    }

    /// Mark a host up or down. Taking a host down also forgets its port
    /// pool.
    pub fn set_state(&self, id_or_name: &str, up: bool) -> Result<()> {
        let mut hosts = self.hosts.lock().unwrap();

        let host = self
            .table()
            .lookup_by_name_or_id(id_or_name)
            .ok_or_else(|| Error::NotFound(format!("host {id_or_name}")))?;
        let host = hosts
            .get_mut(&host.id)
            .ok_or_else(|| Error::NotFound(format!("host {id_or_name}")))?;

        host.up = up;
        if !up {
            self.ports.forget_host(&host.id);
        }
        self.publish(&hosts);

        Ok(())
    }

    fn publish(&self, hosts: &HashMap<String, Host>) {
        let snapshot: Vec<Arc<Host>> = hosts.values().cloned().map(Arc::new).collect();
        let tab = Arc::new(Table::build(snapshot));
        *self.table.write().unwrap() = tab;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::Protocol;
    use std::net::Ipv6Addr;

    fn controller() -> Controller {
        Controller::new(Arc::new(PortAllocator::new()))
    }

    #[test]
    fn sorted_ipv4_lookup() {
        let ctrl = controller();
        for last in [3u8, 5, 4, 2] {
            ctrl.add_host(HostSpec::default().ipv4(Ipv4Addr::new(172, 18, 0, last)))
                .unwrap();
        }
        ctrl.add_host(HostSpec::default()).unwrap();

        let tab = ctrl.table();
        assert_eq!(tab.len(), 5);
        for last in [2u8, 3, 4, 5] {
            let host = tab
                .lookup_by_ipv4(Ipv4Addr::new(172, 18, 0, last))
                .expect("lookup");
            assert_eq!(host.ipv4(), Some(Ipv4Addr::new(172, 18, 0, last)));
        }
        assert!(tab.lookup_by_ipv4(Ipv4Addr::new(172, 18, 0, 6)).is_none());
    }

    #[test]
    fn generated_identity_is_filled_in() {
        let ctrl = controller();
        let host = ctrl.add_host(HostSpec::default().local()).unwrap();

        assert_eq!(host.id.len(), 36, "uuid shaped");
        assert!(!host.name.is_empty());
        assert_eq!(host.mac.0[0] & 0x03, 0x02);
        assert_eq!(host.ipv6_addrs.len(), 1);
        let octets = host.ipv6().unwrap().octets();
        assert_eq!(&octets[..8], &[0xfd, 0x4c, 0xbd, 0x56, 0x5c, 0xee, 0x80, 0x00]);
    }

    #[test]
    fn id_prefix_lookup_needs_eight_chars() {
        let ctrl = controller();
        let host = ctrl.add_host(HostSpec::default()).unwrap();

        let tab = ctrl.table();
        assert!(tab.lookup_by_id(&host.id[..7]).is_none(), "7 chars must fail");
        let found = tab.lookup_by_id(&host.id[..8]).expect("8 chars may match");
        assert_eq!(found.id, host.id);
        assert!(tab.lookup_by_id(&host.id).is_some(), "full id matches");
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let ctrl = controller();
        let host = ctrl
            .add_host(
                HostSpec::named("controller")
                    .ipv4(Ipv4Addr::new(172, 18, 0, 2))
                    .ipv6("fd4c:bd56:5cee:8000::2".parse::<Ipv6Addr>().unwrap()),
            )
            .unwrap();

        let cases = [
            HostSpec { id: Some(host.id.clone()), ..HostSpec::default() },
            HostSpec::named("controller"),
            HostSpec::default().ipv4(Ipv4Addr::new(172, 18, 0, 2)),
            HostSpec::default().ipv6("fd4c:bd56:5cee:8000::2".parse().unwrap()),
        ];
        for spec in cases {
            assert!(matches!(ctrl.add_host(spec), Err(Error::Conflict(_))));
        }
    }

    #[test]
    fn remove_host_releases_its_ports() {
        let ports = Arc::new(PortAllocator::new());
        let ctrl = Controller::new(Arc::clone(&ports));
        let host = ctrl.add_host(HostSpec::default()).unwrap();

        ports.allocate(&host.id, Protocol::Tcp, 8080).unwrap();
        ports.allocate(&host.id, Protocol::Udp, 0).unwrap();

        let removed = ctrl.remove_host(&host.name).unwrap();
        assert_eq!(removed.id, host.id);
        assert!(ctrl.table().is_empty());
        assert_eq!(ports.allocated_count(&host.id, Protocol::Tcp), 0);
        assert_eq!(ports.allocated_count(&host.id, Protocol::Udp), 0);

        assert!(matches!(
            ctrl.remove_host(&host.name),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn down_state_forgets_the_port_pool() {
        let ports = Arc::new(PortAllocator::new());
        let ctrl = Controller::new(Arc::clone(&ports));
        let host = ctrl.add_host(HostSpec::default().up()).unwrap();
        ports.allocate(&host.id, Protocol::Tcp, 0).unwrap();

        ctrl.set_state(&host.id, false).unwrap();
        let tab = ctrl.table();
        assert!(!tab.lookup_by_id(&host.id).unwrap().up);
        assert_eq!(ports.allocated_count(&host.id, Protocol::Tcp), 0);

        ctrl.set_state(&host.id, true).unwrap();
        assert!(ctrl.table().lookup_by_id(&host.id).unwrap().up);
    }

    #[test]
    fn add_ipv4_appends_and_checks_conflicts() {
        let ctrl = controller();
        let a = ctrl.add_host(HostSpec::default().ipv4(Ipv4Addr::new(172, 18, 0, 2))).unwrap();
        let b = ctrl.add_host(HostSpec::default()).unwrap();

        ctrl.add_ipv4(&b.id, Ipv4Addr::new(172, 18, 0, 9)).unwrap();
        let tab = ctrl.table();
        assert_eq!(
            tab.lookup_by_ipv4(Ipv4Addr::new(172, 18, 0, 9)).unwrap().id,
            b.id
        );

        assert!(matches!(
            ctrl.add_ipv4(&b.id, Ipv4Addr::new(172, 18, 0, 2)),
            Err(Error::Conflict(_))
        ));
        // Re-adding a host's own address is a no-op.
        ctrl.add_ipv4(&a.id, Ipv4Addr::new(172, 18, 0, 2)).unwrap();
    }

    #[test]
    fn mapped_ipv6_lookup_normalizes_to_ipv4() {
        let ctrl = controller();
        let host = ctrl
            .add_host(HostSpec::default().ipv4(Ipv4Addr::new(10, 0, 0, 20)))
            .unwrap();
        let tab = ctrl.table();
        let mapped = Ipv4Addr::new(10, 0, 0, 20).to_ipv6_mapped();
        assert_eq!(tab.lookup_by_ip(mapped.into()).unwrap().id, host.id);
    }
}
