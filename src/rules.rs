//! Forwarding rules: (protocol, source host, source port) -> target.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ports::PortAllocator;
use crate::protocols::Protocol;

/// A declaration that traffic to `src_host_id` on `src_port` should be
/// forwarded to `dst_ip:dst_port` (the gateway's address when `dst_ip`
/// is unset).
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub id: String,
    pub protocol: Protocol,
    pub src_host_id: String,
    pub src_port: u16,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(hash: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(hash, |h, &b| (h ^ b as u64).wrapping_mul(FNV_PRIME))
}

/// 64-bit FNV-1a over the rule's lookup triple.
fn triple_hash(protocol: Protocol, src_host_id: &str, src_port: u16) -> u64 {
    let hash = fnv1a(FNV_OFFSET, &[protocol.as_u8()]);
    let hash = fnv1a(hash, src_host_id.as_bytes());
    fnv1a(hash, &src_port.to_be_bytes())
}

/// Read-only snapshot: rules sorted by triple hash, confirmed exactly
/// among collisions.
#[derive(Default)]
pub struct Table {
    entries: Vec<(u64, Arc<Rule>)>,
}

impl Table {
    fn build(rules: Vec<Arc<Rule>>) -> Self {
        let mut entries: Vec<(u64, Arc<Rule>)> = rules
            .into_iter()
            .map(|r| (triple_hash(r.protocol, &r.src_host_id, r.src_port), r))
            .collect();
        entries.sort_by_key(|(hash, _)| *hash);
        Self { entries }
    }

    pub fn lookup(&self, protocol: Protocol, src_host_id: &str, src_port: u16) -> Option<Arc<Rule>> {
        let hash = triple_hash(protocol, src_host_id, src_port);
        let idx = self.entries.partition_point(|(h, _)| *h < hash);
        self.entries[idx..]
            .iter()
            .take_while(|(h, _)| *h == hash)
            .map(|(_, rule)| rule)
            .find(|rule| {
                rule.protocol == protocol
                    && rule.src_host_id == src_host_id
                    && rule.src_port == src_port
            })
            .cloned()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.entries.iter().map(|(_, rule)| rule)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Controller {
    ports: Arc<PortAllocator>,
    rules: Mutex<HashMap<String, Rule>>,
    table: RwLock<Arc<Table>>,
}

impl Controller {
    pub fn new(ports: Arc<PortAllocator>) -> Self {
        Self {
            ports,
            rules: Mutex::new(HashMap::new()),
            table: RwLock::new(Arc::new(Table::default())),
        }
    }

    /// Current snapshot. Hold the returned Arc, not the controller, for
    /// the duration of any lookups.
    pub fn table(&self) -> Arc<Table> {
        Arc::clone(&self.table.read().unwrap())
    }

    /// Validate and install a rule. The source port is reserved on the
    /// source host; `dst_port` defaults to `src_port`. Re-adding a rule
    /// with the same id replaces it.
    pub fn add_rule(&self, mut rule: Rule) -> Result<Rule> {
        let mut rules = self.rules.lock().unwrap();

        if rule.src_host_id.is_empty() {
            return Err(Error::invalid("source host id must be set"));
        }
        if rule.src_port == 0 {
            return Err(Error::invalid("source port must be set"));
        }
        if rule.id.is_empty() {
            rule.id = Uuid::new_v4().to_string();
        }
        if rule.dst_port == 0 {
            rule.dst_port = rule.src_port;
        }

        if let Some(existing) = self
            .table()
            .lookup(rule.protocol, &rule.src_host_id, rule.src_port)
        {
            if existing.id != rule.id {
                return Err(Error::conflict(format!(
                    "a rule already exists for {}:{}:{}",
                    rule.src_host_id, rule.protocol, rule.src_port
                )));
            }
        }

        // Reserve the new source port before giving up the old one, so a
        // failed replacement leaves the previous rule intact.
        let previous = rules.get(&rule.id).cloned();
        let triple_unchanged = previous.as_ref().is_some_and(|p| {
            p.protocol == rule.protocol
                && p.src_host_id == rule.src_host_id
                && p.src_port == rule.src_port
        });
        if !triple_unchanged {
            self.ports
                .allocate(&rule.src_host_id, rule.protocol, rule.src_port)?;
            if let Some(p) = previous {
                self.ports.release(&p.src_host_id, p.protocol, p.src_port);
            }
        }

        debug!(id = %rule.id, %rule.protocol, host = %rule.src_host_id, port = rule.src_port, "rules: insert");
        rules.insert(rule.id.clone(), rule.clone());
        self.publish(&rules);

        Ok(rule)
    }

    /// Remove a rule by id, releasing its source port. Unknown ids are a
    /// no-op.
    pub fn remove_rule(&self, id: &str) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.remove(id) {
            self.ports
                .release(&rule.src_host_id, rule.protocol, rule.src_port);
            self.publish(&rules);
        }
    }

    /// Remove every rule whose source is `host_id`.
    pub fn remove_rules_for_host(&self, host_id: &str) {
        let mut rules = self.rules.lock().unwrap();
        rules.retain(|_, rule| {
            let keep = rule.src_host_id != host_id;
            if !keep {
                self.ports
                    .release(&rule.src_host_id, rule.protocol, rule.src_port);
            }
            keep
        });
        self.publish(&rules);
    }

    fn publish(&self, rules: &HashMap<String, Rule>) {
        let snapshot: Vec<Arc<Rule>> = rules.values().cloned().map(Arc::new).collect();
        let tab = Arc::new(Table::build(snapshot));
        *self.table.write().unwrap() = tab;
    }
}
