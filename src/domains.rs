use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::SandboxConfig;
use crate::error::{ScriptError, ScriptResult};
use crate::ids::{DomainId, ItemId};
use crate::lock;
use crate::permissions::TrustLevel;
use crate::scripts::Sandbox;

struct Domain {
    ceiling: TrustLevel,
    members: BTreeSet<ItemId>,
    sandbox: Arc<Sandbox>,
    recyclable: bool,
}

#[derive(Default)]
struct DomainTable {
    domains: BTreeMap<DomainId, Domain>,
    membership: HashMap<ItemId, DomainId>,
    next_id: u32,
    created: u64,
    recycled: u64,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub domain: DomainId,
    pub ceiling: TrustLevel,
    pub sandbox: Arc<Sandbox>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSummary {
    pub id: DomainId,
    pub ceiling: TrustLevel,
    pub population: usize,
    pub recyclable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainStats {
    pub live: usize,
    pub populated: usize,
    pub created: u64,
    pub recycled: u64,
}

/// Groups instances into bounded sandboxes that share a trust ceiling.
pub struct DomainManager {
    capacity: usize,
    max_domains: usize,
    sandbox_config: SandboxConfig,
    handler_budget: Option<Duration>,
    table: Mutex<DomainTable>,
}

impl DomainManager {
    pub fn new(
        capacity: usize,
        max_domains: usize,
        sandbox_config: SandboxConfig,
        handler_budget: Option<Duration>,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            max_domains,
            sandbox_config,
            handler_budget,
            table: Mutex::new(DomainTable::default()),
        }
    }

    /// Places `item` in a domain whose ceiling is at least `required`. An item that already has
    /// an adequate domain keeps it.
    pub fn assign(&self, item: ItemId, required: TrustLevel) -> ScriptResult<Assignment> {
        let mut table = lock(&self.table);
        if let Some(current) = table.membership.get(&item).copied() {
            if let Some(domain) = table.domains.get(&current) {
                if domain.ceiling >= required {
                    return Ok(Assignment { domain: current, ceiling: domain.ceiling, sandbox: domain.sandbox.clone() });
                }
            }
            Self::detach(&mut table, item);
        }

        let capacity = self.capacity;
        let chosen = table
            .domains
            .iter()
            .filter(|(_, domain)| domain.ceiling >= required && domain.members.len() < capacity)
            .min_by_key(|(id, domain)| (domain.ceiling, **id))
            .map(|(id, _)| *id);

        let id = match chosen {
            Some(id) => id,
            None => {
                if table.domains.len() >= self.max_domains {
                    let before = table.domains.len();
                    table.domains.retain(|_, domain| !(domain.recyclable && domain.members.is_empty()));
                    table.recycled += (before - table.domains.len()) as u64;
                }
                if table.domains.len() >= self.max_domains {
                    tracing::warn!(item = %item, limit = self.max_domains, %required, "isolation domains exhausted");
                    return Err(ScriptError::SandboxUnavailable { item, limit: self.max_domains });
                }
                table.next_id += 1;
                let id = DomainId(table.next_id);
                let sandbox = Arc::new(Sandbox::new(&self.sandbox_config, self.handler_budget));
                table.domains.insert(
                    id,
                    Domain { ceiling: required, members: BTreeSet::new(), sandbox, recyclable: false },
                );
                table.created += 1;
                tracing::debug!(domain = %id, ceiling = %required, "created isolation domain");
                id
            }
        };

        table.membership.insert(item, id);
        let domain = table.domains.get_mut(&id).ok_or(ScriptError::SandboxUnavailable { item, limit: self.max_domains })?;
        domain.members.insert(item);
        domain.recyclable = false;
        Ok(Assignment { domain: id, ceiling: domain.ceiling, sandbox: domain.sandbox.clone() })
    }

    /// Removes `item` from its domain. The caller must already hold the instance's dispatch
    /// lock so nothing of it is in flight.
    pub fn release(&self, item: ItemId) -> Option<DomainId> {
        let mut table = lock(&self.table);
        Self::detach(&mut table, item)
    }

    fn detach(table: &mut DomainTable, item: ItemId) -> Option<DomainId> {
        let id = table.membership.remove(&item)?;
        if let Some(domain) = table.domains.get_mut(&id) {
            domain.members.remove(&item);
            if domain.members.is_empty() {
                domain.recyclable = true;
            }
        }
        Some(id)
    }

    /// Tears down every empty domain marked recyclable. Returns how many were dropped.
    pub fn recycle_empty_domains(&self) -> usize {
        let mut table = lock(&self.table);
        let before = table.domains.len();
        table.domains.retain(|_, domain| !(domain.recyclable && domain.members.is_empty()));
        let recycled = before - table.domains.len();
        table.recycled += recycled as u64;
        if recycled > 0 {
            tracing::debug!(recycled, live = table.domains.len(), "recycled isolation domains");
        }
        recycled
    }

    pub fn summaries(&self) -> Vec<DomainSummary> {
        lock(&self.table)
            .domains
            .iter()
            .map(|(id, domain)| DomainSummary {
                id: *id,
                ceiling: domain.ceiling,
                population: domain.members.len(),
                recyclable: domain.recyclable,
            })
            .collect()
    }

    pub fn stats(&self) -> DomainStats {
        let table = lock(&self.table);
        DomainStats {
            live: table.domains.len(),
            populated: table.domains.values().filter(|d| !d.members.is_empty()).count(),
            created: table.created,
            recycled: table.recycled,
        }
    }
}
