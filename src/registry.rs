use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::compiler::CompiledArtifact;
use crate::error::{ScriptError, ScriptResult};
use crate::ids::{DomainId, Fingerprint, ItemId, ObjectId};
use crate::instance::ScriptInstance;
use crate::lock;
use crate::permissions::{PermissionTable, TrustLevel};

#[derive(Default)]
struct IdentityTable {
    by_item: HashMap<ItemId, (ObjectId, Arc<ScriptInstance>)>,
    by_object: HashMap<ObjectId, Vec<ItemId>>,
}

impl IdentityTable {
    fn detach(&mut self, object: ObjectId, item: ItemId) -> bool {
        let Some(items) = self.by_object.get_mut(&object) else {
            return false;
        };
        items.retain(|candidate| *candidate != item);
        if items.is_empty() {
            self.by_object.remove(&object);
            true
        } else {
            false
        }
    }
}

struct CacheEntry {
    artifact: Arc<CompiledArtifact>,
    refs: usize,
}

#[derive(Default)]
struct ArtifactCache {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Bumped by every forced reset; artifacts compiled under an older epoch are stale.
    epoch: u64,
}

pub struct Removal {
    pub instance: Arc<ScriptInstance>,
    pub object: ObjectId,
    /// `object` hosts no other scripts.
    pub object_emptied: bool,
}

/// Directory of every live script instance plus the shared compiled-artifact cache.
pub struct ScriptRegistry {
    identities: Mutex<IdentityTable>,
    artifacts: Mutex<ArtifactCache>,
    permissions: Arc<PermissionTable>,
}

impl ScriptRegistry {
    pub fn new(permissions: PermissionTable) -> Self {
        Self {
            identities: Mutex::new(IdentityTable::default()),
            artifacts: Mutex::new(ArtifactCache::default()),
            permissions: Arc::new(permissions),
        }
    }

    pub fn register(&self, object: ObjectId, instance: Arc<ScriptInstance>) -> ScriptResult<()> {
        let item = instance.item();
        let mut table = lock(&self.identities);
        if table.by_item.contains_key(&item) {
            return Err(ScriptError::DuplicateIdentity { object, item });
        }
        table.by_item.insert(item, (object, instance));
        table.by_object.entry(object).or_default().push(item);
        Ok(())
    }

    pub fn lookup(&self, object: ObjectId, item: ItemId) -> ScriptResult<Arc<ScriptInstance>> {
        let table = lock(&self.identities);
        match table.by_item.get(&item) {
            Some((host, instance)) if *host == object => Ok(instance.clone()),
            _ => Err(ScriptError::NotFound(item)),
        }
    }

    pub fn lookup_item(&self, item: ItemId) -> ScriptResult<Arc<ScriptInstance>> {
        lock(&self.identities)
            .by_item
            .get(&item)
            .map(|(_, instance)| instance.clone())
            .ok_or(ScriptError::NotFound(item))
    }

    pub fn list_by_object(&self, object: ObjectId) -> Vec<Arc<ScriptInstance>> {
        let table = lock(&self.identities);
        table
            .by_object
            .get(&object)
            .map(|items| items.iter().filter_map(|item| table.by_item.get(item)).map(|(_, i)| i.clone()).collect())
            .unwrap_or_default()
    }

    /// Point-in-time copy; safe to iterate while instances come and go.
    pub fn list_all(&self) -> Vec<Arc<ScriptInstance>> {
        lock(&self.identities).by_item.values().map(|(_, instance)| instance.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.identities).by_item.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detaches `item` from the identity maps. Domain release and execution teardown are the
    /// lifecycle's job and happen first.
    pub fn remove(&self, item: ItemId) -> Option<Removal> {
        let mut table = lock(&self.identities);
        let (object, instance) = table.by_item.remove(&item)?;
        let object_emptied = table.detach(object, item);
        Some(Removal { instance, object, object_emptied })
    }

    /// Moves `item` under a new hosting object. Returns the previous host.
    pub fn rehost(&self, item: ItemId, object: ObjectId) -> ScriptResult<ObjectId> {
        let mut table = lock(&self.identities);
        let previous = match table.by_item.get_mut(&item) {
            Some(entry) => std::mem::replace(&mut entry.0, object),
            None => return Err(ScriptError::NotFound(item)),
        };
        if previous != object {
            table.detach(previous, item);
            table.by_object.entry(object).or_default().push(item);
        }
        Ok(previous)
    }

    pub fn cache_epoch(&self) -> u64 {
        lock(&self.artifacts).epoch
    }

    /// Takes a reference on a cached artifact, if one exists for `fingerprint`.
    pub fn retain_artifact(&self, fingerprint: Fingerprint) -> Option<Arc<CompiledArtifact>> {
        let mut cache = lock(&self.artifacts);
        let entry = cache.entries.get_mut(&fingerprint)?;
        entry.refs += 1;
        Some(entry.artifact.clone())
    }

    /// Caches a freshly compiled artifact and takes a reference on it. Returns `None` when a
    /// forced reset happened after `compiled_at`; the caller must recompile.
    pub fn intern_artifact(&self, artifact: CompiledArtifact, compiled_at: u64) -> Option<Arc<CompiledArtifact>> {
        let mut cache = lock(&self.artifacts);
        if cache.epoch != compiled_at {
            return None;
        }
        let entry = cache
            .entries
            .entry(artifact.fingerprint)
            .or_insert_with(|| CacheEntry { artifact: Arc::new(artifact), refs: 0 });
        entry.refs += 1;
        Some(entry.artifact.clone())
    }

    /// Drops one reference. Artifacts evicted by a forced reset are ignored.
    pub fn release_artifact(&self, artifact: &Arc<CompiledArtifact>) {
        let mut cache = lock(&self.artifacts);
        if let Some(entry) = cache.entries.get_mut(&artifact.fingerprint) {
            if Arc::ptr_eq(&entry.artifact, artifact) {
                entry.refs = entry.refs.saturating_sub(1);
            }
        }
    }

    /// Evicts unreferenced artifacts, or every artifact when `drop_all` is set. Returns the
    /// number evicted.
    pub fn reset_cache(&self, drop_all: bool) -> usize {
        let mut cache = lock(&self.artifacts);
        let before = cache.entries.len();
        if drop_all {
            cache.entries.clear();
            cache.epoch += 1;
        } else {
            cache.entries.retain(|_, entry| entry.refs > 0);
        }
        let evicted = before - cache.entries.len();
        tracing::debug!(evicted, drop_all, epoch = cache.epoch, "artifact cache reset");
        evicted
    }

    pub fn cached_artifacts(&self) -> usize {
        lock(&self.artifacts).entries.len()
    }

    pub fn artifact_refs(&self, fingerprint: Fingerprint) -> Option<usize> {
        lock(&self.artifacts).entries.get(&fingerprint).map(|entry| entry.refs)
    }

    pub fn permissions(&self) -> Arc<PermissionTable> {
        self.permissions.clone()
    }

    pub fn permission_ceiling_for(&self, domain: Option<DomainId>, function: &str, requested: TrustLevel) -> TrustLevel {
        self.permissions.ceiling_for(domain, function, requested)
    }
}
