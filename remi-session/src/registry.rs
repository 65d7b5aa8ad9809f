use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use remi_wire::{Identifier, VersionedIdentifier};

use crate::control::ReferenceUpdate;
use crate::info::RemoteInfo;
use crate::skeleton::Skeleton;
use crate::stub::{Stub, StubInner};
use crate::RpcError;

/// Per-session object maps.
///
/// Three mappings live here: exported identifiers to their skeletons
/// (strong, the session keeps a skeleton alive for as long as the peer
/// references it), imported identifiers to stubs (weak, a stub does not
/// keep anything alive), and the cache of remote-type metadata received
/// from or sent to the peer. A single lock guards all of it; no I/O ever
/// happens under that lock.
pub(crate) struct Registry {
    state: Mutex<RegistryState>,
}

struct RegistryState {
    exported: HashMap<Identifier, ExportEntry>,
    /// Skeleton address to its minted identifier, so re-exporting the same
    /// object yields the same identity.
    by_skeleton: HashMap<usize, (Weak<Skeleton>, Identifier)>,
    /// Last export generation of identifiers that were reclaimed, so a
    /// re-export bumps past every version the peer may still hold.
    lineage: HashMap<Identifier, u32>,
    imported: HashMap<Identifier, ImportEntry>,
    type_cache: HashMap<Identifier, Arc<RemoteInfo>>,
    /// Types already serialized to the peer in a marshalled reference.
    sent_types: HashSet<Identifier>,
}

struct ExportEntry {
    skeleton: Arc<Skeleton>,
    /// Export generation of this entry.
    version: u32,
    /// Highest generation the peer acknowledged observing.
    remote_version: u32,
}

struct ImportEntry {
    stub: Weak<StubInner>,
    /// The peer's export generation, as last seen on the wire.
    version: u32,
    /// Whether a reference-update round already announced this import.
    announced: bool,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            state: Mutex::new(RegistryState {
                exported: HashMap::new(),
                by_skeleton: HashMap::new(),
                lineage: HashMap::new(),
                imported: HashMap::new(),
                type_cache: HashMap::new(),
                sent_types: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().expect("Cannot lock registry")
    }

    /// Register a local object, minting an identifier on first export and
    /// returning the existing identity afterwards. A re-export after
    /// reclamation keeps the identifier but bumps its generation, so a
    /// stale drop from a slow peer can never collide with it.
    pub(crate) fn export(&self, skeleton: Arc<Skeleton>) -> VersionedIdentifier {
        let key = Arc::as_ptr(&skeleton) as usize;
        let mut state = self.lock();
        if let Some((weak, id)) = state.by_skeleton.get(&key) {
            let id = *id;
            match weak.upgrade() {
                Some(existing) if Arc::ptr_eq(&existing, &skeleton) => {
                    if let Some(entry) = state.exported.get(&id) {
                        return VersionedIdentifier {
                            id,
                            local_version: entry.version,
                            remote_version: entry.remote_version,
                        };
                    }
                    let version = state.lineage.get(&id).map_or(0, |v| v + 1);
                    debug!("re-exporting {} at generation {}", id, version);
                    state.exported.insert(
                        id,
                        ExportEntry {
                            skeleton,
                            version,
                            remote_version: 0,
                        },
                    );
                    return VersionedIdentifier {
                        id,
                        local_version: version,
                        remote_version: 0,
                    };
                }
                // the address was reused by an unrelated skeleton
                _ => {
                    state.by_skeleton.remove(&key);
                }
            }
        }
        let id = Identifier::random();
        debug!("exporting {} as {}", skeleton.info().name, id);
        state
            .by_skeleton
            .insert(key, (Arc::downgrade(&skeleton), id));
        state.exported.insert(
            id,
            ExportEntry {
                skeleton,
                version: 0,
                remote_version: 0,
            },
        );
        VersionedIdentifier::new(id)
    }

    /// Register the session's own control object under its well-known
    /// identifier, outside the garbage-collected lifecycle.
    pub(crate) fn export_reserved(&self, id: Identifier, skeleton: Arc<Skeleton>) {
        let mut state = self.lock();
        let info = skeleton.info().clone();
        state.type_cache.insert(info.id, info);
        state.exported.insert(
            id,
            ExportEntry {
                skeleton,
                version: 0,
                remote_version: 0,
            },
        );
    }

    /// The local object behind an identifier.
    pub(crate) fn lookup_local(&self, id: Identifier) -> Result<Arc<Skeleton>, RpcError> {
        self.lock()
            .exported
            .get(&id)
            .map(|entry| entry.skeleton.clone())
            .ok_or(RpcError::NoSuchObject(id))
    }

    /// The identity and metadata of an exported object, for marshalling a
    /// reference to it.
    pub(crate) fn export_info(
        &self,
        id: Identifier,
    ) -> Option<(VersionedIdentifier, Arc<RemoteInfo>)> {
        let state = self.lock();
        state.exported.get(&id).map(|entry| {
            (
                VersionedIdentifier {
                    id,
                    local_version: entry.version,
                    remote_version: entry.remote_version,
                },
                entry.skeleton.info().clone(),
            )
        })
    }

    pub(crate) fn is_exported(&self, id: Identifier) -> bool {
        self.lock().exported.contains_key(&id)
    }

    /// Current export generation of an identifier, when exported.
    pub(crate) fn export_version(&self, id: Identifier) -> Option<u32> {
        self.lock().exported.get(&id).map(|e| e.version)
    }

    /// The peer acknowledged holding a reference at the given generation.
    pub(crate) fn note_observed(&self, id: Identifier, version: u32) {
        if let Some(entry) = self.lock().exported.get_mut(&id) {
            entry.remote_version = entry.remote_version.max(version);
        }
    }

    /// The peer dropped its reference observed at `version`. Reclaims the
    /// export only when the acknowledged generation has caught up with the
    /// current one; a drop carrying an older generation raced with a
    /// re-export and is ignored.
    pub(crate) fn drop_export(&self, id: Identifier, version: u32) -> bool {
        let mut state = self.lock();
        match state.exported.get(&id) {
            Some(entry) if version >= entry.version => {
                let current = entry.version;
                state.lineage.insert(id, current);
                state.exported.remove(&id);
                debug!("reclaimed export {} at generation {}", id, current);
                true
            }
            Some(entry) => {
                trace!(
                    "ignoring stale drop of {}: peer saw generation {}, current is {}",
                    id,
                    version,
                    entry.version
                );
                false
            }
            None => false,
        }
    }

    /// Get or build the shared stub for a peer object. Stubs are shared
    /// per identifier, so identity comparisons between them make sense.
    pub(crate) fn import(
        &self,
        session: Weak<crate::session::SessionInner>,
        id: Identifier,
        version: u32,
        info: Arc<RemoteInfo>,
    ) -> Stub {
        let mut state = self.lock();
        if let Some(entry) = state.imported.get_mut(&id) {
            if let Some(inner) = entry.stub.upgrade() {
                entry.version = entry.version.max(version);
                return Stub::from_inner(inner);
            }
        }
        trace!("importing {} of type {}", id, info.name);
        let inner = Arc::new(StubInner { id, info, session });
        state.imported.insert(
            id,
            ImportEntry {
                stub: Arc::downgrade(&inner),
                version,
                announced: false,
            },
        );
        Stub::from_inner(inner)
    }

    /// The last seen generation and metadata of an imported object, for
    /// marshalling a reference back to its owner.
    pub(crate) fn import_info(&self, id: Identifier) -> Option<(u32, Arc<RemoteInfo>)> {
        let state = self.lock();
        let entry = state.imported.get(&id)?;
        let inner = entry.stub.upgrade()?;
        Some((entry.version, inner.info.clone()))
    }

    /// Cached metadata of a remote type.
    pub(crate) fn cached_info(&self, type_id: Identifier) -> Option<Arc<RemoteInfo>> {
        self.lock().type_cache.get(&type_id).cloned()
    }

    /// Cache type metadata. The first writer wins; a concurrent duplicate
    /// is discarded in favor of the cached copy.
    pub(crate) fn cache_info(&self, info: RemoteInfo) -> Arc<RemoteInfo> {
        let mut state = self.lock();
        if let Some(existing) = state.type_cache.get(&info.id) {
            return existing.clone();
        }
        let info = Arc::new(info);
        state.type_cache.insert(info.id, info.clone());
        info
    }

    /// Whether the metadata of a type still has to travel to the peer.
    /// Flips on first call, so exactly one marshalled reference carries it.
    pub(crate) fn mark_type_sent(&self, type_id: Identifier) -> bool {
        self.lock().sent_types.insert(type_id)
    }

    /// One garbage-collection round over the imported map: announce new
    /// imports, drop the entries whose stubs died and report them at the
    /// generation they were last seen.
    pub(crate) fn reference_round(&self) -> ReferenceUpdate {
        let mut state = self.lock();
        let mut update = ReferenceUpdate::default();
        state.imported.retain(|id, entry| {
            if entry.stub.upgrade().is_some() {
                if !entry.announced {
                    entry.announced = true;
                    update.added.push((*id, entry.version));
                }
                true
            } else {
                update.removed.push((*id, entry.version));
                false
            }
        });
        update
    }

    /// Put an unsent reference diff back, so the next round reports it
    /// again.
    pub(crate) fn requeue(&self, update: ReferenceUpdate) {
        let mut state = self.lock();
        for (id, _) in update.added {
            if let Some(entry) = state.imported.get_mut(&id) {
                entry.announced = false;
            }
        }
        for (id, version) in update.removed {
            state.imported.entry(id).or_insert(ImportEntry {
                stub: Weak::new(),
                version,
                announced: true,
            });
        }
    }

    /// Exported and imported object counts.
    pub(crate) fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.exported.len(), state.imported.len())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::info::RemoteInfo;

    use super::*;

    fn skeleton(name: &str) -> Arc<Skeleton> {
        Arc::new(Skeleton::new(RemoteInfo::new(name)))
    }

    #[test]
    fn test_export_is_idempotent() {
        let registry = Registry::new();
        let skel = skeleton("Thing");
        let first = registry.export(skel.clone());
        let second = registry.export(skel);
        assert_eq!(first.id, second.id);
        assert_eq!(second.local_version, 0);
    }

    #[test]
    fn test_reexport_bumps_the_generation() {
        let registry = Registry::new();
        let skel = skeleton("Thing");
        let first = registry.export(skel.clone());
        assert!(registry.drop_export(first.id, first.local_version));
        assert!(!registry.is_exported(first.id));
        let again = registry.export(skel);
        assert_eq!(again.id, first.id);
        assert_eq!(again.local_version, 1);
    }

    #[test]
    fn test_stale_drop_is_ignored() {
        let registry = Registry::new();
        let skel = skeleton("Thing");
        let first = registry.export(skel.clone());
        assert!(registry.drop_export(first.id, 0));
        let again = registry.export(skel);
        assert_eq!(again.local_version, 1);
        // a drop carrying the old generation must not reclaim the new one
        assert!(!registry.drop_export(first.id, 0));
        assert!(registry.is_exported(first.id));
        assert!(registry.drop_export(first.id, 1));
    }

    #[test]
    fn test_imported_stubs_are_shared() {
        let registry = Registry::new();
        let info = Arc::new(RemoteInfo::new("Thing"));
        let id = Identifier::random();
        let a = registry.import(Weak::new(), id, 0, info.clone());
        let b = registry.import(Weak::new(), id, 3, info);
        assert_eq!(a, b);
        assert_eq!(registry.import_info(id).unwrap().0, 3);
    }

    #[test]
    fn test_reference_round_announces_then_reports_drops() {
        let registry = Registry::new();
        let info = Arc::new(RemoteInfo::new("Thing"));
        let id = Identifier::random();
        let stub = registry.import(Weak::new(), id, 2, info);

        let round = registry.reference_round();
        assert_eq!(round.added, vec![(id, 2)]);
        assert!(round.removed.is_empty());

        // announced only once
        assert!(registry.reference_round().added.is_empty());

        drop(stub);
        let round = registry.reference_round();
        assert_eq!(round.removed, vec![(id, 2)]);
        assert_eq!(registry.counts().1, 0);
    }

    #[test]
    fn test_type_cache_first_writer_wins() {
        let registry = Registry::new();
        let mut info = RemoteInfo::new("Thing");
        let id = info.id;
        let cached = registry.cache_info(info.clone());
        info.name = "Renamed".to_string();
        let again = registry.cache_info(info);
        assert_eq!(again.name, cached.name);
        assert_eq!(registry.cached_info(id).unwrap().name, "Thing");
        assert!(registry.mark_type_sent(id));
        assert!(!registry.mark_type_sent(id));
    }
}
