//! Persistent spatial store: NodeId → NodeDbEntry with distance queries,
//! expiration and change broadcast.
//!
//! Backed by sled with an in-memory mirror. Writes go to sled first and to
//! the mirror only on success, so a storage failure leaves both sides
//! consistent (apply-and-persist or neither). The Self entry lives under a
//! sidecar key and is never part of query results.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bincode::Options;
use rand::seq::IteratorRandom;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::geo::{Distance, GpsLocation};
use crate::identity::{NeighbourFilter, NodeDbEntry, NodeId, NodeInfo, RelationType};

/// Identifies the inbound connection a change listener belongs to.
pub type SessionId = String;

const NODES_TREE: &str = "nodes";
const META_TREE: &str = "meta";
const SELF_KEY: &[u8] = b"self";

/// Time source seam. Production uses the system clock; the expiration
/// tests drive a manual one.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Receives store mutations. Implementations must be push-only and must
/// never call back into the store; a returned error deregisters the
/// listener.
pub trait ChangeListener: Send + Sync {
    fn session_id(&self) -> &SessionId;
    fn added(&self, entry: &NodeDbEntry) -> Result<()>;
    fn updated(&self, entry: &NodeDbEntry) -> Result<()>;
    fn removed(&self, entry: &NodeDbEntry) -> Result<()>;
}

#[derive(Default)]
struct ListenerRegistry {
    listeners: Mutex<HashMap<SessionId, Arc<dyn ChangeListener>>>,
}

impl ListenerRegistry {
    fn register(&self, listener: Arc<dyn ChangeListener>) {
        let id = listener.session_id().clone();
        self.listeners.lock().unwrap().insert(id, listener);
    }

    fn unregister(&self, session_id: &SessionId) -> bool {
        self.listeners.lock().unwrap().remove(session_id).is_some()
    }

    /// Snapshot the registry so listeners may deregister themselves while a
    /// broadcast is in flight.
    fn snapshot(&self) -> Vec<Arc<dyn ChangeListener>> {
        self.listeners.lock().unwrap().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

enum Change {
    Added,
    Updated,
    Removed,
}

struct StoreInner {
    nodes: sled::Tree,
    meta: sled::Tree,
    entries: HashMap<NodeId, NodeDbEntry>,
    own: NodeDbEntry,
}

pub struct SpatialStore {
    inner: Mutex<StoreInner>,
    registry: ListenerRegistry,
    clock: Arc<dyn Clock>,
    expiration_period: Duration,
}

impl std::fmt::Debug for SpatialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialStore")
            .field("expiration_period", &self.expiration_period)
            .finish_non_exhaustive()
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

fn encode_entry(entry: &NodeDbEntry) -> Result<Vec<u8>> {
    codec()
        .serialize(entry)
        .map_err(|e| Error::Internal(format!("entry encode: {}", e)))
}

fn decode_entry(bytes: &[u8]) -> Result<NodeDbEntry> {
    codec()
        .deserialize(bytes)
        .map_err(|e| Error::Internal(format!("entry decode: {}", e)))
}

impl SpatialStore {
    /// Open (or create) the store at `path` with `own_info` as the Self
    /// entry. Surviving entries from a previous run are loaded back; a
    /// store created for a different node identity is refused.
    pub fn open(
        path: impl AsRef<Path>,
        own_info: NodeInfo,
        expiration_period: Duration,
    ) -> Result<Self> {
        Self::open_with_clock(path, own_info, expiration_period, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        path: impl AsRef<Path>,
        own_info: NodeInfo,
        expiration_period: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let db = sled::open(path)?;
        let nodes = db.open_tree(NODES_TREE)?;
        let meta = db.open_tree(META_TREE)?;

        if let Some(bytes) = meta.get(SELF_KEY)? {
            let persisted = decode_entry(&bytes)?;
            if persisted.id() != own_info.id() {
                return Err(Error::InvalidState(format!(
                    "store belongs to node {}, not {}",
                    persisted.id(),
                    own_info.id()
                )));
            }
        }

        let own = NodeDbEntry::new(
            own_info,
            RelationType::Own,
            crate::identity::RoleType::Acceptor,
        );
        meta.insert(SELF_KEY, encode_entry(&own)?)?;

        let mut entries = HashMap::new();
        for row in nodes.iter() {
            let (key, value) = row?;
            match decode_entry(&value) {
                Ok(entry) if entry.id() != own.id() => {
                    entries.insert(entry.id().clone(), entry);
                }
                Ok(_) => {
                    // A stale row under Self's id; drop it.
                    let _ = nodes.remove(&key);
                }
                Err(e) => {
                    warn!(error = %e, "dropping undecodable store row");
                    let _ = nodes.remove(&key);
                }
            }
        }
        debug!(loaded = entries.len(), node = %own.id(), "spatial store opened");

        Ok(Self {
            inner: Mutex::new(StoreInner { nodes, meta, entries, own }),
            registry: ListenerRegistry::default(),
            clock,
            expiration_period,
        })
    }

    /// Point lookup. Self's id resolves to the Self entry.
    pub fn load(&self, id: &NodeId) -> Option<NodeDbEntry> {
        let inner = self.inner.lock().unwrap();
        if id == inner.own.id() {
            return Some(inner.own.clone());
        }
        inner.entries.get(id).cloned()
    }

    /// Insert a new entry. Fails with `AlreadyExists` when the id is
    /// present. `expires` stamps the entry with now + expiration period;
    /// otherwise it is immune to the sweep. Broadcasts Added.
    pub fn store(&self, mut entry: NodeDbEntry, expires: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if entry.id() == inner.own.id() {
            return Err(Error::InvalidValue("entry would shadow the Self entry".into()));
        }
        if inner.entries.contains_key(entry.id()) {
            return Err(Error::AlreadyExists(entry.id().to_string()));
        }
        entry.expires_at = self.expiry(expires);
        inner.nodes.insert(entry.id().as_bytes(), encode_entry(&entry)?)?;
        inner.entries.insert(entry.id().clone(), entry.clone());
        // Dispatched inside the write critical section so listeners see a
        // consistent per-key history.
        self.broadcast(Change::Added, &entry);
        Ok(())
    }

    /// Replace an existing entry with the same id, re-stamping expiry with
    /// the same rules as `store`. Broadcasts Updated.
    pub fn update(&self, mut entry: NodeDbEntry, expires: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(entry.id()) {
            return Err(Error::NotFound(entry.id().to_string()));
        }
        entry.expires_at = self.expiry(expires);
        inner.nodes.insert(entry.id().as_bytes(), encode_entry(&entry)?)?;
        inner.entries.insert(entry.id().clone(), entry.clone());
        self.broadcast(Change::Updated, &entry);
        Ok(())
    }

    /// Delete an entry. Broadcasts Removed.
    pub fn remove(&self, id: &NodeId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(id) {
            return Err(Error::NotFound(id.to_string()));
        }
        inner.nodes.remove(id.as_bytes())?;
        let entry = inner.entries.remove(id).expect("checked above");
        self.broadcast(Change::Removed, &entry);
        Ok(())
    }

    /// Remove every non-Self entry whose expiry has passed. Best effort: a
    /// row whose persistent remove fails stays in place and is retried on
    /// the next sweep.
    pub fn expire_old_nodes(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<NodeId> = inner
            .entries
            .values()
            .filter(|e| matches!(e.expires_at, Some(at) if at <= now))
            .map(|e| e.id().clone())
            .collect();

        let mut removed = 0usize;
        for id in expired {
            match inner.nodes.remove(id.as_bytes()) {
                Ok(_) => {
                    if let Some(entry) = inner.entries.remove(&id) {
                        self.broadcast(Change::Removed, &entry);
                        removed += 1;
                    }
                }
                Err(e) => {
                    warn!(node = %id, error = %e, "failed to expire entry, retrying next sweep");
                }
            }
        }
        if removed > 0 {
            debug!(expired = removed, "expiration sweep removed entries");
        }
    }

    /// Up to `max` non-Self entries within `radius_km` of `from`, closest
    /// first; ties break on NodeId byte order.
    pub fn get_closest_by_distance(
        &self,
        from: &GpsLocation,
        radius_km: Distance,
        max: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeDbEntry>> {
        if !radius_km.is_finite() && radius_km != Distance::INFINITY {
            return Err(Error::InvalidValue(format!("bad radius: {}", radius_km)));
        }
        if radius_km < 0.0 {
            return Err(Error::InvalidValue(format!("negative radius: {}", radius_km)));
        }
        let inner = self.inner.lock().unwrap();
        let mut hits: Vec<(Distance, NodeDbEntry)> = inner
            .entries
            .values()
            .filter(|e| filter.admits(e.relation))
            .map(|e| (from.distance_km(e.location()), e.clone()))
            .filter(|(d, _)| *d <= radius_km)
            .collect();
        drop(inner);

        hits.sort_by(|(da, a), (db, b)| {
            da.partial_cmp(db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id().cmp(b.id()))
        });
        hits.truncate(max);
        Ok(hits.into_iter().map(|(_, e)| e).collect())
    }

    /// All Neighbour entries, closest to Self first.
    pub fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeDbEntry> {
        let own_location = *self.this_node().location();
        self.get_closest_by_distance(
            &own_location,
            Distance::INFINITY,
            usize::MAX,
            NeighbourFilter::NeighboursOnly,
        )
        .expect("infinite radius is always valid")
    }

    /// Uniform sample without replacement.
    pub fn get_random_nodes(&self, max: usize, filter: NeighbourFilter) -> Vec<NodeDbEntry> {
        let inner = self.inner.lock().unwrap();
        let mut rng = rand::thread_rng();
        inner
            .entries
            .values()
            .filter(|e| filter.admits(e.relation))
            .cloned()
            .choose_multiple(&mut rng, max)
    }

    /// Snapshot of the entries whose relation we initiated (or accepted).
    /// Renewal maintenance walks the initiated ones.
    pub fn get_nodes_by_role(&self, role: crate::identity::RoleType) -> Vec<NodeDbEntry> {
        let inner = self.inner.lock().unwrap();
        inner.entries.values().filter(|e| e.role == role).cloned().collect()
    }

    /// Number of entries; `None` counts everything except Self.
    pub fn get_node_count(&self, filter: Option<RelationType>) -> usize {
        let inner = self.inner.lock().unwrap();
        match filter {
            None => inner.entries.len(),
            Some(rel) => inner.entries.values().filter(|e| e.relation == rel).count(),
        }
    }

    /// The Self entry.
    pub fn this_node(&self) -> NodeDbEntry {
        self.inner.lock().unwrap().own.clone()
    }

    /// Replace Self's info (external address updates). Persists the sidecar
    /// and broadcasts Updated on the Self entry.
    pub fn set_own_info(&self, info: NodeInfo) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if info.id() != inner.own.id() {
            return Err(Error::InvalidValue("Self identity is immutable".into()));
        }
        let mut own = inner.own.clone();
        own.info = info;
        inner.meta.insert(SELF_KEY, encode_entry(&own)?)?;
        inner.own = own.clone();
        self.broadcast(Change::Updated, &own);
        Ok(())
    }

    pub fn register_listener(&self, listener: Arc<dyn ChangeListener>) {
        debug!(session = %listener.session_id(), "registering change listener");
        self.registry.register(listener);
    }

    pub fn unregister_listener(&self, session_id: &SessionId) -> bool {
        let removed = self.registry.unregister(session_id);
        if removed {
            debug!(session = %session_id, "change listener unregistered");
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.registry.len()
    }

    fn expiry(&self, expires: bool) -> Option<SystemTime> {
        expires.then(|| self.clock.now() + self.expiration_period)
    }

    fn broadcast(&self, change: Change, entry: &NodeDbEntry) {
        for listener in self.registry.snapshot() {
            let result = match change {
                Change::Added => listener.added(entry),
                Change::Updated => listener.updated(entry),
                Change::Removed => listener.removed(entry),
            };
            if let Err(e) = result {
                warn!(
                    session = %listener.session_id(),
                    error = %e,
                    "change listener failed, unregistering"
                );
                self.registry.unregister(listener.session_id());
            }
        }
    }
}
