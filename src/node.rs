//! The node core: overlay maintenance and the three role-scoped
//! interfaces.
//!
//! One `Node` value serves remote peers, collocated services and
//! application clients through [`NodeInterface`], [`LocalServiceInterface`]
//! and [`ClientInterface`] — three capability views over the same state.
//! All outbound proxy calls happen on owned snapshots, never while a store
//! lock is held.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::geo::{Distance, GpsLocation};
use crate::identity::{
    NeighbourFilter, NodeDbEntry, NodeInfo, RelationType, RoleType, ServiceInfo,
};
use crate::proxy::{NodeProxyFactory, RemoteNode};
use crate::storage::{ChangeListener, SessionId, SpatialStore};

/// Colleague count the join walk tries to reach before it settles.
const WORLD_FILL_TARGET: usize = 10;
/// Random-node sample requested from each hop while joining.
const WORLD_SAMPLE_SIZE: usize = 10;
/// Result budget of one discovery probe.
const DISCOVERY_NODE_TARGET: usize = 5;
/// Idle-hop budget of one discovery probe.
const DISCOVERY_HOP_LIMIT: usize = 3;

/// Interface served to remote overlay nodes.
pub trait NodeInterface: Send + Sync {
    fn get_node_info(&self) -> NodeInfo;
    fn get_node_count(&self) -> usize;
    fn get_random_nodes(&self, max: usize, filter: NeighbourFilter) -> Vec<NodeInfo>;
    fn get_closest_nodes_by_distance(
        &self,
        location: &GpsLocation,
        radius_km: Distance,
        max: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>>;
    fn accept_colleague(&self, candidate: NodeInfo) -> Result<NodeInfo>;
    fn renew_colleague(&self, candidate: NodeInfo) -> Result<NodeInfo>;
    fn accept_neighbour(&self, candidate: NodeInfo) -> Result<NodeInfo>;
    fn renew_neighbour(&self, candidate: NodeInfo) -> Result<NodeInfo>;
}

/// Interface served to services running on the same machine.
pub trait LocalServiceInterface: Send + Sync {
    fn register_service(&self, service: ServiceInfo) -> GpsLocation;
    fn deregister_service(&self, service_type: &str) -> Result<()>;
    fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeInfo>;
    fn get_node_info(&self) -> NodeInfo;
    fn add_listener(&self, listener: Arc<dyn ChangeListener>);
    fn remove_listener(&self, session_id: &SessionId) -> bool;
}

/// Interface served to application clients.
#[async_trait]
pub trait ClientInterface: Send + Sync {
    fn get_node_info(&self) -> NodeInfo;
    fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeInfo>;
    fn get_closest_nodes_by_distance(
        &self,
        location: &GpsLocation,
        radius_km: Distance,
        max: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>>;
    fn get_random_nodes(&self, max: usize, filter: NeighbourFilter) -> Vec<NodeInfo>;
    async fn explore_network_nodes_by_distance(
        &self,
        location: &GpsLocation,
        target_node_count: usize,
        max_node_hops: usize,
    ) -> Result<Vec<NodeInfo>>;
}

pub struct Node {
    config: NodeConfig,
    store: Arc<SpatialStore>,
    proxy_factory: Arc<dyn NodeProxyFactory>,
    services: Mutex<HashMap<String, ServiceInfo>>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        store: Arc<SpatialStore>,
        proxy_factory: Arc<dyn NodeProxyFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            proxy_factory,
            services: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<SpatialStore> {
        &self.store
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn own_info(&self) -> NodeInfo {
        self.store.this_node().info
    }

    // ── Candidate screening ──────────────────────────────────────────────

    fn validate_candidate(&self, candidate: &NodeInfo) -> Result<()> {
        if candidate.id().is_empty() {
            return Err(Error::InvalidValue("empty node id".into()));
        }
        if candidate.id() == self.own_info().id() {
            return Err(Error::InvalidValue("candidate carries our own id".into()));
        }
        if candidate.profile.node_endpoint.is_loopback() && !self.config.allow_local_peers {
            return Err(Error::InvalidValue(format!(
                "loopback endpoint {} refused",
                candidate.profile.node_endpoint
            )));
        }
        Ok(())
    }

    /// Personal-space radius at the current network size: K · log10(1 + N).
    fn bubble_size_km(&self) -> Distance {
        let count = self.store.get_node_count(None) as f64;
        (self.config.bubble_scale_km as f64 * (1.0 + count).log10()) as Distance
    }

    /// Whether the candidate's bubble intersects anybody already known
    /// (Self included; an entry with the candidate's own id is exempt).
    fn bubble_overlaps(&self, candidate: &NodeInfo) -> bool {
        let bubble = self.bubble_size_km();
        let overlap_km = bubble + bubble;

        let own = self.store.this_node();
        if own.location().distance_km(&candidate.location) < overlap_km {
            return true;
        }
        let others = self
            .store
            .get_closest_by_distance(
                &candidate.location,
                overlap_km,
                usize::MAX,
                NeighbourFilter::Any,
            )
            .unwrap_or_default();
        others.iter().any(|e| e.id() != candidate.id())
    }

    /// Make room for a closer neighbour, or refuse when the neighbourhood
    /// is full of closer ones.
    fn enforce_neighbour_capacity(&self, candidate: &NodeInfo) -> Result<()> {
        let target = self.config.neighbourhood_target_size;
        if self.store.get_node_count(Some(RelationType::Neighbour)) < target {
            return Ok(());
        }
        let own_location = *self.store.this_node().location();
        let neighbours = self.store.get_neighbour_nodes_by_distance();
        let farthest = match neighbours.last() {
            Some(entry) => entry.clone(),
            None => return Ok(()),
        };
        let farthest_km = own_location.distance_km(farthest.location());
        let candidate_km = own_location.distance_km(&candidate.location);
        if candidate_km < farthest_km {
            debug!(
                evicted = %farthest.id(),
                evicted_km = farthest_km as f64,
                candidate_km = candidate_km as f64,
                "evicting farthest neighbour for a closer candidate"
            );
            self.store.remove(farthest.id())?;
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "neighbourhood is full with {} closer nodes",
                target
            )))
        }
    }

    // ── Peer-facing operations ───────────────────────────────────────────

    pub fn accept_colleague(&self, candidate: NodeInfo) -> Result<NodeInfo> {
        self.validate_candidate(&candidate)?;
        match self.store.load(candidate.id()) {
            Some(entry) if entry.relation == RelationType::Neighbour => {
                // Neighbour status is stronger, do not downgrade.
                Err(Error::AlreadyExists(format!(
                    "{} is already a neighbour",
                    candidate.id()
                )))
            }
            Some(mut entry) => {
                entry.info = candidate;
                self.store.update(entry, true)?;
                Ok(self.own_info())
            }
            None => {
                let entry = NodeDbEntry::new(
                    candidate.clone(),
                    RelationType::Colleague,
                    RoleType::Acceptor,
                );
                self.store.store(entry, true)?;
                debug!(node = %candidate.id(), "accepted colleague");
                Ok(self.own_info())
            }
        }
    }

    pub fn accept_neighbour(&self, candidate: NodeInfo) -> Result<NodeInfo> {
        self.validate_candidate(&candidate)?;
        match self.store.load(candidate.id()) {
            Some(mut entry) if entry.relation == RelationType::Neighbour => {
                entry.info = candidate;
                self.store.update(entry, true)?;
                Ok(self.own_info())
            }
            existing => {
                if self.bubble_overlaps(&candidate) {
                    return Err(Error::InvalidState(format!(
                        "personal-space bubble of {} overlaps the neighbourhood",
                        candidate.id()
                    )));
                }
                self.enforce_neighbour_capacity(&candidate)?;
                match existing {
                    Some(mut entry) => {
                        entry.info = candidate.clone();
                        entry.relation = RelationType::Neighbour;
                        self.store.update(entry, true)?;
                    }
                    None => {
                        let entry = NodeDbEntry::new(
                            candidate.clone(),
                            RelationType::Neighbour,
                            RoleType::Acceptor,
                        );
                        self.store.store(entry, true)?;
                    }
                }
                debug!(node = %candidate.id(), "accepted neighbour");
                Ok(self.own_info())
            }
        }
    }

    /// Renewals refresh the expiry and nothing else.
    fn renew_relation(&self, candidate: NodeInfo) -> Result<NodeInfo> {
        self.validate_candidate(&candidate)?;
        match self.store.load(candidate.id()) {
            Some(entry) => {
                self.store.update(entry, true)?;
                Ok(self.own_info())
            }
            None => Err(Error::NotFound(format!(
                "no relation with {} to renew",
                candidate.id()
            ))),
        }
    }

    pub fn renew_colleague(&self, candidate: NodeInfo) -> Result<NodeInfo> {
        self.renew_relation(candidate)
    }

    pub fn renew_neighbour(&self, candidate: NodeInfo) -> Result<NodeInfo> {
        self.renew_relation(candidate)
    }

    pub fn get_node_info(&self) -> NodeInfo {
        self.own_info()
    }

    pub fn get_node_count(&self) -> usize {
        self.store.get_node_count(None)
    }

    pub fn get_random_nodes(&self, max: usize, filter: NeighbourFilter) -> Vec<NodeInfo> {
        self.store
            .get_random_nodes(max, filter)
            .into_iter()
            .map(|e| e.info)
            .collect()
    }

    pub fn get_closest_nodes_by_distance(
        &self,
        location: &GpsLocation,
        radius_km: Distance,
        max: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>> {
        Ok(self
            .store
            .get_closest_by_distance(location, radius_km, max, filter)?
            .into_iter()
            .map(|e| e.info)
            .collect())
    }

    pub fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeInfo> {
        self.store
            .get_neighbour_nodes_by_distance()
            .into_iter()
            .map(|e| e.info)
            .collect()
    }

    // ── Local service registry ───────────────────────────────────────────

    pub fn register_service(&self, service: ServiceInfo) -> GpsLocation {
        info!(service = %service.service_type, endpoint = %service.endpoint, "service registered");
        self.services
            .lock()
            .unwrap()
            .insert(service.service_type.clone(), service);
        self.own_info().location
    }

    pub fn deregister_service(&self, service_type: &str) -> Result<()> {
        match self.services.lock().unwrap().remove(service_type) {
            Some(_) => {
                info!(service = %service_type, "service deregistered");
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "no registered service of type {}",
                service_type
            ))),
        }
    }

    pub fn registered_services(&self) -> Vec<ServiceInfo> {
        self.services.lock().unwrap().values().cloned().collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.store.register_listener(listener);
    }

    pub fn remove_listener(&self, session_id: &SessionId) -> bool {
        self.store.unregister_listener(session_id)
    }

    // ── External address ─────────────────────────────────────────────────

    /// Record a self-observed external address. Loopback or unchanged
    /// reports are ignored; a change re-publishes Self with an Updated
    /// event.
    pub fn detected_external_address(&self, addr: IpAddr) -> Result<()> {
        if addr.is_loopback() {
            return Ok(());
        }
        let mut own = self.own_info();
        if own.profile.node_endpoint.addr == addr {
            return Ok(());
        }
        info!(old = %own.profile.node_endpoint.addr, new = %addr, "external address detected");
        own.profile.node_endpoint.addr = addr;
        self.store.set_own_info(own)
    }

    // ── Network exploration ──────────────────────────────────────────────

    /// Iterative widening walk toward `location`: keep asking the known
    /// node closest to the target for its closest set until enough
    /// distinct nodes are known or `max_node_hops` hops pass without
    /// learning anything new.
    pub async fn explore_network_nodes_by_distance(
        &self,
        location: &GpsLocation,
        target_node_count: usize,
        max_node_hops: usize,
    ) -> Result<Vec<NodeInfo>> {
        let own_id = self.own_info().id().clone();
        let mut known: HashMap<crate::identity::NodeId, NodeInfo> = HashMap::new();
        let mut queried: HashSet<crate::identity::NodeId> = HashSet::new();

        for entry in self.store.get_closest_by_distance(
            location,
            Distance::INFINITY,
            target_node_count.max(1),
            NeighbourFilter::Any,
        )? {
            known.insert(entry.id().clone(), entry.info);
        }

        let mut idle_hops = 0;
        while known.len() < target_node_count && idle_hops < max_node_hops {
            let next = known
                .values()
                .filter(|n| !queried.contains(n.id()))
                .min_by(|a, b| {
                    let da = location.distance_km(&a.location);
                    let db = location.distance_km(&b.location);
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
                .cloned();
            let next = match next {
                Some(node) => node,
                None => break,
            };
            queried.insert(next.id().clone());

            let fetched = match self.proxy_factory.connect_to(&next.profile.node_endpoint).await
            {
                Ok(proxy) => {
                    proxy
                        .get_closest_nodes_by_distance(
                            *location,
                            Distance::INFINITY,
                            target_node_count,
                            NeighbourFilter::Any,
                        )
                        .await
                }
                Err(e) => Err(e),
            };

            match fetched {
                Ok(nodes) => {
                    let before = known.len();
                    for node in nodes {
                        if node.id() != &own_id {
                            known.entry(node.id().clone()).or_insert(node);
                        }
                    }
                    if known.len() > before {
                        idle_hops = 0;
                    } else {
                        idle_hops += 1;
                    }
                }
                Err(e) => {
                    debug!(node = %next.id(), error = %e, "exploration hop failed");
                    idle_hops += 1;
                }
            }
        }

        let mut result: Vec<NodeInfo> = known.into_values().collect();
        result.sort_by(|a, b| {
            let da = location.distance_km(&a.location);
            let db = location.distance_km(&b.location);
            da.partial_cmp(&db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id().cmp(b.id()))
        });
        result.truncate(target_node_count);
        Ok(result)
    }

    // ── Join ─────────────────────────────────────────────────────────────

    /// Populate an empty map from the configured seeds. A node that
    /// already knows anybody keeps its map; a node with no seeds starts
    /// alone without failing. Join fails only when every seed failed and
    /// the map is still empty.
    pub async fn ensure_map_filled(&self) -> Result<()> {
        if self.store.get_node_count(None) > 0 {
            return Ok(());
        }
        if self.config.seed_nodes.is_empty() {
            info!("no seed nodes configured, starting alone");
            return Ok(());
        }

        let mut seeds = self.config.seed_nodes.clone();
        seeds.shuffle(&mut rand::thread_rng());

        for seed in &seeds {
            match self.initialize_world(seed).await {
                Ok(()) => break,
                Err(e) => {
                    debug!(seed = %seed, error = %e, "seed failed, trying the next one");
                }
            }
        }

        if self.store.get_node_count(None) == 0 {
            return Err(Error::Connection(std::io::Error::new(
                std::io::ErrorKind::Other,
                "every seed node failed",
            )));
        }

        self.initialize_neighbourhood().await;
        Ok(())
    }

    /// Collect a broad colleague set by hopping to new nodes until the map
    /// holds enough of the world or the frontier dries up.
    async fn initialize_world(&self, seed: &crate::geo::NetworkEndpoint) -> Result<()> {
        let own_info = self.own_info();
        let proxy = self.proxy_factory.connect_to(seed).await?;

        let seed_info = proxy.accept_colleague(own_info.clone()).await?;
        self.store_initiated(&seed_info, RelationType::Colleague)?;

        let world_size = proxy.get_node_count().await.unwrap_or(0) as usize;
        let goal = WORLD_FILL_TARGET.min(world_size.max(1));

        let mut frontier: Vec<NodeInfo> = proxy
            .get_random_nodes(WORLD_SAMPLE_SIZE, NeighbourFilter::Any)
            .await
            .unwrap_or_default();
        let mut visited: HashSet<crate::identity::NodeId> = HashSet::new();
        visited.insert(seed_info.id().clone());

        while self.store.get_node_count(None) < goal {
            let candidate = match frontier.pop() {
                Some(node) => node,
                None => break,
            };
            if !visited.insert(candidate.id().clone()) {
                continue;
            }
            if candidate.id() == own_info.id() || self.store.load(candidate.id()).is_some() {
                continue;
            }

            match self.proxy_factory.connect_to(&candidate.profile.node_endpoint).await {
                Ok(hop) => match hop.accept_colleague(own_info.clone()).await {
                    Ok(remote_info) => {
                        if let Err(e) = self.store_initiated(&remote_info, RelationType::Colleague)
                        {
                            debug!(node = %remote_info.id(), error = %e, "could not keep colleague");
                            continue;
                        }
                        if let Ok(more) =
                            hop.get_random_nodes(WORLD_SAMPLE_SIZE, NeighbourFilter::Any).await
                        {
                            frontier.extend(more);
                        }
                    }
                    Err(e) => {
                        debug!(node = %candidate.id(), error = %e, "colleague initiation refused");
                    }
                },
                Err(e) => {
                    debug!(node = %candidate.id(), error = %e, "could not reach frontier node");
                }
            }
        }

        info!(
            known = self.store.get_node_count(None),
            "world initialization finished"
        );
        Ok(())
    }

    /// From what the world walk collected, court the geographically
    /// closest nodes in ascending distance until the neighbourhood target
    /// is met or candidates run out.
    async fn initialize_neighbourhood(&self) {
        let own_location = *self.store.this_node().location();
        let candidates = self
            .store
            .get_closest_by_distance(
                &own_location,
                Distance::INFINITY,
                usize::MAX,
                NeighbourFilter::ExcludeNeighbours,
            )
            .unwrap_or_default();

        for candidate in candidates {
            if self.store.get_node_count(Some(RelationType::Neighbour))
                >= self.config.neighbourhood_target_size
            {
                break;
            }
            self.initiate_neighbour(candidate.info).await;
        }
    }

    /// Ask a remote node to take us as a neighbour; on success record the
    /// relation with us as initiator.
    async fn initiate_neighbour(&self, target: NodeInfo) -> bool {
        let own_info = self.own_info();
        let accepted = match self.proxy_factory.connect_to(&target.profile.node_endpoint).await {
            Ok(proxy) => proxy.accept_neighbour(own_info).await,
            Err(e) => Err(e),
        };
        match accepted {
            Ok(remote_info) => {
                match self.store_initiated(&remote_info, RelationType::Neighbour) {
                    Ok(()) => {
                        debug!(node = %remote_info.id(), "neighbour relation established");
                        true
                    }
                    Err(e) => {
                        debug!(node = %remote_info.id(), error = %e, "could not keep neighbour");
                        false
                    }
                }
            }
            Err(e) => {
                debug!(node = %target.id(), error = %e, "neighbour initiation failed");
                false
            }
        }
    }

    /// Record a relation we initiated, upgrading an existing entry in
    /// place. Never downgrades Neighbour to Colleague.
    fn store_initiated(&self, info: &NodeInfo, relation: RelationType) -> Result<()> {
        self.validate_candidate(info)?;
        match self.store.load(info.id()) {
            Some(mut entry) => {
                entry.info = info.clone();
                if relation == RelationType::Neighbour {
                    entry.relation = RelationType::Neighbour;
                }
                entry.role = RoleType::Initiator;
                self.store.update(entry, true)
            }
            None => self.store.store(
                NodeDbEntry::new(info.clone(), relation, RoleType::Initiator),
                true,
            ),
        }
    }

    // ── Periodic maintenance ─────────────────────────────────────────────

    pub fn expire_old_nodes(&self) {
        self.store.expire_old_nodes();
    }

    /// Renew every relation we initiated. A refusal drops the relation;
    /// transport trouble leaves it to expire naturally.
    pub async fn renew_node_relations(&self) {
        let initiated = self.store.get_nodes_by_role(RoleType::Initiator);
        for entry in initiated {
            self.renew_remote(&entry).await;
        }
    }

    /// The tighter neighbour-only sweep.
    pub async fn renew_neighbours(&self) {
        let initiated = self.store.get_nodes_by_role(RoleType::Initiator);
        for entry in initiated {
            if entry.relation == RelationType::Neighbour {
                self.renew_remote(&entry).await;
            }
        }
    }

    async fn renew_remote(&self, entry: &NodeDbEntry) {
        let own_info = self.own_info();
        let renewed = match self
            .proxy_factory
            .connect_to(&entry.info.profile.node_endpoint)
            .await
        {
            Ok(proxy) => match entry.relation {
                RelationType::Neighbour => proxy.renew_neighbour(own_info).await,
                _ => proxy.renew_colleague(own_info).await,
            },
            Err(e) => Err(e),
        };

        match renewed {
            Ok(_) => {
                if let Err(e) = self.store.update(entry.clone(), true) {
                    debug!(node = %entry.id(), error = %e, "renewed entry vanished locally");
                }
            }
            Err(e) if e.is_refusal() => {
                warn!(node = %entry.id(), error = %e, "relation refused on renewal, dropping");
                let _ = self.store.remove(entry.id());
            }
            Err(e) => {
                debug!(node = %entry.id(), error = %e, "renewal attempt failed, keeping entry");
            }
        }
    }

    /// Probe a random spot on the sphere and befriend whoever lives there.
    pub async fn discover_unknown_areas(&self) {
        let target = random_sphere_point();
        let found = match self
            .explore_network_nodes_by_distance(&target, DISCOVERY_NODE_TARGET, DISCOVERY_HOP_LIMIT)
            .await
        {
            Ok(nodes) => nodes,
            Err(e) => {
                debug!(target = %target, error = %e, "discovery probe failed");
                return;
            }
        };

        let own_info = self.own_info();
        for node in found {
            if self.store.load(node.id()).is_some() || self.validate_candidate(&node).is_err() {
                continue;
            }
            let proxy = match self.proxy_factory.connect_to(&node.profile.node_endpoint).await {
                Ok(proxy) => proxy,
                Err(e) => {
                    debug!(node = %node.id(), error = %e, "discovered node unreachable");
                    continue;
                }
            };
            match proxy.accept_colleague(own_info.clone()).await {
                Ok(remote_info) => {
                    if self.store_initiated(&remote_info, RelationType::Colleague).is_err() {
                        continue;
                    }
                    if self.worth_courting(&remote_info) {
                        match proxy.accept_neighbour(own_info.clone()).await {
                            Ok(confirmed) => {
                                let _ = self
                                    .store_initiated(&confirmed, RelationType::Neighbour);
                            }
                            Err(e) => {
                                debug!(node = %remote_info.id(), error = %e, "neighbour courtship refused");
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(node = %node.id(), error = %e, "discovered node refused colleague");
                }
            }
        }
    }

    /// Would this node fit our neighbourhood right now?
    fn worth_courting(&self, info: &NodeInfo) -> bool {
        if self.bubble_overlaps(info) {
            return false;
        }
        let target = self.config.neighbourhood_target_size;
        if self.store.get_node_count(Some(RelationType::Neighbour)) < target {
            return true;
        }
        let own_location = *self.store.this_node().location();
        match self.store.get_neighbour_nodes_by_distance().last() {
            Some(farthest) => {
                own_location.distance_km(&info.location)
                    < own_location.distance_km(farthest.location())
            }
            None => true,
        }
    }

    /// Drive the periodic tasks at their configured cadences until the
    /// returned handle is aborted.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut db_tick = tokio::time::interval(node.config.db_maintenance_period);
            let mut neighbour_tick =
                tokio::time::interval(node.config.neighbourhood_maintenance_period);
            let mut discovery_tick = tokio::time::interval(node.config.discovery_period);
            // Skip the immediate first tick of each interval.
            db_tick.tick().await;
            neighbour_tick.tick().await;
            discovery_tick.tick().await;

            loop {
                tokio::select! {
                    _ = db_tick.tick() => {
                        node.expire_old_nodes();
                        node.renew_node_relations().await;
                    }
                    _ = neighbour_tick.tick() => {
                        node.renew_neighbours().await;
                    }
                    _ = discovery_tick.tick() => {
                        node.discover_unknown_areas().await;
                    }
                }
            }
        })
    }
}

/// Uniform random point on the sphere (area-uniform, not lat/lon-uniform).
fn random_sphere_point() -> GpsLocation {
    let mut rng = rand::thread_rng();
    let z: f64 = rng.gen_range(-1.0..=1.0);
    let latitude = z.asin().to_degrees().clamp(-90.0, 90.0);
    let longitude = rng.gen_range(-180.0..=180.0);
    GpsLocation::new(latitude, longitude).expect("sampled coordinates are in range")
}

// ── Role-scoped views ────────────────────────────────────────────────────

impl NodeInterface for Node {
    fn get_node_info(&self) -> NodeInfo {
        Node::get_node_info(self)
    }

    fn get_node_count(&self) -> usize {
        Node::get_node_count(self)
    }

    fn get_random_nodes(&self, max: usize, filter: NeighbourFilter) -> Vec<NodeInfo> {
        Node::get_random_nodes(self, max, filter)
    }

    fn get_closest_nodes_by_distance(
        &self,
        location: &GpsLocation,
        radius_km: Distance,
        max: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>> {
        Node::get_closest_nodes_by_distance(self, location, radius_km, max, filter)
    }

    fn accept_colleague(&self, candidate: NodeInfo) -> Result<NodeInfo> {
        Node::accept_colleague(self, candidate)
    }

    fn renew_colleague(&self, candidate: NodeInfo) -> Result<NodeInfo> {
        Node::renew_colleague(self, candidate)
    }

    fn accept_neighbour(&self, candidate: NodeInfo) -> Result<NodeInfo> {
        Node::accept_neighbour(self, candidate)
    }

    fn renew_neighbour(&self, candidate: NodeInfo) -> Result<NodeInfo> {
        Node::renew_neighbour(self, candidate)
    }
}

impl LocalServiceInterface for Node {
    fn register_service(&self, service: ServiceInfo) -> GpsLocation {
        Node::register_service(self, service)
    }

    fn deregister_service(&self, service_type: &str) -> Result<()> {
        Node::deregister_service(self, service_type)
    }

    fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeInfo> {
        Node::get_neighbour_nodes_by_distance(self)
    }

    fn get_node_info(&self) -> NodeInfo {
        Node::get_node_info(self)
    }

    fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        Node::add_listener(self, listener)
    }

    fn remove_listener(&self, session_id: &SessionId) -> bool {
        Node::remove_listener(self, session_id)
    }
}

#[async_trait]
impl ClientInterface for Node {
    fn get_node_info(&self) -> NodeInfo {
        Node::get_node_info(self)
    }

    fn get_neighbour_nodes_by_distance(&self) -> Vec<NodeInfo> {
        Node::get_neighbour_nodes_by_distance(self)
    }

    fn get_closest_nodes_by_distance(
        &self,
        location: &GpsLocation,
        radius_km: Distance,
        max: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>> {
        Node::get_closest_nodes_by_distance(self, location, radius_km, max, filter)
    }

    fn get_random_nodes(&self, max: usize, filter: NeighbourFilter) -> Vec<NodeInfo> {
        Node::get_random_nodes(self, max, filter)
    }

    async fn explore_network_nodes_by_distance(
        &self,
        location: &GpsLocation,
        target_node_count: usize,
        max_node_hops: usize,
    ) -> Result<Vec<NodeInfo>> {
        Node::explore_network_nodes_by_distance(self, location, target_node_count, max_node_hops)
            .await
    }
}
