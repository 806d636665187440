//! Core overlay data model: node identifiers, profiles and store entries.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::geo::{GpsLocation, NetworkEndpoint};

/// Opaque node identifier. Equality and ordering are plain byte
/// comparison; uniqueness within the overlay is assumed, not enforced.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Vec<u8>);

impl NodeId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.0);
        write!(f, "NodeId({})", &hex[..hex.len().min(16)])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Who a node is and how to reach it: identifier plus one contact endpoint
/// for the node-to-node protocol and one for the client protocol.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NodeProfile {
    pub id: NodeId,
    pub node_endpoint: NetworkEndpoint,
    pub client_endpoint: NetworkEndpoint,
}

/// A profile anchored at a physical location.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub profile: NodeProfile,
    pub location: GpsLocation,
}

impl NodeInfo {
    pub fn id(&self) -> &NodeId {
        &self.profile.id
    }
}

/// How a stored node relates to us. `Own` is the owning node's own entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum RelationType {
    Own,
    Colleague,
    Neighbour,
}

/// Which side requested the relation. The initiator drives renewals.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum RoleType {
    Initiator,
    Acceptor,
}

/// One row of the spatial store. Identity is the contained NodeId;
/// `expires_at = None` marks the entry immune to the expiration sweep.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct NodeDbEntry {
    pub info: NodeInfo,
    pub relation: RelationType,
    pub role: RoleType,
    pub expires_at: Option<SystemTime>,
}

impl NodeDbEntry {
    pub fn new(info: NodeInfo, relation: RelationType, role: RoleType) -> Self {
        Self { info, relation, role, expires_at: None }
    }

    pub fn id(&self) -> &NodeId {
        &self.info.profile.id
    }

    pub fn location(&self) -> &GpsLocation {
        &self.info.location
    }
}

/// A collocated application service: keyed by type, advertised at an
/// endpoint so clients can find it through any nearby node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_type: String,
    pub endpoint: NetworkEndpoint,
}

/// Relation filter for store queries.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum NeighbourFilter {
    NeighboursOnly,
    ExcludeNeighbours,
    Any,
}

impl NeighbourFilter {
    pub fn admits(&self, relation: RelationType) -> bool {
        match self {
            NeighbourFilter::NeighboursOnly => relation == RelationType::Neighbour,
            NeighbourFilter::ExcludeNeighbours => relation != RelationType::Neighbour,
            NeighbourFilter::Any => true,
        }
    }
}
