//! A node of a geographically structured peer-to-peer overlay network.
//!
//! Each node advertises a physical location, maintains a globally sampled
//! colleague set and a geographically local neighbour set in a persistent
//! expiring store, and serves three role-scoped interfaces (peers, local
//! services, clients) over a length-prefixed TCP protocol. Collocated
//! services register themselves so clients can find nearby services by
//! consulting any node.

pub mod config;
pub mod error;
pub mod geo;
pub mod identity;
pub mod messages;
pub mod node;
pub mod proxy;
pub mod server;
pub mod session;
pub mod storage;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use geo::{Distance, GpsLocation, NetworkEndpoint};
pub use identity::{
    NeighbourFilter, NodeDbEntry, NodeId, NodeInfo, NodeProfile, RelationType, RoleType,
    ServiceInfo,
};
pub use node::{ClientInterface, LocalServiceInterface, Node, NodeInterface};
pub use proxy::{NodeProxyFactory, RemoteNode, TcpProxyFactory};
pub use server::DispatchServer;
pub use storage::{ChangeListener, SessionId, SpatialStore};
