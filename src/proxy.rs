//! Remote node handles. A proxy serializes each peer-facing call into a
//! request, pushes it through its own session and translates the response
//! status back into the error taxonomy. One session per handle, no pooling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::geo::{Distance, GpsLocation, NetworkEndpoint};
use crate::identity::{NeighbourFilter, NodeInfo};
use crate::messages::{Body, Envelope, NodeRequest, Request, ResponsePayload, Status};
use crate::session::Session;

/// The peer-facing interface of a (potentially remote) node.
#[async_trait]
pub trait RemoteNode: Send + Sync {
    async fn get_node_info(&self) -> Result<NodeInfo>;
    async fn get_node_count(&self) -> Result<u64>;
    async fn get_random_nodes(&self, max: usize, filter: NeighbourFilter)
        -> Result<Vec<NodeInfo>>;
    async fn get_closest_nodes_by_distance(
        &self,
        location: GpsLocation,
        radius_km: Distance,
        max: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>>;
    async fn accept_colleague(&self, node: NodeInfo) -> Result<NodeInfo>;
    async fn renew_colleague(&self, node: NodeInfo) -> Result<NodeInfo>;
    async fn accept_neighbour(&self, node: NodeInfo) -> Result<NodeInfo>;
    async fn renew_neighbour(&self, node: NodeInfo) -> Result<NodeInfo>;
}

/// Opens sessions to remote endpoints and returns callable handles.
#[async_trait]
pub trait NodeProxyFactory: Send + Sync {
    async fn connect_to(&self, endpoint: &NetworkEndpoint) -> Result<Box<dyn RemoteNode>>;
}

/// Production factory: one fresh TCP session per handle.
pub struct TcpProxyFactory {
    request_deadline: Duration,
}

impl TcpProxyFactory {
    pub fn new(request_deadline: Duration) -> Self {
        Self { request_deadline }
    }
}

#[async_trait]
impl NodeProxyFactory for TcpProxyFactory {
    async fn connect_to(&self, endpoint: &NetworkEndpoint) -> Result<Box<dyn RemoteNode>> {
        debug!(endpoint = %endpoint, "connecting node proxy");
        let session = Session::connect(endpoint.socket_addr(), self.request_deadline).await?;
        Ok(Box::new(NodeProxy {
            session: Mutex::new(session),
            next_id: AtomicU32::new(1),
        }))
    }
}

struct NodeProxy {
    session: Mutex<Session>,
    next_id: AtomicU32,
}

impl NodeProxy {
    async fn call(&self, request: NodeRequest) -> Result<ResponsePayload> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut session = self.session.lock().await;
        session.send(&Envelope::request(id, Request::Node(request))).await?;
        let envelope = session.receive().await?;
        drop(session);

        if envelope.id != id {
            return Err(Error::BadResponse(format!(
                "response id {} does not match request id {}",
                envelope.id, id
            )));
        }
        let response = match envelope.body {
            Body::Response(response) => response,
            Body::Request(_) => {
                return Err(Error::BadResponse("peer sent a request instead of a response".into()))
            }
        };
        if response.status != Status::Ok {
            let details = response.details.unwrap_or_default();
            warn!(status = ?response.status, details = %details, "remote node refused request");
            return Err(Error::from_status(response.status, details));
        }
        response
            .payload
            .ok_or_else(|| Error::BadResponse("OK response without payload".into()))
    }

    async fn call_node_info(&self, request: NodeRequest) -> Result<NodeInfo> {
        match self.call(request).await? {
            ResponsePayload::NodeInfo(info) => Ok(info),
            other => Err(Error::BadResponse(format!("expected node info, got {:?}", other))),
        }
    }

    async fn call_nodes(&self, request: NodeRequest) -> Result<Vec<NodeInfo>> {
        match self.call(request).await? {
            ResponsePayload::Nodes(nodes) => Ok(nodes),
            other => Err(Error::BadResponse(format!("expected node list, got {:?}", other))),
        }
    }
}

#[async_trait]
impl RemoteNode for NodeProxy {
    async fn get_node_info(&self) -> Result<NodeInfo> {
        self.call_node_info(NodeRequest::GetNodeInfo).await
    }

    async fn get_node_count(&self) -> Result<u64> {
        match self.call(NodeRequest::GetNodeCount).await? {
            ResponsePayload::NodeCount(count) => Ok(count),
            other => Err(Error::BadResponse(format!("expected node count, got {:?}", other))),
        }
    }

    async fn get_random_nodes(
        &self,
        max: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>> {
        self.call_nodes(NodeRequest::GetRandomNodes {
            max_node_count: max as u32,
            filter,
        })
        .await
    }

    async fn get_closest_nodes_by_distance(
        &self,
        location: GpsLocation,
        radius_km: Distance,
        max: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>> {
        self.call_nodes(NodeRequest::GetClosestNodesByDistance {
            location,
            radius_km,
            max_node_count: max as u32,
            filter,
        })
        .await
    }

    async fn accept_colleague(&self, node: NodeInfo) -> Result<NodeInfo> {
        self.call_node_info(NodeRequest::AcceptColleague { node }).await
    }

    async fn renew_colleague(&self, node: NodeInfo) -> Result<NodeInfo> {
        self.call_node_info(NodeRequest::RenewColleague { node }).await
    }

    async fn accept_neighbour(&self, node: NodeInfo) -> Result<NodeInfo> {
        self.call_node_info(NodeRequest::AcceptNeighbour { node }).await
    }

    async fn renew_neighbour(&self, node: NodeInfo) -> Result<NodeInfo> {
        self.call_node_info(NodeRequest::RenewNeighbour { node }).await
    }
}
