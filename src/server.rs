//! Dispatch server: accepts connections, reads framed requests, routes
//! them to the node core and writes responses back.
//!
//! One task per connection; the acceptor never blocks on dispatch. A
//! `GetNeighbourNodes` request with the keep-alive flag upgrades its
//! session into notification mode: the dispatch loop ends and the session
//! is handed to a bridge that pushes neighbourhood changes back through
//! the same stream.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::messages::{
    Body, ClientRequest, Envelope, LocalServiceRequest, NeighbourhoodChange, NodeRequest,
    Request, Response, ResponsePayload,
};
use crate::node::Node;
use crate::session::{read_frame, write_frame, Session};
use crate::storage::{ChangeListener, SessionId};
use crate::identity::{NodeDbEntry, RelationType};

/// Pending notifications per upgraded session. A service that cannot keep
/// up loses its listener rather than stalling the store.
const BRIDGE_QUEUE_DEPTH: usize = 64;

pub struct DispatchServer {
    local_addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl DispatchServer {
    /// Bind and start serving. The returned value owns the accept task.
    pub async fn bind(addr: SocketAddr, node: Arc<Node>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(Error::Connection)?;
        let local_addr = listener.local_addr().map_err(Error::Connection)?;
        info!(addr = %local_addr, node = %node.get_node_info().id(), "dispatch server listening");

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let node = Arc::clone(&node);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, node).await {
                                debug!(peer = %peer, error = %e, "session closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                    }
                }
            }
        });

        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

async fn handle_connection(stream: TcpStream, node: Arc<Node>) -> Result<()> {
    let deadline = node.config().request_expiration_period;
    let mut session = Session::new(stream, deadline)?;
    let session_id = session.id().clone();
    debug!(session = %session_id, "session opened");

    loop {
        let envelope = match session.receive().await {
            Ok(envelope) => envelope,
            Err(Error::InvalidState(_)) => {
                debug!(session = %session_id, "peer closed the session");
                return Ok(());
            }
            Err(e) => {
                // Framing trouble: answer with the error kind if the wire
                // still works, then close.
                let response = Response::error(e.status(), e.to_string());
                let _ = session.send(&Envelope::response(0, response)).await;
                return Err(e);
            }
        };

        let request = match envelope.body {
            Body::Request(request) => request,
            Body::Response(_) => {
                let response =
                    Response::error(crate::messages::Status::BadRequest, "expected a request");
                session.send(&Envelope::response(envelope.id, response)).await?;
                return Ok(());
            }
        };

        let upgrade = matches!(
            request,
            Request::LocalService(LocalServiceRequest::GetNeighbourNodes {
                keep_alive_and_send_updates: true,
            })
        );

        match dispatch_request(&node, request).await {
            Ok(payload) => {
                session
                    .send(&Envelope::response(envelope.id, Response::ok(payload)))
                    .await?;
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "request failed");
                let response = Response::error(e.status(), e.to_string());
                session.send(&Envelope::response(envelope.id, response)).await?;
                return Ok(());
            }
        }

        if upgrade {
            session.keep_alive();
            attach_notification_bridge(session, node);
            return Ok(());
        }
    }
}

/// Route one request through the role interfaces of the node.
async fn dispatch_request(node: &Arc<Node>, request: Request) -> Result<ResponsePayload> {
    match request {
        Request::Node(request) => dispatch_node_request(node, request),
        Request::LocalService(request) => dispatch_local_service_request(node, request),
        Request::Client(request) => dispatch_client_request(node, request).await,
    }
}

fn dispatch_node_request(node: &Node, request: NodeRequest) -> Result<ResponsePayload> {
    match request {
        NodeRequest::GetNodeInfo => Ok(ResponsePayload::NodeInfo(node.get_node_info())),
        NodeRequest::GetNodeCount => {
            Ok(ResponsePayload::NodeCount(node.get_node_count() as u64))
        }
        NodeRequest::GetRandomNodes { max_node_count, filter } => Ok(ResponsePayload::Nodes(
            node.get_random_nodes(max_node_count as usize, filter),
        )),
        NodeRequest::GetClosestNodesByDistance {
            location,
            radius_km,
            max_node_count,
            filter,
        } => Ok(ResponsePayload::Nodes(node.get_closest_nodes_by_distance(
            &location,
            radius_km,
            max_node_count as usize,
            filter,
        )?)),
        NodeRequest::AcceptColleague { node: candidate } => {
            Ok(ResponsePayload::NodeInfo(node.accept_colleague(candidate)?))
        }
        NodeRequest::RenewColleague { node: candidate } => {
            Ok(ResponsePayload::NodeInfo(node.renew_colleague(candidate)?))
        }
        NodeRequest::AcceptNeighbour { node: candidate } => {
            Ok(ResponsePayload::NodeInfo(node.accept_neighbour(candidate)?))
        }
        NodeRequest::RenewNeighbour { node: candidate } => {
            Ok(ResponsePayload::NodeInfo(node.renew_neighbour(candidate)?))
        }
    }
}

fn dispatch_local_service_request(
    node: &Node,
    request: LocalServiceRequest,
) -> Result<ResponsePayload> {
    match request {
        LocalServiceRequest::RegisterService { service } => {
            Ok(ResponsePayload::Location(node.register_service(service)))
        }
        LocalServiceRequest::DeregisterService { service_type } => {
            node.deregister_service(&service_type)?;
            Ok(ResponsePayload::Ack)
        }
        LocalServiceRequest::GetNeighbourNodes { .. } => Ok(ResponsePayload::Nodes(
            node.get_neighbour_nodes_by_distance(),
        )),
        LocalServiceRequest::GetNodeInfo => {
            Ok(ResponsePayload::NodeInfo(node.get_node_info()))
        }
        LocalServiceRequest::NeighbourhoodChanged { .. } => Err(Error::BadRequest(
            "neighbourhood change notifications are server-initiated".into(),
        )),
    }
}

async fn dispatch_client_request(
    node: &Arc<Node>,
    request: ClientRequest,
) -> Result<ResponsePayload> {
    match request {
        ClientRequest::GetNodeInfo => Ok(ResponsePayload::NodeInfo(node.get_node_info())),
        ClientRequest::GetNeighbourNodesByDistance => Ok(ResponsePayload::Nodes(
            node.get_neighbour_nodes_by_distance(),
        )),
        ClientRequest::GetClosestNodesByDistance {
            location,
            radius_km,
            max_node_count,
            filter,
        } => Ok(ResponsePayload::Nodes(node.get_closest_nodes_by_distance(
            &location,
            radius_km,
            max_node_count as usize,
            filter,
        )?)),
        ClientRequest::GetRandomNodes { max_node_count, filter } => Ok(ResponsePayload::Nodes(
            node.get_random_nodes(max_node_count as usize, filter),
        )),
        ClientRequest::ExploreNetworkNodesByDistance {
            location,
            target_node_count,
            max_node_hops,
        } => Ok(ResponsePayload::Nodes(
            node.explore_network_nodes_by_distance(
                &location,
                target_node_count as usize,
                max_node_hops as usize,
            )
            .await?,
        )),
    }
}

// ── Notification bridge ──────────────────────────────────────────────────

/// Store listener bound to an upgraded session. Forwards Neighbour-relation
/// events into the writer task's queue; everything else is ignored. A full
/// or closed queue fails the listener, which deregisters it.
struct BridgeListener {
    session_id: SessionId,
    tx: mpsc::Sender<NeighbourhoodChange>,
}

impl BridgeListener {
    fn forward(&self, change: NeighbourhoodChange) -> Result<()> {
        self.tx
            .try_send(change)
            .map_err(|e| Error::Internal(format!("notification queue: {}", e)))
    }
}

impl ChangeListener for BridgeListener {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn added(&self, entry: &NodeDbEntry) -> Result<()> {
        if entry.relation != RelationType::Neighbour {
            return Ok(());
        }
        self.forward(NeighbourhoodChange::Added(entry.info.clone()))
    }

    fn updated(&self, entry: &NodeDbEntry) -> Result<()> {
        if entry.relation != RelationType::Neighbour {
            return Ok(());
        }
        self.forward(NeighbourhoodChange::Updated(entry.info.clone()))
    }

    fn removed(&self, entry: &NodeDbEntry) -> Result<()> {
        if entry.relation != RelationType::Neighbour {
            return Ok(());
        }
        self.forward(NeighbourhoodChange::Removed(entry.id().clone()))
    }
}

/// Move an upgraded session into notification mode: a writer task owns the
/// write half and pushes one request per change; a drain task owns the
/// read half, discards whatever comes back and tears everything down on
/// disconnect.
fn attach_notification_bridge(session: Session, node: Arc<Node>) {
    let (session_id, mut read_half, mut write_half) = session.into_split();
    let (tx, mut rx) = mpsc::channel(BRIDGE_QUEUE_DEPTH);

    node.add_listener(Arc::new(BridgeListener {
        session_id: session_id.clone(),
        tx,
    }));
    debug!(session = %session_id, "session upgraded to notification mode");

    let writer_node = Arc::clone(&node);
    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        let mut next_id: u32 = 1;
        while let Some(change) = rx.recv().await {
            let request = Request::LocalService(LocalServiceRequest::NeighbourhoodChanged {
                changes: vec![change],
            });
            if let Err(e) = write_frame(&mut write_half, &Envelope::request(next_id, request)).await
            {
                debug!(session = %writer_session, error = %e, "notification send failed");
                break;
            }
            next_id = next_id.wrapping_add(1);
        }
        // Deregistration drops the sender and ends this loop; doing it
        // again here covers the send-failure path.
        writer_node.remove_listener(&writer_session);
        debug!(session = %writer_session, "notification writer finished");
    });

    tokio::spawn(async move {
        while read_frame(&mut read_half).await.is_ok() {}
        node.remove_listener(&session_id);
        writer.abort();
        debug!(session = %session_id, "notification session released");
    });
}
