//! Wire vocabulary: the request/response unions carried inside frames.
//!
//! Three role-scoped request unions mirror the node's interfaces. A frame
//! body is one [`Envelope`]: a 32-bit id paired with exactly one request or
//! response; responses echo the id of the request they answer.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::geo::{Distance, GpsLocation};
use crate::identity::{NeighbourFilter, NodeId, NodeInfo, ServiceInfo};

/// Hard cap on a frame body.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Decode limit: body cap plus codec slack.
const MAX_DESERIALIZE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(envelope)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, bincode::Error> {
    decode_bounded(bytes)
}

fn decode_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// One wire message: id plus request or response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u32,
    pub body: Body,
}

impl Envelope {
    pub fn request(id: u32, request: Request) -> Self {
        Self { id, body: Body::Request(request) }
    }

    pub fn response(id: u32, response: Response) -> Self {
        Self { id, body: Body::Response(response) }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Request(Request),
    Response(Response),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    LocalService(LocalServiceRequest),
    Node(NodeRequest),
    Client(ClientRequest),
}

/// Requests from collocated application services, plus the
/// server-initiated neighbourhood change notification sent on upgraded
/// sessions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LocalServiceRequest {
    RegisterService {
        service: ServiceInfo,
    },
    DeregisterService {
        service_type: String,
    },
    GetNeighbourNodes {
        keep_alive_and_send_updates: bool,
    },
    GetNodeInfo,
    /// Server → service push after a keep-alive upgrade.
    NeighbourhoodChanged {
        changes: Vec<NeighbourhoodChange>,
    },
}

/// Requests from remote overlay nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeRequest {
    GetNodeInfo,
    GetNodeCount,
    GetRandomNodes {
        max_node_count: u32,
        filter: NeighbourFilter,
    },
    GetClosestNodesByDistance {
        location: GpsLocation,
        radius_km: Distance,
        max_node_count: u32,
        filter: NeighbourFilter,
    },
    AcceptColleague { node: NodeInfo },
    RenewColleague { node: NodeInfo },
    AcceptNeighbour { node: NodeInfo },
    RenewNeighbour { node: NodeInfo },
}

/// Requests from application clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    GetNodeInfo,
    GetNeighbourNodesByDistance,
    GetClosestNodesByDistance {
        location: GpsLocation,
        radius_km: Distance,
        max_node_count: u32,
        filter: NeighbourFilter,
    },
    GetRandomNodes {
        max_node_count: u32,
        filter: NeighbourFilter,
    },
    ExploreNetworkNodesByDistance {
        location: GpsLocation,
        target_node_count: u32,
        max_node_hops: u32,
    },
}

/// One neighbourhood mutation. Added and Updated are carried distinctly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NeighbourhoodChange {
    Added(NodeInfo),
    Updated(NodeInfo),
    Removed(NodeId),
}

/// Response status. Variant order is the wire code; never reorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    BadRequest,
    BadResponse,
    InvalidValue,
    InvalidState,
    AlreadyExists,
    NotFound,
    StorageFailure,
    ConnectionFailed,
    ProtocolViolation,
    Internal,
}

impl Status {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub details: Option<String>,
    pub payload: Option<ResponsePayload>,
}

impl Response {
    pub fn ok(payload: ResponsePayload) -> Self {
        Self { status: Status::Ok, details: None, payload: Some(payload) }
    }

    /// A non-OK status implies the payload is absent.
    pub fn error(status: Status, details: impl Into<String>) -> Self {
        Self { status, details: Some(details.into()), payload: None }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    NodeInfo(NodeInfo),
    NodeCount(u64),
    Nodes(Vec<NodeInfo>),
    Location(GpsLocation),
    Ack,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::NetworkEndpoint;
    use crate::identity::NodeProfile;

    fn test_info(seed: u8) -> NodeInfo {
        NodeInfo {
            profile: NodeProfile {
                id: NodeId::new(vec![seed; 8]),
                node_endpoint: NetworkEndpoint::parse("203.0.113.7", 16980).unwrap(),
                client_endpoint: NetworkEndpoint::parse("203.0.113.7", 16981).unwrap(),
            },
            location: GpsLocation::new(47.5, 19.0).unwrap(),
        }
    }

    #[test]
    fn round_trip_node_requests() {
        let requests = vec![
            NodeRequest::GetNodeInfo,
            NodeRequest::GetNodeCount,
            NodeRequest::GetRandomNodes { max_node_count: 10, filter: NeighbourFilter::Any },
            NodeRequest::GetClosestNodesByDistance {
                location: GpsLocation::new(1.0, 2.0).unwrap(),
                radius_km: 500.0,
                max_node_count: 20,
                filter: NeighbourFilter::ExcludeNeighbours,
            },
            NodeRequest::AcceptColleague { node: test_info(1) },
            NodeRequest::RenewColleague { node: test_info(2) },
            NodeRequest::AcceptNeighbour { node: test_info(3) },
            NodeRequest::RenewNeighbour { node: test_info(4) },
        ];
        for req in requests {
            let envelope = Envelope::request(7, Request::Node(req.clone()));
            let bytes = encode(&envelope).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded.id, 7);
            assert_eq!(decoded.body, Body::Request(Request::Node(req)));
        }
    }

    #[test]
    fn round_trip_keep_alive_request() {
        let envelope = Envelope::request(
            1,
            Request::LocalService(LocalServiceRequest::GetNeighbourNodes {
                keep_alive_and_send_updates: true,
            }),
        );
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn round_trip_neighbourhood_change() {
        let envelope = Envelope::request(
            3,
            Request::LocalService(LocalServiceRequest::NeighbourhoodChanged {
                changes: vec![
                    NeighbourhoodChange::Added(test_info(1)),
                    NeighbourhoodChange::Updated(test_info(1)),
                    NeighbourhoodChange::Removed(NodeId::new(vec![2; 8])),
                ],
            }),
        );
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        match decoded.body {
            Body::Request(Request::LocalService(LocalServiceRequest::NeighbourhoodChanged {
                changes,
            })) => {
                assert_eq!(changes.len(), 3);
                assert!(matches!(changes[0], NeighbourhoodChange::Added(_)));
                assert!(matches!(changes[1], NeighbourhoodChange::Updated(_)));
                assert!(matches!(changes[2], NeighbourhoodChange::Removed(_)));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn round_trip_error_response() {
        let envelope = Envelope::response(9, Response::error(Status::NotFound, "no such node"));
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        match decoded.body {
            Body::Response(resp) => {
                assert_eq!(resp.status, Status::NotFound);
                assert_eq!(resp.details.as_deref(), Some("no such node"));
                assert!(resp.payload.is_none());
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn round_trip_nodes_payload() {
        let envelope = Envelope::response(
            2,
            Response::ok(ResponsePayload::Nodes(vec![test_info(1), test_info(2)])),
        );
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        match decoded.body {
            Body::Response(resp) => match resp.payload {
                Some(ResponsePayload::Nodes(nodes)) => assert_eq!(nodes.len(), 2),
                other => panic!("unexpected payload: {:?}", other),
            },
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(decode(&garbage).is_err());

        let envelope = Envelope::request(1, Request::Node(NodeRequest::GetNodeInfo));
        let bytes = encode(&envelope).unwrap();
        let truncated = &bytes[..bytes.len() - 1];
        assert!(decode(truncated).is_err());
    }
}
