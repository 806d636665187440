//! Integration tests for the overlay node over real loopback TCP:
//! dispatch server, proxies, join and the notification upgrade.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use meridian::messages::{
    Body, ClientRequest, Envelope, LocalServiceRequest, NeighbourhoodChange, Request, Response,
    ResponsePayload, Status,
};
use meridian::session::Session;
use meridian::{
    DispatchServer, Error, GpsLocation, NeighbourFilter, NetworkEndpoint, Node, NodeConfig,
    NodeId, NodeInfo, NodeProfile, NodeProxyFactory, RelationType, SpatialStore, TcpProxyFactory,
};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct TestNode {
    node: Arc<Node>,
    server: DispatchServer,
    endpoint: NetworkEndpoint,
    _dir: tempfile::TempDir,
}

fn node_info(seed: u8, lat: f64, lon: f64, port: u16) -> NodeInfo {
    NodeInfo {
        profile: NodeProfile {
            id: NodeId::new(vec![seed; 4]),
            node_endpoint: NetworkEndpoint::parse("127.0.0.1", port).unwrap(),
            client_endpoint: NetworkEndpoint::parse("127.0.0.1", port).unwrap(),
        },
        location: GpsLocation::new(lat, lon).unwrap(),
    }
}

async fn start_node(seed: u8, lat: f64, lon: f64, seeds: Vec<NetworkEndpoint>) -> TestNode {
    let port = next_port();
    let dir = tempfile::tempdir().expect("tempdir");
    let info = node_info(seed, lat, lon, port);
    let endpoint = info.profile.node_endpoint;

    let mut config = NodeConfig::new(info.clone(), dir.path()).with_local_peers();
    config.seed_nodes = seeds;
    config.request_expiration_period = Duration::from_secs(5);

    let store = Arc::new(
        SpatialStore::open(dir.path(), info, config.db_expiration_period).expect("store"),
    );
    let proxies: Arc<dyn NodeProxyFactory> =
        Arc::new(TcpProxyFactory::new(config.request_expiration_period));
    let node = Node::new(config, store, proxies);
    let server = DispatchServer::bind(endpoint.socket_addr(), Arc::clone(&node))
        .await
        .expect("bind");

    TestNode { node, server, endpoint, _dir: dir }
}

#[tokio::test]
async fn proxy_round_trip_returns_server_identity() {
    let a = start_node(1, 47.5, 19.0, vec![]).await;

    let proxies = TcpProxyFactory::new(Duration::from_secs(5));
    let proxy = proxies.connect_to(&a.endpoint).await.expect("connect");

    let info = timeout(TEST_TIMEOUT, proxy.get_node_info()).await.unwrap().unwrap();
    assert_eq!(info, a.node.get_node_info());

    let count = proxy.get_node_count().await.unwrap();
    assert_eq!(count, 0);

    a.server.shutdown();
}

#[tokio::test]
async fn two_node_join_over_tcp() {
    let a = start_node(1, 47.5, 19.0, vec![]).await;
    let b = start_node(2, 48.2, 16.4, vec![a.endpoint]).await;

    timeout(TEST_TIMEOUT, b.node.ensure_map_filled())
        .await
        .unwrap()
        .expect("join");

    let a_on_b = b.node.store().load(&NodeId::new(vec![1; 4])).expect("B should know A");
    assert_eq!(a_on_b.relation, RelationType::Neighbour);
    let b_on_a = a.node.store().load(&NodeId::new(vec![2; 4])).expect("A should know B");
    assert_eq!(b_on_a.relation, RelationType::Neighbour);

    assert_eq!(a.node.get_neighbour_nodes_by_distance().len(), 1);
    assert_eq!(b.node.get_neighbour_nodes_by_distance().len(), 1);

    a.server.shutdown();
    b.server.shutdown();
}

#[tokio::test]
async fn remote_refusals_carry_their_error_kind() {
    let a = start_node(1, 47.5, 19.0, vec![]).await;

    let proxies = TcpProxyFactory::new(Duration::from_secs(5));

    // Presenting the server's own identity is invalid input.
    let proxy = proxies.connect_to(&a.endpoint).await.unwrap();
    let err = proxy.accept_colleague(a.node.get_node_info()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidValue(_)), "got {:?}", err);

    // Renewing a relation that never existed. The session died with the
    // previous error, so open a fresh one.
    let proxy = proxies.connect_to(&a.endpoint).await.unwrap();
    let stranger = node_info(9, 10.0, 10.0, 9999);
    let err = proxy.renew_colleague(stranger).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {:?}", err);

    a.server.shutdown();
}

#[tokio::test]
async fn queries_flow_through_the_wire() {
    let a = start_node(1, 47.5, 19.0, vec![]).await;
    let b = start_node(2, 48.2, 16.4, vec![a.endpoint]).await;
    let c = start_node(3, 40.4, -3.7, vec![a.endpoint]).await;
    timeout(TEST_TIMEOUT, b.node.ensure_map_filled()).await.unwrap().unwrap();
    timeout(TEST_TIMEOUT, c.node.ensure_map_filled()).await.unwrap().unwrap();

    let proxies = TcpProxyFactory::new(Duration::from_secs(5));
    let proxy = proxies.connect_to(&a.endpoint).await.unwrap();

    assert_eq!(proxy.get_node_count().await.unwrap(), 2);

    // Vienna is within 500 km of Budapest, Madrid is not.
    let from = GpsLocation::new(47.5, 19.0).unwrap();
    let close = proxy
        .get_closest_nodes_by_distance(from, 500.0, 10, NeighbourFilter::Any)
        .await
        .unwrap();
    assert_eq!(close.len(), 1);
    assert_eq!(close[0].id(), &NodeId::new(vec![2; 4]));

    let sample = proxy.get_random_nodes(10, NeighbourFilter::Any).await.unwrap();
    assert_eq!(sample.len(), 2);

    a.server.shutdown();
    b.server.shutdown();
    c.server.shutdown();
}

#[tokio::test]
async fn responses_preserve_request_order_within_a_session() {
    let a = start_node(1, 47.5, 19.0, vec![]).await;

    let mut session = Session::connect(a.endpoint.socket_addr(), Duration::from_secs(5))
        .await
        .unwrap();
    for id in 1..=4u32 {
        session
            .send(&Envelope::request(id, Request::Client(ClientRequest::GetNodeInfo)))
            .await
            .unwrap();
    }
    for id in 1..=4u32 {
        let envelope = session.receive().await.unwrap();
        assert_eq!(envelope.id, id);
    }

    a.server.shutdown();
}

#[tokio::test]
async fn malformed_frame_is_answered_and_closes_the_session() {
    let a = start_node(1, 47.5, 19.0, vec![]).await;

    let mut stream = tokio::net::TcpStream::connect(a.endpoint.socket_addr())
        .await
        .unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut stream, &[0x7f, 0, 0, 0, 0])
        .await
        .unwrap();

    let envelope = timeout(TEST_TIMEOUT, meridian::session::read_frame(&mut stream))
        .await
        .unwrap()
        .unwrap();
    match envelope.body {
        Body::Response(Response { status, .. }) => {
            assert_eq!(status, Status::ProtocolViolation);
        }
        other => panic!("unexpected body: {:?}", other),
    }

    // The server hangs up after the error response.
    let next = timeout(TEST_TIMEOUT, meridian::session::read_frame(&mut stream))
        .await
        .unwrap();
    assert!(next.is_err());

    a.server.shutdown();
}

#[tokio::test]
async fn keep_alive_upgrade_streams_neighbourhood_changes() {
    let a = start_node(1, 47.5, 19.0, vec![]).await;

    // A collocated service subscribes with the keep-alive flag.
    let mut session = Session::connect(a.endpoint.socket_addr(), Duration::from_secs(5))
        .await
        .unwrap();
    session
        .send(&Envelope::request(
            1,
            Request::LocalService(LocalServiceRequest::GetNeighbourNodes {
                keep_alive_and_send_updates: true,
            }),
        ))
        .await
        .unwrap();

    let envelope = session.receive().await.unwrap();
    assert_eq!(envelope.id, 1);
    match envelope.body {
        Body::Response(response) => {
            assert_eq!(response.status, Status::Ok);
            assert_eq!(response.payload, Some(ResponsePayload::Nodes(vec![])));
        }
        other => panic!("unexpected body: {:?}", other),
    }
    session.keep_alive();

    // Wait until the bridge listener is actually registered before
    // mutating the neighbourhood.
    timeout(TEST_TIMEOUT, async {
        while a.node.store().listener_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener registration");

    // A remote node becomes a neighbour; the service must hear about it.
    let proxies = TcpProxyFactory::new(Duration::from_secs(5));
    let proxy = proxies.connect_to(&a.endpoint).await.unwrap();
    let newcomer = node_info(2, 48.2, 16.4, next_port());
    proxy.accept_neighbour(newcomer.clone()).await.unwrap();

    let notification = timeout(TEST_TIMEOUT, session.receive()).await.unwrap().unwrap();
    match notification.body {
        Body::Request(Request::LocalService(LocalServiceRequest::NeighbourhoodChanged {
            changes,
        })) => {
            assert_eq!(changes.len(), 1);
            match &changes[0] {
                NeighbourhoodChange::Added(info) => {
                    assert_eq!(info.id(), newcomer.id());
                }
                other => panic!("unexpected change: {:?}", other),
            }
        }
        other => panic!("unexpected body: {:?}", other),
    }

    // Dropping the service connection releases the listener.
    drop(session);
    timeout(TEST_TIMEOUT, async {
        while a.node.store().listener_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener release");

    a.server.shutdown();
}

#[tokio::test]
async fn colleague_only_nodes_are_not_streamed() {
    let a = start_node(1, 47.5, 19.0, vec![]).await;

    let mut session = Session::connect(a.endpoint.socket_addr(), Duration::from_secs(5))
        .await
        .unwrap();
    session
        .send(&Envelope::request(
            1,
            Request::LocalService(LocalServiceRequest::GetNeighbourNodes {
                keep_alive_and_send_updates: true,
            }),
        ))
        .await
        .unwrap();
    let _ = session.receive().await.unwrap();
    session.keep_alive();

    timeout(TEST_TIMEOUT, async {
        while a.node.store().listener_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Colleague accept must not produce a neighbourhood notification,
    // the following neighbour accept must.
    let colleague = node_info(8, 10.0, 10.0, next_port());
    a.node.accept_colleague(colleague).unwrap();
    let neighbour = node_info(2, 48.2, 16.4, next_port());
    a.node.accept_neighbour(neighbour.clone()).unwrap();

    let notification = timeout(TEST_TIMEOUT, session.receive()).await.unwrap().unwrap();
    match notification.body {
        Body::Request(Request::LocalService(LocalServiceRequest::NeighbourhoodChanged {
            changes,
        })) => match &changes[0] {
            NeighbourhoodChange::Added(info) => assert_eq!(info.id(), neighbour.id()),
            other => panic!("unexpected change: {:?}", other),
        },
        other => panic!("unexpected body: {:?}", other),
    }

    a.server.shutdown();
}

#[tokio::test]
async fn client_exploration_crosses_servers() {
    // A knows B, B knows C; a client asking A must learn about C.
    let a = start_node(1, 0.0, 0.0, vec![]).await;
    let b = start_node(2, 10.0, 0.0, vec![]).await;
    let c = start_node(3, 20.0, 0.0, vec![]).await;

    a.node.accept_colleague(b.node.get_node_info()).unwrap();
    b.node.accept_colleague(c.node.get_node_info()).unwrap();

    let mut session = Session::connect(a.endpoint.socket_addr(), Duration::from_secs(5))
        .await
        .unwrap();
    session
        .send(&Envelope::request(
            1,
            Request::Client(ClientRequest::ExploreNetworkNodesByDistance {
                location: GpsLocation::new(20.0, 0.0).unwrap(),
                target_node_count: 3,
                max_node_hops: 4,
            }),
        ))
        .await
        .unwrap();

    let envelope = timeout(TEST_TIMEOUT, session.receive()).await.unwrap().unwrap();
    match envelope.body {
        Body::Response(response) => {
            assert_eq!(response.status, Status::Ok);
            match response.payload {
                Some(ResponsePayload::Nodes(nodes)) => {
                    assert!(
                        nodes.iter().any(|n| n.id() == &NodeId::new(vec![3; 4])),
                        "exploration should surface C, got {:?}",
                        nodes
                    );
                    assert_eq!(nodes[0].id(), &NodeId::new(vec![3; 4]));
                }
                other => panic!("unexpected payload: {:?}", other),
            }
        }
        other => panic!("unexpected body: {:?}", other),
    }

    a.server.shutdown();
    b.server.shutdown();
    c.server.shutdown();
}

#[tokio::test]
async fn store_survives_restart_with_relations() {
    let a = start_node(1, 47.5, 19.0, vec![]).await;

    // B joins without a server of its own (it only initiates), then shuts
    // down and comes back on the same database.
    let dir = tempfile::tempdir().unwrap();
    let info = node_info(2, 48.2, 16.4, next_port());
    {
        let mut config = NodeConfig::new(info.clone(), dir.path()).with_local_peers();
        config.seed_nodes = vec![a.endpoint];
        config.request_expiration_period = Duration::from_secs(5);
        let store = Arc::new(
            SpatialStore::open(dir.path(), info.clone(), Duration::from_secs(3600)).unwrap(),
        );
        let proxies: Arc<dyn NodeProxyFactory> =
            Arc::new(TcpProxyFactory::new(Duration::from_secs(5)));
        let node = Node::new(config, store, proxies);
        timeout(TEST_TIMEOUT, node.ensure_map_filled()).await.unwrap().unwrap();
        assert_eq!(node.get_node_count(), 1);
    }

    let store = SpatialStore::open(dir.path(), info, Duration::from_secs(3600)).unwrap();
    assert_eq!(store.get_node_count(None), 1);
    let recovered = store.load(&NodeId::new(vec![1; 4])).unwrap();
    assert_eq!(recovered.relation, RelationType::Neighbour);

    a.server.shutdown();
}
