//! Cluster replication: outbound dispatch counts and loop suppression

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use registry_core::events::DEFAULT_EVENT_BUFFER;
use registry_core::{
    ClusterNode, ClusterSync, EventBus, ExpiryPolicy, NodeCache, NodeStatus, RegistryMetrics,
    RegistryStore, ServiceEvent, ServiceEventType, ServiceInstance, ServiceRegistration,
    StatusHistory,
};

struct Node {
    sync: Arc<ClusterSync>,
    store: Arc<RegistryStore>,
    cache: Arc<NodeCache>,
}

fn node(node_id: &str) -> Node {
    let metrics = Arc::new(RegistryMetrics::new());
    let bus = Arc::new(EventBus::new(DEFAULT_EVENT_BUFFER, Arc::clone(&metrics)));
    let store = Arc::new(RegistryStore::new(
        node_id,
        ExpiryPolicy::new(90),
        Arc::clone(&bus),
        Arc::new(StatusHistory::new()),
        Arc::clone(&metrics),
    ));
    let cache = Arc::new(NodeCache::new());
    cache.upsert(ClusterNode::new(node_id, "127.0.0.1", 0, NodeStatus::Up));
    let sync = Arc::new(ClusterSync::new(
        node_id,
        2,
        Arc::clone(&cache),
        Arc::clone(&store),
        bus,
        metrics,
    ));
    Node { sync, store, cache }
}

fn add_peer(node: &Node, peer_id: &str, port: u16) {
    node.cache
        .upsert(ClusterNode::new(peer_id, "127.0.0.1", port, NodeStatus::Up));
}

fn instance() -> ServiceInstance {
    ServiceRegistration {
        instance_id: "1".to_string(),
        host: "10.0.0.1".to_string(),
        port: 8080,
        ..Default::default()
    }
    .into_instance("x", Utc::now())
}

/// A client registers on A; A forwards exactly one POST to its UP peer, and
/// the peer's copy of the event is never forwarded again.
#[tokio::test]
async fn local_mutation_is_dispatched_exactly_once_per_peer() {
    let peer = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/cluster/events"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&peer)
        .await;

    let node_a = node("node-a");
    add_peer(&node_a, "node-b", peer.address().port());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let outbound = tokio::spawn(Arc::clone(&node_a.sync).run_outbound_loop(shutdown_rx));
    // Let the dispatcher attach its bus subscription before mutating
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Local mutation: REGISTER flows through the bus to the dispatcher
    node_a.store.register(instance()).unwrap();

    // Replicated event from elsewhere: applied locally, never forwarded
    let foreign = ServiceEvent::new(ServiceEventType::Register, &instance(), "node-c");
    node_a.sync.handle_cluster_event(foreign);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), outbound).await;

    // MockServer verifies expect(1) on drop
    assert_eq!(node_a.sync.dispatch_failure_count(), 0);
}

/// Both sides of the replication pair converge to one entry for x/1 with a
/// single outbound POST in the whole cluster.
#[tokio::test]
async fn two_node_register_converges_without_echo() {
    let inbox_b = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/cluster/events"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&inbox_b)
        .await;
    // B's own outbound target: must never be called
    let inbox_a = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/cluster/events"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&inbox_a)
        .await;

    let node_a = node("node-a");
    add_peer(&node_a, "node-b", inbox_b.address().port());
    let node_b = node("node-b");
    add_peer(&node_b, "node-a", inbox_a.address().port());

    let (tx_a, rx_a) = watch::channel(false);
    let (tx_b, rx_b) = watch::channel(false);
    let loop_a = tokio::spawn(Arc::clone(&node_a.sync).run_outbound_loop(rx_a));
    let loop_b = tokio::spawn(Arc::clone(&node_b.sync).run_outbound_loop(rx_b));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Register on A; hand A's event to B the way the wire would
    let registered = node_a.store.register(instance()).unwrap();
    let event = ServiceEvent::new(ServiceEventType::Register, &registered, "node-a");
    node_b.sync.handle_cluster_event(event);

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(node_a.store.get_instance("x", "1").is_some());
    assert!(node_b.store.get_instance("x", "1").is_some());
    assert_eq!(node_a.store.get_instances("x").len(), 1);
    assert_eq!(node_b.store.get_instances("x").len(), 1);

    let _ = tx_a.send(true);
    let _ = tx_b.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), loop_a).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), loop_b).await;
}

/// Outbound failures are counted and do not block dispatch to other peers.
#[tokio::test]
async fn unreachable_peer_does_not_block_the_reachable_one() {
    let reachable = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/cluster/events"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&reachable)
        .await;

    let node_a = node("node-a");
    // Port 9 (discard) is expected to refuse quickly
    add_peer(&node_a, "node-dead", 9);
    add_peer(&node_a, "node-live", reachable.address().port());

    let event = ServiceEvent::new(ServiceEventType::Register, &instance(), "node-a");
    node_a.sync.dispatch(&event).await;

    assert_eq!(node_a.sync.dispatch_failure_count(), 1);
}

/// Deregister replicates the same way and stays idempotent on the peer.
#[tokio::test]
async fn replicated_deregister_converges() {
    let node_b = node("node-b");
    let registered = instance();
    node_b.sync.handle_cluster_event(ServiceEvent::new(
        ServiceEventType::Register,
        &registered,
        "node-a",
    ));
    assert!(node_b.store.get_instance("x", "1").is_some());

    let deregister = ServiceEvent::new(ServiceEventType::Deregister, &registered, "node-a");
    node_b.sync.handle_cluster_event(deregister.clone());
    node_b.sync.handle_cluster_event(deregister);
    assert!(node_b.store.get_instance("x", "1").is_none());
}
