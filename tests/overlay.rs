use std::sync::Arc;
use std::time::Duration;

use chain_relay::p2p::{
    ChainMessage, Client, Message, MessageType, P2PNode, RouterService, TransportError,
};

#[path = "harness.rs"]
mod harness;
use harness::{refused_addr, test_config, wait_until, ChainLog, Recorder};

const WAIT: Duration = Duration::from_secs(5);

async fn started_node() -> (Arc<P2PNode<Recorder>>, Arc<Recorder>) {
    let rec = Recorder::new();
    let node = Arc::new(P2PNode::new("127.0.0.1:0", rec.clone(), test_config()));
    node.start().await.unwrap();
    (node, rec)
}

fn addr_of(node: &P2PNode<Recorder>) -> String {
    node.local_addr().unwrap().to_string()
}

#[tokio::test]
async fn test_node_start_and_stop_are_idempotent() {
    let (node, _) = started_node().await;
    let addr = node.local_addr();

    node.start().await.unwrap();
    assert!(node.is_running());
    assert_eq!(node.local_addr(), addr);

    node.stop().await;
    node.stop().await;
    assert!(!node.is_running());
    assert_eq!(node.broadcast_to_client(&Message::keepalive()), (0, 0));
}

#[tokio::test]
async fn test_node_can_restart_after_stop() {
    let (node, _) = started_node().await;
    node.stop().await;
    node.start().await.unwrap();
    assert!(node.is_running());
    node.stop().await;
}

#[tokio::test]
async fn test_broadcast_in_both_directions() {
    let (a, a_rec) = started_node().await;
    let (b, b_rec) = started_node().await;

    let conn = a.connect(&addr_of(&b)).await.unwrap();
    assert!(conn.is_alive());
    assert!(wait_until(WAIT, || b.inbound_count() == 1).await);
    assert_eq!(a.outbound_count(), 1);
    assert_eq!(a.inbound_count(), 0);

    let up = Message::new(MessageType::ChainMessage, b"to server".to_vec());
    assert_eq!(a.broadcast_to_server(&up), (1, 0));
    assert!(wait_until(WAIT, || b_rec.count() == 1).await);
    assert_eq!(b_rec.messages()[0].payload(), b"to server");

    let down = Message::new(MessageType::ChainMessage, b"to client".to_vec());
    assert_eq!(b.broadcast_to_client(&down), (1, 0));
    assert!(wait_until(WAIT, || a_rec.count() == 1).await);
    assert_eq!(a_rec.messages()[0].payload(), b"to client");

    // a has no inbound links and b no outbound ones
    assert_eq!(a.broadcast_to_client(&down), (0, 0));
    assert_eq!(b.broadcast_to_server(&up), (0, 0));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_server_broadcast_failure_is_isolated() {
    let (a, _) = started_node().await;
    let mut servers = Vec::new();
    for _ in 0..3 {
        let (node, rec) = started_node().await;
        a.connect(&addr_of(&node)).await.unwrap();
        servers.push((node, rec));
    }
    assert_eq!(a.outbound_count(), 3);

    let poisoned = a.outbound_connections()[1].id();
    let msg = Message::new(MessageType::ChainMessage, b"some".to_vec());
    let (ok, failed) = a.broadcast_to_server_with(&msg, |conn, m| {
        if conn.id() == poisoned {
            Err(TransportError::ChannelFull)
        } else {
            conn.send(m.clone())
        }
    });
    assert_eq!((ok, failed), (2, 1));

    let delivered = || servers.iter().map(|(_, rec)| rec.count()).sum::<usize>();
    assert!(wait_until(WAIT, || delivered() == 2).await);
    assert_eq!(a.outbound_count(), 3);

    a.stop().await;
    for (node, _) in &servers {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_disconnect_outbound_link() {
    let (a, _) = started_node().await;
    let (b, _) = started_node().await;

    let conn = a.connect(&addr_of(&b)).await.unwrap();
    assert!(wait_until(WAIT, || b.inbound_count() == 1).await);

    assert!(a.disconnect(conn.id()).await);
    assert_eq!(a.outbound_count(), 0);
    assert!(wait_until(WAIT, || b.inbound_count() == 0).await);
    assert!(!a.disconnect(conn.id()).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_disconnect_inbound_link() {
    let (a, _) = started_node().await;
    let (b, _) = started_node().await;

    a.connect(&addr_of(&b)).await.unwrap();
    assert!(wait_until(WAIT, || b.inbound_count() == 1).await);

    let inbound = b.inbound_connections()[0].id();
    assert!(b.disconnect(inbound).await);
    assert_eq!(b.inbound_count(), 0);

    // the dialing side notices and evicts on its next enumeration
    assert!(wait_until(WAIT, || a.outbound_count() == 0).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_dead_outbound_evicted_without_disconnect() {
    let (a, _) = started_node().await;
    let (b, _) = started_node().await;

    let conn = a.connect(&addr_of(&b)).await.unwrap();
    b.stop().await;
    assert!(wait_until(WAIT, || !conn.is_alive()).await);

    let msg = Message::new(MessageType::ChainMessage, b"gone".to_vec());
    assert_eq!(a.broadcast_to_server(&msg), (0, 0));
    assert_eq!(a.evict_dead(), 0);
    assert!(a.outbound_connections().is_empty());

    a.stop().await;
}

#[tokio::test]
async fn test_connect_failure_returns_none() {
    let (a, _) = started_node().await;
    assert!(a.connect(&refused_addr()).await.is_none());
    assert_eq!(a.outbound_count(), 0);
    a.stop().await;
}

#[tokio::test]
async fn test_stop_closes_outbound_links() {
    let (a, _) = started_node().await;
    let (b, _) = started_node().await;
    let (c, _) = started_node().await;

    let to_b = a.connect(&addr_of(&b)).await.unwrap();
    let to_c = a.connect(&addr_of(&c)).await.unwrap();
    assert_eq!(a.outbound_count(), 2);

    a.stop().await;
    assert!(!to_b.is_alive());
    assert!(!to_c.is_alive());
    assert!(wait_until(WAIT, || b.inbound_count() == 0 && c.inbound_count() == 0).await);

    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn test_snapshot_lists_links() {
    let (a, _) = started_node().await;
    let (b, _) = started_node().await;
    a.connect(&addr_of(&b)).await.unwrap();
    assert!(wait_until(WAIT, || b.inbound_count() == 1).await);

    let snap = a.snapshot();
    assert!(snap.running);
    assert_eq!(snap.outbound.len(), 1);
    assert!(snap.inbound.is_empty());
    assert_eq!(snap.outbound[0].remote, addr_of(&b));

    let json = serde_json::to_value(&b.snapshot()).unwrap();
    assert_eq!(json["inbound"].as_array().unwrap().len(), 1);
    assert_eq!(json["listen_addr"], addr_of(&b));

    let text = b.to_string();
    assert!(text.contains("running=true"));
    assert!(text.contains("inbound(1)"));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_keepalive_broadcast_reaches_inbound_links() {
    let (a, a_rec) = started_node().await;
    let (b, _) = started_node().await;

    a.connect(&addr_of(&b)).await.unwrap();
    assert!(wait_until(WAIT, || b.inbound_count() == 1).await);

    b.spawn_keepalive(Duration::from_millis(50), Message::keepalive());
    assert!(wait_until(WAIT, || a_rec.count_of(MessageType::Keepalive) >= 2).await);

    b.stop().await;
    let seen = a_rec.count_of(MessageType::Keepalive);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a_rec.count_of(MessageType::Keepalive), seen);

    a.stop().await;
}

#[tokio::test]
async fn test_router_service_protocol() {
    let chains = ChainLog::default();
    let service = Arc::new(RouterService::new(chains.clone()));
    let router = P2PNode::new("127.0.0.1:0", service.clone(), test_config());
    router.start().await.unwrap();
    let addr = router.local_addr().unwrap().to_string();

    let rec = Recorder::new();
    let client = Client::new(addr, rec.clone(), test_config());
    let conn = client.connect().await.unwrap();

    // unknown types are skipped and the link stays up
    client.send(Message::raw(999, b"??".to_vec())).unwrap();
    client.send(Message::new(MessageType::RouterSync, Vec::new())).unwrap();

    client.send(Message::hello("p1")).unwrap();
    assert!(wait_until(WAIT, || rec.count_of(MessageType::PeerHelloAck) == 1).await);
    assert!(client.is_connected());
    assert!(service.connection_of("p1").is_some());
    assert_eq!(service.peers().len(), 1);

    client.send(Message::keepalive()).unwrap();
    assert!(wait_until(WAIT, || rec.count_of(MessageType::KeepaliveAck) == 1).await);

    let msg = ChainMessage::new("p1", "shard7:p2", b"blk".to_vec(), vec![0xab, 0xcd]);
    client.send(Message::chain(&msg).unwrap()).unwrap();
    assert!(wait_until(WAIT, || chains.len() == 1).await);
    assert_eq!(
        chains.entries()[0],
        ("p1".to_string(), "shard7:p2".to_string(), b"blk".to_vec(), vec![0xab, 0xcd])
    );

    client.send(Message::close("p1")).unwrap();
    assert!(wait_until(WAIT, || service.peer_count() == 0).await);

    // registration is also dropped when the link dies
    client.send(Message::hello("p1")).unwrap();
    assert!(wait_until(WAIT, || service.peer_count() == 1).await);
    client.disconnect().await;
    assert!(!conn.is_alive());
    assert!(wait_until(WAIT, || service.peer_count() == 0).await);

    router.stop().await;
}

#[tokio::test]
async fn test_router_chain_callback_error_drops_link() {
    let chains = ChainLog::default();
    let service = Arc::new(RouterService::new(chains.clone()));
    let router = P2PNode::new("127.0.0.1:0", service, test_config());
    router.start().await.unwrap();

    let client = Client::new(router.local_addr().unwrap().to_string(), Recorder::new(), test_config());
    client.connect().await.unwrap();

    let msg = ChainMessage::new("p1", "shard1:", b"bad".to_vec(), Vec::new());
    client.send(Message::chain(&msg).unwrap()).unwrap();

    assert!(wait_until(WAIT, || !client.is_connected()).await);
    assert_eq!(chains.len(), 0);
    router.stop().await;
}
