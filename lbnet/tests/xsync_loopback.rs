//! Connection-tracking replication between two nodes over loopback.

mod common;

use common::allocate_port;
use lbnet::dp::{CtInfo, StubDatapath};
use lbnet::xsync::{Xsync, XsyncError, XsyncServer, spawn_announcer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

struct Node {
    xs: Arc<Xsync>,
    dp: Arc<StubDatapath>,
    server: XsyncServer,
}

impl Node {
    async fn start(id: u16) -> Self {
        let dp = Arc::new(StubDatapath::new());
        let xs = Arc::new(Xsync::new(dp.clone(), id));
        let listen: SocketAddr = format!("127.0.0.1:{}", allocate_port()).parse().unwrap();
        let server = XsyncServer::start(Arc::clone(&xs), listen)
            .await
            .expect("Failed to start xsync server");
        xs.set_ready(true);
        Self { xs, dp, server }
    }

    fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }
}

async fn pair() -> (Node, Node) {
    let a = Node::start(1).await;
    let b = Node::start(2).await;
    a.xs.peer_add(b.addr()).unwrap();
    b.xs.peer_add(a.addr()).unwrap();
    (a, b)
}

fn ct(sport: u16) -> CtInfo {
    CtInfo {
        dip: "20.20.20.1".parse().unwrap(),
        sip: "10.0.0.5".parse().unwrap(),
        dport: 80,
        sport,
        proto: "tcp".into(),
        cstate: "est".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_announce_and_push() {
    let (a, b) = pair().await;
    assert!(!b.xs.in_sync());

    a.xs.announce().await.unwrap();
    assert_eq!(b.xs.remotes(), vec![1]);
    assert!(b.xs.remote_seen(1).is_some());
    assert!(b.xs.in_sync());
    assert!(!a.xs.in_sync());
    // Announcements are not conntrack entries
    assert_eq!(b.dp.ct_len(), 0);

    a.xs.push_ct_add(&ct(40000)).await.unwrap();
    a.xs.push_block_ct_add(&[ct(40001), ct(40002)]).await.unwrap();
    assert_eq!(b.dp.ct_len(), 3);

    a.xs.push_ct_delete(&ct(40000)).await.unwrap();
    assert_eq!(b.dp.ct_len(), 2);

    // Deleting an entry the peer does not hold surfaces its status
    let err = a.xs.push_ct_delete(&ct(40000)).await.unwrap_err();
    assert!(matches!(err, XsyncError::Remote { status: -1, .. }));

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test]
async fn test_push_table() {
    let (a, b) = pair().await;
    a.xs.ct_add(&ct(1)).unwrap();
    a.xs.ct_add(&ct(2)).unwrap();
    assert_eq!(a.dp.ct_len(), 2);

    a.xs.push_table().await.unwrap();
    assert_eq!(b.dp.ct_len(), 2);

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test]
async fn test_peer_not_ready() {
    let (a, b) = pair().await;
    b.xs.set_ready(false);

    let err = a.xs.push_ct_add(&ct(7)).await.unwrap_err();
    assert_eq!(err, XsyncError::PeerNotReady(b.addr()));
    assert_eq!(err.code(), -9102);
    assert_eq!(b.dp.ct_len(), 0);

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test]
async fn test_unreachable_peer() {
    let a = Node::start(1).await;
    let gone: SocketAddr = format!("127.0.0.1:{}", allocate_port()).parse().unwrap();
    a.xs.peer_add(gone).unwrap();
    assert_eq!(a.xs.peer_add(gone), Err(XsyncError::PeerExists(gone)));

    let err = a.xs.announce().await.unwrap_err();
    assert_eq!(err.code(), -9104);

    a.xs.peer_delete(gone).unwrap();
    assert!(a.xs.peers().is_empty());
    a.xs.announce().await.unwrap();

    a.server.stop().await;
}

#[tokio::test]
async fn test_announcer_brings_peers_in_sync() {
    let (a, b) = pair().await;
    let ta = spawn_announcer(Arc::clone(&a.xs), Duration::from_millis(50));
    let tb = spawn_announcer(Arc::clone(&b.xs), Duration::from_millis(50));

    let max = Duration::from_secs(5);
    let poll = Duration::from_millis(20);
    assert!(a.xs.wait_ready_for("test", poll, max).await);
    assert!(b.xs.wait_ready_for("test", poll, max).await);

    ta.abort();
    tb.abort();
    a.server.stop().await;
    b.server.stop().await;
}
