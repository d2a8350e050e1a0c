//! Connection-tracking replication between cluster peers.
//!
//! Every node runs an HTTP endpoint under `/xsync/v1/` that installs the
//! records pushed by its peers into the local datapath, and a client that
//! pushes local records out. A record whose protocol is `"xsync"` is a
//! liveness announcement: its source port carries the sender's node id and
//! nothing is installed.

mod client;
mod server;

pub use client::{Peer, spawn_announcer};
pub use server::{XsyncServer, router};

pub use crate::dp::CtInfo;

use crate::dp::Datapath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

pub const XSYNC_PORT: u16 = 22222;
/// Protocol name of liveness announcements.
pub const XSYNC_PROTO: &str = "xsync";
/// Timeout of a single-record call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(2);
/// Timeout of a bulk call.
pub const BULK_TIMEOUT: Duration = Duration::from_secs(10);
pub const READY_POLL: Duration = Duration::from_secs(2);
pub const READY_WAIT: Duration = Duration::from_secs(90);

/// Replication errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XsyncError {
    #[error("xsync not ready")]
    NotReady,

    #[error("peer {0} not ready")]
    PeerNotReady(SocketAddr),

    #[error("peer {0} timed out")]
    Timeout(SocketAddr),

    #[error("peer {peer}: {reason}")]
    Transport { peer: SocketAddr, reason: String },

    #[error("peer {peer} replied {status}")]
    Remote { peer: SocketAddr, status: i32 },

    #[error("peer {0} exists")]
    PeerExists(SocketAddr),

    #[error("no such peer {0}")]
    PeerNotExist(SocketAddr),

    #[error("xsync server: {0}")]
    Server(String),
}

impl XsyncError {
    pub fn code(&self) -> i32 {
        match self {
            XsyncError::NotReady => -9101,
            XsyncError::PeerNotReady(_) => -9102,
            XsyncError::Timeout(_) => -9103,
            XsyncError::Transport { .. } => -9104,
            XsyncError::Remote { .. } => -9105,
            XsyncError::PeerExists(_) => -9106,
            XsyncError::PeerNotExist(_) => -9107,
            XsyncError::Server(_) => -9108,
        }
    }
}

pub type Result<T> = std::result::Result<T, XsyncError>;

/// Reply body of every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XsyncReply {
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of a resync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CtGet {
    #[serde(rename = "async")]
    pub asynchronous: bool,
}

/// Replication endpoint of this node.
pub struct Xsync {
    dp: Arc<dyn Datapath>,
    node_id: u16,
    ready: AtomicBool,
    /// Node ids of peers that announced themselves, with the last time.
    remotes: Mutex<HashMap<u16, DateTime<Utc>>>,
    peers: Mutex<Vec<Peer>>,
}

impl Xsync {
    pub fn new(dp: Arc<dyn Datapath>, node_id: u16) -> Self {
        Self {
            dp,
            node_id,
            ready: AtomicBool::new(false),
            remotes: Mutex::new(HashMap::new()),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Start or stop accepting records from peers.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn check_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(XsyncError::NotReady)
        }
    }

    /// Install one record, or register a liveness announcement.
    pub fn ct_add(&self, ct: &CtInfo) -> Result<i32> {
        self.check_ready()?;
        if ct.proto == XSYNC_PROTO {
            let new = self
                .remotes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(ct.sport, Utc::now())
                .is_none();
            if new {
                info!(remote = ct.sport, "Xsync peer announced");
            }
            return Ok(0);
        }
        debug!(ct = %ct, "Xsync ct add");
        Ok(self.dp.ct_add(ct))
    }

    pub fn ct_delete(&self, ct: &CtInfo) -> Result<i32> {
        self.check_ready()?;
        debug!(ct = %ct, "Xsync ct delete");
        Ok(self.dp.ct_del(ct))
    }

    /// Install a batch; the reply is the last failing status or 0.
    pub fn block_ct_add(&self, cts: &[CtInfo]) -> Result<i32> {
        self.check_ready()?;
        debug!(count = cts.len(), "Xsync block ct add");
        Ok(cts.iter().fold(0, |ret, ct| match self.dp.ct_add(ct) {
            0 => ret,
            r => r,
        }))
    }

    pub fn block_ct_delete(&self, cts: &[CtInfo]) -> Result<i32> {
        self.check_ready()?;
        debug!(count = cts.len(), "Xsync block ct delete");
        Ok(cts.iter().fold(0, |ret, ct| match self.dp.ct_del(ct) {
            0 => ret,
            r => r,
        }))
    }

    /// A peer asks for the full table; the datapath pushes it asynchronously.
    pub fn ct_get(&self, req: CtGet) -> Result<i32> {
        self.check_ready()?;
        debug!(asynchronous = req.asynchronous, "Xsync ct get");
        self.dp.ct_get_async();
        Ok(0)
    }

    /// Node ids that have announced themselves.
    pub fn remotes(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .remotes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// When `remote` last announced itself.
    pub fn remote_seen(&self, remote: u16) -> Option<DateTime<Utc>> {
        self.remotes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&remote)
            .copied()
    }

    /// Every configured peer has announced itself.
    pub fn in_sync(&self) -> bool {
        let announced = self
            .remotes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        announced >= self.peer_count()
    }

    /// Wait until in sync, giving up after [`READY_WAIT`].
    pub async fn wait_ready(&self, who: &str) -> bool {
        self.wait_ready_for(who, READY_POLL, READY_WAIT).await
    }

    pub async fn wait_ready_for(&self, who: &str, poll: Duration, max: Duration) -> bool {
        let begin = Instant::now();
        loop {
            if self.in_sync() {
                return true;
            }
            if begin.elapsed() >= max {
                return false;
            }
            debug!(who, "Waiting for xsync");
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dp::StubDatapath;

    fn xsync() -> (Xsync, Arc<StubDatapath>) {
        let dp = Arc::new(StubDatapath::new());
        let xs = Xsync::new(dp.clone(), 1);
        xs.set_ready(true);
        (xs, dp)
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

    #[test]
    fn test_not_ready() {
        let (xs, dp) = xsync();
        xs.set_ready(false);
        assert_eq!(xs.ct_add(&ct(1000)), Err(XsyncError::NotReady));
        assert_eq!(dp.ct_len(), 0);
    }

    #[test]
    fn test_announce_installs_nothing() {
        let (xs, dp) = xsync();
        let hello = CtInfo {
            proto: XSYNC_PROTO.into(),
            sport: 7,
            ..Default::default()
        };
        assert_eq!(xs.ct_add(&hello), Ok(0));
        assert_eq!(xs.ct_add(&hello), Ok(0));
        assert_eq!(xs.remotes(), vec![7]);
        assert!(xs.remote_seen(7).is_some());
        assert!(xs.remote_seen(8).is_none());
        assert_eq!(dp.ct_len(), 0);
    }

    #[test]
    fn test_ct_add_delete() {
        let (xs, dp) = xsync();
        assert_eq!(xs.ct_add(&ct(1000)), Ok(0));
        assert_eq!(xs.block_ct_add(&[ct(1001), ct(1002)]), Ok(0));
        assert_eq!(dp.ct_len(), 3);
        assert_eq!(xs.ct_delete(&ct(1000)), Ok(0));
        assert_eq!(xs.block_ct_delete(&[ct(1001), ct(4242)]), Ok(-1));
        assert_eq!(dp.ct_len(), 1);
    }

    #[test]
    fn test_in_sync_counts_peers() {
        let (xs, _dp) = xsync();
        assert!(xs.in_sync());
        xs.peer_add("127.0.0.1:1".parse().unwrap()).unwrap();
        assert!(!xs.in_sync());
        xs.ct_add(&CtInfo {
            proto: XSYNC_PROTO.into(),
            sport: 2,
            ..Default::default()
        })
        .unwrap();
        assert!(xs.in_sync());
    }

    #[tokio::test]
    async fn test_wait_ready_gives_up() {
        let (xs, _dp) = xsync();
        xs.peer_add("127.0.0.1:1".parse().unwrap()).unwrap();
        let ok = xs
            .wait_ready_for("test", Duration::from_millis(5), Duration::from_millis(20))
            .await;
        assert!(!ok);
    }
}
