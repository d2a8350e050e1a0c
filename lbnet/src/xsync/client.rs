//! Outbound side of xsync: peer set and record pushes.

use super::{
    BULK_TIMEOUT, CALL_TIMEOUT, CtGet, CtInfo, Result, XSYNC_PROTO, Xsync, XsyncError, XsyncReply,
};
use crate::dp::{DpMap, TableDpWork};
use reqwest::StatusCode;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A cluster peer and its HTTP connection pool.
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: SocketAddr,
    client: reqwest::Client,
}

impl Peer {
    fn connect(addr: SocketAddr) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CALL_TIMEOUT)
            .build()
            .map_err(|e| XsyncError::Transport {
                peer: addr,
                reason: e.to_string(),
            })?;
        Ok(Self { addr, client })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}/xsync/v1/{path}", self.addr)
    }
}

impl Xsync {
    pub fn peer_add(&self, addr: SocketAddr) -> Result<()> {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        if peers.iter().any(|p| p.addr == addr) {
            return Err(XsyncError::PeerExists(addr));
        }
        peers.push(Peer::connect(addr)?);
        info!(peer = %addr, "Xsync peer added");
        Ok(())
    }

    pub fn peer_delete(&self, addr: SocketAddr) -> Result<()> {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = peers
            .iter()
            .position(|p| p.addr == addr)
            .ok_or(XsyncError::PeerNotExist(addr))?;
        peers.remove(idx);
        info!(peer = %addr, "Xsync peer deleted");
        Ok(())
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|p| p.addr)
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn peer_get(&self, addr: SocketAddr) -> Result<Peer> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.addr == addr)
            .cloned()
            .ok_or(XsyncError::PeerNotExist(addr))
    }

    /// Drop the pooled connections of a peer and open a fresh pool.
    fn peer_reconnect(&self, addr: SocketAddr) -> Result<()> {
        let fresh = Peer::connect(addr)?;
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(p) = peers.iter_mut().find(|p| p.addr == addr) {
            *p = fresh;
        }
        Ok(())
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        addr: SocketAddr,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<()> {
        let mut retried = false;
        loop {
            let peer = self.peer_get(addr)?;
            let res = peer
                .client
                .post(peer.url(path))
                .timeout(timeout)
                .json(body)
                .send()
                .await;
            let resp = match res {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() && !retried => {
                    warn!(peer = %addr, path, "Xsync call timed out, reconnecting");
                    self.peer_reconnect(addr)?;
                    retried = true;
                    continue;
                }
                Err(e) if e.is_timeout() => return Err(XsyncError::Timeout(addr)),
                Err(e) => {
                    return Err(XsyncError::Transport {
                        peer: addr,
                        reason: e.to_string(),
                    });
                }
            };

            if resp.status() == StatusCode::SERVICE_UNAVAILABLE {
                return Err(XsyncError::PeerNotReady(addr));
            }
            let reply: XsyncReply = resp.json().await.map_err(|e| XsyncError::Transport {
                peer: addr,
                reason: e.to_string(),
            })?;
            if reply.status != 0 {
                return Err(XsyncError::Remote {
                    peer: addr,
                    status: reply.status,
                });
            }
            return Ok(());
        }
    }

    /// Send to every peer. All peers are tried; the first error is returned.
    async fn fan_out<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<()> {
        let mut first = None;
        for addr in self.peers() {
            if let Err(e) = self.call(addr, path, body, timeout).await {
                debug!(peer = %addr, path, error = %e, "Xsync push failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Tell every peer this node is alive.
    pub async fn announce(&self) -> Result<()> {
        let hello = CtInfo {
            proto: XSYNC_PROTO.into(),
            sport: self.node_id,
            ..Default::default()
        };
        self.fan_out("ct/add", &hello, CALL_TIMEOUT).await
    }

    pub async fn push_ct_add(&self, ct: &CtInfo) -> Result<()> {
        self.fan_out("ct/add", ct, CALL_TIMEOUT).await
    }

    pub async fn push_ct_delete(&self, ct: &CtInfo) -> Result<()> {
        self.fan_out("ct/delete", ct, CALL_TIMEOUT).await
    }

    pub async fn push_block_ct_add(&self, cts: &[CtInfo]) -> Result<()> {
        self.fan_out("ct/block/add", cts, BULK_TIMEOUT).await
    }

    pub async fn push_block_ct_delete(&self, cts: &[CtInfo]) -> Result<()> {
        self.fan_out("ct/block/delete", cts, BULK_TIMEOUT).await
    }

    /// Push the whole local conntrack table to every peer.
    pub async fn push_table(&self) -> Result<()> {
        let mut cts = Vec::new();
        for map in [DpMap::Ct4, DpMap::Ct6] {
            let w = TableDpWork { map, reply: None };
            match self.dp.table_get(&w) {
                Ok(entries) => cts.extend(entries),
                Err(e) => debug!(map = ?map, error = %e, "Conntrack read failed"),
            }
        }
        cts.sort_by_key(CtInfo::key);
        cts.dedup_by(|a, b| a.key() == b.key());
        if cts.is_empty() {
            return Ok(());
        }
        debug!(count = cts.len(), "Xsync pushing table");
        self.push_block_ct_add(&cts).await
    }

    /// Ask every peer to push its full table back.
    pub async fn request_ct_get(&self) -> Result<()> {
        let req = CtGet { asynchronous: true };
        self.fan_out("ct/get", &req, CALL_TIMEOUT).await
    }
}

/// Announce this node every `period`, and ask for the peers' tables once
/// all of them have announced back.
pub fn spawn_announcer(xs: Arc<Xsync>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut synced = false;
        loop {
            interval.tick().await;
            if let Err(e) = xs.announce().await {
                debug!(error = %e, "Xsync announce failed");
            }
            if !synced && xs.in_sync() {
                synced = true;
                info!(peers = xs.peer_count(), "Xsync in sync");
                if let Err(e) = xs.request_ct_get().await {
                    warn!(error = %e, "Xsync table request failed");
                }
            }
        }
    })
}
