//! Datapath interface.
//!
//! Every table mutation is translated into a typed [`DpWork`] item and queued
//! on a bounded channel. The [`broker::DpBroker`] thread drains the channel,
//! hands each item to a [`Datapath`] implementation and reports the outcome
//! as a [`DpCompletion`] which the owning zone folds back into the object's
//! `sync` status.

pub mod broker;
pub mod ct;
pub mod stub;
pub mod work;

use crate::fdb::FdbKey;
use crossbeam_channel::{Receiver, Sender, bounded};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;
use tracing::warn;

pub use broker::DpBroker;
pub use ct::CtInfo;
pub use stub::StubDatapath;
pub use work::*;

/// Verb carried by a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DpWorkOp {
    Create = 1,
    Remove = 2,
    Change = 3,
    StatsGet = 4,
    StatsClear = 5,
    TableGet = 6,
}

/// Asynchronous completion status of a datapath request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DpStatus {
    #[default]
    Ok = 0,
    CreateErr = 1,
    RemoveErr = 2,
    ChangeErr = 3,
    UnknownErr = 4,
    InProgress = 5,
}

impl DpStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == DpStatus::Ok
    }

    /// Status to record when the datapath rejected `op`.
    pub fn failed(op: DpWorkOp) -> Self {
        match op {
            DpWorkOp::Create => DpStatus::CreateErr,
            DpWorkOp::Remove => DpStatus::RemoveErr,
            DpWorkOp::Change => DpStatus::ChangeErr,
            _ => DpStatus::UnknownErr,
        }
    }
}

/// Datapath errors.
#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("datapath work queue closed")]
    QueueClosed,

    #[error("failed to spawn datapath broker: {0}")]
    Spawn(String),

    #[error("unsupported datapath request: {0}")]
    Unsupported(String),

    #[error("table read failed: {0}")]
    Table(String),
}

impl DatapathError {
    pub fn code(&self) -> i32 {
        match self {
            DatapathError::QueueClosed => -9001,
            DatapathError::Spawn(_) => -9002,
            DatapathError::Unsupported(_) => -9003,
            DatapathError::Table(_) => -9004,
        }
    }
}

pub type Result<T> = std::result::Result<T, DatapathError>;

/// Forwarding-engine maps that can be queried for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DpMap {
    Ct4,
    Ct6,
    Nat4,
    Bd,
    RxBd,
    TxBd,
    Rt4,
    Ulcl,
    Ipol,
    Fw4,
}

/// Packet and byte counters read back from the forwarding engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DpStats {
    pub packets: u64,
    pub bytes: u64,
    pub drops: u64,
}

/// The in-memory object a work item reports back to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncTarget {
    Port(String),
    VlanStats { vid: u32, tx: bool },
    Fdb(FdbKey),
    Ifa(String),
    Neigh(IpAddr),
    TunEp { neigh: IpAddr, mark: u32 },
    Route(IpNet),
    RouteStats(IpNet),
    NatRule(u32),
    NatStats { mark: u32, ep: usize },
    FwRule(u32),
    Mirror(String),
    Policer(String),
    PolicerStats(String),
    UlCl { user: String, addr: IpAddr, uplink: bool },
    UlClStats { user: String, addr: IpAddr, uplink: bool },
}

/// Outcome of a processed work item, routed to the zone by `zone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpCompletion {
    pub zone: u32,
    pub target: SyncTarget,
    pub status: DpStatus,
    pub stats: Option<DpStats>,
}

/// The forwarding engine.
///
/// Object methods return `0` on success and a non-zero engine status
/// otherwise; the broker turns a failure into the matching [`DpStatus`].
pub trait Datapath: Send + Sync {
    fn port_add(&self, w: &PortDpWork) -> i32;
    fn port_del(&self, w: &PortDpWork) -> i32;
    fn l2_addr_add(&self, w: &L2AddrDpWork) -> i32;
    fn l2_addr_del(&self, w: &L2AddrDpWork) -> i32;
    fn router_mac_add(&self, w: &RouterMacDpWork) -> i32;
    fn router_mac_del(&self, w: &RouterMacDpWork) -> i32;
    fn next_hop_add(&self, w: &NextHopDpWork) -> i32;
    fn next_hop_del(&self, w: &NextHopDpWork) -> i32;
    fn route_add(&self, w: &RouteDpWork) -> i32;
    fn route_del(&self, w: &RouteDpWork) -> i32;
    fn nat_lb_add(&self, w: &NatDpWork) -> i32;
    fn nat_lb_del(&self, w: &NatDpWork) -> i32;
    fn fw_add(&self, w: &FwDpWork) -> i32;
    fn fw_del(&self, w: &FwDpWork) -> i32;
    fn pol_add(&self, w: &PolDpWork) -> i32;
    fn pol_del(&self, w: &PolDpWork) -> i32;
    fn mirr_add(&self, w: &MirrDpWork) -> i32;
    fn mirr_del(&self, w: &MirrDpWork) -> i32;
    fn ul_cl_add(&self, w: &UlClDpWork) -> i32;
    fn ul_cl_del(&self, w: &UlClDpWork) -> i32;

    /// Read counters for one entry of a map.
    fn stat_get(&self, w: &StatDpWork) -> Option<DpStats>;
    /// Reset counters for one entry of a map.
    fn stat_clear(&self, w: &StatDpWork) -> i32;
    /// Dump the connection-tracking table.
    fn table_get(&self, w: &TableDpWork) -> Result<Vec<CtInfo>>;

    /// Install a replicated connection-tracking entry.
    fn ct_add(&self, ct: &CtInfo) -> i32;
    /// Remove a replicated connection-tracking entry.
    fn ct_del(&self, ct: &CtInfo) -> i32;
    /// Ask the engine to push its full table to peers.
    fn ct_get_async(&self);
}

/// Producer side of the work queue.
///
/// `push` blocks while the queue is full.
#[derive(Debug, Clone)]
pub struct DpHandle {
    tx: Sender<DpWork>,
}

impl DpHandle {
    pub fn new(tx: Sender<DpWork>) -> Self {
        Self { tx }
    }

    /// A handle whose queue is read directly by the caller.
    pub fn channel(len: usize) -> (Self, Receiver<DpWork>) {
        let (tx, rx) = bounded(len);
        (Self { tx }, rx)
    }

    pub fn push(&self, work: DpWork) {
        if let Err(e) = self.tx.send(work) {
            warn!(kind = e.0.kind.name(), "Datapath queue closed, dropping work");
        }
    }
}
