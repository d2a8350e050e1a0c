//! Layer 2 forwarding database.
//!
//! Entries map a MAC within a bridge domain to an egress port. Entries on a
//! VXLAN bridge are tunnel entries: they carry the remote VTEP address and
//! are only programmed while a route to that address exists and its next hop
//! is resolved. Reachability is re-evaluated on every tick and the datapath
//! is only touched when it flips.

use crate::dp::{DpStatus, DpWork, DpWorkKind, DpWorkOp, L2AddrDpWork, RouterMacDpWork, SyncTarget};
use crate::model::{MacAddr, PortKind, TunnelType};
use crate::port::PortEvent;
use crate::route::{RtDep, RtTarget};
use crate::zone::Zone;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FdbKey {
    pub mac: MacAddr,
    /// Bridge domain.
    pub bd: u32,
}

impl FdbKey {
    pub fn new(mac: MacAddr, bd: u32) -> Self {
        Self { mac, bd }
    }
}

impl fmt::Display for FdbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mac, self.bd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FdbType {
    #[default]
    Phy,
    Tun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdbAttr {
    pub oif: String,
    /// Remote tunnel endpoint of a tunnel entry.
    pub dst: Option<IpAddr>,
    pub kind: FdbType,
}

/// FDB errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FdbError {
    #[error("fdb entry {0} exists")]
    Same(FdbKey),

    #[error("fdb egress port {0} not found")]
    Oif(String),

    #[error("no fdb entry {0}")]
    NoEnt(FdbKey),

    #[error("fdb entry {key}: {reason}")]
    TunAttr { key: FdbKey, reason: &'static str },
}

impl FdbError {
    pub fn code(&self) -> i32 {
        match self {
            FdbError::Same(_) => -3001,
            FdbError::Oif(_) => -3002,
            FdbError::NoEnt(_) => -3003,
            FdbError::TunAttr { .. } => -3004,
        }
    }
}

pub type Result<T> = std::result::Result<T, FdbError>;

/// Tunnel resolution state of an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdbTun {
    pub rt: Option<IpNet>,
    pub nh: Option<IpAddr>,
    /// Mark of the tunnel endpoint on `nh`.
    pub ep: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FdbEnt {
    pub key: FdbKey,
    pub attr: FdbAttr,
    /// Port the entry is currently bound to.
    pub port: String,
    pub tun: FdbTun,
    pub unreach: bool,
    pub inactive: bool,
    pub sync: DpStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct FdbDump {
    pub mac: MacAddr,
    pub bd: u32,
    pub dev: String,
    pub dst: Option<IpAddr>,
    pub kind: FdbType,
    pub reachable: bool,
    pub sync: DpStatus,
}

#[derive(Debug, Default)]
pub struct FdbTable {
    fdbs: HashMap<FdbKey, FdbEnt>,
}

impl FdbTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, key: &FdbKey) -> Option<&FdbEnt> {
        self.fdbs.get(key)
    }

    pub(crate) fn find_mut(&mut self, key: &FdbKey) -> Option<&mut FdbEnt> {
        self.fdbs.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FdbEnt> {
        self.fdbs.values()
    }

    pub fn len(&self) -> usize {
        self.fdbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fdbs.is_empty()
    }
}

enum FdbDpPlan {
    Push(Vec<DpWork>),
    Fail(DpStatus),
    Skip,
}

impl Zone {
    /// Resolve the tunnel next hop of a tunnel entry.
    ///
    /// Returns whether the entry is unreachable.
    pub(crate) fn fdb_resolve_nh(&mut self, key: &FdbKey) -> bool {
        let Some(f) = self.l2.find(key) else {
            return true;
        };
        let Some(p) = self.ports.find(&f.port) else {
            return true;
        };
        if !p.kind().contains(PortKind::VXLAN_BR) {
            return false;
        }
        let tun_id = p.hw.tun_id;

        if f.attr.kind != FdbType::Tun {
            debug!(fdb = %key, "Tunnel fdb: not a tunnel entry");
            return true;
        }
        let Some(dst @ IpAddr::V4(_)) = f.attr.dst else {
            debug!(fdb = %key, "Tunnel fdb: IPv4 remote required");
            return true;
        };

        let Some((prefix, target)) = self.rt.lookup(dst) else {
            debug!(fdb = %key, %dst, "Tunnel fdb: no route");
            return true;
        };
        let RtTarget::Neigh(nh_ip) = target else {
            debug!(fdb = %key, %dst, "Tunnel fdb: remote is directly connected");
            return true;
        };
        let Some(nh) = self.nh.find(nh_ip) else {
            return true;
        };
        if nh.dummy || !nh.resolved {
            trace!(fdb = %key, nh = %nh_ip, "Tunnel fdb: next hop unresolved");
            return true;
        }
        if self.rt.find(&prefix).is_none() {
            return true;
        }

        let ep = match self.neigh_add_tun_ep(nh_ip, dst, None, tun_id, TunnelType::Vxlan, true) {
            Ok(mark) => mark,
            Err(e) => {
                debug!(fdb = %key, error = %e, "Tunnel fdb: no tunnel endpoint");
                return true;
            }
        };

        if let Some(rt) = self.rt.find_mut(&prefix) {
            let dep = RtDep::Fdb(key.clone());
            if !rt.deps.contains(&dep) {
                rt.deps.push(dep);
            }
        }
        if let Some(f) = self.l2.find_mut(key) {
            f.tun = FdbTun {
                rt: Some(prefix),
                nh: Some(nh_ip),
                ep: Some(ep),
            };
        }
        false
    }

    /// Add a forwarding entry, replacing one with different attributes.
    pub fn fdb_add(&mut self, key: FdbKey, attr: FdbAttr) -> Result<()> {
        let port = match self.ports.find(&attr.oif) {
            Some(p) if p.is_active() => p.name.clone(),
            _ => {
                debug!(port = %attr.oif, "Fdb add: port not found");
                return Err(FdbError::Oif(attr.oif));
            }
        };

        if let Some(f) = self.l2.find(&key) {
            if f.attr == attr {
                debug!(fdb = %key, "Fdb add: exists");
                return Err(FdbError::Same(key));
            }
            self.fdb_remove(&key);
        }

        let tunnel = self
            .ports
            .find(&port)
            .is_some_and(|p| p.kind().contains(PortKind::VXLAN_BR));

        self.l2.fdbs.insert(
            key.clone(),
            FdbEnt {
                key: key.clone(),
                attr,
                port,
                tun: FdbTun::default(),
                unreach: false,
                inactive: false,
                sync: DpStatus::Ok,
            },
        );

        if tunnel {
            let unreach = self.fdb_resolve_nh(&key);
            if let Some(f) = self.l2.find_mut(&key) {
                f.unreach = unreach;
            }
        }

        self.fdb_dp(&key, DpWorkOp::Create);
        debug!(
            fdb = %key,
            reachable = !self.l2.find(&key).is_some_and(|f| f.unreach),
            "Fdb added"
        );
        Ok(())
    }

    pub fn fdb_del(&mut self, key: &FdbKey) -> Result<()> {
        if self.l2.find(key).is_none() {
            debug!(fdb = %key, "Fdb delete: not found");
            return Err(FdbError::NoEnt(key.clone()));
        }
        self.fdb_remove(key);
        Ok(())
    }

    fn fdb_remove(&mut self, key: &FdbKey) {
        let Some(f) = self.l2.find(key) else {
            return;
        };
        let rt = f.tun.rt;

        if let Some(dst) = rt
            && let Some(r) = self.rt.find_mut(&dst)
        {
            r.deps.retain(|d| !matches!(d, RtDep::Fdb(k) if k == key));
        }

        self.fdb_dp(key, DpWorkOp::Remove);
        if let Some(mut f) = self.l2.fdbs.remove(key) {
            f.inactive = true;
            f.tun = FdbTun::default();
        }
        debug!(fdb = %key, "Fdb deleted");
    }

    fn fdb_dp_plan(&self, key: &FdbKey, op: DpWorkOp) -> FdbDpPlan {
        let Some(f) = self.l2.find(key) else {
            return FdbDpPlan::Skip;
        };
        if op == DpWorkOp::Create && f.unreach {
            return FdbDpPlan::Skip;
        }
        let Some(p) = self.ports.find(&f.port) else {
            return FdbDpPlan::Fail(DpStatus::UnknownErr);
        };
        if p.l2.vid != key.bd {
            debug!(fdb = %key, vid = p.l2.vid, "Fdb: bridge domain mismatch");
            return FdbDpPlan::Fail(DpStatus::CreateErr);
        }

        let tunnel = p.kind().contains(PortKind::VXLAN_BR);
        let real = self.ports.real_of(p);
        let tagged = !p.l2.is_pvid;
        let port_num = match (tagged, real) {
            (false, _) => p.port_no,
            (true, Some(rp)) => rp.port_no,
            (true, None) => return FdbDpPlan::Fail(DpStatus::UnknownErr),
        };
        let nh_num = f
            .tun
            .nh
            .and_then(|ip| self.nh.find_any(ip))
            .map_or(0, |n| n.mark);

        let mut works = vec![DpWork::new(
            op,
            self.mark,
            Some(SyncTarget::Fdb(key.clone())),
            DpWorkKind::L2Addr(L2AddrDpWork {
                l2_addr: key.mac,
                tun: tunnel.then_some(TunnelType::Vxlan),
                nh_num,
                port_num,
                bd: p.l2.vid,
                tagged,
            }),
        )];

        if tunnel {
            let (Some(up), Some(ep)) = (real, f.tun.ep) else {
                return FdbDpPlan::Fail(DpStatus::UnknownErr);
            };
            works.push(DpWork::new(
                op,
                self.mark,
                None,
                DpWorkKind::RouterMac(RouterMacDpWork {
                    l2_addr: key.mac,
                    port_num: up.port_no,
                    bd: p.l2.vid,
                    tun_id: p.hw.tun_id,
                    tun_type: Some(TunnelType::Vxlan),
                    nh_num: ep,
                }),
            ));
        }
        FdbDpPlan::Push(works)
    }

    pub(crate) fn fdb_dp(&mut self, key: &FdbKey, op: DpWorkOp) {
        match self.fdb_dp_plan(key, op) {
            FdbDpPlan::Push(works) => {
                for w in works {
                    self.dp.push(w);
                }
            }
            FdbDpPlan::Fail(status) => {
                if let Some(f) = self.l2.find_mut(key) {
                    f.sync = status;
                }
            }
            FdbDpPlan::Skip => {}
        }
    }

    /// Rebind, collect or re-resolve entries.
    ///
    /// An entry whose port no longer sits in its bridge domain waits for the
    /// port to come back there.
    pub fn fdb_ticker(&mut self) {
        let keys: Vec<FdbKey> = self.l2.fdbs.keys().cloned().collect();
        for key in keys {
            let Some(f) = self.l2.find(&key) else {
                continue;
            };
            let port = self.ports.find(&f.port);
            let bound = port.is_some_and(|p| p.l2.vid == key.bd);

            if !bound {
                let oif = f.attr.oif.clone();
                let Some(p) = self.ports.find(&oif).filter(|p| p.is_active()) else {
                    continue;
                };
                if p.l2.vid != key.bd {
                    trace!(fdb = %key, "Fdb: bridge domain mismatch");
                    continue;
                }
                debug!(fdb = %key, port = %oif, "Fdb: port rebound");
                if let Some(f) = self.l2.find_mut(&key) {
                    f.port = oif;
                    f.sync = DpStatus::CreateErr;
                }
            } else if port.is_some_and(|p| !p.is_active()) {
                self.fdb_remove(&key);
            } else if f.unreach {
                let unreach = self.fdb_resolve_nh(&key);
                if !unreach {
                    if let Some(f) = self.l2.find_mut(&key) {
                        f.unreach = false;
                    }
                    debug!(fdb = %key, "Fdb: tunnel reachable");
                    self.fdb_dp(&key, DpWorkOp::Create);
                }
            } else if f.sync != DpStatus::Ok {
                self.fdb_dp(&key, DpWorkOp::Create);
            }
        }
    }

    /// Drop every entry whose egress is the affected port.
    pub(crate) fn fdb_port_event(&mut self, name: &str, event: PortEvent) {
        let keys: Vec<FdbKey> = self
            .l2
            .iter()
            .filter(|f| f.attr.oif == name)
            .map(|f| f.key.clone())
            .collect();
        if !keys.is_empty() {
            debug!(port = name, ?event, count = keys.len(), "Fdb: purging entries");
        }
        for key in keys {
            self.fdb_remove(&key);
        }
    }

    pub fn fdbs_get(&self) -> Vec<FdbDump> {
        self.l2
            .iter()
            .map(|f| FdbDump {
                mac: f.key.mac,
                bd: f.key.bd,
                dev: f.attr.oif.clone(),
                dst: f.attr.dst,
                kind: f.attr.kind,
                reachable: !f.unreach,
                sync: f.sync,
            })
            .collect()
    }

    pub fn fdb_destruct_all(&mut self) {
        let keys: Vec<FdbKey> = self.l2.fdbs.keys().cloned().collect();
        for key in keys {
            self.fdb_remove(&key);
        }
        if !self.l2.is_empty() {
            warn!(left = self.l2.len(), "Fdb destruct incomplete");
        }
    }
}
