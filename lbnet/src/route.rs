//! Route table.
//!
//! Routes are kept in an exact-match map and mirrored into an LPM table used
//! for forwarding lookups such as tunnel reachability. Every next hop is a
//! neighbor entry; the route and the neighbor are paired so the neighbor
//! outlives the last route that uses it.

use crate::counter::Counter;
use crate::dp::{
    DpMap, DpStats, DpStatus, DpWork, DpWorkKind, DpWorkOp, RouteDpWork, StatDpWork, SyncTarget,
};
use crate::fdb::FdbKey;
use crate::lpm::LpmTable;
use crate::model::RtFlags;
use crate::zone::Zone;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// IPv4 plus IPv6 route capacity.
pub const MAX_ROUTES: u32 = (32 + 8) * 1024;

/// Route errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("route {0} exists")]
    Exists(IpNet),

    #[error("route {0}: next hop unavailable")]
    Nh(IpNet),

    #[error("no route {0}")]
    NoEnt(IpNet),

    #[error("route {0}: mark allocation failed")]
    Range(IpNet),

    #[error("route {0}: modify failed")]
    Mod(IpNet),

    #[error("route {0}: lpm entry missing")]
    TrieDel(IpNet),

    #[error("route {0}: multiple next hops not supported")]
    Ecmp(IpNet),
}

impl RouteError {
    pub fn code(&self) -> i32 {
        match self {
            RouteError::Exists(_) => -5001,
            RouteError::Nh(_) => -5002,
            RouteError::NoEnt(_) => -5003,
            RouteError::Range(_) => -5004,
            RouteError::Mod(_) => -5005,
            RouteError::TrieDel(_) => -5007,
            RouteError::Ecmp(_) => -5008,
        }
    }
}

pub type Result<T> = std::result::Result<T, RouteError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtAttr {
    pub protocol: i32,
    pub os_flags: i32,
    /// Host route of a neighbor.
    pub host_route: bool,
    /// OS index of the egress interface.
    pub ifi: i32,
    /// Route of an interface address.
    pub if_route: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtNhAttr {
    pub addr: IpAddr,
    pub link_index: i32,
}

/// What a prefix resolves to in the LPM table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtTarget {
    Neigh(IpAddr),
    /// Directly connected, by OS interface index.
    Ifi(i32),
}

/// Objects invalidated when a route goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtDep {
    Fdb(FdbKey),
}

#[derive(Debug, Clone)]
pub struct Rt {
    pub dst: IpNet,
    pub attr: RtAttr,
    pub flags: RtFlags,
    pub mark: u32,
    pub zone_num: u32,
    pub nh_attr: Vec<RtNhAttr>,
    pub next_hops: Vec<IpAddr>,
    pub deps: Vec<RtDep>,
    pub stats: DpStats,
    pub sync: DpStatus,
    in_lpm: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteDump {
    pub dst: IpNet,
    pub flags: String,
    pub gw: Vec<IpAddr>,
    pub mark: u32,
    pub protocol: i32,
    pub stats: DpStats,
    pub sync: DpStatus,
}

pub struct RouteTable {
    routes: HashMap<IpNet, Rt>,
    lpm: LpmTable<RtTarget>,
    marks: Counter,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            lpm: LpmTable::new(),
            marks: Counter::new(1, MAX_ROUTES),
        }
    }

    pub fn find(&self, dst: &IpNet) -> Option<&Rt> {
        self.routes.get(&dst.trunc())
    }

    pub(crate) fn find_mut(&mut self, dst: &IpNet) -> Option<&mut Rt> {
        self.routes.get_mut(&dst.trunc())
    }

    /// Longest prefix match.
    pub fn lookup(&self, addr: IpAddr) -> Option<(IpNet, RtTarget)> {
        self.lpm.lookup(addr).map(|(p, t)| (p, *t))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rt> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

fn is_host_prefix(dst: &IpNet) -> bool {
    dst.prefix_len() == dst.max_prefix_len()
}

impl Zone {
    fn rt_dp_work(&self, rt: &Rt, op: DpWorkOp) -> DpWork {
        let nh_marks = rt
            .next_hops
            .iter()
            .map(|ip| self.nh.find_any(*ip).map_or(u32::MAX, |n| n.mark))
            .collect();
        DpWork::new(
            op,
            self.mark,
            Some(SyncTarget::Route(rt.dst)),
            DpWorkKind::Route(RouteDpWork {
                zone_num: rt.zone_num,
                dst: rt.dst,
                rt_type: rt.flags.bits(),
                rt_mark: rt.mark,
                nh_marks,
            }),
        )
    }

    pub(crate) fn rt_dp(&mut self, dst: &IpNet, op: DpWorkOp) {
        if let Some(rt) = self.rt.find(dst) {
            let w = self.rt_dp_work(rt, op);
            self.dp.push(w);
        }
    }

    /// Add a route with at most one next hop.
    ///
    /// Routes through a gateway create a placeholder neighbor for it when
    /// needed, except host routes, whose neighbor must already exist.
    pub fn rt_add(&mut self, dst: IpNet, attr: RtAttr, nhs: Vec<RtNhAttr>) -> Result<()> {
        let dst = dst.trunc();
        if nhs.len() > 1 {
            warn!(%dst, count = nhs.len(), "Route add: multipath rejected");
            return Err(RouteError::Ecmp(dst));
        }

        if let Some(rt) = self.rt.routes.get_mut(&dst) {
            let modified = rt.nh_attr.len() != nhs.len()
                || rt.nh_attr.iter().zip(&nhs).any(|(a, b)| a.addr != b.addr);
            if modified {
                if self.rt_delete(dst).is_err() {
                    warn!(%dst, "Route add: delete on modify failed");
                    return Err(RouteError::Mod(dst));
                }
                return self.rt_add(dst, attr, nhs);
            }

            if !rt.attr.if_route && attr.if_route && rt.attr.host_route {
                rt.attr.if_route = true;
                rt.flags.insert(RtFlags::INTF);
                info!(%dst, "Route updated to interface route");
                return Ok(());
            }
            if !rt.attr.host_route && attr.host_route && rt.attr.if_route {
                rt.attr.host_route = true;
                rt.flags.insert(RtFlags::HOST);
                info!(%dst, "Route updated to host route");
                return Ok(());
            }
            debug!(%dst, "Route add: exists");
            return Err(RouteError::Exists(dst));
        }

        let mark = self.rt.marks.get().map_err(|e| {
            warn!(%dst, error = %e, "Route add: mark allocation failed");
            RouteError::Range(dst)
        })?;

        let mut flags = RtFlags::empty();
        let mut next_hops = Vec::with_capacity(nhs.len());
        if nhs.is_empty() {
            flags.insert(RtFlags::SELF);
        } else {
            flags.insert(RtFlags::IND);
            if attr.host_route {
                flags.insert(RtFlags::HOST);
            }
            if attr.if_route {
                flags.insert(RtFlags::INTF);
            }

            for nh in &nhs {
                if self.nh.find(nh.addr).is_none() {
                    if attr.host_route && !attr.if_route {
                        let _ = self.rt.marks.put(mark);
                        warn!(%dst, nh = %nh.addr, "Route add: host route without neighbor");
                        return Err(RouteError::Nh(dst));
                    }
                    let placeholder = crate::neighbor::NeighAttr {
                        os_link: nh.link_index,
                        ..Default::default()
                    };
                    if let Err(e) = self.neigh_add(nh.addr, placeholder) {
                        debug!(%dst, nh = %nh.addr, error = %e, "Route add: neighbor placeholder");
                    }
                    if self.nh.find(nh.addr).is_none() {
                        let _ = self.rt.marks.put(mark);
                        warn!(%dst, nh = %nh.addr, "Route add: no neighbor");
                        return Err(RouteError::Nh(dst));
                    }
                }
                next_hops.push(nh.addr);
            }
        }

        let target = match next_hops.first() {
            Some(ip) => RtTarget::Neigh(*ip),
            None => RtTarget::Ifi(attr.ifi),
        };
        let in_lpm = !is_host_prefix(&dst) || !self.rules.is_vip(dst.addr());
        if in_lpm {
            self.rt.lpm.insert(dst, target);
        }

        self.rt.routes.insert(
            dst,
            Rt {
                dst,
                attr,
                flags,
                mark,
                zone_num: self.mark,
                nh_attr: nhs,
                next_hops: next_hops.clone(),
                deps: Vec::new(),
                stats: DpStats::default(),
                sync: DpStatus::Ok,
                in_lpm,
            },
        );

        for nh in &next_hops {
            self.neigh_pair_rt(*nh, dst);
        }

        self.rt_dp(&dst, DpWorkOp::Create);
        debug!(%dst, mark, flags = %flags, "Route added");
        Ok(())
    }

    /// Invalidate objects that resolved through this route.
    fn rt_clear_deps(&mut self, dst: &IpNet) {
        let deps = match self.rt.find_mut(dst) {
            Some(rt) => std::mem::take(&mut rt.deps),
            None => return,
        };
        for dep in deps {
            match dep {
                RtDep::Fdb(key) => {
                    let was_reachable = match self.l2.find_mut(&key) {
                        Some(f) => {
                            let was = !f.unreach;
                            f.tun.rt = None;
                            f.tun.nh = None;
                            f.unreach = true;
                            was
                        }
                        None => false,
                    };
                    if was_reachable {
                        self.fdb_dp(&key, DpWorkOp::Remove);
                    }
                    debug!(%dst, fdb = %key, "Route dependent invalidated");
                }
            }
        }
    }

    fn rt_delete_common(&mut self, dst: IpNet, host: bool) -> Result<()> {
        let dst = dst.trunc();
        let Some(rt) = self.rt.routes.get_mut(&dst) else {
            debug!(%dst, "Route delete: not found");
            return Err(RouteError::NoEnt(dst));
        };

        if host {
            if !rt.attr.host_route {
                return Err(RouteError::NoEnt(dst));
            }
            if rt.attr.if_route {
                rt.attr.host_route = false;
                rt.flags.remove(RtFlags::HOST);
                debug!(%dst, "Route reverted to interface route");
                return Ok(());
            }
        } else if rt.attr.host_route && rt.attr.if_route {
            rt.attr.if_route = false;
            rt.flags.remove(RtFlags::INTF);
            debug!(%dst, "Route reverted to host route");
            return Ok(());
        }

        // Next-hop marks are read before the neighbors may go away
        let work = match self.rt.find(&dst) {
            Some(rt) => self.rt_dp_work(rt, DpWorkOp::Remove),
            None => return Err(RouteError::NoEnt(dst)),
        };

        self.rt_clear_deps(&dst);

        let Some(rt) = self.rt.routes.remove(&dst) else {
            return Err(RouteError::NoEnt(dst));
        };
        if rt.in_lpm && self.rt.lpm.remove(&dst).is_none() {
            warn!(%dst, "Route delete: lpm entry missing");
        }
        if let Err(e) = self.rt.marks.put(rt.mark) {
            warn!(%dst, error = %e, "Route delete: mark release failed");
        }
        self.dp.push(work);

        // The route is gone before its neighbors are released, a neighbor
        // may delete its own host route when unpaired
        for nh in rt.next_hops {
            self.neigh_unpair_rt(nh, &dst);
        }
        debug!(%dst, "Route deleted");
        Ok(())
    }

    pub fn rt_delete(&mut self, dst: IpNet) -> Result<()> {
        self.rt_delete_common(dst, false)
    }

    /// Delete the host route of a neighbor.
    pub fn rt_delete_host(&mut self, dst: IpNet) -> Result<()> {
        self.rt_delete_common(dst, true)
    }

    /// Delete gateway routes whose next hop sits behind `port`.
    pub fn rt_delete_by_port(&mut self, port: &str) {
        let doomed: Vec<IpNet> = self
            .rt
            .iter()
            .filter(|rt| !rt.attr.host_route)
            .filter(|rt| {
                rt.next_hops.iter().any(|nh| {
                    self.nh
                        .find_any(*nh)
                        .is_some_and(|n| n.oif.as_deref() == Some(port))
                })
            })
            .map(|rt| rt.dst)
            .collect();
        for dst in doomed {
            if let Err(e) = self.rt_delete(dst) {
                debug!(%dst, port, error = %e, "Route delete by port");
            }
        }
    }

    /// Request statistics and re-push failed routes.
    pub fn rt_ticker(&mut self) {
        let routes: Vec<(IpNet, u32, DpStatus)> =
            self.rt.iter().map(|r| (r.dst, r.mark, r.sync)).collect();
        for (dst, mark, sync) in routes {
            if sync != DpStatus::Ok {
                debug!(%dst, ?sync, "Route resync");
                self.rt_dp(&dst, DpWorkOp::Create);
            }
            self.dp.push(DpWork::new(
                DpWorkOp::StatsGet,
                self.mark,
                Some(SyncTarget::RouteStats(dst)),
                DpWorkKind::Stat(StatDpWork {
                    map: DpMap::Rt4,
                    mark,
                }),
            ));
        }
    }

    pub fn routes_get(&self) -> Vec<RouteDump> {
        self.rt
            .iter()
            .map(|r| RouteDump {
                dst: r.dst,
                flags: r.flags.to_string(),
                gw: r.next_hops.clone(),
                mark: r.mark,
                protocol: r.attr.protocol,
                stats: r.stats,
                sync: r.sync,
            })
            .collect()
    }

    pub fn rt_destruct_all(&mut self) {
        let all: Vec<IpNet> = self.rt.iter().map(|r| r.dst).collect();
        for dst in all {
            if self.rt.find(&dst).is_some()
                && let Err(e) = self.rt_delete(dst)
            {
                debug!(%dst, error = %e, "Route destruct");
            }
        }
        // Host routes revert to a plain route on the first delete
        let left: Vec<IpNet> = self.rt.iter().map(|r| r.dst).collect();
        for dst in left {
            let _ = self.rt_delete(dst);
        }
    }
}
