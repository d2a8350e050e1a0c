//! Neighbor table.
//!
//! A neighbor maps an IP address to a MAC behind a port. Each neighbor gets a
//! hardware mark and a host route, and neighbors on physical ports also get a
//! matching FDB entry.
//!
//! Neighbors behind a VXLAN bridge resolve recursively:
//!
//! ```text
//! neighbor -> tunnel fdb -> route to VTEP -> underlay neighbor -> tunnel endpoint
//! ```
//!
//! The mark of the tunnel endpoint at the end of that chain is what the
//! datapath actually forwards to. Resolution is re-run on every tick so a
//! change anywhere along the chain propagates.
//!
//! A neighbor that routes still point at is never withdrawn from the
//! datapath. Deleting it only deactivates it; the last route to let go
//! removes it for good.

use crate::counter::Counter;
use crate::dp::{DpStatus, DpWork, DpWorkKind, DpWorkOp, NextHopDpWork, SyncTarget};
use crate::fdb::{FdbAttr, FdbError, FdbKey, FdbType};
use crate::model::{MacAddr, NhType, PortKind, TunnelType};
use crate::port::PortEvent;
use crate::route::{RouteError, RtAttr, RtNhAttr};
use crate::zone::Zone;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub const MAX_SYS_NEIGH: u32 = 2 * 1024;
pub const MAX_TUNNEL_NEIGH: u32 = 1024;
pub const MAX_SYS_NEIGH6: u32 = 1024;

/// MAC used for neighbors on L3 tunnel devices.
const L3_TUN_MAC: MacAddr = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

/// Neighbor errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NeighError {
    #[error("neighbor {0} exists")]
    Exists(IpAddr),

    #[error("neighbor {0}: egress port not found")]
    Oif(IpAddr),

    #[error("no neighbor {0}")]
    NoEnt(IpAddr),

    #[error("neighbor {0}: mark allocation failed")]
    Range(IpAddr),

    #[error("neighbor {0}: host route failed")]
    HostRt(IpAddr),

    #[error("neighbor {0}: fdb pair failed")]
    Mac(IpAddr),

    #[error("neighbor {addr}: tunnel endpoint: {reason}")]
    Tun { addr: IpAddr, reason: &'static str },
}

impl NeighError {
    pub fn code(&self) -> i32 {
        match self {
            NeighError::Exists(_) => -4001,
            NeighError::Oif(_) => -4002,
            NeighError::NoEnt(_) => -4003,
            NeighError::Range(_) => -4004,
            NeighError::HostRt(_) => -4005,
            NeighError::Mac(_) => -4006,
            NeighError::Tun { .. } => -4007,
        }
    }
}

pub type Result<T> = std::result::Result<T, NeighError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighAttr {
    /// OS index of the egress port.
    pub os_link: i32,
    /// All zero while unresolved.
    #[serde(default)]
    pub mac: MacAddr,
}

/// Tunnel endpoint riding on a neighbor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighTunEp {
    pub sip: IpAddr,
    pub rip: IpAddr,
    pub tun_id: u32,
    pub tun_type: TunnelType,
    pub mark: u32,
    pub sync: DpStatus,
}

#[derive(Debug, Clone)]
pub struct Neigh {
    pub addr: IpAddr,
    pub mac: MacAddr,
    pub os_link: i32,
    /// Added before its port was known; retried by the ticker.
    pub dummy: bool,
    pub inactive: bool,
    pub resolved: bool,
    pub mark: u32,
    /// Mark of the tunnel endpoint carrying a recursive neighbor.
    pub rmark: u32,
    pub rec_nh: Option<IpAddr>,
    /// Tunnel fdb entry a recursive neighbor resolved through.
    pub tfdb: Option<FdbKey>,
    pub tun_eps: Vec<NeighTunEp>,
    pub kind: NhType,
    pub sync: DpStatus,
    /// Egress port name.
    pub oif: Option<String>,
    /// Routes using this neighbor as next hop.
    pub rtm: BTreeSet<IpNet>,
}

impl Neigh {
    fn dummy(addr: IpAddr, attr: NeighAttr) -> Self {
        Self {
            addr,
            mac: attr.mac,
            os_link: attr.os_link,
            dummy: true,
            inactive: true,
            resolved: false,
            mark: 0,
            rmark: 0,
            rec_nh: None,
            tfdb: None,
            tun_eps: Vec::new(),
            kind: NhType::empty(),
            sync: DpStatus::Ok,
            oif: None,
            rtm: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NeighDump {
    pub ip: IpAddr,
    pub mac: MacAddr,
    pub link_index: i32,
    pub resolved: bool,
    pub mark: u32,
    pub sync: DpStatus,
}

pub struct NeighTable {
    neighs: HashMap<IpAddr, Neigh>,
    v4_marks: Counter,
    v6_marks: Counter,
    tun_marks: Counter,
}

impl NeighTable {
    pub fn new() -> Self {
        Self {
            neighs: HashMap::new(),
            v4_marks: Counter::new(1, MAX_SYS_NEIGH),
            tun_marks: Counter::new(MAX_SYS_NEIGH + 1, MAX_TUNNEL_NEIGH),
            v6_marks: Counter::new(MAX_SYS_NEIGH + MAX_TUNNEL_NEIGH + 1, MAX_SYS_NEIGH6),
        }
    }

    fn marks(&mut self, addr: IpAddr) -> &mut Counter {
        if addr.is_ipv4() {
            &mut self.v4_marks
        } else {
            &mut self.v6_marks
        }
    }

    /// Active neighbor.
    pub fn find(&self, addr: IpAddr) -> Option<&Neigh> {
        self.neighs.get(&addr).filter(|n| !n.inactive)
    }

    /// Neighbor including inactive and deferred ones.
    pub fn find_any(&self, addr: IpAddr) -> Option<&Neigh> {
        self.neighs.get(&addr)
    }

    pub(crate) fn find_any_mut(&mut self, addr: IpAddr) -> Option<&mut Neigh> {
        self.neighs.get_mut(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neigh> {
        self.neighs.values()
    }

    pub fn len(&self) -> usize {
        self.neighs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighs.is_empty()
    }
}

impl Default for NeighTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Zone {
    fn neigh_dp_work(&self, n: &Neigh, op: DpWorkOp) -> DpWork {
        let port = n.oif.as_deref().and_then(|o| self.ports.find(o));
        let mut resolved = n.resolved;
        let mut nnh_num = 0;
        if n.kind.contains(NhType::RECURSIVE) {
            let ep = n
                .tfdb
                .as_ref()
                .and_then(|k| self.l2.find(k))
                .and_then(|f| f.tun.ep);
            if ep.is_some() || port.is_some_and(|p| p.kind().is_l3_tunnel()) {
                nnh_num = n.rmark;
            } else {
                resolved = false;
            }
        }

        DpWork::new(
            op,
            self.mark,
            Some(SyncTarget::Neigh(n.addr)),
            DpWorkKind::NextHop(NextHopDpWork {
                tun_nh: false,
                tun_id: 0,
                tun_type: None,
                rip: None,
                sip: None,
                nnh_num,
                nh_num: n.mark,
                resolved,
                dst_mac: n.mac,
                src_mac: port.map_or(MacAddr::ZERO, |p| p.hw.mac),
                bd: port.map_or(0, |p| p.l2.vid),
            }),
        )
    }

    fn tun_ep_dp_work(&self, n: &Neigh, ep: &NeighTunEp, op: DpWorkOp) -> DpWork {
        let port = n.oif.as_deref().and_then(|o| self.ports.find(o));
        let l2 = ep.tun_id != 0 || ep.tun_type == TunnelType::IpIp;
        DpWork::new(
            op,
            self.mark,
            Some(SyncTarget::TunEp {
                neigh: n.addr,
                mark: ep.mark,
            }),
            DpWorkKind::NextHop(NextHopDpWork {
                tun_nh: true,
                tun_id: ep.tun_id,
                tun_type: Some(ep.tun_type),
                rip: Some(ep.rip),
                sip: Some(ep.sip),
                nnh_num: 0,
                nh_num: ep.mark,
                resolved: n.resolved,
                dst_mac: if l2 { n.mac } else { MacAddr::ZERO },
                src_mac: port.filter(|_| l2).map_or(MacAddr::ZERO, |p| p.hw.mac),
                bd: port.filter(|_| l2).map_or(0, |p| p.l2.vid),
            }),
        )
    }

    pub(crate) fn neigh_dp(&mut self, addr: IpAddr, op: DpWorkOp) {
        let Some(n) = self.nh.find_any(addr) else {
            return;
        };
        if n.dummy {
            return;
        }
        let w = self.neigh_dp_work(n, op);
        self.dp.push(w);
    }

    fn tun_ep_dp(&mut self, addr: IpAddr, mark: u32, op: DpWorkOp) {
        let Some(n) = self.nh.find_any(addr) else {
            return;
        };
        let Some(ep) = n.tun_eps.iter().find(|e| e.mark == mark) else {
            return;
        };
        let w = self.tun_ep_dp_work(n, ep, op);
        self.dp.push(w);
    }

    /// Re-evaluate resolution of a neighbor, following tunnel fdb entries.
    ///
    /// Returns whether anything the datapath sees changed.
    pub fn neigh_recursive_resolve(&mut self, addr: IpAddr) -> bool {
        let Some(n) = self.nh.find_any(addr) else {
            return false;
        };
        let Some(port) = n.oif.as_deref().and_then(|o| self.ports.find(o)) else {
            return false;
        };

        let mut resolved = !n.mac.is_zero();
        let mut rmark = n.rmark;
        let mut tfdb = n.tfdb.clone();
        let mut kind = n.kind;

        if let Some(key) = &tfdb
            && self.l2.find(key).is_none_or(|f| f.inactive || f.unreach)
        {
            resolved = false;
            kind.remove(NhType::RECURSIVE);
            tfdb = None;
            rmark = 0;
        }

        if resolved && !port.kind().is_l3_tunnel() {
            let key = FdbKey::new(n.mac, port.l2.vid);
            match self.l2.find(&key) {
                None => {
                    if self.ports.has_tun_slaves(&port.name, PortKind::VXLAN_SIF) {
                        tfdb = None;
                        resolved = false;
                        rmark = 0;
                    }
                }
                Some(f) if f.attr.kind == FdbType::Tun => match f.tun.ep {
                    Some(ep) if !f.unreach => {
                        tfdb = Some(key);
                        rmark = ep;
                        kind.insert(NhType::RECURSIVE);
                    }
                    _ => {
                        resolved = false;
                        rmark = 0;
                    }
                },
                Some(_) => {}
            }
        }

        let changed = resolved != n.resolved || rmark != n.rmark || tfdb != n.tfdb;
        let rec_nh = tfdb
            .as_ref()
            .and_then(|k| self.l2.find(k))
            .and_then(|f| f.tun.nh);

        if let Some(n) = self.nh.find_any_mut(addr) {
            n.resolved = resolved;
            n.rmark = rmark;
            n.tfdb = tfdb;
            n.kind = kind;
            n.rec_nh = rec_nh;
        }
        if changed {
            trace!(%addr, resolved, rmark, "Neighbor resolution changed");
        }
        changed
    }

    /// Add a neighbor, or update the MAC of an existing one.
    pub fn neigh_add(&mut self, addr: IpAddr, attr: NeighAttr) -> Result<()> {
        let Some((oif, port_kind, vid)) = self
            .ports
            .find_by_os_id(attr.os_link)
            .map(|p| (p.name.clone(), p.kind(), p.l2.vid))
        else {
            warn!(%addr, os_link = attr.os_link, "Neighbor add: no egress port");
            match self.nh.neighs.get_mut(&addr) {
                Some(n) => {
                    n.dummy = true;
                    n.oif = None;
                }
                None => {
                    self.nh.neighs.insert(addr, Neigh::dummy(addr, attr));
                }
            }
            return Err(NeighError::Oif(addr));
        };

        let mac = if port_kind.is_l3_tunnel() {
            L3_TUN_MAC
        } else {
            attr.mac
        };

        let found = self.nh.neighs.get(&addr).is_some_and(|n| !n.dummy);
        if found {
            let Some(n) = self.nh.neighs.get_mut(&addr) else {
                return Err(NeighError::NoEnt(addr));
            };
            n.inactive = false;
            n.dummy = false;
            if mac.is_zero() {
                n.resolved = false;
                debug!(%addr, "Neighbor add: exists, unresolved");
                return Err(NeighError::Exists(addr));
            }
            if mac == n.mac && n.resolved {
                debug!(%addr, "Neighbor add: exists");
                return Err(NeighError::Exists(addr));
            }

            let stale = (n.resolved && n.mac != mac).then(|| FdbKey::new(n.mac, vid));
            n.mac = mac;
            n.resolved = true;
            n.os_link = attr.os_link;
            let routes: Vec<IpNet> = n.rtm.iter().copied().collect();

            if let Some(key) = stale
                && port_kind.is_leaf()
                && !port_kind.is_slave()
                && !self.neigh_shares_fdb(addr, &key)
            {
                let _ = self.fdb_del(&key);
            }
            self.neigh_recursive_resolve(addr);
            self.neigh_dp(addr, DpWorkOp::Create);
            for dst in routes {
                self.rt_dp(&dst, DpWorkOp::Create);
            }
            debug!(%addr, %mac, "Neighbor updated");
        } else {
            let mark = match self.nh.neighs.get(&addr).map(|n| n.mark) {
                Some(m) if m != 0 => m,
                _ => self.nh.marks(addr).get().map_err(|e| {
                    warn!(%addr, error = %e, "Neighbor add: mark allocation failed");
                    NeighError::Range(addr)
                })?,
            };

            let n = self
                .nh
                .neighs
                .entry(addr)
                .or_insert_with(|| Neigh::dummy(addr, attr));
            n.dummy = false;
            n.inactive = false;
            n.mark = mark;
            n.mac = mac;
            n.os_link = attr.os_link;
            n.resolved = !mac.is_zero();
            n.oif = Some(oif.clone());
            n.kind.insert(NhType::NORMAL);

            self.neigh_recursive_resolve(addr);
            self.neigh_dp(addr, DpWorkOp::Create);
        }

        let host = IpNet::from(addr);
        let rt_attr = RtAttr {
            host_route: true,
            ifi: attr.os_link,
            ..Default::default()
        };
        let nhs = vec![RtNhAttr {
            addr,
            link_index: attr.os_link,
        }];
        match self.rt_add(host, rt_attr, nhs) {
            Ok(()) | Err(RouteError::Exists(_)) => {}
            Err(e) => {
                warn!(%addr, error = %e, "Neighbor add: host route failed");
                let _ = self.neigh_delete(addr);
                return Err(NeighError::HostRt(addr));
            }
        }

        let resolved = self.nh.find_any(addr).is_some_and(|n| n.resolved);
        if port_kind.is_leaf() && !port_kind.is_slave() && resolved {
            let key = FdbKey::new(mac, vid);
            let fdb_attr = FdbAttr {
                oif: oif.clone(),
                dst: None,
                kind: FdbType::Phy,
            };
            match self.fdb_add(key, fdb_attr) {
                Ok(()) | Err(FdbError::Same(_)) => {}
                Err(e) => {
                    warn!(%addr, error = %e, "Neighbor add: fdb pair failed");
                    let _ = self.rt_delete_host(host);
                    let _ = self.neigh_delete(addr);
                    return Err(NeighError::Mac(addr));
                }
            }
        }

        let mark = self.nh.find_any(addr).map_or(0, |n| n.mark);
        debug!(%addr, port = %oif, mark, resolved, "Neighbor added");
        Ok(())
    }

    /// Whether another resolved neighbor still pairs with the fdb entry.
    fn neigh_shares_fdb(&self, addr: IpAddr, key: &FdbKey) -> bool {
        self.nh.iter().any(|n| {
            n.addr != addr
                && !n.inactive
                && n.resolved
                && n.mac == key.mac
                && n.oif
                    .as_deref()
                    .and_then(|o| self.ports.find(o))
                    .is_some_and(|p| p.l2.vid == key.bd)
        })
    }

    fn neigh_del_tun_eps(&mut self, addr: IpAddr) {
        let marks: Vec<u32> = match self.nh.find_any(addr) {
            Some(n) => n.tun_eps.iter().map(|e| e.mark).collect(),
            None => return,
        };
        for mark in &marks {
            self.tun_ep_dp(addr, *mark, DpWorkOp::Remove);
            if let Err(e) = self.nh.tun_marks.put(*mark) {
                warn!(%addr, mark, error = %e, "Tunnel endpoint: mark release failed");
            }
        }
        if let Some(n) = self.nh.find_any_mut(addr) {
            n.tun_eps.clear();
            n.kind.remove(NhType::TUN);
        }
    }

    fn neigh_free(&mut self, addr: IpAddr) {
        self.neigh_del_tun_eps(addr);
        if let Some(n) = self.nh.neighs.remove(&addr)
            && n.mark != 0
            && let Err(e) = self.nh.marks(addr).put(n.mark)
        {
            warn!(%addr, error = %e, "Neighbor delete: mark release failed");
        }
    }

    /// Delete a neighbor. While routes still use it, it is only deactivated.
    pub fn neigh_delete(&mut self, addr: IpAddr) -> Result<()> {
        let Some(n) = self.nh.neighs.get_mut(&addr) else {
            debug!(%addr, "Neighbor delete: not found");
            return Err(NeighError::NoEnt(addr));
        };

        if n.dummy {
            if !n.rtm.is_empty() {
                n.resolved = false;
                n.inactive = true;
                n.mac = MacAddr::ZERO;
                return Ok(());
            }
            self.neigh_free(addr);
            debug!(%addr, "Deferred neighbor dropped");
            return Ok(());
        }

        let pair = n
            .oif
            .as_deref()
            .and_then(|o| self.ports.find(o))
            .filter(|p| p.kind().is_leaf() && !p.kind().is_slave() && n.resolved)
            .map(|p| FdbKey::new(n.mac, p.l2.vid));
        if let Some(key) = pair
            && !self.neigh_shares_fdb(addr, &key)
            && let Err(e) = self.fdb_del(&key)
        {
            debug!(%addr, error = %e, "Neighbor delete: fdb pair");
        }

        if let Err(e) = self.rt_delete_host(IpNet::from(addr)) {
            debug!(%addr, error = %e, "Neighbor delete: host route");
        }

        let Some(n) = self.nh.neighs.get_mut(&addr) else {
            return Ok(());
        };
        if !n.rtm.is_empty() {
            n.mac = MacAddr::ZERO;
            n.resolved = false;
            n.inactive = true;
            n.tfdb = None;
            n.rmark = 0;
            n.kind.remove(NhType::RECURSIVE);
            // Routes still point here, keep it programmed as unresolved
            self.neigh_dp(addr, DpWorkOp::Create);
            debug!(%addr, "Neighbor deactivated");
            return Ok(());
        }

        self.neigh_dp(addr, DpWorkOp::Remove);
        self.neigh_free(addr);
        debug!(%addr, "Neighbor deleted");
        Ok(())
    }

    /// Delete every active neighbor behind `port`.
    pub fn neigh_delete_by_port(&mut self, port: &str) {
        let doomed: Vec<IpAddr> = self
            .nh
            .iter()
            .filter(|n| !n.inactive && n.oif.as_deref() == Some(port))
            .map(|n| n.addr)
            .collect();
        for addr in doomed {
            let _ = self.neigh_delete(addr);
        }
    }

    pub(crate) fn neigh_port_event(&mut self, name: &str, event: PortEvent) {
        trace!(port = name, ?event, "Neighbor port event");
        self.neigh_delete_by_port(name);
    }

    pub(crate) fn neigh_pair_rt(&mut self, addr: IpAddr, dst: IpNet) {
        if let Some(n) = self.nh.find_any_mut(addr)
            && n.rtm.insert(dst)
        {
            trace!(%addr, %dst, "Neighbor paired with route");
        }
    }

    pub(crate) fn neigh_unpair_rt(&mut self, addr: IpAddr, dst: &IpNet) {
        let Some(n) = self.nh.find_any_mut(addr) else {
            return;
        };
        if !n.rtm.remove(dst) {
            return;
        }
        if n.rtm.is_empty() && n.inactive {
            debug!(%addr, %dst, "Last route released inactive neighbor");
            let _ = self.neigh_delete(addr);
        }
    }

    /// Attach a tunnel endpoint to neighbor `addr`, reusing a matching one.
    ///
    /// Returns the endpoint mark.
    pub fn neigh_add_tun_ep(
        &mut self,
        addr: IpAddr,
        rip: IpAddr,
        sip: Option<IpAddr>,
        tun_id: u32,
        tun_type: TunnelType,
        sync: bool,
    ) -> Result<u32> {
        let Some(n) = self.nh.find_any(addr) else {
            return Err(NeighError::NoEnt(addr));
        };
        let Some(port) = n.oif.as_deref().and_then(|o| self.ports.find(o)) else {
            return Err(NeighError::Tun {
                addr,
                reason: "no egress port",
            });
        };
        if port.sw.ovl.is_none() && tun_type != TunnelType::IpIp {
            return Err(NeighError::Tun {
                addr,
                reason: "port carries no overlay",
            });
        }
        if let Some(ep) = n
            .tun_eps
            .iter()
            .find(|e| e.rip == rip && e.tun_id == tun_id && e.tun_type == tun_type)
        {
            return Ok(ep.mark);
        }

        let sip = match sip {
            Some(s) => s,
            None => self
                .l3
                .ifa_select(&port.name, rip, true)
                .ok_or(NeighError::Tun {
                    addr,
                    reason: "no source address",
                })?,
        };
        let mark = self.nh.tun_marks.get().map_err(|e| {
            warn!(%addr, error = %e, "Tunnel endpoint: mark allocation failed");
            NeighError::Range(addr)
        })?;

        if let Some(n) = self.nh.find_any_mut(addr) {
            n.tun_eps.push(NeighTunEp {
                sip,
                rip,
                tun_id,
                tun_type,
                mark,
                sync: DpStatus::Ok,
            });
            n.kind.insert(NhType::TUN);
        }
        if sync {
            self.tun_ep_dp(addr, mark, DpWorkOp::Create);
        }
        debug!(%addr, %sip, %rip, tun_id, mark, "Tunnel endpoint added");
        Ok(mark)
    }

    /// Retry deferred adds, re-resolve and re-push failed entries.
    pub fn neigh_ticker(&mut self) {
        let addrs: Vec<IpAddr> = self.nh.neighs.keys().copied().collect();
        for addr in addrs {
            let Some(n) = self.nh.find_any(addr) else {
                continue;
            };
            if n.dummy {
                let attr = NeighAttr {
                    os_link: n.os_link,
                    mac: n.mac,
                };
                if self.neigh_add(addr, attr).is_ok() {
                    info!(%addr, "Deferred neighbor added");
                }
                continue;
            }

            let changed = self.neigh_recursive_resolve(addr);
            let Some(n) = self.nh.find_any(addr) else {
                continue;
            };
            let resync = changed || n.sync != DpStatus::Ok;
            let failed: Vec<u32> = n
                .tun_eps
                .iter()
                .filter(|e| e.sync != DpStatus::Ok)
                .map(|e| e.mark)
                .collect();
            if resync {
                self.neigh_dp(addr, DpWorkOp::Create);
            }
            for mark in failed {
                self.tun_ep_dp(addr, mark, DpWorkOp::Create);
            }
        }
    }

    pub fn neighs_get(&self) -> Vec<NeighDump> {
        self.nh
            .iter()
            .map(|n| NeighDump {
                ip: n.addr,
                mac: n.mac,
                link_index: n.os_link,
                resolved: n.resolved,
                mark: n.mark,
                sync: n.sync,
            })
            .collect()
    }

    pub fn neigh_destruct_all(&mut self) {
        let addrs: Vec<IpAddr> = self.nh.neighs.keys().copied().collect();
        for addr in addrs {
            let _ = self.neigh_delete(addr);
        }
        let left: Vec<IpAddr> = self.nh.neighs.keys().copied().collect();
        for addr in left {
            self.neigh_free(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortHwInfo;
    use crate::dp::DpHandle;
    use crossbeam_channel::Receiver;

    const MAC: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    fn zone() -> (Zone, Receiver<DpWork>) {
        let (dp, rx) = DpHandle::channel(4096);
        let mut z = Zone::new("root", 0, dp);
        let hw = PortHwInfo {
            mac: MacAddr::new([2, 0, 0, 0, 0, 1]),
            link: true,
            state: true,
            mtu: 1500,
            ..Default::default()
        };
        z.port_add("eth0", 5, PortKind::REAL, hw, Default::default())
            .unwrap();
        let _: Vec<_> = rx.try_iter().collect();
        (z, rx)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn attr(mac: MacAddr) -> NeighAttr {
        NeighAttr { os_link: 5, mac }
    }

    #[test]
    fn test_neigh_add_host_route_and_fdb() {
        let (mut z, rx) = zone();
        z.neigh_add(ip("10.0.0.1"), attr(MAC)).unwrap();

        let n = z.nh.find(ip("10.0.0.1")).unwrap();
        assert!(n.resolved);
        assert_eq!(n.mark, 1);
        assert_eq!(n.oif.as_deref(), Some("eth0"));
        assert!(z.rt.find(&"10.0.0.1/32".parse().unwrap()).is_some());
        assert!(z.l2.find(&FdbKey::new(MAC, 3801)).is_some());

        let works: Vec<DpWork> = rx.try_iter().collect();
        assert!(works.iter().any(|w| matches!(
            &w.kind,
            DpWorkKind::NextHop(nh) if nh.nh_num == 1 && nh.resolved && nh.dst_mac == MAC
        )));

        assert_eq!(
            z.neigh_add(ip("10.0.0.1"), attr(MAC)),
            Err(NeighError::Exists(ip("10.0.0.1")))
        );
    }

    #[test]
    fn test_neigh_mark_pools() {
        let (mut z, _rx) = zone();
        z.neigh_add(ip("10.0.0.1"), attr(MAC)).unwrap();
        z.neigh_add(ip("fd00::1"), attr(MacAddr::new([2, 2, 2, 2, 2, 2])))
            .unwrap();
        assert_eq!(z.nh.find(ip("10.0.0.1")).unwrap().mark, 1);
        assert_eq!(
            z.nh.find(ip("fd00::1")).unwrap().mark,
            MAX_SYS_NEIGH + MAX_TUNNEL_NEIGH + 1
        );
    }

    #[test]
    fn test_neigh_without_port_is_deferred() {
        let (mut z, _rx) = zone();
        let a = NeighAttr {
            os_link: 9,
            mac: MAC,
        };
        assert_eq!(z.neigh_add(ip("10.0.0.2"), a), Err(NeighError::Oif(ip("10.0.0.2"))));
        assert!(z.nh.find(ip("10.0.0.2")).is_none());
        assert!(z.nh.find_any(ip("10.0.0.2")).unwrap().dummy);

        let hw = PortHwInfo {
            mac: MacAddr::new([2, 0, 0, 0, 0, 9]),
            link: true,
            state: true,
            ..Default::default()
        };
        z.port_add("eth1", 9, PortKind::REAL, hw, Default::default())
            .unwrap();
        z.neigh_ticker();
        let n = z.nh.find(ip("10.0.0.2")).unwrap();
        assert!(!n.dummy);
        assert!(n.resolved);
    }

    #[test]
    fn test_neigh_update_reprograms_routes() {
        let (mut z, rx) = zone();
        z.rt_add(
            "10.9.0.0/16".parse().unwrap(),
            RtAttr::default(),
            vec![RtNhAttr {
                addr: ip("10.0.0.1"),
                link_index: 5,
            }],
        )
        .unwrap();
        assert!(!z.nh.find(ip("10.0.0.1")).unwrap().resolved);
        let _: Vec<_> = rx.try_iter().collect();

        z.neigh_add(ip("10.0.0.1"), attr(MAC)).unwrap();
        assert!(z.nh.find(ip("10.0.0.1")).unwrap().resolved);
        let works: Vec<DpWork> = rx.try_iter().collect();
        assert!(works.iter().any(|w| w.target == Some(SyncTarget::Neigh(ip("10.0.0.1")))));
        assert!(works
            .iter()
            .any(|w| w.target == Some(SyncTarget::Route("10.9.0.0/16".parse().unwrap()))));
    }

    #[test]
    fn test_neigh_delete_deferred_while_routed() {
        let (mut z, rx) = zone();
        z.neigh_add(ip("10.0.0.1"), attr(MAC)).unwrap();
        let dst: IpNet = "10.9.0.0/16".parse().unwrap();
        z.rt_add(
            dst,
            RtAttr::default(),
            vec![RtNhAttr {
                addr: ip("10.0.0.1"),
                link_index: 5,
            }],
        )
        .unwrap();
        let _: Vec<_> = rx.try_iter().collect();

        z.neigh_delete(ip("10.0.0.1")).unwrap();
        let n = z.nh.find_any(ip("10.0.0.1")).unwrap();
        assert!(n.inactive);
        assert!(!n.resolved);
        assert!(z.nh.find(ip("10.0.0.1")).is_none());
        let works: Vec<DpWork> = rx.try_iter().collect();
        assert!(!works.iter().any(|w| w.op == DpWorkOp::Remove
            && w.target == Some(SyncTarget::Neigh(ip("10.0.0.1")))));

        z.rt_delete(dst).unwrap();
        assert!(z.nh.find_any(ip("10.0.0.1")).is_none());
        let works: Vec<DpWork> = rx.try_iter().collect();
        assert!(works.iter().any(|w| w.op == DpWorkOp::Remove
            && w.target == Some(SyncTarget::Neigh(ip("10.0.0.1")))));
        assert_eq!(z.nh.v4_marks.available(), MAX_SYS_NEIGH as usize);
    }

    #[test]
    fn test_neigh_shared_mac_keeps_fdb() {
        let (mut z, _rx) = zone();
        let key = FdbKey::new(MAC, 3801);
        z.neigh_add(ip("10.0.0.1"), attr(MAC)).unwrap();
        z.neigh_add(ip("fd00::1"), attr(MAC)).unwrap();
        assert_eq!(z.l2.len(), 1);

        z.neigh_delete(ip("10.0.0.1")).unwrap();
        assert!(z.l2.find(&key).is_some());
        z.neigh_delete(ip("fd00::1")).unwrap();
        assert!(z.l2.find(&key).is_none());
    }

    #[test]
    fn test_neigh_delete_by_port() {
        let (mut z, _rx) = zone();
        z.neigh_add(ip("10.0.0.1"), attr(MAC)).unwrap();
        z.port_del("eth0", PortKind::REAL).unwrap();
        assert!(z.nh.find_any(ip("10.0.0.1")).is_none());
        assert!(z.rt.find(&"10.0.0.1/32".parse().unwrap()).is_none());
        assert!(z.l2.is_empty());
    }

    #[test]
    fn test_tun_ep_needs_overlay() {
        let (mut z, _rx) = zone();
        z.neigh_add(ip("10.0.0.1"), attr(MAC)).unwrap();
        assert!(matches!(
            z.neigh_add_tun_ep(ip("10.0.0.1"), ip("10.0.0.1"), None, 50, TunnelType::Vxlan, true),
            Err(NeighError::Tun { .. })
        ));

        let hw = PortHwInfo {
            real: "eth0".into(),
            tun_id: 50,
            link: true,
            state: true,
            ..Default::default()
        };
        z.port_add("vxlan50", 50, PortKind::VXLAN_BR, hw, Default::default())
            .unwrap();
        z.ifa_add("eth0", "10.0.0.254/24").unwrap();
        let m1 = z
            .neigh_add_tun_ep(ip("10.0.0.1"), ip("10.0.0.1"), None, 50, TunnelType::Vxlan, true)
            .unwrap();
        let m2 = z
            .neigh_add_tun_ep(ip("10.0.0.1"), ip("10.0.0.1"), None, 50, TunnelType::Vxlan, true)
            .unwrap();
        assert_eq!(m1, m2);
        assert_eq!(m1, MAX_SYS_NEIGH + 1);
        let n = z.nh.find(ip("10.0.0.1")).unwrap();
        assert!(n.kind.contains(NhType::TUN));
        assert_eq!(n.tun_eps[0].sip, ip("10.0.0.254"));
    }
}
