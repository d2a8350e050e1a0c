//! Interface addresses.
//!
//! Addresses are grouped per object, usually a port name. Each address brings
//! self routes for its subnet and for itself, and the owning port's MAC is
//! programmed as a router MAC so routed traffic is terminated locally.

use crate::dp::{DpStatus, DpWork, DpWorkKind, DpWorkOp, RouterMacDpWork, SyncTarget};
use crate::model::{PortKind, TunnelType};
use crate::route::{RouteError, RtAttr, RtTarget};
use crate::zone::Zone;
use ipnet::IpNet;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, warn};

/// Loopback device. Its addresses are not programmed and never chosen as a
/// source.
const LOOPBACK_PORT: &str = "lo";

/// L3 errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum L3Error {
    #[error("malformed address {0}")]
    Parse(String),

    #[error("address {addr} exists on {obj}")]
    AddrExists { obj: String, addr: IpAddr },

    #[error("no address {addr} on {obj}")]
    NoAddr { obj: String, addr: String },

    #[error("no addresses on {0}")]
    NoObj(String),

    #[error("self route for {addr} failed: {source}")]
    Route {
        addr: IpAddr,
        #[source]
        source: RouteError,
    },
}

impl L3Error {
    pub fn code(&self) -> i32 {
        match self {
            L3Error::Parse(_) => -6001,
            L3Error::AddrExists { .. } => -6002,
            L3Error::NoAddr { .. } => -6003,
            L3Error::NoObj(_) => -6004,
            L3Error::Route { .. } => -6005,
        }
    }
}

pub type Result<T> = std::result::Result<T, L3Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaEnt {
    pub addr: IpAddr,
    /// Subnet of `addr`, host bits cleared.
    pub net: IpNet,
    /// Another address of the same subnet came first.
    pub secondary: bool,
}

impl IfaEnt {
    fn cidr(&self) -> String {
        format!("{}/{}", self.addr, self.net.prefix_len())
    }
}

/// All addresses of one object.
#[derive(Debug, Clone)]
pub struct Ifa {
    pub name: String,
    pub ifas: Vec<IfaEnt>,
    pub sync: DpStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct IfaDump {
    pub dev: String,
    pub ip: Vec<String>,
    pub sync: DpStatus,
}

#[derive(Debug, Default)]
pub struct IfaTable {
    ifas: HashMap<String, Ifa>,
}

fn same_family(a: IpAddr, b: IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

impl IfaTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, obj: &str) -> Option<&Ifa> {
        self.ifas.get(obj)
    }

    pub(crate) fn find_mut(&mut self, obj: &str) -> Option<&mut Ifa> {
        self.ifas.get_mut(obj)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ifa> {
        self.ifas.values()
    }

    /// Addresses of `obj` in CIDR notation, one family only.
    pub fn addr_strings(&self, obj: &str, v4: bool) -> Vec<String> {
        self.ifas
            .get(obj)
            .map(|ifa| {
                ifa.ifas
                    .iter()
                    .filter(|e| e.addr.is_ipv4() == v4)
                    .map(IfaEnt::cidr)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Source address on `obj` for talking to `addr`.
    ///
    /// Prefers a primary address whose subnet contains `addr`. With
    /// `find_any` it falls back to the first address of the same family,
    /// and when `obj` has no addresses at all, to any other object's.
    pub fn ifa_select(&self, obj: &str, addr: IpAddr, find_any: bool) -> Option<IpAddr> {
        let Some(ifa) = self.ifas.get(obj) else {
            if !find_any {
                return None;
            }
            return self
                .ifas
                .values()
                .filter(|i| i.name != LOOPBACK_PORT && !i.ifas.is_empty())
                .find_map(|i| {
                    i.ifas
                        .iter()
                        .find(|e| same_family(e.addr, addr))
                        .or(i.ifas.first())
                        .map(|e| e.addr)
                });
        };

        let hit = ifa
            .ifas
            .iter()
            .filter(|e| !e.secondary && same_family(e.addr, addr))
            .find(|e| e.net.contains(&addr));
        if let Some(e) = hit {
            return Some(e.addr);
        }
        if !find_any {
            return None;
        }
        ifa.ifas
            .iter()
            .find(|e| same_family(e.addr, addr))
            .or(ifa.ifas.first())
            .map(|e| e.addr)
    }

    /// `addr` as assigned on `obj`.
    pub fn ifa_find_addr(&self, obj: &str, addr: IpAddr) -> Option<IpAddr> {
        self.ifas
            .get(obj)?
            .ifas
            .iter()
            .find(|e| e.addr == addr)
            .map(|e| e.addr)
    }

    /// Whether `addr` is assigned to any object.
    pub fn ifa_addr_local(&self, addr: IpAddr) -> bool {
        self.ifas
            .values()
            .any(|i| i.ifas.iter().any(|e| e.addr == addr))
    }
}

fn parse_cidr(cidr: &str) -> Result<(IpAddr, IpNet)> {
    let net: IpNet = cidr.parse().map_err(|_| L3Error::Parse(cidr.to_string()))?;
    Ok((net.addr(), net.trunc()))
}

fn host_net(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}

impl Zone {
    fn ifa_dp_works(&self, obj: &str, op: DpWorkOp) -> std::result::Result<Vec<DpWork>, DpStatus> {
        let Some(port) = self.ports.find(obj) else {
            if obj != LOOPBACK_PORT {
                warn!(obj, "Ifa: no such port");
                return Err(DpStatus::CreateErr);
            }
            return Ok(Vec::new());
        };

        // The router MAC stays while another addressed port shares it
        if op == DpWorkOp::Remove
            && self
                .l3
                .iter()
                .any(|i| self.ports.l2_addr_match(&i.name, port.hw.mac))
        {
            return Ok(Vec::new());
        }

        let vxlan = port.kind().contains(PortKind::VXLAN_BR);
        let real = self.ports.real_of(port);
        if vxlan && real.is_none() {
            warn!(obj, "Ifa: VXLAN bridge without real port");
            return Err(DpStatus::CreateErr);
        }

        let target = Some(SyncTarget::Ifa(obj.to_string()));
        let mut works = vec![DpWork::new(
            op,
            self.mark,
            target.clone(),
            DpWorkKind::RouterMac(RouterMacDpWork {
                l2_addr: port.hw.mac,
                port_num: port.port_no,
                bd: 0,
                tun_id: 0,
                tun_type: None,
                nh_num: 0,
            }),
        )];
        if let (true, Some(up)) = (vxlan, real) {
            works.push(DpWork::new(
                op,
                self.mark,
                target,
                DpWorkKind::RouterMac(RouterMacDpWork {
                    l2_addr: up.hw.mac,
                    port_num: up.port_no,
                    bd: port.l2.vid,
                    tun_id: port.hw.tun_id,
                    tun_type: Some(TunnelType::Vxlan),
                    nh_num: 0,
                }),
            ));
        }
        Ok(works)
    }

    fn ifa_dp(&mut self, obj: &str, op: DpWorkOp) {
        match self.ifa_dp_works(obj, op) {
            Ok(works) => {
                for w in works {
                    self.dp.push(w);
                }
            }
            Err(status) => {
                if let Some(ifa) = self.l3.find_mut(obj) {
                    ifa.sync = status;
                }
            }
        }
    }

    fn ifa_self_route(&mut self, net: IpNet, ifi: i32) -> std::result::Result<(), RouteError> {
        let attr = RtAttr {
            ifi,
            ..Default::default()
        };
        match self.rt_add(net, attr, Vec::new()) {
            Ok(()) | Err(RouteError::Exists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Assign `cidr` to `obj`.
    pub fn ifa_add(&mut self, obj: &str, cidr: &str) -> Result<()> {
        let (addr, net) = parse_cidr(cidr)?;

        let mut secondary = false;
        if let Some(ifa) = self.l3.find(obj) {
            for e in &ifa.ifas {
                if e.addr == addr {
                    debug!(obj, %addr, "Ifa add: exists");
                    return Err(L3Error::AddrExists {
                        obj: obj.to_string(),
                        addr,
                    });
                }
                if e.net == net {
                    secondary = true;
                }
            }
        }

        let ifi = self.ports.find(obj).map_or(-1, |p| p.sw.os_id);
        let ent = IfaEnt {
            addr,
            net,
            secondary,
        };
        self.l3
            .ifas
            .entry(obj.to_string())
            .or_insert_with(|| Ifa {
                name: obj.to_string(),
                ifas: Vec::new(),
                sync: DpStatus::Ok,
            })
            .ifas
            .push(ent);

        self.ifa_self_route(net, ifi)
            .map_err(|source| L3Error::Route { addr, source })?;
        if net.prefix_len() != net.max_prefix_len() {
            self.ifa_self_route(host_net(addr), ifi)
                .map_err(|source| L3Error::Route { addr, source })?;
        }

        self.ifa_dp(obj, DpWorkOp::Create);
        debug!(obj, %addr, secondary, "Ifa added");
        Ok(())
    }

    /// Remove `cidr` from `obj`.
    pub fn ifa_delete(&mut self, obj: &str, cidr: &str) -> Result<()> {
        let (addr, net) = parse_cidr(cidr)?;
        let Some(ifa) = self.l3.find_mut(obj) else {
            debug!(obj, %addr, "Ifa delete: no addresses");
            return Err(L3Error::NoObj(obj.to_string()));
        };
        let Some(idx) = ifa.ifas.iter().position(|e| e.addr == addr && e.net == net) else {
            debug!(obj, cidr, "Ifa delete: no such address");
            return Err(L3Error::NoAddr {
                obj: obj.to_string(),
                addr: cidr.to_string(),
            });
        };
        ifa.ifas.remove(idx);
        let subnet_shared = ifa.ifas.iter().any(|e| e.net == net);
        let now_empty = ifa.ifas.is_empty();

        if !subnet_shared && let Err(e) = self.rt_delete(net) {
            debug!(obj, %net, error = %e, "Ifa delete: subnet route");
        }
        if net.prefix_len() != net.max_prefix_len()
            && let Err(e) = self.rt_delete(host_net(addr))
        {
            debug!(obj, %addr, error = %e, "Ifa delete: host route");
        }

        if now_empty {
            self.l3.ifas.remove(obj);
            self.ifa_dp(obj, DpWorkOp::Remove);
        }
        debug!(obj, %addr, "Ifa deleted");
        Ok(())
    }

    /// Remove every address of `obj`.
    pub fn ifa_delete_all(&mut self, obj: &str) {
        let cidrs: Vec<String> = match self.l3.find(obj) {
            Some(ifa) => ifa.ifas.iter().map(IfaEnt::cidr).collect(),
            None => return,
        };
        for cidr in cidrs {
            if let Err(e) = self.ifa_delete(obj, &cidr) {
                debug!(obj, cidr, error = %e, "Ifa delete all");
            }
        }
        self.l3.ifas.remove(obj);
    }

    /// Source address and egress object for reaching `addr`, found through
    /// the route table.
    pub fn ifa_select_any(&self, addr: IpAddr, find_any: bool) -> Option<(IpAddr, String)> {
        let egress = match self.rt.lookup(addr) {
            Some((_, RtTarget::Neigh(nh))) => self.nh.find_any(nh).and_then(|n| n.oif.clone()),
            Some((_, RtTarget::Ifi(ifi))) => self.ports.find_by_os_id(ifi).map(|p| p.name.clone()),
            None => None,
        };
        if let Some(obj) = egress.filter(|o| o != LOOPBACK_PORT) {
            return self
                .l3
                .ifa_select(&obj, addr, find_any)
                .map(|a| (a, obj));
        }

        let mut first = None;
        for ifa in self.l3.iter().filter(|i| i.name != LOOPBACK_PORT) {
            for e in ifa.ifas.iter().filter(|e| !e.secondary && same_family(e.addr, addr)) {
                if e.net.contains(&addr) {
                    return Some((e.addr, ifa.name.clone()));
                }
                if first.is_none() {
                    first = Some((e.addr, ifa.name.clone()));
                }
            }
        }
        if find_any { first } else { None }
    }

    /// Re-push objects whose router MAC failed to program.
    pub fn ifa_ticker(&mut self) {
        let pending: Vec<String> = self
            .l3
            .iter()
            .filter(|i| i.name != LOOPBACK_PORT)
            .filter(|i| i.ifas.iter().any(|e| !e.secondary))
            .filter(|i| i.sync != DpStatus::Ok)
            .map(|i| i.name.clone())
            .collect();
        for obj in pending {
            debug!(obj, "Ifa resync");
            self.ifa_dp(&obj, DpWorkOp::Create);
        }
    }

    pub fn ifa_get(&self) -> Vec<IfaDump> {
        self.l3
            .iter()
            .map(|i| IfaDump {
                dev: i.name.clone(),
                ip: i.ifas.iter().map(IfaEnt::cidr).collect(),
                sync: i.sync,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dp::DpHandle;
    use crate::model::MacAddr;
    use crate::port::PortHwInfo;
    use crossbeam_channel::Receiver;

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

    #[test]
    fn test_ifa_add_routes_and_rmac() {
        let (mut z, rx) = zone();
        z.ifa_add("eth0", "192.168.1.10/24").unwrap();

        assert!(z.rt.find(&"192.168.1.0/24".parse().unwrap()).is_some());
        assert!(z.rt.find(&"192.168.1.10/32".parse().unwrap()).is_some());
        let works: Vec<DpWork> = rx.try_iter().collect();
        assert!(works.iter().any(|w| matches!(
            &w.kind,
            DpWorkKind::RouterMac(r) if r.l2_addr == MacAddr::new([2, 0, 0, 0, 0, 1])
        )));
        assert_eq!(z.l3.addr_strings("eth0", true), vec!["192.168.1.10/24"]);
        assert!(z.l3.addr_strings("eth0", false).is_empty());
    }

    #[test]
    fn test_ifa_duplicate_and_secondary() {
        let (mut z, _rx) = zone();
        z.ifa_add("eth0", "192.168.1.10/24").unwrap();
        assert_eq!(
            z.ifa_add("eth0", "192.168.1.10/24"),
            Err(L3Error::AddrExists {
                obj: "eth0".into(),
                addr: ip("192.168.1.10")
            })
        );
        z.ifa_add("eth0", "192.168.1.11/24").unwrap();
        let ifa = z.l3.find("eth0").unwrap();
        assert!(!ifa.ifas[0].secondary);
        assert!(ifa.ifas[1].secondary);

        // Secondaries are never selected for a matching subnet
        assert_eq!(
            z.l3.ifa_select("eth0", ip("192.168.1.99"), false),
            Some(ip("192.168.1.10"))
        );
    }

    #[test]
    fn test_ifa_select() {
        let (mut z, _rx) = zone();
        z.ifa_add("eth0", "10.0.0.1/24").unwrap();
        z.ifa_add("eth0", "172.16.0.1/16").unwrap();

        assert_eq!(
            z.l3.ifa_select("eth0", ip("172.16.9.9"), false),
            Some(ip("172.16.0.1"))
        );
        assert_eq!(z.l3.ifa_select("eth0", ip("8.8.8.8"), false), None);
        assert_eq!(
            z.l3.ifa_select("eth0", ip("8.8.8.8"), true),
            Some(ip("10.0.0.1"))
        );
        assert_eq!(z.l3.ifa_select("eth9", ip("8.8.8.8"), false), None);
        assert!(z.l3.ifa_select("eth9", ip("8.8.8.8"), true).is_some());
        assert!(z.l3.ifa_addr_local(ip("172.16.0.1")));
        assert_eq!(z.l3.ifa_find_addr("eth0", ip("10.0.0.1")), Some(ip("10.0.0.1")));
    }

    #[test]
    fn test_ifa_select_any_via_route() {
        let (mut z, _rx) = zone();
        z.ifa_add("eth0", "10.0.0.1/24").unwrap();
        assert_eq!(
            z.ifa_select_any(ip("10.0.0.77"), false),
            Some((ip("10.0.0.1"), "eth0".to_string()))
        );
        assert_eq!(z.ifa_select_any(ip("9.9.9.9"), false), None);
        assert_eq!(
            z.ifa_select_any(ip("9.9.9.9"), true),
            Some((ip("10.0.0.1"), "eth0".to_string()))
        );
    }

    #[test]
    fn test_ifa_delete_keeps_shared_subnet() {
        let (mut z, rx) = zone();
        z.ifa_add("eth0", "192.168.1.10/24").unwrap();
        z.ifa_add("eth0", "192.168.1.11/24").unwrap();
        let _: Vec<_> = rx.try_iter().collect();

        z.ifa_delete("eth0", "192.168.1.10/24").unwrap();
        assert!(z.rt.find(&"192.168.1.0/24".parse().unwrap()).is_some());
        assert!(z.rt.find(&"192.168.1.10/32".parse().unwrap()).is_none());

        z.ifa_delete("eth0", "192.168.1.11/24").unwrap();
        assert!(z.rt.find(&"192.168.1.0/24".parse().unwrap()).is_none());
        assert!(z.l3.find("eth0").is_none());
        let works: Vec<DpWork> = rx.try_iter().collect();
        assert!(works
            .iter()
            .any(|w| w.op == DpWorkOp::Remove && matches!(w.kind, DpWorkKind::RouterMac(_))));

        assert_eq!(
            z.ifa_delete("eth0", "192.168.1.11/24"),
            Err(L3Error::NoObj("eth0".into()))
        );
        assert!(matches!(
            z.ifa_add("eth0", "not-an-ip"),
            Err(L3Error::Parse(_))
        ));
    }

    #[test]
    fn test_ifa_ticker_resyncs_failed() {
        let (mut z, rx) = zone();
        z.ifa_add("eth0", "10.0.0.1/24").unwrap();
        let _: Vec<_> = rx.try_iter().collect();
        z.l3.find_mut("eth0").unwrap().sync = DpStatus::CreateErr;
        z.ifa_ticker();
        let works: Vec<DpWork> = rx.try_iter().collect();
        assert_eq!(works.len(), 1);
        assert_eq!(works[0].target, Some(SyncTarget::Ifa("eth0".into())));
    }
}
