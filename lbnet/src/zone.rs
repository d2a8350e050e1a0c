//! Zones.
//!
//! A [`Zone`] owns one instance of every forwarding table. Operations that
//! span tables are `impl Zone` blocks in the table modules, so a caller
//! holding the zone's write lock sees a consistent snapshot. [`ZoneH`] is the
//! registry of zones plus the port and bridge bindings shared between them.

use crate::counter::Counter;
use crate::dp::{DpCompletion, DpHandle, DpStatus, SyncTarget};
use crate::fdb::FdbTable;
use crate::l3::IfaTable;
use crate::mirror::MirrorTable;
use crate::neighbor::NeighTable;
use crate::policer::PolicerTable;
use crate::port::{PortNotifier, PortTable};
use crate::route::RouteTable;
use crate::rules::{RuleConfig, RuleTable};
use crate::session::SessionTable;
use crate::vlan::VlanTable;
use crossbeam_channel::Receiver;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Name of the zone created at start-up.
pub const ROOT_ZONE: &str = "root";

pub const MAX_ZONES: u32 = 256;

/// Zone errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZoneError {
    #[error("zone {0} exists")]
    Exists(String),

    #[error("no such zone {0}")]
    NotExist(String),

    #[error("zone number allocation failed")]
    Number,

    #[error("{name} is bound to zone {zone}")]
    Bound { name: String, zone: String },

    #[error("{0} is not bound to any zone")]
    NotBound(String),
}

impl ZoneError {
    pub fn code(&self) -> i32 {
        match self {
            ZoneError::Exists(_) => -7001,
            ZoneError::NotExist(_) => -7002,
            ZoneError::Number => -7003,
            ZoneError::Bound { .. } => -7004,
            ZoneError::NotBound(_) => -7005,
        }
    }
}

pub type Result<T> = std::result::Result<T, ZoneError>;

/// Which zone each port and bridge belongs to.
#[derive(Debug, Default)]
pub struct ZoneBindings {
    ports: HashMap<String, String>,
    bridges: HashMap<String, String>,
}

impl ZoneBindings {
    fn bind(map: &mut HashMap<String, String>, name: &str, zone: &str) -> Result<()> {
        match map.get(name) {
            Some(z) if z == zone => Ok(()),
            Some(z) => Err(ZoneError::Bound {
                name: name.to_string(),
                zone: z.clone(),
            }),
            None => {
                map.insert(name.to_string(), zone.to_string());
                Ok(())
            }
        }
    }

    pub fn port_add(&mut self, port: &str, zone: &str) -> Result<()> {
        Self::bind(&mut self.ports, port, zone)
    }

    pub fn port_delete(&mut self, port: &str) -> Result<()> {
        self.ports
            .remove(port)
            .map(|_| ())
            .ok_or_else(|| ZoneError::NotBound(port.to_string()))
    }

    /// An unbound port is valid for any zone.
    pub fn port_is_valid(&self, port: &str, zone: &str) -> bool {
        self.ports.get(port).is_none_or(|z| z == zone)
    }

    pub fn port_zone(&self, port: &str) -> Option<&str> {
        self.ports.get(port).map(String::as_str)
    }

    pub fn br_add(&mut self, br: &str, zone: &str) -> Result<()> {
        Self::bind(&mut self.bridges, br, zone)
    }

    pub fn br_delete(&mut self, br: &str) -> Result<()> {
        self.bridges
            .remove(br)
            .map(|_| ())
            .ok_or_else(|| ZoneError::NotBound(br.to_string()))
    }
}

/// One network namespace.
pub struct Zone {
    pub name: String,
    pub mark: u32,
    pub ports: PortTable,
    pub vlans: VlanTable,
    pub l2: FdbTable,
    pub l3: IfaTable,
    pub nh: NeighTable,
    pub rt: RouteTable,
    pub rules: RuleTable,
    pub mirrors: MirrorTable,
    pub pols: PolicerTable,
    pub sess: SessionTable,
    pub(crate) dp: DpHandle,
    bindings: Arc<RwLock<ZoneBindings>>,
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("name", &self.name)
            .field("mark", &self.mark)
            .finish_non_exhaustive()
    }
}

impl Zone {
    /// A stand-alone zone with private bindings.
    pub fn new(name: &str, mark: u32, dp: DpHandle) -> Self {
        Self::with_bindings(
            name,
            mark,
            dp,
            Arc::new(RwLock::new(ZoneBindings::default())),
            RuleConfig::default(),
        )
    }

    pub fn with_bindings(
        name: &str,
        mark: u32,
        dp: DpHandle,
        bindings: Arc<RwLock<ZoneBindings>>,
        rule_cfg: RuleConfig,
    ) -> Self {
        let mut ports = PortTable::new();
        ports.notifier_register(PortNotifier::Fdb);
        ports.notifier_register(PortNotifier::Neigh);

        Self {
            name: name.to_string(),
            mark,
            ports,
            vlans: VlanTable::new(),
            l2: FdbTable::new(),
            l3: IfaTable::new(),
            nh: NeighTable::new(),
            rt: RouteTable::new(),
            rules: RuleTable::new(rule_cfg),
            mirrors: MirrorTable::new(),
            pols: PolicerTable::new(),
            sess: SessionTable::new(),
            dp,
            bindings,
        }
    }

    pub(crate) fn zone_port_is_valid(&self, port: &str) -> bool {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .port_is_valid(port, &self.name)
    }

    pub(crate) fn zone_port_bind(&self, port: &str) -> Result<()> {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .port_add(port, &self.name)
    }

    pub(crate) fn zone_port_unbind(&self, port: &str) {
        let res = self
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .port_delete(port);
        if let Err(e) = res {
            debug!(port, error = %e, "Port unbind");
        }
    }

    pub(crate) fn zone_br_add(&self, br: &str) -> Result<()> {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .br_add(br, &self.name)
    }

    pub(crate) fn zone_br_delete(&self, br: &str) -> Result<()> {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .br_delete(br)
    }

    /// Fold a datapath completion into the owning object.
    pub fn apply_completion(&mut self, c: DpCompletion) {
        let status = c.status;
        let found = match &c.target {
            SyncTarget::Port(name) => self.ports.find_mut(name).map(|p| p.sync = status),
            SyncTarget::VlanStats { vid, tx } => self.vlans.find_mut(*vid).map(|v| {
                if let Some(s) = c.stats {
                    v.set_stats(*tx, s);
                }
            }),
            SyncTarget::Fdb(key) => self.l2.find_mut(key).map(|f| f.sync = status),
            SyncTarget::Ifa(name) => self.l3.find_mut(name).map(|i| i.sync = status),
            SyncTarget::Neigh(ip) => self.nh.find_any_mut(*ip).map(|n| n.sync = status),
            SyncTarget::TunEp { neigh, mark } => self
                .nh
                .find_any_mut(*neigh)
                .and_then(|n| n.tun_eps.iter_mut().find(|ep| ep.mark == *mark))
                .map(|ep| ep.sync = status),
            SyncTarget::Route(dst) => self.rt.find_mut(dst).map(|r| r.sync = status),
            SyncTarget::RouteStats(dst) => self.rt.find_mut(dst).map(|r| {
                if let Some(s) = c.stats {
                    r.stats = s;
                }
            }),
            SyncTarget::NatRule(mark) => self.rules.nat_by_mark_mut(*mark).map(|r| r.sync = status),
            SyncTarget::NatStats { mark, ep } => self.rules.nat_by_mark_mut(*mark).map(|r| {
                if let Some(s) = c.stats {
                    r.set_ep_stats(*ep, s);
                }
            }),
            SyncTarget::FwRule(mark) => self.rules.fw_by_mark_mut(*mark).map(|r| r.sync = status),
            SyncTarget::Mirror(name) => self.mirrors.find_mut(name).map(|m| m.sync = status),
            SyncTarget::Policer(name) => self.pols.find_mut(name).map(|p| p.sync = status),
            SyncTarget::PolicerStats(name) => self.pols.find_mut(name).map(|p| {
                if let Some(s) = c.stats {
                    p.stats = s;
                }
            }),
            SyncTarget::UlCl { user, addr, uplink } => {
                self.sess.ulcl_mut(user, *addr).map(|cl| {
                    if *uplink {
                        cl.ul_sync = status;
                    } else {
                        cl.dl_sync = status;
                    }
                })
            }
            SyncTarget::UlClStats { user, addr, uplink } => {
                self.sess.ulcl_mut(user, *addr).map(|cl| {
                    if let Some(s) = c.stats {
                        if *uplink {
                            cl.ul_stats = s;
                        } else {
                            cl.dl_stats = s;
                        }
                    }
                })
            }
        };
        if found.is_none() {
            trace!(target = ?c.target, "Completion for a removed object");
        } else if status != DpStatus::Ok {
            debug!(target = ?c.target, ?status, "Datapath reported failure");
        }
    }

    /// One reconciliation pass over the forwarding tables.
    pub fn tick(&mut self) {
        self.fdb_ticker();
        self.neigh_ticker();
        self.vlans_ticker();
        self.rt_ticker();
        self.ifa_ticker();
        self.mirr_ticker();
        self.pol_ticker();
        self.sess_ticker();
        self.rules_sync();
    }

    /// Tear down every table, dependents first.
    pub fn destruct_all(&mut self) {
        self.sess_destruct_all();
        self.rule_destruct_all();
        self.mirr_destruct_all();
        self.pol_destruct_all();
        self.rt_destruct_all();
        self.neigh_destruct_all();
        self.fdb_destruct_all();
        self.vlan_destruct_all();
        self.port_destruct_all();
    }
}

struct ZoneRegistry {
    zones: HashMap<String, Arc<RwLock<Zone>>>,
    marks: Counter,
}

/// Registry of zones.
pub struct ZoneH {
    inner: RwLock<ZoneRegistry>,
    bindings: Arc<RwLock<ZoneBindings>>,
    dp: DpHandle,
    rule_cfg: RuleConfig,
}

impl ZoneH {
    /// Create the registry and its root zone.
    pub fn new(dp: DpHandle, rule_cfg: RuleConfig) -> Result<Self> {
        let zh = Self {
            inner: RwLock::new(ZoneRegistry {
                zones: HashMap::new(),
                marks: Counter::new(0, MAX_ZONES),
            }),
            bindings: Arc::new(RwLock::new(ZoneBindings::default())),
            dp,
            rule_cfg,
        };
        zh.zone_add(ROOT_ZONE)?;
        Ok(zh)
    }

    pub fn zone_add(&self, name: &str) -> Result<Arc<RwLock<Zone>>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.zones.contains_key(name) {
            return Err(ZoneError::Exists(name.to_string()));
        }
        let mark = inner.marks.get().map_err(|_| ZoneError::Number)?;
        let zone = Arc::new(RwLock::new(Zone::with_bindings(
            name,
            mark,
            self.dp.clone(),
            Arc::clone(&self.bindings),
            self.rule_cfg.clone(),
        )));
        inner.zones.insert(name.to_string(), Arc::clone(&zone));
        info!(zone = name, mark, "Zone added");
        Ok(zone)
    }

    pub fn zone_find(&self, name: &str) -> Option<Arc<RwLock<Zone>>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .zones
            .get(name)
            .cloned()
    }

    pub fn root(&self) -> Result<Arc<RwLock<Zone>>> {
        self.zone_find(ROOT_ZONE)
            .ok_or_else(|| ZoneError::NotExist(ROOT_ZONE.to_string()))
    }

    pub fn zone_delete(&self, name: &str) -> Result<()> {
        let zone = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let zone = inner
                .zones
                .remove(name)
                .ok_or_else(|| ZoneError::NotExist(name.to_string()))?;
            let mark = zone.read().unwrap_or_else(PoisonError::into_inner).mark;
            if let Err(e) = inner.marks.put(mark) {
                warn!(zone = name, error = %e, "Zone mark release failed");
            }
            zone
        };
        zone.write()
            .unwrap_or_else(PoisonError::into_inner)
            .destruct_all();
        info!(zone = name, "Zone deleted");
        Ok(())
    }

    /// All zones, in no particular order.
    pub fn zones(&self) -> Vec<Arc<RwLock<Zone>>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .zones
            .values()
            .cloned()
            .collect()
    }

    /// Zone a port is bound to.
    pub fn port_zone(&self, port: &str) -> Option<String> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .port_zone(port)
            .map(str::to_string)
    }

    /// Route pending completions to their zones.
    pub fn drain_completions(&self, rx: &Receiver<DpCompletion>) -> usize {
        let pending: Vec<DpCompletion> = rx.try_iter().collect();
        if pending.is_empty() {
            return 0;
        }
        let n = pending.len();
        let zones = self.zones();
        for c in pending {
            let zone = zones.iter().find(|z| {
                z.read().unwrap_or_else(PoisonError::into_inner).mark == c.zone
            });
            match zone {
                Some(z) => z
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .apply_completion(c),
                None => trace!(zone = c.zone, "Completion for unknown zone"),
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dp::DpStats;
    use crate::model::{MacAddr, PortKind};
    use crate::port::PortHwInfo;
    use crossbeam_channel::unbounded;

    fn registry() -> ZoneH {
        let (dp, _rx) = DpHandle::channel(4096);
        // The receiver is dropped; pushes are discarded with a warning
        ZoneH::new(dp, RuleConfig::default()).unwrap()
    }

    #[test]
    fn test_root_zone_created() {
        let zh = registry();
        let root = zh.root().unwrap();
        let z = root.read().unwrap();
        assert_eq!(z.name, ROOT_ZONE);
        assert_eq!(z.mark, 0);
    }

    #[test]
    fn test_zone_add_delete() {
        let zh = registry();
        let z = zh.zone_add("blue").unwrap();
        assert_eq!(z.read().unwrap().mark, 1);
        assert_eq!(
            zh.zone_add("blue").unwrap_err(),
            ZoneError::Exists("blue".into())
        );
        zh.zone_delete("blue").unwrap();
        assert!(zh.zone_find("blue").is_none());
        assert_eq!(
            zh.zone_delete("blue").unwrap_err().code(),
            ZoneError::NotExist(String::new()).code()
        );
    }

    #[test]
    fn test_port_binding_across_zones() {
        let zh = registry();
        let blue = zh.zone_add("blue").unwrap();
        let root = zh.root().unwrap();
        let hw = PortHwInfo {
            mac: MacAddr::new([2, 0, 0, 0, 0, 1]),
            link: true,
            state: true,
            mtu: 1500,
            ..Default::default()
        };

        root.write()
            .unwrap()
            .port_add("eth0", 2, PortKind::REAL, hw.clone(), Default::default())
            .unwrap();
        assert_eq!(zh.port_zone("eth0").as_deref(), Some(ROOT_ZONE));

        let err = blue
            .write()
            .unwrap()
            .port_add("eth0", 2, PortKind::REAL, hw, Default::default())
            .unwrap_err();
        assert_eq!(err.code(), -1006);
    }

    #[test]
    fn test_bindings() {
        let mut b = ZoneBindings::default();
        b.br_add("vlan10", "root").unwrap();
        b.br_add("vlan10", "root").unwrap();
        assert!(matches!(
            b.br_add("vlan10", "blue"),
            Err(ZoneError::Bound { .. })
        ));
        b.br_delete("vlan10").unwrap();
        assert_eq!(
            b.br_delete("vlan10"),
            Err(ZoneError::NotBound("vlan10".into()))
        );
        assert!(b.port_is_valid("eth9", "anything"));
    }

    #[test]
    fn test_drain_completions_routes_by_mark() {
        let zh = registry();
        let root = zh.root().unwrap();
        let hw = PortHwInfo {
            mac: MacAddr::new([2, 0, 0, 0, 0, 1]),
            ..Default::default()
        };
        root.write()
            .unwrap()
            .port_add("eth0", 2, PortKind::REAL, hw, Default::default())
            .unwrap();

        let (tx, rx) = unbounded();
        tx.send(DpCompletion {
            zone: 0,
            target: SyncTarget::Port("eth0".into()),
            status: DpStatus::CreateErr,
            stats: None,
        })
        .unwrap();
        tx.send(DpCompletion {
            zone: 9,
            target: SyncTarget::Port("eth0".into()),
            status: DpStatus::Ok,
            stats: Some(DpStats::default()),
        })
        .unwrap();

        assert_eq!(zh.drain_completions(&rx), 2);
        let z = root.read().unwrap();
        assert_eq!(z.ports.find("eth0").unwrap().sync, DpStatus::CreateErr);
    }
}
