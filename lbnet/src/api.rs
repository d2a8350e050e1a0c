//! Inbound control interface.
//!
//! REST handlers and network-event listeners mutate the core only through
//! [`NetApi`]. Every request is a plain value struct; every reply is a
//! `Result` whose error carries the integer result code.

use crate::dp::{CtInfo, DatapathError, DpMap, DpWork, DpWorkKind, DpWorkOp, TableDpWork};
use crate::error::{NetError, Result};
use crate::fdb::{FdbAttr, FdbDump, FdbKey, FdbType};
use crate::l3::IfaDump;
use crate::mirror::{MirrDump, MirrInfo};
use crate::model::{AttachPoint, MacAddr, PortKind};
use crate::neighbor::{NeighAttr, NeighDump};
use crate::policer::{PolDump, PolInfo};
use crate::port::{PortDump, PortHwInfo, PortLayer2Info};
use crate::route::{RouteDump, RtAttr, RtNhAttr};
use crate::rules::{
    EpHostDump, EpHostOpts, FwOptArg, FwRuleArg, FwRuleDump, LbEndPointArg, LbRuleDump,
    LbServiceArg, ep_key,
};
use crate::session::{SessDump, SessTun, UlClArg, UlClDump};
use crate::vlan::VlanDump;
use crate::zone::{Zone, ZoneH};
use crossbeam_channel::bounded;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// How long a conntrack dump may take.
pub const CT_DUMP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortMod {
    pub dev: String,
    pub link_index: i32,
    pub kind: PortKind,
    pub hw: PortHwInfo,
    pub l2: PortLayer2Info,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VlanMod {
    pub vid: u32,
    pub dev: String,
    pub link_index: i32,
    pub hw: PortHwInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VlanPortMod {
    pub vid: u32,
    pub dev: String,
    pub tagged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddrMod {
    pub dev: String,
    /// Address with prefix length, e.g. `10.0.0.1/24`.
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighMod {
    pub ip: IpAddr,
    pub link_index: i32,
    #[serde(default)]
    pub mac: MacAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdbMod {
    pub mac: MacAddr,
    pub bd: u32,
    pub dev: String,
    #[serde(default)]
    pub dst: Option<IpAddr>,
    #[serde(default)]
    pub kind: FdbType,
}

impl FdbMod {
    fn key(&self) -> FdbKey {
        FdbKey::new(self.mac, self.bd)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMod {
    pub dst: IpNet,
    #[serde(default)]
    pub attr: RtAttr,
    #[serde(default)]
    pub nhs: Vec<RtNhAttr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LbRuleMod {
    pub serv: LbServiceArg,
    pub eps: Vec<LbEndPointArg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FwRuleMod {
    pub rule: FwRuleArg,
    pub opts: FwOptArg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndPointMod {
    pub host: IpAddr,
    /// Overrides the derived host key when set.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub opts: EpHostOpts,
}

impl EndPointMod {
    fn key(&self) -> String {
        if self.name.is_empty() {
            ep_key(self.host, self.opts.probe_type, self.opts.probe_port)
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrMod {
    pub name: String,
    #[serde(default)]
    pub info: MirrInfo,
    pub attach: AttachPoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolMod {
    pub name: String,
    pub info: PolInfo,
    pub attach: AttachPoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMod {
    pub ident: String,
    pub ip: IpAddr,
    pub an_tun: SessTun,
    pub cn_tun: SessTun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUlClMod {
    pub ident: String,
    pub args: UlClArg,
}

/// Capability interface of the control plane.
pub trait NetApi: Send + Sync {
    fn port_add(&self, m: &PortMod) -> Result<()>;
    fn port_del(&self, m: &PortMod) -> Result<()>;
    fn port_get(&self) -> Result<Vec<PortDump>>;

    fn vlan_add(&self, m: &VlanMod) -> Result<()>;
    fn vlan_del(&self, m: &VlanMod) -> Result<()>;
    fn vlan_get(&self) -> Result<Vec<VlanDump>>;
    fn vlan_port_add(&self, m: &VlanPortMod) -> Result<()>;
    fn vlan_port_del(&self, m: &VlanPortMod) -> Result<()>;

    fn addr_add(&self, m: &IpAddrMod) -> Result<()>;
    fn addr_del(&self, m: &IpAddrMod) -> Result<()>;
    fn addr_get(&self) -> Result<Vec<IfaDump>>;

    fn neigh_add(&self, m: &NeighMod) -> Result<()>;
    fn neigh_del(&self, m: &NeighMod) -> Result<()>;
    fn neigh_get(&self) -> Result<Vec<NeighDump>>;

    fn fdb_add(&self, m: &FdbMod) -> Result<()>;
    fn fdb_del(&self, m: &FdbMod) -> Result<()>;
    fn fdb_get(&self) -> Result<Vec<FdbDump>>;

    fn route_add(&self, m: &RouteMod) -> Result<()>;
    fn route_del(&self, m: &RouteMod) -> Result<()>;
    fn route_get(&self) -> Result<Vec<RouteDump>>;

    fn lb_rule_add(&self, m: &LbRuleMod) -> Result<()>;
    fn lb_rule_del(&self, m: &LbRuleMod) -> Result<()>;
    fn lb_rule_get(&self) -> Result<Vec<LbRuleDump>>;

    fn fw_rule_add(&self, m: &FwRuleMod) -> Result<()>;
    fn fw_rule_del(&self, m: &FwRuleMod) -> Result<()>;
    fn fw_rule_get(&self) -> Result<Vec<FwRuleDump>>;

    /// Returns the host key.
    fn ep_host_add(&self, m: &EndPointMod) -> Result<String>;
    fn ep_host_del(&self, m: &EndPointMod) -> Result<()>;
    fn ep_host_get(&self) -> Result<Vec<EpHostDump>>;

    fn mirr_add(&self, m: &MirrMod) -> Result<()>;
    fn mirr_del(&self, m: &MirrMod) -> Result<()>;
    fn mirr_get(&self) -> Result<Vec<MirrDump>>;

    fn pol_add(&self, m: &PolMod) -> Result<()>;
    fn pol_del(&self, m: &PolMod) -> Result<()>;
    fn pol_get(&self) -> Result<Vec<PolDump>>;

    fn session_add(&self, m: &SessionMod) -> Result<()>;
    fn session_del(&self, m: &SessionMod) -> Result<()>;
    fn session_get(&self) -> Result<Vec<SessDump>>;
    fn session_ulcl_add(&self, m: &SessionUlClMod) -> Result<()>;
    fn session_ulcl_del(&self, m: &SessionUlClMod) -> Result<()>;
    fn session_ulcl_get(&self) -> Result<Vec<UlClDump>>;

    /// Current connection-tracking entries of the datapath.
    fn ct_info_get(&self) -> Result<Vec<CtInfo>>;
}

/// [`NetApi`] over the root zone of a registry.
pub struct NetApiImpl {
    zh: Arc<ZoneH>,
}

impl NetApiImpl {
    pub fn new(zh: Arc<ZoneH>) -> Self {
        Self { zh }
    }

    fn root(&self) -> Result<Arc<RwLock<Zone>>> {
        Ok(self.zh.root()?)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Zone) -> Result<T>) -> Result<T> {
        let zone = self.root()?;
        let mut z = zone.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut z)
    }

    fn read<T>(&self, f: impl FnOnce(&Zone) -> T) -> Result<T> {
        let zone = self.root()?;
        let z = zone.read().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&z))
    }

    fn ct_dump(&self, map: DpMap) -> Result<Vec<CtInfo>> {
        let (dp, mark) = self.read(|z| (z.dp.clone(), z.mark))?;
        let (tx, rx) = bounded(1);
        dp.push(DpWork::new(
            DpWorkOp::TableGet,
            mark,
            None,
            DpWorkKind::Table(TableDpWork {
                map,
                reply: Some(tx),
            }),
        ));
        rx.recv_timeout(CT_DUMP_TIMEOUT)
            .map_err(|e| NetError::from(DatapathError::Table(format!("{map:?}: {e}"))))
    }
}

impl NetApi for NetApiImpl {
    fn port_add(&self, m: &PortMod) -> Result<()> {
        debug!(port = %m.dev, kind = %m.kind, "API port add");
        self.write(|z| Ok(z.port_add(&m.dev, m.link_index, m.kind, m.hw.clone(), m.l2)?))
    }

    fn port_del(&self, m: &PortMod) -> Result<()> {
        debug!(port = %m.dev, kind = %m.kind, "API port delete");
        self.write(|z| Ok(z.port_del(&m.dev, m.kind)?))
    }

    fn port_get(&self) -> Result<Vec<PortDump>> {
        self.read(|z| z.ports_get())
    }

    fn vlan_add(&self, m: &VlanMod) -> Result<()> {
        self.write(|z| Ok(z.vlan_add(m.vid, &m.dev, m.link_index, m.hw.clone())?))
    }

    fn vlan_del(&self, m: &VlanMod) -> Result<()> {
        self.write(|z| Ok(z.vlan_delete(m.vid)?))
    }

    fn vlan_get(&self) -> Result<Vec<VlanDump>> {
        self.read(|z| z.vlan_get())
    }

    fn vlan_port_add(&self, m: &VlanPortMod) -> Result<()> {
        self.write(|z| Ok(z.vlan_port_add(m.vid, &m.dev, m.tagged)?))
    }

    fn vlan_port_del(&self, m: &VlanPortMod) -> Result<()> {
        self.write(|z| Ok(z.vlan_port_delete(m.vid, &m.dev, m.tagged)?))
    }

    fn addr_add(&self, m: &IpAddrMod) -> Result<()> {
        self.write(|z| Ok(z.ifa_add(&m.dev, &m.ip)?))
    }

    fn addr_del(&self, m: &IpAddrMod) -> Result<()> {
        self.write(|z| Ok(z.ifa_delete(&m.dev, &m.ip)?))
    }

    fn addr_get(&self) -> Result<Vec<IfaDump>> {
        self.read(|z| z.ifa_get())
    }

    fn neigh_add(&self, m: &NeighMod) -> Result<()> {
        let attr = NeighAttr {
            os_link: m.link_index,
            mac: m.mac,
        };
        self.write(|z| Ok(z.neigh_add(m.ip, attr)?))
    }

    fn neigh_del(&self, m: &NeighMod) -> Result<()> {
        self.write(|z| Ok(z.neigh_delete(m.ip)?))
    }

    fn neigh_get(&self) -> Result<Vec<NeighDump>> {
        self.read(|z| z.neighs_get())
    }

    fn fdb_add(&self, m: &FdbMod) -> Result<()> {
        let attr = FdbAttr {
            oif: m.dev.clone(),
            dst: m.dst,
            kind: m.kind,
        };
        self.write(|z| Ok(z.fdb_add(m.key(), attr)?))
    }

    fn fdb_del(&self, m: &FdbMod) -> Result<()> {
        self.write(|z| Ok(z.fdb_del(&m.key())?))
    }

    fn fdb_get(&self) -> Result<Vec<FdbDump>> {
        self.read(|z| z.fdbs_get())
    }

    fn route_add(&self, m: &RouteMod) -> Result<()> {
        self.write(|z| Ok(z.rt_add(m.dst, m.attr, m.nhs.clone())?))
    }

    fn route_del(&self, m: &RouteMod) -> Result<()> {
        self.write(|z| Ok(z.rt_delete(m.dst)?))
    }

    fn route_get(&self) -> Result<Vec<RouteDump>> {
        self.read(|z| z.routes_get())
    }

    fn lb_rule_add(&self, m: &LbRuleMod) -> Result<()> {
        self.write(|z| Ok(z.nat_lb_rule_add(m.serv.clone(), m.eps.clone())?))
    }

    fn lb_rule_del(&self, m: &LbRuleMod) -> Result<()> {
        self.write(|z| Ok(z.nat_lb_rule_delete(&m.serv)?))
    }

    fn lb_rule_get(&self) -> Result<Vec<LbRuleDump>> {
        self.read(|z| z.nat_lb_rules_get())
    }

    fn fw_rule_add(&self, m: &FwRuleMod) -> Result<()> {
        self.write(|z| Ok(z.fw_rule_add(m.rule.clone(), m.opts.clone())?))
    }

    fn fw_rule_del(&self, m: &FwRuleMod) -> Result<()> {
        self.write(|z| Ok(z.fw_rule_delete(&m.rule)?))
    }

    fn fw_rule_get(&self) -> Result<Vec<FwRuleDump>> {
        self.read(|z| z.fw_rules_get())
    }

    fn ep_host_add(&self, m: &EndPointMod) -> Result<String> {
        let name = (!m.name.is_empty()).then_some(m.name.as_str());
        self.write(|z| Ok(z.rules.ep_host_add(true, m.host, name, m.opts.clone())?))
    }

    fn ep_host_del(&self, m: &EndPointMod) -> Result<()> {
        self.write(|z| Ok(z.rules.ep_host_delete(true, &m.key())?))
    }

    fn ep_host_get(&self) -> Result<Vec<EpHostDump>> {
        self.read(|z| z.rules.ep_hosts_get())
    }

    fn mirr_add(&self, m: &MirrMod) -> Result<()> {
        self.write(|z| Ok(z.mirr_add(&m.name, m.info.clone(), m.attach.clone())?))
    }

    fn mirr_del(&self, m: &MirrMod) -> Result<()> {
        self.write(|z| Ok(z.mirr_delete(&m.name)?))
    }

    fn mirr_get(&self) -> Result<Vec<MirrDump>> {
        self.read(|z| z.mirrs_get())
    }

    fn pol_add(&self, m: &PolMod) -> Result<()> {
        self.write(|z| Ok(z.pol_add(&m.name, m.info, m.attach.clone())?))
    }

    fn pol_del(&self, m: &PolMod) -> Result<()> {
        self.write(|z| Ok(z.pol_delete(&m.name)?))
    }

    fn pol_get(&self) -> Result<Vec<PolDump>> {
        self.read(|z| z.pols_get())
    }

    fn session_add(&self, m: &SessionMod) -> Result<()> {
        debug!(user = %m.ident, ip = %m.ip, "API session add");
        self.write(|z| Ok(z.sess_add(&m.ident, m.ip, m.an_tun, m.cn_tun)?))
    }

    fn session_del(&self, m: &SessionMod) -> Result<()> {
        self.write(|z| Ok(z.sess_delete(&m.ident)?))
    }

    fn session_get(&self) -> Result<Vec<SessDump>> {
        self.read(|z| z.sessions_get())
    }

    fn session_ulcl_add(&self, m: &SessionUlClMod) -> Result<()> {
        self.write(|z| Ok(z.ul_cl_add(&m.ident, m.args)?))
    }

    fn session_ulcl_del(&self, m: &SessionUlClMod) -> Result<()> {
        self.write(|z| Ok(z.ul_cl_delete(&m.ident, m.args)?))
    }

    fn session_ulcl_get(&self) -> Result<Vec<UlClDump>> {
        self.read(|z| z.ul_cls_get())
    }

    fn ct_info_get(&self) -> Result<Vec<CtInfo>> {
        let mut seen = HashSet::new();
        let mut all = Vec::new();
        for map in [DpMap::Ct4, DpMap::Ct6] {
            for ct in self.ct_dump(map)? {
                if seen.insert(ct.key()) {
                    all.push(ct);
                }
            }
        }
        Ok(all)
    }
}
