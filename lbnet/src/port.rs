//! Port table.
//!
//! A port is any forwarding attachment: physical interfaces, bonds, VLAN
//! bridges and their members, VXLAN bridges and L3 tunnel devices. Kinds
//! compose, so re-adding an existing port with a compatible kind extends its
//! role instead of failing, and deleting with one kind strips only that role.
//!
//! Every real port, bond, wireguard and VTI device gets a bridge domain of its
//! own (`base + mark`) backed by an auto-created VLAN bridge, so each L2
//! domain has a single number usable as a datapath key.

use crate::counter::Counter;
use crate::dp::{DpWork, DpWorkKind, DpWorkOp, PortDpWork, RouterMacDpWork, SyncTarget};
use crate::model::{MacAddr, PortKind, PortProp, TunnelType};
use crate::zone::Zone;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bridge domain base for physical ports.
pub const REAL_PORT_BD_BASE: u32 = 3800;
/// Bridge domain base for bonds.
pub const BOND_BD_BASE: u32 = 4000;
/// Bridge domain base for wireguard devices.
pub const WG_BD_BASE: u32 = 4010;
/// Bridge domain base for VTI devices.
pub const VTI_BD_BASE: u32 = 4020;

pub const MAX_PORTS: u32 = 512;
pub const MAX_BONDS: u32 = 8;
pub const MAX_WGS: u32 = 8;
pub const MAX_VTIS: u32 = 8;

/// MAC of the VLAN bridges created for per-port bridge domains.
const AUTO_BD_MAC: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

/// Port table errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("port {0} exists")]
    Exists(String),

    #[error("no such port {0}")]
    NotExist(String),

    #[error("port {port}: no master {master}")]
    NoMaster { port: String, master: String },

    #[error("port {0}: mark allocation failed")]
    Counter(String),

    #[error("port {0}: index map inconsistent")]
    Map(String),

    #[error("port {0} belongs to another zone")]
    Zone(String),

    #[error("port {port}: no real device {real}")]
    NoRealDev { port: String, real: String },

    #[error("port {port}: property {prop} already set")]
    PropExists { port: String, prop: PortProp },

    #[error("port {port}: property {prop} not set")]
    PropNotExists { port: String, prop: PortProp },
}

impl PortError {
    pub fn code(&self) -> i32 {
        match self {
            PortError::Exists(_) => -1001,
            PortError::NotExist(_) => -1002,
            PortError::NoMaster { .. } => -1003,
            PortError::Counter(_) => -1004,
            PortError::Map(_) => -1005,
            PortError::Zone(_) => -1006,
            PortError::NoRealDev { .. } => -1007,
            PortError::PropExists { .. } => -1008,
            PortError::PropNotExists { .. } => -1009,
        }
    }
}

pub type Result<T> = std::result::Result<T, PortError>;

/// Hardware attributes as reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortHwInfo {
    pub mac: MacAddr,
    pub link: bool,
    pub state: bool,
    pub mtu: u32,
    /// Bridge or bond this port is enslaved to.
    #[serde(default)]
    pub master: String,
    /// Underlying physical port of a sub-interface or tunnel.
    #[serde(default)]
    pub real: String,
    #[serde(default)]
    pub tun_id: u32,
}

/// Bridge domain membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLayer2Info {
    /// Untagged membership.
    pub is_pvid: bool,
    pub vid: u32,
}

/// Which allocator a port number came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkPool {
    Port,
    Bond,
    Wg,
    Vti,
}

impl MarkPool {
    fn for_kind(kind: PortKind) -> Self {
        match kind {
            PortKind::BOND => MarkPool::Bond,
            PortKind::WG => MarkPool::Wg,
            PortKind::VTI => MarkPool::Vti,
            _ => MarkPool::Port,
        }
    }
}

/// Software state maintained by the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct PortSwInfo {
    pub os_id: i32,
    pub kind: PortKind,
    pub active: bool,
    /// Name of the real port backing this one.
    pub real: Option<String>,
    /// VXLAN bridge riding on this port.
    pub ovl: Option<String>,
    pub bpf_loaded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Port {
    pub name: String,
    pub port_no: u32,
    pub zone: String,
    pub hw: PortHwInfo,
    pub sw: PortSwInfo,
    pub l2: PortLayer2Info,
    pub props: PortProp,
    pub pol_num: u32,
    pub mirr_num: u32,
    pub sync: crate::dp::DpStatus,
    pool: MarkPool,
}

impl Port {
    pub fn kind(&self) -> PortKind {
        self.sw.kind
    }

    pub fn is_active(&self) -> bool {
        self.sw.active
    }
}

/// Port state change delivered to registered tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Down,
    Delete,
}

/// Tables that want to hear about port events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortNotifier {
    Fdb,
    Neigh,
}

/// Port view returned by [`Zone::ports_get`].
#[derive(Debug, Clone, Serialize)]
pub struct PortDump {
    pub name: String,
    pub port_no: u32,
    pub zone: String,
    pub sw: PortSwInfo,
    pub hw: PortHwInfo,
    pub l2: PortLayer2Info,
    pub props: PortProp,
    pub routed: bool,
    pub ipv4_addrs: Vec<String>,
    pub ipv6_addrs: Vec<String>,
    pub sync: crate::dp::DpStatus,
}

pub struct PortTable {
    ports: HashMap<String, Port>,
    by_os: HashMap<i32, String>,
    by_no: HashMap<u32, String>,
    port_mark: Counter,
    bond_mark: Counter,
    wg_mark: Counter,
    vti_mark: Counter,
    notifiers: Vec<PortNotifier>,
}

impl PortTable {
    pub fn new() -> Self {
        Self {
            ports: HashMap::new(),
            by_os: HashMap::new(),
            by_no: HashMap::new(),
            port_mark: Counter::new(1, MAX_PORTS),
            bond_mark: Counter::new(1, MAX_BONDS),
            wg_mark: Counter::new(1, MAX_WGS),
            vti_mark: Counter::new(1, MAX_VTIS),
            notifiers: Vec::new(),
        }
    }

    fn marks(&mut self, pool: MarkPool) -> &mut Counter {
        match pool {
            MarkPool::Port => &mut self.port_mark,
            MarkPool::Bond => &mut self.bond_mark,
            MarkPool::Wg => &mut self.wg_mark,
            MarkPool::Vti => &mut self.vti_mark,
        }
    }

    /// Register a table for port events.
    pub fn notifier_register(&mut self, notifier: PortNotifier) {
        if !self.notifiers.contains(&notifier) {
            self.notifiers.push(notifier);
        }
    }

    pub fn find(&self, name: &str) -> Option<&Port> {
        self.ports.get(name)
    }

    pub(crate) fn find_mut(&mut self, name: &str) -> Option<&mut Port> {
        self.ports.get_mut(name)
    }

    pub fn find_by_os_id(&self, os_id: i32) -> Option<&Port> {
        self.by_os.get(&os_id).and_then(|n| self.ports.get(n))
    }

    /// Lookup by hardware number. Only ports numbered from the main port
    /// pool are indexed; bonds and L3 tunnels use pools of their own.
    pub fn find_by_no(&self, port_no: u32) -> Option<&Port> {
        self.by_no.get(&port_no).and_then(|n| self.ports.get(n))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Ports enslaved to `master`.
    pub fn get_slaves(&self, master: &str) -> Vec<&Port> {
        self.ports
            .values()
            .filter(|p| p.hw.master == master)
            .collect()
    }

    /// Whether any slave of `master` carries a role in `kind`.
    pub fn has_tun_slaves(&self, master: &str, kind: PortKind) -> bool {
        self.ports
            .values()
            .any(|p| p.hw.master == master && p.sw.kind.intersects(kind))
    }

    /// Whether `mac` is the MAC of the named port, or of its real port.
    pub fn l2_addr_match(&self, name: &str, mac: MacAddr) -> bool {
        let Some(p) = self.ports.get(name) else {
            return false;
        };
        if p.hw.mac == mac {
            return true;
        }
        p.sw
            .real
            .as_deref()
            .and_then(|r| self.ports.get(r))
            .is_some_and(|rp| rp.hw.mac == mac)
    }

    /// Real port backing `p`, if any.
    pub fn real_of(&self, p: &Port) -> Option<&Port> {
        p.sw.real.as_deref().and_then(|r| self.ports.get(r))
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the datapath work for a port.
fn port_dp_works(ports: &mut PortTable, zone: u32, name: &str, op: DpWorkOp) -> Vec<DpWork> {
    let Some(p) = ports.find(name) else {
        return Vec::new();
    };
    let kind = p.sw.kind;
    let target = Some(SyncTarget::Port(name.to_string()));
    let real = ports.real_of(p);

    if kind == PortKind::VXLAN_BR {
        return Vec::new();
    }

    // VXLAN bridge enslaved to a VLAN terminates the tunnel on the underlay MAC
    if kind.contains(PortKind::VXLAN_BR | PortKind::VLAN_SIF) {
        let Some(up) = real else {
            return Vec::new();
        };
        let w = RouterMacDpWork {
            l2_addr: up.hw.mac,
            port_num: up.port_no,
            bd: p.l2.vid,
            tun_id: p.hw.tun_id,
            tun_type: Some(TunnelType::Vxlan),
            nh_num: 0,
        };
        return vec![DpWork::new(op, zone, target, DpWorkKind::RouterMac(w))];
    }

    // Tagged sub-interface of a bond
    if kind == PortKind::VLAN_SIF
        && let Some(rp) = real
        && rp.sw.kind.contains(PortKind::BOND)
    {
        let w = PortDpWork {
            os_port_num: rp.sw.os_id,
            port_num: rp.port_no,
            ing_vlan: p.l2.vid,
            set_bd: p.l2.vid,
            set_zone_num: zone,
            ..Default::default()
        };
        return vec![DpWork::new(op, zone, target, DpWorkKind::Port(w))];
    }

    // Bond as an untagged VLAN member: program every bond slave
    if kind.contains(PortKind::BOND | PortKind::VLAN_SIF) {
        return ports
            .get_slaves(name)
            .into_iter()
            .map(|sp| {
                let w = PortDpWork {
                    os_port_num: sp.sw.os_id,
                    port_num: sp.port_no,
                    ing_vlan: 0,
                    set_bd: p.l2.vid,
                    set_zone_num: zone,
                    prop: p.props,
                    set_pol: p.pol_num,
                    set_mirr: p.mirr_num,
                    load_ebpf: None,
                };
                DpWork::new(op, zone, None, DpWorkKind::Port(w))
            })
            .collect();
    }

    if !kind.is_leaf() && real.is_none_or(|rp| !rp.sw.kind.contains(PortKind::REAL)) {
        return Vec::new();
    }

    let (os_port_num, port_num) = match real {
        Some(rp) => (rp.sw.os_id, rp.port_no),
        None => (p.sw.os_id, p.port_no),
    };
    let mut w = PortDpWork {
        os_port_num,
        port_num,
        ing_vlan: if p.l2.is_pvid { 0 } else { p.l2.vid },
        set_bd: p.l2.vid,
        set_zone_num: zone,
        prop: p.props,
        set_pol: p.pol_num,
        set_mirr: p.mirr_num,
        load_ebpf: None,
    };

    let leaf_pvid = kind.is_leaf() && p.l2.is_pvid;
    let loaded = p.sw.bpf_loaded;
    if leaf_pvid {
        let load = match op {
            DpWorkOp::Create => !loaded,
            DpWorkOp::Remove => loaded,
            _ => false,
        };
        if load {
            w.load_ebpf = Some(name.to_string());
            if let Some(p) = ports.find_mut(name) {
                p.sw.bpf_loaded = op == DpWorkOp::Create;
            }
        }
    }

    vec![DpWork::new(op, zone, target, DpWorkKind::Port(w))]
}

impl Zone {
    pub(crate) fn port_dp(&mut self, name: &str, op: DpWorkOp) {
        for w in port_dp_works(&mut self.ports, self.mark, name, op) {
            self.dp.push(w);
        }
    }

    fn port_notify(&mut self, name: &str, event: PortEvent) {
        let notifiers = self.ports.notifiers.clone();
        for n in notifiers {
            match n {
                PortNotifier::Fdb => self.fdb_port_event(name, event),
                PortNotifier::Neigh => self.neigh_port_event(name, event),
            }
        }
    }

    /// Add a port, or extend the role of an existing one.
    pub fn port_add(
        &mut self,
        name: &str,
        os_id: i32,
        kind: PortKind,
        hw: PortHwInfo,
        l2: PortLayer2Info,
    ) -> Result<()> {
        if !self.zone_port_is_valid(name) {
            warn!(port = name, zone = %self.name, "Port add: bound to another zone");
            return Err(PortError::Zone(name.to_string()));
        }

        if self.ports.ports.contains_key(name) {
            return self.port_upgrade(name, kind, hw, l2);
        }

        let real = if !hw.real.is_empty() {
            if !self.ports.ports.contains_key(&hw.real) {
                warn!(port = name, real = %hw.real, "Port add: no real port");
                return Err(PortError::NoRealDev {
                    port: name.to_string(),
                    real: hw.real.clone(),
                });
            }
            Some(hw.real.clone())
        } else if kind == PortKind::VXLAN_BR {
            warn!(port = name, "Port add: VXLAN bridge needs a real port");
            return Err(PortError::NoRealDev {
                port: name.to_string(),
                real: String::new(),
            });
        } else {
            None
        };

        let pool = MarkPool::for_kind(kind);
        let port_no = self.ports.marks(pool).get().map_err(|e| {
            warn!(port = name, error = %e, "Port add: mark allocation failed");
            PortError::Counter(name.to_string())
        })?;

        let auto_bd_base = match kind {
            PortKind::REAL => Some(REAL_PORT_BD_BASE),
            PortKind::BOND => Some(BOND_BD_BASE),
            PortKind::WG => Some(WG_BD_BASE),
            PortKind::VTI => Some(VTI_BD_BASE),
            _ => None,
        };

        let l2 = if let Some(base) = auto_bd_base {
            let vid = port_no + base;
            let vhw = PortHwInfo {
                mac: AUTO_BD_MAC,
                link: true,
                state: true,
                mtu: 9000,
                ..Default::default()
            };
            if let Err(e) = self.vlan_add(vid, &format!("vlan{vid}"), -1, vhw) {
                warn!(port = name, vid, error = %e, "Port add: bridge domain not created");
            }
            PortLayer2Info { is_pvid: true, vid }
        } else if kind == PortKind::VXLAN_BR {
            if let Some(rp) = real.as_deref().and_then(|r| self.ports.find_mut(r)) {
                rp.sw.ovl = Some(name.to_string());
                rp.sw.kind.insert(PortKind::VXLAN_SIF);
                rp.hw.master = name.to_string();
            }
            PortLayer2Info {
                is_pvid: true,
                vid: hw.tun_id,
            }
        } else {
            l2
        };

        let port = Port {
            name: name.to_string(),
            port_no,
            zone: self.name.clone(),
            hw,
            sw: PortSwInfo {
                os_id,
                kind,
                active: true,
                real,
                ovl: None,
                bpf_loaded: false,
            },
            l2,
            props: PortProp::empty(),
            pol_num: 0,
            mirr_num: 0,
            sync: Default::default(),
            pool,
        };

        self.ports.ports.insert(name.to_string(), port);
        if pool == MarkPool::Port {
            self.ports.by_no.insert(port_no, name.to_string());
        }
        if os_id > 0 {
            self.ports.by_os.insert(os_id, name.to_string());
        }

        if let Err(e) = self.zone_port_bind(name) {
            warn!(port = name, error = %e, "Port add: zone binding failed");
        }
        self.port_dp(name, DpWorkOp::Create);

        info!(port = name, port_no, os_id, kind = %kind, "Port added");
        Ok(())
    }

    /// Re-add of an existing port: refresh attributes and compose roles.
    fn port_upgrade(
        &mut self,
        name: &str,
        kind: PortKind,
        hw: PortHwInfo,
        l2: PortLayer2Info,
    ) -> Result<()> {
        let (cur, went_down, mac_changed) = {
            let p = self
                .ports
                .find_mut(name)
                .ok_or_else(|| PortError::NotExist(name.to_string()))?;
            let was_up = p.hw.link && p.hw.state;
            p.hw.link = hw.link;
            p.hw.state = hw.state;
            p.hw.mtu = hw.mtu;
            let mac_changed = !p.sw.kind.is_l3_tunnel() && p.hw.mac != hw.mac;
            if mac_changed {
                p.hw.mac = hw.mac;
            }
            (
                p.sw.kind,
                was_up && !(hw.link && hw.state),
                mac_changed,
            )
        };

        if mac_changed {
            self.port_dp(name, DpWorkOp::Create);
        }
        if went_down {
            debug!(port = name, "Port went down");
            self.port_notify(name, PortEvent::Down);
        }

        if cur == PortKind::REAL {
            if kind == PortKind::VLAN_SIF && self.ports.find(name).is_some_and(|p| p.l2 != l2) {
                let real = if hw.real.is_empty() {
                    None
                } else if self.ports.ports.contains_key(&hw.real) {
                    Some(hw.real.clone())
                } else {
                    warn!(port = name, real = %hw.real, "Port add: no real port for sub-interface");
                    return Err(PortError::NoRealDev {
                        port: name.to_string(),
                        real: hw.real,
                    });
                };
                self.port_dp(name, DpWorkOp::Remove);
                if let Some(p) = self.ports.find_mut(name) {
                    p.hw.master = hw.master;
                    p.sw.kind.insert(PortKind::VLAN_SIF);
                    p.l2 = l2;
                    p.sw.real = real;
                }
                self.port_dp(name, DpWorkOp::Create);
                debug!(port = name, vid = l2.vid, "Port joined VLAN untagged");
                return Ok(());
            }

            if kind == PortKind::BOND_SIF {
                let Some(bond_no) = self.ports.find(&hw.master).map(|m| m.port_no) else {
                    warn!(port = name, master = %hw.master, "Port add: no bond master");
                    return Err(PortError::NoMaster {
                        port: name.to_string(),
                        master: hw.master,
                    });
                };
                self.port_dp(name, DpWorkOp::Remove);
                if let Some(p) = self.ports.find_mut(name) {
                    p.sw.kind.insert(PortKind::BOND_SIF);
                    p.hw.master = hw.master;
                    p.l2 = PortLayer2Info {
                        is_pvid: true,
                        vid: bond_no + BOND_BD_BASE,
                    };
                }
                debug!(port = name, "Port joined bond");
                return Ok(());
            }
        } else if cur == PortKind::BOND
            && kind == PortKind::VLAN_SIF
            && l2.is_pvid
            && self.ports.find(name).is_some_and(|p| p.l2 != l2)
        {
            self.port_dp(name, DpWorkOp::Remove);
            if let Some(p) = self.ports.find_mut(name) {
                p.l2 = l2;
                p.sw.kind.insert(PortKind::VLAN_SIF);
            }
            self.port_dp(name, DpWorkOp::Create);
            debug!(port = name, vid = l2.vid, "Bond joined VLAN untagged");
            return Ok(());
        }

        if cur == PortKind::VXLAN_BR && kind == PortKind::VLAN_SIF && l2.is_pvid {
            if let Some(p) = self.ports.find_mut(name) {
                p.hw.master = hw.master;
                p.sw.kind.insert(PortKind::VLAN_SIF);
            }
            self.port_dp(name, DpWorkOp::Remove);
            if let Some(p) = self.ports.find_mut(name) {
                p.l2 = l2;
            }
            self.port_dp(name, DpWorkOp::Create);
            debug!(port = name, vid = l2.vid, "VXLAN bridge joined VLAN");
            return Ok(());
        }

        if cur.contains(PortKind::REAL | PortKind::BOND_SIF) && kind == PortKind::REAL {
            if let Some(p) = self.ports.find_mut(name) {
                p.l2 = PortLayer2Info {
                    is_pvid: true,
                    vid: p.port_no + REAL_PORT_BD_BASE,
                };
                p.sw.kind.remove(PortKind::BOND_SIF);
                p.hw.master.clear();
            }
            self.port_dp(name, DpWorkOp::Create);
            debug!(port = name, "Port left bond");
            return Ok(());
        }

        debug!(port = name, kind = %kind, "Port add: exists");
        Err(PortError::Exists(name.to_string()))
    }

    /// Strip one composed role, or delete the port altogether.
    pub fn port_del(&mut self, name: &str, kind: PortKind) -> Result<()> {
        let Some(p) = self.ports.find(name) else {
            debug!(port = name, "Port delete: no such port");
            return Err(PortError::NotExist(name.to_string()));
        };
        let cur = p.sw.kind;
        let port_no = p.port_no;
        let tun_id = p.hw.tun_id;

        if cur.contains(PortKind::VXLAN_SIF) && kind == PortKind::VXLAN_SIF {
            self.port_vxlan_unslave(name);
            return Ok(());
        }

        let strip = if cur.contains(PortKind::REAL | PortKind::VLAN_SIF) && kind == PortKind::VLAN_SIF
        {
            Some((PortKind::VLAN_SIF, port_no + REAL_PORT_BD_BASE, true, true))
        } else if cur.contains(PortKind::VXLAN_BR | PortKind::VLAN_SIF) && kind == PortKind::VXLAN_BR
        {
            Some((PortKind::VLAN_SIF, tun_id, false, true))
        } else if cur.contains(PortKind::BOND | PortKind::VLAN_SIF) && kind == PortKind::VLAN_SIF {
            Some((PortKind::VLAN_SIF, port_no + BOND_BD_BASE, false, false))
        } else if cur.contains(PortKind::REAL | PortKind::BOND_SIF) && kind == PortKind::BOND_SIF {
            Some((PortKind::BOND_SIF, port_no + REAL_PORT_BD_BASE, false, true))
        } else {
            None
        };

        if let Some((role, vid, clear_real, clear_master)) = strip {
            self.port_dp(name, DpWorkOp::Remove);
            if let Some(p) = self.ports.find_mut(name) {
                p.sw.kind.remove(role);
                if clear_real {
                    p.sw.real = None;
                }
                if clear_master {
                    p.hw.master.clear();
                }
                p.l2 = PortLayer2Info { is_pvid: true, vid };
            }
            self.port_dp(name, DpWorkOp::Create);
            debug!(port = name, role = %role, "Port role removed");
            return Ok(());
        }

        if self.ports.by_no.get(&port_no).is_none_or(|n| n != name)
            && self.ports.find(name).is_some_and(|p| p.pool == MarkPool::Port)
        {
            warn!(port = name, port_no, "Port delete: number map inconsistent");
            return Err(PortError::Map(name.to_string()));
        }

        self.port_dp(name, DpWorkOp::Remove);

        let Some(mut p) = self.ports.ports.remove(name) else {
            return Err(PortError::NotExist(name.to_string()));
        };

        if cur.contains(PortKind::VXLAN_BR)
            && let Some(real) = p.sw.real.as_deref()
            && self
                .ports
                .find(real)
                .is_some_and(|rp| rp.sw.ovl.as_deref() == Some(name))
        {
            self.port_vxlan_unslave(real);
        }

        // Leaf ports own an auto bridge domain unless they joined a VLAN
        if cur.is_leaf()
            && !cur.is_slave()
            && let Err(e) = self.vlan_delete(p.l2.vid)
        {
            debug!(port = name, vid = p.l2.vid, error = %e, "Port delete: bridge domain kept");
        }

        p.sw.real = None;
        p.sw.active = false;
        self.zone_port_unbind(name);

        if self.ports.by_os.get(&p.sw.os_id).is_some_and(|n| n == name) {
            self.ports.by_os.remove(&p.sw.os_id);
        }
        if p.pool == MarkPool::Port {
            self.ports.by_no.remove(&p.port_no);
        }
        if let Err(e) = self.ports.marks(p.pool).put(p.port_no) {
            warn!(port = name, error = %e, "Port delete: mark release failed");
        }

        self.rt_delete_by_port(name);
        self.neigh_delete_by_port(name);
        self.ifa_delete_all(name);
        self.mirr_port_delete(name);
        self.pol_port_delete(name);
        self.port_notify(name, PortEvent::Delete);

        info!(port = name, port_no = p.port_no, "Port deleted");
        Ok(())
    }

    /// Detach an underlay port from the VXLAN bridge riding on it.
    fn port_vxlan_unslave(&mut self, name: &str) {
        let Some(p) = self.ports.find_mut(name) else {
            return;
        };
        p.sw.kind.remove(PortKind::VXLAN_SIF);
        p.sw.ovl = None;
        let master = std::mem::take(&mut p.hw.master);
        debug!(port = name, %master, "Port left VXLAN bridge");
    }

    /// Set or clear a property on a port and on the VLAN sub-interfaces
    /// riding on it.
    pub fn port_update_prop(
        &mut self,
        name: &str,
        prop: PortProp,
        set: bool,
        value: u32,
    ) -> Result<()> {
        if !self.zone_port_is_valid(name) {
            return Err(PortError::Zone(name.to_string()));
        }
        let Some(p) = self.ports.find(name) else {
            return Err(PortError::NotExist(name.to_string()));
        };

        if set && p.props.contains(prop) {
            return Err(PortError::PropExists {
                port: name.to_string(),
                prop,
            });
        }
        if !set && !p.props.contains(prop) {
            return Err(PortError::PropNotExists {
                port: name.to_string(),
                prop,
            });
        }

        let mut targets = vec![name.to_string()];
        targets.extend(
            self.ports
                .iter()
                .filter(|pe| {
                    pe.name != name
                        && pe.sw.real.as_deref() == Some(name)
                        && pe.sw.kind.contains(PortKind::VLAN_SIF)
                        && !pe.sw.kind.contains(PortKind::VXLAN_BR)
                })
                .map(|pe| pe.name.clone()),
        );

        for t in &targets {
            if let Some(pe) = self.ports.find_mut(t) {
                if set {
                    pe.props.insert(prop);
                    if prop.contains(PortProp::POL) {
                        pe.pol_num = value;
                    } else if prop.contains(PortProp::SPAN) {
                        pe.mirr_num = value;
                    }
                } else {
                    if prop.contains(PortProp::POL) {
                        pe.pol_num = 0;
                    } else if prop.contains(PortProp::SPAN) {
                        pe.mirr_num = 0;
                    }
                    pe.props.remove(prop);
                }
            }
            debug!(port = %t, prop = %prop, set, value, "Port property updated");
            self.port_dp(t, DpWorkOp::Create);
        }
        Ok(())
    }

    /// Dump all ports with their addresses.
    pub fn ports_get(&self) -> Vec<PortDump> {
        self.ports
            .iter()
            .map(|p| {
                let ipv4_addrs = self.l3.addr_strings(&p.name, true);
                let ipv6_addrs = self.l3.addr_strings(&p.name, false);
                PortDump {
                    name: p.name.clone(),
                    port_no: p.port_no,
                    zone: p.zone.clone(),
                    sw: p.sw.clone(),
                    hw: p.hw.clone(),
                    l2: p.l2,
                    props: p.props,
                    routed: !ipv4_addrs.is_empty() || !ipv6_addrs.is_empty(),
                    ipv4_addrs,
                    ipv6_addrs,
                    sync: p.sync,
                }
            })
            .collect()
    }

    /// Delete every port, members before their masters.
    pub fn port_destruct_all(&mut self) {
        let order = [
            (PortKind::VXLAN_SIF, PortKind::VXLAN_SIF),
            (PortKind::VLAN_SIF, PortKind::VLAN_SIF),
            (PortKind::BOND_SIF, PortKind::BOND_SIF),
            (PortKind::BOND, PortKind::BOND),
            (PortKind::VLAN_BR, PortKind::VLAN_BR),
            (PortKind::VXLAN_BR, PortKind::VXLAN_BR),
            (PortKind::REAL, PortKind::REAL),
        ];
        for (role, del_kind) in order {
            let names: Vec<String> = self
                .ports
                .iter()
                .filter(|p| p.sw.kind.contains(role))
                .map(|p| p.name.clone())
                .collect();
            for n in names {
                let _ = self.port_del(&n, del_kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dp::{DpHandle, DpWork};
    use crossbeam_channel::Receiver;

    fn zone() -> (Zone, Receiver<DpWork>) {
        let (dp, rx) = DpHandle::channel(4096);
        (Zone::new("root", 1, dp), rx)
    }

    fn hw(mac: [u8; 6]) -> PortHwInfo {
        PortHwInfo {
            mac: MacAddr::new(mac),
            link: true,
            state: true,
            mtu: 1500,
            ..Default::default()
        }
    }

    fn drain(rx: &Receiver<DpWork>) -> Vec<DpWork> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_real_port_gets_bridge_domain() {
        let (mut z, rx) = zone();
        z.port_add("eth0", 2, PortKind::REAL, hw([2, 0, 0, 0, 0, 1]), Default::default())
            .unwrap();

        let p = z.ports.find("eth0").unwrap();
        assert_eq!(p.port_no, 1);
        assert_eq!(p.l2, PortLayer2Info { is_pvid: true, vid: 3801 });
        assert!(p.sw.bpf_loaded);
        assert!(z.vlans.find(3801).is_some());
        assert_eq!(z.ports.find_by_os_id(2).unwrap().name, "eth0");
        assert_eq!(z.ports.find_by_no(1).unwrap().name, "eth0");

        let works = drain(&rx);
        let port_work = works
            .iter()
            .find_map(|w| match &w.kind {
                DpWorkKind::Port(pw) if w.target == Some(SyncTarget::Port("eth0".into())) => {
                    Some(pw.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(port_work.set_bd, 3801);
        assert_eq!(port_work.ing_vlan, 0);
        assert_eq!(port_work.load_ebpf.as_deref(), Some("eth0"));
    }

    #[test]
    fn test_role_upgrade_union() {
        let (mut z, _rx) = zone();
        z.port_add("eth1", 3, PortKind::REAL, hw([2, 0, 0, 0, 0, 2]), Default::default())
            .unwrap();
        z.port_add(
            "eth1",
            3,
            PortKind::VLAN_SIF,
            hw([2, 0, 0, 0, 0, 2]),
            PortLayer2Info { is_pvid: true, vid: 100 },
        )
        .unwrap();

        let p = z.ports.find("eth1").unwrap();
        assert_eq!(p.kind(), PortKind::REAL | PortKind::VLAN_SIF);
        assert_eq!(p.l2.vid, 100);

        // Identical re-add is rejected
        let err = z
            .port_add(
                "eth1",
                3,
                PortKind::VLAN_SIF,
                hw([2, 0, 0, 0, 0, 2]),
                PortLayer2Info { is_pvid: true, vid: 100 },
            )
            .unwrap_err();
        assert_eq!(err, PortError::Exists("eth1".into()));
        assert_eq!(err.code(), -1001);
    }

    #[test]
    fn test_identical_readd_exists() {
        let (mut z, _rx) = zone();
        let h = hw([2, 0, 0, 0, 0, 3]);
        z.port_add("eth2", 4, PortKind::REAL, h.clone(), Default::default())
            .unwrap();
        assert_eq!(
            z.port_add("eth2", 4, PortKind::REAL, h, Default::default()),
            Err(PortError::Exists("eth2".into()))
        );
    }

    #[test]
    fn test_role_strip_restores_bd() {
        let (mut z, _rx) = zone();
        z.port_add("eth0", 2, PortKind::REAL, hw([2, 0, 0, 0, 0, 1]), Default::default())
            .unwrap();
        let no = z.ports.find("eth0").unwrap().port_no;
        z.port_add(
            "eth0",
            2,
            PortKind::VLAN_SIF,
            hw([2, 0, 0, 0, 0, 1]),
            PortLayer2Info { is_pvid: true, vid: 10 },
        )
        .unwrap();

        z.port_del("eth0", PortKind::VLAN_SIF).unwrap();
        let p = z.ports.find("eth0").unwrap();
        assert_eq!(p.kind(), PortKind::REAL);
        assert_eq!(p.l2.vid, no + REAL_PORT_BD_BASE);
    }

    #[test]
    fn test_bond_membership() {
        let (mut z, _rx) = zone();
        z.port_add("bond0", 10, PortKind::BOND, hw([2, 0, 0, 0, 1, 0]), Default::default())
            .unwrap();
        z.port_add("eth0", 2, PortKind::REAL, hw([2, 0, 0, 0, 0, 1]), Default::default())
            .unwrap();
        assert_eq!(z.ports.find("bond0").unwrap().l2.vid, BOND_BD_BASE + 1);

        let mut slave_hw = hw([2, 0, 0, 0, 0, 1]);
        slave_hw.master = "nobond".into();
        assert!(matches!(
            z.port_add("eth0", 2, PortKind::BOND_SIF, slave_hw.clone(), Default::default()),
            Err(PortError::NoMaster { .. })
        ));

        slave_hw.master = "bond0".into();
        z.port_add("eth0", 2, PortKind::BOND_SIF, slave_hw, Default::default())
            .unwrap();
        let p = z.ports.find("eth0").unwrap();
        assert!(p.kind().contains(PortKind::BOND_SIF));
        assert_eq!(p.l2.vid, BOND_BD_BASE + 1);
        assert_eq!(z.ports.get_slaves("bond0").len(), 1);

        // Re-adding as a plain real port leaves the bond
        z.port_add("eth0", 2, PortKind::REAL, hw([2, 0, 0, 0, 0, 1]), Default::default())
            .unwrap();
        let p = z.ports.find("eth0").unwrap();
        assert_eq!(p.kind(), PortKind::REAL);
        assert!(p.hw.master.is_empty());
    }

    #[test]
    fn test_vxlan_bridge_needs_real() {
        let (mut z, _rx) = zone();
        let mut vh = hw([2, 0, 0, 0, 2, 0]);
        vh.tun_id = 50;
        assert!(matches!(
            z.port_add("vxlan50", 20, PortKind::VXLAN_BR, vh.clone(), Default::default()),
            Err(PortError::NoRealDev { .. })
        ));

        z.port_add("eth0", 2, PortKind::REAL, hw([2, 0, 0, 0, 0, 1]), Default::default())
            .unwrap();
        vh.real = "eth0".into();
        z.port_add("vxlan50", 20, PortKind::VXLAN_BR, vh, Default::default())
            .unwrap();

        let under = z.ports.find("eth0").unwrap();
        assert!(under.kind().contains(PortKind::VXLAN_SIF));
        assert_eq!(under.sw.ovl.as_deref(), Some("vxlan50"));
        assert_eq!(z.ports.find("vxlan50").unwrap().l2.vid, 50);
        assert!(z.ports.has_tun_slaves("vxlan50", PortKind::VXLAN_SIF));

        z.port_del("vxlan50", PortKind::VXLAN_BR).unwrap();
        let under = z.ports.find("eth0").unwrap();
        assert!(under.sw.ovl.is_none());
        assert_eq!(under.kind(), PortKind::REAL);
        assert!(under.hw.master.is_empty());
        assert!(!z.ports.has_tun_slaves("vxlan50", PortKind::VXLAN_SIF));
    }

    #[test]
    fn test_underlay_delete_after_vxlan_bridge() {
        let (mut z, _rx) = zone();
        z.port_add("eth0", 2, PortKind::REAL, hw([2, 0, 0, 0, 0, 1]), Default::default())
            .unwrap();
        let vid = z.ports.find("eth0").unwrap().l2.vid;
        let auto_bd = format!("vlan{vid}");
        assert!(z.ports.find(&auto_bd).is_some());

        let mut vh = hw([2, 0, 0, 0, 2, 0]);
        vh.tun_id = 50;
        vh.real = "eth0".into();
        z.port_add("vxlan50", 20, PortKind::VXLAN_BR, vh, Default::default())
            .unwrap();
        z.port_del("vxlan50", PortKind::VXLAN_BR).unwrap();

        z.port_del("eth0", PortKind::REAL).unwrap();
        assert!(z.ports.find("eth0").is_none());
        assert!(z.ports.find(&auto_bd).is_none());
    }

    #[test]
    fn test_underlay_delete_with_vxlan_bridge() {
        let (mut z, _rx) = zone();
        z.port_add("eth0", 2, PortKind::REAL, hw([2, 0, 0, 0, 0, 1]), Default::default())
            .unwrap();
        let auto_bd = format!("vlan{}", z.ports.find("eth0").unwrap().l2.vid);
        let mut vh = hw([2, 0, 0, 0, 2, 0]);
        vh.tun_id = 50;
        vh.real = "eth0".into();
        z.port_add("vxlan50", 20, PortKind::VXLAN_BR, vh, Default::default())
            .unwrap();

        // Stripping the tunnel role keeps the port
        z.port_del("eth0", PortKind::VXLAN_SIF).unwrap();
        assert_eq!(z.ports.find("eth0").unwrap().kind(), PortKind::REAL);
        assert!(!z.ports.has_tun_slaves("vxlan50", PortKind::VXLAN_SIF));

        z.port_add("eth1", 3, PortKind::REAL, hw([2, 0, 0, 0, 0, 3]), Default::default())
            .unwrap();
        z.port_destruct_all();
        assert!(z.ports.find("eth0").is_none());
        assert!(z.ports.find(&auto_bd).is_none());
    }

    #[test]
    fn test_delete_frees_mark() {
        let (mut z, _rx) = zone();
        z.port_add("tap0", 7, PortKind::VLAN_SIF, hw([2, 0, 0, 0, 0, 7]), PortLayer2Info {
            is_pvid: false,
            vid: 5,
        })
        .unwrap();
        let no = z.ports.find("tap0").unwrap().port_no;
        z.port_del("tap0", PortKind::VLAN_SIF).unwrap();
        assert!(z.ports.find("tap0").is_none());
        assert!(z.ports.find_by_os_id(7).is_none());
        assert!(!z.ports.port_mark.is_allocated(no));
        assert_eq!(
            z.port_del("tap0", PortKind::VLAN_SIF),
            Err(PortError::NotExist("tap0".into()))
        );
    }

    #[test]
    fn test_update_prop_propagates() {
        let (mut z, rx) = zone();
        z.port_add("eth0", 2, PortKind::REAL, hw([2, 0, 0, 0, 0, 1]), Default::default())
            .unwrap();
        let mut sub = hw([2, 0, 0, 0, 0, 1]);
        sub.real = "eth0".into();
        z.port_add("eth0.100", 4100, PortKind::VLAN_SIF, sub, PortLayer2Info {
            is_pvid: false,
            vid: 100,
        })
        .unwrap();
        drain(&rx);

        z.port_update_prop("eth0", PortProp::POL, true, 3).unwrap();
        assert_eq!(z.ports.find("eth0").unwrap().pol_num, 3);
        assert_eq!(z.ports.find("eth0.100").unwrap().pol_num, 3);
        assert!(z.ports.find("eth0.100").unwrap().props.contains(PortProp::POL));
        assert_eq!(drain(&rx).len(), 2);

        assert!(matches!(
            z.port_update_prop("eth0", PortProp::POL, true, 3),
            Err(PortError::PropExists { .. })
        ));

        z.port_update_prop("eth0", PortProp::POL, false, 0).unwrap();
        assert!(z.ports.find("eth0.100").unwrap().props.is_empty());
        assert!(matches!(
            z.port_update_prop("eth0", PortProp::POL, false, 0),
            Err(PortError::PropNotExists { .. })
        ));
    }

    #[test]
    fn test_l2_addr_match() {
        let (mut z, _rx) = zone();
        z.port_add("eth0", 2, PortKind::REAL, hw([2, 0, 0, 0, 0, 1]), Default::default())
            .unwrap();
        let mut sub = hw([2, 0, 0, 0, 0, 9]);
        sub.real = "eth0".into();
        z.port_add("eth0.7", 4903, PortKind::VLAN_SIF, sub, PortLayer2Info {
            is_pvid: false,
            vid: 7,
        })
        .unwrap();
        assert!(z.ports.l2_addr_match("eth0.7", MacAddr::new([2, 0, 0, 0, 0, 1])));
        assert!(z.ports.l2_addr_match("eth0.7", MacAddr::new([2, 0, 0, 0, 0, 9])));
        assert!(!z.ports.l2_addr_match("eth0.7", MacAddr::new([2, 0, 0, 0, 0, 5])));
    }

    #[test]
    fn test_destruct_all() {
        let (mut z, _rx) = zone();
        z.port_add("eth0", 2, PortKind::REAL, hw([2, 0, 0, 0, 0, 1]), Default::default())
            .unwrap();
        z.port_add("eth1", 3, PortKind::REAL, hw([2, 0, 0, 0, 0, 2]), Default::default())
            .unwrap();
        z.port_destruct_all();
        assert!(z.ports.is_empty());
        assert_eq!(z.ports.port_mark.available(), MAX_PORTS as usize);
    }
}
