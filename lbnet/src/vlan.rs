//! VLAN bridge domains.
//!
//! A VLAN is a bridge port named `vlan<vid>` plus its tagged and untagged
//! member sets. Tagged membership creates a `<port>.<vid>` sub-interface;
//! untagged membership adds the VLAN sub-interface role to the member port.

use crate::dp::{DpStats, DpWork, DpWorkKind, DpWorkOp, DpMap, StatDpWork, SyncTarget};
use crate::model::PortKind;
use crate::port::{PortHwInfo, PortLayer2Info};
use crate::zone::Zone;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Highest usable VLAN id plus one.
pub const MAX_VLANS: u32 = 4093;

/// Stride of the OS index space reserved per VLAN for tagged sub-interfaces.
pub const MAX_REAL_INTERFACES: u32 = 128;

/// VLAN errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VlanError {
    #[error("vlan {0} exists")]
    Exists(u32),

    #[error("vlan {0} does not exist")]
    NotExist(u32),

    #[error("vlan id {0} out of range")]
    Range(u32),

    #[error("vlan {0}: bridge port not created")]
    AddBrp(u32),

    #[error("vlan {0} still has member ports")]
    MpExist(u32),

    #[error("vlan {vid}: no port {port}")]
    PortPhy { vid: u32, port: String },

    #[error("vlan {vid}: {port} is already a member")]
    PortExist { vid: u32, port: String },

    #[error("vlan {vid}: {port} cannot be tagged")]
    PortTagged { vid: u32, port: String },

    #[error("vlan {vid}: {port} is not a member")]
    NoPort { vid: u32, port: String },

    #[error("vlan {vid}: member port {port} not created")]
    PortCreate { vid: u32, port: String },

    #[error("vlan {0}: bridge bound to another zone")]
    Zone(u32),
}

impl VlanError {
    pub fn code(&self) -> i32 {
        match self {
            VlanError::Exists(_) => -2001,
            VlanError::NotExist(_) => -2002,
            VlanError::Range(_) => -2003,
            VlanError::AddBrp(_) => -2004,
            VlanError::MpExist(_) => -2005,
            VlanError::PortPhy { .. } => -2006,
            VlanError::PortExist { .. } => -2007,
            VlanError::PortTagged { .. } => -2008,
            VlanError::NoPort { .. } => -2009,
            VlanError::PortCreate { .. } => -2010,
            VlanError::Zone(_) => -2011,
        }
    }
}

pub type Result<T> = std::result::Result<T, VlanError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VlanStats {
    pub in_bytes: u64,
    pub in_packets: u64,
    pub out_bytes: u64,
    pub out_packets: u64,
}

#[derive(Debug, Clone)]
pub struct Vlan {
    pub vid: u32,
    pub name: String,
    pub zone: String,
    /// Tagged members: member port name to sub-interface name.
    pub tagged: BTreeMap<String, String>,
    pub untagged: BTreeSet<String>,
    pub stats: VlanStats,
}

impl Vlan {
    pub fn has_members(&self) -> bool {
        !self.tagged.is_empty() || !self.untagged.is_empty()
    }

    pub(crate) fn set_stats(&mut self, tx: bool, s: DpStats) {
        if tx {
            self.stats.out_bytes = s.bytes;
            self.stats.out_packets = s.packets;
        } else {
            self.stats.in_bytes = s.bytes;
            self.stats.in_packets = s.packets;
        }
    }
}

/// One membership entry of [`VlanDump`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VlanMember {
    pub dev: String,
    pub tagged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VlanDump {
    pub vid: u32,
    pub dev: String,
    pub members: Vec<VlanMember>,
    pub stats: VlanStats,
}

#[derive(Debug, Default)]
pub struct VlanTable {
    vlans: BTreeMap<u32, Vlan>,
}

impl VlanTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, vid: u32) -> Option<&Vlan> {
        self.vlans.get(&vid)
    }

    pub(crate) fn find_mut(&mut self, vid: u32) -> Option<&mut Vlan> {
        self.vlans.get_mut(&vid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vlan> {
        self.vlans.values()
    }
}

fn vlan_valid(vid: u32) -> Result<()> {
    if vid == 0 || vid >= MAX_VLANS {
        return Err(VlanError::Range(vid));
    }
    Ok(())
}

impl Zone {
    fn vlan_stats_work(&self, vid: u32, op: DpWorkOp, map: DpMap, target: Option<SyncTarget>) {
        self.dp.push(DpWork::new(
            op,
            self.mark,
            target,
            DpWorkKind::Stat(StatDpWork { map, mark: vid }),
        ));
    }

    /// Create a bridge domain with its bridge port.
    pub fn vlan_add(&mut self, vid: u32, name: &str, os_id: i32, hw: PortHwInfo) -> Result<()> {
        vlan_valid(vid)?;
        if self.vlans.vlans.contains_key(&vid) {
            return Err(VlanError::Exists(vid));
        }

        if let Err(e) = self.zone_br_add(name) {
            warn!(vid, error = %e, "Vlan add: zone binding failed");
            return Err(VlanError::Zone(vid));
        }

        let l2 = PortLayer2Info { is_pvid: false, vid };
        if let Err(e) = self.port_add(name, os_id, PortKind::VLAN_BR, hw, l2) {
            warn!(vid, error = %e, "Vlan add: bridge port not created");
            let _ = self.zone_br_delete(name);
            return Err(VlanError::AddBrp(vid));
        }

        self.vlans.vlans.insert(
            vid,
            Vlan {
                vid,
                name: name.to_string(),
                zone: self.name.clone(),
                tagged: BTreeMap::new(),
                untagged: BTreeSet::new(),
                stats: VlanStats::default(),
            },
        );
        info!(vid, name, "Vlan created");
        Ok(())
    }

    /// Remove a bridge domain. Fails while ports are attached.
    pub fn vlan_delete(&mut self, vid: u32) -> Result<()> {
        vlan_valid(vid)?;
        let v = self.vlans.find(vid).ok_or(VlanError::NotExist(vid))?;
        if v.has_members() {
            return Err(VlanError::MpExist(vid));
        }
        let name = v.name.clone();

        if let Err(e) = self.zone_br_delete(&name) {
            debug!(vid, error = %e, "Vlan delete: bridge not bound");
        }
        if let Err(e) = self.port_del(&name, PortKind::VLAN_BR) {
            debug!(vid, error = %e, "Vlan delete: bridge port already gone");
        }
        self.vlan_stats_work(vid, DpWorkOp::StatsClear, DpMap::Bd, None);
        self.vlans.vlans.remove(&vid);

        info!(vid, "Vlan deleted");
        Ok(())
    }

    /// Attach a port to a bridge domain.
    pub fn vlan_port_add(&mut self, vid: u32, port: &str, tagged: bool) -> Result<()> {
        vlan_valid(vid)?;
        let vname = self
            .vlans
            .find(vid)
            .map(|v| v.name.clone())
            .ok_or(VlanError::NotExist(vid))?;
        let p = self.ports.find(port).ok_or_else(|| VlanError::PortPhy {
            vid,
            port: port.to_string(),
        })?;
        let (port_no, port_os_id, port_kind, mut hw) =
            (p.port_no, p.sw.os_id, p.sw.kind, p.hw.clone());

        let member_err = |e: &dyn std::fmt::Display, member: &str| {
            warn!(vid, port = member, error = %e, "Vlan member port not created");
            VlanError::PortCreate {
                vid,
                port: member.to_string(),
            }
        };

        if tagged {
            if port_kind.contains(PortKind::VXLAN_BR) {
                return Err(VlanError::PortTagged {
                    vid,
                    port: port.to_string(),
                });
            }
            if self.vlans.find(vid).is_some_and(|v| v.tagged.contains_key(port)) {
                return Err(VlanError::PortExist {
                    vid,
                    port: port.to_string(),
                });
            }

            let member = format!("{port}.{vid}");
            let os_id = (4000 + vid * MAX_REAL_INTERFACES + port_no) as i32;
            hw.real = port.to_string();
            hw.master = vname;
            self.port_add(
                &member,
                os_id,
                PortKind::VLAN_SIF,
                hw,
                PortLayer2Info { is_pvid: false, vid },
            )
            .map_err(|e| member_err(&e, &member))?;

            if let Some(v) = self.vlans.find_mut(vid) {
                v.tagged.insert(port.to_string(), member);
            }
        } else {
            if self.vlans.find(vid).is_some_and(|v| v.untagged.contains(port)) {
                return Err(VlanError::PortExist {
                    vid,
                    port: port.to_string(),
                });
            }
            hw.master = vname;
            self.port_add(
                port,
                port_os_id,
                PortKind::VLAN_SIF,
                hw,
                PortLayer2Info { is_pvid: true, vid },
            )
            .map_err(|e| member_err(&e, port))?;

            if let Some(v) = self.vlans.find_mut(vid) {
                v.untagged.insert(port.to_string());
            }
        }

        debug!(vid, port, tagged, "Vlan member added");
        Ok(())
    }

    /// Detach a port from a bridge domain.
    pub fn vlan_port_delete(&mut self, vid: u32, port: &str, tagged: bool) -> Result<()> {
        vlan_valid(vid)?;
        if self.vlans.find(vid).is_none() {
            return Err(VlanError::NotExist(vid));
        }
        let Some(port_kind) = self.ports.find(port).map(|p| p.sw.kind) else {
            return Err(VlanError::PortPhy {
                vid,
                port: port.to_string(),
            });
        };
        let no_port = || VlanError::NoPort {
            vid,
            port: port.to_string(),
        };

        if tagged {
            let member = self
                .vlans
                .find_mut(vid)
                .and_then(|v| v.tagged.remove(port))
                .ok_or_else(no_port)?;
            if let Err(e) = self.port_del(&member, PortKind::VLAN_SIF) {
                warn!(vid, port = %member, error = %e, "Vlan member port delete failed");
            }
        } else {
            let removed = self
                .vlans
                .find_mut(vid)
                .is_some_and(|v| v.untagged.remove(port));
            if !removed {
                return Err(no_port());
            }
            let role = if port_kind.contains(PortKind::VXLAN_BR) {
                PortKind::VXLAN_BR
            } else {
                PortKind::VLAN_SIF
            };
            if let Err(e) = self.port_del(port, role) {
                warn!(vid, port, error = %e, "Vlan member role removal failed");
            }
        }

        debug!(vid, port, tagged, "Vlan member removed");
        Ok(())
    }

    /// Dump all bridge domains.
    pub fn vlan_get(&self) -> Vec<VlanDump> {
        self.vlans
            .iter()
            .map(|v| {
                let mut members: Vec<VlanMember> = v
                    .tagged
                    .values()
                    .map(|m| VlanMember {
                        dev: m.clone(),
                        tagged: true,
                    })
                    .collect();
                members.extend(v.untagged.iter().map(|p| VlanMember {
                    dev: p.clone(),
                    tagged: false,
                }));
                VlanDump {
                    vid: v.vid,
                    dev: v.name.clone(),
                    members,
                    stats: v.stats,
                }
            })
            .collect()
    }

    /// Request rx/tx statistics for every bridge domain.
    pub fn vlans_ticker(&mut self) {
        let vids: Vec<u32> = self.vlans.vlans.keys().copied().collect();
        for vid in vids {
            self.vlan_stats_work(
                vid,
                DpWorkOp::StatsGet,
                DpMap::RxBd,
                Some(SyncTarget::VlanStats { vid, tx: false }),
            );
            self.vlan_stats_work(
                vid,
                DpWorkOp::StatsGet,
                DpMap::TxBd,
                Some(SyncTarget::VlanStats { vid, tx: true }),
            );
        }
    }

    /// Remove all members, then all bridge domains.
    pub fn vlan_destruct_all(&mut self) {
        let vlans: Vec<(u32, Vec<String>, Vec<String>)> = self
            .vlans
            .iter()
            .map(|v| {
                (
                    v.vid,
                    v.tagged.keys().cloned().collect(),
                    v.untagged.iter().cloned().collect(),
                )
            })
            .collect();
        for (vid, tagged, untagged) in vlans {
            for p in tagged {
                let _ = self.vlan_port_delete(vid, &p, true);
            }
            for p in untagged {
                let _ = self.vlan_port_delete(vid, &p, false);
            }
            if let Err(e) = self.vlan_delete(vid) {
                debug!(vid, error = %e, "Vlan destruct");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dp::{DpHandle, DpStats};
    use crate::model::MacAddr;
    use crossbeam_channel::Receiver;

    fn zone() -> (Zone, Receiver<DpWork>) {
        let (dp, rx) = DpHandle::channel(4096);
        (Zone::new("root", 0, dp), rx)
    }

    fn hw(last: u8) -> PortHwInfo {
        PortHwInfo {
            mac: MacAddr::new([2, 0, 0, 0, 0, last]),
            link: true,
            state: true,
            mtu: 1500,
            ..Default::default()
        }
    }

    #[test]
    fn test_vlan_range() {
        let (mut z, _rx) = zone();
        assert_eq!(z.vlan_add(0, "vlan0", -1, hw(1)), Err(VlanError::Range(0)));
        assert_eq!(
            z.vlan_add(4093, "vlan4093", -1, hw(1)),
            Err(VlanError::Range(4093))
        );
        z.vlan_add(4092, "vlan4092", -1, hw(1)).unwrap();
        assert_eq!(
            z.vlan_add(4092, "vlan4092", -1, hw(1)),
            Err(VlanError::Exists(4092))
        );
    }

    #[test]
    fn test_tagged_member() {
        let (mut z, _rx) = zone();
        z.port_add("eth0", 2, PortKind::REAL, hw(1), Default::default())
            .unwrap();
        z.vlan_add(100, "vlan100", 100, hw(9)).unwrap();
        z.vlan_port_add(100, "eth0", true).unwrap();

        let no = z.ports.find("eth0").unwrap().port_no;
        let sub = z.ports.find("eth0.100").unwrap();
        assert_eq!(sub.kind(), PortKind::VLAN_SIF);
        assert_eq!(sub.sw.os_id, (4000 + 100 * MAX_REAL_INTERFACES + no) as i32);
        assert_eq!(sub.sw.real.as_deref(), Some("eth0"));
        assert_eq!(sub.hw.master, "vlan100");
        assert_eq!(sub.l2, PortLayer2Info { is_pvid: false, vid: 100 });

        assert!(matches!(
            z.vlan_port_add(100, "eth0", true),
            Err(VlanError::PortExist { .. })
        ));
        assert_eq!(z.vlan_delete(100), Err(VlanError::MpExist(100)));

        z.vlan_port_delete(100, "eth0", true).unwrap();
        assert!(z.ports.find("eth0.100").is_none());
        z.vlan_delete(100).unwrap();
        assert!(z.ports.find("vlan100").is_none());
    }

    #[test]
    fn test_untagged_member() {
        let (mut z, _rx) = zone();
        z.port_add("eth1", 3, PortKind::REAL, hw(2), Default::default())
            .unwrap();
        z.vlan_add(20, "vlan20", 20, hw(9)).unwrap();
        z.vlan_port_add(20, "eth1", false).unwrap();

        let p = z.ports.find("eth1").unwrap();
        assert_eq!(p.kind(), PortKind::REAL | PortKind::VLAN_SIF);
        assert_eq!(p.l2, PortLayer2Info { is_pvid: true, vid: 20 });

        let dump = z.vlan_get();
        let v20 = dump.iter().find(|d| d.vid == 20).unwrap();
        assert_eq!(
            v20.members,
            vec![VlanMember {
                dev: "eth1".into(),
                tagged: false
            }]
        );

        z.vlan_port_delete(20, "eth1", false).unwrap();
        assert_eq!(z.ports.find("eth1").unwrap().kind(), PortKind::REAL);
        assert!(matches!(
            z.vlan_port_delete(20, "eth1", false),
            Err(VlanError::NoPort { .. })
        ));
    }

    #[test]
    fn test_vxlan_cannot_be_tagged() {
        let (mut z, _rx) = zone();
        z.port_add("eth0", 2, PortKind::REAL, hw(1), Default::default())
            .unwrap();
        let mut vh = hw(5);
        vh.real = "eth0".into();
        vh.tun_id = 77;
        z.port_add("vxlan77", 30, PortKind::VXLAN_BR, vh, Default::default())
            .unwrap();
        z.vlan_add(77, "vlan77", 77, hw(9)).unwrap();

        assert!(matches!(
            z.vlan_port_add(77, "vxlan77", true),
            Err(VlanError::PortTagged { .. })
        ));
        z.vlan_port_add(77, "vxlan77", false).unwrap();
        assert!(
            z.ports
                .find("vxlan77")
                .unwrap()
                .kind()
                .contains(PortKind::VXLAN_BR | PortKind::VLAN_SIF)
        );
        z.vlan_port_delete(77, "vxlan77", false).unwrap();
        assert_eq!(z.ports.find("vxlan77").unwrap().kind(), PortKind::VXLAN_BR);
    }

    #[test]
    fn test_ticker_requests_stats() {
        let (mut z, rx) = zone();
        z.vlan_add(5, "vlan5", 5, hw(9)).unwrap();
        let _: Vec<_> = rx.try_iter().collect();

        z.vlans_ticker();
        let works: Vec<DpWork> = rx.try_iter().collect();
        assert_eq!(works.len(), 2);
        assert!(works.iter().all(|w| w.op == DpWorkOp::StatsGet));

        z.vlans
            .find_mut(5)
            .unwrap()
            .set_stats(true, DpStats { packets: 4, bytes: 400, drops: 0 });
        assert_eq!(z.vlans.find(5).unwrap().stats.out_packets, 4);
    }
}
