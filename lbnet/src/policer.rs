//! Two-rate three-color policers.
//!
//! Rates are configured in Mbit/s and programmed in bit/s. A port attachment
//! stores the policer mark in the port's `POL` property.

use crate::counter::Counter;
use crate::dp::{
    DpMap, DpStats, DpStatus, DpWork, DpWorkKind, DpWorkOp, PolDpWork, StatDpWork, SyncTarget,
};
use crate::model::{AttachPoint, PortProp};
use crate::zone::Zone;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MAX_POLICERS: u32 = 8 * 1024;
/// Lowest accepted rate, Mbit/s.
pub const MIN_POL_RATE: u64 = 8;
/// Committed burst size used when none is given, bytes.
pub const DFL_POL_BLK_SZ: u64 = 6 * 5000 * 1000;

/// Policer errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicerError {
    #[error("policer {0}: invalid info")]
    Info(String),

    #[error("policer {0}: bad attach point")]
    Attach(String),

    #[error("no such policer {0}")]
    NotExist(String),

    #[error("policer {0} exists")]
    Exists(String),

    #[error("policer {0}: mark allocation failed")]
    Alloc(String),
}

impl PolicerError {
    pub fn code(&self) -> i32 {
        match self {
            PolicerError::Info(_) => -100001,
            PolicerError::Attach(_) => -100002,
            PolicerError::NotExist(_) => -100003,
            PolicerError::Exists(_) => -100004,
            PolicerError::Alloc(_) => -100005,
        }
    }
}

pub type Result<T> = std::result::Result<T, PolicerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolInfo {
    /// Committed rate, Mbit/s.
    pub cir: u64,
    /// Peak rate, Mbit/s.
    pub pir: u64,
    /// Committed and excess burst sizes, bytes.
    pub cbs: u64,
    pub ebs: u64,
    pub color_aware: bool,
    pub block_on_red: bool,
}

impl PolInfo {
    /// Check the rates and fill in default burst sizes.
    fn normalize(mut self) -> Option<Self> {
        if self.cir < MIN_POL_RATE || self.pir < MIN_POL_RATE {
            return None;
        }
        if self.cbs == 0 {
            self.cbs = DFL_POL_BLK_SZ;
            self.ebs = 2 * DFL_POL_BLK_SZ;
        } else if self.ebs == 0 {
            self.ebs = 2 * self.cbs;
        }
        Some(self)
    }
}

#[derive(Debug, Clone)]
pub struct Policer {
    pub name: String,
    pub info: PolInfo,
    pub attach: AttachPoint,
    pub mark: u32,
    pub sync: DpStatus,
    /// Conforming packets and bytes; `drops` counts red packets.
    pub stats: DpStats,
    attached: bool,
}

impl Policer {
    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PolDump {
    pub name: String,
    pub info: PolInfo,
    pub target: AttachPoint,
    pub mark: u32,
    pub stats: DpStats,
    pub sync: DpStatus,
}

pub struct PolicerTable {
    pols: BTreeMap<String, Policer>,
    marks: Counter,
}

impl PolicerTable {
    pub fn new() -> Self {
        Self {
            pols: BTreeMap::new(),
            marks: Counter::new(1, MAX_POLICERS),
        }
    }

    pub fn find(&self, name: &str) -> Option<&Policer> {
        self.pols.get(name)
    }

    pub(crate) fn find_mut(&mut self, name: &str) -> Option<&mut Policer> {
        self.pols.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policer> {
        self.pols.values()
    }

    pub fn len(&self) -> usize {
        self.pols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pols.is_empty()
    }
}

impl Default for PolicerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Zone {
    fn pol_dp(&mut self, name: &str, op: DpWorkOp) {
        let Some(p) = self.pols.find(name) else {
            return;
        };
        let kind = if op == DpWorkOp::StatsGet {
            DpWorkKind::Stat(StatDpWork {
                map: DpMap::Ipol,
                mark: p.mark,
            })
        } else {
            DpWorkKind::Pol(PolDpWork {
                name: name.to_string(),
                mark: p.mark,
                cir: p.info.cir * 1_000_000,
                pir: p.info.pir * 1_000_000,
                cbs: p.info.cbs,
                ebs: p.info.ebs,
                color_aware: p.info.color_aware,
                block_on_red: p.info.block_on_red,
            })
        };
        let target = if op == DpWorkOp::StatsGet {
            SyncTarget::PolicerStats(name.to_string())
        } else {
            SyncTarget::Policer(name.to_string())
        };
        self.dp.push(DpWork::new(op, self.mark, Some(target), kind));
    }

    fn pol_attach(&mut self, name: &str, set: bool) {
        let Some(p) = self.pols.find(name) else {
            return;
        };
        let Some(port) = p.attach.port().map(str::to_string) else {
            return;
        };
        let mark = p.mark;
        let attached = if self.ports.find(&port).is_none() {
            false
        } else if set {
            match self.port_update_prop(&port, PortProp::POL, true, mark) {
                Ok(()) => true,
                Err(e) => {
                    debug!(policer = name, port = %port, error = %e, "Policer attach failed");
                    false
                }
            }
        } else {
            if let Err(e) = self.port_update_prop(&port, PortProp::POL, false, 0) {
                debug!(policer = name, port = %port, error = %e, "Policer detach failed");
            }
            false
        };
        if let Some(p) = self.pols.find_mut(name) {
            p.attached = attached;
        }
    }

    /// Add a policer. Re-adding with different rates replaces the policer.
    pub fn pol_add(&mut self, name: &str, info: PolInfo, attach: AttachPoint) -> Result<()> {
        if attach.port().is_some_and(str::is_empty) {
            return Err(PolicerError::Attach(name.to_string()));
        }
        let Some(info) = info.normalize() else {
            warn!(policer = name, cir = info.cir, pir = info.pir, "Policer add: rate too low");
            return Err(PolicerError::Info(name.to_string()));
        };
        if let Some(p) = self.pols.find(name) {
            if p.info == info {
                return Err(PolicerError::Exists(name.to_string()));
            }
            self.pol_delete(name)?;
        }

        let mark = self
            .pols
            .marks
            .get()
            .map_err(|_| PolicerError::Alloc(name.to_string()))?;
        self.pols.pols.insert(
            name.to_string(),
            Policer {
                name: name.to_string(),
                info,
                attach,
                mark,
                sync: DpStatus::Ok,
                stats: DpStats::default(),
                attached: false,
            },
        );
        self.pol_dp(name, DpWorkOp::Create);
        self.pol_attach(name, true);

        info!(policer = name, mark, cir = info.cir, pir = info.pir, "Policer added");
        Ok(())
    }

    pub fn pol_delete(&mut self, name: &str) -> Result<()> {
        if self.pols.find(name).is_none() {
            return Err(PolicerError::NotExist(name.to_string()));
        }
        self.pol_attach(name, false);
        self.pol_dp(name, DpWorkOp::Remove);

        let Some(p) = self.pols.pols.remove(name) else {
            return Err(PolicerError::NotExist(name.to_string()));
        };
        if let Err(e) = self.pols.marks.put(p.mark) {
            warn!(policer = name, error = %e, "Policer mark release failed");
        }
        info!(policer = name, "Policer deleted");
        Ok(())
    }

    pub(crate) fn pol_port_delete(&mut self, port: &str) {
        for p in self.pols.pols.values_mut() {
            if p.attach.port() == Some(port) {
                p.attached = false;
            }
        }
    }

    /// Re-push failed policers, redo pending attachments and poll counters.
    pub fn pol_ticker(&mut self) {
        let names: Vec<String> = self.pols.pols.keys().cloned().collect();
        for name in names {
            let Some(p) = self.pols.find(&name) else {
                continue;
            };
            if p.sync != DpStatus::Ok {
                debug!(policer = %name, sync = ?p.sync, "Policer resync");
                self.pol_dp(&name, DpWorkOp::Create);
                self.pol_attach(&name, true);
                continue;
            }
            let attached = p.attached;
            let gone = p.attach.port().is_some_and(|n| self.ports.find(n).is_none());
            self.pol_dp(&name, DpWorkOp::StatsGet);
            if !attached {
                self.pol_attach(&name, true);
            } else if gone && let Some(p) = self.pols.find_mut(&name) {
                p.attached = false;
            }
        }
    }

    pub fn pol_destruct_all(&mut self) {
        let names: Vec<String> = self.pols.pols.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.pol_delete(&name) {
                debug!(policer = %name, error = %e, "Policer destruct");
            }
        }
    }

    pub fn pols_get(&self) -> Vec<PolDump> {
        self.pols
            .iter()
            .map(|p| PolDump {
                name: p.name.clone(),
                info: p.info,
                target: p.attach.clone(),
                mark: p.mark,
                stats: p.stats,
                sync: p.sync,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dp::{DpCompletion, DpHandle};
    use crate::model::{MacAddr, PortKind};
    use crate::port::PortHwInfo;
    use crossbeam_channel::Receiver;

    fn zone() -> (Zone, Receiver<DpWork>) {
        let (dp, rx) = DpHandle::channel(4096);
        (Zone::new("test", 0, dp), rx)
    }

    fn add_port(z: &mut Zone, name: &str, os_id: i32) {
        let hw = PortHwInfo {
            mac: MacAddr::new([2, 0, 0, 0, 0, os_id as u8]),
            link: true,
            state: true,
            mtu: 1500,
            ..Default::default()
        };
        z.port_add(name, os_id, PortKind::REAL, hw, Default::default())
            .unwrap();
    }

    fn rate(cir: u64, pir: u64) -> PolInfo {
        PolInfo {
            cir,
            pir,
            ..Default::default()
        }
    }

    #[test]
    fn test_add_translates_rates() {
        let (mut z, rx) = zone();
        add_port(&mut z, "eth0", 2);
        z.pol_add("p1", rate(100, 200), AttachPoint::Port("eth0".into()))
            .unwrap();

        let works: Vec<PolDpWork> = rx
            .try_iter()
            .filter_map(|w| match w.kind {
                DpWorkKind::Pol(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(works.len(), 1);
        assert_eq!(works[0].cir, 100_000_000);
        assert_eq!(works[0].pir, 200_000_000);
        assert_eq!(works[0].cbs, DFL_POL_BLK_SZ);
        assert_eq!(works[0].ebs, 2 * DFL_POL_BLK_SZ);

        let p = z.ports.find("eth0").unwrap();
        assert!(p.props.contains(PortProp::POL));
        assert_eq!(p.pol_num, works[0].mark);

        assert_eq!(z.pols_get()[0].info.cir, 100);
        assert_eq!(
            z.pol_add("p1", rate(100, 200), AttachPoint::Port("eth0".into())),
            Err(PolicerError::Exists("p1".into()))
        );
    }

    #[test]
    fn test_explicit_burst() {
        let (mut z, _rx) = zone();
        let info = PolInfo {
            cbs: 1000,
            ..rate(10, 10)
        };
        z.pol_add("p1", info, AttachPoint::Rule("web".into()))
            .unwrap();
        let p = z.pols.find("p1").unwrap();
        assert_eq!((p.info.cbs, p.info.ebs), (1000, 2000));
    }

    #[test]
    fn test_rate_below_minimum() {
        let (mut z, _rx) = zone();
        assert_eq!(
            z.pol_add("p1", rate(4, 100), AttachPoint::Port("eth0".into())),
            Err(PolicerError::Info("p1".into()))
        );
        assert_eq!(
            z.pol_add("p1", rate(10, 10), AttachPoint::Port(String::new())),
            Err(PolicerError::Attach("p1".into()))
        );
    }

    #[test]
    fn test_delete_and_port_loss() {
        let (mut z, _rx) = zone();
        add_port(&mut z, "eth0", 2);
        z.pol_add("p1", rate(10, 10), AttachPoint::Port("eth0".into()))
            .unwrap();

        z.port_del("eth0", PortKind::REAL).unwrap();
        assert!(!z.pols.find("p1").unwrap().is_attached());
        add_port(&mut z, "eth0", 2);
        z.pol_ticker();
        assert!(z.pols.find("p1").unwrap().is_attached());

        z.pol_delete("p1").unwrap();
        assert!(!z.ports.find("eth0").unwrap().props.contains(PortProp::POL));
        assert!(z.pols.is_empty());
    }

    #[test]
    fn test_ticker_polls_stats() {
        let (mut z, rx) = zone();
        z.pol_add("p1", rate(10, 10), AttachPoint::Rule("web".into()))
            .unwrap();
        rx.try_iter().count();

        z.pol_ticker();
        let stat = rx
            .try_iter()
            .find(|w| w.op == DpWorkOp::StatsGet)
            .unwrap();
        assert_eq!(stat.target, Some(SyncTarget::PolicerStats("p1".into())));

        let stats = DpStats {
            packets: 10,
            bytes: 1500,
            drops: 2,
        };
        z.apply_completion(DpCompletion {
            zone: 0,
            target: SyncTarget::PolicerStats("p1".into()),
            status: DpStatus::Ok,
            stats: Some(stats),
        });
        assert_eq!(z.pols_get()[0].stats, stats);
    }
}
