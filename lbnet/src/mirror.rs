//! Traffic mirrors.
//!
//! A mirror copies the traffic of its attach point out of a monitor port.
//! Port attachments carry the mirror mark in the port's `SPAN` property, so
//! every VLAN sub-interface of the same NIC is mirrored too.

use crate::counter::Counter;
use crate::dp::{DpStatus, DpWork, DpWorkKind, DpWorkOp, MirrDpWork, SyncTarget};
use crate::model::{AttachPoint, PortProp};
use crate::zone::Zone;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MAX_MIRRORS: u32 = 32;

/// Mirror errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MirrorError {
    #[error("mirror {0}: invalid info")]
    Info(String),

    #[error("mirror {0}: bad attach point")]
    Attach(String),

    #[error("no such mirror {0}")]
    NotExist(String),

    #[error("mirror {0} exists")]
    Exists(String),

    #[error("mirror {0}: mark allocation failed")]
    Alloc(String),
}

impl MirrorError {
    pub fn code(&self) -> i32 {
        match self {
            MirrorError::Info(_) => -101001,
            MirrorError::Attach(_) => -101002,
            MirrorError::NotExist(_) => -101003,
            MirrorError::Exists(_) => -101004,
            MirrorError::Alloc(_) => -101005,
        }
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrType {
    /// Local port mirror.
    #[default]
    Span,
    /// Remote mirror over a VLAN.
    Rspan,
    /// Remote mirror over GRE.
    Erspan,
}

/// Where and how mirrored packets are sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrInfo {
    pub mirr_type: MirrType,
    /// Monitor port.
    pub port: String,
    pub vlan: u32,
    /// ERSPAN remote and source addresses.
    pub rip: IpAddr,
    pub sip: IpAddr,
    /// ERSPAN tunnel id.
    pub tid: u32,
}

impl Default for MirrInfo {
    fn default() -> Self {
        Self {
            mirr_type: MirrType::Span,
            port: String::new(),
            vlan: 0,
            rip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tid: 0,
        }
    }
}

impl MirrInfo {
    fn is_valid(&self) -> bool {
        match self.mirr_type {
            MirrType::Span => true,
            MirrType::Rspan => self.vlan == 0,
            MirrType::Erspan => {
                !self.rip.is_unspecified() && !self.sip.is_unspecified() && self.tid != 0
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mirror {
    pub name: String,
    pub info: MirrInfo,
    pub attach: AttachPoint,
    pub mark: u32,
    pub sync: DpStatus,
    /// The attach point carries the mirror mark.
    attached: bool,
}

impl Mirror {
    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrDump {
    pub name: String,
    pub info: MirrInfo,
    pub target: AttachPoint,
    pub mark: u32,
    pub sync: DpStatus,
}

pub struct MirrorTable {
    mirrors: BTreeMap<String, Mirror>,
    marks: Counter,
}

impl MirrorTable {
    pub fn new() -> Self {
        Self {
            mirrors: BTreeMap::new(),
            marks: Counter::new(1, MAX_MIRRORS),
        }
    }

    pub fn find(&self, name: &str) -> Option<&Mirror> {
        self.mirrors.get(name)
    }

    pub(crate) fn find_mut(&mut self, name: &str) -> Option<&mut Mirror> {
        self.mirrors.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mirror> {
        self.mirrors.values()
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }
}

impl Default for MirrorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Zone {
    /// ERSPAN sessions are kept in the table only.
    fn mirr_dp(&mut self, name: &str, op: DpWorkOp) {
        let Some(m) = self.mirrors.find(name) else {
            return;
        };
        if m.info.mirr_type == MirrType::Erspan {
            return;
        }
        let (mi_port_num, mi_bd) = if op == DpWorkOp::Create {
            match self.ports.find(&m.info.port) {
                Some(p) => (p.port_no, m.info.vlan),
                None => {
                    debug!(mirror = name, port = %m.info.port, "Mirror port missing");
                    if let Some(m) = self.mirrors.find_mut(name) {
                        m.sync = DpStatus::CreateErr;
                    }
                    return;
                }
            }
        } else {
            (0, 0)
        };
        let w = DpWork::new(
            op,
            self.mark,
            Some(SyncTarget::Mirror(name.to_string())),
            DpWorkKind::Mirr(MirrDpWork {
                name: name.to_string(),
                mark: m.mark,
                mi_port_num,
                mi_bd,
            }),
        );
        self.dp.push(w);
    }

    fn mirr_attach(&mut self, name: &str, set: bool) {
        let Some(m) = self.mirrors.find(name) else {
            return;
        };
        let Some(port) = m.attach.port().map(str::to_string) else {
            return;
        };
        let mark = m.mark;
        let attached = if self.ports.find(&port).is_none() {
            false
        } else if set {
            match self.port_update_prop(&port, PortProp::SPAN, true, mark) {
                Ok(()) => true,
                Err(e) => {
                    debug!(mirror = name, port = %port, error = %e, "Mirror attach failed");
                    false
                }
            }
        } else {
            if let Err(e) = self.port_update_prop(&port, PortProp::SPAN, false, 0) {
                debug!(mirror = name, port = %port, error = %e, "Mirror detach failed");
            }
            false
        };
        if let Some(m) = self.mirrors.find_mut(name) {
            m.attached = attached;
        }
    }

    /// Add a mirror. Re-adding with different info replaces the mirror.
    pub fn mirr_add(&mut self, name: &str, info: MirrInfo, attach: AttachPoint) -> Result<()> {
        if attach.port().is_some_and(str::is_empty) {
            return Err(MirrorError::Attach(name.to_string()));
        }
        if !info.is_valid() {
            warn!(mirror = name, "Mirror add: invalid info");
            return Err(MirrorError::Info(name.to_string()));
        }
        if let Some(m) = self.mirrors.find(name) {
            if m.info == info {
                return Err(MirrorError::Exists(name.to_string()));
            }
            self.mirr_delete(name)?;
        }

        let mark = self
            .mirrors
            .marks
            .get()
            .map_err(|_| MirrorError::Alloc(name.to_string()))?;
        self.mirrors.mirrors.insert(
            name.to_string(),
            Mirror {
                name: name.to_string(),
                info,
                attach,
                mark,
                sync: DpStatus::Ok,
                attached: false,
            },
        );
        self.mirr_dp(name, DpWorkOp::Create);
        self.mirr_attach(name, true);

        info!(mirror = name, mark, "Mirror added");
        Ok(())
    }

    pub fn mirr_delete(&mut self, name: &str) -> Result<()> {
        if self.mirrors.find(name).is_none() {
            return Err(MirrorError::NotExist(name.to_string()));
        }
        self.mirr_attach(name, false);
        self.mirr_dp(name, DpWorkOp::Remove);

        let Some(m) = self.mirrors.mirrors.remove(name) else {
            return Err(MirrorError::NotExist(name.to_string()));
        };
        if let Err(e) = self.mirrors.marks.put(m.mark) {
            warn!(mirror = name, error = %e, "Mirror mark release failed");
        }
        info!(mirror = name, "Mirror deleted");
        Ok(())
    }

    /// The port went away; attachments to it are redone once it is back.
    pub(crate) fn mirr_port_delete(&mut self, port: &str) {
        for m in self.mirrors.mirrors.values_mut() {
            if m.attach.port() == Some(port) {
                m.attached = false;
            }
        }
    }

    /// Re-push failed mirrors and pending attachments.
    pub fn mirr_ticker(&mut self) {
        let names: Vec<String> = self.mirrors.mirrors.keys().cloned().collect();
        for name in names {
            let Some(m) = self.mirrors.find(&name) else {
                continue;
            };
            if m.sync != DpStatus::Ok {
                debug!(mirror = %name, sync = ?m.sync, "Mirror resync");
                self.mirr_dp(&name, DpWorkOp::Create);
                self.mirr_attach(&name, true);
            } else if !m.attached {
                self.mirr_attach(&name, true);
            } else {
                let gone = m.attach.port().is_some_and(|p| self.ports.find(p).is_none());
                if gone && let Some(m) = self.mirrors.find_mut(&name) {
                    m.attached = false;
                }
            }
        }
    }

    pub fn mirr_destruct_all(&mut self) {
        let names: Vec<String> = self.mirrors.mirrors.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.mirr_delete(&name) {
                debug!(mirror = %name, error = %e, "Mirror destruct");
            }
        }
    }

    pub fn mirrs_get(&self) -> Vec<MirrDump> {
        self.mirrors
            .iter()
            .map(|m| MirrDump {
                name: m.name.clone(),
                info: m.info.clone(),
                target: m.attach.clone(),
                mark: m.mark,
                sync: m.sync,
            })
            .collect()
    }
}
