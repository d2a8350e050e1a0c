//! User sessions and their uplink classifiers.
//!
//! A session ties a user address to an access-side and a core-side GTP
//! tunnel. Each uplink classifier on a session matches one peer address and
//! is programmed as two datapath entries, one per direction, each with its
//! own mark.

use crate::counter::Counter;
use crate::dp::{
    DpMap, DpStats, DpStatus, DpWork, DpWorkKind, DpWorkOp, StatDpWork, SyncTarget, UlClDpWork,
};
use crate::model::unspecified;
use crate::zone::Zone;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MAX_UL_CLS: u32 = 20000;

/// Session errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0}: modify failed")]
    Mod(String),

    #[error("no such session {0}")]
    NotExist(String),

    #[error("session {0} exists")]
    Exists(String),

    #[error("session {user}: classifier {addr} exists")]
    UlClExists { user: String, addr: IpAddr },

    #[error("session {0}: classifier marks exhausted")]
    UlClNum(String),

    #[error("session {user}: no classifier {addr}")]
    UlClNotExist { user: String, addr: IpAddr },
}

impl SessionError {
    pub fn code(&self) -> i32 {
        match self {
            SessionError::Mod(_) => -102001,
            SessionError::NotExist(_) => -102002,
            SessionError::Exists(_) => -102003,
            SessionError::UlClExists { .. } => -102004,
            SessionError::UlClNum(_) => -102005,
            SessionError::UlClNotExist { .. } => -102006,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// One end of a GTP tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessTun {
    pub teid: u32,
    pub addr: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UlClArg {
    pub addr: IpAddr,
    #[serde(default)]
    pub qfi: u8,
}

#[derive(Debug, Clone)]
pub struct UlCl {
    pub addr: IpAddr,
    pub qfi: u8,
    pub num_ul: u32,
    pub num_dl: u32,
    pub ul_sync: DpStatus,
    pub dl_sync: DpStatus,
    pub ul_stats: DpStats,
    pub dl_stats: DpStats,
}

impl UlCl {
    /// First failure of either direction.
    pub fn sync(&self) -> DpStatus {
        if self.ul_sync.is_ok() {
            self.dl_sync
        } else {
            self.ul_sync
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserSess {
    pub ident: String,
    pub addr: IpAddr,
    /// Access-side tunnel.
    pub an_tun: SessTun,
    /// Core-side tunnel.
    pub cn_tun: SessTun,
    pub ulcls: BTreeMap<IpAddr, UlCl>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessDump {
    pub ident: String,
    pub ip: IpAddr,
    pub an_tun: SessTun,
    pub cn_tun: SessTun,
}

#[derive(Debug, Clone, Serialize)]
pub struct UlClDump {
    pub ident: String,
    pub args: UlClArg,
    pub ul_stats: DpStats,
    pub dl_stats: DpStats,
    pub sync: DpStatus,
}

pub struct SessionTable {
    users: BTreeMap<String, UserSess>,
    marks: Counter,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            users: BTreeMap::new(),
            marks: Counter::new(1, MAX_UL_CLS),
        }
    }

    pub fn find(&self, user: &str) -> Option<&UserSess> {
        self.users.get(user)
    }

    pub(crate) fn ulcl_mut(&mut self, user: &str, addr: IpAddr) -> Option<&mut UlCl> {
        self.users.get_mut(user)?.ulcls.get_mut(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserSess> {
        self.users.values()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Classifier marks still free.
    pub fn marks_available(&self) -> usize {
        self.marks.available()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Zone {
    fn ulcl_works(&self, user: &str, addr: IpAddr, op: DpWorkOp) -> Vec<DpWork> {
        let Some(us) = self.sess.find(user) else {
            return Vec::new();
        };
        let Some(cl) = us.ulcls.get(&addr) else {
            return Vec::new();
        };
        let target = |uplink| SyncTarget::UlCl {
            user: user.to_string(),
            addr,
            uplink,
        };

        if op == DpWorkOp::StatsGet {
            return [(true, cl.num_ul), (false, cl.num_dl)]
                .into_iter()
                .map(|(uplink, mark)| {
                    DpWork::new(
                        op,
                        self.mark,
                        Some(SyncTarget::UlClStats {
                            user: user.to_string(),
                            addr,
                            uplink,
                        }),
                        DpWorkKind::Stat(StatDpWork {
                            map: DpMap::Ulcl,
                            mark,
                        }),
                    )
                })
                .collect();
        }

        let ul = UlClDpWork {
            mdip: cl.addr,
            msip: us.addr,
            mteid: us.cn_tun.teid,
            zone: self.mark,
            qfi: cl.qfi,
            mark: cl.num_ul,
            tdip: unspecified(us.addr),
            tsip: unspecified(us.addr),
            tteid: 0,
            uplink: true,
        };
        let dl = UlClDpWork {
            mdip: us.addr,
            msip: cl.addr,
            mteid: 0,
            zone: self.mark,
            qfi: cl.qfi,
            mark: cl.num_dl,
            tdip: us.an_tun.addr,
            tsip: us.cn_tun.addr,
            tteid: us.an_tun.teid,
            uplink: false,
        };
        vec![
            DpWork::new(op, self.mark, Some(target(true)), DpWorkKind::UlCl(ul)),
            DpWork::new(op, self.mark, Some(target(false)), DpWorkKind::UlCl(dl)),
        ]
    }

    fn ulcl_dp(&mut self, user: &str, addr: IpAddr, op: DpWorkOp) {
        for w in self.ulcl_works(user, addr, op) {
            self.dp.push(w);
        }
    }

    /// Add a session. A session re-added with other tunnels or another
    /// address replaces the old one together with its classifiers.
    pub fn sess_add(
        &mut self,
        user: &str,
        addr: IpAddr,
        an_tun: SessTun,
        cn_tun: SessTun,
    ) -> Result<()> {
        if let Some(us) = self.sess.find(user) {
            if us.an_tun == an_tun && us.cn_tun == cn_tun && us.addr == addr {
                debug!(user, %addr, "Session add: exists");
                return Err(SessionError::Exists(user.to_string()));
            }
            if let Err(e) = self.sess_delete(user) {
                warn!(user, error = %e, "Session add: replace failed");
                return Err(SessionError::Mod(user.to_string()));
            }
        }

        self.sess.users.insert(
            user.to_string(),
            UserSess {
                ident: user.to_string(),
                addr,
                an_tun,
                cn_tun,
                ulcls: BTreeMap::new(),
            },
        );
        info!(user, %addr, an = %an_tun.addr, cn = %cn_tun.addr, "Session added");
        Ok(())
    }

    /// Delete a session and every classifier on it.
    pub fn sess_delete(&mut self, user: &str) -> Result<()> {
        let Some(us) = self.sess.find(user) else {
            debug!(user, "Session delete: no such session");
            return Err(SessionError::NotExist(user.to_string()));
        };
        let addrs: Vec<IpAddr> = us.ulcls.keys().copied().collect();
        for addr in addrs {
            let arg = UlClArg { addr, qfi: 0 };
            if let Err(e) = self.ul_cl_delete(user, arg) {
                debug!(user, %addr, error = %e, "Session delete: classifier");
            }
        }
        self.sess.users.remove(user);
        info!(user, "Session deleted");
        Ok(())
    }

    /// Add an uplink classifier to a session.
    pub fn ul_cl_add(&mut self, user: &str, cls: UlClArg) -> Result<()> {
        let Some(us) = self.sess.find(user) else {
            return Err(SessionError::NotExist(user.to_string()));
        };
        if us.ulcls.contains_key(&cls.addr) {
            return Err(SessionError::UlClExists {
                user: user.to_string(),
                addr: cls.addr,
            });
        }

        let num_ul = self
            .sess
            .marks
            .get()
            .map_err(|_| SessionError::UlClNum(user.to_string()))?;
        let num_dl = match self.sess.marks.get() {
            Ok(m) => m,
            Err(_) => {
                if let Err(e) = self.sess.marks.put(num_ul) {
                    warn!(user, error = %e, "Classifier mark release failed");
                }
                return Err(SessionError::UlClNum(user.to_string()));
            }
        };

        if let Some(us) = self.sess.users.get_mut(user) {
            us.ulcls.insert(
                cls.addr,
                UlCl {
                    addr: cls.addr,
                    qfi: cls.qfi,
                    num_ul,
                    num_dl,
                    ul_sync: DpStatus::Ok,
                    dl_sync: DpStatus::Ok,
                    ul_stats: DpStats::default(),
                    dl_stats: DpStats::default(),
                },
            );
        }
        self.ulcl_dp(user, cls.addr, DpWorkOp::Create);
        debug!(user, addr = %cls.addr, qfi = cls.qfi, num_ul, num_dl, "Classifier added");
        Ok(())
    }

    /// Delete an uplink classifier. Only the address identifies it.
    pub fn ul_cl_delete(&mut self, user: &str, cls: UlClArg) -> Result<()> {
        let Some(us) = self.sess.find(user) else {
            return Err(SessionError::NotExist(user.to_string()));
        };
        if !us.ulcls.contains_key(&cls.addr) {
            return Err(SessionError::UlClNotExist {
                user: user.to_string(),
                addr: cls.addr,
            });
        }

        self.ulcl_dp(user, cls.addr, DpWorkOp::Remove);
        let Some(cl) = self
            .sess
            .users
            .get_mut(user)
            .and_then(|us| us.ulcls.remove(&cls.addr))
        else {
            return Ok(());
        };
        for mark in [cl.num_ul, cl.num_dl] {
            if let Err(e) = self.sess.marks.put(mark) {
                warn!(user, mark, error = %e, "Classifier mark release failed");
            }
        }
        debug!(user, addr = %cls.addr, "Classifier deleted");
        Ok(())
    }

    /// Re-push failed classifiers and poll counters of the rest.
    pub fn sess_ticker(&mut self) {
        let pending: Vec<(String, IpAddr, bool)> = self
            .sess
            .iter()
            .flat_map(|us| {
                us.ulcls
                    .values()
                    .map(|cl| (us.ident.clone(), cl.addr, cl.sync().is_ok()))
            })
            .collect();
        for (user, addr, ok) in pending {
            if ok {
                self.ulcl_dp(&user, addr, DpWorkOp::StatsGet);
                continue;
            }
            debug!(user = %user, %addr, "Classifier resync");
            self.ulcl_dp(&user, addr, DpWorkOp::Create);
        }
    }

    pub fn sess_destruct_all(&mut self) {
        let users: Vec<String> = self.sess.users.keys().cloned().collect();
        for user in users {
            if let Err(e) = self.sess_delete(&user) {
                debug!(user = %user, error = %e, "Session destruct");
            }
        }
    }

    pub fn sessions_get(&self) -> Vec<SessDump> {
        self.sess
            .iter()
            .map(|us| SessDump {
                ident: us.ident.clone(),
                ip: us.addr,
                an_tun: us.an_tun,
                cn_tun: us.cn_tun,
            })
            .collect()
    }

    pub fn ul_cls_get(&self) -> Vec<UlClDump> {
        self.sess
            .iter()
            .flat_map(|us| {
                us.ulcls.values().map(|cl| UlClDump {
                    ident: us.ident.clone(),
                    args: UlClArg {
                        addr: cl.addr,
                        qfi: cl.qfi,
                    },
                    ul_stats: cl.ul_stats,
                    dl_stats: cl.dl_stats,
                    sync: cl.sync(),
                })
            })
            .collect()
    }
}
