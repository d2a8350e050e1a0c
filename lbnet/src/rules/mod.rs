//! NAT/load-balancing and firewall rules.
//!
//! A rule is identified by a deterministic key built from its masked match
//! tuple. Load-balancer rules always match on (service IP, L4 protocol, L4
//! destination port, block number); firewall rules match on the full tuple.
//! Endpoints of load-balancer rules are health tracked through [`EpHost`]
//! entries shared between rules.

mod ephost;
mod fw;
mod nat;

pub use ephost::{EpHost, EpHostDump, EpHostOpts, ProbeJob, ProbeOutcome, ProbeType, ep_key};
pub use fw::{FwAction, FwOptArg, FwRule, FwRuleArg, FwRuleDump};
pub use nat::{
    LbEndPointArg, LbEpDump, LbMode, LbOp, LbProto, LbRuleDump, LbSel, LbServiceArg, NatAct,
    NatEndPoint, NatRule,
};

use crate::counter::Counter;
use crate::dp::DpStats;
use ephost::EpHostTable;
use ipnet::IpNet;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

pub const MAX_NAT_ENDPOINTS: usize = 32;
pub const MAX_LB_RULES: u32 = 2 * 1024;
pub const MAX_FW_RULES: u32 = 8 * 1024;

pub const DFL_INACT_TRIES: u32 = 2;
pub const MAX_INACT_TRIES: u32 = 100;
/// Seconds between probes of a healthy endpoint host.
pub const DFL_HOST_PROBE_TIMEOUT: u32 = 60;
/// Seconds before the first probe of a new endpoint host.
pub const INIT_HOST_PROBE_TIMEOUT: u32 = 15;
pub const MAX_HOST_PROBE_TIME: u32 = 24 * 3600;

/// Idle timeout of established sessions, seconds.
pub const LB_DFL_INACT_TIMEOUT: u32 = 4 * 60;
/// Idle timeout for protocols without sessions.
pub const LB_DFL_INACT_NS_TIMEOUT: u32 = 20;
pub const LB_MAX_INACT_TIMEOUT: u32 = 24 * 3600;

pub const MAX_EP_CHECKERS: usize = 4;
/// Hosts probed per checker wake-up.
pub const MAX_EP_SWEEPS: usize = 20;

/// Rule errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("malformed service: {0}")]
    UnknownService(String),

    #[error("malformed endpoint: {0}")]
    UnknownEp(String),

    #[error("rule {0} exists")]
    Exists(String),

    #[error("rule mark allocation failed")]
    Alloc,

    #[error("rule {0} does not exist")]
    NotExists(String),

    #[error("endpoint count {0} out of range")]
    EpCount(usize),

    #[error("malformed rule tuple: {0}")]
    Tuple(String),

    #[error("invalid rule arguments: {0}")]
    Args(String),

    #[error("endpoint host {0} does not exist")]
    EpNotExist(String),

    #[error("endpoint host {0} still referenced by rules")]
    EpInUse(String),
}

impl RuleError {
    pub fn code(&self) -> i32 {
        match self {
            RuleError::UnknownService(_) => -8001,
            RuleError::UnknownEp(_) => -8002,
            RuleError::Exists(_) => -8003,
            RuleError::Alloc => -8004,
            RuleError::NotExists(_) => -8005,
            RuleError::EpCount(_) => -8006,
            RuleError::Tuple(_) => -8007,
            RuleError::Args(_) => -8008,
            RuleError::EpNotExist(_) => -8009,
            RuleError::EpInUse(_) => -8010,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;

/// Rule engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleConfig {
    /// Failed probes before an endpoint is taken out of service.
    pub inact_tries: u32,
    /// How often monitored rules fold endpoint health into their endpoints.
    pub check_interval: Duration,
    /// Number of endpoint checker tasks hosts are spread over.
    pub checkers: usize,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            inact_tries: DFL_INACT_TRIES,
            check_interval: Duration::from_secs(15),
            checkers: MAX_EP_CHECKERS,
        }
    }
}

/// Layer 4 port match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum L4Match {
    #[default]
    Any,
    Port(u16),
    Range { min: u16, max: u16 },
}

impl L4Match {
    /// Build from a `[min, max]` pair; equal bounds are a single port and
    /// zero means any.
    pub fn from_range(min: u16, max: u16) -> Self {
        if min == max {
            if min == 0 {
                L4Match::Any
            } else {
                L4Match::Port(min)
            }
        } else {
            L4Match::Range {
                min: min.min(max),
                max: min.max(max),
            }
        }
    }

    /// Inclusive bounds as programmed in the datapath.
    pub fn bounds(&self) -> (u16, u16) {
        match *self {
            L4Match::Any => (0, 0),
            L4Match::Port(p) => (p, p),
            L4Match::Range { min, max } => (min, max),
        }
    }
}

impl fmt::Display for L4Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L4Match::Any => f.write_str("*"),
            L4Match::Port(p) => write!(f, "{p}"),
            L4Match::Range { min, max } => write!(f, "{min}-{max}"),
        }
    }
}

/// Masked match tuple of a rule. `None` fields are wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RuleTuples {
    pub in_port: Option<String>,
    pub l3_src: Option<IpNet>,
    pub l3_dst: Option<IpNet>,
    pub l4_prot: Option<u8>,
    pub l4_src: L4Match,
    pub l4_dst: L4Match,
    pub pref: u16,
}

impl RuleTuples {
    /// Deterministic identity of the tuple.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RuleTuples {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map_or_else(|| "*".to_string(), T::to_string)
        }
        write!(
            f,
            "inp:{},src:{},dst:{},proto:{},sport:{},dport:{},pref:{}",
            opt(&self.in_port),
            opt(&self.l3_src),
            opt(&self.l3_dst),
            opt(&self.l4_prot),
            self.l4_src,
            self.l4_dst,
            self.pref
        )
    }
}

/// Load-balancer and firewall rules of a zone.
pub struct RuleTable {
    cfg: RuleConfig,
    lb: HashMap<String, NatRule>,
    lb_marks: Counter,
    fw: HashMap<String, FwRule>,
    fw_marks: Counter,
    eps: EpHostTable,
    /// Service IPs with the number of rules using them.
    vips: HashMap<IpAddr, usize>,
}

impl RuleTable {
    pub fn new(cfg: RuleConfig) -> Self {
        let checkers = cfg.checkers.max(1);
        Self {
            cfg,
            lb: HashMap::new(),
            lb_marks: Counter::new(1, MAX_LB_RULES),
            fw: HashMap::new(),
            fw_marks: Counter::new(1, MAX_FW_RULES),
            eps: EpHostTable::new(checkers),
            vips: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RuleConfig {
        &self.cfg
    }

    pub fn nat_find(&self, key: &str) -> Option<&NatRule> {
        self.lb.get(key)
    }

    pub fn nat_by_mark(&self, mark: u32) -> Option<&NatRule> {
        self.lb.values().find(|r| r.mark == mark)
    }

    pub(crate) fn nat_by_mark_mut(&mut self, mark: u32) -> Option<&mut NatRule> {
        self.lb.values_mut().find(|r| r.mark == mark)
    }

    pub fn nat_iter(&self) -> impl Iterator<Item = &NatRule> {
        self.lb.values()
    }

    pub fn fw_find(&self, key: &str) -> Option<&FwRule> {
        self.fw.get(key)
    }

    pub(crate) fn fw_by_mark_mut(&mut self, mark: u32) -> Option<&mut FwRule> {
        self.fw.values_mut().find(|r| r.mark == mark)
    }

    pub fn fw_iter(&self) -> impl Iterator<Item = &FwRule> {
        self.fw.values()
    }

    /// The address is the service IP of a load-balancer rule.
    pub fn is_vip(&self, addr: IpAddr) -> bool {
        self.vips.contains_key(&addr)
    }

    pub fn ep_host(&self, key: &str) -> Option<&EpHost> {
        self.eps.find(key)
    }

    /// Unknown hosts count as active.
    pub fn is_ep_host_active(&self, key: &str) -> bool {
        self.eps.find(key).is_none_or(|h| !h.inactive)
    }

    fn vip_add(&mut self, addr: IpAddr) {
        *self.vips.entry(addr).or_default() += 1;
    }

    fn vip_delete(&mut self, addr: IpAddr) {
        if let Some(n) = self.vips.get_mut(&addr) {
            *n -= 1;
            if *n == 0 {
                self.vips.remove(&addr);
            }
        }
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new(RuleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l4_match_from_range() {
        assert_eq!(L4Match::from_range(0, 0), L4Match::Any);
        assert_eq!(L4Match::from_range(80, 80), L4Match::Port(80));
        assert_eq!(
            L4Match::from_range(2000, 1000),
            L4Match::Range {
                min: 1000,
                max: 2000
            }
        );
        assert_eq!(L4Match::Port(443).bounds(), (443, 443));
        assert_eq!(L4Match::Any.bounds(), (0, 0));
    }

    #[test]
    fn test_tuple_key_is_deterministic() {
        let a = RuleTuples {
            l3_dst: Some("10.0.0.1/32".parse().unwrap()),
            l4_prot: Some(6),
            l4_dst: L4Match::Port(80),
            ..Default::default()
        };
        let b = a.clone();
        assert_eq!(a.key(), b.key());
        assert_eq!(
            a.key(),
            "inp:*,src:*,dst:10.0.0.1/32,proto:6,sport:*,dport:80,pref:0"
        );

        let c = RuleTuples { pref: 1, ..a.clone() };
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_vip_refcount() {
        let mut t = RuleTable::default();
        let ip: IpAddr = "20.20.20.1".parse().unwrap();
        t.vip_add(ip);
        t.vip_add(ip);
        t.vip_delete(ip);
        assert!(t.is_vip(ip));
        t.vip_delete(ip);
        assert!(!t.is_vip(ip));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(RuleError::Exists(String::new()).code(), -8003);
        assert_eq!(RuleError::Args(String::new()).code(), -8008);
    }
}
