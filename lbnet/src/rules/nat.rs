//! Load-balancer (NAT) rules.

use super::{
    EpHostOpts, L4Match, LB_DFL_INACT_NS_TIMEOUT, LB_DFL_INACT_TIMEOUT, LB_MAX_INACT_TIMEOUT,
    MAX_NAT_ENDPOINTS, ProbeType, Result, RuleError, RuleTuples, ep_key,
};
use crate::dp::{
    DpMap, DpStats, DpStatus, DpWork, DpWorkKind, DpWorkOp, NatDpWork, NatEp, NatSel, NatType,
    StatDpWork, SyncTarget,
};
use crate::model::unspecified;
use crate::zone::Zone;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Service protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbProto {
    #[default]
    Tcp,
    Udp,
    Icmp,
    Sctp,
    /// Any protocol, used by SNAT rules.
    None,
}

impl LbProto {
    pub fn number(self) -> u8 {
        match self {
            LbProto::Tcp => 6,
            LbProto::Udp => 17,
            LbProto::Icmp => 1,
            LbProto::Sctp => 132,
            LbProto::None => 0,
        }
    }

    /// Protocols with sessions keep the long idle timeout.
    fn has_sessions(self) -> bool {
        matches!(self, LbProto::Tcp | LbProto::Sctp)
    }
}

impl FromStr for LbProto {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(LbProto::Tcp),
            "udp" => Ok(LbProto::Udp),
            "icmp" => Ok(LbProto::Icmp),
            "sctp" => Ok(LbProto::Sctp),
            "none" => Ok(LbProto::None),
            _ => Err(RuleError::UnknownService(format!("protocol {s}"))),
        }
    }
}

impl fmt::Display for LbProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LbProto::Tcp => "tcp",
            LbProto::Udp => "udp",
            LbProto::Icmp => "icmp",
            LbProto::Sctp => "sctp",
            LbProto::None => "none",
        })
    }
}

/// Endpoint selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbSel {
    #[default]
    Rr,
    Hash,
    /// Weighted round robin over a slot table.
    Prio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbMode {
    #[default]
    Default,
    /// Full NAT with the source picked from the egress interface.
    OneArm,
    /// Full NAT with the service IP as source.
    FullNat,
    /// Direct server return.
    Dsr,
}

/// How a re-submitted endpoint list combines with the existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbOp {
    /// The list replaces the active set, missing endpoints go inactive.
    #[default]
    Add,
    /// The list is added to the existing endpoints.
    Attach,
    /// The listed endpoints are removed.
    Detach,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbServiceArg {
    pub service_ip: IpAddr,
    pub proto: LbProto,
    pub port: u16,
    pub sel: LbSel,
    pub mode: LbMode,
    /// Fold endpoint health into the rule.
    pub monitor: bool,
    /// Session idle timeout in seconds, 0 for the protocol default.
    pub inactive_timeout: u32,
    pub block: u16,
    pub snat: bool,
    pub oper: LbOp,
    /// Overrides the protocol derived endpoint probe.
    pub probe_type: Option<ProbeType>,
    pub probe_port: u16,
    pub probe_retries: u32,
    pub probe_timeout: u32,
    pub name: String,
}

impl Default for LbServiceArg {
    fn default() -> Self {
        Self {
            service_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            proto: LbProto::Tcp,
            port: 0,
            sel: LbSel::Rr,
            mode: LbMode::Default,
            monitor: false,
            inactive_timeout: 0,
            block: 0,
            snat: false,
            oper: LbOp::Add,
            probe_type: None,
            probe_port: 0,
            probe_retries: 0,
            probe_timeout: 0,
            name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbEndPointArg {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub weight: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatAct {
    Snat,
    Dnat,
    FullNat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatEndPoint {
    pub xip: IpAddr,
    /// Source address used towards the endpoint.
    pub rip: IpAddr,
    pub xport: u16,
    pub weight: u8,
    /// Removed from the service but kept in place.
    pub inactive: bool,
    /// Health checks report the endpoint down.
    pub no_service: bool,
    pub stats: DpStats,
}

impl NatEndPoint {
    fn new(arg: &LbEndPointArg) -> Self {
        Self {
            xip: arg.ip,
            rip: unspecified(arg.ip),
            xport: arg.port,
            weight: arg.weight,
            inactive: false,
            no_service: false,
            stats: DpStats::default(),
        }
    }

    fn to_dp(&self) -> NatEp {
        NatEp {
            xip: self.xip,
            rip: self.rip,
            xport: self.xport,
            weight: self.weight,
            inactive: self.inactive || self.no_service,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NatRule {
    pub key: String,
    pub name: String,
    pub tuples: RuleTuples,
    pub service_ip: IpAddr,
    pub proto: LbProto,
    pub port: u16,
    pub block: u16,
    pub act: NatAct,
    pub sel: LbSel,
    pub mode: LbMode,
    pub endpoints: Vec<NatEndPoint>,
    pub monitor: bool,
    pub probe_type: Option<ProbeType>,
    pub probe_port: u16,
    pub probe_retries: u32,
    pub probe_timeout: u32,
    pub inact_timeout: u32,
    pub mark: u32,
    /// An endpoint source address could not be chosen yet.
    pub addr_rslv: bool,
    pub sync: DpStatus,
    last_check: Instant,
}

impl NatRule {
    pub(crate) fn set_ep_stats(&mut self, ep: usize, stats: DpStats) {
        if let Some(e) = self.endpoints.get_mut(ep) {
            e.stats = stats;
        }
    }

    /// Endpoint host key; always derived from the rule protocol.
    fn ep_host_key(&self, ep: &NatEndPoint) -> String {
        let pt = ProbeType::for_proto(self.proto.number());
        let port = if pt.needs_port() { ep.xport } else { 0 };
        ep_key(ep.xip, pt, port)
    }

    fn ep_host_opts(&self, ep: &NatEndPoint) -> EpHostOpts {
        let mut opts = EpHostOpts::default();
        if self.probe_retries != 0 {
            opts.inact_tries = self.probe_retries;
        }
        if self.probe_timeout != 0 {
            opts.probe_duration = self.probe_timeout;
        }
        match self.probe_type {
            Some(pt) => {
                opts.probe_type = pt;
                opts.probe_port = self.probe_port;
            }
            None => {
                opts.probe_type = ProbeType::for_proto(self.proto.number());
                opts.probe_port = if opts.probe_type.needs_port() {
                    ep.xport
                } else {
                    0
                };
            }
        }
        opts.probe_activated =
            self.monitor || matches!(self.mode, LbMode::OneArm | LbMode::FullNat);
        opts
    }

    /// Host keys and options of the endpoints holding a host reference.
    fn ep_hosts(&self) -> Vec<(String, IpAddr, EpHostOpts)> {
        self.endpoints
            .iter()
            .filter(|e| !e.inactive)
            .map(|e| (self.ep_host_key(e), e.xip, self.ep_host_opts(e)))
            .collect()
    }

    fn dp_work(&self, zone: u32, op: DpWorkOp) -> DpWork {
        let (ep_sel, endpoints) = match self.sel {
            // The slot table turns round robin into weighted round robin
            LbSel::Prio => (NatSel::Rr, prio_slots(&self.endpoints)),
            LbSel::Rr => (NatSel::Rr, self.endpoints.iter().map(NatEndPoint::to_dp).collect()),
            LbSel::Hash => (
                NatSel::Hash,
                self.endpoints.iter().map(NatEndPoint::to_dp).collect(),
            ),
        };
        let nat_type = match self.act {
            NatAct::Snat => NatType::Snat,
            NatAct::Dnat => NatType::Dnat,
            NatAct::FullNat => NatType::FullNat,
        };
        DpWork::new(
            op,
            zone,
            Some(SyncTarget::NatRule(self.mark)),
            DpWorkKind::NatLb(NatDpWork {
                zone_num: zone,
                service_ip: self.service_ip,
                l4_port: self.port,
                block: self.block,
                dsr: self.mode == LbMode::Dsr,
                proto: self.proto.number(),
                mark: self.mark,
                nat_type,
                ep_sel,
                inact_timeout: self.inact_timeout,
                endpoints,
            }),
        )
    }

    fn service_arg(&self) -> LbServiceArg {
        LbServiceArg {
            service_ip: self.service_ip,
            proto: self.proto,
            port: self.port,
            sel: self.sel,
            mode: self.mode,
            monitor: self.monitor,
            inactive_timeout: self.inact_timeout,
            block: self.block,
            snat: self.act == NatAct::Snat,
            oper: LbOp::Add,
            probe_type: self.probe_type,
            probe_port: self.probe_port,
            probe_retries: self.probe_retries,
            probe_timeout: self.probe_timeout,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LbEpDump {
    pub ip: IpAddr,
    pub port: u16,
    pub weight: u8,
    /// "active", "inactive" or "down".
    pub state: String,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LbRuleDump {
    pub service: LbServiceArg,
    pub endpoints: Vec<LbEpDump>,
    pub mark: u32,
    pub sync: DpStatus,
}

fn lb_tuples(service_ip: IpAddr, proto: LbProto, port: u16, block: u16) -> RuleTuples {
    RuleTuples {
        l3_dst: Some(IpNet::from(service_ip)),
        l4_prot: Some(proto.number()),
        l4_dst: L4Match::Port(port),
        pref: block,
        ..Default::default()
    }
}

/// Weights must not exceed 100 in total; what is left is spread evenly.
fn normalize_weights(eps: &mut [LbEndPointArg]) -> Result<()> {
    let sum: u32 = eps.iter().map(|e| u32::from(e.weight)).sum();
    if sum > 100 {
        return Err(RuleError::Args(format!("endpoint weights sum to {sum}")));
    }
    if sum < 100 && !eps.is_empty() {
        let rem = (100 - sum) / eps.len() as u32;
        for e in eps.iter_mut() {
            e.weight = e.weight.saturating_add(rem as u8);
        }
    }
    Ok(())
}

/// Expand active endpoints into a fixed slot table by weight.
fn prio_slots(eps: &[NatEndPoint]) -> Vec<NatEp> {
    let mut slots: Vec<usize> = Vec::with_capacity(MAX_NAT_ENDPOINTS);
    let mut small = Vec::new();
    for (i, ep) in eps.iter().enumerate() {
        if ep.inactive {
            continue;
        }
        let sw = usize::from(ep.weight) * MAX_NAT_ENDPOINTS / 100;
        if sw <= 1 {
            small.push(i);
        }
        for _ in 0..sw {
            if slots.len() >= MAX_NAT_ENDPOINTS {
                break;
            }
            slots.push(i);
        }
    }

    let fill: Vec<usize> = if small.is_empty() {
        eps.iter()
            .enumerate()
            .filter(|(_, e)| !e.inactive)
            .map(|(i, _)| i)
            .collect()
    } else {
        small
    };
    if fill.is_empty() {
        return eps.iter().map(NatEndPoint::to_dp).collect();
    }
    let mut v = 0;
    while slots.len() < MAX_NAT_ENDPOINTS {
        slots.push(fill[v % fill.len()]);
        v += 1;
    }
    slots.into_iter().map(|i| eps[i].to_dp()).collect()
}

/// Merge a new endpoint list into an existing one without reordering.
///
/// Endpoints are the same when address, port and weight match. A reweighted
/// endpoint is appended and its old entry deactivated. Returns whether
/// anything changed.
fn merge_endpoints(old: &mut Vec<NatEndPoint>, new: Vec<NatEndPoint>, oper: LbOp) -> bool {
    let mut changed = false;
    let mut seen_old = vec![false; old.len()];
    let mut seen_new = vec![false; new.len()];

    for (i, e) in old.iter_mut().enumerate() {
        let Some(j) = new
            .iter()
            .position(|n| n.xip == e.xip && n.xport == e.xport && n.weight == e.weight)
        else {
            continue;
        };
        if e.inactive && oper != LbOp::Detach {
            e.inactive = false;
            changed = true;
        }
        seen_old[i] = true;
        seen_new[j] = true;
    }

    if oper == LbOp::Detach {
        if !seen_old.iter().any(|s| *s) {
            return false;
        }
        let mut seen = seen_old.into_iter();
        old.retain(|_| !seen.next().unwrap_or(false));
        return true;
    }

    if oper == LbOp::Add {
        for (e, seen) in old.iter_mut().zip(&seen_old) {
            if !seen && !e.inactive {
                e.inactive = true;
                changed = true;
            }
        }
    }

    for (n, seen) in new.into_iter().zip(seen_new) {
        if !seen {
            old.push(n);
            changed = true;
        }
    }
    changed
}

impl Zone {
    pub(crate) fn nat_dp(&mut self, key: &str, op: DpWorkOp) {
        let Some(r) = self.rules.lb.get(key) else {
            return;
        };
        if op == DpWorkOp::Create && r.addr_rslv {
            debug!(rule = %key, "Nat rule waits for a source address");
            return;
        }
        let w = r.dp_work(self.mark, op);
        self.dp.push(w);
    }

    fn nat_stats_get(&mut self, key: &str) {
        let Some(r) = self.rules.lb.get(key) else {
            return;
        };
        let works: Vec<DpWork> = (0..r.endpoints.len())
            .map(|ep| {
                DpWork::new(
                    DpWorkOp::StatsGet,
                    self.mark,
                    Some(SyncTarget::NatStats { mark: r.mark, ep }),
                    DpWorkKind::Stat(StatDpWork {
                        map: DpMap::Nat4,
                        mark: ((r.mark & 0xfff) << 4) | (ep as u32 & 0xf),
                    }),
                )
            })
            .collect();
        for w in works {
            self.dp.push(w);
        }
    }

    /// Pick the source address used towards each endpoint.
    ///
    /// Returns whether any source changed.
    fn nat_elect_ep_src(&mut self, key: &str) -> bool {
        let Some(r) = self.rules.lb.get(key) else {
            return false;
        };
        let mut rslv = false;
        let rips: Vec<IpAddr> = r
            .endpoints
            .iter()
            .map(|ep| match r.mode {
                LbMode::OneArm => match self.ifa_select_any(ep.xip, true) {
                    Some((sip, _)) if sip == ep.xip => unspecified(ep.xip),
                    Some((sip, _)) => sip,
                    None => {
                        debug!(rule = %key, ep = %ep.xip, "No source address for endpoint");
                        rslv = true;
                        ep.rip
                    }
                },
                LbMode::FullNat => {
                    if ep.xip == r.service_ip || self.l3.ifa_addr_local(ep.xip) {
                        unspecified(ep.xip)
                    } else {
                        r.service_ip
                    }
                }
                _ if r.service_ip.is_ipv6() && ep.xip.is_ipv4() => {
                    match self.ifa_select_any(ep.xip, false) {
                        Some((sip, _)) => sip,
                        None => {
                            rslv = true;
                            ep.rip
                        }
                    }
                }
                _ => unspecified(ep.xip),
            })
            .collect();

        let Some(r) = self.rules.lb.get_mut(key) else {
            return false;
        };
        let mut changed = false;
        for (ep, rip) in r.endpoints.iter_mut().zip(rips) {
            if ep.rip != rip {
                debug!(rule = %key, ep = %ep.xip, src = %rip, "Endpoint source elected");
                ep.rip = rip;
                changed = true;
            }
        }
        r.addr_rslv = rslv;
        changed
    }

    fn nat_ep_hosts_ref(&mut self, hosts: Vec<(String, IpAddr, EpHostOpts)>) {
        for (key, ip, opts) in hosts {
            if let Err(e) = self.rules.ep_host_add(false, ip, Some(&key), opts) {
                warn!(ep = %key, error = %e, "Endpoint host add failed");
            }
        }
    }

    fn nat_ep_hosts_unref(&mut self, keys: Vec<String>) {
        for key in keys {
            match self.rules.ep_host_delete(false, &key) {
                Ok(()) | Err(RuleError::EpInUse(_)) => {}
                Err(e) => debug!(ep = %key, error = %e, "Endpoint host release"),
            }
        }
    }

    /// Add a load-balancer rule or update the endpoints of an existing one.
    ///
    /// Endpoints already in the rule keep their position. With
    /// [`LbOp::Add`] endpoints missing from `eps` are marked inactive
    /// instead of being removed. An update that changes nothing fails with
    /// [`RuleError::Exists`].
    pub fn nat_lb_rule_add(
        &mut self,
        mut serv: LbServiceArg,
        mut eps: Vec<LbEndPointArg>,
    ) -> Result<()> {
        if serv.inactive_timeout > LB_MAX_INACT_TIMEOUT {
            return Err(RuleError::Args(format!(
                "inactive timeout {}",
                serv.inactive_timeout
            )));
        }
        if serv.inactive_timeout == 0 {
            serv.inactive_timeout = if serv.proto.has_sessions() {
                LB_DFL_INACT_TIMEOUT
            } else {
                LB_DFL_INACT_NS_TIMEOUT
            };
        }

        match serv.probe_type {
            Some(pt) => {
                if pt.needs_port() && serv.probe_port == 0 {
                    return Err(RuleError::Args(format!("{pt} probe needs a port")));
                }
                if !pt.needs_port() && serv.probe_port != 0 {
                    return Err(RuleError::Args(format!("{pt} probe takes no port")));
                }
                if pt != ProbeType::None {
                    serv.monitor = true;
                }
            }
            None if serv.probe_port != 0 => {
                return Err(RuleError::Args("probe port without probe type".into()));
            }
            None => {}
        }

        if eps.is_empty() || eps.len() > MAX_NAT_ENDPOINTS {
            return Err(RuleError::EpCount(eps.len()));
        }
        if serv.proto == LbProto::Icmp && serv.port != 0 {
            return Err(RuleError::UnknownService("icmp service with a port".into()));
        }
        normalize_weights(&mut eps)?;

        let mut endpoints = Vec::with_capacity(eps.len());
        for e in &eps {
            if serv.service_ip.is_ipv4() && e.ip.is_ipv6() {
                return Err(RuleError::UnknownService(format!(
                    "v6 endpoint {} for v4 service",
                    e.ip
                )));
            }
            if serv.proto == LbProto::Icmp && e.port != 0 {
                return Err(RuleError::UnknownService(format!(
                    "icmp endpoint {} with a port",
                    e.ip
                )));
            }
            if serv.mode == LbMode::Dsr && e.port != serv.port {
                return Err(RuleError::UnknownService(format!(
                    "dsr endpoint {}:{} port differs",
                    e.ip, e.port
                )));
            }
            endpoints.push(NatEndPoint::new(e));
        }
        endpoints.sort_by_key(|e| e.xip);

        let tuples = lb_tuples(serv.service_ip, serv.proto, serv.port, serv.block);
        let key = tuples.key();

        if let Some(r) = self.rules.lb.get_mut(&key) {
            let before = r.ep_hosts();
            let mut merged = r.endpoints.clone();
            let mut changed = merge_endpoints(&mut merged, endpoints, serv.oper);
            if r.sel != serv.sel
                || r.mode != serv.mode
                || r.probe_type != serv.probe_type
                || r.probe_port != serv.probe_port
            {
                changed = true;
            }
            if !changed {
                return Err(RuleError::Exists(key));
            }
            if merged.is_empty() {
                debug!(rule = %key, "Nat rule has no endpoints left");
                return self.nat_delete_key(&key);
            }

            r.sel = serv.sel;
            r.mode = serv.mode;
            r.monitor = serv.monitor;
            r.probe_type = serv.probe_type;
            r.probe_port = serv.probe_port;
            r.probe_retries = serv.probe_retries;
            r.probe_timeout = serv.probe_timeout;
            r.inact_timeout = serv.inactive_timeout;
            r.endpoints = merged;
            r.last_check = Instant::now();
            let after = r.ep_hosts();
            let snat = r.act == NatAct::Snat;

            if !snat {
                let dropped = before
                    .iter()
                    .filter(|b| !after.iter().any(|a| a.0 == b.0))
                    .map(|b| b.0.clone())
                    .collect();
                let added = after
                    .into_iter()
                    .filter(|a| !before.iter().any(|b| b.0 == a.0))
                    .collect();
                self.nat_ep_hosts_unref(dropped);
                self.nat_ep_hosts_ref(added);
                self.nat_elect_ep_src(&key);
            }
            debug!(rule = %key, "Nat rule updated");
            self.nat_dp(&key, DpWorkOp::Create);
            return Ok(());
        }

        if serv.oper == LbOp::Detach {
            return Err(RuleError::NotExists(key));
        }

        let act = if serv.snat {
            NatAct::Snat
        } else if matches!(serv.mode, LbMode::FullNat | LbMode::OneArm) {
            NatAct::FullNat
        } else {
            NatAct::Dnat
        };
        let mark = self.rules.lb_marks.get().map_err(|e| {
            warn!(rule = %key, error = %e, "Nat rule mark allocation failed");
            RuleError::Alloc
        })?;

        let rule = NatRule {
            key: key.clone(),
            name: serv.name.clone(),
            tuples,
            service_ip: serv.service_ip,
            proto: serv.proto,
            port: serv.port,
            block: serv.block,
            act,
            sel: serv.sel,
            mode: serv.mode,
            endpoints,
            monitor: serv.monitor,
            probe_type: serv.probe_type,
            probe_port: serv.probe_port,
            probe_retries: serv.probe_retries,
            probe_timeout: serv.probe_timeout,
            inact_timeout: serv.inactive_timeout,
            mark,
            addr_rslv: false,
            sync: DpStatus::Ok,
            last_check: Instant::now(),
        };
        let hosts = rule.ep_hosts();
        self.rules.lb.insert(key.clone(), rule);

        if act != NatAct::Snat {
            self.nat_ep_hosts_ref(hosts);
            self.nat_elect_ep_src(&key);
            self.rules.vip_add(serv.service_ip);
        }

        info!(rule = %key, mark, "Nat rule added");
        self.nat_dp(&key, DpWorkOp::Create);
        Ok(())
    }

    /// Delete the rule matching the service tuple of `serv`.
    pub fn nat_lb_rule_delete(&mut self, serv: &LbServiceArg) -> Result<()> {
        let key = lb_tuples(serv.service_ip, serv.proto, serv.port, serv.block).key();
        self.nat_delete_key(&key)
    }

    fn nat_delete_key(&mut self, key: &str) -> Result<()> {
        let Some(r) = self.rules.lb.remove(key) else {
            return Err(RuleError::NotExists(key.to_string()));
        };
        if let Err(e) = self.rules.lb_marks.put(r.mark) {
            warn!(rule = %key, error = %e, "Nat rule mark release failed");
        }
        if r.act != NatAct::Snat {
            self.nat_ep_hosts_unref(r.ep_hosts().into_iter().map(|h| h.0).collect());
            self.rules.vip_delete(r.service_ip);
        }
        self.dp.push(r.dp_work(self.mark, DpWorkOp::Remove));
        info!(rule = %key, mark = r.mark, "Nat rule deleted");
        Ok(())
    }

    pub fn nat_lb_rules_get(&self) -> Vec<LbRuleDump> {
        self.rules
            .lb
            .values()
            .map(|r| LbRuleDump {
                service: r.service_arg(),
                endpoints: r
                    .endpoints
                    .iter()
                    .map(|e| LbEpDump {
                        ip: e.xip,
                        port: e.xport,
                        weight: e.weight,
                        state: if e.inactive {
                            "inactive"
                        } else if e.no_service {
                            "down"
                        } else {
                            "active"
                        }
                        .to_string(),
                        packets: e.stats.packets,
                        bytes: e.stats.bytes,
                    })
                    .collect(),
                mark: r.mark,
                sync: r.sync,
            })
            .collect()
    }

    /// Fold endpoint host health into a monitored rule.
    ///
    /// Returns whether any endpoint changed state.
    fn nat_sync_ep_health(&mut self, key: &str, now: Instant) -> bool {
        let interval = self.rules.cfg.check_interval;
        let Some(r) = self.rules.lb.get(key) else {
            return false;
        };
        if now.saturating_duration_since(r.last_check) < interval {
            return false;
        }
        let health: Vec<bool> = r
            .endpoints
            .iter()
            .map(|e| self.rules.is_ep_host_active(&r.ep_host_key(e)))
            .collect();

        let Some(r) = self.rules.lb.get_mut(key) else {
            return false;
        };
        let mut changed = false;
        for (e, up) in r.endpoints.iter_mut().zip(health) {
            if !up && !e.no_service {
                e.no_service = true;
                changed = true;
                debug!(rule = %key, ep = %e.xip, "Endpoint out of service");
            } else if up && e.no_service {
                e.no_service = false;
                changed = true;
                debug!(rule = %key, ep = %e.xip, "Endpoint back in service");
            }
        }
        r.last_check = now;
        changed
    }

    /// Periodic rule maintenance: re-push failed rules, refresh endpoint
    /// sources and statistics, and apply endpoint health.
    pub fn rules_sync(&mut self) {
        let now = Instant::now();
        let keys: Vec<String> = self.rules.lb.keys().cloned().collect();
        for key in keys {
            let src_changed = self.nat_elect_ep_src(&key);
            let Some((sync, monitor)) = self.rules.lb.get(&key).map(|r| (r.sync, r.monitor))
            else {
                continue;
            };
            if sync != DpStatus::Ok || src_changed {
                debug!(rule = %key, ?sync, "Nat rule resync");
                self.nat_dp(&key, DpWorkOp::Create);
            }
            self.nat_stats_get(&key);

            if monitor && self.nat_sync_ep_health(&key, now) {
                debug!(rule = %key, "Nat rule endpoints changed");
                self.nat_dp(&key, DpWorkOp::Create);
            }
        }
        self.fw_sync();
    }

    pub fn rule_destruct_all(&mut self) {
        let keys: Vec<String> = self.rules.lb.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.nat_delete_key(&key) {
                debug!(rule = %key, error = %e, "Nat rule destruct");
            }
        }
        self.fw_destruct_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dp::{DpHandle, DpWork};
    use crossbeam_channel::Receiver;

    fn zone() -> (Zone, Receiver<DpWork>) {
        let (dp, rx) = DpHandle::channel(4096);
        (Zone::new("test", 0, dp), rx)
    }

    fn ep(ip: &str, port: u16) -> LbEndPointArg {
        LbEndPointArg {
            ip: ip.parse().unwrap(),
            port,
            weight: 0,
        }
    }

    fn service() -> LbServiceArg {
        LbServiceArg {
            service_ip: "20.20.20.1".parse().unwrap(),
            proto: LbProto::Tcp,
            port: 2020,
            ..Default::default()
        }
    }

    fn nat_works(rx: &Receiver<DpWork>) -> Vec<(DpWorkOp, NatDpWork)> {
        rx.try_iter()
            .filter_map(|w| match w.kind {
                DpWorkKind::NatLb(n) => Some((w.op, n)),
                _ => None,
            })
            .collect()
    }

    fn only_rule(z: &Zone) -> &NatRule {
        z.rules.nat_iter().next().unwrap()
    }

    #[test]
    fn test_add_rule() {
        let (mut z, rx) = zone();
        z.nat_lb_rule_add(service(), vec![ep("10.0.0.3", 80), ep("10.0.0.1", 80)])
            .unwrap();

        let r = only_rule(&z);
        assert_eq!(r.mark, 1);
        assert_eq!(r.act, NatAct::Dnat);
        assert_eq!(r.inact_timeout, LB_DFL_INACT_TIMEOUT);
        // Sorted by address, weights spread evenly
        assert_eq!(r.endpoints[0].xip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(r.endpoints[0].weight, 50);
        assert!(z.rules.is_vip("20.20.20.1".parse().unwrap()));
        assert_eq!(z.rules.ep_hosts_get().len(), 2);

        let works = nat_works(&rx);
        assert_eq!(works.len(), 1);
        assert_eq!(works[0].0, DpWorkOp::Create);
        assert_eq!(works[0].1.endpoints.len(), 2);
        assert_eq!(works[0].1.proto, 6);
    }

    #[test]
    fn test_validation() {
        let (mut z, _rx) = zone();
        assert_eq!(
            z.nat_lb_rule_add(service(), vec![]),
            Err(RuleError::EpCount(0))
        );

        let icmp = LbServiceArg {
            proto: LbProto::Icmp,
            port: 10,
            ..service()
        };
        assert!(matches!(
            z.nat_lb_rule_add(icmp, vec![ep("10.0.0.1", 0)]),
            Err(RuleError::UnknownService(_))
        ));

        let dsr = LbServiceArg {
            mode: LbMode::Dsr,
            ..service()
        };
        assert!(matches!(
            z.nat_lb_rule_add(dsr, vec![ep("10.0.0.1", 80)]),
            Err(RuleError::UnknownService(_))
        ));

        let long = LbServiceArg {
            inactive_timeout: LB_MAX_INACT_TIMEOUT + 1,
            ..service()
        };
        assert!(matches!(
            z.nat_lb_rule_add(long, vec![ep("10.0.0.1", 80)]),
            Err(RuleError::Args(_))
        ));

        let heavy = vec![
            LbEndPointArg {
                weight: 60,
                ..ep("10.0.0.1", 80)
            },
            LbEndPointArg {
                weight: 60,
                ..ep("10.0.0.2", 80)
            },
        ];
        assert!(matches!(
            z.nat_lb_rule_add(service(), heavy),
            Err(RuleError::Args(_))
        ));
        assert!(z.rules.nat_iter().next().is_none());
    }

    #[test]
    fn test_udp_default_timeout() {
        let (mut z, _rx) = zone();
        let serv = LbServiceArg {
            proto: LbProto::Udp,
            ..service()
        };
        z.nat_lb_rule_add(serv, vec![ep("10.0.0.1", 53)]).unwrap();
        assert_eq!(only_rule(&z).inact_timeout, LB_DFL_INACT_NS_TIMEOUT);
    }

    #[test]
    fn test_endpoint_stability() {
        let (mut z, rx) = zone();
        z.nat_lb_rule_add(
            service(),
            vec![ep("10.0.0.1", 80), ep("10.0.0.2", 80), ep("10.0.0.3", 80)],
        )
        .unwrap();
        z.nat_lb_rule_add(
            service(),
            vec![ep("10.0.0.4", 80), ep("10.0.0.1", 80), ep("10.0.0.3", 80)],
        )
        .unwrap();

        let r = only_rule(&z);
        let order: Vec<(String, bool)> = r
            .endpoints
            .iter()
            .map(|e| (e.xip.to_string(), e.inactive))
            .collect();
        assert_eq!(
            order,
            vec![
                ("10.0.0.1".to_string(), false),
                ("10.0.0.2".to_string(), true),
                ("10.0.0.3".to_string(), false),
                ("10.0.0.4".to_string(), false),
            ]
        );
        // The inactive endpoint released its host
        assert!(z.rules.ep_host("10.0.0.2_tcp_80").is_none());

        let works = nat_works(&rx);
        let last = &works.last().unwrap().1;
        assert_eq!(last.endpoints.len(), 4);
        assert!(last.endpoints[1].inactive);
    }

    #[test]
    fn test_resubmit_is_noop() {
        let (mut z, rx) = zone();
        z.nat_lb_rule_add(service(), vec![ep("10.0.0.1", 80), ep("10.0.0.2", 80)])
            .unwrap();
        let _ = nat_works(&rx);

        let err = z
            .nat_lb_rule_add(service(), vec![ep("10.0.0.2", 80), ep("10.0.0.1", 80)])
            .unwrap_err();
        assert!(matches!(err, RuleError::Exists(_)));
        assert!(nat_works(&rx).is_empty());

        // A selection change is a real update
        let hash = LbServiceArg {
            sel: LbSel::Hash,
            ..service()
        };
        z.nat_lb_rule_add(hash, vec![ep("10.0.0.2", 80), ep("10.0.0.1", 80)])
            .unwrap();
        assert_eq!(nat_works(&rx)[0].1.ep_sel, NatSel::Hash);
    }

    fn ep_state(z: &Zone) -> Vec<(String, u8, bool)> {
        only_rule(z)
            .endpoints
            .iter()
            .map(|e| (e.xip.to_string(), e.weight, e.inactive))
            .collect()
    }

    #[test]
    fn test_reactivate_endpoint() {
        let (mut z, _rx) = zone();
        z.nat_lb_rule_add(service(), vec![ep("10.0.0.1", 80), ep("10.0.0.2", 80)])
            .unwrap();
        z.nat_lb_rule_add(service(), vec![ep("10.0.0.1", 80)]).unwrap();
        // Alone it carries the full weight, so it is a new endpoint
        assert_eq!(
            ep_state(&z),
            vec![
                ("10.0.0.1".to_string(), 50, true),
                ("10.0.0.2".to_string(), 50, true),
                ("10.0.0.1".to_string(), 100, false),
            ]
        );

        z.nat_lb_rule_add(service(), vec![ep("10.0.0.1", 80), ep("10.0.0.2", 80)])
            .unwrap();
        assert_eq!(
            ep_state(&z),
            vec![
                ("10.0.0.1".to_string(), 50, false),
                ("10.0.0.2".to_string(), 50, false),
                ("10.0.0.1".to_string(), 100, true),
            ]
        );
        assert!(z.rules.ep_host("10.0.0.1_tcp_80").is_some());
    }

    #[test]
    fn test_reweight_appends_endpoints() {
        let (mut z, rx) = zone();
        let weighted = |ip: &str, weight: u8| LbEndPointArg {
            weight,
            ..ep(ip, 80)
        };
        z.nat_lb_rule_add(
            service(),
            vec![weighted("10.0.0.1", 50), weighted("10.0.0.2", 50)],
        )
        .unwrap();
        let _ = nat_works(&rx);

        z.nat_lb_rule_add(
            service(),
            vec![weighted("10.0.0.1", 70), weighted("10.0.0.2", 30)],
        )
        .unwrap();
        assert_eq!(
            ep_state(&z),
            vec![
                ("10.0.0.1".to_string(), 50, true),
                ("10.0.0.2".to_string(), 50, true),
                ("10.0.0.1".to_string(), 70, false),
                ("10.0.0.2".to_string(), 30, false),
            ]
        );
        let works = nat_works(&rx);
        assert_eq!(works.len(), 1);
        assert_eq!(works[0].1.endpoints.len(), 4);

        // Same addresses and weights again change nothing
        assert!(matches!(
            z.nat_lb_rule_add(
                service(),
                vec![weighted("10.0.0.2", 30), weighted("10.0.0.1", 70)],
            ),
            Err(RuleError::Exists(_))
        ));
    }

    #[test]
    fn test_attach_detach() {
        let (mut z, _rx) = zone();
        z.nat_lb_rule_add(service(), vec![ep("10.0.0.1", 80)]).unwrap();

        let attach = LbServiceArg {
            oper: LbOp::Attach,
            ..service()
        };
        z.nat_lb_rule_add(attach, vec![ep("10.0.0.2", 80)]).unwrap();
        assert_eq!(only_rule(&z).endpoints.len(), 2);
        assert!(only_rule(&z).endpoints.iter().all(|e| !e.inactive));

        let detach = LbServiceArg {
            oper: LbOp::Detach,
            ..service()
        };
        z.nat_lb_rule_add(detach.clone(), vec![ep("10.0.0.1", 80)])
            .unwrap();
        assert_eq!(only_rule(&z).endpoints.len(), 1);

        // Detaching the last endpoint removes the rule
        z.nat_lb_rule_add(detach.clone(), vec![ep("10.0.0.2", 80)])
            .unwrap();
        assert!(z.rules.nat_iter().next().is_none());
        assert!(matches!(
            z.nat_lb_rule_add(detach, vec![ep("10.0.0.2", 80)]),
            Err(RuleError::NotExists(_))
        ));
    }

    #[test]
    fn test_delete_rule() {
        let (mut z, rx) = zone();
        z.nat_lb_rule_add(service(), vec![ep("10.0.0.1", 80)]).unwrap();
        let _ = nat_works(&rx);

        z.nat_lb_rule_delete(&service()).unwrap();
        assert!(z.rules.nat_iter().next().is_none());
        assert!(!z.rules.is_vip("20.20.20.1".parse().unwrap()));
        assert!(z.rules.ep_hosts_get().is_empty());
        assert_eq!(nat_works(&rx)[0].0, DpWorkOp::Remove);
        assert!(matches!(
            z.nat_lb_rule_delete(&service()),
            Err(RuleError::NotExists(_))
        ));

        // The mark is reusable
        z.nat_lb_rule_add(service(), vec![ep("10.0.0.1", 80)]).unwrap();
        assert_eq!(only_rule(&z).mark, 2);
    }

    #[test]
    fn test_prio_slots() {
        let mk = |ip: &str, weight: u8| NatEndPoint {
            weight,
            ..NatEndPoint::new(&ep(ip, 80))
        };
        let eps = vec![mk("10.0.0.1", 75), mk("10.0.0.2", 25)];
        let slots = prio_slots(&eps);
        assert_eq!(slots.len(), MAX_NAT_ENDPOINTS);
        let first = slots
            .iter()
            .filter(|e| e.xip == "10.0.0.1".parse::<IpAddr>().unwrap())
            .count();
        assert_eq!(first, 24);

        let mut eps = eps;
        eps[0].inactive = true;
        let slots = prio_slots(&eps);
        assert!(slots.iter().all(|e| e.xip == eps[1].xip));
    }

    #[test]
    fn test_fullnat_source() {
        let (mut z, rx) = zone();
        let serv = LbServiceArg {
            mode: LbMode::FullNat,
            ..service()
        };
        z.nat_lb_rule_add(serv, vec![ep("10.0.0.1", 80)]).unwrap();
        let r = only_rule(&z);
        assert_eq!(r.act, NatAct::FullNat);
        assert_eq!(r.endpoints[0].rip, r.service_ip);
        assert_eq!(nat_works(&rx)[0].1.nat_type, NatType::FullNat);
    }

    #[test]
    fn test_onearm_waits_for_source() {
        let (mut z, rx) = zone();
        let serv = LbServiceArg {
            mode: LbMode::OneArm,
            ..service()
        };
        z.nat_lb_rule_add(serv, vec![ep("10.0.0.1", 80)]).unwrap();
        assert!(only_rule(&z).addr_rslv);
        assert!(nat_works(&rx).is_empty());
    }

    #[test]
    fn test_monitor_folds_host_health() {
        let (mut z, rx) = zone();
        z.rules.cfg.check_interval = std::time::Duration::ZERO;
        let serv = LbServiceArg {
            monitor: true,
            ..service()
        };
        z.nat_lb_rule_add(serv, vec![ep("10.0.0.1", 80)]).unwrap();
        let _ = nat_works(&rx);

        // Probe the host down
        let now = Instant::now();
        let jobs = z.rules.ep_probe_jobs(0, 1, now);
        assert_eq!(jobs.len(), 1);
        z.rules.ep_probe_apply(
            vec![crate::rules::ProbeOutcome {
                key: jobs[0].key.clone(),
                ok: false,
                rtt: None,
            }],
            now,
        );

        z.rules_sync();
        assert!(only_rule(&z).endpoints[0].no_service);
        let works = nat_works(&rx);
        assert_eq!(works.len(), 1);
        assert!(works[0].1.endpoints[0].inactive);

        // No flip, no reprogram
        z.rules_sync();
        assert!(nat_works(&rx).is_empty());
    }

    #[test]
    fn test_destruct_all() {
        let (mut z, _rx) = zone();
        z.nat_lb_rule_add(service(), vec![ep("10.0.0.1", 80)]).unwrap();
        z.rule_destruct_all();
        assert!(z.rules.nat_iter().next().is_none());
    }
}
