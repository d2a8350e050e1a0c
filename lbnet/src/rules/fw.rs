//! Firewall rules.

use super::{L4Match, Result, RuleError, RuleTuples};
use crate::dp::{DpStatus, DpWork, DpWorkKind, DpWorkOp, FwDpWork, FwType, SyncTarget};
use crate::zone::Zone;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Match part of a firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FwRuleArg {
    pub src: IpNet,
    pub dst: IpNet,
    pub src_port_min: u16,
    pub src_port_max: u16,
    pub dst_port_min: u16,
    pub dst_port_max: u16,
    /// 0 matches any protocol.
    pub proto: u8,
    /// Empty matches any input port.
    pub in_port: String,
    pub pref: u16,
}

impl Default for FwRuleArg {
    fn default() -> Self {
        Self {
            src: IpNet::default(),
            dst: IpNet::default(),
            src_port_min: 0,
            src_port_max: 0,
            dst_port_min: 0,
            dst_port_max: 0,
            proto: 0,
            in_port: String::new(),
            pref: 0,
        }
    }
}

impl FwRuleArg {
    fn tuples(&self) -> Result<RuleTuples> {
        if self.src.addr().is_ipv4() != self.dst.addr().is_ipv4() {
            return Err(RuleError::Tuple(format!(
                "mixed families {} {}",
                self.src, self.dst
            )));
        }
        Ok(RuleTuples {
            in_port: (!self.in_port.is_empty()).then(|| self.in_port.clone()),
            l3_src: Some(self.src.trunc()),
            l3_dst: Some(self.dst.trunc()),
            l4_prot: (self.proto != 0).then_some(self.proto),
            l4_src: L4Match::from_range(self.src_port_min, self.src_port_max),
            l4_dst: L4Match::from_range(self.dst_port_min, self.dst_port_max),
            pref: self.pref,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FwAction {
    Allow,
    #[default]
    Drop,
    /// Send matching packets out of another port.
    Redirect { port: String },
    /// Punt to the host stack.
    Trap,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FwOptArg {
    pub action: FwAction,
    /// Mark set on matching packets.
    pub mark: u32,
    /// Record matching connections.
    pub record: bool,
}

#[derive(Debug, Clone)]
pub struct FwRule {
    pub key: String,
    pub arg: FwRuleArg,
    pub tuples: RuleTuples,
    pub opts: FwOptArg,
    pub mark: u32,
    pub sync: DpStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct FwRuleDump {
    pub rule: FwRuleArg,
    pub opts: FwOptArg,
    pub mark: u32,
    pub sync: DpStatus,
}

impl Zone {
    fn fw_dp_work(&self, r: &FwRule, op: DpWorkOp) -> std::result::Result<DpWork, String> {
        let port = match &r.tuples.in_port {
            Some(name) => self.ports.find(name).ok_or_else(|| name.clone())?.port_no,
            None => 0,
        };
        let (fw_type, fw_val1) = match &r.opts.action {
            FwAction::Allow => (FwType::Fwd, 0),
            FwAction::Drop => (FwType::Drop, 0),
            FwAction::Trap => (FwType::Trap, 0),
            FwAction::Redirect { port } => (
                FwType::Rdr,
                self.ports.find(port).ok_or_else(|| port.clone())?.port_no,
            ),
        };
        let (l4_src_min, l4_src_max) = r.tuples.l4_src.bounds();
        let (l4_dst_min, l4_dst_max) = r.tuples.l4_dst.bounds();
        Ok(DpWork::new(
            op,
            self.mark,
            Some(SyncTarget::FwRule(r.mark)),
            DpWorkKind::Fw(FwDpWork {
                zone_num: self.mark,
                src: r.tuples.l3_src.filter(|n| n.prefix_len() > 0),
                dst: r.tuples.l3_dst.filter(|n| n.prefix_len() > 0),
                l4_src_min,
                l4_src_max,
                l4_dst_min,
                l4_dst_max,
                port,
                pref: r.tuples.pref,
                proto: r.tuples.l4_prot.unwrap_or(0),
                mark: r.mark,
                fw_type,
                fw_val1,
                fw_val2: r.opts.mark,
                record: r.opts.record,
            }),
        ))
    }

    /// Program a rule; rules naming a missing port are left in `ChangeErr`
    /// until the port shows up.
    fn fw_dp(&mut self, key: &str, op: DpWorkOp) {
        let Some(r) = self.rules.fw.get(key) else {
            return;
        };
        match self.fw_dp_work(r, op) {
            Ok(w) => self.dp.push(w),
            Err(port) => {
                debug!(rule = %key, port, "Firewall rule port missing");
                if let Some(r) = self.rules.fw.get_mut(key) {
                    r.sync = DpStatus::ChangeErr;
                }
            }
        }
    }

    pub fn fw_rule_add(&mut self, arg: FwRuleArg, opts: FwOptArg) -> Result<()> {
        let tuples = arg.tuples()?;
        if let FwAction::Redirect { port } = &opts.action
            && port.is_empty()
        {
            return Err(RuleError::Args("redirect without a port".into()));
        }
        let key = tuples.key();
        if self.rules.fw.contains_key(&key) {
            return Err(RuleError::Exists(key));
        }

        let mark = self.rules.fw_marks.get().map_err(|e| {
            warn!(rule = %key, error = %e, "Firewall rule mark allocation failed");
            RuleError::Alloc
        })?;
        self.rules.fw.insert(
            key.clone(),
            FwRule {
                key: key.clone(),
                arg,
                tuples,
                opts,
                mark,
                sync: DpStatus::Ok,
            },
        );
        info!(rule = %key, mark, "Firewall rule added");
        self.fw_dp(&key, DpWorkOp::Create);
        Ok(())
    }

    pub fn fw_rule_delete(&mut self, arg: &FwRuleArg) -> Result<()> {
        let key = arg.tuples()?.key();
        self.fw_delete_key(&key)
    }

    fn fw_delete_key(&mut self, key: &str) -> Result<()> {
        if !self.rules.fw.contains_key(key) {
            return Err(RuleError::NotExists(key.to_string()));
        }
        self.fw_dp(key, DpWorkOp::Remove);
        let Some(r) = self.rules.fw.remove(key) else {
            return Err(RuleError::NotExists(key.to_string()));
        };
        if let Err(e) = self.rules.fw_marks.put(r.mark) {
            warn!(rule = %key, error = %e, "Firewall rule mark release failed");
        }
        info!(rule = %key, "Firewall rule deleted");
        Ok(())
    }

    pub fn fw_rules_get(&self) -> Vec<FwRuleDump> {
        self.rules
            .fw
            .values()
            .map(|r| FwRuleDump {
                rule: r.arg.clone(),
                opts: r.opts.clone(),
                mark: r.mark,
                sync: r.sync,
            })
            .collect()
    }

    pub(super) fn fw_sync(&mut self) {
        let failed: Vec<String> = self
            .rules
            .fw
            .values()
            .filter(|r| r.sync != DpStatus::Ok)
            .map(|r| r.key.clone())
            .collect();
        for key in failed {
            debug!(rule = %key, "Firewall rule resync");
            if let Some(r) = self.rules.fw.get_mut(&key) {
                r.sync = DpStatus::InProgress;
            }
            self.fw_dp(&key, DpWorkOp::Create);
        }
    }

    pub(super) fn fw_destruct_all(&mut self) {
        let keys: Vec<String> = self.rules.fw.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.fw_delete_key(&key) {
                debug!(rule = %key, error = %e, "Firewall rule destruct");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dp::DpHandle;
    use crate::model::{MacAddr, PortKind};
    use crate::port::PortHwInfo;
    use crossbeam_channel::Receiver;

    fn zone() -> (Zone, Receiver<DpWork>) {
        let (dp, rx) = DpHandle::channel(4096);
        (Zone::new("test", 0, dp), rx)
    }

    fn fw_works(rx: &Receiver<DpWork>) -> Vec<(DpWorkOp, FwDpWork)> {
        rx.try_iter()
            .filter_map(|w| match w.kind {
                DpWorkKind::Fw(f) => Some((w.op, f)),
                _ => None,
            })
            .collect()
    }

    fn ssh_rule() -> FwRuleArg {
        FwRuleArg {
            src: "10.10.0.0/16".parse().unwrap(),
            dst: "0.0.0.0/0".parse().unwrap(),
            dst_port_min: 22,
            dst_port_max: 22,
            proto: 6,
            ..Default::default()
        }
    }

    #[test]
    fn test_add_delete() {
        let (mut z, rx) = zone();
        z.fw_rule_add(ssh_rule(), FwOptArg::default()).unwrap();

        let works = fw_works(&rx);
        assert_eq!(works.len(), 1);
        let w = &works[0].1;
        assert_eq!(w.fw_type, FwType::Drop);
        assert_eq!(w.src, Some("10.10.0.0/16".parse().unwrap()));
        assert_eq!(w.dst, None);
        assert_eq!((w.l4_dst_min, w.l4_dst_max), (22, 22));
        assert_eq!(w.mark, 1);

        assert!(matches!(
            z.fw_rule_add(ssh_rule(), FwOptArg::default()),
            Err(RuleError::Exists(_))
        ));

        z.fw_rule_delete(&ssh_rule()).unwrap();
        assert_eq!(fw_works(&rx)[0].0, DpWorkOp::Remove);
        assert!(z.fw_rules_get().is_empty());
        assert!(matches!(
            z.fw_rule_delete(&ssh_rule()),
            Err(RuleError::NotExists(_))
        ));
    }

    #[test]
    fn test_pref_distinguishes_rules() {
        let (mut z, _rx) = zone();
        z.fw_rule_add(ssh_rule(), FwOptArg::default()).unwrap();
        let other = FwRuleArg {
            pref: 10,
            ..ssh_rule()
        };
        z.fw_rule_add(other, FwOptArg::default()).unwrap();
        assert_eq!(z.fw_rules_get().len(), 2);
    }

    #[test]
    fn test_mixed_family_rejected() {
        let (mut z, _rx) = zone();
        let bad = FwRuleArg {
            dst: "::/0".parse().unwrap(),
            ..ssh_rule()
        };
        assert!(matches!(
            z.fw_rule_add(bad, FwOptArg::default()),
            Err(RuleError::Tuple(_))
        ));
    }

    #[test]
    fn test_redirect_waits_for_port() {
        let (mut z, rx) = zone();
        let opts = FwOptArg {
            action: FwAction::Redirect {
                port: "eth1".into(),
            },
            mark: 7,
            record: true,
        };
        z.fw_rule_add(ssh_rule(), opts).unwrap();
        assert!(fw_works(&rx).is_empty());
        assert_eq!(z.fw_rules_get()[0].sync, DpStatus::ChangeErr);

        let hw = PortHwInfo {
            mac: MacAddr::new([2, 0, 0, 0, 0, 2]),
            link: true,
            state: true,
            mtu: 1500,
            ..Default::default()
        };
        z.port_add("eth1", 3, PortKind::REAL, hw, Default::default())
            .unwrap();
        z.rules_sync();

        let works = fw_works(&rx);
        assert_eq!(works.len(), 1);
        let w = &works[0].1;
        assert_eq!(w.fw_type, FwType::Rdr);
        assert_eq!(w.fw_val1, z.ports.find("eth1").unwrap().port_no);
        assert_eq!(w.fw_val2, 7);
        assert!(w.record);
    }
}
