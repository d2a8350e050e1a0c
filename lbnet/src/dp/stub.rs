//! Logging datapath used when no forwarding engine is linked in.
//!
//! Every request succeeds (unless a failure was injected with
//! [`StubDatapath::fail_next`]) and is logged at debug level. Conntrack
//! entries are kept in memory so replication can be exercised end to end.

use super::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
pub struct StubDatapath {
    ct: Mutex<HashMap<String, CtInfo>>,
    fail: AtomicUsize,
    calls: AtomicUsize,
}

impl StubDatapath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` object requests fail.
    pub fn fail_next(&self, n: usize) {
        self.fail.store(n, Ordering::SeqCst);
    }

    /// Number of object requests seen so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of conntrack entries held.
    pub fn ct_len(&self) -> usize {
        self.ct.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn request(&self, what: &str, add: bool, detail: &dyn std::fmt::Debug) -> i32 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        debug!(what, add, failed, detail = ?detail, "Datapath request");
        if failed { -1 } else { 0 }
    }
}

impl Datapath for StubDatapath {
    fn port_add(&self, w: &PortDpWork) -> i32 {
        self.request("port", true, w)
    }

    fn port_del(&self, w: &PortDpWork) -> i32 {
        self.request("port", false, w)
    }

    fn l2_addr_add(&self, w: &L2AddrDpWork) -> i32 {
        self.request("l2addr", true, w)
    }

    fn l2_addr_del(&self, w: &L2AddrDpWork) -> i32 {
        self.request("l2addr", false, w)
    }

    fn router_mac_add(&self, w: &RouterMacDpWork) -> i32 {
        self.request("rmac", true, w)
    }

    fn router_mac_del(&self, w: &RouterMacDpWork) -> i32 {
        self.request("rmac", false, w)
    }

    fn next_hop_add(&self, w: &NextHopDpWork) -> i32 {
        self.request("nexthop", true, w)
    }

    fn next_hop_del(&self, w: &NextHopDpWork) -> i32 {
        self.request("nexthop", false, w)
    }

    fn route_add(&self, w: &RouteDpWork) -> i32 {
        self.request("route", true, w)
    }

    fn route_del(&self, w: &RouteDpWork) -> i32 {
        self.request("route", false, w)
    }

    fn nat_lb_add(&self, w: &NatDpWork) -> i32 {
        self.request("nat", true, w)
    }

    fn nat_lb_del(&self, w: &NatDpWork) -> i32 {
        self.request("nat", false, w)
    }

    fn fw_add(&self, w: &FwDpWork) -> i32 {
        self.request("fw", true, w)
    }

    fn fw_del(&self, w: &FwDpWork) -> i32 {
        self.request("fw", false, w)
    }

    fn pol_add(&self, w: &PolDpWork) -> i32 {
        self.request("pol", true, w)
    }

    fn pol_del(&self, w: &PolDpWork) -> i32 {
        self.request("pol", false, w)
    }

    fn mirr_add(&self, w: &MirrDpWork) -> i32 {
        self.request("mirr", true, w)
    }

    fn mirr_del(&self, w: &MirrDpWork) -> i32 {
        self.request("mirr", false, w)
    }

    fn ul_cl_add(&self, w: &UlClDpWork) -> i32 {
        self.request("ulcl", true, w)
    }

    fn ul_cl_del(&self, w: &UlClDpWork) -> i32 {
        self.request("ulcl", false, w)
    }

    fn stat_get(&self, w: &StatDpWork) -> Option<DpStats> {
        debug!(map = ?w.map, mark = w.mark, "Datapath stats read");
        Some(DpStats::default())
    }

    fn stat_clear(&self, w: &StatDpWork) -> i32 {
        debug!(map = ?w.map, mark = w.mark, "Datapath stats clear");
        0
    }

    fn table_get(&self, w: &TableDpWork) -> Result<Vec<CtInfo>> {
        match w.map {
            DpMap::Ct4 | DpMap::Ct6 => {
                let ct = self.ct.lock().unwrap_or_else(PoisonError::into_inner);
                Ok(ct.values().cloned().collect())
            }
            other => Err(DatapathError::Unsupported(format!("{other:?} dump"))),
        }
    }

    fn ct_add(&self, ct: &CtInfo) -> i32 {
        debug!(ct = %ct, "Conntrack add");
        self.ct
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ct.key(), ct.clone());
        0
    }

    fn ct_del(&self, ct: &CtInfo) -> i32 {
        debug!(ct = %ct, "Conntrack delete");
        match self
            .ct
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ct.key())
        {
            Some(_) => 0,
            None => -1,
        }
    }

    fn ct_get_async(&self) {
        debug!("Conntrack resync requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_ct_map() {
        let dp = StubDatapath::new();
        let ct = CtInfo {
            proto: "udp".into(),
            sport: 5353,
            ..Default::default()
        };
        assert_eq!(dp.ct_add(&ct), 0);
        assert_eq!(dp.ct_add(&ct), 0);
        assert_eq!(dp.ct_len(), 1);
        assert_eq!(dp.ct_del(&ct), 0);
        assert_eq!(dp.ct_del(&ct), -1);

        let w = TableDpWork {
            map: DpMap::Nat4,
            reply: None,
        };
        assert!(dp.table_get(&w).is_err());
    }

    #[test]
    fn test_stub_fail_injection() {
        let dp = StubDatapath::new();
        let w = PortDpWork::default();
        dp.fail_next(2);
        assert_eq!(dp.port_add(&w), -1);
        assert_eq!(dp.port_del(&w), -1);
        assert_eq!(dp.port_add(&w), 0);
        assert_eq!(dp.calls(), 3);
    }
}
