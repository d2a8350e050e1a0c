//! Shared helpers for lbnet integration tests.
#![allow(dead_code)]

use crossbeam_channel::Receiver;
use lbnet::api::PortMod;
use lbnet::dp::{DpBroker, DpCompletion, DpHandle, DpWork, StubDatapath};
use lbnet::port::PortHwInfo;
use lbnet::rules::RuleConfig;
use lbnet::{MacAddr, NetApiImpl, PortKind, ZoneH};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Allocate an available port for testing.
pub fn allocate_port() -> u16 {
    portpicker::pick_unused_port().expect("No available port")
}

pub fn mac(last: u8) -> MacAddr {
    MacAddr::new([0x02, 0, 0, 0, 0, last])
}

pub fn hw(last: u8) -> PortHwInfo {
    PortHwInfo {
        mac: mac(last),
        link: true,
        state: true,
        mtu: 1500,
        ..Default::default()
    }
}

/// A real port with the given OS index.
pub fn real_port(dev: &str, link_index: i32) -> PortMod {
    PortMod {
        dev: dev.to_string(),
        link_index,
        kind: PortKind::REAL,
        hw: hw(link_index as u8),
        ..Default::default()
    }
}

/// Control plane whose datapath work is captured instead of executed.
pub struct Captured {
    pub zh: Arc<ZoneH>,
    pub api: NetApiImpl,
    pub rx: Receiver<DpWork>,
}

impl Captured {
    pub fn new() -> Self {
        let (dp, rx) = DpHandle::channel(16384);
        let zh = Arc::new(ZoneH::new(dp, RuleConfig::default()).expect("Failed to create zones"));
        let api = NetApiImpl::new(Arc::clone(&zh));
        Self { zh, api, rx }
    }

    /// Everything pushed since the last drain.
    pub fn drain(&self) -> Vec<DpWork> {
        self.rx.try_iter().collect()
    }
}

/// Control plane running a broker over the in-memory datapath.
pub struct Live {
    pub zh: Arc<ZoneH>,
    pub api: NetApiImpl,
    pub dp: Arc<StubDatapath>,
    pub done: Receiver<DpCompletion>,
    broker: DpBroker,
}

impl Live {
    pub fn new() -> Self {
        let dp = Arc::new(StubDatapath::new());
        let (broker, handle, done) =
            DpBroker::spawn(dp.clone(), 1024, 16).expect("Failed to start broker");
        let zh =
            Arc::new(ZoneH::new(handle, RuleConfig::default()).expect("Failed to create zones"));
        let api = NetApiImpl::new(Arc::clone(&zh));
        Self {
            zh,
            api,
            dp,
            done,
            broker,
        }
    }

    /// Apply completions until the broker has been idle for a few rounds.
    pub fn settle(&self) {
        let mut idle = 0;
        for _ in 0..200 {
            thread::sleep(Duration::from_millis(10));
            if self.zh.drain_completions(&self.done) == 0 {
                idle += 1;
                if idle >= 3 {
                    return;
                }
            } else {
                idle = 0;
            }
        }
    }

    pub fn shutdown(self) {
        self.broker.join().expect("Broker did not stop");
    }
}
