//! Periodic zone reconciliation task.

use crate::dp::DpCompletion;
use crate::zone::ZoneH;
use crossbeam_channel::Receiver;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Default reconciliation period.
pub const DFL_TICK: Duration = Duration::from_secs(10);

/// One pass: route pending completions, then tick every zone.
pub fn tick_once(zh: &ZoneH, completions: &Receiver<DpCompletion>) {
    let applied = zh.drain_completions(completions);
    if applied > 0 {
        trace!(applied, "Datapath completions applied");
    }
    for zone in zh.zones() {
        zone.write().unwrap_or_else(PoisonError::into_inner).tick();
    }
}

/// Handle to the running ticker task.
pub struct Ticker {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl Ticker {
    pub fn start(zh: Arc<ZoneH>, completions: Receiver<DpCompletion>, period: Duration) -> Self {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // Zone locks and queue pushes block; keep them off the runtime
                        let zh = Arc::clone(&zh);
                        let completions = completions.clone();
                        let pass = tokio::task::spawn_blocking(move || tick_once(&zh, &completions));
                        if let Err(e) = pass.await {
                            warn!(error = %e, "Tick pass failed");
                        }
                    }
                    _ = stop_rx.recv() => {
                        debug!("Ticker stop requested");
                        break;
                    }
                }
            }
        });
        info!(period_ms = period.as_millis() as u64, "Ticker started");
        Self { stop_tx, task }
    }

    /// Stop the task and wait for the pass in flight to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Ticker task failed");
        }
        info!("Ticker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dp::{DpBroker, DpStatus, StubDatapath};
    use crate::model::AttachPoint;
    use crate::policer::PolInfo;
    use crate::rules::{FwOptArg, FwRuleArg, RuleConfig};

    #[tokio::test(flavor = "current_thread")]
    async fn test_ticker_passes_with_full_queue() {
        // One slot, taken by the policer itself; every stats poll then blocks
        let (dp, rx) = crate::dp::DpHandle::channel(1);
        let zh = Arc::new(ZoneH::new(dp, RuleConfig::default()).unwrap());
        let info = PolInfo {
            cir: 10,
            pir: 10,
            ..Default::default()
        };
        zh.root()
            .unwrap()
            .write()
            .unwrap()
            .pol_add("p1", info, AttachPoint::Rule("web".into()))
            .unwrap();

        let (_done_tx, done_rx) = crossbeam_channel::unbounded();
        let ticker = Ticker::start(Arc::clone(&zh), done_rx, Duration::from_millis(10));
        // The single-threaded runtime keeps running while a pass is stuck
        tokio::time::sleep(Duration::from_millis(50)).await;

        let drained = tokio::task::spawn_blocking(move || {
            (0..3)
                .filter(|_| rx.recv_timeout(Duration::from_secs(5)).is_ok())
                .count()
        });
        assert_eq!(drained.await.unwrap(), 3);
        ticker.stop().await;
    }

    #[tokio::test]
    async fn test_ticker_resyncs_failed_rule() {
        let stub = Arc::new(StubDatapath::new());
        stub.fail_next(1);
        let (broker, dp, completions) = DpBroker::spawn(stub.clone(), 64, 8).unwrap();
        let zh = Arc::new(ZoneH::new(dp, RuleConfig::default()).unwrap());

        let arg = FwRuleArg {
            dst: "10.0.0.0/8".parse().unwrap(),
            src: "0.0.0.0/0".parse().unwrap(),
            proto: 6,
            ..Default::default()
        };
        zh.root()
            .unwrap()
            .write()
            .unwrap()
            .fw_rule_add(arg, FwOptArg::default())
            .unwrap();

        let ticker = Ticker::start(Arc::clone(&zh), completions, Duration::from_millis(20));
        let mut synced = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let root = zh.root().unwrap();
            let rules = root.read().unwrap().fw_rules_get();
            if rules[0].sync == DpStatus::Ok && stub.calls() >= 2 {
                synced = true;
                break;
            }
        }
        ticker.stop().await;
        broker.join().unwrap();
        assert!(synced);
    }
}
