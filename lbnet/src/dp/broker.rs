//! Datapath broker thread.
//!
//! A single named OS thread consumes the bounded work queue, dispatches each
//! item to the [`Datapath`] and emits a [`DpCompletion`] for every item that
//! names a sync target. After each wake-up it drains up to `batch` items
//! before blocking again.

use super::{
    Datapath, DatapathError, DpCompletion, DpHandle, DpStats, DpStatus, DpWork, DpWorkKind,
    DpWorkOp, Result,
};
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Handle to the running broker thread.
pub struct DpBroker {
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
}

impl DpBroker {
    /// Start the broker over `dp` with a queue of `queue_len` items.
    ///
    /// Returns the broker handle, the producer handle for the tables and the
    /// completion stream.
    pub fn spawn(
        dp: Arc<dyn Datapath>,
        queue_len: usize,
        batch: usize,
    ) -> Result<(DpBroker, DpHandle, Receiver<DpCompletion>)> {
        let (work_tx, work_rx) = bounded::<DpWork>(queue_len);
        let (done_tx, done_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let batch = batch.max(1);

        let thread = thread::Builder::new()
            .name("dp-broker".to_string())
            .spawn(move || run_broker(dp, work_rx, done_tx, shutdown_rx, batch))
            .map_err(|e| DatapathError::Spawn(e.to_string()))?;

        info!(queue_len, batch, "Datapath broker started");

        Ok((
            DpBroker {
                thread: Some(thread),
                shutdown: shutdown_tx,
            },
            DpHandle::new(work_tx),
            done_rx,
        ))
    }

    /// Signal the broker to stop.
    pub fn stop(&self) {
        let _ = self.shutdown.try_send(());
    }

    /// Stop the broker and wait for the thread to exit.
    pub fn join(mut self) -> std::result::Result<(), String> {
        self.stop();
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| "Datapath broker panicked".to_string()),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for DpBroker {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run_broker(
    dp: Arc<dyn Datapath>,
    work_rx: Receiver<DpWork>,
    done_tx: Sender<DpCompletion>,
    shutdown_rx: Receiver<()>,
    batch: usize,
) {
    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(work_rx) -> msg => {
                let Ok(work) = msg else {
                    debug!("Datapath work queue disconnected");
                    break;
                };
                handle_work(dp.as_ref(), work, &done_tx);
                for _ in 1..batch {
                    match work_rx.try_recv() {
                        Ok(work) => handle_work(dp.as_ref(), work, &done_tx),
                        Err(_) => break,
                    }
                }
            }
        }
    }
    info!("Datapath broker stopped");
}

fn handle_work(dp: &dyn Datapath, work: DpWork, done_tx: &Sender<DpCompletion>) {
    let (status, stats) = dispatch(dp, &work);
    trace!(kind = work.kind.name(), op = ?work.op, ?status, "Datapath work done");

    if !status.is_ok() {
        warn!(
            kind = work.kind.name(),
            op = ?work.op,
            target = ?work.target,
            ?status,
            "Datapath request failed"
        );
    }

    if let Some(target) = work.target {
        let _ = done_tx.send(DpCompletion {
            zone: work.zone,
            target,
            status,
            stats,
        });
    }
}

/// Run one work item against the datapath.
pub fn dispatch(dp: &dyn Datapath, work: &DpWork) -> (DpStatus, Option<DpStats>) {
    let op = work.op;
    let add = match op {
        DpWorkOp::Create => true,
        DpWorkOp::Remove => false,
        _ => return dispatch_special(dp, work),
    };

    let ret = match &work.kind {
        DpWorkKind::Port(w) if add => dp.port_add(w),
        DpWorkKind::Port(w) => dp.port_del(w),
        DpWorkKind::L2Addr(w) if add => dp.l2_addr_add(w),
        DpWorkKind::L2Addr(w) => dp.l2_addr_del(w),
        DpWorkKind::RouterMac(w) if add => dp.router_mac_add(w),
        DpWorkKind::RouterMac(w) => dp.router_mac_del(w),
        DpWorkKind::NextHop(w) if add => dp.next_hop_add(w),
        DpWorkKind::NextHop(w) => dp.next_hop_del(w),
        DpWorkKind::Route(w) if add => dp.route_add(w),
        DpWorkKind::Route(w) => dp.route_del(w),
        DpWorkKind::NatLb(w) if add => dp.nat_lb_add(w),
        DpWorkKind::NatLb(w) => dp.nat_lb_del(w),
        DpWorkKind::Fw(w) if add => dp.fw_add(w),
        DpWorkKind::Fw(w) => dp.fw_del(w),
        DpWorkKind::Pol(w) if add => dp.pol_add(w),
        DpWorkKind::Pol(w) => dp.pol_del(w),
        DpWorkKind::Mirr(w) if add => dp.mirr_add(w),
        DpWorkKind::Mirr(w) => dp.mirr_del(w),
        DpWorkKind::UlCl(w) if add => dp.ul_cl_add(w),
        DpWorkKind::UlCl(w) => dp.ul_cl_del(w),
        DpWorkKind::Stat(_) | DpWorkKind::Table(_) => return (DpStatus::UnknownErr, None),
    };

    if ret == 0 {
        (DpStatus::Ok, None)
    } else {
        (DpStatus::failed(op), None)
    }
}

/// Statistics and table verbs; only valid on stat/table items.
fn dispatch_special(dp: &dyn Datapath, work: &DpWork) -> (DpStatus, Option<DpStats>) {
    match (&work.kind, work.op) {
        (DpWorkKind::Stat(w), DpWorkOp::StatsGet) => match dp.stat_get(w) {
            Some(stats) => (DpStatus::Ok, Some(stats)),
            None => (DpStatus::UnknownErr, None),
        },
        (DpWorkKind::Stat(w), DpWorkOp::StatsClear) => {
            if dp.stat_clear(w) == 0 {
                (DpStatus::Ok, Some(DpStats::default()))
            } else {
                (DpStatus::UnknownErr, None)
            }
        }
        (DpWorkKind::Table(w), DpWorkOp::TableGet) => match dp.table_get(w) {
            Ok(entries) => {
                if let Some(reply) = &w.reply {
                    let _ = reply.send(entries);
                }
                (DpStatus::Ok, None)
            }
            Err(e) => {
                warn!(error = %e, map = ?w.map, "Table read failed");
                (DpStatus::UnknownErr, None)
            }
        },
        _ => (DpStatus::UnknownErr, None),
    }
}
