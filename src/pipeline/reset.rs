//! Pipeline-wide recovery from ISP and DMA faults.
//!
//! A fault on an ISP, or a FIFO overflow on a DMA channel feeding from it,
//! stops every block that shares the ISP and restarts them in reverse order.
//! Recording, logging and counting happen for every fault; only faults that
//! leave the pipeline in an unknown state trigger the stop/restart.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, instrument, warn};

use super::events::VinEvent;
use super::ringbuf::{FaultHistory, FaultRecord, FaultSource};
use super::work::WorkQueue;
use crate::csi::{CsiTop, Parser};
use crate::error::{HwFault, Result, VinError};
use crate::isp::Isp;
use crate::sensor::Sensor;
use crate::vipp::{DmaEngine, Vipp};

/// Callback a block raises faults through. Called from interrupt context
/// with no block lock held.
pub type FaultSink = Arc<dyn Fn(FaultSource, HwFault) + Send + Sync>;

/// Every block that must be cycled when one ISP is reset.
#[derive(Clone)]
pub struct ResetScope {
    pub isp: Arc<Isp>,
    pub top: Arc<CsiTop>,
    pub parsers: Vec<Arc<Parser>>,
    pub vipps: Vec<Arc<Vipp>>,
    pub dmas: Vec<Arc<DmaEngine>>,
    pub sensors: Vec<Arc<dyn Sensor>>,
}

pub struct ResetCoordinator {
    in_progress: AtomicBool,
    lock: spin::Mutex<()>,
    history: Arc<FaultHistory>,
    work: Arc<WorkQueue>,
    resets: AtomicU64,
    failures: AtomicU64,
}

impl ResetCoordinator {
    pub fn new(history: Arc<FaultHistory>, work: Arc<WorkQueue>) -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            lock: spin::Mutex::new(()),
            history,
            work,
            resets: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn history(&self) -> &Arc<FaultHistory> {
        &self.history
    }

    /// Completed resets.
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Record `fault` and, when it needs one, reset `scope`.
    ///
    /// Returns true when a reset ran. A fault raised while a reset is
    /// already running is recorded but does not start a second one.
    pub fn report(&self, source: FaultSource, fault: HwFault, frame_cnt: u64, scope: Option<&ResetScope>) -> bool {
        self.history.record(FaultRecord {
            source,
            fault,
            frame_cnt,
            at: Instant::now(),
        });
        if !fault.needs_reset() {
            return false;
        }
        let Some(scope) = scope else {
            warn!(%source, %fault, "fault outside any streaming pipeline");
            return false;
        };
        if self.in_progress.swap(true, Ordering::AcqRel) {
            warn!(%source, %fault, "reset already in progress");
            return false;
        }
        let res = {
            let _g = self.lock.lock();
            self.reset(scope, fault)
        };
        self.in_progress.store(false, Ordering::Release);
        match res {
            Ok(()) => true,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(%source, "recovery failed: {e}");
                let isp = scope.isp.id();
                for d in &scope.dmas {
                    d.events().publish(VinEvent::ResetFailed { isp, fault });
                }
                false
            }
        }
    }

    #[instrument(skip(self, scope), fields(isp = scope.isp.id()))]
    fn reset(&self, scope: &ResetScope, fault: HwFault) -> Result<()> {
        let isp_id = scope.isp.id();
        warn!(%fault, "resetting pipeline");

        for p in &scope.parsers {
            p.mark_error();
            p.halt();
        }
        scope.top.set_isp_bridge(isp_id, false);
        scope.isp.halt();
        for v in &scope.vipps {
            v.halt();
        }
        for d in &scope.dmas {
            d.halt();
        }

        let fail = |e: VinError| VinError::ResetFailed {
            isp: isp_id,
            reason: e.to_string(),
        };
        for d in &scope.dmas {
            d.restart().map_err(fail)?;
        }
        for v in &scope.vipps {
            v.resume();
        }
        scope.isp.restart().map_err(fail)?;
        scope.top.set_isp_bridge(isp_id, true);
        for p in &scope.parsers {
            p.resume().map_err(fail)?;
        }

        for d in &scope.dmas {
            d.stats().reset();
            d.events().publish(VinEvent::Reset { isp: isp_id, fault });
        }
        self.resets.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vin.resets").increment(1);

        for sensor in &scope.sensors {
            let sensor = sensor.clone();
            self.work.submit("resend sensor params", move || {
                let eg = sensor.exposure();
                sensor.set_exposure(eg)
            })?;
        }
        info!("pipeline restarted");
        Ok(())
    }
}
