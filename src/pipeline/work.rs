//! Deferred work executed outside interrupt and graph locks.
//!
//! Interrupt handlers and the reset path queue jobs here (sensor standby
//! toggling, re-sending sensor parameters after a reset) instead of running
//! them inline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::error::{Result, VinError};

pub type Job = Box<dyn FnOnce() -> Result<()> + Send>;

pub enum WorkItem {
    Job { name: &'static str, run: Job },
    Flush(flume::Sender<()>),
}

/// Single worker thread fed through a `flume` channel.
pub struct WorkQueue {
    tx: Option<flume::Sender<WorkItem>>,
    worker: Option<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl WorkQueue {
    pub fn new(name: &str) -> Result<Self> {
        let (tx, rx) = flume::unbounded::<WorkItem>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for item in rx.iter() {
                    match item {
                        WorkItem::Job { name, run } => {
                            debug!(job = name, "running deferred work");
                            if let Err(e) = run() {
                                warn!(job = name, "deferred work failed: {e}");
                            }
                            worker_pending.fetch_sub(1, Ordering::AcqRel);
                        }
                        WorkItem::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|_| VinError::Busy("work queue thread".into()))?;
        info!("Work queue {name} started");
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            pending,
        })
    }

    pub fn submit(
        &self,
        name: &'static str,
        run: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(VinError::InvalidState("work queue shut down"))?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        tx.send(WorkItem::Job {
            name,
            run: Box::new(run),
        })
        .map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            VinError::InvalidState("work queue shut down")
        })
    }

    /// Jobs queued but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Block until every job queued before this call has run.
    pub fn flush(&self) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(VinError::InvalidState("work queue shut down"))?;
        let (done_tx, done_rx) = flume::bounded(1);
        tx.send(WorkItem::Flush(done_tx))
            .map_err(|_| VinError::InvalidState("work queue shut down"))?;
        done_rx
            .recv()
            .map_err(|_| VinError::InvalidState("work queue worker exited"))
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn flush_waits_for_earlier_jobs() {
        let q = WorkQueue::new("vin-work-test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let log = log.clone();
            q.submit("push", move || {
                std::thread::sleep(std::time::Duration::from_millis(2));
                log.lock().unwrap().push(i);
                Ok(())
            })
            .unwrap();
        }
        q.flush().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn failing_job_does_not_stop_the_worker() {
        let q = WorkQueue::new("vin-work-test").unwrap();
        q.submit("fail", || Err(VinError::Timeout("sensor"))).unwrap();
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        q.submit("ok", move || {
            h.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
        q.flush().unwrap();
        assert_eq!(hit.load(Ordering::Relaxed), 1);
    }
}
