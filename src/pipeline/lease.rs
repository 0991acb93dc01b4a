//! Reference-counted leases on shared blocks.
//!
//! A block shared by several pipelines keeps one [`SharedGate`] per concern
//! (power, streaming). The first lease runs the enable hook, the last release
//! runs the disable hook; everything in between only moves the count.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::Subdev;
use crate::error::{Result, VinError};

/// Holder count guarding one hardware concern of a block.
#[derive(Debug)]
pub struct SharedGate {
    what: &'static str,
    holders: Mutex<usize>,
}

impl SharedGate {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            holders: Mutex::new(0),
        }
    }

    pub fn holders(&self) -> usize {
        *self.holders.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_held(&self) -> bool {
        self.holders() > 0
    }

    /// Take one hold. `enable` runs only for the first holder; if it fails the
    /// count is left untouched.
    pub fn acquire(&self, enable: impl FnOnce() -> Result<()>) -> Result<bool> {
        let mut n = self.holders.lock().unwrap_or_else(|e| e.into_inner());
        let first = *n == 0;
        if first {
            enable()?;
        }
        *n += 1;
        Ok(first)
    }

    /// Drop one hold. `disable` runs only when the last holder leaves.
    pub fn release(&self, disable: impl FnOnce()) -> Result<bool> {
        let mut n = self.holders.lock().unwrap_or_else(|e| e.into_inner());
        if *n == 0 {
            return Err(VinError::InvalidState("release without matching acquire"));
        }
        *n -= 1;
        let last = *n == 0;
        if last {
            disable();
        }
        Ok(last)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    Power,
    Stream,
}

/// One holder's claim on a node. Released explicitly or on drop.
pub struct Lease {
    node: Arc<dyn Subdev>,
    kind: LeaseKind,
    held: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("node", &self.node.name())
            .field("kind", &self.kind)
            .field("held", &self.held)
            .finish()
    }
}

impl Lease {
    pub fn acquire(node: Arc<dyn Subdev>, kind: LeaseKind) -> Result<Self> {
        let first = match kind {
            LeaseKind::Power => node.power_gate().acquire(|| node.power_on())?,
            LeaseKind::Stream => node.stream_gate().acquire(|| node.hw_enable())?,
        };
        if first {
            debug!(node = node.name(), ?kind, "first lease, hardware enabled");
        }
        Ok(Self {
            node,
            kind,
            held: true,
        })
    }

    pub fn node(&self) -> &Arc<dyn Subdev> {
        &self.node
    }

    pub fn kind(&self) -> LeaseKind {
        self.kind
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        let node = &self.node;
        let res = match self.kind {
            LeaseKind::Power => node.power_gate().release(|| node.power_off()),
            LeaseKind::Stream => node.stream_gate().release(|| node.hw_disable()),
        };
        match res {
            Ok(true) => debug!(node = node.name(), kind = ?self.kind, "last lease, hardware disabled"),
            Ok(false) => {}
            Err(e) => warn!(node = node.name(), "lease release: {e}"),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn gate_runs_hooks_on_edges_only() {
        let gate = SharedGate::new("test");
        let enables = AtomicUsize::new(0);
        let disables = AtomicUsize::new(0);
        let on = || {
            enables.fetch_add(1, Ordering::Relaxed);
            Ok(())
        };
        assert!(gate.acquire(on).unwrap());
        assert!(!gate.acquire(on).unwrap());
        assert_eq!(enables.load(Ordering::Relaxed), 1);

        let off = || {
            disables.fetch_add(1, Ordering::Relaxed);
        };
        assert!(!gate.release(off).unwrap());
        assert_eq!(disables.load(Ordering::Relaxed), 0);
        assert!(gate.release(off).unwrap());
        assert_eq!(disables.load(Ordering::Relaxed), 1);
        assert!(gate.release(off).is_err());
    }

    #[test]
    fn failed_enable_takes_no_hold() {
        let gate = SharedGate::new("test");
        let r = gate.acquire(|| Err(VinError::Timeout("enable")));
        assert!(r.is_err());
        assert_eq!(gate.holders(), 0);
    }
}
