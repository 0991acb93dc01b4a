//! Pipeline orchestration: the media graph, leases on shared blocks, the
//! reset coordinator and the deferred-work worker.

pub mod events;
pub mod graph;
pub mod lease;
pub mod reset;
pub mod ringbuf;
pub mod stats;
pub mod work;

pub use events::{EventHub, EventKind, VinEvent};
pub use graph::{
    MediaGraph, Pipeline, Platform, Registry, SensorNode, SensorSlot, SimPlatform, StreamRequest,
};
pub use lease::{Lease, LeaseKind, SharedGate};
pub use reset::{FaultSink, ResetCoordinator, ResetScope};
pub use ringbuf::{FaultHistory, FaultRecord, FaultSource};
pub use stats::{ChannelStats, StatsSnapshot};
pub use work::{WorkItem, WorkQueue};

use crate::error::Result;

/// A pipeline consumer of a shared block: a video node and the block channel
/// it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Consumer {
    pub vinc: usize,
    pub channel: usize,
}

/// A block that can sit in a pipeline.
///
/// The power and stream gates count holders; the hooks run on the first and
/// last lease. `attach`/`detach` run once per consumer, between lease
/// acquisition and release.
pub trait Subdev: Send + Sync {
    fn name(&self) -> &str;
    fn power_gate(&self) -> &SharedGate;
    fn stream_gate(&self) -> &SharedGate;

    fn power_on(&self) -> Result<()> {
        Ok(())
    }

    fn power_off(&self) {}

    fn hw_enable(&self) -> Result<()>;
    fn hw_disable(&self);

    fn attach(&self, _consumer: Consumer) -> Result<()> {
        Ok(())
    }

    fn detach(&self, _consumer: Consumer) {}
}
