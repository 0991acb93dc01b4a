//! Event subscriptions of a capture node.

use serde::{Deserialize, Serialize};

use crate::error::HwFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Start of every captured frame.
    FrameSync,
    /// The pipeline went through a fault recovery, or failed to.
    Reset,
    /// Streaming stopped.
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VinEvent {
    FrameSync { sequence: u64 },
    Reset { isp: usize, fault: HwFault },
    /// Recovery could not restart the pipeline; it stays halted.
    ResetFailed { isp: usize, fault: HwFault },
    EndOfStream,
}

impl VinEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            VinEvent::FrameSync { .. } => EventKind::FrameSync,
            VinEvent::Reset { .. } | VinEvent::ResetFailed { .. } => EventKind::Reset,
            VinEvent::EndOfStream => EventKind::EndOfStream,
        }
    }
}

/// Fan-out of events to subscribers over bounded `flume` channels.
///
/// Publishing never blocks: a full subscriber misses the event, a
/// disconnected one is dropped.
#[derive(Default)]
pub struct EventHub {
    subs: spin::Mutex<Vec<(EventKind, flume::Sender<VinEvent>)>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, depth: usize) -> flume::Receiver<VinEvent> {
        let (tx, rx) = flume::bounded(depth.max(1));
        self.subs.lock().push((kind, tx));
        rx
    }

    pub fn publish(&self, ev: VinEvent) {
        let kind = ev.kind();
        self.subs.lock().retain(|(k, tx)| {
            if *k != kind {
                return !tx.is_disconnected();
            }
            !matches!(tx.try_send(ev), Err(flume::TrySendError::Disconnected(_)))
        });
    }

    pub fn subscribers(&self) -> usize {
        self.subs.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_by_kind_and_drops_closed() {
        let hub = EventHub::new();
        let sync = hub.subscribe(EventKind::FrameSync, 2);
        let eos = hub.subscribe(EventKind::EndOfStream, 2);
        for sequence in 0..3 {
            hub.publish(VinEvent::FrameSync { sequence });
        }
        // Depth 2: the third event is missed, not queued.
        assert_eq!(sync.try_iter().count(), 2);
        assert!(eos.try_recv().is_err());
        drop(eos);
        hub.publish(VinEvent::EndOfStream);
        assert_eq!(hub.subscribers(), 1);
    }
}
