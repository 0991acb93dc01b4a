//! DMA output engine of one capture node.
//!
//! The interrupt side owns the address pipeline: a *staged* buffer whose
//! address is latched for the next frame and an *in-flight* buffer being
//! written. Completed buffers leave through a bounded `flume` channel; the
//! interrupt handler only ever calls `try_send` on it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::capture::format::FrameFormat;
use crate::capture::frame::{BufferState, DoneFrame, VideoBuffer};
use crate::capture::queue::{CaptureMode, VideoQueue};
use crate::error::{HwFault, Result, VinError};
use crate::hw::regs::dma::{self as regs_dma, off, CFG, DMA_EN, STRIDE};
use crate::hw::RegBlock;
use crate::mem::PhysAddr;
use crate::pipeline::events::{EventHub, VinEvent};
use crate::pipeline::reset::FaultSink;
use crate::pipeline::ringbuf::FaultSource;
use crate::pipeline::{ChannelStats, SharedGate, Subdev};
use crate::platform::PlatformDesc;

/// Most buffers a node can own.
pub const MAX_BUFFERS: usize = 32;

const INT_MASK: u32 = regs_dma::INT_FRAME_DONE
    | regs_dma::INT_VSYNC
    | regs_dma::INT_FIFO_OVERFLOW
    | regs_dma::INT_BUF_OVERFLOW
    | regs_dma::INT_ADDR_NO_READY;

struct DmaState {
    queue: VideoQueue,
    staged: Option<usize>,
    in_flight: Option<usize>,
    sequence: u64,
    streaming: bool,
    format: Option<FrameFormat>,
    mode: CaptureMode,
    last_vsync: Option<Instant>,
    last_done: Option<Instant>,
}

/// Y/Cb/Cr register values of a buffer in `fmt`.
pub fn plane_addrs(fmt: &FrameFormat, phys: PhysAddr, shift: u32) -> [u32; 3] {
    let (cb, cr) = fmt.chroma_offsets();
    let at = |off: u32| {
        if off == 0 {
            0
        } else {
            ((phys + off as u64) >> shift) as u32
        }
    };
    [(phys >> shift) as u32, at(cb), at(cr)]
}

pub struct DmaEngine {
    id: usize,
    name: String,
    regs: RegBlock,
    plat: &'static PlatformDesc,
    power_gate: SharedGate,
    stream_gate: SharedGate,
    state: spin::Mutex<DmaState>,
    done_tx: flume::Sender<DoneFrame>,
    done_rx: flume::Receiver<DoneFrame>,
    stats: Arc<ChannelStats>,
    events: Arc<EventHub>,
    fault_sink: OnceCell<FaultSink>,
}

impl DmaEngine {
    pub fn new(id: usize, regs: RegBlock, plat: &'static PlatformDesc, events: Arc<EventHub>) -> Self {
        let (done_tx, done_rx) = flume::bounded(MAX_BUFFERS);
        Self {
            id,
            name: format!("vinc{id}"),
            regs,
            plat,
            power_gate: SharedGate::new("power"),
            stream_gate: SharedGate::new("stream"),
            state: spin::Mutex::new(DmaState {
                queue: VideoQueue::new(),
                staged: None,
                in_flight: None,
                sequence: 0,
                streaming: false,
                format: None,
                mode: CaptureMode::Video,
                last_vsync: None,
                last_done: None,
            }),
            done_tx,
            done_rx,
            stats: Arc::new(ChannelStats::new()),
            events,
            fault_sink: OnceCell::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn regs(&self) -> &RegBlock {
        &self.regs
    }

    pub fn stats(&self) -> &Arc<ChannelStats> {
        &self.stats
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn set_fault_sink(&self, sink: FaultSink) {
        if self.fault_sink.set(sink).is_err() {
            warn!(vinc = self.id, "fault sink already installed");
        }
    }

    pub fn set_format(&self, fmt: &FrameFormat, mode: CaptureMode) -> Result<()> {
        let mut st = self.state.lock();
        if st.streaming {
            return Err(VinError::Busy(self.name.clone()));
        }
        st.format = Some(*fmt);
        st.mode = mode;
        Ok(())
    }

    pub fn format(&self) -> Option<FrameFormat> {
        self.state.lock().format
    }

    /// Replace the buffer set. The previous buffers are returned so they
    /// can be freed outside the lock.
    pub fn install(&self, bufs: Vec<VideoBuffer>) -> Result<Vec<VideoBuffer>> {
        if bufs.len() > MAX_BUFFERS {
            return Err(VinError::InvalidArgument("too many buffers"));
        }
        let old = {
            let mut st = self.state.lock();
            if st.streaming {
                return Err(VinError::Busy(self.name.clone()));
            }
            st.staged = None;
            st.in_flight = None;
            st.queue.install(bufs)
        };
        self.done_rx.drain().for_each(drop);
        Ok(old)
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn buffer(&self, index: usize) -> Option<VideoBuffer> {
        self.state.lock().queue.get(index).cloned()
    }

    pub fn buffer_state(&self, index: usize) -> Option<BufferState> {
        self.state.lock().queue.get(index).map(|b| b.state)
    }

    /// Latch `buf` into the address registers and verify the readback.
    fn write_addr(&self, fmt: &FrameFormat, buf: &VideoBuffer) -> Result<()> {
        let vals = plane_addrs(fmt, buf.phys(), self.plat.dma_addr_shift);
        let regs = [(off::BUF_Y, "y"), (off::BUF_CB, "cb"), (off::BUF_CR, "cr")];
        for (&(reg, _), &v) in regs.iter().zip(&vals) {
            self.regs.write(reg, v);
        }
        for (&(reg, plane), &v) in regs.iter().zip(&vals) {
            let read = self.regs.read(reg);
            if read != v {
                return Err(VinError::AddrMismatch {
                    plane,
                    written: v,
                    read,
                });
            }
        }
        Ok(())
    }

    /// Program buffer `index` as the next capture target.
    pub fn set_addr(&self, index: usize) -> Result<()> {
        let st = self.state.lock();
        let fmt = st.format.ok_or(VinError::InvalidState("no format negotiated"))?;
        let buf = st
            .queue
            .get(index)
            .ok_or(VinError::InvalidArgument("buffer index out of range"))?;
        self.write_addr(&fmt, buf)
    }

    /// Stage the first driver-owned buffer other than the in-flight one.
    fn stage_next(&self, st: &mut DmaState) -> Result<()> {
        let Some(fmt) = st.format else {
            return Ok(());
        };
        let Some(next) = st.queue.next_after(st.in_flight) else {
            st.staged = None;
            return Ok(());
        };
        let res = match st.queue.get(next) {
            Some(buf) => self.write_addr(&fmt, buf),
            None => Ok(()),
        };
        match res {
            Ok(()) => {
                st.queue.set_state(next, BufferState::Active);
                st.staged = Some(next);
                Ok(())
            }
            Err(e) => {
                st.staged = None;
                Err(e)
            }
        }
    }

    pub fn qbuf(&self, index: usize) -> Result<()> {
        let mut st = self.state.lock();
        st.queue.qbuf(index)?;
        if st.streaming && st.staged.is_none() {
            if let Err(e) = self.stage_next(&mut st) {
                st.queue.retire(index, BufferState::Dequeued);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Wait up to `timeout` for the next completed buffer.
    pub fn dequeue(&self, timeout: Duration) -> Result<DoneFrame> {
        let frame = self
            .done_rx
            .recv_timeout(timeout)
            .map_err(|_| VinError::Timeout("frame"))?;
        self.state.lock().queue.mark_dequeued(frame.index);
        Ok(frame)
    }

    pub fn try_dequeue(&self) -> Option<DoneFrame> {
        let frame = self.done_rx.try_recv().ok()?;
        self.state.lock().queue.mark_dequeued(frame.index);
        Some(frame)
    }

    pub fn done_len(&self) -> usize {
        self.done_rx.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    pub fn staged(&self) -> Option<usize> {
        self.state.lock().staged
    }

    #[instrument(skip(self), fields(vinc = self.id))]
    fn start(&self) -> Result<()> {
        let mut st = self.state.lock();
        let fmt = st.format.ok_or(VinError::InvalidState("no format negotiated"))?;
        let mode = match st.mode {
            CaptureMode::Video => CFG::MODE::Video,
            CaptureMode::Image => CFG::MODE::Image,
            CaptureMode::VeOnline { .. } => CFG::MODE::Online,
        };
        let lbc = if fmt.pixel_format.compression().is_some() {
            CFG::LBC::SET
        } else {
            CFG::LBC::CLEAR
        };
        self.regs
            .write_fields(off::CFG, CFG::FMT.val(fmt.pixel_format.dma_code()) + mode + lbc);
        self.regs.write(off::HSIZE, fmt.width);
        self.regs.write(off::VSIZE, fmt.height);
        self.regs.write_fields(
            off::STRIDE,
            STRIDE::Y.val(fmt.planes[0].bytesperline) + STRIDE::C.val(fmt.planes[1].bytesperline),
        );
        st.in_flight = None;
        self.stage_next(&mut st)?;
        self.regs.write(off::INT_STA, regs_dma::INT_ALL);
        self.regs.write(off::INT_EN, INT_MASK);
        self.regs
            .write_fields(off::EN, DMA_EN::EN::SET + DMA_EN::CLK_EN::SET);
        self.stats.clear();
        st.streaming = true;
        st.last_vsync = None;
        st.last_done = None;
        info!(
            w = fmt.width,
            h = fmt.height,
            queued = st.queue.active_len(),
            "dma streaming"
        );
        Ok(())
    }

    /// Stop capturing and hand every buffer back to the consumer. Runs under
    /// the interrupt lock, so it serialises against the last interrupt.
    fn stop(&self) {
        {
            let mut st = self.state.lock();
            self.regs.write(off::EN, 0);
            self.regs.write(off::INT_EN, 0);
            self.regs.write(off::INT_STA, regs_dma::INT_ALL);
            st.streaming = false;
            st.staged = None;
            st.in_flight = None;
            st.queue.recycle_all();
        }
        self.done_rx.drain().for_each(drop);
        self.events.publish(VinEvent::EndOfStream);
        info!(vinc = self.id, "dma stopped");
    }

    /// Reset stop: freeze output, keep buffers where they are.
    pub fn halt(&self) {
        let _st = self.state.lock();
        self.regs.modify(off::EN, DMA_EN::EN::CLEAR);
        self.regs.write(off::INT_EN, 0);
    }

    /// Reset restart: the interrupted frame is abandoned and addresses are
    /// re-armed from the head of the queue.
    pub fn restart(&self) -> Result<()> {
        let mut st = self.state.lock();
        if !st.streaming {
            return Ok(());
        }
        for idx in [st.in_flight.take(), st.staged.take()].into_iter().flatten() {
            st.queue.set_state(idx, BufferState::Queued);
        }
        self.stage_next(&mut st)?;
        self.regs.write(off::INT_STA, regs_dma::INT_ALL);
        self.regs.write(off::INT_EN, INT_MASK);
        self.regs.modify(off::EN, DMA_EN::EN::SET);
        Ok(())
    }

    fn frame_done(&self, st: &mut DmaState, now: Instant) {
        let Some(index) = st.in_flight.take() else {
            // Nothing was latched for this frame: the data went nowhere.
            self.stats.lost();
            return;
        };
        st.queue.retire(index, BufferState::Done);
        let bytes_used = st.format.map_or(0, |f| f.sizeimage);
        let frame = DoneFrame {
            index,
            sequence: st.sequence,
            bytes_used,
            state: BufferState::Done,
            timestamp: now,
        };
        st.sequence += 1;
        if self.done_tx.try_send(frame).is_err() {
            st.queue.set_state(index, BufferState::Error);
            self.stats.error();
            return;
        }
        self.stats.frame();
        let interval = st.last_done.map_or(0, |t| now.duration_since(t).as_micros() as u64);
        let latency = st.last_vsync.map_or(0, |t| now.duration_since(t).as_micros() as u64);
        self.stats.record_timing(interval, latency);
        st.last_done = Some(now);
    }

    fn vsync(&self, st: &mut DmaState, now: Instant) -> u64 {
        if let Some(stale) = st.in_flight.take() {
            // Previous frame never completed; its buffer goes back in line.
            st.queue.set_state(stale, BufferState::Queued);
        }
        st.in_flight = st.staged.take();
        if let Err(e) = self.stage_next(st) {
            self.stats.error();
            warn!(vinc = self.id, "staging failed: {e}");
        }
        st.last_vsync = Some(now);
        st.sequence
    }

    /// Interrupt entry point.
    pub fn irq(&self) {
        let sta = self.regs.read(off::INT_STA);
        if sta == 0 {
            return;
        }
        self.regs.write(off::INT_STA, sta);
        let now = Instant::now();
        let (sync, fault) = {
            let mut st = self.state.lock();
            if !st.streaming {
                return;
            }
            // A frame end and the next frame start can arrive in one read.
            if sta & (regs_dma::INT_FRAME_DONE | regs_dma::INT_CAPTURE_DONE) != 0 {
                self.frame_done(&mut st, now);
            }
            let sync = (sta & regs_dma::INT_VSYNC != 0).then(|| self.vsync(&mut st, now));
            if sta & regs_dma::INT_ADDR_NO_READY != 0 {
                self.stats.error();
            }
            let fault = if sta & (regs_dma::INT_FIFO_OVERFLOW | regs_dma::INT_BUF_OVERFLOW) != 0 {
                self.stats.fifo_overflow();
                Some(HwFault::FifoOverflow)
            } else {
                None
            };
            (sync, fault)
        };
        if let Some(sequence) = sync {
            self.events.publish(VinEvent::FrameSync { sequence });
        }
        if let Some(fault) = fault {
            warn!(vinc = self.id, frame = self.stats.frame_cnt(), %fault, "dma fault");
            if let Some(sink) = self.fault_sink.get() {
                sink(FaultSource::Dma(self.id), fault);
            }
        }
    }
}

impl Subdev for DmaEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn power_gate(&self) -> &SharedGate {
        &self.power_gate
    }

    fn stream_gate(&self) -> &SharedGate {
        &self.stream_gate
    }

    fn hw_enable(&self) -> Result<()> {
        self.start()
    }

    fn hw_disable(&self) {
        self.stop();
        debug!(vinc = self.id, "dma disabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::format::{MbusCode, PixelFormat};
    use crate::hw::mock::MockRegisters;
    use crate::mem::{self, DmaAllocator, SimAllocator};

    const BASE: u32 = 0x4_0000;

    struct Rig {
        mock: Arc<MockRegisters>,
        dma: DmaEngine,
    }

    fn rig(pf: PixelFormat, count: usize) -> Rig {
        let plat = PlatformDesc::lookup("sun8iw21").unwrap();
        let mock = Arc::new(MockRegisters::new());
        mock.mark_w1c(BASE + off::INT_STA);
        let dma = DmaEngine::new(0, RegBlock::new(mock.clone(), BASE, "vinc0"), plat, Arc::new(EventHub::new()));
        let fmt = FrameFormat::new(640, 480, pf, MbusCode::Sbggr10_1x10, plat);
        dma.set_format(&fmt, CaptureMode::Video).unwrap();
        let alloc: Arc<dyn DmaAllocator> = SimAllocator::new(0x4000_0000, 64 << 20);
        let bufs = (0..count)
            .map(|i| VideoBuffer::new(i, mem::alloc(&alloc, fmt.sizeimage as usize, "buf").unwrap()))
            .collect();
        dma.install(bufs).unwrap();
        Rig { mock, dma }
    }

    impl Rig {
        fn fire(&self, bits: u32) {
            self.mock.raise(BASE + off::INT_STA, bits);
            self.dma.irq();
        }
    }

    #[test]
    fn plane_offsets_follow_the_layout() {
        let plat = PlatformDesc::lookup("sun8iw19").unwrap();
        let nv12 = FrameFormat::new(640, 480, PixelFormat::Nv12, MbusCode::Sbggr10_1x10, plat);
        assert_eq!(plane_addrs(&nv12, 0x1000_0000, 0), [0x1000_0000, 0x1000_0000 + 640 * 480, 0]);
        let yv12 = FrameFormat::new(640, 480, PixelFormat::Yvu420, MbusCode::Sbggr10_1x10, plat);
        let [_, cb, cr] = plane_addrs(&yv12, 0, 0);
        assert!(cb > cr && cr == 640 * 480);
        let yuyv = FrameFormat::new(640, 480, PixelFormat::Yuyv, MbusCode::Sbggr10_1x10, plat);
        assert_eq!(plane_addrs(&yuyv, 0x100, 2), [0x40, 0, 0]);
    }

    #[test]
    fn readback_mismatch_is_reported() {
        let r = rig(PixelFormat::Nv12, 2);
        r.dma.set_addr(0).unwrap();
        r.mock.stick(BASE + off::BUF_CB);
        assert!(matches!(
            r.dma.set_addr(1),
            Err(VinError::AddrMismatch { plane: "cb", .. })
        ));
    }

    #[test]
    fn frames_complete_in_queue_order() {
        let r = rig(PixelFormat::Nv12, 4);
        for i in 0..4 {
            r.dma.qbuf(i).unwrap();
        }
        r.dma.hw_enable().unwrap();
        assert_eq!(r.dma.staged(), Some(0));
        for expect in 0..3u64 {
            r.fire(regs_dma::INT_VSYNC);
            r.fire(regs_dma::INT_FRAME_DONE);
            let f = r.dma.try_dequeue().unwrap();
            assert_eq!(f.index as u64, expect);
            assert_eq!(f.sequence, expect);
        }
        assert_eq!(r.dma.stats().frame_cnt(), 3);
    }

    #[test]
    fn done_without_staged_buffer_is_lost() {
        let r = rig(PixelFormat::Nv12, 2);
        r.dma.hw_enable().unwrap();
        r.fire(regs_dma::INT_VSYNC);
        r.fire(regs_dma::INT_FRAME_DONE);
        assert_eq!(r.dma.stats().snapshot().lost_cnt, 1);
        assert!(r.dma.try_dequeue().is_none());
        // Queuing while streaming stages immediately.
        r.dma.qbuf(1).unwrap();
        assert_eq!(r.dma.staged(), Some(1));
        assert_eq!(r.dma.buffer_state(1), Some(BufferState::Active));
    }

    #[test]
    fn done_and_vsync_in_one_read() {
        let r = rig(PixelFormat::Nv12, 3);
        for i in 0..3 {
            r.dma.qbuf(i).unwrap();
        }
        r.dma.hw_enable().unwrap();
        r.fire(regs_dma::INT_VSYNC);
        r.fire(regs_dma::INT_FRAME_DONE | regs_dma::INT_VSYNC);
        r.fire(regs_dma::INT_FRAME_DONE);
        let got: Vec<usize> = std::iter::from_fn(|| r.dma.try_dequeue()).map(|f| f.index).collect();
        assert_eq!(got, vec![0, 1]);
    }

    #[test]
    fn stream_off_returns_everything() {
        let r = rig(PixelFormat::Nv12, 3);
        for i in 0..3 {
            r.dma.qbuf(i).unwrap();
        }
        r.dma.hw_enable().unwrap();
        r.fire(regs_dma::INT_VSYNC);
        r.fire(regs_dma::INT_FRAME_DONE);
        r.dma.hw_disable();
        assert_eq!(r.dma.done_len(), 0);
        for i in 0..3 {
            assert_eq!(r.dma.buffer_state(i), Some(BufferState::Dequeued));
        }
        assert!(!r.dma.regs().is_set(off::EN, DMA_EN::EN));
        // Late interrupts after stop are ignored.
        r.fire(regs_dma::INT_FRAME_DONE);
        assert_eq!(r.dma.stats().frame_cnt(), 1);
    }
}
