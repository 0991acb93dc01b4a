mod common;

use std::time::Duration;

use common::{prepare, rig};
use sunxi_vin::capture::format::ALL_FORMATS;
use sunxi_vin::capture::frame::BufferState;
use sunxi_vin::hw::regs;
use sunxi_vin::pipeline::{EventKind, VinEvent};
use sunxi_vin::vipp::dma::plane_addrs;
use sunxi_vin::{CaptureMode, PixelFormat, VinError};

#[test]
fn negotiated_formats_are_clamped_aligned_and_stable() {
    let r = rig();
    let dev = r.device(0);
    let plat = r.graph.platform();
    let sizes = [0, 1, 31, 33, 100, 641, 1001, 1920, 3841, 5000, 100_000];
    for &pf in ALL_FORMATS {
        for &w in &sizes {
            for &h in &sizes {
                let f = dev.set_format(w, h, pf).unwrap();
                assert_eq!(f.width % plat.width_align, 0, "{pf:?} {w}x{h}");
                assert_eq!(f.height % 2, 0);
                assert!((plat.min_width..=plat.max_width).contains(&f.width));
                assert!((plat.min_height..=plat.max_height).contains(&f.height));
                assert_eq!(dev.get_format(), f);
                assert_eq!(dev.set_format(f.width, f.height, pf).unwrap(), f);
            }
        }
    }
}

#[test]
fn buffer_count_respects_the_frame_memory_ceiling() {
    let r = rig();
    let dev = r.device(0);
    dev.open().unwrap();

    dev.set_format(1920, 1080, PixelFormat::Nv12).unwrap();
    assert_eq!(dev.request_buffers(0).unwrap(), 8);
    assert_eq!(dev.request_buffers(1).unwrap(), 3);

    // 3840x2160 NV12 is ~12.4 MB: only 12 fit under 150 MiB.
    dev.set_format(3840, 2160, PixelFormat::Nv12).unwrap();
    assert_eq!(dev.request_buffers(32).unwrap(), 12);

    dev.set_format(1920, 1080, PixelFormat::Nv12).unwrap();
    dev.set_capture_mode(CaptureMode::Image).unwrap();
    assert_eq!(dev.request_buffers(6).unwrap(), 1);
    dev.set_capture_mode(CaptureMode::VeOnline { two_buffers: true }).unwrap();
    assert_eq!(dev.request_buffers(6).unwrap(), 2);
    dev.close().unwrap();
    assert_eq!(r.sim.alloc.live_allocations(), 0);
}

#[test]
fn address_latch_failure_is_reported() {
    let r = rig();
    let dev = r.device(0);
    prepare(&dev, 4);
    dev.stream_on().unwrap();
    let dma = r.graph.pipeline(0).unwrap().dma().clone();
    dma.set_addr(0).unwrap();
    let y = r.dma_reg(0, regs::dma::off::BUF_Y);
    r.sim.regs.stick(y);
    assert!(matches!(
        dma.set_addr(1),
        Err(VinError::AddrMismatch { plane: "y", .. })
    ));
    r.sim.regs.unstick(y);
    dma.set_addr(1).unwrap();
    let fmt = dev.get_format();
    let phys = dev.query_buffer(1).unwrap().phys;
    assert_eq!(
        r.sim.regs.peek(y),
        plane_addrs(&fmt, phys, r.graph.platform().dma_addr_shift)[0]
    );
}

#[test]
fn five_frames_complete_in_fifo_order() {
    let r = rig();
    let dev = r.device(0);
    dev.set_format(1920, 1080, PixelFormat::Nv12).unwrap();
    assert_eq!(prepare(&dev, 0), 8);
    let sync = dev.subscribe_event(EventKind::FrameSync);
    dev.stream_on().unwrap();
    assert!(r.sim.sensors[0].state().streaming);

    for _ in 0..5 {
        r.frame(0);
    }
    for expect in 0..5u64 {
        let f = dev.dequeue_buffer(Duration::from_millis(100)).unwrap();
        assert_eq!(f.index as u64, expect);
        assert_eq!(f.sequence, expect);
        assert_eq!(f.state, BufferState::Done);
        assert_eq!(f.bytes_used, dev.get_format().sizeimage);
        assert_eq!(dev.query_buffer(f.index).unwrap().state, BufferState::Dequeued);
    }
    assert!(matches!(
        dev.dequeue_buffer(Duration::from_millis(1)),
        Err(VinError::Timeout(_))
    ));
    let seqs: Vec<u64> = sync
        .drain()
        .map(|ev| match ev {
            VinEvent::FrameSync { sequence } => sequence,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

    let st = dev.status();
    assert_eq!(st.stats.frame_cnt, 5);
    assert_eq!(st.sequence, 5);
    dev.stream_off().unwrap();
    assert!(!r.sim.sensors[0].state().streaming);
    for i in 0..8 {
        assert_eq!(dev.query_buffer(i).unwrap().state, BufferState::Dequeued);
    }
    dev.close().unwrap();
}

#[test]
fn requeued_buffers_keep_cycling() {
    let r = rig();
    let dev = r.device(0);
    prepare(&dev, 3);
    dev.stream_on().unwrap();
    let mut seen = Vec::new();
    for _ in 0..9 {
        r.frame(0);
        let f = dev.dequeue_buffer(Duration::from_millis(100)).unwrap();
        seen.push(f.index);
        dev.queue_buffer(f.index).unwrap();
    }
    assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    assert_eq!(dev.status().stats.lost_cnt, 0);
}

#[test]
fn export_shares_buffer_memory() {
    let r = rig();
    let dev = r.device(0);
    prepare(&dev, 3);
    let h = dev.export_buffer(2).unwrap();
    let imported = r.graph.allocator().import(h).unwrap();
    assert_eq!(imported.phys(), dev.query_buffer(2).unwrap().phys);
    assert!(dev.export_buffer(3).is_err());
}

#[test]
fn repeated_request_at_the_ceiling_succeeds() {
    let r = rig();
    let dev = r.device(0);
    dev.open().unwrap();
    dev.set_format(3840, 2160, PixelFormat::Nv12).unwrap();
    let base = r.sim.alloc.live_allocations();
    assert_eq!(dev.request_buffers(32).unwrap(), 12);
    assert_eq!(dev.request_buffers(12).unwrap(), 12);
    assert_eq!(r.sim.alloc.live_allocations(), base + 12);
    dev.close().unwrap();
    assert_eq!(r.sim.alloc.live_allocations(), 0);
}

#[test]
fn exports_are_withdrawn_on_close() {
    let r = rig();
    let dev = r.device(0);
    prepare(&dev, 3);
    let h = dev.export_buffer(0).unwrap();
    dev.close().unwrap();
    assert!(r.graph.allocator().import(h).is_none());
    assert_eq!(r.sim.alloc.exported_count(), 0);
    assert_eq!(r.sim.alloc.live_allocations(), 0);

    // An importer keeps its own reference alive.
    prepare(&dev, 3);
    let live = r.sim.alloc.live_allocations();
    let h = dev.export_buffer(1).unwrap();
    let held = r.graph.allocator().import(h).unwrap();
    dev.request_buffers(3).unwrap();
    assert!(r.graph.allocator().import(h).is_none());
    assert_eq!(r.sim.alloc.live_allocations(), live + 1);
    drop(held);
    assert_eq!(r.sim.alloc.live_allocations(), live);
}

#[test]
fn format_enumeration_ends() {
    let r = rig();
    let dev = r.device(0);
    let descs: Vec<_> = (0..).map_while(|i| dev.enumerate_formats(i)).collect();
    assert_eq!(descs.len(), ALL_FORMATS.len());
    assert!(descs.iter().all(|d| !d.description.is_empty()));
    assert!(matches!(
        dev.try_format(640, 480, PixelFormat::Nv12).map(|f| f.width),
        Ok(640)
    ));
}
