mod common;

use std::time::Duration;

use common::{prepare, rig};
use sunxi_vin::hw::regs;
use sunxi_vin::pipeline::{EventKind, FaultSource, VinEvent};
use sunxi_vin::vipp::dma::plane_addrs;
use sunxi_vin::{HwFault, PixelFormat};

#[test]
fn parameter_banks_alternate_while_streaming() {
    let r = rig();
    let dev = r.device(0);
    prepare(&dev, 4);
    dev.stream_on().unwrap();
    let isp = r.graph.registry().isp(0).unwrap().clone();
    let regions = isp.regions().unwrap();
    let load_addr = r.isp_reg(0, regs::isp::off::LOAD_ADDR);
    let shift = r.graph.platform().dma_addr_shift;

    let flips = regions.load.flips();
    let mut active = regions.load.active();
    for _ in 0..8 {
        r.fire_isp(0, regs::isp::INT_PARA_LOAD);
        let next = regions.load.active();
        assert_eq!(next, 1 - active);
        assert_eq!(r.sim.regs.peek(load_addr), (regions.load.bank_phys(next) >> shift) as u32);
        active = next;
    }
    assert_eq!(regions.load.flips(), flips + 8);
}

#[test]
fn failed_restart_is_announced() {
    let r = rig();
    let dev = r.device(0);
    prepare(&dev, 4);
    let resets = dev.subscribe_event(EventKind::Reset);
    dev.stream_on().unwrap();

    // The address latch refuses every write, so the DMA cannot re-arm.
    let y = r.dma_reg(0, regs::dma::off::BUF_Y);
    r.sim.regs.poke(y, 0xdead_0000);
    r.sim.regs.stick(y);
    r.fire_isp(0, regs::isp::INT_FRAME_LOST);

    let coord = r.graph.reset_coordinator();
    assert_eq!(coord.resets(), 0);
    assert_eq!(coord.failures(), 1);
    assert!(!coord.in_progress());
    assert_eq!(
        resets.try_recv().unwrap(),
        VinEvent::ResetFailed {
            isp: 0,
            fault: HwFault::FrameLost
        }
    );
    assert!(resets.try_recv().is_err());
    assert_eq!(dev.fault_history().len(), 1);
}

#[test]
fn frame_lost_resets_the_pipeline_once() {
    let r = rig();
    let dev = r.device(0);
    dev.set_format(1920, 1080, PixelFormat::Nv12).unwrap();
    prepare(&dev, 4);
    let resets = dev.subscribe_event(EventKind::Reset);
    dev.stream_on().unwrap();
    let writes_before = r.sim.sensors[0].state().exposure_writes;

    r.frame(0);
    r.fire_dma(0, regs::dma::INT_VSYNC);
    for _ in 0..3 {
        r.fire_isp(0, regs::isp::INT_FINISH);
    }
    let isp = r.graph.registry().isp(0).unwrap().clone();
    assert_eq!(isp.frame_cnt(), 3);

    r.fire_isp(0, regs::isp::INT_FRAME_LOST);
    let coord = r.graph.reset_coordinator();
    assert_eq!(coord.resets(), 1);
    assert_eq!(coord.failures(), 0);
    assert!(!coord.in_progress());
    assert_eq!(isp.frame_cnt(), 0);
    assert_eq!(
        resets.try_recv().unwrap(),
        VinEvent::Reset {
            isp: 0,
            fault: HwFault::FrameLost
        }
    );
    assert!(resets.try_recv().is_err());

    // Buffer 0 is done; 1 was in flight and is first in line again.
    let dma = r.graph.pipeline(0).unwrap().dma().clone();
    assert_eq!(dma.staged(), Some(1));
    let phys = dev.query_buffer(1).unwrap().phys;
    let fmt = dev.get_format();
    assert_eq!(
        r.sim.regs.peek(r.dma_reg(0, regs::dma::off::BUF_Y)),
        plane_addrs(&fmt, phys, r.graph.platform().dma_addr_shift)[0]
    );
    assert!(r.graph.registry().parser(0).unwrap().is_enabled());
    assert!(r.graph.registry().top().isp_bridge(0));
    assert_eq!(dev.status().stats.frame_cnt, 0);

    let history = dev.fault_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source, FaultSource::Isp(0));
    assert_eq!(history[0].fault, HwFault::FrameLost);
    assert_eq!(history[0].frame_cnt, 3);

    r.graph.work().flush().unwrap();
    assert_eq!(r.sim.sensors[0].state().exposure_writes, writes_before + 1);

    // Capture carries on with the sequence it had.
    let first = dev.dequeue_buffer(Duration::from_millis(100)).unwrap();
    assert_eq!((first.index, first.sequence), (0, 0));
    r.frame(0);
    let next = dev.dequeue_buffer(Duration::from_millis(100)).unwrap();
    assert_eq!(next.index, 1);
    assert_eq!(next.sequence, 1);
}

#[test]
fn warnings_are_recorded_without_a_reset() {
    let r = rig();
    let dev = r.device(0);
    prepare(&dev, 3);
    dev.stream_on().unwrap();
    r.fire_isp(0, regs::isp::INT_HB_SHORT);
    assert_eq!(r.graph.reset_coordinator().resets(), 0);
    let history = dev.fault_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].fault, HwFault::HblankShort);
}

#[test]
fn dma_overflow_resets_every_node_on_the_isp() {
    let r = rig();
    let (main, sub) = (r.device(0), r.device(1));
    sub.set_format(640, 360, PixelFormat::Nv12).unwrap();
    prepare(&main, 3);
    prepare(&sub, 3);
    let main_ev = main.subscribe_event(EventKind::Reset);
    let sub_ev = sub.subscribe_event(EventKind::Reset);
    main.stream_on().unwrap();
    sub.stream_on().unwrap();

    r.fire_dma(1, regs::dma::INT_FIFO_OVERFLOW);
    assert_eq!(r.graph.reset_coordinator().resets(), 1);
    assert!(main_ev.try_recv().is_ok());
    assert!(sub_ev.try_recv().is_ok());
    assert_eq!(main.fault_history()[0].source, FaultSource::Dma(1));
}

#[test]
fn faults_after_stream_off_do_not_reset() {
    let r = rig();
    let dev = r.device(0);
    prepare(&dev, 3);
    dev.stream_on().unwrap();
    dev.stream_off().unwrap();
    r.fire_isp(0, regs::isp::INT_FRAME_LOST);
    assert_eq!(r.graph.reset_coordinator().resets(), 0);
}
