mod common;

use std::time::Duration;

use common::{prepare, rig};
use sunxi_vin::csi::ParserState;
use sunxi_vin::device::NodeState;
use sunxi_vin::hw::regs;
use sunxi_vin::{PixelFormat, VinError};

#[test]
fn shared_parser_stays_enabled_until_the_last_stop() {
    let r = rig();
    let (main, sub) = (r.device(0), r.device(1));
    main.set_format(1920, 1080, PixelFormat::Nv12).unwrap();
    sub.set_format(640, 360, PixelFormat::Nv12).unwrap();
    prepare(&main, 4);
    prepare(&sub, 4);
    main.stream_on().unwrap();
    sub.stream_on().unwrap();

    let parser = r.graph.registry().parser(0).unwrap().clone();
    assert!(parser.is_enabled());
    assert_eq!(parser.state(), ParserState::Streaming);

    main.stream_off().unwrap();
    assert!(parser.is_enabled(), "sibling still streaming");
    let cap = r.sim.regs.peek(r.parser_reg(0, regs::parser::off::CAP));
    assert_ne!(cap & (1 << regs::parser::cap_video_bit(0)), 0);
    assert!(r.graph.registry().top().isp_bridge(0));
    assert!(r.sim.sensors[0].state().streaming);

    // The surviving node keeps capturing.
    r.frame(1);
    assert_eq!(sub.dequeue_buffer(Duration::from_millis(100)).unwrap().index, 0);

    sub.stream_off().unwrap();
    assert!(!parser.is_enabled());
    assert_eq!(parser.state(), ParserState::Idle);
    assert!(!r.graph.registry().top().isp_bridge(0));
    assert!(!r.sim.sensors[0].state().streaming);
}

#[test]
fn sibling_reuses_the_streaming_sensor_window() {
    let r = rig();
    let (main, sub) = (r.device(0), r.device(1));
    main.set_format(1280, 720, PixelFormat::Nv12).unwrap();
    prepare(&main, 3);
    main.stream_on().unwrap();
    let win = r.sim.sensors[0].state().window.unwrap();
    assert_eq!((win.width, win.height), (1280, 720));

    // The sub node asks for less than the running window and gets it.
    sub.set_format(640, 360, PixelFormat::Nv12).unwrap();
    prepare(&sub, 3);
    sub.stream_on().unwrap();
    assert_eq!(r.sim.sensors[0].state().window, Some(win));
    assert_eq!(r.sim.sensors[0].state().starts, vec![true]);
    sub.stream_off().unwrap();
    main.stream_off().unwrap();
}

#[test]
fn power_follows_the_last_close() {
    let r = rig();
    let (main, sub) = (r.device(0), r.device(1));
    main.open().unwrap();
    sub.open().unwrap();
    assert!(r.sim.sensors[0].state().powered);
    main.close().unwrap();
    assert!(r.sim.sensors[0].state().powered);
    assert!(r.graph.registry().top().is_powered());
    sub.close().unwrap();
    assert!(!r.sim.sensors[0].state().powered);
    assert!(!r.graph.registry().top().is_powered());
    assert!(!r.sim.clocks.is_enabled("csi_mclk0"));
    assert_eq!(sub.state(), NodeState::Closed);
}

#[test]
fn low_power_suspends_an_idle_node() {
    let r = rig();
    let dev = r.device(0);
    prepare(&dev, 3);
    dev.stream_on().unwrap();
    assert!(matches!(dev.set_low_power(true), Err(VinError::Busy(_))));
    dev.stream_off().unwrap();

    dev.set_low_power(true).unwrap();
    r.graph.work().flush().unwrap();
    assert!(r.sim.sensors[0].state().standby);
    assert!(dev.status().low_power);
    assert!(matches!(dev.stream_on(), Err(VinError::InvalidState(_))));

    dev.set_low_power(false).unwrap();
    r.graph.work().flush().unwrap();
    assert!(!r.sim.sensors[0].state().standby);
    dev.stream_on().unwrap();
    // Warm restart: exposure from the first stream is reused.
    assert_eq!(r.sim.sensors[0].state().starts, vec![true, false]);
}
