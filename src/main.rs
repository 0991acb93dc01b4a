//! Capture demo on the simulated platform.
//!
//! Brings video node 0 up, drives the DMA interrupt lines from a frame clock
//! and cycles buffers until the frame count is reached or Ctrl-C.

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use sunxi_vin::hw::regs;
use sunxi_vin::pipeline::{EventKind, MediaGraph, SimPlatform, VinEvent};
use sunxi_vin::{utils, VinDevice};

const DEMO_FRAMES: u64 = 120;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sunxi_vin=info,vin_demo=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("vin demo launching");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = utils::load_config(path.as_deref())?;
    utils::validate_config(&config)?;

    let sim = SimPlatform::new(&config)?;
    let graph = MediaGraph::new(sim.platform(), config.clone())?;
    let dev = VinDevice::new(&graph, 0)?;
    let cap = &config.capture;

    dev.open()?;
    let fmt = dev.set_format(cap.width, cap.height, cap.format)?;
    dev.set_capture_mode(cap.capture_mode)?;
    let count = dev.request_buffers(cap.buffer_count)?;
    info!(
        width = fmt.width,
        height = fmt.height,
        format = ?fmt.pixel_format,
        sizeimage = fmt.sizeimage,
        buffers = count,
        "video node configured"
    );
    for i in 0..count as usize {
        dev.queue_buffer(i)?;
    }
    let sync = dev.subscribe_event(EventKind::FrameSync);
    let resets = dev.subscribe_event(EventKind::Reset);
    dev.stream_on()?;

    let dma_sta = graph
        .platform()
        .regs
        .dma
        .base_of(dev.id())
        .ok_or_else(|| eyre!("dma{} not mapped", dev.id()))?
        + regs::dma::off::INT_STA;
    let fps = config.sensors[graph.pipeline(dev.id())?.route().sensor].fps.max(1);
    let mut clock = tokio::time::interval(Duration::from_secs(1) / fps);

    let mut frames = 0u64;
    while frames < DEMO_FRAMES {
        tokio::select! {
            _ = clock.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
        sim.regs.raise(dma_sta, regs::dma::INT_VSYNC);
        graph.irq_all();
        sim.regs.raise(dma_sta, regs::dma::INT_FRAME_DONE);
        graph.irq_all();

        for ev in resets.drain() {
            match ev {
                VinEvent::Reset { isp, fault } => warn!(isp, %fault, "pipeline was reset"),
                VinEvent::ResetFailed { isp, fault } => {
                    return Err(eyre!("isp{isp} did not recover from {fault}"));
                }
                _ => {}
            }
        }
        let synced = sync.drain().count();
        match dev.dequeue_buffer(Duration::from_millis(0)) {
            Ok(done) => {
                frames += 1;
                if done.sequence % fps as u64 == 0 {
                    info!(index = done.index, sequence = done.sequence, bytes = done.bytes_used, synced, "frame");
                }
                dev.queue_buffer(done.index)?;
            }
            Err(e) => warn!("no frame this tick: {e}"),
        }
    }

    let status = dev.status();
    info!(
        frames = status.stats.frame_cnt,
        lost = status.stats.lost_cnt,
        resets = status.resets,
        "capture finished"
    );
    dev.stream_off()?;
    dev.close()?;
    Ok(())
}
