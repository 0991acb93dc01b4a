//! Media graph: block registry, routes, and the power/stream walks over them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, instrument, warn};

use super::events::EventHub;
use super::reset::{FaultSink, ResetCoordinator, ResetScope};
use super::ringbuf::{FaultHistory, FaultSource};
use super::work::WorkQueue;
use super::{Consumer, Lease, LeaseKind, SharedGate, Subdev};
use crate::capture::format::FrameFormat;
use crate::capture::queue::CaptureMode;
use crate::csi::{CsiTop, Mipi, Parser, StartMode, TdmRx};
use crate::error::{HwFault, Result, VinError};
use crate::hw::mock::MockRegisters;
use crate::hw::{regs, Delay, NoDelay, RegBlock, RegisterIo};
use crate::isp::{Isp, IspMode};
use crate::mem::{DmaAllocator, SimAllocator};
use crate::platform::{BlockMap, PlatformDesc};
use crate::power::{ClockSource, PowerHandle, Regulators, SimClocks, SimRegulators};
use crate::sensor::{
    self, Actuator, Flash, Sensor, SensorWindow, SimActuator, SimFlash, SimSensor, WdrMode,
};
use crate::vipp::{DmaEngine, Rect, Vipp};
use crate::{Config, VideoConfig};

/// A sensor with the optional lens and flash wired to it.
#[derive(Clone)]
pub struct SensorSlot {
    pub sensor: Arc<dyn Sensor>,
    pub actuator: Option<Arc<dyn Actuator>>,
    pub flash: Option<Arc<dyn Flash>>,
}

/// Collaborators the graph is built on.
pub struct Platform {
    pub desc: &'static PlatformDesc,
    pub io: Arc<dyn RegisterIo>,
    pub alloc: Arc<dyn DmaAllocator>,
    pub clocks: Arc<dyn ClockSource>,
    pub regulators: Arc<dyn Regulators>,
    pub delay: Arc<dyn Delay>,
    pub sensors: Vec<SensorSlot>,
}

/// Simulated platform with concrete handles kept for inspection and
/// interrupt injection.
pub struct SimPlatform {
    pub desc: &'static PlatformDesc,
    pub regs: Arc<MockRegisters>,
    pub alloc: Arc<SimAllocator>,
    pub clocks: Arc<SimClocks>,
    pub regulators: Arc<SimRegulators>,
    pub sensors: Vec<Arc<SimSensor>>,
    pub actuators: Vec<Option<Arc<SimActuator>>>,
    pub flashes: Vec<Option<Arc<SimFlash>>>,
}

const SIM_DRAM_BASE: u64 = 0x4000_0000;

impl SimPlatform {
    pub fn new(cfg: &Config) -> Result<Self> {
        let desc = PlatformDesc::lookup(&cfg.platform)?;
        let mock = Arc::new(MockRegisters::new());
        for id in 0..desc.regs.isp.count {
            if let Some(base) = desc.regs.isp.base_of(id) {
                mock.mark_w1c(base + regs::isp::off::INT_STA);
            }
        }
        for id in 0..desc.regs.dma.count {
            if let Some(base) = desc.regs.dma.base_of(id) {
                mock.mark_w1c(base + regs::dma::off::INT_STA);
            }
        }
        let capacity = desc.max_frame_mem as usize + (64 << 20);
        Ok(Self {
            desc,
            regs: mock,
            alloc: SimAllocator::new(SIM_DRAM_BASE, capacity),
            clocks: SimClocks::new(),
            regulators: SimRegulators::new(),
            sensors: cfg.sensors.iter().map(|s| Arc::new(SimSensor::new(s))).collect(),
            actuators: cfg
                .sensors
                .iter()
                .map(|s| s.actuator.then(|| Arc::new(SimActuator::new(1023))))
                .collect(),
            flashes: cfg
                .sensors
                .iter()
                .map(|s| s.flash.then(|| Arc::new(SimFlash::new())))
                .collect(),
        })
    }

    pub fn platform(&self) -> Platform {
        let sensors = self
            .sensors
            .iter()
            .enumerate()
            .map(|(i, s)| SensorSlot {
                sensor: s.clone(),
                actuator: self
                    .actuators
                    .get(i)
                    .cloned()
                    .flatten()
                    .map(|a| a as Arc<dyn Actuator>),
                flash: self
                    .flashes
                    .get(i)
                    .cloned()
                    .flatten()
                    .map(|f| f as Arc<dyn Flash>),
            })
            .collect();
        Platform {
            desc: self.desc,
            io: self.regs.clone(),
            alloc: self.alloc.clone(),
            clocks: self.clocks.clone(),
            regulators: self.regulators.clone(),
            delay: Arc::new(NoDelay),
            sensors,
        }
    }
}

/// Sensor as a graph node: its power sequence and stream switch.
pub struct SensorNode {
    id: usize,
    name: String,
    slot: SensorSlot,
    power: PowerHandle,
    power_gate: SharedGate,
    stream_gate: SharedGate,
    cold_start: AtomicBool,
}

impl SensorNode {
    fn new(id: usize, slot: SensorSlot, plat: &Platform) -> Self {
        let name = slot.sensor.name().to_string();
        let power = PowerHandle::new(
            name.clone(),
            plat.clocks.clone(),
            plat.regulators.clone(),
            vec![(format!("csi_mclk{id}"), plat.desc.mclk_hz)],
            slot.sensor.rails(),
        );
        Self {
            id,
            name,
            slot,
            power,
            power_gate: SharedGate::new("power"),
            stream_gate: SharedGate::new("stream"),
            cold_start: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn sensor(&self) -> &Arc<dyn Sensor> {
        &self.slot.sensor
    }

    pub fn actuator(&self) -> Option<&Arc<dyn Actuator>> {
        self.slot.actuator.as_ref()
    }

    pub fn flash(&self) -> Option<&Arc<dyn Flash>> {
        self.slot.flash.as_ref()
    }

    /// Whether any pipeline holds the sensor streaming.
    pub fn is_streaming(&self) -> bool {
        self.stream_gate.is_held()
    }
}

impl Subdev for SensorNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn power_gate(&self) -> &SharedGate {
        &self.power_gate
    }

    fn stream_gate(&self) -> &SharedGate {
        &self.stream_gate
    }

    fn power_on(&self) -> Result<()> {
        self.power.on()?;
        if let Err(e) = self.slot.sensor.power(true) {
            self.power.off();
            return Err(e);
        }
        Ok(())
    }

    fn power_off(&self) {
        if let Err(e) = self.slot.sensor.power(false) {
            warn!(sensor = %self.name, "power off: {e}");
        }
        self.power.off();
    }

    fn hw_enable(&self) -> Result<()> {
        self.slot
            .sensor
            .set_stream(true, self.cold_start.load(Ordering::Acquire))
    }

    fn hw_disable(&self) {
        if let Err(e) = self.slot.sensor.set_stream(false, false) {
            warn!(sensor = %self.name, "stream off: {e}");
        }
    }
}

pub struct Registry {
    top: Arc<CsiTop>,
    sensors: Vec<Arc<SensorNode>>,
    mipi: Vec<Arc<Mipi>>,
    parsers: Vec<Arc<Parser>>,
    tdm: Vec<Arc<TdmRx>>,
    isps: Vec<Arc<Isp>>,
    vipps: Vec<Arc<Vipp>>,
    dmas: Vec<Arc<DmaEngine>>,
}

fn build<T>(
    map: BlockMap,
    io: &Arc<dyn RegisterIo>,
    prefix: &str,
    mut make: impl FnMut(usize, RegBlock) -> T,
) -> Vec<Arc<T>> {
    (0..map.count)
        .filter_map(|id| {
            let base = map.base_of(id)?;
            let regs = RegBlock::new(io.clone(), base, format!("{prefix}{id}"));
            Some(Arc::new(make(id, regs)))
        })
        .collect()
}

fn pick<'a, T>(v: &'a [Arc<T>], kind: &'static str, id: usize) -> Result<&'a Arc<T>> {
    v.get(id).ok_or(VinError::NoDevice { kind, id })
}

impl Registry {
    fn new(plat: &Platform, cfg: &Config) -> Self {
        let desc = plat.desc;
        let io = &plat.io;
        let top_power = PowerHandle::new(
            "csic_top",
            plat.clocks.clone(),
            plat.regulators.clone(),
            vec![
                ("csi_top".to_string(), desc.csi_top_clk_hz),
                ("isp".to_string(), desc.isp_clk_hz),
            ],
            Vec::new(),
        );
        let top = Arc::new(CsiTop::new(
            RegBlock::new(io.clone(), desc.regs.top, "csic_top"),
            top_power,
        ));
        let sensors = plat
            .sensors
            .iter()
            .enumerate()
            .map(|(id, slot)| Arc::new(SensorNode::new(id, slot.clone(), plat)))
            .collect();
        let isps = build(desc.regs.isp, io, "isp", |id, r| {
            let isp = Isp::new(id, r, desc, plat.alloc.clone());
            isp.set_defer_free(cfg.pipeline.defer_pingpong_free);
            isp
        });
        Self {
            top,
            sensors,
            mipi: build(desc.regs.mipi, io, "mipi", |id, r| Mipi::new(id, r)),
            parsers: build(desc.regs.parser, io, "csi", |id, r| {
                Parser::new(id, r, desc, plat.delay.clone())
            }),
            tdm: build(desc.regs.tdm, io, "tdm", |id, r| {
                TdmRx::new(id, r, desc, plat.alloc.clone())
            }),
            isps,
            vipps: build(desc.regs.vipp, io, "vipp", |id, r| {
                Vipp::new(id, r, desc, plat.alloc.clone())
            }),
            dmas: build(desc.regs.dma, io, "vinc", |id, r| {
                DmaEngine::new(id, r, desc, Arc::new(EventHub::new()))
            }),
        }
    }

    pub fn top(&self) -> &Arc<CsiTop> {
        &self.top
    }

    pub fn sensor(&self, id: usize) -> Result<&Arc<SensorNode>> {
        pick(&self.sensors, "sensor", id)
    }

    pub fn mipi(&self, id: usize) -> Result<&Arc<Mipi>> {
        pick(&self.mipi, "mipi", id)
    }

    pub fn parser(&self, id: usize) -> Result<&Arc<Parser>> {
        pick(&self.parsers, "csi", id)
    }

    pub fn tdm(&self, id: usize) -> Result<&Arc<TdmRx>> {
        pick(&self.tdm, "tdm", id)
    }

    pub fn isp(&self, id: usize) -> Result<&Arc<Isp>> {
        pick(&self.isps, "isp", id)
    }

    pub fn vipp(&self, id: usize) -> Result<&Arc<Vipp>> {
        pick(&self.vipps, "vipp", id)
    }

    pub fn dma(&self, id: usize) -> Result<&Arc<DmaEngine>> {
        pick(&self.dmas, "dma", id)
    }

    pub fn isps(&self) -> &[Arc<Isp>] {
        &self.isps
    }

    pub fn dmas(&self) -> &[Arc<DmaEngine>] {
        &self.dmas
    }
}

/// What a hop does besides taking its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bridge {
    None,
    Isp(usize),
    Tdm(usize),
}

struct Hop {
    node: Arc<dyn Subdev>,
    consumer: Consumer,
    bridge: Bridge,
}

/// One configured route from a sensor to a capture node.
pub struct Pipeline {
    route: VideoConfig,
    sensor: Arc<SensorNode>,
    mipi: Option<Arc<Mipi>>,
    csi: Arc<Parser>,
    tdm: Option<Arc<TdmRx>>,
    isp: Arc<Isp>,
    vipp: Arc<Vipp>,
    dma: Arc<DmaEngine>,
}

impl Pipeline {
    fn resolve(route: &VideoConfig, reg: &Registry) -> Result<Self> {
        Ok(Self {
            route: route.clone(),
            sensor: reg.sensor(route.sensor)?.clone(),
            mipi: route.mipi.map(|id| reg.mipi(id).cloned()).transpose()?,
            csi: reg.parser(route.csi)?.clone(),
            tdm: route.tdm.map(|id| reg.tdm(id).cloned()).transpose()?,
            isp: reg.isp(route.isp)?.clone(),
            vipp: reg.vipp(route.vipp)?.clone(),
            dma: reg.dma(route.id)?.clone(),
        })
    }

    pub fn vinc(&self) -> usize {
        self.route.id
    }

    pub fn route(&self) -> &VideoConfig {
        &self.route
    }

    pub fn sensor(&self) -> &Arc<SensorNode> {
        &self.sensor
    }

    pub fn mipi(&self) -> Option<&Arc<Mipi>> {
        self.mipi.as_ref()
    }

    pub fn csi(&self) -> &Arc<Parser> {
        &self.csi
    }

    pub fn tdm(&self) -> Option<&Arc<TdmRx>> {
        self.tdm.as_ref()
    }

    pub fn isp(&self) -> &Arc<Isp> {
        &self.isp
    }

    pub fn vipp(&self) -> &Arc<Vipp> {
        &self.vipp
    }

    pub fn dma(&self) -> &Arc<DmaEngine> {
        &self.dma
    }

    fn consumer(&self, channel: usize) -> Consumer {
        Consumer {
            vinc: self.route.id,
            channel,
        }
    }

    /// Capture end first, sensor last.
    fn stream_hops(&self) -> Vec<Hop> {
        let hop = |node: Arc<dyn Subdev>, channel: usize, bridge: Bridge| Hop {
            node,
            consumer: self.consumer(channel),
            bridge,
        };
        let mut hops = vec![
            hop(self.dma.clone() as Arc<dyn Subdev>, 0, Bridge::None),
            hop(self.vipp.clone() as Arc<dyn Subdev>, 0, Bridge::None),
            hop(
                self.isp.clone() as Arc<dyn Subdev>,
                self.route.isp_channel,
                Bridge::Isp(self.isp.id()),
            ),
        ];
        if let Some(tdm) = &self.tdm {
            hops.push(hop(tdm.clone() as Arc<dyn Subdev>, 0, Bridge::Tdm(self.csi.id())));
        }
        hops.push(hop(
            self.csi.clone() as Arc<dyn Subdev>,
            self.route.csi_channel,
            Bridge::None,
        ));
        if let Some(mipi) = &self.mipi {
            hops.push(hop(mipi.clone() as Arc<dyn Subdev>, 0, Bridge::None));
        }
        hops.push(hop(self.sensor.clone() as Arc<dyn Subdev>, 0, Bridge::None));
        hops
    }

    /// Sensor first, capture end last.
    fn power_nodes(&self) -> Vec<Arc<dyn Subdev>> {
        let mut nodes: Vec<Arc<dyn Subdev>> = vec![self.sensor.clone()];
        if let Some(mipi) = &self.mipi {
            nodes.push(mipi.clone());
        }
        nodes.push(self.csi.clone());
        if let Some(tdm) = &self.tdm {
            nodes.push(tdm.clone());
        }
        nodes.push(self.isp.clone());
        nodes.push(self.vipp.clone());
        nodes.push(self.dma.clone());
        nodes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub format: FrameFormat,
    /// Scaler input crop; the whole input when `None`.
    pub crop: Option<Rect>,
    pub mode: CaptureMode,
    pub wdr: WdrMode,
}

struct Held {
    lease: Lease,
    consumer: Option<Consumer>,
    bridge: Bridge,
}

struct GraphState {
    open: HashMap<usize, Vec<Lease>>,
    /// Stream leases of each streaming video node, in acquisition order.
    streams: HashMap<usize, Vec<Held>>,
    stream_idx: HashMap<usize, u64>,
    low_power: HashMap<usize, bool>,
}

struct GraphInner {
    cfg: Config,
    plat: &'static PlatformDesc,
    alloc: Arc<dyn DmaAllocator>,
    registry: Registry,
    pipelines: HashMap<usize, Arc<Pipeline>>,
    state: Mutex<GraphState>,
    /// Blocks cycled when an ISP resets, keyed by ISP id.
    scopes: spin::Mutex<HashMap<usize, ResetScope>>,
    reset: ResetCoordinator,
    work: Arc<WorkQueue>,
}

/// Owner of every block and of the routes through them.
#[derive(Clone)]
pub struct MediaGraph {
    inner: Arc<GraphInner>,
}

impl MediaGraph {
    pub fn new(plat: Platform, cfg: Config) -> Result<Self> {
        if plat.sensors.len() < cfg.sensors.len() {
            return Err(VinError::NoDevice {
                kind: "sensor",
                id: plat.sensors.len(),
            });
        }
        let registry = Registry::new(&plat, &cfg);
        let pipelines = cfg
            .video
            .iter()
            .map(|v| Ok((v.id, Arc::new(Pipeline::resolve(v, &registry)?))))
            .collect::<Result<HashMap<_, _>>>()?;
        let work = Arc::new(WorkQueue::new("vin-work")?);
        let history = Arc::new(FaultHistory::new(cfg.pipeline.fault_history));
        let inner = Arc::new(GraphInner {
            plat: plat.desc,
            alloc: plat.alloc.clone(),
            registry,
            pipelines,
            state: Mutex::new(GraphState {
                open: HashMap::new(),
                streams: HashMap::new(),
                stream_idx: HashMap::new(),
                low_power: HashMap::new(),
            }),
            scopes: spin::Mutex::new(HashMap::new()),
            reset: ResetCoordinator::new(history, work.clone()),
            work,
            cfg,
        });

        let weak = Arc::downgrade(&inner);
        let sink: FaultSink = Arc::new(move |source, fault| {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.on_fault(source, fault);
            }
        });
        for isp in &inner.registry.isps {
            isp.set_fault_sink(sink.clone());
        }
        for dma in &inner.registry.dmas {
            dma.set_fault_sink(sink.clone());
        }
        info!(
            platform = inner.plat.name,
            pipelines = inner.pipelines.len(),
            "media graph built"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub fn platform(&self) -> &'static PlatformDesc {
        self.inner.plat
    }

    pub fn allocator(&self) -> &Arc<dyn DmaAllocator> {
        &self.inner.alloc
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn pipeline(&self, vinc: usize) -> Result<&Arc<Pipeline>> {
        self.inner
            .pipelines
            .get(&vinc)
            .ok_or(VinError::NoDevice { kind: "video", id: vinc })
    }

    pub fn reset_coordinator(&self) -> &ResetCoordinator {
        &self.inner.reset
    }

    pub fn history(&self) -> &Arc<FaultHistory> {
        self.inner.reset.history()
    }

    pub fn work(&self) -> &Arc<WorkQueue> {
        &self.inner.work
    }

    fn lock(&self) -> MutexGuard<'_, GraphState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_open(&self, vinc: usize) -> bool {
        self.lock().open.contains_key(&vinc)
    }

    pub fn is_streaming(&self, vinc: usize) -> bool {
        self.lock().streams.contains_key(&vinc)
    }

    pub fn stream_idx(&self, vinc: usize) -> u64 {
        self.lock().stream_idx.get(&vinc).copied().unwrap_or(0)
    }

    /// Take a power lease on every block of the route, CSIC top first.
    /// A failure releases whatever was taken.
    #[instrument(skip(self))]
    pub fn open(&self, vinc: usize) -> Result<()> {
        let pipe = self.pipeline(vinc)?.clone();
        let mut st = self.lock();
        if st.open.contains_key(&vinc) {
            return Err(VinError::Busy(format!("vinc{vinc}")));
        }
        let mut leases = Vec::new();
        let top: Arc<dyn Subdev> = self.inner.registry.top.clone();
        for node in std::iter::once(top).chain(pipe.power_nodes()) {
            match Lease::acquire(node.clone(), LeaseKind::Power) {
                Ok(l) => leases.push(l),
                Err(e) => {
                    warn!(node = node.name(), "power-up failed: {e}");
                    release_all(leases);
                    return Err(e);
                }
            }
        }
        st.open.insert(vinc, leases);
        info!("video node open");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn close(&self, vinc: usize) -> Result<()> {
        let mut st = self.lock();
        if st.streams.contains_key(&vinc) {
            self.stop_locked(&mut st, vinc)?;
        }
        let leases = st
            .open
            .remove(&vinc)
            .ok_or(VinError::InvalidState("video node not open"))?;
        st.low_power.remove(&vinc);
        release_all(leases);
        info!("video node closed");
        Ok(())
    }

    /// Program every block of the route for `req`, sensor to capture end.
    fn configure(&self, pipe: &Pipeline, req: &StreamRequest) -> Result<SensorWindow> {
        let plat = self.inner.plat;
        let cam = pipe.sensor.sensor();
        // A sensor already streaming for a sibling keeps its window.
        let win = if pipe.sensor.stream_gate().is_held() {
            cam.window()
        } else {
            let w = sensor::choose_window(&cam.windows(), req.format.width, req.format.height, req.wdr)
                .ok_or(VinError::InvalidState("sensor reports no windows"))?;
            cam.set_window(&w)?;
            w
        };

        let mut bus = cam.bus();
        bus.channels = self
            .inner
            .pipelines
            .values()
            .filter(|p| p.route.csi == pipe.route.csi)
            .map(|p| p.route.csi_channel + 1)
            .max()
            .unwrap_or(1)
            .max(bus.channels);
        let input = FrameFormat::new(win.width, win.height, req.format.pixel_format, win.mbus_code, plat);
        if let Some(mipi) = &pipe.mipi {
            mipi.configure(&bus, win.mbus_code)?;
        }
        pipe.csi.configure(&bus, &input)?;
        if !pipe.csi.stream_gate().is_held() {
            pipe.csi.set_mode(match req.mode {
                CaptureMode::Image => StartMode::Snapshot,
                _ => StartMode::Video,
            });
        }
        let depth = win.mbus_code.bit_depth();
        if let Some(tdm) = &pipe.tdm {
            tdm.configure(win.width, win.height, depth)?;
        }

        let cfg = &self.inner.cfg.pipeline;
        pipe.isp.set_mode(IspMode {
            wdr: win.wdr,
            d3d: cfg.d3d.then_some(cfg.d3d_compression),
            bit_depth: depth,
        })?;
        let ch = pipe.route.isp_channel;
        if ch == 0 || pipe.isp.layout().channels[0].is_none() {
            pipe.isp.set_format(0, &input)?;
        }
        let isp_out = if ch == 0 {
            input
        } else {
            pipe.isp.set_format(ch, &req.format)?;
            req.format
        };

        pipe.vipp.configure(
            (isp_out.width, isp_out.height),
            req.crop,
            (req.format.width, req.format.height),
            req.format.pixel_format,
        )?;
        pipe.dma.set_format(&req.format, req.mode)?;
        debug!(win_w = win.width, win_h = win.height, wdr = ?win.wdr, "route configured");
        Ok(win)
    }

    /// Configure the route and walk it from the capture node to the sensor,
    /// taking a stream lease and attaching at every block.
    #[instrument(skip(self, req), fields(w = req.format.width, h = req.format.height))]
    pub fn stream_on(&self, vinc: usize, req: &StreamRequest) -> Result<()> {
        let pipe = self.pipeline(vinc)?.clone();
        let mut st = self.lock();
        if !st.open.contains_key(&vinc) {
            return Err(VinError::InvalidState("video node not open"));
        }
        if st.streams.contains_key(&vinc) {
            return Err(VinError::Busy(format!("vinc{vinc}")));
        }
        if st.low_power.get(&vinc).copied().unwrap_or(false) {
            return Err(VinError::InvalidState("video node in low-power mode"));
        }
        self.configure(&pipe, req)?;

        let idx = st.stream_idx.get(&vinc).copied().unwrap_or(0);
        pipe.sensor.cold_start.store(idx == 0, Ordering::Release);

        let top = &self.inner.registry.top;
        let mut held = Vec::new();
        let walk = (|| -> Result<()> {
            held.push(Held {
                lease: Lease::acquire(top.clone(), LeaseKind::Stream)?,
                consumer: None,
                bridge: Bridge::None,
            });
            for hop in pipe.stream_hops() {
                let lease = Lease::acquire(hop.node.clone(), LeaseKind::Stream)?;
                hop.node.attach(hop.consumer)?;
                match hop.bridge {
                    Bridge::Isp(isp) => top.set_isp_bridge(isp, true),
                    Bridge::Tdm(csi) => top.set_tdm_route(csi, true),
                    Bridge::None => {}
                }
                held.push(Held {
                    lease,
                    consumer: Some(hop.consumer),
                    bridge: hop.bridge,
                });
            }
            Ok(())
        })();
        if let Err(e) = walk {
            warn!("stream-on failed, unwinding: {e}");
            self.unwind(held);
            return Err(e);
        }

        st.streams.insert(vinc, held);
        st.stream_idx.insert(vinc, idx + 1);
        self.refresh_scope(&st, pipe.isp.id());
        info!(stream_idx = idx + 1, "streaming");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn stream_off(&self, vinc: usize) -> Result<()> {
        let mut st = self.lock();
        self.stop_locked(&mut st, vinc)
    }

    fn stop_locked(&self, st: &mut GraphState, vinc: usize) -> Result<()> {
        let pipe = self.pipeline(vinc)?.clone();
        let held = st
            .streams
            .remove(&vinc)
            .ok_or(VinError::InvalidState("video node not streaming"))?;
        // Out of the reset scope before any block goes down.
        self.refresh_scope(st, pipe.isp.id());
        self.unwind(held);
        info!("stream off");
        Ok(())
    }

    /// Detach and release in reverse acquisition order.
    fn unwind(&self, mut held: Vec<Held>) {
        let top = &self.inner.registry.top;
        while let Some(h) = held.pop() {
            let node = h.lease.node().clone();
            if let Some(c) = h.consumer {
                node.detach(c);
            }
            h.lease.release();
            if node.stream_gate().is_held() {
                continue;
            }
            match h.bridge {
                Bridge::Isp(isp) => top.set_isp_bridge(isp, false),
                Bridge::Tdm(csi) => top.set_tdm_route(csi, false),
                Bridge::None => {}
            }
        }
    }

    /// Rebuild the reset scope of `isp` from the routes streaming through it.
    fn refresh_scope(&self, st: &GraphState, isp: usize) {
        let pipes: Vec<&Arc<Pipeline>> = st
            .streams
            .keys()
            .filter_map(|v| self.inner.pipelines.get(v))
            .filter(|p| p.isp.id() == isp)
            .collect();
        let mut scopes = self.inner.scopes.lock();
        let Some(first) = pipes.first() else {
            scopes.remove(&isp);
            return;
        };
        let mut scope = ResetScope {
            isp: first.isp.clone(),
            top: self.inner.registry.top.clone(),
            parsers: Vec::new(),
            vipps: Vec::new(),
            dmas: Vec::new(),
            sensors: Vec::new(),
        };
        let mut seen_sensors = Vec::new();
        for p in &pipes {
            if !scope.parsers.iter().any(|x| x.id() == p.csi.id()) {
                scope.parsers.push(p.csi.clone());
            }
            if !scope.vipps.iter().any(|x| x.id() == p.vipp.id()) {
                scope.vipps.push(p.vipp.clone());
            }
            scope.dmas.push(p.dma.clone());
            if !seen_sensors.contains(&p.sensor.id()) {
                seen_sensors.push(p.sensor.id());
                scope.sensors.push(p.sensor.sensor().clone());
            }
        }
        scopes.insert(isp, scope);
    }

    /// Enter or leave low-power mode on an open, idle video node.
    ///
    /// The sensor is put in standby from the work queue. CSIC clocks are
    /// gated only while no node streams.
    #[instrument(skip(self))]
    pub fn set_low_power(&self, vinc: usize, on: bool) -> Result<()> {
        let pipe = self.pipeline(vinc)?.clone();
        let mut st = self.lock();
        if !st.open.contains_key(&vinc) {
            return Err(VinError::InvalidState("video node not open"));
        }
        if st.streams.contains_key(&vinc) {
            return Err(VinError::Busy(format!("vinc{vinc}")));
        }
        if st.low_power.get(&vinc).copied().unwrap_or(false) == on {
            return Ok(());
        }
        let top = &self.inner.registry.top;
        if on {
            if st.streams.is_empty() {
                top.suspend();
            }
        } else {
            top.resume()?;
        }
        let sensor = pipe.sensor.sensor().clone();
        self.inner
            .work
            .submit("sensor standby", move || sensor.standby(on))?;
        st.low_power.insert(vinc, on);
        info!(on, "low-power mode");
        Ok(())
    }

    pub fn is_low_power(&self, vinc: usize) -> bool {
        self.lock().low_power.get(&vinc).copied().unwrap_or(false)
    }

    pub fn irq_all(&self) {
        for isp in &self.inner.registry.isps {
            isp.irq();
        }
        for dma in &self.inner.registry.dmas {
            dma.irq();
        }
    }
}

impl GraphInner {
    /// ISP a fault source feeds into, if it is part of a configured route.
    fn isp_of(&self, source: FaultSource) -> Option<usize> {
        match source {
            FaultSource::Isp(id) => Some(id),
            FaultSource::Dma(id) => self.pipelines.get(&id).map(|p| p.isp.id()),
            FaultSource::Parser(id) => {
                let scopes = self.scopes.lock();
                scopes
                    .iter()
                    .find(|(_, s)| s.parsers.iter().any(|p| p.id() == id))
                    .map(|(isp, _)| *isp)
            }
        }
    }

    fn on_fault(&self, source: FaultSource, fault: HwFault) {
        let frame_cnt = match source {
            FaultSource::Isp(id) => self.registry.isps.get(id).map_or(0, |i| i.frame_cnt()),
            FaultSource::Dma(id) => self.registry.dmas.get(id).map_or(0, |d| d.stats().frame_cnt()),
            FaultSource::Parser(_) => 0,
        };
        let scope = self
            .isp_of(source)
            .and_then(|isp| self.scopes.lock().get(&isp).cloned());
        self.reset.report(source, fault, frame_cnt, scope.as_ref());
    }
}

fn release_all(mut leases: Vec<Lease>) {
    while let Some(l) = leases.pop() {
        l.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::format::PixelFormat;

    fn graph() -> (SimPlatform, MediaGraph) {
        let cfg = Config::default();
        let sim = SimPlatform::new(&cfg).unwrap();
        let g = MediaGraph::new(sim.platform(), cfg).unwrap();
        (sim, g)
    }

    fn request(g: &MediaGraph, w: u32, h: u32) -> StreamRequest {
        let sensor = &g.config().sensors[0];
        StreamRequest {
            format: FrameFormat::new(w, h, PixelFormat::Nv12, sensor.mbus_code, g.platform()),
            crop: None,
            mode: CaptureMode::Video,
            wdr: WdrMode::Linear,
        }
    }

    #[test]
    fn routes_resolve_from_config() {
        let (_sim, g) = graph();
        let p = g.pipeline(1).unwrap();
        assert_eq!(p.isp().id(), 0);
        assert_eq!(p.vipp().id(), 1);
        assert_eq!(p.dma().id(), 1);
        assert!(matches!(g.pipeline(7), Err(VinError::NoDevice { .. })));
    }

    #[test]
    fn open_rolls_back_on_sensor_power_failure() {
        let (sim, g) = graph();
        sim.sensors[0].fail_power(true);
        assert!(g.open(0).is_err());
        assert!(!g.registry().top().is_powered());
        assert_eq!(g.registry().top().power_gate().holders(), 0);
        sim.sensors[0].fail_power(false);
        g.open(0).unwrap();
        assert!(g.registry().top().is_powered());
        assert!(sim.clocks.is_enabled("csi_mclk0"));
        g.close(0).unwrap();
        assert!(!sim.clocks.is_enabled("csi_mclk0"));
    }

    #[test]
    fn stream_needs_open_and_counts_cold_starts() {
        let (sim, g) = graph();
        let req = request(&g, 1920, 1080);
        assert!(g.stream_on(0, &req).is_err());
        g.open(0).unwrap();
        g.stream_on(0, &req).unwrap();
        assert!(g.registry().top().isp_bridge(0));
        g.stream_off(0).unwrap();
        assert!(!g.registry().top().isp_bridge(0));
        g.stream_on(0, &req).unwrap();
        g.stream_off(0).unwrap();
        assert_eq!(sim.sensors[0].state().starts, vec![true, false]);
        assert_eq!(g.stream_idx(0), 2);
    }

    #[test]
    fn low_power_is_refused_while_streaming() {
        let (_sim, g) = graph();
        g.open(0).unwrap();
        g.stream_on(0, &request(&g, 1280, 720)).unwrap();
        assert!(matches!(g.set_low_power(0, true), Err(VinError::Busy(_))));
        g.stream_off(0).unwrap();
        g.set_low_power(0, true).unwrap();
        assert!(matches!(
            g.stream_on(0, &request(&g, 1280, 720)),
            Err(VinError::InvalidState(_))
        ));
        g.set_low_power(0, false).unwrap();
        g.work().flush().unwrap();
    }
}
