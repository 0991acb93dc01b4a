//! Clock and power-rail collaborators.
//!
//! The core only needs a handful of verbs from the platform: look up a named
//! clock, reparent it, round and set its rate, gate it; acquire a named
//! regulator, set its voltage, switch it. Any failure here is fatal for the
//! device being brought up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::{Result, VinError};

pub trait Clock: Send + Sync {
    fn name(&self) -> &str;
    fn set_parent(&self, parent: &str) -> Result<()>;
    fn round_rate(&self, hz: u64) -> u64;
    fn set_rate(&self, hz: u64) -> Result<()>;
    fn rate(&self) -> u64;
    fn prepare_enable(&self) -> Result<()>;
    fn disable(&self);
}

pub trait ClockSource: Send + Sync {
    fn get(&self, name: &str) -> Result<Arc<dyn Clock>>;
}

pub trait Regulator: Send + Sync {
    fn name(&self) -> &str;
    fn set_voltage(&self, min_uv: u32, max_uv: u32) -> Result<()>;
    fn enable(&self) -> Result<()>;
    fn disable(&self);
}

pub trait Regulators: Send + Sync {
    fn acquire(&self, name: &str) -> Result<Arc<dyn Regulator>>;
    fn release(&self, reg: Arc<dyn Regulator>);
}

/// Power rail request: name plus the voltage window to program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RailSpec {
    pub name: String,
    pub min_uv: u32,
    pub max_uv: u32,
}

/// Clocks and rails held by one powered block.
///
/// Built by [`PowerDomain::bring_up`]; on error, whatever was acquired so far
/// is released before returning.
pub struct PowerDomain {
    clocks: Vec<Arc<dyn Clock>>,
    rails: Vec<Arc<dyn Regulator>>,
    regulators: Arc<dyn Regulators>,
    gated: AtomicBool,
}

impl PowerDomain {
    pub fn bring_up(
        clocks: &dyn ClockSource,
        regulators: Arc<dyn Regulators>,
        clock_rates: &[(&str, u64)],
        rails: &[RailSpec],
    ) -> Result<Self> {
        let mut dom = PowerDomain {
            clocks: Vec::new(),
            rails: Vec::new(),
            regulators,
            gated: AtomicBool::new(false),
        };
        for rail in rails {
            let reg = dom.regulators.acquire(&rail.name)?;
            let step = reg
                .set_voltage(rail.min_uv, rail.max_uv)
                .and_then(|_| reg.enable());
            if let Err(e) = step {
                dom.regulators.release(reg);
                return Err(e);
            }
            dom.rails.push(reg);
        }
        for &(name, hz) in clock_rates {
            let clk = clocks.get(name)?;
            let rounded = clk.round_rate(hz);
            clk.set_rate(rounded)?;
            clk.prepare_enable()?;
            debug!(clock = name, hz = rounded, "clock enabled");
            dom.clocks.push(clk);
        }
        Ok(dom)
    }

    pub fn clock_names(&self) -> Vec<String> {
        self.clocks.iter().map(|c| c.name().to_string()).collect()
    }

    /// Gate clocks without releasing anything (low-power mode).
    pub fn suspend(&self) {
        if self.gated.swap(true, Ordering::AcqRel) {
            return;
        }
        for clk in self.clocks.iter().rev() {
            clk.disable();
        }
    }

    pub fn resume(&self) -> Result<()> {
        if !self.gated.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        for clk in &self.clocks {
            clk.prepare_enable()?;
        }
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.gated.load(Ordering::Acquire)
    }
}

impl Drop for PowerDomain {
    fn drop(&mut self) {
        let gated = *self.gated.get_mut();
        for clk in self.clocks.drain(..).rev() {
            if !gated {
                clk.disable();
            }
        }
        for reg in self.rails.drain(..).rev() {
            reg.disable();
            self.regulators.release(reg);
        }
    }
}

/// Power recipe of one block plus the domain it holds while powered.
pub struct PowerHandle {
    name: String,
    clocks: Arc<dyn ClockSource>,
    regulators: Arc<dyn Regulators>,
    clock_rates: Vec<(String, u64)>,
    rails: Vec<RailSpec>,
    domain: Mutex<Option<PowerDomain>>,
}

impl PowerHandle {
    pub fn new(
        name: impl Into<String>,
        clocks: Arc<dyn ClockSource>,
        regulators: Arc<dyn Regulators>,
        clock_rates: Vec<(String, u64)>,
        rails: Vec<RailSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            clocks,
            regulators,
            clock_rates,
            rails,
            domain: Mutex::new(None),
        }
    }

    pub fn is_on(&self) -> bool {
        self.domain
            .lock()
            .map(|d| d.is_some())
            .unwrap_or(false)
    }

    pub fn on(&self) -> Result<()> {
        let mut dom = self.domain.lock().unwrap_or_else(|e| e.into_inner());
        if dom.is_some() {
            return Ok(());
        }
        let rates: Vec<(&str, u64)> = self
            .clock_rates
            .iter()
            .map(|(n, hz)| (n.as_str(), *hz))
            .collect();
        *dom = Some(PowerDomain::bring_up(
            self.clocks.as_ref(),
            self.regulators.clone(),
            &rates,
            &self.rails,
        )?);
        info!(block = %self.name, "powered on");
        Ok(())
    }

    pub fn off(&self) {
        let taken = self
            .domain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if taken.is_some() {
            info!(block = %self.name, "powered off");
        }
    }

    pub fn suspend(&self) {
        if let Some(dom) = self.domain.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            dom.suspend();
        }
    }

    pub fn resume(&self) -> Result<()> {
        match self.domain.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(dom) => dom.resume(),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated collaborators

#[derive(Debug, Default, Clone)]
pub struct SimClockState {
    pub rate: u64,
    pub parent: Option<String>,
    pub enable_count: u32,
}

/// Clock tree with injectable failures.
#[derive(Default)]
pub struct SimClocks {
    state: Arc<Mutex<HashMap<String, SimClockState>>>,
    failing: Mutex<Vec<String>>,
}

struct SimClock {
    name: String,
    state: Arc<Mutex<HashMap<String, SimClockState>>>,
}

impl SimClocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `get(name)` fail from now on.
    pub fn fail(&self, name: &str) {
        if let Ok(mut f) = self.failing.lock() {
            f.push(name.to_string());
        }
    }

    pub fn state(&self, name: &str) -> Option<SimClockState> {
        self.state.lock().ok()?.get(name).cloned()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.state(name).is_some_and(|s| s.enable_count > 0)
    }
}

impl ClockSource for SimClocks {
    fn get(&self, name: &str) -> Result<Arc<dyn Clock>> {
        let failing = self
            .failing
            .lock()
            .map(|f| f.iter().any(|n| n == name))
            .unwrap_or(false);
        if failing {
            return Err(VinError::Clock {
                name: name.to_string(),
                reason: "not found".into(),
            });
        }
        if let Ok(mut st) = self.state.lock() {
            st.entry(name.to_string()).or_default();
        }
        Ok(Arc::new(SimClock {
            name: name.to_string(),
            state: self.state.clone(),
        }))
    }
}

impl SimClock {
    fn update(&self, f: impl FnOnce(&mut SimClockState)) {
        if let Ok(mut st) = self.state.lock() {
            f(st.entry(self.name.clone()).or_default());
        }
    }
}

impl Clock for SimClock {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_parent(&self, parent: &str) -> Result<()> {
        self.update(|s| s.parent = Some(parent.to_string()));
        Ok(())
    }

    fn round_rate(&self, hz: u64) -> u64 {
        // Integer dividers off a 1.2 GHz PLL.
        const PLL: u64 = 1_200_000_000;
        if hz == 0 || hz >= PLL {
            return PLL;
        }
        PLL / PLL.div_ceil(hz)
    }

    fn set_rate(&self, hz: u64) -> Result<()> {
        self.update(|s| s.rate = hz);
        Ok(())
    }

    fn rate(&self) -> u64 {
        self.state
            .lock()
            .ok()
            .and_then(|st| st.get(&self.name).map(|s| s.rate))
            .unwrap_or(0)
    }

    fn prepare_enable(&self) -> Result<()> {
        self.update(|s| s.enable_count += 1);
        Ok(())
    }

    fn disable(&self) {
        self.update(|s| s.enable_count = s.enable_count.saturating_sub(1));
    }
}

#[derive(Debug, Default, Clone)]
pub struct SimRailState {
    pub uv: u32,
    pub enabled: bool,
    pub holders: u32,
}

/// Regulator framework with injectable failures.
#[derive(Default)]
pub struct SimRegulators {
    state: Arc<Mutex<HashMap<String, SimRailState>>>,
    failing: Mutex<Vec<String>>,
}

struct SimRail {
    name: String,
    state: Arc<Mutex<HashMap<String, SimRailState>>>,
}

impl SimRegulators {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, name: &str) {
        if let Ok(mut f) = self.failing.lock() {
            f.push(name.to_string());
        }
    }

    pub fn state(&self, name: &str) -> Option<SimRailState> {
        self.state.lock().ok()?.get(name).cloned()
    }
}

impl Regulators for SimRegulators {
    fn acquire(&self, name: &str) -> Result<Arc<dyn Regulator>> {
        let failing = self
            .failing
            .lock()
            .map(|f| f.iter().any(|n| n == name))
            .unwrap_or(false);
        if failing {
            return Err(VinError::Regulator {
                name: name.to_string(),
                reason: "unavailable".into(),
            });
        }
        if let Ok(mut st) = self.state.lock() {
            st.entry(name.to_string()).or_default().holders += 1;
        }
        Ok(Arc::new(SimRail {
            name: name.to_string(),
            state: self.state.clone(),
        }))
    }

    fn release(&self, reg: Arc<dyn Regulator>) {
        if let Ok(mut st) = self.state.lock() {
            if let Some(s) = st.get_mut(reg.name()) {
                s.holders = s.holders.saturating_sub(1);
            }
        }
    }
}

impl Regulator for SimRail {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_voltage(&self, min_uv: u32, max_uv: u32) -> Result<()> {
        if min_uv > max_uv {
            return Err(VinError::Regulator {
                name: self.name.clone(),
                reason: format!("bad window {min_uv}..{max_uv}"),
            });
        }
        if let Ok(mut st) = self.state.lock() {
            st.entry(self.name.clone()).or_default().uv = min_uv;
        }
        Ok(())
    }

    fn enable(&self) -> Result<()> {
        if let Ok(mut st) = self.state.lock() {
            st.entry(self.name.clone()).or_default().enabled = true;
        }
        info!(rail = %self.name, "regulator on");
        Ok(())
    }

    fn disable(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.entry(self.name.clone()).or_default().enabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rails() -> Vec<RailSpec> {
        vec![
            RailSpec {
                name: "iovdd".into(),
                min_uv: 1_800_000,
                max_uv: 1_800_000,
            },
            RailSpec {
                name: "avdd".into(),
                min_uv: 2_800_000,
                max_uv: 2_800_000,
            },
        ]
    }

    #[test]
    fn bring_up_and_drop() {
        let clocks = SimClocks::new();
        let regs = SimRegulators::new();
        let dom = PowerDomain::bring_up(
            clocks.as_ref(),
            regs.clone(),
            &[("csi_top", 300_000_000)],
            &rails(),
        )
        .unwrap();
        assert!(clocks.is_enabled("csi_top"));
        assert_eq!(clocks.state("csi_top").unwrap().rate, 300_000_000);
        assert!(regs.state("avdd").unwrap().enabled);
        drop(dom);
        assert!(!clocks.is_enabled("csi_top"));
        assert!(!regs.state("avdd").unwrap().enabled);
        assert_eq!(regs.state("iovdd").unwrap().holders, 0);
    }

    #[test]
    fn clock_failure_rolls_back_rails() {
        let clocks = SimClocks::new();
        clocks.fail("isp");
        let regs = SimRegulators::new();
        let res = PowerDomain::bring_up(
            clocks.as_ref(),
            regs.clone(),
            &[("csi_top", 300_000_000), ("isp", 300_000_000)],
            &rails(),
        );
        assert!(matches!(res, Err(VinError::Clock { .. })));
        assert!(!clocks.is_enabled("csi_top"));
        assert!(!regs.state("iovdd").unwrap().enabled);
    }

    #[test]
    fn rounding_uses_integer_dividers() {
        let clocks = SimClocks::new();
        let clk = clocks.get("mclk").unwrap();
        assert_eq!(clk.round_rate(24_000_000), 24_000_000);
        assert_eq!(clk.round_rate(350_000_000), 300_000_000);
    }
}
