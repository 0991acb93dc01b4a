//! Memory-backed register model for simulation and tests.

use std::collections::{HashMap, HashSet};

use spin::Mutex;

use super::RegisterIo;

#[derive(Default)]
struct MockState {
    regs: HashMap<u32, u32>,
    w1c: HashSet<u32>,
    stuck: HashSet<u32>,
    log: Vec<(u32, u32)>,
    logging: bool,
}

/// A register file that remembers every write.
///
/// * Addresses marked with [`MockRegisters::mark_w1c`] behave like interrupt
///   status registers: writing a 1 clears that bit.
/// * [`MockRegisters::raise`] sets status bits the way hardware would.
/// * [`MockRegisters::stick`] makes an address ignore writes, so a readback
///   check observes a value different from the one written.
pub struct MockRegisters {
    state: Mutex<MockState>,
}

impl Default for MockRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRegisters {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                logging: true,
                ..Default::default()
            }),
        }
    }

    pub fn mark_w1c(&self, addr: u32) {
        self.state.lock().w1c.insert(addr);
    }

    /// Hardware-side update: OR `bits` into `addr` without logging a write.
    pub fn raise(&self, addr: u32, bits: u32) {
        let mut st = self.state.lock();
        *st.regs.entry(addr).or_default() |= bits;
    }

    /// Hardware-side update: overwrite `addr` without logging a write.
    pub fn poke(&self, addr: u32, value: u32) {
        self.state.lock().regs.insert(addr, value);
    }

    pub fn peek(&self, addr: u32) -> u32 {
        self.state.lock().regs.get(&addr).copied().unwrap_or(0)
    }

    pub fn stick(&self, addr: u32) {
        self.state.lock().stuck.insert(addr);
    }

    pub fn unstick(&self, addr: u32) {
        self.state.lock().stuck.remove(&addr);
    }

    pub fn set_logging(&self, on: bool) {
        self.state.lock().logging = on;
    }

    /// Every logged write, oldest first.
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.state.lock().log.clone()
    }

    /// Values written to `addr`, oldest first.
    pub fn writes_to(&self, addr: u32) -> Vec<u32> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Position of the last write to `addr` in the log.
    pub fn last_write_index(&self, addr: u32) -> Option<usize> {
        self.state.lock().log.iter().rposition(|(a, _)| *a == addr)
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }
}

impl RegisterIo for MockRegisters {
    fn read(&self, addr: u32) -> u32 {
        self.peek(addr)
    }

    fn write(&self, addr: u32, value: u32) {
        let mut st = self.state.lock();
        if st.logging {
            st.log.push((addr, value));
        }
        if st.stuck.contains(&addr) {
            return;
        }
        if st.w1c.contains(&addr) {
            let cur = st.regs.get(&addr).copied().unwrap_or(0);
            st.regs.insert(addr, cur & !value);
        } else {
            st.regs.insert(addr, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn w1c_clears_only_written_bits() {
        let m = MockRegisters::new();
        m.mark_w1c(0x34);
        m.raise(0x34, 0b1011);
        m.write(0x34, 0b0001);
        assert_eq!(m.peek(0x34), 0b1010);
    }

    #[test]
    fn stuck_register_drops_writes_but_logs_them() {
        let m = MockRegisters::new();
        m.poke(0x20, 0xdead);
        m.stick(0x20);
        m.write(0x20, 0x1234);
        assert_eq!(m.peek(0x20), 0xdead);
        assert_eq!(m.writes_to(0x20), vec![0x1234]);
        m.unstick(0x20);
        m.write(0x20, 0x1234);
        assert_eq!(m.peek(0x20), 0x1234);
    }
}
