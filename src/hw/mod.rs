//! Register block abstraction.
//!
//! Hardware blocks never touch raw pointers. Each one owns a [`RegBlock`]: a
//! base offset into a [`RegisterIo`] bus plus typed helpers built on
//! tock-registers bitfields. On target the bus is an MMIO mapping; in tests it
//! is [`mock::MockRegisters`].

use std::sync::Arc;
use std::time::Duration;

use tock_registers::fields::{Field, FieldValue};
use tock_registers::{LocalRegisterCopy, RegisterLongName};

pub mod mock;
pub mod regs;

/// 32-bit register bus.
///
/// Implementations must be callable from interrupt context: no blocking, no
/// allocation.
pub trait RegisterIo: Send + Sync {
    fn read(&self, addr: u32) -> u32;
    fn write(&self, addr: u32, value: u32);
}

/// Busy-wait collaborator used for bounded polling loops.
pub trait Delay: Send + Sync {
    fn udelay(&self, us: u32);
}

/// Sleeps on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn udelay(&self, us: u32) {
        std::thread::sleep(Duration::from_micros(us as u64));
    }
}

/// Returns immediately. Used by simulations where time does not matter.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn udelay(&self, _us: u32) {}
}

/// Poll `cond` up to `polls` times, waiting `interval_us` between attempts.
pub fn poll_until(
    delay: &dyn Delay,
    polls: u32,
    interval_us: u32,
    mut cond: impl FnMut() -> bool,
) -> bool {
    for _ in 0..polls {
        if cond() {
            return true;
        }
        delay.udelay(interval_us);
    }
    cond()
}

/// Typed view over one hardware block's register window.
#[derive(Clone)]
pub struct RegBlock {
    io: Arc<dyn RegisterIo>,
    base: u32,
    name: String,
}

impl std::fmt::Debug for RegBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegBlock")
            .field("name", &self.name)
            .field("base", &format_args!("{:#x}", self.base))
            .finish()
    }
}

impl RegBlock {
    pub fn new(io: Arc<dyn RegisterIo>, base: u32, name: impl Into<String>) -> Self {
        Self {
            io,
            base,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Absolute bus address of `offset`.
    pub fn addr(&self, offset: u32) -> u32 {
        self.base + offset
    }

    #[inline]
    pub fn read(&self, offset: u32) -> u32 {
        self.io.read(self.base + offset)
    }

    #[inline]
    pub fn write(&self, offset: u32, value: u32) {
        self.io.write(self.base + offset, value)
    }

    /// Read-modify-write of the fields in `value`; other bits are preserved.
    pub fn modify<R: RegisterLongName>(&self, offset: u32, value: FieldValue<u32, R>) {
        let mut reg = LocalRegisterCopy::<u32, R>::new(self.read(offset));
        reg.modify(value);
        self.write(offset, reg.get());
    }

    /// Write `value` with every other bit cleared.
    pub fn write_fields<R: RegisterLongName>(&self, offset: u32, value: FieldValue<u32, R>) {
        let mut reg = LocalRegisterCopy::<u32, R>::new(0);
        reg.modify(value);
        self.write(offset, reg.get());
    }

    pub fn read_field<R: RegisterLongName>(&self, offset: u32, field: Field<u32, R>) -> u32 {
        LocalRegisterCopy::<u32, R>::new(self.read(offset)).read(field)
    }

    pub fn is_set<R: RegisterLongName>(&self, offset: u32, field: Field<u32, R>) -> bool {
        LocalRegisterCopy::<u32, R>::new(self.read(offset)).is_set(field)
    }

    /// Set or clear a single bit at `bit`.
    pub fn set_bit(&self, offset: u32, bit: u32, on: bool) {
        let v = self.read(offset);
        let v = if on { v | (1 << bit) } else { v & !(1 << bit) };
        self.write(offset, v);
    }

    pub fn bit(&self, offset: u32, bit: u32) -> bool {
        self.read(offset) & (1 << bit) != 0
    }
}

/// Pack a width/height pair into the common `W[15:0] | H[31:16]` layout.
pub const fn pack_size(width: u32, height: u32) -> u32 {
    (width & 0xffff) | ((height & 0xffff) << 16)
}

#[cfg(test)]
mod tests {
    use super::mock::MockRegisters;
    use super::regs::isp::{FE_CTRL, off};
    use super::*;

    #[test]
    fn modify_preserves_other_fields() {
        let mock = Arc::new(MockRegisters::new());
        let blk = RegBlock::new(mock.clone(), 0x2_0000, "isp0");
        blk.write(off::FE_CTRL, 0x8000_0000);
        blk.modify(off::FE_CTRL, FE_CTRL::PARA_READY::SET);
        assert_eq!(mock.peek(0x2_0000 + off::FE_CTRL), 0x8000_0002);
        assert!(blk.is_set(off::FE_CTRL, FE_CTRL::PARA_READY));
        blk.modify(off::FE_CTRL, FE_CTRL::PARA_READY::CLEAR);
        assert!(!blk.is_set(off::FE_CTRL, FE_CTRL::PARA_READY));
        assert_eq!(blk.read(off::FE_CTRL), 0x8000_0000);
    }

    #[test]
    fn poll_until_gives_up_after_budget() {
        let mut calls = 0;
        let ok = poll_until(&NoDelay, 200, 500, || {
            calls += 1;
            false
        });
        assert!(!ok);
        assert_eq!(calls, 201);
    }

    #[test]
    fn pack_size_layout() {
        assert_eq!(pack_size(1920, 1080), 1920 | (1080 << 16));
    }
}
