/// Memory-mapped register access by physical address.
///
/// Device windows (BARs) are reached through the HHDM like any other
/// physical memory. All accesses are volatile and use the exact width
/// requested; virtio forbids wider or split accesses to its registers
/// except for the documented 64-bit fields, which are written as two
/// 32-bit halves, low first.
use core::ptr;

use super::phys::PhysAddr;

pub trait Mmio {
    fn read8(&self, addr: u64) -> u8;
    fn read16(&self, addr: u64) -> u16;
    fn read32(&self, addr: u64) -> u32;
    fn write8(&self, addr: u64, val: u8);
    fn write16(&self, addr: u64, val: u16);
    fn write32(&self, addr: u64, val: u32);

    fn write64(&self, addr: u64, val: u64) {
        self.write32(addr, val as u32);
        self.write32(addr + 4, (val >> 32) as u32);
    }

    fn read64(&self, addr: u64) -> u64 {
        let lo = self.read32(addr) as u64;
        let hi = self.read32(addr + 4) as u64;
        (hi << 32) | lo
    }
}

impl<M: Mmio + ?Sized> Mmio for &M {
    fn read8(&self, addr: u64) -> u8 {
        (**self).read8(addr)
    }
    fn read16(&self, addr: u64) -> u16 {
        (**self).read16(addr)
    }
    fn read32(&self, addr: u64) -> u32 {
        (**self).read32(addr)
    }
    fn write8(&self, addr: u64, val: u8) {
        (**self).write8(addr, val)
    }
    fn write16(&self, addr: u64, val: u16) {
        (**self).write16(addr, val)
    }
    fn write32(&self, addr: u64, val: u32) {
        (**self).write32(addr, val)
    }
}

/// MMIO through the higher-half direct map. BAR windows must be mapped
/// uncacheable.
#[derive(Debug, Clone, Copy, Default)]
pub struct HhdmMmio;

impl Mmio for HhdmMmio {
    fn read8(&self, addr: u64) -> u8 {
        unsafe { ptr::read_volatile(PhysAddr::new(addr).as_ptr::<u8>()) }
    }

    fn read16(&self, addr: u64) -> u16 {
        unsafe { ptr::read_volatile(PhysAddr::new(addr).as_ptr::<u16>()) }
    }

    fn read32(&self, addr: u64) -> u32 {
        unsafe { ptr::read_volatile(PhysAddr::new(addr).as_ptr::<u32>()) }
    }

    fn write8(&self, addr: u64, val: u8) {
        unsafe { ptr::write_volatile(PhysAddr::new(addr).as_ptr::<u8>(), val) }
    }

    fn write16(&self, addr: u64, val: u16) {
        unsafe { ptr::write_volatile(PhysAddr::new(addr).as_ptr::<u16>(), val) }
    }

    fn write32(&self, addr: u64, val: u32) {
        unsafe { ptr::write_volatile(PhysAddr::new(addr).as_ptr::<u32>(), val) }
    }
}
