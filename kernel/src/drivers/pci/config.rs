/// PCI configuration space access.
///
/// Configuration mechanism 1: write the target address to 0xCF8, then
/// move data through 0xCFC. Sub-dword accesses select the byte lane with
/// the low bits of the offset, as the hardware expects.
use bitflags::bitflags;

use crate::drivers::io::PortIo;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

/// Bus / device / function address of a PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl Bdf {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self { bus, device, function }
    }

    /// Value written to CONFIG_ADDRESS to reach `offset` of this function.
    pub fn config_address(self, offset: u8) -> u32 {
        0x8000_0000
            | ((self.bus as u32) << 16)
            | (((self.device & 0x1F) as u32) << 11)
            | (((self.function & 0x07) as u32) << 8)
            | ((offset as u32) & 0xFC)
    }
}

/// Read and write access to the configuration space of any function.
///
/// Implementors provide dword access; byte and word accesses default to
/// shifting the containing dword, and writes to read-modify-write.
pub trait ConfigSpace {
    fn read32(&self, bdf: Bdf, offset: u8) -> u32;
    fn write32(&self, bdf: Bdf, offset: u8, val: u32);

    fn read16(&self, bdf: Bdf, offset: u8) -> u16 {
        (self.read32(bdf, offset & 0xFC) >> ((offset & 2) * 8)) as u16
    }

    fn read8(&self, bdf: Bdf, offset: u8) -> u8 {
        (self.read32(bdf, offset & 0xFC) >> ((offset & 3) * 8)) as u8
    }

    fn write16(&self, bdf: Bdf, offset: u8, val: u16) {
        let shift = (offset & 2) * 8;
        let old = self.read32(bdf, offset & 0xFC);
        let new = (old & !(0xFFFF << shift)) | ((val as u32) << shift);
        self.write32(bdf, offset & 0xFC, new);
    }

    fn write8(&self, bdf: Bdf, offset: u8, val: u8) {
        let shift = (offset & 3) * 8;
        let old = self.read32(bdf, offset & 0xFC);
        let new = (old & !(0xFF << shift)) | ((val as u32) << shift);
        self.write32(bdf, offset & 0xFC, new);
    }
}

impl<C: ConfigSpace + ?Sized> ConfigSpace for &C {
    fn read32(&self, bdf: Bdf, offset: u8) -> u32 {
        (**self).read32(bdf, offset)
    }
    fn write32(&self, bdf: Bdf, offset: u8, val: u32) {
        (**self).write32(bdf, offset, val)
    }
    fn read16(&self, bdf: Bdf, offset: u8) -> u16 {
        (**self).read16(bdf, offset)
    }
    fn read8(&self, bdf: Bdf, offset: u8) -> u8 {
        (**self).read8(bdf, offset)
    }
    fn write16(&self, bdf: Bdf, offset: u8, val: u16) {
        (**self).write16(bdf, offset, val)
    }
    fn write8(&self, bdf: Bdf, offset: u8, val: u8) {
        (**self).write8(bdf, offset, val)
    }
}

/// Configuration mechanism 1 over x86 I/O ports.
pub struct Mechanism1<P: PortIo> {
    ports: P,
}

impl<P: PortIo> Mechanism1<P> {
    pub const fn new(ports: P) -> Self {
        Self { ports }
    }

    fn select(&self, bdf: Bdf, offset: u8) {
        self.ports.outl(CONFIG_ADDRESS, bdf.config_address(offset));
    }
}

impl<P: PortIo> ConfigSpace for Mechanism1<P> {
    fn read32(&self, bdf: Bdf, offset: u8) -> u32 {
        self.select(bdf, offset);
        self.ports.inl(CONFIG_DATA)
    }

    fn write32(&self, bdf: Bdf, offset: u8, val: u32) {
        self.select(bdf, offset);
        self.ports.outl(CONFIG_DATA, val);
    }

    fn read16(&self, bdf: Bdf, offset: u8) -> u16 {
        self.select(bdf, offset);
        self.ports.inw(CONFIG_DATA + (offset & 2) as u16)
    }

    fn read8(&self, bdf: Bdf, offset: u8) -> u8 {
        self.select(bdf, offset);
        self.ports.inb(CONFIG_DATA + (offset & 3) as u16)
    }

    fn write16(&self, bdf: Bdf, offset: u8, val: u16) {
        self.select(bdf, offset);
        self.ports.outw(CONFIG_DATA + (offset & 2) as u16, val);
    }

    fn write8(&self, bdf: Bdf, offset: u8, val: u8) {
        self.select(bdf, offset);
        self.ports.outb(CONFIG_DATA + (offset & 3) as u16, val);
    }
}

bitflags! {
    /// Low half of the command/status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u16 {
        const IO_SPACE = 1 << 0;
        const MEMORY_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
        const INTX_DISABLE = 1 << 10;
    }
}

/// Type-0 header register offsets and field decoders.
pub mod regs {
    pub const ID: u8 = 0x00;
    pub const COMMAND: u8 = 0x04;
    pub const STATUS: u8 = 0x06;
    pub const CLASS: u8 = 0x08;
    pub const BHLC: u8 = 0x0C;
    pub const BAR_START: u8 = 0x10;
    pub const BAR_END: u8 = 0x28;
    pub const CAP_PTR: u8 = 0x34;
    pub const INTERRUPT: u8 = 0x3C;

    /// Status bit: capability list present.
    pub const STATUS_CAP_LIST: u16 = 0x10;

    pub const INVALID_VENDOR: u16 = 0xFFFF;

    /// Capability pointers are dword aligned; the low two bits are reserved.
    pub const CAP_PTR_MASK: u8 = 0xFC;
    /// Offsets within a capability header.
    pub const CAP_ID: u8 = 0;
    pub const CAP_NEXT: u8 = 1;

    pub const BAR_IO: u32 = 0x1;
    pub const BAR_MEM_TYPE_MASK: u32 = 0x6;
    pub const BAR_MEM_TYPE_64: u32 = 0x4;
    pub const BAR_MEM_ADDR_MASK: u32 = 0xFFFF_FFF0;
    pub const BAR_IO_ADDR_MASK: u32 = 0xFFFF_FFFC;

    pub const fn vendor(id: u32) -> u16 {
        id as u16
    }

    pub const fn product(id: u32) -> u16 {
        (id >> 16) as u16
    }

    pub const fn class(cr: u32) -> u8 {
        (cr >> 24) as u8
    }

    pub const fn subclass(cr: u32) -> u8 {
        (cr >> 16) as u8
    }

    pub const fn header_type(bhlc: u32) -> u8 {
        ((bhlc >> 16) as u8) & 0x7F
    }

    pub const fn is_multifunction(bhlc: u32) -> bool {
        (bhlc >> 16) & 0x80 != 0
    }

    pub const fn irq_line(icr: u32) -> u8 {
        icr as u8
    }

    pub const fn irq_pin(icr: u32) -> u8 {
        (icr >> 8) as u8
    }

    /// Index (0..6) of the BAR register at `offset`.
    pub const fn bar_index(offset: u8) -> usize {
        ((offset - BAR_START) / 4) as usize
    }
}
