/// Bus enumeration and BAR sizing.
use super::capability::walk_capabilities;
use super::config::{regs, Bdf, Command, ConfigSpace};
use super::device::{Bar, BarKind, PciBus, PciDevice, PciHandle};
use super::PciError;
use crate::serial_println;
use crate::slab::Slab;

pub const PCI_TABLE_CAPACITY: usize = 32;

const DEVICES_PER_BUS: u8 = 32;
const FUNCTIONS_PER_DEVICE: u8 = 8;

/// Every function found on the bus, plus a class-code index that points
/// at the first device of each class.
pub struct PciTable {
    devices: Slab<PciDevice, PCI_TABLE_CAPACITY>,
    by_class: [Option<PciHandle>; 256],
}

impl PciTable {
    pub fn new() -> Self {
        Self {
            devices: Slab::new(),
            by_class: [None; 256],
        }
    }

    /// Probe every device slot of `bus` and record the functions present.
    /// Returns how many functions were recorded.
    ///
    /// A function that does not fit in the table is logged and skipped;
    /// the walk only fails if the table was full for every one of them.
    pub fn enumerate<C: ConfigSpace>(&mut self, cfg: &C, bus: PciBus) -> Result<usize, PciError> {
        let mut recorded = 0;
        let mut dropped = 0;

        for device in 0..DEVICES_PER_BUS {
            let bhlc = cfg.read32(Bdf::new(bus.bus_num, device, 0), regs::BHLC);
            if regs::header_type(bhlc) > 1 {
                continue;
            }

            let functions = if regs::is_multifunction(bhlc) {
                FUNCTIONS_PER_DEVICE
            } else {
                1
            };

            for function in 0..functions {
                match self.probe_function(cfg, bus, device, function) {
                    Ok(Some(_)) => recorded += 1,
                    Ok(None) => {}
                    Err(e) => {
                        serial_println!(
                            "[pci] {:x}:{:x}.{}: detection failed: {}",
                            bus.bus_num,
                            device,
                            function,
                            e,
                        );
                        dropped += 1;
                    }
                }
            }
        }

        if recorded == 0 && dropped > 0 {
            return Err(PciError::OutOfCapacity);
        }
        Ok(recorded)
    }

    fn probe_function<C: ConfigSpace>(
        &mut self,
        cfg: &C,
        bus: PciBus,
        device: u8,
        function: u8,
    ) -> Result<Option<PciHandle>, PciError> {
        let handle = self.devices.alloc(PciDevice::new(bus, device, function))?;
        let dev = self
            .devices
            .get_mut(handle)
            .ok_or(PciError::DeviceNotPresent)?;
        let bdf = dev.bdf;

        let id = cfg.read32(bdf, regs::ID);
        if regs::vendor(id) == regs::INVALID_VENDOR {
            self.devices.release(handle);
            return Ok(None);
        }
        dev.vendor_id = regs::vendor(id);
        dev.product_id = regs::product(id);

        let intr = cfg.read32(bdf, regs::INTERRUPT);
        dev.irq_line = regs::irq_line(intr);
        dev.irq_pin = regs::irq_pin(intr);

        let class = cfg.read32(bdf, regs::CLASS);
        dev.class = regs::class(class);
        dev.subclass = regs::subclass(class);

        read_bars(cfg, dev);

        let indexed = if dev.is_virtio_net() {
            let command = Command::from_bits_retain(cfg.read16(bdf, regs::COMMAND))
                | Command::IO_SPACE
                | Command::MEMORY_SPACE
                | Command::BUS_MASTER;
            cfg.write16(bdf, regs::COMMAND, command.bits());

            match walk_capabilities(cfg, dev) {
                Ok(count) => {
                    serial_println!("[pci] virtio-net {:?}: {} virtio capabilities", bdf, count);
                    true
                }
                Err(e) => {
                    serial_println!("[pci] virtio-net {:?}: capability walk failed: {}", bdf, e);
                    false
                }
            }
        } else if dev.is_virtio() {
            serial_println!("[pci] {:?}: unsupported virtio device {:#x}", bdf, dev.product_id);
            false
        } else {
            true
        };

        serial_println!("PCI: {}", dev);

        let class = dev.class as usize;
        if indexed && self.by_class[class].is_none() {
            self.by_class[class] = Some(handle);
        }
        Ok(Some(handle))
    }

    /// First device recorded with class code `class`.
    pub fn find_class(&self, class: u8) -> Option<PciHandle> {
        let handle = self.by_class[class as usize]?;
        self.devices.get(handle).map(|_| handle)
    }

    pub fn get(&self, handle: PciHandle) -> Option<&PciDevice> {
        self.devices.get(handle)
    }

    pub fn get_mut(&mut self, handle: PciHandle) -> Option<&mut PciDevice> {
        self.devices.get_mut(handle)
    }

    /// Drop a device from the table and the class index.
    pub fn release(&mut self, handle: PciHandle) -> Option<PciDevice> {
        let device = self.devices.release(handle)?;
        for entry in self.by_class.iter_mut() {
            if *entry == Some(handle) {
                *entry = None;
            }
        }
        Some(device)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PciHandle, &PciDevice)> {
        self.devices.iter()
    }
}

impl Default for PciTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Save a BAR register, write all-ones, read back the decode mask and put
/// the original value back. Returns `(original, readback)`.
fn size_register<C: ConfigSpace>(cfg: &C, bdf: Bdf, offset: u8) -> (u32, u32) {
    let original = cfg.read32(bdf, offset);
    cfg.write32(bdf, offset, 0xFFFF_FFFF);
    let readback = cfg.read32(bdf, offset);
    cfg.write32(bdf, offset, original);
    (original, readback)
}

/// Size every BAR of `dev` and record base, size and kind.
pub fn read_bars<C: ConfigSpace>(cfg: &C, dev: &mut PciDevice) {
    let bdf = dev.bdf;
    let mut offset = regs::BAR_START;

    while offset < regs::BAR_END {
        let index = regs::bar_index(offset);
        let (original, readback) = size_register(cfg, bdf, offset);

        if readback == 0 {
            offset += 4;
            continue;
        }

        let bar = if readback & regs::BAR_IO != 0 {
            let mask = readback & regs::BAR_IO_ADDR_MASK;
            offset += 4;
            Bar {
                base: (original & regs::BAR_IO_ADDR_MASK) as u64,
                size: (mask & mask.wrapping_neg()) as u64,
                kind: BarKind::Io,
            }
        } else if readback & regs::BAR_MEM_TYPE_MASK == regs::BAR_MEM_TYPE_64 && offset + 4 < regs::BAR_END {
            let (original_hi, readback_hi) = size_register(cfg, bdf, offset + 4);
            let mask = ((readback_hi as u64) << 32) | (readback & regs::BAR_MEM_ADDR_MASK) as u64;
            offset += 8;
            Bar {
                base: ((original_hi as u64) << 32) | (original & regs::BAR_MEM_ADDR_MASK) as u64,
                size: mask & mask.wrapping_neg(),
                kind: BarKind::Memory64,
            }
        } else {
            let mask = readback & regs::BAR_MEM_ADDR_MASK;
            offset += 4;
            Bar {
                base: (original & regs::BAR_MEM_ADDR_MASK) as u64,
                size: (mask & mask.wrapping_neg()) as u64,
                kind: BarKind::Memory32,
            }
        };

        if bar.is_memory() {
            dev.membase = bar.base;
            serial_println!("[pci] mem region {}: {} bytes at {:#x}", index, bar.size, bar.base);
        } else {
            dev.iobase = bar.base;
            serial_println!("[pci] io region {}: {} bytes at {:#x}", index, bar.size, bar.base);
        }

        if bar.misconfigured() {
            serial_println!(
                "[pci] {:?} ({:#x}:{:#x}) may be misconfigured: region {}: base {:#x}, size {}",
                bdf,
                dev.vendor_id,
                dev.product_id,
                index,
                bar.base,
                bar.size,
            );
        }

        dev.bars[index] = Some(bar);
    }
}
