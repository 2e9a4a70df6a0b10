/// In-memory configuration space for host tests.
///
/// Each function present on the fake bus has 256 bytes of configuration
/// space. Absent functions read as all-ones. BAR registers answer an
/// all-ones write with their decode mask, like real hardware, and only
/// the command half of the command/status register is writable.
use alloc::collections::BTreeMap;
use spin::Mutex;

use super::config::{regs, Bdf, ConfigSpace};
use super::capability::CAP_ID_VENDOR;
use super::device::cap_type;

struct Function {
    bytes: [u8; 256],
    /// Readback after an all-ones write, per BAR register.
    bar_masks: [Option<u32>; 6],
    /// Set after an all-ones write until the next write.
    bar_probed: [bool; 6],
}

impl Function {
    fn new() -> Self {
        Self {
            bytes: [0; 256],
            bar_masks: [None; 6],
            bar_probed: [false; 6],
        }
    }

    fn get32(&self, offset: u8) -> u32 {
        let o = (offset & 0xFC) as usize;
        u32::from_le_bytes([self.bytes[o], self.bytes[o + 1], self.bytes[o + 2], self.bytes[o + 3]])
    }

    fn set32(&mut self, offset: u8, val: u32) {
        let o = (offset & 0xFC) as usize;
        self.bytes[o..o + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn set_bytes(&mut self, offset: u8, data: &[u8]) {
        let o = offset as usize;
        self.bytes[o..o + data.len()].copy_from_slice(data);
    }
}

#[derive(Default)]
pub struct FakeConfigSpace {
    functions: Mutex<BTreeMap<Bdf, Function>>,
}

impl FakeConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, bdf: Bdf, f: impl FnOnce(&mut Function) -> R) -> R {
        let mut functions = self.functions.lock();
        f(functions.entry(bdf).or_insert_with(Function::new))
    }

    /// Plug in a type-0 function.
    pub fn add_function(&self, bdf: Bdf, vendor: u16, product: u16, class: u8, subclass: u8) {
        self.with(bdf, |f| {
            f.set32(regs::ID, (product as u32) << 16 | vendor as u32);
            f.set32(regs::CLASS, (class as u32) << 24 | (subclass as u32) << 16);
        });
    }

    /// Set the multifunction bit in function 0's header type.
    pub fn set_multifunction(&self, bus: u8, device: u8) {
        self.with(Bdf::new(bus, device, 0), |f| f.bytes[0x0E] |= 0x80);
    }

    pub fn set_header_type(&self, bdf: Bdf, header_type: u8) {
        self.with(bdf, |f| f.bytes[0x0E] = (f.bytes[0x0E] & 0x80) | header_type);
    }

    pub fn set_irq(&self, bdf: Bdf, line: u8, pin: u8) {
        self.with(bdf, |f| f.set_bytes(regs::INTERRUPT, &[line, pin]));
    }

    /// Program a BAR register with `value` that reads back `mask` when
    /// sized.
    pub fn set_bar_raw(&self, bdf: Bdf, index: usize, value: u32, mask: u32) {
        self.with(bdf, |f| {
            f.set32(regs::BAR_START + 4 * index as u8, value);
            f.bar_masks[index] = Some(mask);
        });
    }

    pub fn add_mem_bar(&self, bdf: Bdf, index: usize, base: u32, size: u32) {
        self.set_bar_raw(bdf, index, base, !(size - 1) & regs::BAR_MEM_ADDR_MASK);
    }

    /// 64-bit memory BAR occupying registers `index` and `index + 1`.
    pub fn add_mem64_bar(&self, bdf: Bdf, index: usize, base: u64, size: u64) {
        let mask = !(size - 1);
        self.set_bar_raw(
            bdf,
            index,
            base as u32 | regs::BAR_MEM_TYPE_64,
            (mask as u32 & regs::BAR_MEM_ADDR_MASK) | regs::BAR_MEM_TYPE_64,
        );
        self.set_bar_raw(bdf, index + 1, (base >> 32) as u32, (mask >> 32) as u32);
    }

    pub fn add_io_bar(&self, bdf: Bdf, index: usize, base: u32, size: u32) {
        self.set_bar_raw(
            bdf,
            index,
            base | regs::BAR_IO,
            (!(size - 1) & 0xFFFF & regs::BAR_IO_ADDR_MASK) | regs::BAR_IO,
        );
    }

    /// Append a capability with header `id` at `pointer`; `body` starts
    /// at the byte after the next pointer.
    pub fn add_capability(&self, bdf: Bdf, pointer: u8, id: u8, body: &[u8]) {
        self.with(bdf, |f| {
            f.bytes[regs::STATUS as usize] |= regs::STATUS_CAP_LIST as u8;
            f.set_bytes(pointer, &[id, 0]);
            f.set_bytes(pointer + 2, body);

            let head = f.bytes[regs::CAP_PTR as usize];
            if head == 0 {
                f.bytes[regs::CAP_PTR as usize] = pointer;
                return;
            }
            let mut last = head;
            while f.bytes[last as usize + 1] != 0 {
                last = f.bytes[last as usize + 1];
            }
            f.bytes[last as usize + 1] = pointer;
        });
    }

    /// Append a `virtio_pci_cap`.
    pub fn add_virtio_cap(&self, bdf: Bdf, pointer: u8, cfg_type: u8, bar: u8, offset: u32, length: u32) {
        let mut body = [0u8; 14];
        body[0] = 16;
        body[1] = cfg_type;
        body[2] = bar;
        body[6..10].copy_from_slice(&offset.to_le_bytes());
        body[10..14].copy_from_slice(&length.to_le_bytes());
        self.add_capability(bdf, pointer, CAP_ID_VENDOR, &body);
    }

    /// Append a `virtio_pci_notify_cap`.
    pub fn add_notify_cap(&self, bdf: Bdf, pointer: u8, bar: u8, offset: u32, length: u32, multiplier: u32) {
        self.add_virtio_cap(bdf, pointer, cap_type::NOTIFY_CFG, bar, offset, length);
        self.with(bdf, |f| {
            f.bytes[pointer as usize + 2] = 20;
            f.set_bytes(pointer + 16, &multiplier.to_le_bytes());
        });
    }

    /// Overwrite raw bytes, for building broken lists.
    pub fn poke(&self, bdf: Bdf, offset: u8, data: &[u8]) {
        self.with(bdf, |f| f.set_bytes(offset, data));
    }

    /// Raw dword, bypassing BAR emulation.
    pub fn peek32(&self, bdf: Bdf, offset: u8) -> u32 {
        self.functions
            .lock()
            .get(&bdf)
            .map(|f| f.get32(offset))
            .unwrap_or(0xFFFF_FFFF)
    }

    pub fn command(&self, bdf: Bdf) -> u16 {
        self.peek32(bdf, regs::COMMAND) as u16
    }
}

fn bar_slot(offset: u8) -> Option<usize> {
    (regs::BAR_START..regs::BAR_END)
        .contains(&offset)
        .then(|| regs::bar_index(offset & 0xFC))
}

impl ConfigSpace for FakeConfigSpace {
    fn read32(&self, bdf: Bdf, offset: u8) -> u32 {
        let functions = self.functions.lock();
        let Some(f) = functions.get(&bdf) else {
            return 0xFFFF_FFFF;
        };
        if let Some(slot) = bar_slot(offset) {
            if f.bar_probed[slot] {
                return f.bar_masks[slot].unwrap_or(0);
            }
        }
        f.get32(offset)
    }

    fn write32(&self, bdf: Bdf, offset: u8, val: u32) {
        let mut functions = self.functions.lock();
        let Some(f) = functions.get_mut(&bdf) else {
            return;
        };
        if let Some(slot) = bar_slot(offset) {
            if f.bar_masks[slot].is_none() {
                return;
            }
            f.bar_probed[slot] = val == 0xFFFF_FFFF;
            if !f.bar_probed[slot] {
                f.set32(offset, val);
            }
            return;
        }
        if offset & 0xFC == regs::COMMAND {
            // Status is read-only here
            f.set_bytes(regs::COMMAND, &(val as u16).to_le_bytes());
            return;
        }
        f.set32(offset, val);
    }
}

/// Layout used by `add_virtio_net`.
pub mod virtio_layout {
    pub const IRQ_LINE: u8 = 11;
    pub const IO_BAR: usize = 0;
    pub const IO_SIZE: u32 = 0x20;
    pub const MEM_BAR: u8 = 4;
    pub const MEM_SIZE: u64 = 0x4000;
    pub const COMMON_OFFSET: u32 = 0x0000;
    pub const ISR_OFFSET: u32 = 0x1000;
    pub const DEVICE_OFFSET: u32 = 0x2000;
    pub const NOTIFY_OFFSET: u32 = 0x3000;
    pub const NOTIFY_MULTIPLIER: u32 = 4;
}

impl FakeConfigSpace {
    /// Plug in a virtio network function the way QEMU lays one out:
    /// optional legacy I/O BAR 0, 64-bit memory BAR 4 at `mem_base`, and
    /// the five virtio capabilities.
    pub fn add_virtio_net(&self, bdf: Bdf, product: u16, mem_base: u64, io_base: Option<u32>) {
        use virtio_layout::*;

        self.add_function(bdf, super::VIRTIO_VENDOR, product, super::CLASS_NETWORK, 0);
        self.set_irq(bdf, IRQ_LINE, 1);
        if let Some(io) = io_base {
            self.add_io_bar(bdf, IO_BAR, io, IO_SIZE);
        }
        self.add_mem64_bar(bdf, MEM_BAR as usize, mem_base, MEM_SIZE);

        self.add_virtio_cap(bdf, 0x40, cap_type::COMMON_CFG, MEM_BAR, COMMON_OFFSET, 0x38);
        self.add_virtio_cap(bdf, 0x54, cap_type::ISR_CFG, MEM_BAR, ISR_OFFSET, 0x4);
        self.add_virtio_cap(bdf, 0x68, cap_type::DEVICE_CFG, MEM_BAR, DEVICE_OFFSET, 0x10);
        self.add_notify_cap(bdf, 0x7C, MEM_BAR, NOTIFY_OFFSET, 0x1000, NOTIFY_MULTIPLIER);
        self.add_virtio_cap(bdf, 0x94, cap_type::PCI_CFG, 0, 0, 0);
    }
}
