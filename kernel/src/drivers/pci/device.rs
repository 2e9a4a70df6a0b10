/// A discovered PCI function and what enumeration learned about it.
use core::fmt;

use super::config::Bdf;
use crate::slab::Handle;

pub type PciHandle = Handle<PciDevice>;

pub const VIRTIO_VENDOR: u16 = 0x1AF4;
/// Transitional (legacy-capable) virtio network device.
pub const VIRTIO_NET_TRANSITIONAL: u16 = 0x1000;
/// Modern-only virtio network device (0x1040 + device type 1).
pub const VIRTIO_NET_MODERN: u16 = 0x1041;

pub const CLASS_NETWORK: u8 = 0x02;

/// Names of the base classes, indexed by class code.
pub const CLASS_NAMES: [&str; 18] = [
    "Unclassified",
    "Mass storage controller",
    "Network controller",
    "Display controller",
    "Multimedia controller",
    "Memory controller",
    "Bridge device",
    "Simple communication controller",
    "Base system peripheral",
    "Input device controller",
    "Docking station",
    "Processor",
    "Serial bus controller",
    "Wireless controller",
    "Intelligent controller",
    "Satellite communication controller",
    "Encryption controller",
    "Signal processing controller",
];

pub fn class_name(class: u8) -> &'static str {
    CLASS_NAMES.get(class as usize).copied().unwrap_or("Unknown")
}

/// Virtio PCI capability `cfg_type` values.
pub mod cap_type {
    pub const COMMON_CFG: u8 = 1;
    pub const NOTIFY_CFG: u8 = 2;
    pub const ISR_CFG: u8 = 3;
    pub const DEVICE_CFG: u8 = 4;
    pub const PCI_CFG: u8 = 5;

    pub fn name(cfg_type: u8) -> &'static str {
        match cfg_type {
            COMMON_CFG => "common",
            NOTIFY_CFG => "notify",
            ISR_CFG => "isr",
            DEVICE_CFG => "device",
            PCI_CFG => "pci-cfg",
            _ => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    Memory32,
    Memory64,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bar {
    pub base: u64,
    pub size: u64,
    pub kind: BarKind,
}

impl Bar {
    pub fn is_memory(&self) -> bool {
        matches!(self.kind, BarKind::Memory32 | BarKind::Memory64)
    }

    /// The device decodes a window but nobody assigned it an address.
    pub fn misconfigured(&self) -> bool {
        self.size != 0 && self.base == 0
    }
}

/// Where a virtio configuration structure lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioCap {
    /// Offset of the capability in configuration space.
    pub pointer: u8,
    pub bar: u8,
    /// Offset of the structure within the BAR.
    pub offset: u32,
    pub length: u32,
}

/// Virtio capabilities of one function, indexed by `cfg_type` (1..=5).
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: [Option<VirtioCap>; 5],
    notify_off_multiplier: u32,
}

impl CapabilityTable {
    pub fn get(&self, cfg_type: u8) -> Option<&VirtioCap> {
        let slot = (cfg_type as usize).checked_sub(1)?;
        self.entries.get(slot)?.as_ref()
    }

    /// Record `cap` unless this type was already seen. Returns whether it
    /// was recorded.
    pub fn insert(&mut self, cfg_type: u8, cap: VirtioCap) -> bool {
        let Some(entry) = (cfg_type as usize)
            .checked_sub(1)
            .and_then(|i| self.entries.get_mut(i))
        else {
            return false;
        };
        if entry.is_some() {
            return false;
        }
        *entry = Some(cap);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_off_multiplier(&self) -> u32 {
        self.notify_off_multiplier
    }

    pub fn set_notify_off_multiplier(&mut self, multiplier: u32) {
        self.notify_off_multiplier = multiplier;
    }
}

/// A bus and the bridge that leads to it (`None` for the root bus).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciBus {
    pub bus_num: u8,
    pub parent: Option<PciHandle>,
}

impl PciBus {
    pub const fn root() -> Self {
        Self {
            bus_num: 0,
            parent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PciDevice {
    pub bdf: Bdf,
    pub bus: PciBus,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub bars: [Option<Bar>; 6],
    pub caps: CapabilityTable,
    pub irq_line: u8,
    pub irq_pin: u8,
    /// Base of the last memory BAR seen.
    pub membase: u64,
    /// Base of the last I/O BAR seen.
    pub iobase: u64,
}

impl PciDevice {
    pub fn new(bus: PciBus, device: u8, function: u8) -> Self {
        Self {
            bdf: Bdf::new(bus.bus_num, device, function),
            bus,
            vendor_id: 0,
            product_id: 0,
            class: 0,
            subclass: 0,
            bars: [None; 6],
            caps: CapabilityTable::default(),
            irq_line: 0,
            irq_pin: 0,
            membase: 0,
            iobase: 0,
        }
    }

    pub fn bar(&self, index: u8) -> Option<&Bar> {
        self.bars.get(index as usize)?.as_ref()
    }

    pub fn class_name(&self) -> &'static str {
        class_name(self.class)
    }

    pub fn is_virtio(&self) -> bool {
        self.vendor_id == VIRTIO_VENDOR
    }

    pub fn is_virtio_net(&self) -> bool {
        self.is_virtio()
            && matches!(self.product_id, VIRTIO_NET_TRANSITIONAL | VIRTIO_NET_MODERN)
    }
}

/// `bus:dev.func: vendor:product: class: c.s (name) irq: n`
impl fmt::Display for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}:{:x}.{}: {:#x}:{:#x}: class: {:x}.{:x} ({}) irq: {}",
            self.bdf.bus,
            self.bdf.device,
            self.bdf.function,
            self.vendor_id,
            self.product_id,
            self.class,
            self.subclass,
            self.class_name(),
            self.irq_line,
        )
    }
}
