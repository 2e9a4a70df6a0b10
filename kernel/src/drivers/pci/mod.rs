/// PCI bus driver: configuration space access, enumeration and virtio
/// capability discovery.
///
/// Only the root bus is walked. Functions are kept in a `PciTable`;
/// callers look devices up by class code (`find_class`) and get a
/// generation-checked `PciHandle` back.
mod capability;
mod config;
mod device;
mod enumerate;
pub mod mock;

#[cfg(test)]
mod tests;

use core::fmt;

use crate::slab::OutOfCapacity;

pub use capability::{read_via_cfg_window, walk_capabilities, CAP_ID_VENDOR, MAX_CAPABILITIES};
pub use config::{regs, Bdf, Command, ConfigSpace, Mechanism1};
pub use device::{
    cap_type, class_name, Bar, BarKind, CapabilityTable, PciBus, PciDevice, PciHandle, VirtioCap,
    CLASS_NAMES, CLASS_NETWORK, VIRTIO_NET_MODERN, VIRTIO_NET_TRANSITIONAL, VIRTIO_VENDOR,
};
pub use enumerate::{read_bars, PciTable, PCI_TABLE_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// The device table is full.
    OutOfCapacity,
    DeviceNotPresent,
    /// The status register does not advertise a capability list.
    NoCapabilities,
    /// Capability pointer out of range, or the list loops.
    MalformedCapabilityList,
}

impl fmt::Display for PciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PciError::OutOfCapacity => write!(f, "PCI device table full"),
            PciError::DeviceNotPresent => write!(f, "no such PCI device"),
            PciError::NoCapabilities => write!(f, "device has no capability list"),
            PciError::MalformedCapabilityList => write!(f, "malformed capability list"),
        }
    }
}

impl From<OutOfCapacity> for PciError {
    fn from(_: OutOfCapacity) -> Self {
        PciError::OutOfCapacity
    }
}
