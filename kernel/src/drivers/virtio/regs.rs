/// Virtio 1.0 PCI transport registers.
///
/// The common configuration structure sits in a memory BAR at the offset
/// named by the COMMON_CFG capability. Every field is accessed at its own
/// width; the three 64-bit queue addresses are written as two dwords.
use core::mem::{offset_of, size_of};

use bitflags::bitflags;

use crate::mem::Mmio;

/// `struct virtio_pci_common_cfg`, byte for byte.
#[repr(C)]
pub struct VirtioPciCommonCfg {
    pub device_feature_select: u32,
    pub device_feature: u32,
    pub driver_feature_select: u32,
    pub driver_feature: u32,
    pub msix_config: u16,
    pub num_queues: u16,
    pub device_status: u8,
    pub config_generation: u8,
    pub queue_select: u16,
    pub queue_size: u16,
    pub queue_msix_vector: u16,
    pub queue_enable: u16,
    pub queue_notify_off: u16,
    pub queue_desc: u64,
    pub queue_driver: u64,
    pub queue_device: u64,
}

static_assertions::const_assert_eq!(size_of::<VirtioPciCommonCfg>(), 56);
static_assertions::const_assert_eq!(offset_of!(VirtioPciCommonCfg, msix_config), 16);
static_assertions::const_assert_eq!(offset_of!(VirtioPciCommonCfg, device_status), 20);
static_assertions::const_assert_eq!(offset_of!(VirtioPciCommonCfg, queue_select), 22);
static_assertions::const_assert_eq!(offset_of!(VirtioPciCommonCfg, queue_notify_off), 30);
static_assertions::const_assert_eq!(offset_of!(VirtioPciCommonCfg, queue_desc), 32);
static_assertions::const_assert_eq!(offset_of!(VirtioPciCommonCfg, queue_device), 48);

/// Field offsets within the common configuration structure.
pub mod common {
    use super::VirtioPciCommonCfg as C;
    use core::mem::offset_of;

    pub const DEVICE_FEATURE_SELECT: u64 = offset_of!(C, device_feature_select) as u64;
    pub const DEVICE_FEATURE: u64 = offset_of!(C, device_feature) as u64;
    pub const DRIVER_FEATURE_SELECT: u64 = offset_of!(C, driver_feature_select) as u64;
    pub const DRIVER_FEATURE: u64 = offset_of!(C, driver_feature) as u64;
    pub const MSIX_CONFIG: u64 = offset_of!(C, msix_config) as u64;
    pub const NUM_QUEUES: u64 = offset_of!(C, num_queues) as u64;
    pub const DEVICE_STATUS: u64 = offset_of!(C, device_status) as u64;
    pub const CONFIG_GENERATION: u64 = offset_of!(C, config_generation) as u64;
    pub const QUEUE_SELECT: u64 = offset_of!(C, queue_select) as u64;
    pub const QUEUE_SIZE: u64 = offset_of!(C, queue_size) as u64;
    pub const QUEUE_MSIX_VECTOR: u64 = offset_of!(C, queue_msix_vector) as u64;
    pub const QUEUE_ENABLE: u64 = offset_of!(C, queue_enable) as u64;
    pub const QUEUE_NOTIFY_OFF: u64 = offset_of!(C, queue_notify_off) as u64;
    pub const QUEUE_DESC: u64 = offset_of!(C, queue_desc) as u64;
    pub const QUEUE_DRIVER: u64 = offset_of!(C, queue_driver) as u64;
    pub const QUEUE_DEVICE: u64 = offset_of!(C, queue_device) as u64;
}

/// Legacy I/O-port register block (BAR 0 of a transitional device).
pub mod legacy {
    pub const ISR_STATUS: u16 = 0x13;
    /// Start of the device-specific config; the MAC lives here for net.
    pub const DEVICE_SPECIFIC: u16 = 0x14;
}

bitflags! {
    /// Device status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

/// Feature bits common to every device type.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// ISR status bits.
pub const ISR_QUEUE: u8 = 1;
pub const ISR_CONFIG: u8 = 2;

/// The common configuration block of one device, at `base`.
pub struct CommonCfg<M: Mmio> {
    mmio: M,
    base: u64,
}

impl<M: Mmio> CommonCfg<M> {
    pub fn new(mmio: M, base: u64) -> Self {
        Self { mmio, base }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn mmio(&self) -> &M {
        &self.mmio
    }

    pub fn device_status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.mmio.read8(self.base + common::DEVICE_STATUS))
    }

    pub fn set_device_status(&self, status: DeviceStatus) {
        self.mmio.write8(self.base + common::DEVICE_STATUS, status.bits());
    }

    /// All 64 offered feature bits, read one half at a time.
    pub fn device_features(&self) -> u64 {
        self.mmio.write32(self.base + common::DEVICE_FEATURE_SELECT, 0);
        let lo = self.mmio.read32(self.base + common::DEVICE_FEATURE) as u64;
        self.mmio.write32(self.base + common::DEVICE_FEATURE_SELECT, 1);
        let hi = self.mmio.read32(self.base + common::DEVICE_FEATURE) as u64;
        (hi << 32) | lo
    }

    pub fn set_driver_features(&self, features: u64) {
        self.mmio.write32(self.base + common::DRIVER_FEATURE_SELECT, 0);
        self.mmio.write32(self.base + common::DRIVER_FEATURE, features as u32);
        self.mmio.write32(self.base + common::DRIVER_FEATURE_SELECT, 1);
        self.mmio.write32(self.base + common::DRIVER_FEATURE, (features >> 32) as u32);
    }

    pub fn num_queues(&self) -> u16 {
        self.mmio.read16(self.base + common::NUM_QUEUES)
    }

    pub fn config_generation(&self) -> u8 {
        self.mmio.read8(self.base + common::CONFIG_GENERATION)
    }

    pub fn select_queue(&self, index: u16) {
        self.mmio.write16(self.base + common::QUEUE_SELECT, index);
    }

    /// Size of the selected queue; 0 if it does not exist.
    pub fn queue_size(&self) -> u16 {
        self.mmio.read16(self.base + common::QUEUE_SIZE)
    }

    pub fn queue_notify_off(&self) -> u16 {
        self.mmio.read16(self.base + common::QUEUE_NOTIFY_OFF)
    }

    /// Publish the three ring addresses of the selected queue.
    pub fn set_queue_addresses(&self, desc: u64, driver: u64, device: u64) {
        self.mmio.write64(self.base + common::QUEUE_DESC, desc);
        self.mmio.write64(self.base + common::QUEUE_DRIVER, driver);
        self.mmio.write64(self.base + common::QUEUE_DEVICE, device);
    }

    pub fn enable_queue(&self) {
        self.mmio.write16(self.base + common::QUEUE_ENABLE, 1);
    }
}
