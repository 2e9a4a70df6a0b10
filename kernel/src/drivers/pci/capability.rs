/// Capability list walker.
///
/// Follows the linked list that starts at the capability pointer and
/// records the vendor-specific (virtio) entries of each `cfg_type`.
use super::config::{regs, ConfigSpace};
use super::device::{cap_type, PciDevice, VirtioCap};
use super::PciError;
use crate::serial_println;

pub const CAP_ID_VENDOR: u8 = 0x09;

/// Headers are dword aligned and live in 0x40..=0xFF, so a longer walk
/// must be going round in a loop.
pub const MAX_CAPABILITIES: usize = 48;

/// Offsets within a `virtio_pci_cap`.
mod virtio_cap {
    pub const CFG_TYPE: u8 = 3;
    pub const BAR: u8 = 4;
    pub const OFFSET: u8 = 8;
    pub const LENGTH: u8 = 12;
    /// `notify_off_multiplier`, only in the notify capability.
    pub const NOTIFY_MULTIPLIER: u8 = 16;
    /// `pci_cfg_data`, only in the PCI configuration access capability.
    pub const PCI_CFG_DATA: u8 = 16;
    /// Largest virtio capability (notify / pci-cfg).
    pub const SIZE: usize = 20;
}

/// Walk `device`'s capability list and record its virtio capabilities.
/// Returns how many entries were recorded.
pub fn walk_capabilities<C: ConfigSpace>(cfg: &C, device: &mut PciDevice) -> Result<usize, PciError> {
    let bdf = device.bdf;

    if cfg.read16(bdf, regs::STATUS) & regs::STATUS_CAP_LIST == 0 {
        return Err(PciError::NoCapabilities);
    }

    let mut pointer = cfg.read8(bdf, regs::CAP_PTR) & regs::CAP_PTR_MASK;
    let mut recorded = 0;
    let mut visited = 0;

    while pointer != 0 {
        visited += 1;
        if visited > MAX_CAPABILITIES || pointer < 0x40 {
            serial_println!("[pci] {:?}: malformed capability list at {:#x}", bdf, pointer);
            return Err(PciError::MalformedCapabilityList);
        }

        let id = cfg.read8(bdf, pointer + regs::CAP_ID);
        let next = cfg.read8(bdf, pointer + regs::CAP_NEXT) & regs::CAP_PTR_MASK;

        if id == CAP_ID_VENDOR {
            if pointer as usize + virtio_cap::SIZE > 0x100 {
                return Err(PciError::MalformedCapabilityList);
            }
            let kind = cfg.read8(bdf, pointer + virtio_cap::CFG_TYPE);
            if (cap_type::COMMON_CFG..=cap_type::PCI_CFG).contains(&kind) {
                let cap = VirtioCap {
                    pointer,
                    bar: cfg.read8(bdf, pointer + virtio_cap::BAR),
                    offset: cfg.read32(bdf, pointer + virtio_cap::OFFSET),
                    length: cfg.read32(bdf, pointer + virtio_cap::LENGTH),
                };
                if device.caps.insert(kind, cap) {
                    if kind == cap_type::NOTIFY_CFG {
                        let multiplier = cfg.read32(bdf, pointer + virtio_cap::NOTIFY_MULTIPLIER);
                        device.caps.set_notify_off_multiplier(multiplier);
                    }
                    serial_println!(
                        "[pci] cap: {} bar: {} offset: {:#x}",
                        cap_type::name(kind),
                        cap.bar,
                        cap.offset,
                    );
                    recorded += 1;
                }
            }
        }

        pointer = next;
    }

    Ok(recorded)
}

/// Read a dword of BAR `bar` at `offset` through the PCI configuration
/// access capability, for when the BAR itself is not mapped.
pub fn read_via_cfg_window<C: ConfigSpace>(
    cfg: &C,
    device: &PciDevice,
    bar: u8,
    offset: u32,
) -> Result<u32, PciError> {
    let cap = device
        .caps
        .get(cap_type::PCI_CFG)
        .ok_or(PciError::NoCapabilities)?;
    let bdf = device.bdf;

    cfg.write8(bdf, cap.pointer + virtio_cap::BAR, bar);
    cfg.write32(bdf, cap.pointer + virtio_cap::LENGTH, 4);
    cfg.write32(bdf, cap.pointer + virtio_cap::OFFSET, offset);
    Ok(cfg.read32(bdf, cap.pointer + virtio_cap::PCI_CFG_DATA))
}
