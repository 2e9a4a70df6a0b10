/// Link layer: network cards and the smoltcp device adapter.
///
///   virtio-net driver (raw Ethernet frames)
///       ↓ ↑
///   NetLink (registered in the CardTable)
///       ↓ ↑
///   LinkDevice (implements smoltcp::phy::Device)
///
/// `net_init` is the boot path that finds the network function on the
/// PCI bus, brings up its driver and registers it as a card.
pub mod card;
mod device;

#[cfg(test)]
mod tests;

use core::fmt;

pub use card::{CardHandle, CardTable, LinkError, NetCard, NetConf, NetLink, NCARDS};
pub use device::{LinkDevice, RxToken, TxToken, MTU};

use crate::drivers::io::{IrqController, PortIo};
use crate::drivers::pci::{ConfigSpace, PciBus, PciError, PciTable, CLASS_NETWORK};
use crate::drivers::virtio::{VirtioNet, VirtioNetError, VirtioTable};
use crate::mem::{FrameAllocator, Mmio};
use crate::serial_println;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetInitError {
    Pci(PciError),
    /// No function of class 0x02 on the bus.
    NoNetworkDevice,
    Driver(VirtioNetError),
    /// Every card slot is taken.
    NoCardSlot,
}

impl fmt::Display for NetInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetInitError::Pci(e) => write!(f, "pci: {}", e),
            NetInitError::NoNetworkDevice => write!(f, "no network device found"),
            NetInitError::Driver(e) => write!(f, "{}", e),
            NetInitError::NoCardSlot => write!(f, "unable to allocate netcard"),
        }
    }
}

impl From<PciError> for NetInitError {
    fn from(e: PciError) -> Self {
        NetInitError::Pci(e)
    }
}

impl From<VirtioNetError> for NetInitError {
    fn from(e: VirtioNetError) -> Self {
        NetInitError::Driver(e)
    }
}

/// Bring up the first network function on the root bus.
///
/// Enumerates the bus into `pci`, binds the network function in
/// `virtio`, enables its interrupt line and registers the link in
/// `cards`.
#[allow(clippy::too_many_arguments)]
pub fn net_init<'a, C, M, P, A, I>(
    cfg: &C,
    pci: &mut PciTable,
    virtio: &'a mut VirtioTable<M>,
    cards: &mut CardTable<'a>,
    mmio: M,
    ports: &P,
    alloc: &A,
    irq: &I,
) -> Result<CardHandle<'a>, NetInitError>
where
    C: ConfigSpace,
    M: Mmio + 'a,
    P: PortIo,
    A: FrameAllocator,
    I: IrqController,
{
    if cards.is_full() {
        serial_println!("[net] unable to allocate netcard");
        return Err(NetInitError::NoCardSlot);
    }

    if pci.is_empty() {
        pci.enumerate(cfg, PciBus::root())?;
    }

    let Some(handle) = pci.find_class(CLASS_NETWORK) else {
        serial_println!("[net] no network device found");
        return Err(NetInitError::NoNetworkDevice);
    };
    let device = pci.get(handle).ok_or(NetInitError::NoNetworkDevice)?;

    let link = VirtioNet::init(virtio, handle, device, mmio, ports, alloc)?;
    irq.enable_irq(link.irq());

    let card = cards.register_device(link).map_err(|_| NetInitError::NoCardSlot)?;
    serial_println!("[net] card {} up", card.index());
    Ok(card)
}
