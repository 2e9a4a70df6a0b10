/// Network-card registry.
///
/// A card is a link-layer device plus its interface configuration. The
/// kernel holds up to `NCARDS` of them; upper layers only see the
/// `NetLink` trait, never the virtio driver behind it.
use alloc::boxed::Box;
use core::fmt;

use smoltcp::wire::{EthernetAddress, Ipv4Address};

use crate::drivers::virtio::{VirtioError, VirtioNet, VirtioNetError};
use crate::mem::Mmio;
use crate::slab::{Handle, OutOfCapacity, Slab};

pub const NCARDS: usize = 10;

/// Raw Ethernet frame transport.
pub trait NetLink {
    fn mac(&self) -> [u8; 6];

    /// Queue one frame for transmission.
    fn send(&self, frame: &[u8]) -> Result<(), LinkError>;

    /// Copy the next received frame into `out`. `Ok(None)` when nothing
    /// is waiting.
    fn recv(&self, out: &mut [u8]) -> Result<Option<usize>, LinkError>;

    fn ethernet_address(&self) -> EthernetAddress {
        EthernetAddress(self.mac())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// No room on the transmit ring right now.
    Busy,
    /// The frame was dropped because `out` could not hold it.
    Truncated { needed: usize },
    Device,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Busy => write!(f, "link busy"),
            LinkError::Truncated { needed } => write!(f, "frame of {} bytes dropped", needed),
            LinkError::Device => write!(f, "link device error"),
        }
    }
}

impl From<VirtioNetError> for LinkError {
    fn from(e: VirtioNetError) -> Self {
        match e {
            VirtioNetError::Virtio(VirtioError::QueueFull) => LinkError::Busy,
            VirtioNetError::BufferTooSmall { needed, .. } => LinkError::Truncated { needed },
            _ => LinkError::Device,
        }
    }
}

impl<M: Mmio> NetLink for VirtioNet<'_, M> {
    fn mac(&self) -> [u8; 6] {
        VirtioNet::mac(self)
    }

    fn send(&self, frame: &[u8]) -> Result<(), LinkError> {
        Ok(VirtioNet::send(self, frame)?)
    }

    fn recv(&self, out: &mut [u8]) -> Result<Option<usize>, LinkError> {
        Ok(VirtioNet::recv(self, out)?)
    }
}

/// Per-card interface configuration. Unset until an address is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetConf {
    pub ip: Ipv4Address,
    pub subnetmask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub vlan: u16,
}

impl Default for NetConf {
    fn default() -> Self {
        Self {
            ip: Ipv4Address::UNSPECIFIED,
            subnetmask: Ipv4Address::UNSPECIFIED,
            gateway: Ipv4Address::UNSPECIFIED,
            vlan: 0,
        }
    }
}

impl NetConf {
    /// Prefix length of `subnetmask`.
    pub fn prefix_len(&self) -> u8 {
        u32::from_be_bytes(self.subnetmask.0).leading_ones() as u8
    }
}

pub struct NetCard<'a> {
    pub conf: NetConf,
    link: Box<dyn NetLink + 'a>,
}

impl<'a> NetCard<'a> {
    pub fn link(&self) -> &(dyn NetLink + 'a) {
        &*self.link
    }
}

pub type CardHandle<'a> = Handle<NetCard<'a>>;

pub struct CardTable<'a> {
    cards: Slab<NetCard<'a>, NCARDS>,
}

impl<'a> CardTable<'a> {
    pub fn new() -> Self {
        Self { cards: Slab::new() }
    }

    /// Take a card slot for `link` with an empty configuration.
    pub fn register_device<L: NetLink + 'a>(&mut self, link: L) -> Result<CardHandle<'a>, OutOfCapacity> {
        self.cards.alloc(NetCard {
            conf: NetConf::default(),
            link: Box::new(link),
        })
    }

    pub fn get(&self, handle: CardHandle<'a>) -> Option<&NetCard<'a>> {
        self.cards.get(handle)
    }

    pub fn get_mut(&mut self, handle: CardHandle<'a>) -> Option<&mut NetCard<'a>> {
        self.cards.get_mut(handle)
    }

    pub fn is_full(&self) -> bool {
        self.cards.len() == NCARDS
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CardHandle<'a>, &NetCard<'a>)> {
        self.cards.iter()
    }
}

impl Default for CardTable<'_> {
    fn default() -> Self {
        Self::new()
    }
}
