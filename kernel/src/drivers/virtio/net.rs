/// Virtio-net driver: queue 0 receives, queue 1 transmits.
///
/// Every frame on the wire is preceded by a `virtio_net_hdr`. Transmit
/// chains are two descriptors (header, then frame); receive buffers are a
/// single device-writable descriptor of `FRAME_SIZE` bytes that holds the
/// header followed by the frame.
use core::fmt;
use core::mem::size_of;

use bitflags::bitflags;

use super::device::{VirtioDevice, VirtioHandle, VirtioTable};
use super::regs::legacy;
use super::virtqueue::BufferSegment;
use super::VirtioError;
use crate::drivers::io::PortIo;
use crate::drivers::pci::{PciDevice, PciHandle};
use crate::mem::{FrameAllocator, Mmio};
use crate::serial_println;

/// Largest frame including the virtio-net header.
pub const FRAME_SIZE: usize = 1526;
/// Receive buffers posted at start-up.
pub const RX_PRIME_COUNT: usize = 10;

pub const RX_QUEUE: u16 = 0;
pub const TX_QUEUE: u16 = 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetFeatures: u64 {
        /// Device checksums partially-checksummed packets.
        const CSUM = 1 << 0;
        const GUEST_CSUM = 1 << 1;
        const MAC = 1 << 5;
        const GSO = 1 << 6;
        const GUEST_TSO4 = 1 << 7;
        const GUEST_TSO6 = 1 << 8;
        const GUEST_ECN = 1 << 9;
        const GUEST_UFO = 1 << 10;
        const HOST_TSO4 = 1 << 11;
        const HOST_TSO6 = 1 << 12;
        const HOST_ECN = 1 << 13;
        const HOST_UFO = 1 << 14;
        const MRG_RXBUF = 1 << 15;
        const STATUS = 1 << 16;
        const CTRL_VQ = 1 << 17;
        const CTRL_RX = 1 << 18;
        const CTRL_VLAN = 1 << 19;
        const GUEST_ANNOUNCE = 1 << 21;
        const EVENT_IDX = 1 << 29;
        const VERSION_1 = 1 << 32;
    }
}

/// Feature strategy for network devices: no control queue, no receive
/// offloads, no merged buffers, checksum offload on transmit.
pub fn negotiate_net(offered: u64) -> u64 {
    let mut features = NetFeatures::from_bits_retain(offered);
    features.remove(
        NetFeatures::CTRL_VQ
            | NetFeatures::GUEST_TSO4
            | NetFeatures::GUEST_TSO6
            | NetFeatures::GUEST_UFO
            | NetFeatures::MRG_RXBUF
            | NetFeatures::EVENT_IDX,
    );
    features.insert(NetFeatures::CSUM);
    // MAC and VERSION_1 stay set exactly when offered
    features.bits()
}

pub const NET_HDR_F_NEEDS_CSUM: u8 = 1;
pub const NET_HDR_GSO_NONE: u8 = 0;

/// `struct virtio_net_hdr`. The trailing `num_buffers` is only on the
/// wire with VERSION_1 or MRG_RXBUF.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetHeader {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

static_assertions::const_assert_eq!(size_of::<NetHeader>(), 12);

pub const NET_HDR_LEN_LEGACY: usize = 10;
pub const NET_HDR_LEN: usize = 12;

impl NetHeader {
    pub fn to_bytes(&self) -> [u8; NET_HDR_LEN] {
        let mut out = [0u8; NET_HDR_LEN];
        out[0] = self.flags;
        out[1] = self.gso_type;
        out[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        out[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        out[6..8].copy_from_slice(&self.csum_start.to_le_bytes());
        out[8..10].copy_from_slice(&self.csum_offset.to_le_bytes());
        out[10..12].copy_from_slice(&self.num_buffers.to_le_bytes());
        out
    }

    /// Header length for a device with `features` negotiated.
    pub fn len_for(features: u64) -> usize {
        let features = NetFeatures::from_bits_retain(features);
        if features.intersects(NetFeatures::VERSION_1 | NetFeatures::MRG_RXBUF) {
            NET_HDR_LEN
        } else {
            NET_HDR_LEN_LEGACY
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioNetError {
    Virtio(VirtioError),
    /// Queue 0 or 1 was not set up by the device.
    MissingQueue(u16),
    /// The caller's buffer cannot hold the received frame; it was dropped.
    BufferTooSmall { needed: usize, available: usize },
}

impl fmt::Display for VirtioNetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtioNetError::Virtio(e) => write!(f, "virtio: {}", e),
            VirtioNetError::MissingQueue(i) => write!(f, "virtio-net queue {} missing", i),
            VirtioNetError::BufferTooSmall { needed, available } => {
                write!(f, "receive buffer too small ({} < {})", available, needed)
            }
        }
    }
}

impl From<VirtioError> for VirtioNetError {
    fn from(e: VirtioError) -> Self {
        VirtioNetError::Virtio(e)
    }
}

/// A configured virtio-net device.
pub struct VirtioNet<'a, M: Mmio> {
    device: &'a VirtioDevice<M>,
    handle: VirtioHandle<M>,
    header_len: usize,
    mac: [u8; 6],
}

impl<'a, M: Mmio> VirtioNet<'a, M> {
    /// Bind the PCI function to a virtio slot, bring the device up and
    /// post the initial receive buffers.
    pub fn init<P: PortIo, A: FrameAllocator>(
        table: &'a mut VirtioTable<M>,
        pci_handle: PciHandle,
        pci: &PciDevice,
        mmio: M,
        ports: &P,
        alloc: &A,
    ) -> Result<Self, VirtioNetError> {
        let handle = table.bind(pci_handle, pci, mmio)?;
        table.configure(handle, &negotiate_net, alloc)?;

        let table: &'a VirtioTable<M> = table;
        let device = table.get(handle)?;

        for queue in [RX_QUEUE, TX_QUEUE] {
            if !device.has_queue(queue) {
                serial_println!("[virtio-net] unable to initialize device: queue {} missing", queue);
                return Err(VirtioNetError::MissingQueue(queue));
            }
            device.with_queue(queue, |q| q.attach_arena(FRAME_SIZE, alloc))??;
        }

        let header_len = NetHeader::len_for(device.features());
        let mac = read_mac(device, ports);
        serial_println!(
            "[virtio-net] MAC {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}, header {} bytes",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5],
            header_len,
        );

        for _ in 0..RX_PRIME_COUNT {
            device.fill_buffer(RX_QUEUE, &[BufferSegment::writable(FRAME_SIZE as u32)])?;
        }
        device.with_queue(RX_QUEUE, |q| q.enable_interrupts())?;
        device.notify_queue(RX_QUEUE)?;

        Ok(Self {
            device,
            handle,
            header_len,
            mac,
        })
    }

    pub fn send(&self, packet: &[u8]) -> Result<(), VirtioNetError> {
        self.transmit(packet, NetHeader::default())
    }

    /// Send `packet` and have the device fill in the checksum at
    /// `start + offset`, summing from `start`.
    pub fn send_with_checksum(&self, packet: &[u8], start: u16, offset: u16) -> Result<(), VirtioNetError> {
        let header = NetHeader {
            flags: NET_HDR_F_NEEDS_CSUM,
            csum_start: start,
            csum_offset: offset,
            ..NetHeader::default()
        };
        self.transmit(packet, header)
    }

    fn transmit(&self, packet: &[u8], header: NetHeader) -> Result<(), VirtioNetError> {
        let header = header.to_bytes();
        let chain = [
            BufferSegment::readable(&header[..self.header_len]),
            BufferSegment::readable(packet),
        ];
        self.device.with_queue(TX_QUEUE, |q| {
            // Reclaim whatever the device has finished sending
            while q.pop_used().is_some() {}
            q.fill_buffer(&chain)
        })??;
        self.device.notify_queue(TX_QUEUE)?;
        Ok(())
    }

    /// Copy the next received frame, without its header, into `out`.
    /// Returns the frame length, or `None` if nothing has arrived.
    pub fn recv(&self, out: &mut [u8]) -> Result<Option<usize>, VirtioNetError> {
        let header_len = self.header_len;
        let (reposted, result) = self.device.with_queue(RX_QUEUE, |q| {
            let Some(used) = q.pop_used() else {
                return (false, Ok(None));
            };

            let len = (used.len as usize).clamp(header_len, FRAME_SIZE) - header_len;
            let copied = if len > out.len() {
                Err(VirtioNetError::BufferTooSmall {
                    needed: len,
                    available: out.len(),
                })
            } else {
                q.read_chunk(used.id, header_len, &mut out[..len])
                    .map(|()| Some(len))
                    .map_err(VirtioNetError::from)
            };

            match q.fill_buffer(&[BufferSegment::writable(FRAME_SIZE as u32)]) {
                Ok(_) => (true, copied),
                Err(e) => (false, Err(e.into())),
            }
        })?;

        if reposted {
            self.device.notify_queue(RX_QUEUE)?;
        }
        result
    }

    /// Acknowledge the device interrupt. Returns whether a received frame
    /// is waiting. Lock-free, so it may run while `recv` holds the queue.
    pub fn handle_interrupt(&self) -> bool {
        let _isr = self.device.ack_interrupt();
        self.device.has_used(RX_QUEUE)
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn irq(&self) -> u8 {
        self.device.irq
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn handle(&self) -> VirtioHandle<M> {
        self.handle
    }

    pub fn device(&self) -> &'a VirtioDevice<M> {
        self.device
    }
}

/// Read the MAC from the legacy register block, or from the device
/// config structure when there is no I/O BAR.
fn read_mac<M: Mmio, P: PortIo>(device: &VirtioDevice<M>, ports: &P) -> [u8; 6] {
    let mut mac = [0u8; 6];
    if device.io_base != 0 {
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = ports.inb(device.io_base + legacy::DEVICE_SPECIFIC + i as u16);
        }
    } else {
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = device.read_device_config8(i as u64).unwrap_or(0);
        }
    }
    mac
}
