/// Virtio over PCI, virtio 1.0 (modern) transport.
///
/// Virtio is the standard paravirtualized I/O framework. QEMU exposes
/// virtio-net as a PCI function whose capabilities point at the common
/// configuration, notify, ISR and device-specific structures in a memory
/// BAR. `device` drives the status state machine, `virtqueue` owns the
/// split rings and `net` turns queues 0 and 1 into a network link.
pub mod device;
pub mod mock;
pub mod net;
pub mod regs;
pub mod virtqueue;


use core::fmt;

use crate::mem::AllocError;
use crate::slab::OutOfCapacity;

pub use device::{FeatureNegotiator, VirtioDevice, VirtioHandle, VirtioTable, MAX_QUEUES, VIRTIO_TABLE_CAPACITY};
pub use net::{negotiate_net, NetFeatures, NetHeader, VirtioNet, VirtioNetError, FRAME_SIZE, RX_PRIME_COUNT};
pub use regs::DeviceStatus;
pub use virtqueue::{BufferSegment, DescFlags, RingLayout, UsedBuffer, VirtQueue, VirtqDesc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// Device table full, or queue index beyond `MAX_QUEUES`.
    OutOfCapacity,
    /// The handle's slot has been recycled.
    StaleHandle,
    /// FEATURES_OK did not stick.
    FeaturesRejected,
    /// The device reports size 0 for this queue.
    QueueAbsent(u16),
    InvalidQueueSize(u16),
    /// Not enough free descriptors for the chain.
    QueueFull,
    EmptyChain,
    /// A segment does not fit in one arena chunk.
    SegmentTooLarge,
    /// A segment's `len` disagrees with the data it carries.
    SegmentLengthMismatch,
    /// A capability the transport cannot work without is absent.
    MissingCapability(u8),
    /// The queue has no data arena yet.
    NoArena(u16),
    OutOfMemory,
}

impl fmt::Display for VirtioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtioError::OutOfCapacity => write!(f, "virtio device table full"),
            VirtioError::StaleHandle => write!(f, "stale virtio device handle"),
            VirtioError::FeaturesRejected => write!(f, "device rejected negotiated features"),
            VirtioError::QueueAbsent(i) => write!(f, "virtqueue {} not available", i),
            VirtioError::InvalidQueueSize(s) => write!(f, "invalid virtqueue size {}", s),
            VirtioError::QueueFull => write!(f, "virtqueue full"),
            VirtioError::EmptyChain => write!(f, "empty descriptor chain"),
            VirtioError::SegmentTooLarge => write!(f, "segment larger than buffer chunk"),
            VirtioError::SegmentLengthMismatch => write!(f, "segment length does not match its data"),
            VirtioError::MissingCapability(t) => write!(f, "missing virtio capability type {}", t),
            VirtioError::NoArena(i) => write!(f, "virtqueue {} has no buffers", i),
            VirtioError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl From<AllocError> for VirtioError {
    fn from(_: AllocError) -> Self {
        VirtioError::OutOfMemory
    }
}

impl From<OutOfCapacity> for VirtioError {
    fn from(_: OutOfCapacity) -> Self {
        VirtioError::OutOfCapacity
    }
}
