/// Virtio device table and the device status state machine.
///
/// A virtio device is bound to a PCI function's memory window once, then
/// configured in one pass: reset, acknowledge, negotiate features, set up
/// queues, DRIVER_OK. After that the table is only read; each queue sits
/// behind its own lock so a sender and the interrupt path can work on
/// different queues at once.
use core::ptr;
use core::sync::atomic::{fence, AtomicU16, AtomicUsize, Ordering};
use spin::Mutex;

use super::regs::{CommonCfg, DeviceStatus};
use super::virtqueue::{BufferSegment, VirtQueue};
use super::VirtioError;
use crate::drivers::pci::{cap_type, PciDevice, PciHandle};
use crate::mem::{FrameAllocator, Mmio};
use crate::serial_println;
use crate::slab::{Handle, Slab};

pub const VIRTIO_TABLE_CAPACITY: usize = 10;
pub const MAX_QUEUES: usize = 4;

pub type VirtioHandle<M> = Handle<VirtioDevice<M>>;

/// Chooses the driver feature set from what the device offers.
pub trait FeatureNegotiator {
    fn negotiate(&self, offered: u64) -> u64;
}

impl<F: Fn(u64) -> u64> FeatureNegotiator for F {
    fn negotiate(&self, offered: u64) -> u64 {
        self(offered)
    }
}

pub struct VirtioDevice<M: Mmio> {
    pub mmio_base: u64,
    pub mmio_size: u64,
    pub io_base: u16,
    pub irq: u8,
    pub pci: PciHandle,
    common: CommonCfg<M>,
    notify_base: u64,
    notify_multiplier: u32,
    isr: Option<u64>,
    device_cfg: Option<u64>,
    features: u64,
    queues: [Mutex<Option<VirtQueue>>; MAX_QUEUES],
    used: [UsedCursor; MAX_QUEUES],
}

/// Lock-free copy of a queue's used-ring position, read from interrupt
/// context while the queue itself may be locked.
#[derive(Default)]
struct UsedCursor {
    /// Address of `used.idx`; 0 until the queue is set up.
    idx_addr: AtomicUsize,
    last_seen: AtomicU16,
}

impl UsedCursor {
    fn publish(&self, queue: &VirtQueue) {
        self.idx_addr.store(queue.used_idx_ptr() as usize, Ordering::Release);
        self.last_seen.store(queue.last_used_idx(), Ordering::Release);
    }
}

impl<M: Mmio> VirtioDevice<M> {
    /// Resolve the transport structures of `pci` inside its memory window.
    fn from_pci(handle: PciHandle, pci: &PciDevice, mmio: M) -> Result<Self, VirtioError> {
        let caps = &pci.caps;

        // Address of a capability's structure: its BAR's base plus offset
        let resolve = |cfg_type: u8| {
            let cap = caps.get(cfg_type)?;
            let bar = pci.bar(cap.bar).filter(|bar| bar.is_memory())?;
            Some(bar.base + cap.offset as u64)
        };

        let primary = caps
            .get(cap_type::COMMON_CFG)
            .and_then(|cap| pci.bar(cap.bar))
            .filter(|bar| bar.is_memory())
            .or_else(|| pci.bars.iter().flatten().filter(|bar| bar.is_memory()).last());
        let (mmio_base, mmio_size) = primary.map_or((pci.membase, 0), |bar| (bar.base, bar.size));

        let common_base = resolve(cap_type::COMMON_CFG).unwrap_or(mmio_base);
        let Some(notify_base) = resolve(cap_type::NOTIFY_CFG) else {
            serial_println!("[virtio] {:?}: no notify capability", pci.bdf);
            return Err(VirtioError::MissingCapability(cap_type::NOTIFY_CFG));
        };
        serial_println!("[virtio] {:?}: membase {:#x}, common cfg at {:#x}", pci.bdf, mmio_base, common_base);

        Ok(Self {
            mmio_base,
            mmio_size,
            io_base: pci.iobase as u16,
            irq: pci.irq_line,
            pci: handle,
            common: CommonCfg::new(mmio, common_base),
            notify_base,
            notify_multiplier: caps.notify_off_multiplier(),
            isr: resolve(cap_type::ISR_CFG),
            device_cfg: resolve(cap_type::DEVICE_CFG),
            features: 0,
            queues: core::array::from_fn(|_| Mutex::new(None)),
            used: Default::default(),
        })
    }

    fn set_status(&self, status: DeviceStatus) {
        fence(Ordering::SeqCst);
        self.common.set_device_status(status);
    }

    /// Run the initialization sequence up to DRIVER_OK.
    pub fn configure<N, A>(&mut self, negotiator: &N, alloc: &A) -> Result<(), VirtioError>
    where
        N: FeatureNegotiator + ?Sized,
        A: FrameAllocator,
    {
        let mut status = DeviceStatus::empty();
        self.set_status(status);

        status |= DeviceStatus::ACKNOWLEDGE;
        self.set_status(status);

        status |= DeviceStatus::DRIVER;
        self.set_status(status);

        let offered = self.common.device_features();
        let features = negotiator.negotiate(offered);
        self.common.set_driver_features(features);

        status |= DeviceStatus::FEATURES_OK;
        self.set_status(status);

        if !self.common.device_status().contains(DeviceStatus::FEATURES_OK) {
            status |= DeviceStatus::FAILED;
            self.set_status(status);
            serial_println!("[virtio] device rejected features {:#x} (offered {:#x})", features, offered);
            return Err(VirtioError::FeaturesRejected);
        }
        self.features = features;

        for index in 0..MAX_QUEUES as u16 {
            match self.setup_queue(index, alloc) {
                Ok(()) => {}
                Err(VirtioError::QueueAbsent(_)) => {
                    serial_println!("[virtio] queue {} not present", index);
                }
                Err(e) => {
                    status |= DeviceStatus::FAILED;
                    self.set_status(status);
                    return Err(e);
                }
            }
        }

        status |= DeviceStatus::DRIVER_OK;
        self.set_status(status);
        serial_println!("[virtio] device live, features {:#x}", features);
        Ok(())
    }

    /// Allocate and publish the rings of queue `index`.
    pub fn setup_queue<A: FrameAllocator>(&self, index: u16, alloc: &A) -> Result<(), VirtioError> {
        let slot = self
            .queues
            .get(index as usize)
            .ok_or(VirtioError::OutOfCapacity)?;

        self.common.select_queue(index);
        let size = self.common.queue_size();
        if size == 0 {
            return Err(VirtioError::QueueAbsent(index));
        }

        let mut queue = VirtQueue::new(index, size, alloc)?;
        self.common.set_queue_addresses(
            queue.desc_addr().as_u64(),
            queue.driver_addr().as_u64(),
            queue.device_addr().as_u64(),
        );
        queue.set_notify_off(self.common.queue_notify_off());
        self.common.enable_queue();

        serial_println!("[virtio] queue {}: {} entries", index, size);
        self.used[index as usize].publish(&queue);
        *slot.lock() = Some(queue);
        Ok(())
    }

    /// Run `f` on queue `index` with its lock held.
    pub fn with_queue<R>(&self, index: u16, f: impl FnOnce(&mut VirtQueue) -> R) -> Result<R, VirtioError> {
        let slot = self
            .queues
            .get(index as usize)
            .ok_or(VirtioError::QueueAbsent(index))?;
        let mut guard = slot.lock();
        let queue = guard.as_mut().ok_or(VirtioError::QueueAbsent(index))?;
        let result = f(&mut *queue);
        self.used[index as usize].publish(queue);
        Ok(result)
    }

    /// Has the device completed buffers on queue `index` that nobody has
    /// popped yet? Takes no lock, so it is safe from an interrupt handler
    /// that may have preempted a holder of the queue.
    pub fn has_used(&self, index: u16) -> bool {
        let Some(cursor) = self.used.get(index as usize) else {
            return false;
        };
        let addr = cursor.idx_addr.load(Ordering::Acquire);
        if addr == 0 {
            return false;
        }
        let idx = unsafe { ptr::read_volatile(addr as *const u16) };
        idx != cursor.last_seen.load(Ordering::Acquire)
    }

    pub fn fill_buffer(&self, index: u16, chain: &[BufferSegment<'_>]) -> Result<u16, VirtioError> {
        self.with_queue(index, |queue| queue.fill_buffer(chain))?
    }

    /// Kick the device about new buffers on queue `index`, unless it has
    /// asked not to be notified.
    pub fn notify_queue(&self, index: u16) -> Result<(), VirtioError> {
        let (wanted, notify_off) = self.with_queue(index, |queue| (queue.needs_notify(), queue.notify_off()))?;
        if !wanted {
            return Ok(());
        }
        let addr = self.notify_base + notify_off as u64 * self.notify_multiplier as u64;
        fence(Ordering::SeqCst);
        self.common.mmio().write16(addr, index);
        Ok(())
    }

    /// Read the ISR status register, which also clears it.
    pub fn ack_interrupt(&self) -> u8 {
        match self.isr {
            Some(addr) => self.common.mmio().read8(addr),
            None => 0,
        }
    }

    pub fn read_device_config8(&self, offset: u64) -> Option<u8> {
        self.device_cfg.map(|base| self.common.mmio().read8(base + offset))
    }

    pub fn has_device_config(&self) -> bool {
        self.device_cfg.is_some()
    }

    pub fn status(&self) -> DeviceStatus {
        self.common.device_status()
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn has_feature(&self, bits: u64) -> bool {
        self.features & bits == bits
    }

    pub fn common_cfg_base(&self) -> u64 {
        self.common.base()
    }

    pub fn notify_base(&self) -> u64 {
        self.notify_base
    }

    pub fn has_queue(&self, index: u16) -> bool {
        self.queues
            .get(index as usize)
            .is_some_and(|slot| slot.lock().is_some())
    }
}

pub struct VirtioTable<M: Mmio> {
    devices: Slab<VirtioDevice<M>, VIRTIO_TABLE_CAPACITY>,
}

impl<M: Mmio> VirtioTable<M> {
    pub fn new() -> Self {
        Self { devices: Slab::new() }
    }

    /// Take a slot for the virtio device behind `pci`.
    pub fn bind(&mut self, handle: PciHandle, pci: &PciDevice, mmio: M) -> Result<VirtioHandle<M>, VirtioError> {
        let device = VirtioDevice::from_pci(handle, pci, mmio)?;
        Ok(self.devices.alloc(device)?)
    }

    pub fn configure<N, A>(&mut self, handle: VirtioHandle<M>, negotiator: &N, alloc: &A) -> Result<(), VirtioError>
    where
        N: FeatureNegotiator + ?Sized,
        A: FrameAllocator,
    {
        self.devices
            .get_mut(handle)
            .ok_or(VirtioError::StaleHandle)?
            .configure(negotiator, alloc)
    }

    pub fn get(&self, handle: VirtioHandle<M>) -> Result<&VirtioDevice<M>, VirtioError> {
        self.devices.get(handle).ok_or(VirtioError::StaleHandle)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl<M: Mmio> Default for VirtioTable<M> {
    fn default() -> Self {
        Self::new()
    }
}
