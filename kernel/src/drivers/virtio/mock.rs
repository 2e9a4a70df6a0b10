/// Emulated virtio-net device for host tests.
///
/// Implements `Mmio` over the memory BAR laid out by
/// `FakeConfigSpace::add_virtio_net` and `PortIo` over the legacy I/O
/// block (for the MAC). The device side of the rings is reached through
/// the physical addresses the driver publishes, which `HeapFrames` makes
/// equal to virtual addresses.
use alloc::vec;
use alloc::vec::Vec;
use core::ptr;
use spin::Mutex;

use super::net::{NetFeatures, NetHeader};
use super::regs::{common, legacy, DeviceStatus, ISR_QUEUE};
use super::virtqueue::{DescFlags, VirtqDesc, VirtqUsedElem};
use crate::drivers::io::PortIo;
use crate::drivers::pci::mock::virtio_layout;
use crate::mem::Mmio;

const QUEUES: usize = 4;

#[derive(Default, Clone, Copy)]
struct FakeQueue {
    max_size: u16,
    desc: u64,
    driver: u64,
    device: u64,
    enabled: bool,
    notify_off: u16,
    /// Next available-ring slot the device will consume.
    last_avail: u16,
}

struct State {
    offered: u64,
    reject_features: bool,
    device_feature_select: u32,
    driver_feature_select: u32,
    driver_features: u64,
    status: u8,
    status_log: Vec<u8>,
    queue_select: u16,
    queues: [FakeQueue; QUEUES],
    notifications: Vec<(u64, u16)>,
    isr: u8,
    mac: [u8; 6],
}

pub struct FakeVirtioNet {
    mem_base: u64,
    io_base: u16,
    state: Mutex<State>,
}

/// What the driver put in one transmit chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentChain {
    pub head: u16,
    /// Bytes of every descriptor, in chain order.
    pub segments: Vec<Vec<u8>>,
}

impl FakeVirtioNet {
    /// A device offering MAC and VERSION_1, with queues 0 and 1 of
    /// `queue_size` entries.
    pub fn new(mem_base: u64, io_base: u16, mac: [u8; 6], queue_size: u16) -> Self {
        let mut queues = [FakeQueue::default(); QUEUES];
        for (i, q) in queues.iter_mut().take(2).enumerate() {
            q.max_size = queue_size;
            q.notify_off = i as u16;
        }
        Self {
            mem_base,
            io_base,
            state: Mutex::new(State {
                offered: (NetFeatures::MAC
                    | NetFeatures::VERSION_1
                    | NetFeatures::CTRL_VQ
                    | NetFeatures::GUEST_TSO4
                    | NetFeatures::STATUS)
                    .bits(),
                reject_features: false,
                device_feature_select: 0,
                driver_feature_select: 0,
                driver_features: 0,
                status: 0,
                status_log: Vec::new(),
                queue_select: 0,
                queues,
                notifications: Vec::new(),
                isr: 0,
                mac,
            }),
        }
    }

    pub fn set_offered(&self, features: u64) {
        self.state.lock().offered = features;
    }

    /// Refuse FEATURES_OK whatever the driver asks for.
    pub fn reject_features(&self) {
        self.state.lock().reject_features = true;
    }

    pub fn set_queue_size(&self, queue: usize, size: u16) {
        self.state.lock().queues[queue].max_size = size;
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.state.lock().status)
    }

    /// Every value written to the status register, in order.
    pub fn status_log(&self) -> Vec<u8> {
        self.state.lock().status_log.clone()
    }

    pub fn driver_features(&self) -> u64 {
        self.state.lock().driver_features
    }

    pub fn queue_enabled(&self, queue: usize) -> bool {
        self.state.lock().queues[queue].enabled
    }

    /// Ring addresses the driver published for `queue`.
    pub fn queue_addresses(&self, queue: usize) -> (u64, u64, u64) {
        let q = self.state.lock().queues[queue];
        (q.desc, q.driver, q.device)
    }

    /// Notify writes as `(address, value)`.
    pub fn notifications(&self) -> Vec<(u64, u16)> {
        self.state.lock().notifications.clone()
    }

    pub fn notify_addr(&self, queue: usize) -> u64 {
        let off = self.state.lock().queues[queue].notify_off as u64;
        self.mem_base + virtio_layout::NOTIFY_OFFSET as u64 + off * virtio_layout::NOTIFY_MULTIPLIER as u64
    }

    fn header_len(&self) -> usize {
        NetHeader::len_for(self.state.lock().driver_features)
    }

    /// Set or clear `VIRTQ_USED_F_NO_NOTIFY` in `queue`'s used ring.
    pub fn suppress_notifications(&self, queue: usize, suppress: bool) {
        let q = self.state.lock().queues[queue];
        unsafe { ptr::write_volatile(q.device as *mut u16, suppress as u16) }
    }

    /// Device side: take every chain the driver has made available on
    /// `queue`, return it through the used ring and report its contents.
    pub fn consume(&self, queue: usize) -> Vec<SentChain> {
        let mut sent = Vec::new();
        while let Some(head) = self.next_avail(queue) {
            let mut segments = Vec::new();
            let mut index = head;
            loop {
                let desc = self.read_desc(queue, index);
                let mut bytes = vec![0u8; desc.len as usize];
                unsafe { ptr::copy_nonoverlapping(desc.addr as *const u8, bytes.as_mut_ptr(), bytes.len()) }
                segments.push(bytes);
                if desc.flags & DescFlags::NEXT.bits() == 0 {
                    break;
                }
                index = desc.next;
            }
            self.push_used(queue, head, 0);
            sent.push(SentChain { head, segments });
        }
        sent
    }

    /// Device side: write `frame` behind a zeroed header into the next
    /// receive buffer of queue 0. Returns false if none is posted.
    pub fn deliver(&self, frame: &[u8]) -> bool {
        let Some(head) = self.next_avail(0) else {
            return false;
        };
        let desc = self.read_desc(0, head);
        let header_len = self.header_len();
        let total = header_len + frame.len();
        assert!(desc.flags & DescFlags::WRITE.bits() != 0, "receive buffer not writable");
        assert!(total <= desc.len as usize, "frame larger than receive buffer");

        unsafe {
            let dst = desc.addr as *mut u8;
            ptr::write_bytes(dst, 0, header_len);
            ptr::copy_nonoverlapping(frame.as_ptr(), dst.add(header_len), frame.len());
        }
        self.push_used(0, head, total as u32);
        self.state.lock().isr |= ISR_QUEUE;
        true
    }

    /// Driver-published available index of `queue`.
    pub fn avail_idx(&self, queue: usize) -> u16 {
        let q = self.state.lock().queues[queue];
        unsafe { ptr::read_volatile((q.driver + 2) as *const u16) }
    }

    pub fn avail_flags(&self, queue: usize) -> u16 {
        let q = self.state.lock().queues[queue];
        unsafe { ptr::read_volatile(q.driver as *const u16) }
    }

    fn next_avail(&self, queue: usize) -> Option<u16> {
        let mut state = self.state.lock();
        let q = &mut state.queues[queue];
        if q.driver == 0 {
            return None;
        }
        let avail_idx = unsafe { ptr::read_volatile((q.driver + 2) as *const u16) };
        if avail_idx == q.last_avail {
            return None;
        }
        let slot = (q.last_avail % q.max_size) as u64;
        let head = unsafe { ptr::read_volatile((q.driver + 4 + 2 * slot) as *const u16) };
        q.last_avail = q.last_avail.wrapping_add(1);
        Some(head)
    }

    fn read_desc(&self, queue: usize, index: u16) -> VirtqDesc {
        let q = self.state.lock().queues[queue];
        unsafe { ptr::read_volatile((q.desc as *const VirtqDesc).add(index as usize)) }
    }

    fn push_used(&self, queue: usize, head: u16, len: u32) {
        let q = self.state.lock().queues[queue];
        unsafe {
            let idx_ptr = (q.device + 2) as *mut u16;
            let idx = ptr::read_volatile(idx_ptr);
            let elems = (q.device + 4) as *mut VirtqUsedElem;
            let slot = (idx % q.max_size) as usize;
            ptr::write_volatile(elems.add(slot), VirtqUsedElem { id: head as u32, len });
            ptr::write_volatile(idx_ptr, idx.wrapping_add(1));
        }
    }

    fn region(&self, addr: u64) -> Option<(u32, u64)> {
        use virtio_layout::*;
        let offset = addr.checked_sub(self.mem_base)?;
        [COMMON_OFFSET, ISR_OFFSET, DEVICE_OFFSET, NOTIFY_OFFSET]
            .into_iter()
            .rev()
            .find(|&start| offset >= start as u64)
            .map(|start| (start, offset - start as u64))
    }

    fn read(&self, addr: u64, width: u8) -> u32 {
        use virtio_layout::*;
        let mut s = self.state.lock();
        let Some((region, off)) = self.region(addr) else {
            return 0xFFFF_FFFF;
        };
        match region {
            COMMON_OFFSET => {
                let sel = s.queue_select as usize;
                match off {
                    common::DEVICE_FEATURE => (s.offered >> (32 * s.device_feature_select.min(1))) as u32,
                    common::DRIVER_FEATURE => (s.driver_features >> (32 * s.driver_feature_select.min(1))) as u32,
                    common::NUM_QUEUES => QUEUES as u32,
                    common::DEVICE_STATUS => s.status as u32,
                    common::QUEUE_SELECT => s.queue_select as u32,
                    common::QUEUE_SIZE => s.queues.get(sel).map_or(0, |q| q.max_size as u32),
                    common::QUEUE_ENABLE => s.queues.get(sel).map_or(0, |q| q.enabled as u32),
                    common::QUEUE_NOTIFY_OFF => s.queues.get(sel).map_or(0, |q| q.notify_off as u32),
                    _ => 0,
                }
            }
            ISR_OFFSET => {
                let isr = s.isr;
                s.isr = 0;
                isr as u32
            }
            DEVICE_OFFSET if width == 1 => s.mac.get(off as usize).copied().unwrap_or(0) as u32,
            _ => 0,
        }
    }

    fn write(&self, addr: u64, val: u32) {
        use virtio_layout::*;
        let mut s = self.state.lock();
        let Some((region, off)) = self.region(addr) else {
            return;
        };
        if region == NOTIFY_OFFSET {
            s.notifications.push((addr, val as u16));
            return;
        }
        if region != COMMON_OFFSET {
            return;
        }

        let sel = s.queue_select as usize;
        let half = |old: u64, hi: bool| {
            if hi {
                (old & 0xFFFF_FFFF) | ((val as u64) << 32)
            } else {
                (old & !0xFFFF_FFFF) | val as u64
            }
        };
        match off {
            common::DEVICE_FEATURE_SELECT => s.device_feature_select = val,
            common::DRIVER_FEATURE_SELECT => s.driver_feature_select = val,
            common::DRIVER_FEATURE => {
                let hi = s.driver_feature_select == 1;
                s.driver_features = half(s.driver_features, hi);
            }
            common::DEVICE_STATUS => {
                let mut status = val as u8;
                s.status_log.push(status);
                if status == 0 {
                    s.driver_features = 0;
                    for q in s.queues.iter_mut() {
                        *q = FakeQueue {
                            max_size: q.max_size,
                            notify_off: q.notify_off,
                            ..FakeQueue::default()
                        };
                    }
                }
                if s.reject_features {
                    status &= !DeviceStatus::FEATURES_OK.bits();
                }
                s.status = status;
            }
            common::QUEUE_SELECT => s.queue_select = val as u16,
            common::QUEUE_ENABLE => {
                if let Some(q) = s.queues.get_mut(sel) {
                    q.enabled = val != 0;
                }
            }
            o if (common::QUEUE_DESC..common::QUEUE_DEVICE + 8).contains(&o) => {
                let field = (o - common::QUEUE_DESC) / 8;
                let hi = (o - common::QUEUE_DESC) % 8 == 4;
                if let Some(q) = s.queues.get_mut(sel) {
                    match field {
                        0 => q.desc = half(q.desc, hi),
                        1 => q.driver = half(q.driver, hi),
                        _ => q.device = half(q.device, hi),
                    }
                }
            }
            _ => {}
        }
    }
}

impl Mmio for FakeVirtioNet {
    fn read8(&self, addr: u64) -> u8 {
        self.read(addr, 1) as u8
    }
    fn read16(&self, addr: u64) -> u16 {
        self.read(addr, 2) as u16
    }
    fn read32(&self, addr: u64) -> u32 {
        self.read(addr, 4)
    }
    fn write8(&self, addr: u64, val: u8) {
        self.write(addr, val as u32)
    }
    fn write16(&self, addr: u64, val: u16) {
        self.write(addr, val as u32)
    }
    fn write32(&self, addr: u64, val: u32) {
        self.write(addr, val)
    }
}

/// Legacy I/O block: only the MAC and ISR are emulated.
impl PortIo for FakeVirtioNet {
    fn inb(&self, port: u16) -> u8 {
        let Some(off) = port.checked_sub(self.io_base) else {
            return 0xFF;
        };
        let mut s = self.state.lock();
        match off {
            legacy::ISR_STATUS => {
                let isr = s.isr;
                s.isr = 0;
                isr
            }
            o if o >= legacy::DEVICE_SPECIFIC => {
                s.mac.get((o - legacy::DEVICE_SPECIFIC) as usize).copied().unwrap_or(0xFF)
            }
            _ => 0xFF,
        }
    }
    fn inw(&self, _port: u16) -> u16 {
        0xFFFF
    }
    fn inl(&self, _port: u16) -> u32 {
        0xFFFF_FFFF
    }
    fn outb(&self, _port: u16, _val: u8) {}
    fn outw(&self, _port: u16, _val: u16) {}
    fn outl(&self, _port: u16, _val: u32) {}
}
