/// Virtio split virtqueue (virtio 1.0 layout).
///
/// One page-rounded DMA allocation holds the three rings back to back,
/// each at its required alignment:
///   [descriptor table: 16 * size, 16-aligned]
///   [available ring:   6 + 2 * size, 2-aligned]
///   [used ring:        6 + 8 * size, 4-aligned]
/// The device is given the three physical addresses separately.
///
/// Buffers are not allocated per packet. A queue may carry an arena of
/// `size` fixed-size chunks; descriptor `i` always points into chunk `i`,
/// so a completed descriptor index is all that is needed to find its data.
use alloc::vec;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;

use super::VirtioError;
use crate::mem::{DmaRegion, FrameAllocator, PhysAddr};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescFlags: u16 {
        /// Chain continues at `next`.
        const NEXT = 1;
        /// Device writes into this buffer (receive).
        const WRITE = 2;
        const INDIRECT = 4;
    }
}

/// Driver asks the device not to interrupt on used-ring updates.
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;
/// Device asks the driver not to kick it.
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;

/// A single descriptor in the descriptor table (16 bytes).
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

static_assertions::const_assert_eq!(size_of::<VirtqDesc>(), 16);
static_assertions::const_assert_eq!(align_of::<VirtqDesc>(), 16);

/// Used ring element.
#[repr(C, align(4))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtqUsedElem {
    /// Head of the completed chain.
    pub id: u32,
    /// Bytes the device wrote into the chain.
    pub len: u32,
}

static_assertions::const_assert_eq!(size_of::<VirtqUsedElem>(), 8);
static_assertions::const_assert_eq!(align_of::<VirtqUsedElem>(), 4);

pub const DESC_ALIGN: usize = 16;
pub const AVAIL_ALIGN: usize = 2;
pub const USED_ALIGN: usize = 4;

/// Largest queue the split ring format allows.
pub const MAX_QUEUE_SIZE: u16 = 32768;

const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Where the three rings of a queue of `size` entries sit in the backing
/// allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub size: u16,
    pub desc_offset: usize,
    pub desc_len: usize,
    pub avail_offset: usize,
    pub avail_len: usize,
    pub used_offset: usize,
    pub used_len: usize,
}

impl RingLayout {
    pub fn new(size: u16) -> Result<Self, VirtioError> {
        if size == 0 || !size.is_power_of_two() || size > MAX_QUEUE_SIZE {
            return Err(VirtioError::InvalidQueueSize(size));
        }
        let s = size as usize;
        let desc_len = size_of::<VirtqDesc>() * s;
        // flags + idx + ring + used_event
        let avail_len = 6 + 2 * s;
        // flags + idx + ring + avail_event
        let used_len = 6 + size_of::<VirtqUsedElem>() * s;

        let avail_offset = align_up(desc_len, AVAIL_ALIGN);
        let used_offset = align_up(avail_offset + avail_len, USED_ALIGN);
        Ok(Self {
            size,
            desc_offset: 0,
            desc_len,
            avail_offset,
            avail_len,
            used_offset,
            used_len,
        })
    }

    /// Bytes needed for all three rings.
    pub fn total_len(&self) -> usize {
        self.used_offset + self.used_len
    }
}

/// Descriptor table view.
struct DescTable<'a> {
    base: *mut VirtqDesc,
    size: u16,
    _ring: PhantomData<&'a mut DmaRegion>,
}

impl DescTable<'_> {
    fn read(&self, index: u16) -> VirtqDesc {
        debug_assert!(index < self.size);
        unsafe { ptr::read_volatile(self.base.add(index as usize)) }
    }

    fn write(&mut self, index: u16, desc: VirtqDesc) {
        debug_assert!(index < self.size);
        unsafe { ptr::write_volatile(self.base.add(index as usize), desc) }
    }
}

/// Available ring view: driver-owned.
struct AvailRing<'a> {
    base: *mut u16,
    size: u16,
    _ring: PhantomData<&'a mut DmaRegion>,
}

impl AvailRing<'_> {
    fn flags(&self) -> u16 {
        unsafe { ptr::read_volatile(self.base) }
    }

    fn set_flags(&mut self, flags: u16) {
        unsafe { ptr::write_volatile(self.base, flags) }
    }

    fn idx(&self) -> u16 {
        unsafe { ptr::read_volatile(self.base.add(1)) }
    }

    fn set_idx(&mut self, idx: u16) {
        unsafe { ptr::write_volatile(self.base.add(1), idx) }
    }

    fn entry(&self, slot: u16) -> u16 {
        unsafe { ptr::read_volatile(self.base.add(2 + (slot % self.size) as usize)) }
    }

    fn set_entry(&mut self, slot: u16, head: u16) {
        unsafe { ptr::write_volatile(self.base.add(2 + (slot % self.size) as usize), head) }
    }
}

/// Used ring view: device-owned, read only for the driver.
struct UsedRing<'a> {
    base: *const u16,
    size: u16,
    _ring: PhantomData<&'a DmaRegion>,
}

impl UsedRing<'_> {
    fn flags(&self) -> u16 {
        unsafe { ptr::read_volatile(self.base) }
    }

    fn idx(&self) -> u16 {
        unsafe { ptr::read_volatile(self.base.add(1)) }
    }

    fn elem(&self, slot: u16) -> VirtqUsedElem {
        let elems = unsafe { self.base.add(2) } as *const VirtqUsedElem;
        unsafe { ptr::read_volatile(elems.add((slot % self.size) as usize)) }
    }
}

/// One piece of a descriptor chain.
#[derive(Debug, Clone, Copy)]
pub struct BufferSegment<'a> {
    /// Bytes copied into the chunk before the descriptor is published.
    pub data: Option<&'a [u8]>,
    pub len: u32,
    pub flags: DescFlags,
}

impl<'a> BufferSegment<'a> {
    /// Device-readable segment carrying `data`.
    pub fn readable(data: &'a [u8]) -> Self {
        Self {
            data: Some(data),
            len: data.len() as u32,
            flags: DescFlags::empty(),
        }
    }

    /// Empty device-writable segment of `len` bytes.
    pub fn writable(len: u32) -> Self {
        Self {
            data: None,
            len,
            flags: DescFlags::WRITE,
        }
    }
}

/// A chain the device has finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedBuffer {
    pub id: u16,
    pub len: u32,
}

pub struct VirtQueue {
    index: u16,
    layout: RingLayout,
    ring: DmaRegion,
    arena: Option<DmaRegion>,
    chunk_size: usize,
    /// Next descriptor slot to hand out; wraps at `size`.
    next_free_buffer: u16,
    num_free: u16,
    in_flight: Vec<bool>,
    last_used_idx: u16,
    notify_off: u16,
}

// The rings are only touched through the owning queue, which sits behind a
// lock in its device.
unsafe impl Send for VirtQueue {}

impl VirtQueue {
    /// Allocate zeroed rings for a queue of `size` entries.
    pub fn new<A: FrameAllocator>(index: u16, size: u16, alloc: &A) -> Result<Self, VirtioError> {
        let layout = RingLayout::new(size)?;
        let ring = alloc.alloc_bytes(layout.total_len())?;

        Ok(Self {
            index,
            layout,
            ring,
            arena: None,
            chunk_size: 0,
            next_free_buffer: 0,
            num_free: size,
            in_flight: vec![false; size as usize],
            last_used_idx: 0,
            notify_off: 0,
        })
    }

    /// Give the queue `size` data chunks of `chunk_size` bytes each.
    pub fn attach_arena<A: FrameAllocator>(&mut self, chunk_size: usize, alloc: &A) -> Result<(), VirtioError> {
        let arena = alloc.alloc_bytes(chunk_size * self.size() as usize)?;
        self.arena = Some(arena);
        self.chunk_size = chunk_size;
        Ok(())
    }

    fn desc_table(&mut self) -> DescTable<'_> {
        DescTable {
            base: unsafe { self.ring.as_ptr().add(self.layout.desc_offset) } as *mut VirtqDesc,
            size: self.layout.size,
            _ring: PhantomData,
        }
    }

    fn avail_ring(&mut self) -> AvailRing<'_> {
        AvailRing {
            base: unsafe { self.ring.as_ptr().add(self.layout.avail_offset) } as *mut u16,
            size: self.layout.size,
            _ring: PhantomData,
        }
    }

    fn used_ring(&self) -> UsedRing<'_> {
        UsedRing {
            base: unsafe { self.ring.as_ptr().add(self.layout.used_offset) } as *const u16,
            size: self.layout.size,
            _ring: PhantomData,
        }
    }

    /// Publish `chain` as one buffer. Returns the head descriptor index.
    pub fn fill_buffer(&mut self, chain: &[BufferSegment<'_>]) -> Result<u16, VirtioError> {
        if chain.is_empty() {
            return Err(VirtioError::EmptyChain);
        }
        if self.arena.is_none() {
            return Err(VirtioError::NoArena(self.index));
        }
        for seg in chain {
            let copied = seg.data.map_or(0, <[u8]>::len);
            if seg.len as usize > self.chunk_size || copied > self.chunk_size {
                return Err(VirtioError::SegmentTooLarge);
            }
            if seg.data.is_some() && copied != seg.len as usize {
                return Err(VirtioError::SegmentLengthMismatch);
            }
        }

        let size = self.size();
        if chain.len() > size as usize {
            return Err(VirtioError::QueueFull);
        }
        let start = self.next_free_buffer;
        let blocked = (0..chain.len() as u16).any(|k| self.in_flight[((start + k) % size) as usize]);
        if blocked {
            return Err(VirtioError::QueueFull);
        }

        let head = start;
        for (i, seg) in chain.iter().enumerate() {
            let slot = self.next_free_buffer;
            let chunk = slot as usize * self.chunk_size;
            let arena = self.arena.as_mut().ok_or(VirtioError::NoArena(self.index))?;
            if let Some(data) = seg.data {
                arena.write_at(chunk, data);
            }
            let addr = arena.phys_at(chunk).as_u64();

            let mut flags = seg.flags;
            if i + 1 < chain.len() {
                flags |= DescFlags::NEXT;
            }
            let next = (slot + 1) % size;
            self.desc_table().write(
                slot,
                VirtqDesc {
                    addr,
                    len: seg.len,
                    flags: flags.bits(),
                    next,
                },
            );

            self.in_flight[slot as usize] = true;
            self.num_free -= 1;
            self.next_free_buffer = next;
        }

        let mut avail = self.avail_ring();
        let idx = avail.idx();
        avail.set_entry(idx, head);
        // Descriptors and ring entry must be visible before the index moves
        fence(Ordering::Release);
        avail.set_idx(idx.wrapping_add(1));

        Ok(head)
    }

    /// Has the device completed anything we have not consumed yet?
    pub fn has_used(&self) -> bool {
        self.used_ring().idx() != self.last_used_idx
    }

    /// Take the next completed chain off the used ring and free its
    /// descriptors.
    pub fn pop_used(&mut self) -> Option<UsedBuffer> {
        let used = self.used_ring();
        if used.idx() == self.last_used_idx {
            return None;
        }
        // Read the element only after seeing the index move
        fence(Ordering::Acquire);
        let elem = used.elem(self.last_used_idx);
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        let size = self.size();
        let mut id = elem.id as u16;
        if elem.id < size as u32 {
            for _ in 0..size {
                if !self.in_flight[id as usize] {
                    break;
                }
                self.in_flight[id as usize] = false;
                self.num_free += 1;
                let desc = self.desc_table().read(id);
                if desc.flags & DescFlags::NEXT.bits() == 0 {
                    break;
                }
                id = desc.next;
            }
        }

        Some(UsedBuffer {
            id: elem.id as u16,
            len: elem.len,
        })
    }

    /// Copy data out of descriptor `id`'s chunk starting at `offset`.
    pub fn read_chunk(&self, id: u16, offset: usize, out: &mut [u8]) -> Result<(), VirtioError> {
        let arena = self.arena.as_ref().ok_or(VirtioError::NoArena(self.index))?;
        if id >= self.size() || offset + out.len() > self.chunk_size {
            return Err(VirtioError::SegmentTooLarge);
        }
        arena.read_at(id as usize * self.chunk_size + offset, out);
        Ok(())
    }

    /// Clears `VIRTQ_AVAIL_F_NO_INTERRUPT`. The used-ring flags belong to
    /// the device, so suppression is requested through the driver's ring.
    pub fn enable_interrupts(&mut self) {
        let mut avail = self.avail_ring();
        let flags = avail.flags();
        avail.set_flags(flags & !VIRTQ_AVAIL_F_NO_INTERRUPT);
    }

    /// Sets `VIRTQ_AVAIL_F_NO_INTERRUPT`.
    pub fn disable_interrupts(&mut self) {
        let mut avail = self.avail_ring();
        let flags = avail.flags();
        avail.set_flags(flags | VIRTQ_AVAIL_F_NO_INTERRUPT);
    }

    /// False while the device has set `VIRTQ_USED_F_NO_NOTIFY`.
    pub fn needs_notify(&self) -> bool {
        self.used_ring().flags() & VIRTQ_USED_F_NO_NOTIFY == 0
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    /// Used-ring index the driver has consumed up to.
    pub fn last_used_idx(&self) -> u16 {
        self.last_used_idx
    }

    /// Address of the device-written `used.idx`. The ring is never freed,
    /// so the pointer stays valid after the queue is dropped.
    pub fn used_idx_ptr(&self) -> *const u16 {
        unsafe { self.ring.as_ptr().add(self.layout.used_offset + 2) as *const u16 }
    }

    pub fn size(&self) -> u16 {
        self.layout.size
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn next_free_buffer(&self) -> u16 {
        self.next_free_buffer
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    pub fn avail_idx(&mut self) -> u16 {
        self.avail_ring().idx()
    }

    pub fn avail_flags(&mut self) -> u16 {
        self.avail_ring().flags()
    }

    /// Head index published in available-ring slot `slot`.
    pub fn avail_entry(&mut self, slot: u16) -> u16 {
        self.avail_ring().entry(slot)
    }

    pub fn descriptor(&mut self, index: u16) -> VirtqDesc {
        self.desc_table().read(index)
    }

    pub fn notify_off(&self) -> u16 {
        self.notify_off
    }

    pub fn set_notify_off(&mut self, notify_off: u16) {
        self.notify_off = notify_off;
    }

    pub fn desc_addr(&self) -> PhysAddr {
        self.ring.phys_at(self.layout.desc_offset)
    }

    pub fn driver_addr(&self) -> PhysAddr {
        self.ring.phys_at(self.layout.avail_offset)
    }

    pub fn device_addr(&self) -> PhysAddr {
        self.ring.phys_at(self.layout.used_offset)
    }
}
