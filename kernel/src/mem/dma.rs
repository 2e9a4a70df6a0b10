/// DMA-visible memory handed out by a frame allocator.
///
/// A `DmaRegion` is physically contiguous, page aligned and zeroed at
/// allocation. It carries both addresses: the physical one published to
/// devices and the virtual one the CPU uses. Rings and packet arenas live
/// for the lifetime of their device, so regions are never returned.
use core::ptr::{self, NonNull};

use super::phys::{AllocError, PhysAddr, PAGE_SIZE};

/// Source of physically contiguous, zeroed pages.
pub trait FrameAllocator {
    /// Allocate `count` contiguous 4 KiB pages.
    fn alloc_frames(&self, count: usize) -> Result<DmaRegion, AllocError>;

    /// Allocate enough pages to hold `size` bytes.
    fn alloc_bytes(&self, size: usize) -> Result<DmaRegion, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize);
        }
        self.alloc_frames(pages_for(size))
    }
}

impl<A: FrameAllocator + ?Sized> FrameAllocator for &A {
    fn alloc_frames(&self, count: usize) -> Result<DmaRegion, AllocError> {
        (**self).alloc_frames(count)
    }
}

/// Number of pages needed to hold `size` bytes.
pub const fn pages_for(size: usize) -> usize {
    (size + PAGE_SIZE - 1) / PAGE_SIZE
}

pub struct DmaRegion {
    phys: PhysAddr,
    virt: NonNull<u8>,
    len: usize,
}

// The region is only reached through its owner (a virtqueue behind a lock).
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// # Safety
    /// `virt` must map `phys` for `len` bytes and stay valid for as long as
    /// the region is used.
    pub unsafe fn from_raw(phys: PhysAddr, virt: NonNull<u8>, len: usize) -> Self {
        Self { phys, virt, len }
    }

    #[inline]
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    /// Physical address of byte `offset` of the region.
    #[inline]
    pub fn phys_at(&self, offset: usize) -> PhysAddr {
        debug_assert!(offset <= self.len);
        PhysAddr::new(self.phys.as_u64() + offset as u64)
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the region at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "write exceeds DMA region");
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
    }

    /// Copy `dest.len()` bytes out of the region starting at `offset`.
    pub fn read_at(&self, offset: usize, dest: &mut [u8]) {
        assert!(offset + dest.len() <= self.len, "read exceeds DMA region");
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr().add(offset), dest.as_mut_ptr(), dest.len());
        }
    }
}
