/// Bitmap physical page allocator.
///
/// Tracks 4 KiB frames with one bit each (1 = used). Hands out aligned,
/// contiguous runs; virtqueue rings and packet arenas come from here via
/// the `FrameAllocator` impl. Driver memory is never given back, so there
/// is no free path.
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::dma::{DmaRegion, FrameAllocator};

/// Higher-Half Direct Map offset, set once at boot from the loader's HHDM response.
/// All physical memory is linearly mapped at virtual address (phys + HHDM_OFFSET).
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Relaxed);
}

pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// A physical address. Transparent wrapper for clarity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Virtual pointer through the HHDM.
    pub fn as_ptr<T>(self) -> *mut T {
        (self.0 + hhdm_offset()) as *mut T
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    OutOfMemory,
    InvalidAlignment,
    InvalidSize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of physical memory"),
            AllocError::InvalidAlignment => write!(f, "invalid alignment"),
            AllocError::InvalidSize => write!(f, "invalid size"),
        }
    }
}

pub const PAGE_SIZE: usize = 4096;

/// 4 GiB of tracked memory; the bitmap (128 KiB) is stored inline.
const MAX_PAGES: usize = 1024 * 1024;
const BITMAP_WORDS: usize = MAX_PAGES / 64;

pub struct PhysPageAllocator {
    inner: Mutex<Bitmap>,
}

struct Bitmap {
    words: [u64; BITMAP_WORDS],
    limit: usize,
    free: usize,
}

impl Bitmap {
    fn is_used(&self, page: usize) -> bool {
        self.words[page / 64] & (1 << (page % 64)) != 0
    }

    fn set_used(&mut self, page: usize) {
        self.words[page / 64] |= 1 << (page % 64);
    }

    fn set_free(&mut self, page: usize) {
        self.words[page / 64] &= !(1 << (page % 64));
    }

    /// First used page in `start..start + count`, if any.
    fn first_used(&self, start: usize, count: usize) -> Option<usize> {
        (start..start + count).find(|&page| self.is_used(page))
    }
}

impl PhysPageAllocator {
    /// Every page starts out used until `init` frees the usable ranges.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Bitmap {
                words: [u64::MAX; BITMAP_WORDS],
                limit: 0,
                free: 0,
            }),
        }
    }

    /// Free the usable `(base, length)` ranges of the memory map.
    /// Partial pages at either end stay used.
    pub fn init(&self, regions: &[(u64, u64)]) {
        let mut map = self.inner.lock();
        for &(base, length) in regions {
            let first = (base as usize).div_ceil(PAGE_SIZE);
            let end = (((base + length) as usize) / PAGE_SIZE).min(MAX_PAGES);
            for page in first..end {
                if map.is_used(page) {
                    map.set_free(page);
                    map.free += 1;
                }
                map.limit = map.limit.max(page + 1);
            }
        }
    }

    pub fn alloc_page(&self) -> Result<PhysAddr, AllocError> {
        self.alloc_pages_contiguous(1, 1)
    }

    /// Allocate `count` contiguous pages starting on a multiple of `align`
    /// pages. `align` must be a power of two.
    pub fn alloc_pages_contiguous(&self, count: usize, align: usize) -> Result<PhysAddr, AllocError> {
        if count == 0 {
            return Err(AllocError::InvalidSize);
        }
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }

        let mut map = self.inner.lock();
        if map.free < count {
            return Err(AllocError::OutOfMemory);
        }

        let mut start = 0usize;
        loop {
            start = (start + align - 1) & !(align - 1);
            if start + count > map.limit {
                return Err(AllocError::OutOfMemory);
            }
            match map.first_used(start, count) {
                Some(used) => start = used + 1,
                None => break,
            }
        }

        for page in start..start + count {
            map.set_used(page);
        }
        map.free -= count;
        Ok(PhysAddr::new((start * PAGE_SIZE) as u64))
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free
    }
}

impl FrameAllocator for PhysPageAllocator {
    fn alloc_frames(&self, count: usize) -> Result<DmaRegion, AllocError> {
        let phys = self.alloc_pages_contiguous(count, 1)?;
        let virt = NonNull::new(phys.as_ptr::<u8>()).ok_or(AllocError::OutOfMemory)?;
        let len = count * PAGE_SIZE;
        unsafe {
            ptr::write_bytes(virt.as_ptr(), 0, len);
            Ok(DmaRegion::from_raw(phys, virt, len))
        }
    }
}

/// Global physical page allocator instance.
pub static PHYS_ALLOCATOR: PhysPageAllocator = PhysPageAllocator::new();

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn allocator(pages: u64) -> Box<PhysPageAllocator> {
        let alloc = Box::new(PhysPageAllocator::new());
        alloc.init(&[(0, pages * PAGE_SIZE as u64)]);
        alloc
    }

    #[test]
    fn contiguous_run_is_marked_used() {
        let alloc = allocator(16);
        let a = alloc.alloc_pages_contiguous(4, 1).unwrap();
        let b = alloc.alloc_pages_contiguous(2, 1).unwrap();
        assert_eq!(a.as_u64(), 0);
        assert_eq!(b.as_u64(), 4 * PAGE_SIZE as u64);
        assert_eq!(alloc.free_count(), 10);
    }

    #[test]
    fn aligned_run_skips_unaligned_start() {
        let alloc = allocator(16);
        let _ = alloc.alloc_page().unwrap();
        let run = alloc.alloc_pages_contiguous(2, 4).unwrap();
        assert_eq!(run.as_u64(), 4 * PAGE_SIZE as u64);
    }

    #[test]
    fn partial_pages_stay_reserved() {
        let alloc = Box::new(PhysPageAllocator::new());
        // 0x800..0x3800 only fully covers pages 1 and 2
        alloc.init(&[(0x800, 0x3000)]);
        assert_eq!(alloc.free_count(), 2);
        assert_eq!(alloc.alloc_page().unwrap().as_u64(), PAGE_SIZE as u64);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let alloc = allocator(2);
        let _ = alloc.alloc_pages_contiguous(2, 1).unwrap();
        assert_eq!(alloc.alloc_page(), Err(AllocError::OutOfMemory));
        assert_eq!(alloc.alloc_pages_contiguous(0, 1), Err(AllocError::InvalidSize));
        assert_eq!(alloc.alloc_pages_contiguous(1, 3), Err(AllocError::InvalidAlignment));
    }
}
