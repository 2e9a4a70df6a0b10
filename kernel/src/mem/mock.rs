/// Heap-backed frame allocator for host tests.
///
/// Frames come from the global allocator with page alignment and are
/// identity mapped: the "physical" address handed to a device is the
/// virtual address itself, so a fake device can follow descriptor
/// addresses directly. Frames are leaked, matching the kernel allocator
/// that never takes driver memory back.
use alloc::alloc::{alloc_zeroed, Layout};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::dma::{DmaRegion, FrameAllocator};
use super::phys::{AllocError, PhysAddr, PAGE_SIZE};

#[derive(Default)]
pub struct HeapFrames {
    calls: AtomicUsize,
    pages: AtomicUsize,
    limit: Option<usize>,
}

impl HeapFrames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail once more than `pages` pages have been handed out.
    pub fn with_limit(pages: usize) -> Self {
        Self {
            limit: Some(pages),
            ..Self::default()
        }
    }

    /// How many successful `alloc_frames` calls were made.
    pub fn allocations(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn pages_allocated(&self) -> usize {
        self.pages.load(Ordering::Relaxed)
    }
}

impl FrameAllocator for HeapFrames {
    fn alloc_frames(&self, count: usize) -> Result<DmaRegion, AllocError> {
        if count == 0 {
            return Err(AllocError::InvalidSize);
        }
        if let Some(limit) = self.limit {
            if self.pages_allocated() + count > limit {
                return Err(AllocError::OutOfMemory);
            }
        }
        let len = count * PAGE_SIZE;
        let layout = Layout::from_size_align(len, PAGE_SIZE).map_err(|_| AllocError::InvalidSize)?;
        let virt = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(AllocError::OutOfMemory)?;

        self.calls.fetch_add(1, Ordering::Relaxed);
        self.pages.fetch_add(count, Ordering::Relaxed);
        let phys = PhysAddr::new(virt.as_ptr() as u64);
        Ok(unsafe { DmaRegion::from_raw(phys, virt, len) })
    }
}
