pub mod phys;
mod dma;
mod mmio;
pub mod mock;

pub use phys::{PhysAddr, PhysPageAllocator, AllocError, PAGE_SIZE, PHYS_ALLOCATOR, set_hhdm_offset};
pub use dma::{DmaRegion, FrameAllocator, pages_for};
pub use mmio::{Mmio, HhdmMmio};
