//! Fixed-block allocator
//!
//! Hands out 4 KiB blocks from a virtual arena. The arena's leading blocks
//! hold the allocation bitmap itself (one page of bitmap per 32768 blocks),
//! pre-marked at init. Blocks are materialised lazily: allocating one pulls
//! a frame from the PMM and maps it at the block's virtual address;
//! freeing unmaps and returns the frame. The set half of the bitmap is the
//! canonical authority for what's allocated.

use super::page_table::PteFlags;
use super::{pmm, vmm, PhysicalAddress, VirtualAddress, PAGE_RELATIVE_MASK, PAGE_SIZE};
use crate::error::MemError;
use crate::sync::SpinLock;

/// Blocks covered by one page of bitmap (32768 bits).
pub const BLOCKS_PER_BITMAP_PAGE: usize = (PAGE_SIZE * 8) as usize;

/// Largest supported alignment for [`FixedBlockAllocator::alloc_blocks_aligned`].
pub const MAX_ALIGN: usize = 64;

/// Frame and mapping source for the arena. The kernel uses [`KernelBackend`];
/// tests substitute a recording mock.
pub trait MemoryBackend {
    fn alloc_frame(&mut self) -> Option<PhysicalAddress>;
    fn free_frame(&mut self, phys: PhysicalAddress);
    fn map(&mut self, virt: VirtualAddress, phys: PhysicalAddress, flags: PteFlags) -> bool;
    fn unmap(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress>;
}

/// PMM + VMM backing for the real arena.
pub struct KernelBackend;

impl MemoryBackend for KernelBackend {
    fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        pmm::alloc_page_checked()
    }

    fn free_frame(&mut self, phys: PhysicalAddress) {
        pmm::page_free(phys.as_u64());
    }

    fn map(&mut self, virt: VirtualAddress, phys: PhysicalAddress, flags: PteFlags) -> bool {
        vmm::map_page(virt, phys, flags)
    }

    fn unmap(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        match vmm::unmap_page(virt) {
            0 => None,
            phys => Some(PhysicalAddress::new(phys)),
        }
    }
}

/// The arena bookkeeping. The bitmap lives *in* the arena, not here.
pub struct FixedBlockAllocator {
    begin: VirtualAddress,
    size_blocks: usize,
    /// Leading blocks holding the bitmap; never handed out or freed.
    reserved_blocks: usize,
}

impl FixedBlockAllocator {
    /// Set up an arena of `size_blocks` blocks at `begin`. `begin` must be
    /// page aligned and `size_blocks` a multiple of 32768 (so the bitmap
    /// fills whole pages); zero blocks is accepted and yields an arena
    /// that can satisfy nothing.
    pub fn init(
        backend: &mut impl MemoryBackend,
        begin: VirtualAddress,
        size_blocks: usize,
    ) -> Result<Self, MemError> {
        if !begin.is_page_aligned() {
            return Err(MemError::UnalignedAddress {
                addr: begin.as_u64(),
            });
        }

        if size_blocks % BLOCKS_PER_BITMAP_PAGE != 0 {
            return Err(MemError::BadInitParameters);
        }

        let reserved_blocks = size_blocks / BLOCKS_PER_BITMAP_PAGE;

        let fba = Self {
            begin,
            size_blocks,
            reserved_blocks,
        };

        // Materialise and zero the bitmap pages, then mark them as
        // allocated in the bitmap they now hold.
        for i in 0..reserved_blocks {
            let virt = fba.block_addr(i);
            let frame = backend.alloc_frame().ok_or(MemError::OutOfMemory)?;
            if !backend.map(virt, frame, PteFlags::kernel_rw()) {
                backend.free_frame(frame);
                return Err(MemError::OutOfMemory);
            }

            let words = virt.as_u64() as *mut u64;
            // SAFETY: the bitmap page was just mapped writable at virt.
            unsafe {
                for w in 0..(PAGE_SIZE as usize / 8) {
                    words.add(w).write(0);
                }
            }
        }

        for i in 0..reserved_blocks {
            // SAFETY: bit index is within the freshly-mapped bitmap.
            unsafe { fba.set_bit(i) };
        }

        Ok(fba)
    }

    pub fn begin(&self) -> VirtualAddress {
        self.begin
    }

    pub fn size_blocks(&self) -> usize {
        self.size_blocks
    }

    fn block_addr(&self, index: usize) -> VirtualAddress {
        VirtualAddress::new(self.begin.as_u64() + (index as u64) * PAGE_SIZE)
    }

    fn bitmap_word(&self, word: usize) -> *mut u64 {
        (self.begin.as_u64() as *mut u64).wrapping_add(word)
    }

    /// # Safety
    ///
    /// `index` must be below `size_blocks` and the bitmap mapped.
    unsafe fn test_bit(&self, index: usize) -> bool {
        // SAFETY: per contract the word lies inside the mapped bitmap.
        unsafe { (*self.bitmap_word(index / 64)) & (1 << (index % 64)) != 0 }
    }

    /// # Safety
    ///
    /// `index` must be below `size_blocks` and the bitmap mapped.
    unsafe fn set_bit(&self, index: usize) {
        // SAFETY: per contract the word lies inside the mapped bitmap.
        unsafe { *self.bitmap_word(index / 64) |= 1 << (index % 64) };
    }

    /// # Safety
    ///
    /// `index` must be below `size_blocks` and the bitmap mapped.
    unsafe fn clear_bit(&self, index: usize) {
        // SAFETY: per contract the word lies inside the mapped bitmap.
        unsafe { *self.bitmap_word(index / 64) &= !(1 << (index % 64)) };
    }

    /// Find a run of `count` consecutive free blocks, starting at a
    /// multiple of `align` blocks. Returns the first block index.
    fn find_free_run(&self, count: usize, align: usize) -> Option<usize> {
        if count == 0 || self.size_blocks == 0 {
            return None;
        }

        let mut start = 0;
        while start + count <= self.size_blocks {
            if start % align != 0 {
                start += align - (start % align);
                continue;
            }

            // Skip fully-allocated words outright.
            // SAFETY: start < size_blocks, so the word is inside the bitmap.
            if start % 64 == 0 && unsafe { *self.bitmap_word(start / 64) } == u64::MAX {
                start += 64;
                continue;
            }

            // SAFETY: indices stay below size_blocks by the loop bound.
            let conflict = (start..start + count).find(|&i| unsafe { self.test_bit(i) });

            match conflict {
                None => return Some(start),
                Some(i) => start = i + 1,
            }
        }

        None
    }

    /// Mark and materialise `count` blocks at `start`. Rolls back on
    /// allocation or mapping failure.
    fn commit_run(
        &self,
        backend: &mut impl MemoryBackend,
        start: usize,
        count: usize,
    ) -> Option<VirtualAddress> {
        for i in 0..count {
            let index = start + i;
            let virt = self.block_addr(index);

            let frame = backend.alloc_frame();
            let mapped = frame.map(|f| (f, backend.map(virt, f, PteFlags::kernel_rw())));

            match mapped {
                Some((_f, true)) => {
                    // SAFETY: index < size_blocks per find_free_run.
                    unsafe { self.set_bit(index) };
                }
                Some((f, false)) => {
                    backend.free_frame(f);
                    self.rollback_run(backend, start, i);
                    return None;
                }
                None => {
                    self.rollback_run(backend, start, i);
                    return None;
                }
            }
        }

        Some(self.block_addr(start))
    }

    fn rollback_run(&self, backend: &mut impl MemoryBackend, start: usize, done: usize) {
        for i in 0..done {
            let index = start + i;
            // SAFETY: index < size_blocks per find_free_run.
            unsafe { self.clear_bit(index) };
            if let Some(frame) = backend.unmap(self.block_addr(index)) {
                backend.free_frame(frame);
            }
        }
    }

    /// Allocate one block.
    pub fn alloc_block(&self, backend: &mut impl MemoryBackend) -> Option<VirtualAddress> {
        self.alloc_blocks(backend, 1)
    }

    /// Allocate `count` contiguous blocks.
    pub fn alloc_blocks(
        &self,
        backend: &mut impl MemoryBackend,
        count: usize,
    ) -> Option<VirtualAddress> {
        let start = self.find_free_run(count, 1)?;
        self.commit_run(backend, start, count)
    }

    /// Allocate `count` contiguous blocks starting at a block index that is
    /// a multiple of `align`. `align` must be a nonzero power of two no
    /// greater than [`MAX_ALIGN`].
    pub fn alloc_blocks_aligned(
        &self,
        backend: &mut impl MemoryBackend,
        count: usize,
        align: usize,
    ) -> Option<VirtualAddress> {
        if align == 0 || !align.is_power_of_two() || align > MAX_ALIGN {
            return None;
        }

        let start = self.find_free_run(count, align)?;
        self.commit_run(backend, start, count)
    }

    /// Free `count` blocks at `addr`. Out-of-arena, unaligned, bitmap, or
    /// not-allocated addresses are a no-op.
    pub fn free(&self, backend: &mut impl MemoryBackend, addr: VirtualAddress, count: usize) {
        if addr.as_u64() & PAGE_RELATIVE_MASK != 0 {
            return;
        }

        let arena_end = self.begin.as_u64() + (self.size_blocks as u64) * PAGE_SIZE;
        if addr.as_u64() < self.begin.as_u64() || addr.as_u64() >= arena_end {
            return;
        }

        let start = ((addr.as_u64() - self.begin.as_u64()) / PAGE_SIZE) as usize;
        if start < self.reserved_blocks || start + count > self.size_blocks {
            return;
        }

        // Only whole, currently-allocated runs are freed.
        // SAFETY: indices bounded above.
        let all_set = (start..start + count).all(|i| unsafe { self.test_bit(i) });
        if !all_set {
            return;
        }

        for i in start..start + count {
            // SAFETY: indices bounded above.
            unsafe { self.clear_bit(i) };
            if let Some(frame) = backend.unmap(self.block_addr(i)) {
                backend.free_frame(frame);
            }
        }
    }

    /// Number of currently-allocated blocks (bitmap popcount), including
    /// the bitmap's own blocks.
    pub fn allocated_blocks(&self) -> usize {
        let words = self.size_blocks / 64;
        let mut total = 0;
        for w in 0..words {
            // SAFETY: word index bounded by the bitmap size.
            total += unsafe { (*self.bitmap_word(w)).count_ones() as usize };
        }
        total
    }
}

/// The system arena, sited by the boot path via [`init`].
static SYSTEM_FBA: SpinLock<Option<FixedBlockAllocator>> = SpinLock::new(None);

/// Initialise the system arena.
pub fn init(begin: VirtualAddress, size_blocks: usize) -> Result<(), MemError> {
    let fba = FixedBlockAllocator::init(&mut KernelBackend, begin, size_blocks)?;
    log::info!(
        "fba: arena at {:#018x}, {} blocks",
        begin.as_u64(),
        size_blocks
    );
    *SYSTEM_FBA.lock() = Some(fba);
    Ok(())
}

/// Allocate one block from the system arena.
pub fn alloc_block() -> Option<VirtualAddress> {
    SYSTEM_FBA
        .lock()
        .as_ref()?
        .alloc_block(&mut KernelBackend)
}

/// Allocate contiguous blocks from the system arena.
pub fn alloc_blocks(count: usize) -> Option<VirtualAddress> {
    SYSTEM_FBA
        .lock()
        .as_ref()?
        .alloc_blocks(&mut KernelBackend, count)
}

/// Free blocks back to the system arena.
pub fn free(addr: VirtualAddress, count: usize) {
    if let Some(fba) = SYSTEM_FBA.lock().as_ref() {
        fba.free(&mut KernelBackend, addr, count);
    }
}
