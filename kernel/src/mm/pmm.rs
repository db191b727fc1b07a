//! Physical page allocator
//!
//! A modified stack allocator: free physical memory is held as a stack of
//! contiguous runs `{base, pages}`. Single-page allocation pops off the top
//! run; multi-page allocation scans for the first run big enough and splits
//! it (or removes an exact fit). Freeing coalesces with the top run when
//! the page is adjacent on either side, otherwise pushes a new run.
//!
//! Failures return [`PMM_ALLOC_FAILED`], distinguishable from any valid
//! page address because real pages are page aligned. Callers must check.

use super::bootinfo::{MemoryMapEntry, MemoryMapEntryType};
use super::{PhysicalAddress, PAGE_ALIGN_MASK, PAGE_RELATIVE_MASK, PAGE_SIZE};
use crate::sync::SpinLock;

/// Sentinel returned when allocation fails. Never a valid page address.
pub const PMM_ALLOC_FAILED: u64 = 0xFF;

/// Maximum number of discontiguous runs the region can track.
pub const MAX_MEMORY_BLOCKS: usize = 256;

/// Whether an address returned by the allocator is the failure sentinel.
pub const fn is_alloc_failure(addr: u64) -> bool {
    addr & PAGE_RELATIVE_MASK != 0
}

/// One contiguous run of free physical pages.
#[derive(Debug, Clone, Copy)]
struct MemoryBlock {
    base: u64,
    pages: u64,
}

/// A region of managed physical memory: the run stack plus byte totals.
///
/// Invariants: runs are disjoint and page aligned; `free` equals the sum of
/// `pages * PAGE_SIZE` over all runs.
pub struct MemoryRegion {
    blocks: [MemoryBlock; MAX_MEMORY_BLOCKS],
    len: usize,
    size: u64,
    free: u64,
}

impl MemoryRegion {
    pub const fn empty() -> Self {
        Self {
            blocks: [MemoryBlock { base: 0, pages: 0 }; MAX_MEMORY_BLOCKS],
            len: 0,
            size: 0,
            free: 0,
        }
    }

    /// Build the region from the bootloader memory map. Only usable,
    /// bootloader-reclaimable, and (optionally) executable-and-modules
    /// entries are stacked; everything is clipped to page boundaries and to
    /// `managed_base`.
    pub fn from_memory_map(
        memmap: &[MemoryMapEntry],
        managed_base: u64,
        reclaim_exec_mods: bool,
    ) -> Self {
        let mut region = Self::empty();

        for entry in memmap {
            if entry.length == 0 {
                continue;
            }

            match entry.entry_type {
                MemoryMapEntryType::Usable | MemoryMapEntryType::BootloaderReclaimable => {}
                MemoryMapEntryType::ExecutableAndModules => {
                    if !reclaim_exec_mods {
                        log::debug!(
                            "pmm: ignoring executable/modules region at {:#x} (reclaim disabled)",
                            entry.base
                        );
                        continue;
                    }
                }
                _ => continue,
            }

            // Round the start up and the end down to page boundaries; the
            // bootloader only guarantees alignment for some entry types.
            let mut start = entry.base & PAGE_ALIGN_MASK;
            if entry.base > start {
                start += PAGE_SIZE;
            }
            let end = (entry.base + entry.length) & PAGE_ALIGN_MASK;

            // Clip anything below the managed base.
            let start = if start < managed_base {
                if end <= managed_base {
                    continue;
                }
                managed_base
            } else {
                start
            };

            if end <= start {
                continue;
            }

            let total_bytes = end - start;
            region.push_run(start, total_bytes / PAGE_SIZE);
            region.size += total_bytes;
            region.free += total_bytes;
        }

        region
    }

    fn push_run(&mut self, base: u64, pages: u64) {
        if self.len == MAX_MEMORY_BLOCKS {
            log::warn!(
                "pmm: run stack full, dropping {} pages at {:#x}",
                pages,
                base
            );
            self.free = self.free.saturating_sub(pages * PAGE_SIZE);
            return;
        }
        self.blocks[self.len] = MemoryBlock { base, pages };
        self.len += 1;
    }

    /// Total managed bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Currently free bytes.
    pub fn free(&self) -> u64 {
        self.free
    }

    /// Allocate one page off the top run. Returns [`PMM_ALLOC_FAILED`] when
    /// the stack is empty.
    pub fn page_alloc(&mut self) -> u64 {
        if self.len == 0 {
            return PMM_ALLOC_FAILED;
        }

        self.free -= PAGE_SIZE;

        let top = &mut self.blocks[self.len - 1];
        let page = top.base;

        if top.pages > 1 {
            top.base += PAGE_SIZE;
            top.pages -= 1;
        } else {
            self.len -= 1;
        }

        page
    }

    /// Allocate `count` contiguous pages: first run with more than `count`
    /// pages is split, an exact fit is removed whole. Scans from the top of
    /// the stack downward.
    pub fn page_alloc_m(&mut self, count: u64) -> u64 {
        if self.len == 0 || count == 0 {
            return PMM_ALLOC_FAILED;
        }

        for i in (0..self.len).rev() {
            let block = self.blocks[i];

            if block.pages > count {
                let page = block.base;
                self.blocks[i].base += count * PAGE_SIZE;
                self.blocks[i].pages -= count;
                self.free -= count * PAGE_SIZE;
                return page;
            }

            if block.pages == count {
                let page = block.base;
                // Replace with the top run (if this isn't it), then pop.
                self.blocks[i] = self.blocks[self.len - 1];
                self.len -= 1;
                self.free -= count * PAGE_SIZE;
                return page;
            }
        }

        PMM_ALLOC_FAILED
    }

    /// Return one page. Unaligned addresses are a no-op. Adjacent pages
    /// coalesce into the top run; anything else pushes a new run.
    pub fn page_free(&mut self, page: u64) {
        if page & PAGE_RELATIVE_MASK != 0 {
            return;
        }

        self.free += PAGE_SIZE;

        if self.len > 0 {
            let top = &mut self.blocks[self.len - 1];

            if top.base == page + PAGE_SIZE {
                // Directly below the top run: extend downward.
                top.base = page;
                top.pages += 1;
                return;
            }

            if top.base + top.pages * PAGE_SIZE == page {
                // Directly above the top run: extend upward.
                top.pages += 1;
                return;
            }
        }

        self.push_run(page, 1);
    }

    /// Number of runs currently stacked.
    pub fn run_count(&self) -> usize {
        self.len
    }
}

/// The system physical region, built from the bootloader memory map at
/// boot. All mutation goes through the spinlock with interrupts disabled.
pub static PHYSICAL_REGION: SpinLock<MemoryRegion> = SpinLock::new(MemoryRegion::empty());

/// Initialise the global region from the boot memory map.
pub fn init(memmap: &[MemoryMapEntry], managed_base: u64, reclaim_exec_mods: bool) {
    let region = MemoryRegion::from_memory_map(memmap, managed_base, reclaim_exec_mods);
    log::info!(
        "pmm: managing {} KiB across {} runs",
        region.size() / 1024,
        region.run_count()
    );
    *PHYSICAL_REGION.lock() = region;
}

/// Allocate one page from the system region.
pub fn page_alloc() -> u64 {
    PHYSICAL_REGION.lock().page_alloc()
}

/// Allocate `count` contiguous pages from the system region.
pub fn page_alloc_m(count: u64) -> u64 {
    PHYSICAL_REGION.lock().page_alloc_m(count)
}

/// Free one page back to the system region.
pub fn page_free(page: u64) {
    PHYSICAL_REGION.lock().page_free(page)
}

/// Checked single-page allocation for Rust-side callers.
pub fn alloc_page_checked() -> Option<PhysicalAddress> {
    let page = page_alloc();
    if is_alloc_failure(page) {
        None
    } else {
        Some(PhysicalAddress::new(page))
    }
}
