//! Direct-map bootstrap
//!
//! One-shot builder that installs the kernel's physical direct map
//! (`DIRECT_MAP_BASE + phys`) from the boot memory map, using the largest
//! natural page size at every aligned step. Until the direct map exists,
//! freshly-allocated page-table frames cannot be reached through it; the
//! builder therefore works through [`TempWindowAccess`], which borrows
//! top-level slots 1..3 as short-lived mapping windows and retires them,
//! with a full TLB flush, when the build completes.
//!
//! Invariants enforced here: a physical range is never mapped twice
//! (overlap panics), addresses beyond [`MAX_PHYS_ADDR`] are refused with a
//! warning, and sub-page tails are dropped with a warning.

use super::bootinfo::{MemoryMapEntry, MemoryMapEntryType};
use super::page_table::{table_index, PageTable, PageTableEntry, PteFlags, ROOT_LEVEL};
use super::vmm::TableAccess;
use super::{pmm, PhysicalAddress, VirtualAddress, MAX_PHYS_ADDR};

/// Page-size ladder: (leaf level, size), largest first.
#[cfg(target_arch = "riscv64")]
const NATURAL_PAGE_LEVELS: &[u8] = &[3, 2, 1, 0];

#[cfg(not(target_arch = "riscv64"))]
const NATURAL_PAGE_LEVELS: &[u8] = &[2, 1, 0];

/// Pages installed at each level, reported after the build.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirectMapStats {
    pub terapages: u64,
    pub gigapages: u64,
    pub megapages: u64,
    pub pages: u64,
}

impl DirectMapStats {
    fn count(&mut self, level: u8) {
        match level {
            3 => self.terapages += 1,
            2 => self.gigapages += 1,
            1 => self.megapages += 1,
            _ => self.pages += 1,
        }
    }
}

/// The direct-map builder. Works against any [`TableAccess`]; the kernel
/// boot path hands it a [`TempWindowAccess`], the tests heap-backed tables.
pub struct DirectMapBuilder<'a, A: TableAccess> {
    access: &'a mut A,
    root: PhysicalAddress,
    stats: DirectMapStats,
}

impl<'a, A: TableAccess> DirectMapBuilder<'a, A> {
    pub fn new(access: &'a mut A, root: PhysicalAddress) -> Self {
        Self {
            access,
            root,
            stats: DirectMapStats::default(),
        }
    }

    /// Install direct mappings for every mappable entry of the memory map.
    /// ACPI NVS is mapped read-only; the reclaimable categories and the
    /// kernel/module regions read-write.
    pub fn map_memmap(mut self, entries: &[MemoryMapEntry]) -> DirectMapStats {
        for entry in entries {
            let writeable = match entry.entry_type {
                MemoryMapEntryType::Usable
                | MemoryMapEntryType::AcpiReclaimable
                | MemoryMapEntryType::BootloaderReclaimable
                | MemoryMapEntryType::ExecutableAndModules => true,
                MemoryMapEntryType::AcpiNvs => false,
                _ => continue,
            };

            self.map_region(entry.base, entry.length, writeable);
        }

        self.stats
    }

    /// Map one physical region, stepping with the largest aligned natural
    /// page size at each point.
    pub fn map_region(&mut self, base: u64, length: u64, writeable: bool) {
        let flags = if writeable {
            PteFlags::kernel_rw() | PteFlags::GLOBAL
        } else {
            PteFlags::kernel_ro() | PteFlags::GLOBAL
        };

        let mut base = base;
        let mut length = length;

        while length > 0 {
            let Some(level) = NATURAL_PAGE_LEVELS
                .iter()
                .copied()
                .find(|&level| {
                    let size = super::page_table::level_page_size(level);
                    length >= size && base % size == 0
                })
            else {
                log::warn!(
                    "direct_map: {} byte area < PAGE_SIZE wasted at {:#018x}",
                    length,
                    base
                );
                return;
            };

            let size = super::page_table::level_page_size(level);
            self.map_leaf(base, level, flags);
            base += size;
            length -= size;
        }
    }

    /// Install one leaf of `level`-sized coverage at `DIRECT_MAP_BASE +
    /// base`.
    fn map_leaf(&mut self, base: u64, level: u8, flags: PteFlags) {
        let size = super::page_table::level_page_size(level);

        if base + size > MAX_PHYS_ADDR {
            log::warn!(
                "direct_map: refusing to map {:#018x} [{} bytes]: beyond the physical limit",
                base,
                size
            );
            return;
        }

        let vaddr = super::phys_to_virt(PhysicalAddress::new(base)).as_u64();
        let mut table_phys = self.root;

        for walk_level in ((level + 1)..=ROOT_LEVEL).rev() {
            let table = self.access.table_ptr(table_phys);
            let idx = table_index(vaddr, walk_level);

            // SAFETY: table_phys always names a live table reachable
            // through the TableAccess impl; idx is masked to 0..512.
            let entry = unsafe { (&(*table))[idx] };

            if !entry.is_present() {
                let child = self
                    .access
                    .alloc_table()
                    .unwrap_or_else(|| panic!("out of memory building the direct map"));
                // SAFETY: as above; the build is single-threaded.
                unsafe {
                    (&mut (*table))[idx] = PageTableEntry::new_table(child, false);
                }
                table_phys = child;
            } else if entry.is_leaf(walk_level) {
                panic!("physical memory already direct mapped; region overlap or bug");
            } else {
                table_phys = entry.phys();
            }
        }

        let table = self.access.table_ptr(table_phys);
        let idx = table_index(vaddr, level);

        // SAFETY: as above.
        unsafe {
            if (&(*table))[idx].is_present() {
                panic!("physical memory already direct mapped; region overlap or bug");
            }
            (&mut (*table))[idx] =
                PageTableEntry::new_leaf(PhysicalAddress::new(base), flags.for_level(level));
        }

        self.stats.count(level);
    }
}

/// Number of temporary mapping windows (top-level slots 1..=3).
const TEMP_WINDOW_COUNT: usize = 3;

/// Virtual address whose root-level index is `slot`, all lower indices 0.
/// Non-canonical concerns don't arise: slots 1..3 are in the low half.
const fn temp_window_base(slot: usize) -> u64 {
    (slot as u64) << 39
}

/// Table access for the bootstrap window: each of the borrowed top-level
/// slots carries a chain of page tables whose final PT maps exactly one
/// frame. New table frames rotate through the three windows; the windows
/// and their chains are torn down (entries cleared, full TLB flush) when
/// the access is dropped.
///
/// Chain construction happens before the direct map exists, so chain
/// frames are reached through the bootloader's higher-half mapping
/// (`hhdm_offset + phys`), which is still live during bootstrap.
pub struct TempWindowAccess {
    root: PhysicalAddress,
    hhdm_offset: u64,
    /// Final-level PT of each window chain.
    window_pt: [PhysicalAddress; TEMP_WINDOW_COUNT],
    /// Frame currently mapped through each window.
    mapped: [Option<PhysicalAddress>; TEMP_WINDOW_COUNT],
    /// Round-robin replacement cursor.
    next_window: usize,
}

impl TempWindowAccess {
    /// Claim top-level slots 1..3 of `root` for bootstrap windows.
    ///
    /// # Safety
    ///
    /// `root` must be the active root table, its slots 1..3 must be unused,
    /// and `hhdm_offset` must be a live identity-plus-offset mapping of all
    /// physical memory the PMM can return (the bootloader's HHDM).
    pub unsafe fn new(root: PhysicalAddress, hhdm_offset: u64) -> Self {
        let mut access = Self {
            root,
            hhdm_offset,
            window_pt: [PhysicalAddress::new(0); TEMP_WINDOW_COUNT],
            mapped: [None; TEMP_WINDOW_COUNT],
            next_window: 0,
        };

        for slot in 0..TEMP_WINDOW_COUNT {
            // SAFETY: per this function's contract the HHDM covers every
            // frame the PMM returns, and slots 1..3 are ours to populate.
            unsafe {
                access.build_window_chain(slot);
            }
        }

        access
    }

    fn early_table(&self, phys: PhysicalAddress) -> *mut PageTable {
        (self.hhdm_offset + phys.as_u64()) as *mut PageTable
    }

    fn alloc_chain_frame(&self) -> PhysicalAddress {
        let phys = pmm::alloc_page_checked()
            .unwrap_or_else(|| panic!("out of memory building bootstrap windows"));
        // SAFETY: fresh PMM frame, reachable via the HHDM per `new`'s
        // contract.
        unsafe { (*self.early_table(phys)).zero() };
        phys
    }

    /// Build the table chain for window `slot` (top-level slot `slot + 1`).
    unsafe fn build_window_chain(&mut self, slot: usize) {
        let vaddr = temp_window_base(slot + 1);
        let mut table_phys = self.root;

        for level in (1..=ROOT_LEVEL).rev() {
            let child = self.alloc_chain_frame();
            let table = self.early_table(table_phys);
            let idx = table_index(vaddr, level);
            // SAFETY: chain frames and the root are HHDM-reachable; the
            // build is single-threaded.
            unsafe {
                (&mut (*table))[idx] = PageTableEntry::new_table(child, false);
            }
            table_phys = child;
        }

        self.window_pt[slot] = table_phys;
    }

    /// Map `phys` through some window, returning its stable-for-now
    /// virtual address. At most [`TEMP_WINDOW_COUNT`] distinct frames are
    /// usable between calls; the walk in the builder touches at most that
    /// many.
    fn window_map(&mut self, phys: PhysicalAddress) -> u64 {
        for slot in 0..TEMP_WINDOW_COUNT {
            if self.mapped[slot] == Some(phys) {
                return temp_window_base(slot + 1);
            }
        }

        let slot = self.next_window;
        self.next_window = (self.next_window + 1) % TEMP_WINDOW_COUNT;

        let vaddr = temp_window_base(slot + 1);
        let pt = self.early_table(self.window_pt[slot]);
        // SAFETY: window PTs were built in `new` and are HHDM-reachable.
        unsafe {
            (&mut (*pt))[0] = PageTableEntry::new_leaf(phys, PteFlags::kernel_rw());
        }
        crate::arch::invalidate_page(vaddr);
        self.mapped[slot] = Some(phys);

        vaddr
    }
}

impl TableAccess for TempWindowAccess {
    fn alloc_table(&mut self) -> Option<PhysicalAddress> {
        let phys = pmm::alloc_page_checked()?;
        let table = self.window_map(phys) as *mut PageTable;
        // SAFETY: window_map just installed a writable mapping of this
        // fresh frame at the returned address.
        unsafe { (*table).zero() };
        Some(phys)
    }

    fn free_table(&mut self, phys: PhysicalAddress) {
        pmm::page_free(phys.as_u64());
    }

    fn table_ptr(&mut self, phys: PhysicalAddress) -> *mut PageTable {
        if phys == self.root {
            return self.early_table(phys);
        }
        self.window_map(phys) as *mut PageTable
    }

    fn invalidate(&mut self, virt: VirtualAddress) {
        crate::arch::invalidate_page(virt.as_u64());
    }
}

impl Drop for TempWindowAccess {
    fn drop(&mut self) {
        let root = self.early_table(self.root);

        for slot in 0..TEMP_WINDOW_COUNT {
            let vaddr = temp_window_base(slot + 1);
            let mut table_phys = self.root;

            // Free the chain bottom-up: collect it first.
            let mut chain = [PhysicalAddress::new(0); (ROOT_LEVEL as usize)];
            for (i, level) in ((1..=ROOT_LEVEL).rev()).enumerate() {
                let table = self.early_table(table_phys);
                let idx = table_index(vaddr, level);
                // SAFETY: chains built in `new` are still intact and
                // HHDM-reachable.
                let entry = unsafe { (&(*table))[idx] };
                chain[i] = entry.phys();
                table_phys = entry.phys();
            }

            // SAFETY: clearing our own borrowed slot.
            unsafe {
                (&mut (*root))[table_index(vaddr, ROOT_LEVEL)].clear();
            }

            for phys in chain {
                pmm::page_free(phys.as_u64());
            }
        }

        crate::arch::flush_tlb_all();
    }
}

/// Build the direct map during early boot: borrow the temp windows, map
/// the memory map, tear the windows down again.
///
/// # Safety
///
/// Must run once, on the BSP, before SMP or userspace are up, with `root`
/// active and the bootloader HHDM still intact.
pub unsafe fn init_direct_map(
    root: PhysicalAddress,
    hhdm_offset: u64,
    entries: &[MemoryMapEntry],
) -> DirectMapStats {
    // SAFETY: forwarded from this function's contract.
    let mut access = unsafe { TempWindowAccess::new(root, hhdm_offset) };
    let stats = DirectMapBuilder::new(&mut access, root).map_memmap(entries);
    drop(access);

    log::info!(
        "direct_map: {} tera / {} giga / {} mega / {} pages installed",
        stats.terapages,
        stats.gigapages,
        stats.megapages,
        stats.pages
    );

    stats
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::vmm::tests::HeapTables;
    use crate::mm::vmm::virt_to_phys_in;
    use crate::mm::{phys_to_virt, GIGA_PAGE_SIZE, MEGA_PAGE_SIZE};

    fn usable(base: u64, length: u64) -> MemoryMapEntry {
        MemoryMapEntry {
            base,
            length,
            entry_type: MemoryMapEntryType::Usable,
        }
    }

    #[test]
    fn small_region_uses_base_pages() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();

        let stats = DirectMapBuilder::new(&mut tables, root).map_memmap(&[usable(0x1000, 0x3000)]);

        assert_eq!(stats.pages, 3);
        assert_eq!(stats.megapages, 0);

        let virt = phys_to_virt(PhysicalAddress::new(0x2000));
        assert_eq!(
            virt_to_phys_in(&mut tables, root, virt),
            Some(PhysicalAddress::new(0x2000))
        );
    }

    #[cfg(not(target_arch = "riscv64"))]
    #[test]
    fn aligned_region_uses_largest_pages() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();

        // 1 GiB + 2 MiB + 4 KiB, all naturally aligned at the start.
        let stats = DirectMapBuilder::new(&mut tables, root).map_memmap(&[usable(
            GIGA_PAGE_SIZE,
            GIGA_PAGE_SIZE + MEGA_PAGE_SIZE + 0x1000,
        )]);

        assert_eq!(stats.gigapages, 1);
        assert_eq!(stats.megapages, 1);
        assert_eq!(stats.pages, 1);
    }

    #[cfg(not(target_arch = "riscv64"))]
    #[test]
    fn unaligned_region_steps_up_through_sizes() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();

        // Starts 4 KiB short of a 2 MiB boundary: one base page first,
        // then a megapage.
        let stats = DirectMapBuilder::new(&mut tables, root)
            .map_memmap(&[usable(MEGA_PAGE_SIZE - 0x1000, MEGA_PAGE_SIZE + 0x1000)]);

        assert_eq!(stats.pages, 1);
        assert_eq!(stats.megapages, 1);
    }

    #[test]
    fn beyond_phys_limit_is_skipped() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();

        let stats = DirectMapBuilder::new(&mut tables, root)
            .map_memmap(&[usable(MAX_PHYS_ADDR - 0x1000, 0x3000)]);

        // One page fits below the limit; the rest is refused.
        assert_eq!(stats.pages, 1);
    }

    #[test]
    fn acpi_nvs_is_mapped_read_only() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();

        DirectMapBuilder::new(&mut tables, root).map_memmap(&[MemoryMapEntry {
            base: 0x5000,
            length: 0x1000,
            entry_type: MemoryMapEntryType::AcpiNvs,
        }]);

        let virt = phys_to_virt(PhysicalAddress::new(0x5000));
        let (entry, _level) =
            crate::mm::vmm::walk_to_entry(&mut tables, root, virt).expect("NVS page mapped");
        assert!(
            !entry.flags().contains(PteFlags::WRITE),
            "ACPI NVS must not be writable"
        );
    }

    #[test]
    fn reserved_regions_are_not_mapped() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();

        let stats = DirectMapBuilder::new(&mut tables, root).map_memmap(&[MemoryMapEntry {
            base: 0x6000,
            length: 0x1000,
            entry_type: MemoryMapEntryType::Reserved,
        }]);

        assert_eq!(stats, DirectMapStats::default());
    }

    #[test]
    #[should_panic(expected = "already direct mapped")]
    fn overlapping_regions_panic() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();

        let mut builder = DirectMapBuilder::new(&mut tables, root);
        builder.map_region(0x1000, 0x1000, true);
        builder.map_region(0x1000, 0x1000, true);
    }
}
