//! Virtual-memory mapper
//!
//! Ongoing map/unmap of 4 KiB pages in any address space, table walks, and
//! address-space creation. All physical table frames are reached through
//! the [`TableAccess`] seam: the kernel uses the direct map, the unit tests
//! substitute heap-backed tables. A single coarse spinlock serialises
//! mapper mutations.

use super::page_table::{table_index, PageTable, PageTableEntry, PteFlags, ROOT_LEVEL};
use super::{pmm, PhysicalAddress, VirtualAddress};
use crate::error::MemError;
use crate::sync::SpinLock;

/// PML4 slot used for the x86_64 recursive self-map in fresh address
/// spaces. Kept for compatibility with early user-space tooling; the
/// direct map is authoritative for kernel table access.
#[cfg(not(target_arch = "riscv64"))]
pub const RECURSIVE_ENTRY: usize = 510;

/// How the mapper reaches physical page-table frames.
pub trait TableAccess {
    /// Allocate a zero-initialised page-table frame.
    fn alloc_table(&mut self) -> Option<PhysicalAddress>;

    /// Release a page-table frame.
    fn free_table(&mut self, phys: PhysicalAddress);

    /// A usable pointer to the table at `phys`.
    fn table_ptr(&mut self, phys: PhysicalAddress) -> *mut PageTable;

    /// Invalidate the local TLB entry for `virt`.
    fn invalidate(&mut self, virt: VirtualAddress);
}

/// Kernel-side table access through the direct map.
pub struct DirectMapAccess;

impl TableAccess for DirectMapAccess {
    fn alloc_table(&mut self) -> Option<PhysicalAddress> {
        let phys = pmm::alloc_page_checked()?;
        let table = super::phys_to_virt(phys).as_u64() as *mut PageTable;
        // SAFETY: the frame was just allocated from the PMM and the direct
        // map covers all PMM-managed memory, so the pointer is valid and
        // exclusively ours.
        unsafe { (*table).zero() };
        Some(phys)
    }

    fn free_table(&mut self, phys: PhysicalAddress) {
        pmm::page_free(phys.as_u64());
    }

    fn table_ptr(&mut self, phys: PhysicalAddress) -> *mut PageTable {
        super::phys_to_virt(phys).as_u64() as *mut PageTable
    }

    fn invalidate(&mut self, virt: VirtualAddress) {
        crate::arch::invalidate_page(virt.as_u64());
    }
}

/// Walk from `root` to the page table containing `virt`'s PTE, allocating
/// zeroed child tables as needed.
fn ensure_tables(
    access: &mut impl TableAccess,
    root: PhysicalAddress,
    virt: VirtualAddress,
    user: bool,
) -> Result<*mut PageTable, MemError> {
    let mut table_phys = root;

    for level in (1..=ROOT_LEVEL).rev() {
        let table = access.table_ptr(table_phys);
        let idx = table_index(virt.as_u64(), level);

        // SAFETY: table_phys names a live table frame reachable through
        // the TableAccess impl; indices are masked to 0..512.
        let entry = unsafe { (&(*table))[idx] };

        if !entry.is_present() {
            let child = access.alloc_table().ok_or(MemError::OutOfMemory)?;
            // SAFETY: as above; we hold the mapper lock, so no concurrent
            // walker observes the half-installed entry.
            unsafe {
                (&mut (*table))[idx] = PageTableEntry::new_table(child, user);
            }
            table_phys = child;
        } else if entry.is_leaf(level) {
            return Err(MemError::DescendedIntoLeaf {
                virt: virt.as_u64(),
            });
        } else {
            table_phys = entry.phys();
        }
    }

    Ok(access.table_ptr(table_phys))
}

/// Map one 4 KiB page into the address space rooted at `root`.
pub fn map_page_in(
    access: &mut impl TableAccess,
    root: PhysicalAddress,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PteFlags,
) -> Result<(), MemError> {
    if !virt.is_page_aligned() {
        return Err(MemError::UnalignedAddress {
            addr: virt.as_u64(),
        });
    }

    let user = flags.contains(PteFlags::USER);
    let pt = ensure_tables(access, root, virt, user)?;
    let idx = table_index(virt.as_u64(), 0);

    // SAFETY: ensure_tables returned a live PT for this address; index is
    // in range.
    unsafe {
        (&mut (*pt))[idx] = PageTableEntry::new_leaf(phys.page_base(), flags);
    }
    access.invalidate(virt);

    Ok(())
}

/// Like [`map_page_in`], but maps the page containing `phys`.
pub fn map_page_containing_in(
    access: &mut impl TableAccess,
    root: PhysicalAddress,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PteFlags,
) -> Result<(), MemError> {
    map_page_in(access, root, virt, phys.page_base(), flags)
}

/// Remove the mapping for `virt`, returning the physical target. Handles
/// leaves at any level (tera/giga/mega pages unmap whole).
pub fn unmap_page_in(
    access: &mut impl TableAccess,
    root: PhysicalAddress,
    virt: VirtualAddress,
) -> Option<PhysicalAddress> {
    let mut table_phys = root;

    for level in (0..=ROOT_LEVEL).rev() {
        let table = access.table_ptr(table_phys);
        let idx = table_index(virt.as_u64(), level);

        // SAFETY: live table frame per TableAccess; index in range.
        let entry = unsafe { (&(*table))[idx] };

        if !entry.is_present() {
            return None;
        }

        if entry.is_leaf(level) {
            let phys = entry.phys();
            // SAFETY: as above; clearing a PTE is a plain store under the
            // mapper lock.
            unsafe {
                (&mut (*table))[idx].clear();
            }
            access.invalidate(virt);
            return Some(phys);
        }

        table_phys = entry.phys();
    }

    None
}

/// Table-walk translation of `virt` in the space rooted at `root`.
pub fn virt_to_phys_in(
    access: &mut impl TableAccess,
    root: PhysicalAddress,
    virt: VirtualAddress,
) -> Option<PhysicalAddress> {
    walk_to_entry(access, root, virt).map(|(entry, level)| {
        let within = virt.as_u64() & (super::page_table::level_page_size(level) - 1);
        PhysicalAddress::new(entry.phys().as_u64() + within)
    })
}

/// Walk to the present leaf entry covering `virt`, if any.
pub fn walk_to_entry(
    access: &mut impl TableAccess,
    root: PhysicalAddress,
    virt: VirtualAddress,
) -> Option<(PageTableEntry, u8)> {
    let mut table_phys = root;

    for level in (0..=ROOT_LEVEL).rev() {
        let table = access.table_ptr(table_phys);
        let idx = table_index(virt.as_u64(), level);

        // SAFETY: live table frame per TableAccess; index in range.
        let entry = unsafe { (&(*table))[idx] };

        if !entry.is_present() {
            return None;
        }

        if entry.is_leaf(level) {
            return Some((entry, level));
        }

        table_phys = entry.phys();
    }

    None
}

/// Create a fresh address space: zeroed user half, kernel half shared with
/// the currently-active root. Returns the new root's physical address.
pub fn address_space_create_in(
    access: &mut impl TableAccess,
    current_root: PhysicalAddress,
) -> Option<PhysicalAddress> {
    let new_root_phys = access.alloc_table()?;
    let new_root = access.table_ptr(new_root_phys);
    let old_root = access.table_ptr(current_root);

    // SAFETY: both roots are live table frames; the new one is exclusively
    // ours, the old one is only read. Kernel-half entries are stable for
    // the lifetime of the system.
    unsafe {
        for i in 256..512 {
            (&mut (*new_root))[i] = (&(*old_root))[i];
        }

        #[cfg(not(target_arch = "riscv64"))]
        {
            (&mut (*new_root))[RECURSIVE_ENTRY] = PageTableEntry::new_table(new_root_phys, false);
        }
    }

    Some(new_root_phys)
}

/// Coarse lock serialising all mapper mutations.
static VMM_LOCK: SpinLock<()> = SpinLock::new(());

/// Map a page in the currently-active address space. Returns `false` on
/// PMM exhaustion, unaligned `virt`, or an attempt to map below a large
///-page leaf.
pub fn map_page(virt: VirtualAddress, phys: PhysicalAddress, flags: PteFlags) -> bool {
    map_page_in_root(current_root(), virt, phys, flags)
}

/// Map a page in the address space rooted at `root`.
pub fn map_page_in_root(
    root: PhysicalAddress,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PteFlags,
) -> bool {
    let _guard = VMM_LOCK.lock();
    let mut access = DirectMapAccess;
    match map_page_in(&mut access, root, virt, phys, flags) {
        Ok(()) => true,
        Err(err) => {
            log::warn!("vmm: map {:#x} failed: {:?}", virt.as_u64(), err);
            false
        }
    }
}

/// Map the page containing `phys` in the active address space.
pub fn map_page_containing(virt: VirtualAddress, phys: PhysicalAddress, flags: PteFlags) -> bool {
    map_page(virt, phys.page_base(), flags)
}

/// Unmap in the active address space; returns the physical target or 0.
pub fn unmap_page(virt: VirtualAddress) -> u64 {
    unmap_page_in_root(current_root(), virt)
}

/// Unmap in the address space rooted at `root`; returns phys or 0.
pub fn unmap_page_in_root(root: PhysicalAddress, virt: VirtualAddress) -> u64 {
    let _guard = VMM_LOCK.lock();
    let mut access = DirectMapAccess;
    unmap_page_in(&mut access, root, virt)
        .map(|p| p.as_u64())
        .unwrap_or(0)
}

/// Translate in the active address space.
pub fn virt_to_phys(virt: VirtualAddress) -> Option<PhysicalAddress> {
    let _guard = VMM_LOCK.lock();
    let mut access = DirectMapAccess;
    virt_to_phys_in(&mut access, current_root(), virt)
}

/// Physical page backing `virt` in the active space, or 0. The C-shaped
/// sibling of [`virt_to_phys`], used where a sentinel is more convenient.
pub fn virt_to_phys_page(virt: VirtualAddress) -> u64 {
    virt_to_phys(virt.page_base())
        .map(|p| p.as_u64())
        .unwrap_or(0)
}

/// Create a new address space seeded from the active one.
pub fn address_space_create() -> Option<PhysicalAddress> {
    let _guard = VMM_LOCK.lock();
    let mut access = DirectMapAccess;
    address_space_create_in(&mut access, current_root())
}

/// Physical address of the currently-active root table.
pub fn current_root() -> PhysicalAddress {
    PhysicalAddress::new(crate::arch::read_page_table_root())
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec::Vec;

    /// Heap-backed table access: "physical" addresses are host pointers.
    pub(crate) struct HeapTables {
        allocated: Vec<*mut PageTable>,
        pub invalidations: Vec<u64>,
    }

    impl HeapTables {
        pub(crate) fn new() -> Self {
            Self {
                allocated: Vec::new(),
                invalidations: Vec::new(),
            }
        }

        pub(crate) fn new_root(&mut self) -> PhysicalAddress {
            self.alloc_table().expect("heap table allocation")
        }

        pub(crate) fn table_count(&self) -> usize {
            self.allocated.len()
        }
    }

    impl Drop for HeapTables {
        fn drop(&mut self) {
            for table in self.allocated.drain(..) {
                // SAFETY: every pointer came from Box::into_raw below and
                // is dropped exactly once here.
                drop(unsafe { Box::from_raw(table) });
            }
        }
    }

    impl TableAccess for HeapTables {
        fn alloc_table(&mut self) -> Option<PhysicalAddress> {
            let table = Box::into_raw(Box::new(PageTable::new()));
            self.allocated.push(table);
            Some(PhysicalAddress::new(table as u64))
        }

        fn free_table(&mut self, _phys: PhysicalAddress) {}

        fn table_ptr(&mut self, phys: PhysicalAddress) -> *mut PageTable {
            phys.as_u64() as *mut PageTable
        }

        fn invalidate(&mut self, virt: VirtualAddress) {
            self.invalidations.push(virt.as_u64());
        }
    }

    #[test]
    fn map_unmap_round_trip() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();
        let virt = VirtualAddress::new(0xFFFF_FFFF_9000_0000);
        let phys = PhysicalAddress::new(0x1000);

        map_page_in(&mut tables, root, virt, phys, PteFlags::kernel_rw())
            .expect("mapping a fresh page should succeed");

        assert_eq!(
            virt_to_phys_in(&mut tables, root, virt),
            Some(phys),
            "translation must return the mapped frame"
        );

        let unmapped = unmap_page_in(&mut tables, root, virt);
        assert_eq!(unmapped, Some(phys));

        assert_eq!(
            virt_to_phys_in(&mut tables, root, virt),
            None,
            "translation must fail after unmap"
        );
    }

    #[test]
    fn map_allocates_intermediate_tables_once() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();
        let virt_a = VirtualAddress::new(0xFFFF_FFFF_9000_0000);
        let virt_b = VirtualAddress::new(0xFFFF_FFFF_9000_1000);

        map_page_in(
            &mut tables,
            root,
            virt_a,
            PhysicalAddress::new(0x1000),
            PteFlags::kernel_rw(),
        )
        .expect("first mapping");
        let after_first = tables.table_count();

        map_page_in(
            &mut tables,
            root,
            virt_b,
            PhysicalAddress::new(0x2000),
            PteFlags::kernel_rw(),
        )
        .expect("second mapping in same PT");

        assert_eq!(
            tables.table_count(),
            after_first,
            "adjacent page must reuse existing tables"
        );
    }

    #[test]
    fn unaligned_virt_is_rejected() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();
        let result = map_page_in(
            &mut tables,
            root,
            VirtualAddress::new(0xFFFF_FFFF_9000_0123),
            PhysicalAddress::new(0x1000),
            PteFlags::kernel_rw(),
        );
        assert_eq!(
            result,
            Err(MemError::UnalignedAddress {
                addr: 0xFFFF_FFFF_9000_0123
            })
        );
    }

    #[test]
    fn map_containing_rounds_phys_down() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();
        let virt = VirtualAddress::new(0xFFFF_FFFF_9000_0000);

        map_page_containing_in(
            &mut tables,
            root,
            virt,
            PhysicalAddress::new(0x1ABC),
            PteFlags::kernel_rw(),
        )
        .expect("containing map");

        assert_eq!(
            virt_to_phys_in(&mut tables, root, virt),
            Some(PhysicalAddress::new(0x1000))
        );
    }

    #[test]
    fn unmap_missing_level_returns_none() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();
        assert_eq!(
            unmap_page_in(&mut tables, root, VirtualAddress::new(0xFFFF_FFFF_9000_0000)),
            None
        );
    }

    #[cfg(not(target_arch = "riscv64"))]
    #[test]
    fn unmap_handles_megapage_leaf() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();
        let virt = VirtualAddress::new(0xFFFF_FFFF_8000_0000);

        // Hand-install a 2 MiB leaf at PD level.
        let pd_phys = {
            let pdpt = tables.alloc_table().expect("pdpt");
            let pd = tables.alloc_table().expect("pd");

            let root_ptr = tables.table_ptr(root);
            // SAFETY: pointers come from HeapTables and stay alive for the
            // whole test.
            unsafe {
                (&mut (*root_ptr))[table_index(virt.as_u64(), 3)] = PageTableEntry::new_table(pdpt, false);
                let pdpt_ptr = tables.table_ptr(pdpt);
                (&mut (*pdpt_ptr))[table_index(virt.as_u64(), 2)] = PageTableEntry::new_table(pd, false);
                let pd_ptr = tables.table_ptr(pd);
                (&mut (*pd_ptr))[table_index(virt.as_u64(), 1)] = PageTableEntry::new_leaf(
                    PhysicalAddress::new(0x20_0000),
                    PteFlags::kernel_rw().for_level(1),
                );
            }
            pd
        };
        let _ = pd_phys;

        assert_eq!(
            unmap_page_in(&mut tables, root, virt),
            Some(PhysicalAddress::new(0x20_0000)),
            "unmap must return the large-page target"
        );
    }

    #[cfg(not(target_arch = "riscv64"))]
    #[test]
    fn mapping_below_a_leaf_fails() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();
        let virt = VirtualAddress::new(0xFFFF_FFFF_8000_0000);

        let pdpt = tables.alloc_table().expect("pdpt");
        let root_ptr = tables.table_ptr(root);
        // SAFETY: heap-backed tables live for the test.
        unsafe {
            (&mut (*root_ptr))[table_index(virt.as_u64(), 3)] = PageTableEntry::new_table(pdpt, false);
            let pdpt_ptr = tables.table_ptr(pdpt);
            // 1 GiB leaf at PDPT level.
            (&mut (*pdpt_ptr))[table_index(virt.as_u64(), 2)] = PageTableEntry::new_leaf(
                PhysicalAddress::new(0x4000_0000),
                PteFlags::kernel_rw().for_level(2),
            );
        }

        let result = map_page_in(
            &mut tables,
            root,
            virt,
            PhysicalAddress::new(0x1000),
            PteFlags::kernel_rw(),
        );
        assert_eq!(
            result,
            Err(MemError::DescendedIntoLeaf {
                virt: virt.as_u64()
            })
        );
    }

    #[test]
    fn address_space_create_shares_kernel_half() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();

        // Put something in the kernel half of the current root.
        let kernel_virt = VirtualAddress::new(0xFFFF_FFFF_9000_0000);
        map_page_in(
            &mut tables,
            root,
            kernel_virt,
            PhysicalAddress::new(0x5000),
            PteFlags::kernel_rw(),
        )
        .expect("kernel mapping");

        let new_root =
            address_space_create_in(&mut tables, root).expect("address space creation");

        assert_eq!(
            virt_to_phys_in(&mut tables, new_root, kernel_virt),
            Some(PhysicalAddress::new(0x5000)),
            "kernel half must be visible in the new space"
        );

        // User half starts empty.
        assert_eq!(
            virt_to_phys_in(&mut tables, new_root, VirtualAddress::new(0x40_0000)),
            None
        );

        #[cfg(not(target_arch = "riscv64"))]
        {
            let root_ptr = tables.table_ptr(new_root);
            // SAFETY: heap-backed table.
            let entry = unsafe { (&(*root_ptr))[RECURSIVE_ENTRY] };
            assert_eq!(
                entry.phys(),
                new_root,
                "recursive entry must point at the new root"
            );
        }
    }

    #[test]
    fn invalidations_issued_on_map_and_unmap() {
        let mut tables = HeapTables::new();
        let root = tables.new_root();
        let virt = VirtualAddress::new(0xFFFF_FFFF_9000_0000);

        map_page_in(
            &mut tables,
            root,
            virt,
            PhysicalAddress::new(0x1000),
            PteFlags::kernel_rw(),
        )
        .expect("map");
        unmap_page_in(&mut tables, root, virt).expect("unmap");

        assert_eq!(tables.invalidations, std::vec![virt.as_u64(), virt.as_u64()]);
    }
}
