//! Memory management
//!
//! The allocation stack is layered strictly bottom-up: the physical page
//! allocator ([`pmm`]) feeds the virtual-memory mapper ([`vmm`]) and the
//! direct-map bootstrap ([`direct_map`]); the fixed-block allocator
//! ([`fba`]) draws frames from the PMM and mappings from the VMM; the slab
//! allocator ([`slab`]) carves 64-byte objects out of FBA blocks. The
//! page-fault handler and TLB shootdown are cross-cutting consumers.

pub mod bootinfo;
pub mod direct_map;
pub mod fba;
pub mod page_fault;
pub mod page_table;
pub mod pmm;
pub mod refcount;
pub mod shootdown;
pub mod slab;
pub mod vmalloc;
pub mod vmm;

/// Size of one page / physical frame.
pub const PAGE_SIZE: u64 = 0x1000;

/// 2 MiB page (x86 PD-level, Sv48 level-1 leaf).
pub const MEGA_PAGE_SIZE: u64 = 0x20_0000;

/// 1 GiB page (x86 PDPT-level, Sv48 level-2 leaf).
pub const GIGA_PAGE_SIZE: u64 = 0x4000_0000;

/// 512 GiB page (Sv48 level-3 leaf; no x86 equivalent).
pub const TERA_PAGE_SIZE: u64 = 0x80_0000_0000;

/// Masks an address down to its containing page.
pub const PAGE_ALIGN_MASK: u64 = 0xFFFF_FFFF_FFFF_F000;

/// Extracts the page-relative part of an address.
pub const PAGE_RELATIVE_MASK: u64 = !PAGE_ALIGN_MASK;

/// Base of the kernel's physical direct map. Sits two root-table slots
/// into the kernel half, leaving the recursive slot and the static kernel
/// mapping above it.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8100_0000_0000;

/// Highest physical address the direct map will accept. Anything above is
/// refused with a warning during bootstrap.
pub const MAX_PHYS_ADDR: u64 = 0x7E00_0000_0000;

/// First virtual address belonging to kernel space. User-supplied pointers
/// must lie strictly below this.
pub const VM_KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;

/// Base of the per-CPU temporary mapping pages used by the COW copy path.
pub const PER_CPU_TEMP_PAGE_BASE: u64 = 0xFFFF_FFFF_8040_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & PAGE_RELATIVE_MASK == 0
    }

    pub const fn page_base(&self) -> Self {
        Self(self.0 & PAGE_ALIGN_MASK)
    }

    pub const fn offset(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & PAGE_RELATIVE_MASK == 0
    }

    pub const fn page_base(&self) -> Self {
        Self(self.0 & PAGE_ALIGN_MASK)
    }

    pub const fn offset(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Whether this address lies in the user half of the address space.
    pub const fn is_user(&self) -> bool {
        self.0 & 0xFFFF_8000_0000_0000 == 0
    }
}

/// Direct-map translation: physical frame to kernel virtual address. Only
/// valid once the direct map has been built.
pub const fn phys_to_virt(phys: PhysicalAddress) -> VirtualAddress {
    VirtualAddress(DIRECT_MAP_BASE + phys.0)
}

/// Reverse direct-map translation, for addresses inside the direct map.
pub fn virt_to_phys_direct(virt: VirtualAddress) -> Option<PhysicalAddress> {
    if virt.0 >= DIRECT_MAP_BASE && virt.0 < DIRECT_MAP_BASE + MAX_PHYS_ADDR {
        Some(PhysicalAddress(virt.0 - DIRECT_MAP_BASE))
    } else {
        None
    }
}

/// The temporary mapping page reserved for one CPU.
pub const fn per_cpu_temp_page_addr(cpu: u8) -> VirtualAddress {
    VirtualAddress(PER_CPU_TEMP_PAGE_BASE + (cpu as u64) * PAGE_SIZE)
}

/// Host-test stand-in for the active root register; see `arch` for how the
/// bare-metal builds read CR3/satp instead.
#[cfg(not(target_os = "none"))]
pub(crate) mod test_support {
    use core::sync::atomic::{AtomicU64, Ordering};

    static FAKE_ROOT: AtomicU64 = AtomicU64::new(0);

    pub(crate) fn fake_root() -> u64 {
        FAKE_ROOT.load(Ordering::Relaxed)
    }

    pub(crate) fn set_fake_root(root: u64) {
        FAKE_ROOT.store(root, Ordering::Relaxed);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn direct_map_round_trip() {
        let phys = PhysicalAddress::new(0x20_3000);
        let virt = phys_to_virt(phys);
        assert_eq!(virt.as_u64(), DIRECT_MAP_BASE + 0x20_3000);
        assert_eq!(virt_to_phys_direct(virt), Some(phys));
    }

    #[test]
    fn virt_outside_direct_map_does_not_translate() {
        assert!(virt_to_phys_direct(VirtualAddress::new(0x1000)).is_none());
        assert!(virt_to_phys_direct(VirtualAddress::new(VM_KERNEL_SPACE_START)).is_none());
    }

    #[test]
    fn user_half_detection() {
        assert!(VirtualAddress::new(0x7FFF_FFFF_F000).is_user());
        assert!(!VirtualAddress::new(VM_KERNEL_SPACE_START).is_user());
    }

    #[test]
    fn temp_pages_are_per_cpu_disjoint() {
        let a = per_cpu_temp_page_addr(0);
        let b = per_cpu_temp_page_addr(1);
        assert_eq!(b.as_u64() - a.as_u64(), PAGE_SIZE);
    }
}
