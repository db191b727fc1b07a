//! riscv64 MMU register access and TLB maintenance (Sv48)

/// Physical address of the active root table, from satp's PPN field.
pub(crate) fn read_page_table_root() -> u64 {
    #[cfg(target_os = "none")]
    {
        (riscv::register::satp::read().ppn() as u64) << 12
    }

    #[cfg(not(target_os = "none"))]
    {
        crate::mm::test_support::fake_root()
    }
}

/// Install a new root table in satp (Sv48 mode) and fence.
///
/// # Safety
///
/// `root_phys` must be the page-aligned physical address of a valid root
/// table that maps the running kernel.
pub(crate) unsafe fn write_page_table_root(root_phys: u64) {
    #[cfg(target_os = "none")]
    {
        // SAFETY: per this function's contract, root_phys names a valid
        // root table mapping the running kernel.
        unsafe {
            riscv::register::satp::set(
                riscv::register::satp::Mode::Sv48,
                0,
                (root_phys >> 12) as usize,
            );
        }
        riscv::asm::sfence_vma_all();
    }

    #[cfg(not(target_os = "none"))]
    {
        crate::mm::test_support::set_fake_root(root_phys);
    }
}

/// `sfence.vma` for one page.
#[inline]
pub(crate) fn invalidate_page(virt: u64) {
    #[cfg(target_os = "none")]
    riscv::asm::sfence_vma(0, virt as usize);

    #[cfg(not(target_os = "none"))]
    {
        let _ = virt;
    }
}

/// Full `sfence.vma`.
#[inline]
pub(crate) fn flush_tlb_all() {
    #[cfg(target_os = "none")]
    riscv::asm::sfence_vma_all();
}
