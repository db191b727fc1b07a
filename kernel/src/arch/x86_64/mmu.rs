//! x86_64 MMU register access and TLB maintenance

/// Physical address of the active PML4 (CR3, flags masked off).
pub(crate) fn read_page_table_root() -> u64 {
    #[cfg(target_os = "none")]
    {
        let (frame, _flags) = ::x86_64::registers::control::Cr3::read();
        frame.start_address().as_u64()
    }

    #[cfg(not(target_os = "none"))]
    {
        crate::mm::test_support::fake_root()
    }
}

/// Install a new PML4. Reloading CR3 flushes all non-global TLB entries.
///
/// # Safety
///
/// `root_phys` must be the page-aligned physical address of a valid PML4
/// that maps the running kernel.
pub(crate) unsafe fn write_page_table_root(root_phys: u64) {
    #[cfg(target_os = "none")]
    {
        use ::x86_64::registers::control::{Cr3, Cr3Flags};
        use ::x86_64::structures::paging::PhysFrame;
        use ::x86_64::PhysAddr;

        let frame = PhysFrame::containing_address(PhysAddr::new(root_phys));
        // SAFETY: per this function's contract, root_phys names a valid PML4
        // mapping the running kernel.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    #[cfg(not(target_os = "none"))]
    {
        crate::mm::test_support::set_fake_root(root_phys);
    }
}

/// `invlpg` for one page.
#[inline]
pub(crate) fn invalidate_page(virt: u64) {
    #[cfg(target_os = "none")]
    ::x86_64::instructions::tlb::flush(::x86_64::VirtAddr::new(virt));

    #[cfg(not(target_os = "none"))]
    {
        let _ = virt;
    }
}

/// Full TLB flush via CR3 reload.
#[inline]
pub(crate) fn flush_tlb_all() {
    #[cfg(target_os = "none")]
    ::x86_64::instructions::tlb::flush_all();
}
