//! riscv64 (Sv48) architecture support

pub mod context;
pub mod mmu;

pub(crate) use context::{
    context_switch, kernel_thread_trampoline, seed_initial_stack, user_thread_trampoline,
};
pub(crate) use mmu::{flush_tlb_all, invalidate_page, read_page_table_root, write_page_table_root};

use super::IrqFlags;

#[inline]
pub(crate) fn local_irq_save() -> IrqFlags {
    #[cfg(target_os = "none")]
    {
        let enabled = riscv::register::sstatus::read().sie();
        // SAFETY: clearing SIE only masks supervisor interrupts on this
        // hart; the prior state is captured for the matching restore.
        unsafe { riscv::register::sstatus::clear_sie() };
        IrqFlags(enabled)
    }

    #[cfg(not(target_os = "none"))]
    {
        IrqFlags(false)
    }
}

#[inline]
pub(crate) fn local_irq_restore(flags: IrqFlags) {
    #[cfg(target_os = "none")]
    {
        if flags.0 {
            // SAFETY: re-enables supervisor interrupts previously enabled
            // at the matching save.
            unsafe { riscv::register::sstatus::set_sie() };
        }
    }

    #[cfg(not(target_os = "none"))]
    {
        let _ = flags;
    }
}

#[inline]
pub(crate) fn interrupts_enabled() -> bool {
    #[cfg(target_os = "none")]
    {
        riscv::register::sstatus::read().sie()
    }

    #[cfg(not(target_os = "none"))]
    {
        false
    }
}

/// Hart ID, stashed in `tp` by the boot path before Rust runs.
pub(crate) fn hardware_cpu_id() -> u8 {
    #[cfg(target_os = "none")]
    {
        let tp: u64;
        // SAFETY: reading the thread-pointer register has no side effects.
        unsafe { core::arch::asm!("mv {}, tp", out(reg) tp) };
        tp as u8
    }

    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

#[inline]
pub(crate) fn idle_wait() {
    #[cfg(target_os = "none")]
    riscv::asm::wfi();

    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Post a scheduling IPI via SBI. The SBI glue is outside the core; the
/// baseline leans on the target's timer tick instead.
#[inline]
pub(crate) fn send_schedule_ipi(_cpu: u8) {}
