//! x86_64 architecture support

pub mod context;
pub mod mmu;

pub(crate) use context::{
    context_switch, kernel_thread_trampoline, seed_initial_stack, user_thread_trampoline,
};
pub(crate) use mmu::{flush_tlb_all, invalidate_page, read_page_table_root, write_page_table_root};

use super::IrqFlags;

/// x86_64 syscall vector
pub const SYSCALL_VECTOR: u8 = 69;

#[inline]
pub(crate) fn local_irq_save() -> IrqFlags {
    #[cfg(target_os = "none")]
    {
        let enabled = ::x86_64::instructions::interrupts::are_enabled();
        ::x86_64::instructions::interrupts::disable();
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
            ::x86_64::instructions::interrupts::enable();
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
        ::x86_64::instructions::interrupts::are_enabled()
    }

    #[cfg(not(target_os = "none"))]
    {
        false
    }
}

/// Initial APIC ID from CPUID leaf 1.
pub(crate) fn hardware_cpu_id() -> u8 {
    #[cfg(target_os = "none")]
    {
        // SAFETY: CPUID leaf 1 is a read-only, always-available query in
        // long mode.
        let cpuid = unsafe { core::arch::x86_64::__cpuid(0x1) };
        ((cpuid.ebx >> 24) & 0xFF) as u8
    }

    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

#[inline]
pub(crate) fn idle_wait() {
    #[cfg(target_os = "none")]
    ::x86_64::instructions::hlt();

    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Post a scheduling IPI to another CPU. The LAPIC driver is outside the
/// core; the baseline leans on the target's timer tick instead.
#[inline]
pub(crate) fn send_schedule_ipi(_cpu: u8) {}
