//! Inert architecture stand-ins for targets that are neither x86_64 nor
//! riscv64 (only reachable when the unit tests run on some other host).

use super::IrqFlags;

pub(crate) fn local_irq_save() -> IrqFlags {
    IrqFlags(false)
}

pub(crate) fn local_irq_restore(_flags: IrqFlags) {}

pub(crate) fn interrupts_enabled() -> bool {
    false
}

pub(crate) fn hardware_cpu_id() -> u8 {
    0
}

pub(crate) fn read_page_table_root() -> u64 {
    crate::mm::test_support::fake_root()
}

/// # Safety
///
/// See [`crate::arch::write_page_table_root`]. The fallback is inert.
pub(crate) unsafe fn write_page_table_root(root_phys: u64) {
    crate::mm::test_support::set_fake_root(root_phys);
}

pub(crate) fn invalidate_page(_virt: u64) {}

pub(crate) fn flush_tlb_all() {}

pub(crate) fn idle_wait() {
    core::hint::spin_loop();
}

pub(crate) fn send_schedule_ipi(_cpu: u8) {}

/// Seed with the x86_64-style frame layout; the frame is only inspected by
/// tests on this target.
///
/// # Safety
///
/// See [`crate::arch::seed_initial_stack`].
pub(crate) unsafe fn seed_initial_stack(
    stack_top: u64,
    trampoline: u64,
    entry: u64,
    user_sp: u64,
) -> u64 {
    let mut sp = stack_top;

    // SAFETY: contract forwarded from crate::arch::seed_initial_stack.
    unsafe {
        sp -= 8;
        (sp as *mut u64).write(trampoline);
        sp -= 104;
        sp -= 8;
        (sp as *mut u64).write(user_sp);
        sp -= 8;
        (sp as *mut u64).write(entry);
    }

    sp
}

/// # Safety
///
/// See [`crate::arch::context_switch`]. The fallback is inert.
pub(crate) unsafe fn context_switch(_old_sp_out: *mut u64, _new_sp: u64) {}

fn fallback_kernel_thread_entrypoint() {}

fn fallback_user_thread_entrypoint() {}

pub(crate) fn kernel_thread_trampoline() -> u64 {
    fallback_kernel_thread_entrypoint as usize as u64
}

pub(crate) fn user_thread_trampoline() -> u64 {
    fallback_user_thread_entrypoint as usize as u64
}
