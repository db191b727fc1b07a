//! Architecture abstraction layer
//!
//! The kernel core is written against this module's portable surface:
//! interrupt flag save/restore, root page-table register access, TLB
//! invalidation, the cycle counter, and the context-switch entry points.
//! Bare-metal builds route to the real instructions; host builds (where the
//! unit tests run) get inert stand-ins so no privileged instruction is ever
//! executed under the test harness.

pub mod entropy;
pub mod timer;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(target_arch = "x86_64")]
use self::x86_64 as imp;

#[cfg(target_arch = "riscv64")]
use self::riscv64 as imp;

#[cfg(not(any(target_arch = "x86_64", target_arch = "riscv64")))]
mod portable_fallback;

#[cfg(not(any(target_arch = "x86_64", target_arch = "riscv64")))]
use portable_fallback as imp;

/// Saved local-interrupt state, as returned by [`local_irq_save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqFlags(pub(crate) bool);

impl IrqFlags {
    /// Flags value representing "interrupts were disabled".
    pub const DISABLED: Self = Self(false);
}

/// Save the local interrupt-enable state and disable interrupts.
#[inline]
pub fn local_irq_save() -> IrqFlags {
    imp::local_irq_save()
}

/// Restore a previously saved interrupt-enable state.
#[inline]
pub fn local_irq_restore(flags: IrqFlags) {
    imp::local_irq_restore(flags)
}

/// Whether local interrupts are currently enabled.
#[inline]
pub fn interrupts_enabled() -> bool {
    imp::interrupts_enabled()
}

/// The hardware identity of the executing CPU (APIC ID / hart ID). The
/// scheduler's logical CPU numbering is layered on top by `sched::smp`.
#[inline]
pub fn hardware_cpu_id() -> u8 {
    imp::hardware_cpu_id()
}

/// Physical address of the active root page table (CR3 / satp).
#[inline]
pub fn read_page_table_root() -> u64 {
    imp::read_page_table_root()
}

/// Install a new root page table. Implies a full TLB flush.
///
/// # Safety
///
/// `root_phys` must be the physical address of a valid, fully-formed root
/// table that maps the currently-executing kernel.
#[inline]
pub unsafe fn write_page_table_root(root_phys: u64) {
    // SAFETY: contract forwarded to the caller.
    unsafe { imp::write_page_table_root(root_phys) }
}

/// Invalidate the TLB entry covering one virtual address on this CPU.
#[inline]
pub fn invalidate_page(virt: u64) {
    imp::invalidate_page(virt)
}

/// Invalidate the whole TLB on this CPU.
#[inline]
pub fn flush_tlb_all() {
    imp::flush_tlb_all()
}

/// Park the CPU until the next interrupt (hlt / wfi).
#[inline]
pub fn idle_wait() {
    imp::idle_wait()
}

/// Ask another CPU to run a scheduling pass soon. Best-effort; the baseline
/// relies on the target's next timer tick when no IPI path is wired up.
#[inline]
pub fn send_schedule_ipi(cpu: u8) {
    imp::send_schedule_ipi(cpu)
}

/// Read the CPU cycle counter (TSC / rdcycle).
#[inline]
pub fn read_timestamp() -> u64 {
    entropy::read_timestamp()
}

/// Seed a fresh kernel stack so that the first context switch into the task
/// returns into `trampoline` with `entry` and `user_sp` in the register
/// slots the trampoline expects. Returns the seeded stack pointer.
///
/// # Safety
///
/// `stack_top` must point one-past-the-end of a writable stack with room
/// for the initial frame.
#[inline]
pub unsafe fn seed_initial_stack(stack_top: u64, trampoline: u64, entry: u64, user_sp: u64) -> u64 {
    // SAFETY: contract forwarded to the caller.
    unsafe { imp::seed_initial_stack(stack_top, trampoline, entry, user_sp) }
}

/// Switch stacks: save callee state on the current stack, store the stack
/// pointer through `old_sp_out`, and resume on `new_sp`.
///
/// # Safety
///
/// `new_sp` must have been produced by [`seed_initial_stack`] or a previous
/// switch-out, and `old_sp_out` must be a valid slot for the outgoing task.
#[inline]
pub unsafe fn context_switch(old_sp_out: *mut u64, new_sp: u64) {
    // SAFETY: contract forwarded to the caller.
    unsafe { imp::context_switch(old_sp_out, new_sp) }
}

/// Address of the kernel-thread first-run trampoline.
#[inline]
pub fn kernel_thread_trampoline() -> u64 {
    imp::kernel_thread_trampoline()
}

/// Address of the user-thread first-run trampoline.
#[inline]
pub fn user_thread_trampoline() -> u64 {
    imp::user_thread_trampoline()
}
