//! riscv64 context switch and thread entry trampolines
//!
//! The initial frame mirrors the x86_64 layout in spirit: the restore path
//! loads the target entry point into `a0` and the user stack pointer into
//! `a1`, with `ra` aimed at the trampoline:
//!
//! ```text
//! seeded sp + 0   a0 slot: entry point
//! seeded sp + 8   a1 slot: user stack
//! seeded sp + 16  s0..s11 slots (96 bytes, don't-care)
//! seeded sp + 112 ra slot: trampoline
//! ```

/// Bytes consumed by the initial frame: a0 + a1 + s0..s11 + ra.
pub const INITIAL_FRAME_SIZE: u64 = 15 * 8;

/// Seed `stack_top` with the initial switch frame. Returns the stack
/// pointer to store as the task's saved SP.
///
/// # Safety
///
/// `stack_top` must point one-past-the-end of writable memory with at least
/// [`INITIAL_FRAME_SIZE`] bytes below it.
pub(crate) unsafe fn seed_initial_stack(
    stack_top: u64,
    trampoline: u64,
    entry: u64,
    user_sp: u64,
) -> u64 {
    let sp = stack_top - INITIAL_FRAME_SIZE;

    // SAFETY: all writes land within INITIAL_FRAME_SIZE bytes below
    // stack_top, which the caller guarantees is writable.
    unsafe {
        (sp as *mut u64).write(entry); // loaded into a0
        ((sp + 8) as *mut u64).write(user_sp); // loaded into a1
        ((sp + 112) as *mut u64).write(trampoline); // loaded into ra
    }

    sp
}

#[cfg(target_os = "none")]
core::arch::global_asm!(
    r#"
    .global anos_context_switch
    .global anos_kernel_thread_entrypoint
    .global anos_user_thread_entrypoint

// anos_context_switch(old_sp_out: a0, new_sp: a1)
anos_context_switch:
    addi sp, sp, -120
    sd a0, 0(sp)
    sd a1, 8(sp)
    sd s0, 16(sp)
    sd s1, 24(sp)
    sd s2, 32(sp)
    sd s3, 40(sp)
    sd s4, 48(sp)
    sd s5, 56(sp)
    sd s6, 64(sp)
    sd s7, 72(sp)
    sd s8, 80(sp)
    sd s9, 88(sp)
    sd s10, 96(sp)
    sd s11, 104(sp)
    sd ra, 112(sp)
    sd sp, 0(a0)
    mv sp, a1
    ld a0, 0(sp)
    ld a1, 8(sp)
    ld s0, 16(sp)
    ld s1, 24(sp)
    ld s2, 32(sp)
    ld s3, 40(sp)
    ld s4, 48(sp)
    ld s5, 56(sp)
    ld s6, 64(sp)
    ld s7, 72(sp)
    ld s8, 80(sp)
    ld s9, 88(sp)
    ld s10, 96(sp)
    ld s11, 104(sp)
    ld ra, 112(sp)
    addi sp, sp, 120
    ret

// First-run target for kernel threads: entry in a0.
anos_kernel_thread_entrypoint:
    mv s0, a0
    call {unlock}
    jr s0

// First-run target for user threads: entry in a0, user stack in a1.
anos_user_thread_entrypoint:
    mv s0, a0
    mv s1, a1
    call {unlock}
    csrw sepc, s0
    // Clear SPP (return to U-mode), set SPIE so sret re-enables interrupts.
    li t0, 0x100
    csrc sstatus, t0
    li t0, 0x20
    csrs sstatus, t0
    mv sp, s1
    sret
"#,
    unlock = sym crate::sched::unlock_after_switch,
);

#[cfg(target_os = "none")]
extern "C" {
    fn anos_context_switch(old_sp_out: *mut u64, new_sp: u64);
    fn anos_kernel_thread_entrypoint();
    fn anos_user_thread_entrypoint();
}

/// # Safety
///
/// See [`crate::arch::context_switch`].
#[cfg(target_os = "none")]
pub(crate) unsafe fn context_switch(old_sp_out: *mut u64, new_sp: u64) {
    // SAFETY: contract forwarded from crate::arch::context_switch.
    unsafe { anos_context_switch(old_sp_out, new_sp) }
}

#[cfg(target_os = "none")]
pub(crate) fn kernel_thread_trampoline() -> u64 {
    anos_kernel_thread_entrypoint as usize as u64
}

#[cfg(target_os = "none")]
pub(crate) fn user_thread_trampoline() -> u64 {
    anos_user_thread_entrypoint as usize as u64
}

/// # Safety
///
/// See [`crate::arch::context_switch`]. The host variant is inert.
#[cfg(not(target_os = "none"))]
pub(crate) unsafe fn context_switch(_old_sp_out: *mut u64, _new_sp: u64) {}

#[cfg(not(target_os = "none"))]
fn host_kernel_thread_entrypoint() {}

#[cfg(not(target_os = "none"))]
fn host_user_thread_entrypoint() {}

#[cfg(not(target_os = "none"))]
pub(crate) fn kernel_thread_trampoline() -> u64 {
    host_kernel_thread_entrypoint as usize as u64
}

#[cfg(not(target_os = "none"))]
pub(crate) fn user_thread_trampoline() -> u64 {
    host_user_thread_entrypoint as usize as u64
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn seeded_frame_layout() {
        let mut stack = [0u64; 32];
        let top = stack.as_mut_ptr() as u64 + 32 * 8;

        // SAFETY: top points one-past-the-end of a local array with ample
        // room for the initial frame.
        let sp = unsafe { seed_initial_stack(top, 0xAAAA, 0xBBBB, 0xCCCC) };

        assert_eq!(top - sp, INITIAL_FRAME_SIZE);

        // SAFETY: sp points into the local array seeded above.
        unsafe {
            assert_eq!((sp as *const u64).read(), 0xBBBB, "a0 slot holds entry");
            assert_eq!(
                ((sp + 8) as *const u64).read(),
                0xCCCC,
                "a1 slot holds user stack"
            );
            assert_eq!(
                ((sp + 112) as *const u64).read(),
                0xAAAA,
                "ra slot holds trampoline"
            );
        }
    }
}
