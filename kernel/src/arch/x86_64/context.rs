//! x86_64 context switch and thread entry trampolines
//!
//! A task's first switch-in "returns" into one of the trampolines below.
//! The initial stack frame is laid out so the restore path pops the target
//! entry point into `rdi` and the user stack pointer into `rsi`:
//!
//! ```text
//! seeded sp -> [rdi slot: entry point]
//!              [rsi slot: user stack]
//!              [13 x 8 bytes: remaining GP register slots, don't-care]
//!              [return address: trampoline]
//! stack top ->
//! ```

/// Bytes consumed by the initial frame: rdi + rsi + 13 registers + return
/// address.
pub const INITIAL_FRAME_SIZE: u64 = 8 + 8 + 104 + 8;

/// GDT selector for user code (RPL 3).
pub const USER_CODE_SELECTOR: u64 = 0x2b;

/// GDT selector for user data (RPL 3).
pub const USER_DATA_SELECTOR: u64 = 0x23;

/// Initial RFLAGS for user threads: interrupts enabled, reserved bit set.
pub const USER_INITIAL_RFLAGS: u64 = 0x202;

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
    let mut sp = stack_top;

    // SAFETY: all writes land within INITIAL_FRAME_SIZE bytes below
    // stack_top, which the caller guarantees is writable.
    unsafe {
        sp -= 8;
        (sp as *mut u64).write(trampoline);

        // Register slots restored into rax/rcx/rdx/rbx/rbp/r8-r15; initial
        // contents are never observed.
        sp -= 104;

        sp -= 8;
        (sp as *mut u64).write(user_sp); // popped into rsi

        sp -= 8;
        (sp as *mut u64).write(entry); // popped into rdi
    }

    sp
}

#[cfg(target_os = "none")]
core::arch::global_asm!(
    r#"
    .global anos_context_switch
    .global anos_kernel_thread_entrypoint
    .global anos_user_thread_entrypoint

// anos_context_switch(old_sp_out: rdi, new_sp: rsi)
anos_context_switch:
    push rax
    push rcx
    push rdx
    push rbx
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    push rsi
    push rdi
    mov [rdi], rsp
    mov rsp, rsi
    pop rdi
    pop rsi
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rbx
    pop rdx
    pop rcx
    pop rax
    ret

// First-run target for kernel threads: entry in rdi.
anos_kernel_thread_entrypoint:
    push rdi
    push rsi
    call {unlock}
    pop rsi
    pop rdi
    jmp rdi

// First-run target for user threads: entry in rdi, user stack in rsi.
anos_user_thread_entrypoint:
    push rdi
    push rsi
    call {unlock}
    pop rsi
    pop rdi
    mov rax, {user_data}
    push rax
    push rsi
    mov rax, {rflags}
    push rax
    mov rax, {user_code}
    push rax
    push rdi
    iretq
"#,
    unlock = sym crate::sched::unlock_after_switch,
    user_data = const USER_DATA_SELECTOR,
    user_code = const USER_CODE_SELECTOR,
    rflags = const USER_INITIAL_RFLAGS,
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

// Host builds: the switch is never executed, but the seeding logic above is
// exercised directly by the scheduler unit tests.

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
        let mut stack = [0u64; 64];
        let top = stack.as_mut_ptr() as u64 + 64 * 8;

        // SAFETY: top points one-past-the-end of a local array with ample
        // room for the initial frame.
        let sp = unsafe { seed_initial_stack(top, 0x1111, 0x2222, 0x3333) };

        assert_eq!(top - sp, INITIAL_FRAME_SIZE);

        // SAFETY: sp points into the local array seeded above.
        unsafe {
            assert_eq!((sp as *const u64).read(), 0x2222, "rdi slot holds entry");
            assert_eq!(
                ((sp + 8) as *const u64).read(),
                0x3333,
                "rsi slot holds user stack"
            );
            assert_eq!(
                ((top - 8) as *const u64).read(),
                0x1111,
                "return slot holds trampoline"
            );
        }
    }
}
