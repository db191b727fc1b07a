//! System call surface
//!
//! Vector 69 on x86_64, `ecall` on riscv64. The ABI carries a call number,
//! up to five register arguments, and one 64-bit result. User-supplied
//! pointers must lie below the kernel-space boundary; calls that hand out
//! identifiers (TIDs, PIDs, cookies) return them directly, everything else
//! answers with one of the `SYSCALL_*` codes.

use crate::mm::{fba, pmm, vmm, VirtualAddress, PAGE_RELATIVE_MASK, VM_KERNEL_SPACE_START};
use crate::process::{self, AddressSpaceRegion, RegionFlags, MAX_PROCESS_REGIONS};
use crate::sched::{self, smp, TaskClass};

/// Success.
pub const SYSCALL_OK: u64 = 0;

/// Generic failure.
pub const SYSCALL_FAILURE: u64 = u64::MAX;

/// Arguments failed validation.
pub const SYSCALL_BADARGS: u64 = u64::MAX - 1;

/// Unknown syscall number.
pub const SYSCALL_BAD_NUMBER: u64 = u64::MAX - 2;

/// Kernel stack pages handed to each new thread.
const THREAD_KERNEL_STACK_BLOCKS: usize = 4;

/// Memory statistics handed to userspace by `memstats`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AnosMemInfo {
    pub physical_total: u64,
    pub physical_avail: u64,
}

/// Region descriptor as passed to `create_process`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemoryRegion {
    pub start: u64,
    pub length: u64,
    pub flags: u32,
}

/// Whether a user-supplied pointer may be dereferenced on their behalf.
fn user_pointer_ok(addr: u64) -> bool {
    addr != 0 && addr < VM_KERNEL_SPACE_START
}

/// The dispatcher. Also the receiver-side payload boundary: any payload
/// page mapped by an earlier `channel_recv` is torn down on entry.
pub fn dispatch(nr: u64, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> u64 {
    release_pending_payload();

    match nr {
        0 => handle_testcall(a0, a1, a2, a3, a4),
        1 => handle_debugprint(a0),
        2 => handle_debugchar(a0),
        3 => handle_create_thread(a0, a1),
        4 => handle_memstats(a0),
        5 => handle_sleep(a0),
        6 => handle_create_process(a0, a1, a2, a3, a4),
        7 => crate::ipc::channel_create(),
        8 => {
            crate::ipc::channel_destroy(a0);
            SYSCALL_OK
        }
        9 => handle_channel_send(a0, a1, a2, a3),
        10 => handle_channel_recv(a0, a1, a2, a3),
        11 => crate::ipc::channel_reply(a0, a1),
        _ => SYSCALL_BAD_NUMBER,
    }
}

/// Unmap the payload page a previous `channel_recv` borrowed into this
/// task, if any.
fn release_pending_payload() {
    let Some(current) = sched::task_current() else {
        return;
    };

    // SAFETY: current is this CPU's running task; only it touches the
    // pending slot.
    let pending = unsafe { current.task_mut().pending_payload_unmap.take() };
    if let Some(buffer) = pending {
        vmm::unmap_page(buffer);
    }
}

fn handle_testcall(a0: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> u64 {
    log::debug!(
        "testcall: {:02x} {:02x} {:02x} {:02x} {:02x}",
        a0 as u8,
        a1 as u8,
        a2 as u8,
        a3 as u8,
        a4 as u8
    );
    42
}

fn handle_debugprint(message_ptr: u64) -> u64 {
    if !user_pointer_ok(message_ptr) {
        return SYSCALL_BADARGS;
    }

    // Bounded C-string walk; anything unprintable just stops the scan.
    let mut len = 0usize;
    // SAFETY: the pointer was range-checked as user memory and the walk is
    // bounded; the owning task's mapping covers it or it faults on the
    // task's own behalf.
    unsafe {
        let base = message_ptr as *const u8;
        while len < 256 && base.add(len).read() != 0 {
            len += 1;
        }
        let bytes = core::slice::from_raw_parts(base, len);
        if let Ok(text) = core::str::from_utf8(bytes) {
            crate::print!("{}", text);
        }
    }

    SYSCALL_OK
}

fn handle_debugchar(chr: u64) -> u64 {
    crate::print!("{}", (chr as u8) as char);
    SYSCALL_OK
}

fn handle_create_thread(entry: u64, user_sp: u64) -> u64 {
    if entry >= VM_KERNEL_SPACE_START || user_sp >= VM_KERNEL_SPACE_START {
        return SYSCALL_BADARGS;
    }

    let Some(current) = sched::task_current() else {
        return SYSCALL_FAILURE;
    };

    // SAFETY: the current task's identity fields are stable.
    let (owner_pid, root) = unsafe {
        let t = current.task();
        (t.owner_pid, t.root_table)
    };

    let Some(kernel_stack) = fba::alloc_blocks(THREAD_KERNEL_STACK_BLOCKS) else {
        return SYSCALL_FAILURE;
    };
    let stack_top = VirtualAddress::new(
        kernel_stack.as_u64() + (THREAD_KERNEL_STACK_BLOCKS as u64) * crate::mm::PAGE_SIZE,
    );

    let Some(task) = sched::task::task_create_user(
        owner_pid,
        root,
        user_sp,
        stack_top,
        entry,
        TaskClass::Normal,
    ) else {
        fba::free(kernel_stack, THREAD_KERNEL_STACK_BLOCKS);
        return SYSCALL_FAILURE;
    };

    smp::sched_unblock_on(task, smp::sched_find_target_cpu());

    // SAFETY: tid is immutable after creation.
    unsafe { task.task().tid }
}

fn handle_memstats(info_ptr: u64) -> u64 {
    if !user_pointer_ok(info_ptr) || info_ptr % core::mem::align_of::<AnosMemInfo>() as u64 != 0 {
        return SYSCALL_BADARGS;
    }

    let (total, avail) = {
        let region = pmm::PHYSICAL_REGION.lock();
        (region.size(), region.free())
    };

    // SAFETY: the pointer was range- and alignment-checked; writes land in
    // the calling task's own memory.
    unsafe {
        (info_ptr as *mut AnosMemInfo).write(AnosMemInfo {
            physical_total: total,
            physical_avail: avail,
        });
    }

    SYSCALL_OK
}

fn handle_sleep(nanos: u64) -> u64 {
    if !smp::tasking_up() {
        return SYSCALL_OK;
    }

    let Some(current) = sched::task_current() else {
        // Nothing schedulable is running yet; sleeping the boot context
        // is a no-op.
        return SYSCALL_OK;
    };

    let flags = smp::sched_lock_this_cpu();
    // SAFETY: we hold this CPU's sched lock.
    unsafe {
        let scheduler = smp::this_cpu()
            .expect("tasking is up, so this CPU is registered")
            .scheduler();
        scheduler.sleep_task(current, nanos);
        scheduler.schedule();
    }
    smp::sched_unlock_this_cpu(flags);

    SYSCALL_OK
}

fn handle_create_process(
    stack_base: u64,
    stack_size: u64,
    region_count: u64,
    regions_ptr: u64,
    entry: u64,
) -> u64 {
    if stack_base >= VM_KERNEL_SPACE_START
        || stack_base.saturating_add(stack_size) >= VM_KERNEL_SPACE_START
    {
        return SYSCALL_BADARGS;
    }

    if entry >= VM_KERNEL_SPACE_START {
        return SYSCALL_BADARGS;
    }

    if region_count as usize > MAX_PROCESS_REGIONS {
        return SYSCALL_BADARGS;
    }

    if region_count > 0 && !user_pointer_ok(regions_ptr) {
        return SYSCALL_BADARGS;
    }

    let Some(root) = vmm::address_space_create() else {
        return SYSCALL_FAILURE;
    };

    let pid = process::process_create(root);

    for i in 0..region_count {
        // SAFETY: regions_ptr was range-checked and region_count bounded;
        // the descriptors live in the calling task's memory.
        let descriptor = unsafe {
            (regions_ptr as *const ProcessMemoryRegion)
                .add(i as usize)
                .read()
        };

        if descriptor.start >= VM_KERNEL_SPACE_START {
            return SYSCALL_BADARGS;
        }

        process::add_region(
            pid,
            AddressSpaceRegion {
                start: VirtualAddress::new(descriptor.start),
                length: descriptor.length,
                flags: RegionFlags::from_bits_truncate(descriptor.flags),
            },
        );
    }

    // The new process's stack region pages in lazily.
    process::add_region(
        pid,
        AddressSpaceRegion {
            start: VirtualAddress::new(stack_base),
            length: stack_size,
            flags: RegionFlags::READ | RegionFlags::WRITE | RegionFlags::AUTOMAP,
        },
    );

    let Some(kernel_stack) = fba::alloc_blocks(THREAD_KERNEL_STACK_BLOCKS) else {
        return SYSCALL_FAILURE;
    };
    let stack_top = VirtualAddress::new(
        kernel_stack.as_u64() + (THREAD_KERNEL_STACK_BLOCKS as u64) * crate::mm::PAGE_SIZE,
    );

    let Some(task) = sched::task::task_create_user(
        pid,
        root,
        stack_base + stack_size,
        stack_top,
        entry,
        TaskClass::Normal,
    ) else {
        fba::free(kernel_stack, THREAD_KERNEL_STACK_BLOCKS);
        return SYSCALL_FAILURE;
    };

    smp::sched_unblock_on(task, smp::sched_find_target_cpu());

    pid
}

fn handle_channel_send(cookie: u64, tag: u64, size: u64, buffer: u64) -> u64 {
    if buffer != 0 && (buffer >= VM_KERNEL_SPACE_START || buffer & PAGE_RELATIVE_MASK != 0) {
        return 0;
    }

    crate::ipc::channel_send(cookie, tag, size as usize, buffer)
}

fn handle_channel_recv(cookie: u64, tag_ptr: u64, size_ptr: u64, buffer: u64) -> u64 {
    if buffer != 0 && (buffer >= VM_KERNEL_SPACE_START || buffer & PAGE_RELATIVE_MASK != 0) {
        return 0;
    }

    if (tag_ptr != 0 && !user_pointer_ok(tag_ptr)) || (size_ptr != 0 && !user_pointer_ok(size_ptr))
    {
        return 0;
    }

    let mut tag = 0u64;
    let mut size = 0usize;

    let cookie = crate::ipc::channel_recv(
        cookie,
        (tag_ptr != 0).then_some(&mut tag),
        (size_ptr != 0).then_some(&mut size),
        buffer,
    );

    if cookie != 0 {
        // SAFETY: out-pointers were range-checked above and belong to the
        // calling task.
        unsafe {
            if tag_ptr != 0 {
                (tag_ptr as *mut u64).write(tag);
            }
            if size_ptr != 0 {
                (size_ptr as *mut u64).write(size as u64);
            }
        }
    }

    cookie
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn unknown_number_is_rejected() {
        assert_eq!(dispatch(99, 0, 0, 0, 0, 0), SYSCALL_BAD_NUMBER);
    }

    #[test]
    fn testcall_answers_42() {
        assert_eq!(dispatch(0, 1, 2, 3, 4, 5), 42);
    }

    #[test]
    fn debugprint_rejects_kernel_pointers() {
        assert_eq!(dispatch(1, 0, 0, 0, 0, 0), SYSCALL_BADARGS);
        assert_eq!(
            dispatch(1, VM_KERNEL_SPACE_START + 0x1000, 0, 0, 0, 0),
            SYSCALL_BADARGS
        );
    }

    #[test]
    fn debugchar_succeeds() {
        assert_eq!(dispatch(2, b'x' as u64, 0, 0, 0, 0), SYSCALL_OK);
    }

    #[test]
    fn memstats_writes_through_user_pointer() {
        let mut info = AnosMemInfo::default();
        let expected = {
            let region = pmm::PHYSICAL_REGION.lock();
            (region.size(), region.free())
        };

        let result = dispatch(4, &mut info as *mut AnosMemInfo as u64, 0, 0, 0, 0);
        assert_eq!(result, SYSCALL_OK);
        assert_eq!(info.physical_total, expected.0);
        assert_eq!(info.physical_avail, expected.1);
    }

    #[test]
    fn memstats_rejects_kernel_pointer() {
        assert_eq!(
            dispatch(4, VM_KERNEL_SPACE_START, 0, 0, 0, 0),
            SYSCALL_BADARGS
        );
    }

    #[test]
    fn create_thread_validates_pointers() {
        assert_eq!(
            dispatch(3, VM_KERNEL_SPACE_START, 0x1000, 0, 0, 0),
            SYSCALL_BADARGS
        );
    }

    #[test]
    fn create_process_validates_stack_and_regions() {
        assert_eq!(
            dispatch(6, VM_KERNEL_SPACE_START, 0x1000, 0, 0, 0x1000),
            SYSCALL_BADARGS
        );
        assert_eq!(
            dispatch(6, 0x40_0000, 0x1000, (MAX_PROCESS_REGIONS + 1) as u64, 0, 0x1000),
            SYSCALL_BADARGS
        );
        // Valid arguments still fail without a live mm stack to build the
        // address space from.
        assert_eq!(dispatch(6, 0x40_0000, 0x1000, 0, 0, 0x1000), SYSCALL_FAILURE);
    }

    #[test]
    fn sleep_without_tasking_is_ok() {
        assert_eq!(dispatch(5, 1_000_000, 0, 0, 0, 0), SYSCALL_OK);
    }

    #[test]
    fn ipc_surface_round_trips_through_the_dispatcher() {
        let cookie = dispatch(7, 0, 0, 0, 0, 0);
        assert_ne!(cookie, 0);
        assert!(crate::ipc::channel_exists(cookie));

        // Misaligned payload buffer fails the send.
        assert_eq!(dispatch(9, cookie, 1, 0, 0x1234, 0), 0);

        assert_eq!(dispatch(8, cookie, 0, 0, 0, 0), SYSCALL_OK);
        assert!(!crate::ipc::channel_exists(cookie));

        // Replies to unknown message cookies fail.
        assert_eq!(dispatch(11, 0xDEAD, 0, 0, 0, 0), 0);
    }
}
