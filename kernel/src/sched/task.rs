//! Task model
//!
//! A [`Task`] is a schedulable kernel execution context, running in kernel
//! or user mode. Creation seeds the task's kernel stack so the first
//! context switch "returns" into the matching entry trampoline with the
//! target entry point and stack in the predetermined register slots.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::boxed::Box;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{ProcessId, ThreadId, DEFAULT_TIMESLICE};
use crate::arch;
use crate::mm::{PhysicalAddress, VirtualAddress};

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Sleeping,
}

/// Scheduling class; lower discriminant is scheduled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskClass {
    RealTime = 0,
    High = 1,
    Normal = 2,
    Idle = 3,
}

/// Task control block.
///
/// `link` threads the task through exactly one list at a time: a run
/// queue, a channel's receiver list, or nothing while running/just
/// blocked. The scheduler's invariants depend on that exclusivity.
pub struct Task {
    pub tid: ThreadId,
    pub owner_pid: ProcessId,
    /// Root page table of the owning address space.
    pub root_table: PhysicalAddress,
    /// Top of this task's kernel stack.
    pub kernel_stack_top: VirtualAddress,
    /// Stack pointer saved at switch-out (or seeded at creation).
    pub saved_sp: u64,
    /// Entry point the task was created with.
    pub entry: u64,
    pub state: TaskState,
    pub class: TaskClass,
    /// Intra-class priority; lower wins.
    pub priority: u8,
    /// Timeslice ticks remaining.
    pub ts_remain: u32,
    /// CPU currently running this task, if any.
    pub current_cpu: Option<u8>,
    /// Received IPC payload page to unmap at the next syscall boundary.
    pub pending_payload_unmap: Option<VirtualAddress>,
    /// Intrusive list link (run queue or waiter list).
    pub(crate) link: Option<TaskPtr>,
}

/// Shareable pointer to a task. Tasks live until their process is torn
/// down, so holders must not outlive that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPtr(NonNull<Task>);

// SAFETY: all mutation of the pointee happens under a scheduler or waiter
// lock; the pointer itself is freely copyable.
unsafe impl Send for TaskPtr {}
unsafe impl Sync for TaskPtr {}

impl TaskPtr {
    pub fn new(ptr: NonNull<Task>) -> Self {
        Self(ptr)
    }

    pub fn as_non_null(&self) -> NonNull<Task> {
        self.0
    }

    pub fn as_ptr(&self) -> *mut Task {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// Caller must hold the lock covering this task's current list or be
    /// its running CPU.
    pub unsafe fn task(&self) -> &Task {
        // SAFETY: per contract the pointee is alive and access is
        // serialised by the caller's lock.
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    ///
    /// As [`TaskPtr::task`], exclusively.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn task_mut(&self) -> &mut Task {
        // SAFETY: per contract the caller's lock gives exclusive access.
        unsafe { &mut *self.0.as_ptr() }
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next thread ID.
pub fn alloc_tid() -> ThreadId {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(feature = "alloc")]
fn task_create(
    owner_pid: ProcessId,
    root_table: PhysicalAddress,
    kernel_stack_top: VirtualAddress,
    entry: u64,
    user_sp: u64,
    trampoline: u64,
    class: TaskClass,
) -> Option<TaskPtr> {
    if kernel_stack_top.as_u64() == 0 {
        return None;
    }

    // SAFETY: the caller handed us the top of a live kernel stack.
    let saved_sp =
        unsafe { arch::seed_initial_stack(kernel_stack_top.as_u64(), trampoline, entry, user_sp) };

    let task = Box::new(Task {
        tid: alloc_tid(),
        owner_pid,
        root_table,
        kernel_stack_top,
        saved_sp,
        entry,
        state: TaskState::Ready,
        class,
        priority: 0,
        ts_remain: DEFAULT_TIMESLICE,
        current_cpu: None,
        pending_payload_unmap: None,
        link: None,
    });

    NonNull::new(Box::into_raw(task)).map(TaskPtr::new)
}

/// Create a kernel thread. The first switch into it lands in the kernel
/// trampoline, which unlocks the scheduler and jumps to `entry` on the
/// kernel stack.
#[cfg(feature = "alloc")]
pub fn task_create_kernel(
    owner_pid: ProcessId,
    root_table: PhysicalAddress,
    kernel_stack_top: VirtualAddress,
    entry: u64,
    class: TaskClass,
) -> Option<TaskPtr> {
    task_create(
        owner_pid,
        root_table,
        kernel_stack_top,
        entry,
        0,
        arch::kernel_thread_trampoline(),
        class,
    )
}

/// Create a user thread. The first switch lands in the user trampoline,
/// which unlocks the scheduler and drops to user mode at `entry` with
/// `user_sp`.
#[cfg(feature = "alloc")]
pub fn task_create_user(
    owner_pid: ProcessId,
    root_table: PhysicalAddress,
    user_sp: u64,
    kernel_stack_top: VirtualAddress,
    entry: u64,
    class: TaskClass,
) -> Option<TaskPtr> {
    task_create(
        owner_pid,
        root_table,
        kernel_stack_top,
        entry,
        user_sp,
        arch::user_thread_trampoline(),
        class,
    )
}

/// Destroy a task record. Process teardown calls this for tasks that are
/// blocked or already off every list.
///
/// # Safety
///
/// `task` must have come from `task_create_*`, must not be on any list,
/// and must not be running anywhere.
#[cfg(feature = "alloc")]
pub unsafe fn task_destroy(task: TaskPtr) {
    // SAFETY: per contract this is the sole remaining reference.
    drop(unsafe { Box::from_raw(task.as_ptr()) });
}
