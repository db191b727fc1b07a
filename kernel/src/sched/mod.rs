//! Scheduling
//!
//! Preemptive, per-CPU, priority-classed round-robin. Each CPU owns a
//! [`scheduler::Scheduler`] reached through [`smp`]'s locking discipline;
//! the timer tick drives sleep-queue draining and scheduling passes.

pub mod queue;
pub mod scheduler;
pub mod sleep;
pub mod smp;
pub mod task;

pub use scheduler::Scheduler;
pub use task::{Task, TaskClass, TaskPtr, TaskState};

/// Process identifier.
pub type ProcessId = u64;

/// Thread identifier.
pub type ThreadId = u64;

/// Ticks a freshly-dispatched task may hold the CPU.
pub const DEFAULT_TIMESLICE: u32 = 100;

/// Timer-interrupt entry: drain pending cross-CPU work, wake due
/// sleepers, run a scheduling pass. A no-op until tasking is up.
pub fn timer_tick() {
    if !smp::tasking_up() {
        return;
    }

    let cpu = smp::current_cpu_id();
    crate::mm::shootdown::handle_pending(cpu);

    let flags = smp::sched_lock_this_cpu();
    // SAFETY: we hold this CPU's sched lock.
    unsafe {
        let sched = smp::this_cpu()
            .expect("tasking is up, so this CPU is registered")
            .scheduler();
        #[cfg(feature = "alloc")]
        sched.check_sleepers();
        sched.tick();
    }
    smp::sched_unlock_this_cpu(flags);
}

/// The task currently running on this CPU.
///
/// Must not be called with interrupts enabled unless on behalf of the
/// owning task; the per-CPU `current` slot is only stable from its own
/// CPU's context.
pub fn task_current() -> Option<TaskPtr> {
    let state = smp::this_cpu()?;
    let flags = smp::sched_lock_this_cpu();
    // SAFETY: we hold this CPU's sched lock.
    let current = unsafe { state.scheduler().current() };
    smp::sched_unlock_this_cpu(flags);
    current
}

/// PID of the currently-running task, if any.
pub fn task_current_pid() -> Option<ProcessId> {
    // SAFETY: the task pointer stays valid for the lifetime of its
    // process; reading the owning PID is stable.
    task_current().map(|task| unsafe { task.task().owner_pid })
}

/// First-run trampoline target: release this CPU's scheduler lock,
/// restoring the interrupt flags saved when it was taken at schedule
/// time. Referenced by the arch context-switch assembly.
#[no_mangle]
pub extern "C" fn unlock_after_switch() {
    smp::unlock_after_switch();
}
