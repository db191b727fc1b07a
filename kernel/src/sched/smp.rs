//! Per-CPU state and the scheduler locking discipline
//!
//! Each CPU registers a [`PerCpuState`] once at startup. The scheduler
//! lock API mirrors the kernel-wide convention: acquiring saves and
//! disables interrupt flags, releasing restores them. Locks are
//! non-reentrant; a double acquire on the same CPU is a bug and trips a
//! debug assertion. Cross-CPU operations take only the *target* CPU's
//! lock, never the current one's.
//!
//! The lock is deliberately not an RAII guard: a context switch happens
//! with the lock held, and the incoming task (or its first-run trampoline)
//! releases it. Flags therefore travel either through the caller (the
//! returned [`IrqFlags`]) or through the per-CPU stash read by
//! [`unlock_after_switch`].

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use super::scheduler::Scheduler;
use crate::arch::{self, IrqFlags};

/// Maximum CPUs the kernel tracks.
pub const MAX_CPUS: usize = 16;

/// One CPU's scheduler state, registered at AP startup and never torn
/// down.
pub struct PerCpuState {
    pub cpu_id: u8,
    pub lapic_id: u8,
    sched_lock: AtomicBool,
    /// Interrupt flags saved at the most recent lock acquisition; read by
    /// the switch-in path.
    saved_flags: AtomicBool,
    scheduler: UnsafeCell<Scheduler>,
}

// SAFETY: the scheduler cell is only reached while holding sched_lock.
unsafe impl Sync for PerCpuState {}

impl PerCpuState {
    pub const fn new(cpu_id: u8, lapic_id: u8) -> Self {
        Self {
            cpu_id,
            lapic_id,
            sched_lock: AtomicBool::new(false),
            saved_flags: AtomicBool::new(false),
            scheduler: UnsafeCell::new(Scheduler::new(cpu_id)),
        }
    }

    /// This CPU's scheduler.
    ///
    /// # Safety
    ///
    /// Caller must hold this CPU's scheduler lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn scheduler(&self) -> &mut Scheduler {
        // SAFETY: the lock (held per contract) serialises all access.
        unsafe { &mut *self.scheduler.get() }
    }

    fn lock(&self) -> IrqFlags {
        let flags = arch::local_irq_save();

        debug_assert!(
            !(self.sched_lock.load(Ordering::Relaxed)
                && current_cpu_id() == self.cpu_id),
            "sched lock is non-reentrant"
        );

        while self
            .sched_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        self.saved_flags.store(flags.0, Ordering::Relaxed);
        flags
    }

    fn unlock(&self, flags: IrqFlags) {
        self.sched_lock.store(false, Ordering::Release);
        arch::local_irq_restore(flags);
    }
}

static CPU_STATES: [AtomicPtr<PerCpuState>; MAX_CPUS] =
    [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CPUS];

static CPU_COUNT: AtomicU8 = AtomicU8::new(0);

/// Register one CPU's state block. Called once per CPU during startup.
pub fn register_cpu(state: &'static PerCpuState) {
    let cpu = state.cpu_id as usize;
    assert!(cpu < MAX_CPUS, "CPU id {} beyond MAX_CPUS", cpu);

    let previous = CPU_STATES[cpu].swap(
        state as *const PerCpuState as *mut PerCpuState,
        Ordering::Release,
    );
    assert!(previous.is_null(), "per-CPU state block reused");

    CPU_COUNT.fetch_add(1, Ordering::Release);
}

/// Number of registered CPUs.
pub fn cpu_count() -> u8 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Whether SMP/tasking bring-up has happened.
pub fn tasking_up() -> bool {
    cpu_count() > 0
}

/// State block for a CPU, if registered.
pub fn per_cpu(cpu: u8) -> Option<&'static PerCpuState> {
    if cpu as usize >= MAX_CPUS {
        return None;
    }
    let ptr = CPU_STATES[cpu as usize].load(Ordering::Acquire);
    // SAFETY: registered state blocks are 'static and never unregistered.
    unsafe { ptr.as_ref() }
}

/// Logical id of the executing CPU: the registered state whose hardware id
/// matches, or 0 during early boot (and on the test host).
pub fn current_cpu_id() -> u8 {
    let hw = arch::hardware_cpu_id();

    for cpu in 0..cpu_count() {
        if let Some(state) = per_cpu(cpu) {
            if state.lapic_id == hw {
                return state.cpu_id;
            }
        }
    }

    0
}

/// State block for the executing CPU.
pub fn this_cpu() -> Option<&'static PerCpuState> {
    per_cpu(current_cpu_id())
}

/// Take the executing CPU's scheduler lock. Interrupt flags are saved,
/// interrupts disabled.
pub fn sched_lock_this_cpu() -> IrqFlags {
    this_cpu().expect("sched lock before CPU registration").lock()
}

/// Release the executing CPU's scheduler lock, restoring `flags`.
pub fn sched_unlock_this_cpu(flags: IrqFlags) {
    this_cpu()
        .expect("sched unlock before CPU registration")
        .unlock(flags);
}

/// Take a specific CPU's scheduler lock (cross-CPU wakeups). Only the
/// target's lock is involved.
pub fn sched_lock_any_cpu(cpu: u8) -> Option<IrqFlags> {
    per_cpu(cpu).map(PerCpuState::lock)
}

/// Release a specific CPU's scheduler lock.
pub fn sched_unlock_any_cpu(cpu: u8, flags: IrqFlags) {
    if let Some(state) = per_cpu(cpu) {
        state.unlock(flags);
    }
}

/// Pick a CPU for a newly-runnable task: a plain round-robin hint.
static NEXT_TARGET: AtomicUsize = AtomicUsize::new(0);

pub fn sched_find_target_cpu() -> u8 {
    let count = cpu_count().max(1) as usize;
    (NEXT_TARGET.fetch_add(1, Ordering::Relaxed) % count) as u8
}

/// Enqueue a task on a specific CPU under that CPU's lock, nudging it with
/// an IPI. Falls back to the executing CPU when the target is unknown.
pub fn sched_unblock_on(task: super::task::TaskPtr, cpu: u8) {
    let target = if per_cpu(cpu).is_some() {
        cpu
    } else {
        current_cpu_id()
    };

    if let Some(flags) = sched_lock_any_cpu(target) {
        // SAFETY: we hold the target CPU's sched lock.
        unsafe {
            per_cpu(target)
                .expect("locked CPU must be registered")
                .scheduler()
                .unblock(task);
        }
        sched_unlock_any_cpu(target, flags);
        arch::send_schedule_ipi(target);
    }
}

/// First-run trampoline hook: release the executing CPU's scheduler lock
/// and restore the interrupt flags stashed when it was taken.
pub(crate) fn unlock_after_switch() {
    if let Some(state) = this_cpu() {
        let flags = IrqFlags(state.saved_flags.load(Ordering::Relaxed));
        state.unlock(flags);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::task::tests::test_task;
    use crate::sched::task::{TaskClass, TaskState};

    // CPU registration is global and once-only, so the whole SMP surface
    // is exercised from one test.
    #[test]
    fn registration_locking_and_cross_cpu_unblock() {
        let cpu0: &'static PerCpuState = std::boxed::Box::leak(std::boxed::Box::new(
            PerCpuState::new(0, 0),
        ));
        let cpu1: &'static PerCpuState = std::boxed::Box::leak(std::boxed::Box::new(
            PerCpuState::new(1, 1),
        ));

        register_cpu(cpu0);
        register_cpu(cpu1);

        assert_eq!(cpu_count(), 2);
        assert!(tasking_up());
        assert!(per_cpu(0).is_some());
        assert!(per_cpu(1).is_some());
        assert!(per_cpu(9).is_none());

        // Round-robin target hints cycle over both CPUs.
        let hints = [
            sched_find_target_cpu(),
            sched_find_target_cpu(),
            sched_find_target_cpu(),
        ];
        assert!(hints.contains(&0) && hints.contains(&1));

        // Remote unblock lands on the target CPU's run queue.
        let task = test_task(TaskClass::Normal, 0);
        // SAFETY: fresh task, off every list.
        unsafe { task.task_mut() }.state = TaskState::Blocked;

        sched_unblock_on(task, 1);

        let flags = sched_lock_any_cpu(1).expect("CPU 1 lockable");
        // SAFETY: we hold CPU 1's sched lock.
        unsafe {
            let sched = per_cpu(1).expect("registered").scheduler();
            assert!(sched.queue_len(TaskClass::Normal) >= 1);
            assert_eq!(task.task().state, TaskState::Ready);
        }
        sched_unlock_any_cpu(1, flags);

        // Unknown target falls back to the executing CPU (0 on the host).
        let task2 = test_task(TaskClass::Normal, 0);
        // SAFETY: fresh task, off every list.
        unsafe { task2.task_mut() }.state = TaskState::Blocked;
        sched_unblock_on(task2, 7);

        let flags = sched_lock_this_cpu();
        // SAFETY: we hold CPU 0's sched lock.
        unsafe {
            let sched = this_cpu().expect("registered").scheduler();
            assert!(sched.queue_len(TaskClass::Normal) >= 1);
            assert_eq!(task2.task().state, TaskState::Ready);
        }
        sched_unlock_this_cpu(flags);

        // The tasks stay parked on the global queues; they are leaked
        // rather than destroyed out from under them.
    }
}
