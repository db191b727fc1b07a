//! Per-CPU prioritised round-robin scheduler
//!
//! Four class queues (realtime/high/normal/idle), priority-insertion FIFO
//! within each. `schedule()` picks the head of the highest non-empty
//! class; a running task with timeslice left is only displaced by a
//! strictly higher class or a strictly higher priority in its own class.
//! Timeslice accounting happens on the timer tick; exhaustion requeues the
//! task at the back of its priority band and switches. Blocked tasks are
//! never requeued here; they come back through `unblock`.
//!
//! Every method assumes the owning CPU's scheduler lock is held; access is
//! routed through `smp`'s locking discipline.

use super::queue::TaskPriorityQueue;
use super::sleep::SleepQueue;
use super::task::{TaskClass, TaskPtr, TaskState};
use super::DEFAULT_TIMESLICE;
use crate::arch;
#[cfg(feature = "alloc")]
use crate::arch::timer::{nanos_per_tick, upticks};

/// Priority assigned to per-CPU idle tasks.
pub const IDLE_PRIORITY: u8 = 255;

const CLASS_COUNT: usize = 4;

pub struct Scheduler {
    cpu_id: u8,
    current: Option<TaskPtr>,
    idle: Option<TaskPtr>,
    queues: [TaskPriorityQueue; CLASS_COUNT],
    sleep_queue: SleepQueue,
}

impl Scheduler {
    pub const fn new(cpu_id: u8) -> Self {
        Self {
            cpu_id,
            current: None,
            idle: None,
            queues: [const { TaskPriorityQueue::new() }; CLASS_COUNT],
            sleep_queue: SleepQueue::new(),
        }
    }

    pub fn cpu_id(&self) -> u8 {
        self.cpu_id
    }

    pub fn current(&self) -> Option<TaskPtr> {
        self.current
    }

    /// This CPU's permanent idle task, once registered.
    pub fn idle_task(&self) -> Option<TaskPtr> {
        self.idle
    }

    /// Register this CPU's permanent idle task. It sits in the idle class
    /// at the weakest priority and is never destroyed.
    pub fn set_idle(&mut self, task: TaskPtr) {
        // SAFETY: sched lock held per module contract; the idle task is
        // fresh and on no list.
        unsafe {
            let t = task.task_mut();
            t.class = TaskClass::Idle;
            t.priority = IDLE_PRIORITY;
            t.state = TaskState::Ready;
            self.queues[TaskClass::Idle as usize].push(task);
        }
        self.idle = Some(task);
    }

    /// Put a ready task on its class queue.
    pub fn enqueue(&mut self, task: TaskPtr) {
        // SAFETY: sched lock held per module contract.
        unsafe {
            let t = task.task_mut();
            t.state = TaskState::Ready;
            t.current_cpu = None;
            let class = t.class as usize;
            self.queues[class].push(task);
        }
    }

    /// Mark a task blocked. It stays off the run queues until `unblock`.
    pub fn block(&mut self, task: TaskPtr) {
        // SAFETY: sched lock held per module contract.
        unsafe {
            task.task_mut().state = TaskState::Blocked;
        }
    }

    /// Return a blocked (or sleeping) task to the run queues.
    pub fn unblock(&mut self, task: TaskPtr) {
        // A wakeup can race the wakee's own block; a task still marked
        // running is on some CPU and must not also land on a queue.
        // SAFETY: sched lock held per module contract.
        if unsafe { task.task().state } == TaskState::Running {
            return;
        }
        self.enqueue(task);
    }

    /// Head of the strongest non-empty class queue.
    fn candidate(&self) -> Option<(usize, TaskPtr)> {
        self.queues
            .iter()
            .enumerate()
            .find_map(|(class, queue)| queue.peek().map(|task| (class, task)))
    }

    /// Timer-driven entry: burn one tick of the running task's slice, then
    /// run a scheduling pass.
    pub fn tick(&mut self) {
        if let Some(current) = self.current {
            // SAFETY: sched lock held per module contract.
            let cur = unsafe { current.task_mut() };
            if cur.ts_remain > 0 {
                cur.ts_remain -= 1;
            }
        }

        self.schedule();
    }

    /// The scheduling decision. Called with this CPU's sched lock held and
    /// interrupts disabled; may context-switch away and only "return" when
    /// this task is next dispatched.
    pub fn schedule(&mut self) {
        let Some((queue_class, candidate)) = self.candidate() else {
            // No runnable tasks at all; carry on with the current one.
            return;
        };

        if let Some(current) = self.current {
            // SAFETY: sched lock held per module contract.
            let keep_running = unsafe {
                let cur = current.task();
                let cand = candidate.task();
                let preempts = cand.class < cur.class
                    || (cand.class == cur.class && cand.priority < cur.priority);
                cur.state == TaskState::Running && cur.ts_remain > 0 && !preempts
            };

            if keep_running {
                return;
            }
        }

        // Committed to switching; now actually dequeue.
        // SAFETY: sched lock held; candidate was just peeked.
        let next = unsafe { self.queues[queue_class].pop() }.expect("peeked candidate vanished");

        let prev = self.current;

        if let Some(current) = prev {
            if current == next {
                return;
            }

            // SAFETY: sched lock held per module contract.
            let was_running = unsafe {
                let cur = current.task_mut();
                cur.current_cpu = None;
                cur.state == TaskState::Running
            };

            if was_running {
                self.enqueue(current);
            }
        }

        // SAFETY: sched lock held per module contract.
        let new_sp = unsafe {
            let n = next.task_mut();
            n.ts_remain = DEFAULT_TIMESLICE;
            n.state = TaskState::Running;
            n.current_cpu = Some(self.cpu_id);
            n.saved_sp
        };

        self.current = Some(next);

        match prev {
            Some(current) => {
                // SAFETY: both tasks are live; the outgoing task's saved_sp
                // slot receives this context, the sched lock travels with
                // the switch and is released by the incoming side.
                unsafe {
                    arch::context_switch(&raw mut (*current.as_ptr()).saved_sp, new_sp);
                }
            }
            None => {
                // First dispatch on this CPU; the boot context is
                // abandoned into a scratch slot.
                let mut boot_sp = 0u64;
                // SAFETY: as above; boot_sp is never resumed.
                unsafe {
                    arch::context_switch(&raw mut boot_sp, new_sp);
                }
            }
        }
    }

    /// Put `task` to sleep for `nanos` nanoseconds, measured from `now`
    /// upticks. The deadline is converted at the platform timer's
    /// programmed rate. Caller follows with `schedule()`.
    #[cfg(feature = "alloc")]
    pub fn sleep_task_at(&mut self, task: TaskPtr, nanos: u64, now: u64) {
        let ticks = nanos.div_ceil(nanos_per_tick()).max(1);
        // SAFETY: sched lock held per module contract.
        unsafe {
            task.task_mut().state = TaskState::Sleeping;
        }
        self.sleep_queue.enqueue(task, now + ticks);
    }

    /// As [`Scheduler::sleep_task_at`] against the global uptick clock.
    #[cfg(feature = "alloc")]
    pub fn sleep_task(&mut self, task: TaskPtr, nanos: u64) {
        self.sleep_task_at(task, nanos, upticks());
    }

    /// Wake everything due at `now`, moving it to the run queues.
    #[cfg(feature = "alloc")]
    pub fn check_sleepers_at(&mut self, now: u64) {
        let Self {
            sleep_queue,
            queues,
            ..
        } = self;

        sleep_queue.dequeue_due(now, |task| {
            // SAFETY: sched lock held per module contract.
            unsafe {
                let t = task.task_mut();
                t.state = TaskState::Ready;
                t.current_cpu = None;
                let class = t.class as usize;
                queues[class].push(task);
            }
        });
    }

    /// As [`Scheduler::check_sleepers_at`] against the global uptick clock.
    #[cfg(feature = "alloc")]
    pub fn check_sleepers(&mut self) {
        self.check_sleepers_at(upticks());
    }

    /// Tasks queued in `class` (test and diagnostics aid).
    pub fn queue_len(&self, class: TaskClass) -> usize {
        // SAFETY: sched lock held per module contract.
        unsafe { self.queues[class as usize].len() }
    }

    /// Sleeping task count.
    #[cfg(feature = "alloc")]
    pub fn sleeper_count(&self) -> usize {
        self.sleep_queue.len()
    }
}
