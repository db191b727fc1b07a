//! Run queues
//!
//! One intrusive priority-insertion FIFO per scheduling class. Tasks are
//! threaded through their `link` field; a task is on at most one queue at
//! a time. Insertion keeps the queue sorted by priority (lower numeric
//! first) and FIFO among equals.

use super::task::TaskPtr;

/// Priority-ordered FIFO of tasks.
pub struct TaskPriorityQueue {
    head: Option<TaskPtr>,
}

// SAFETY: queues are only manipulated under the owning CPU's sched lock.
unsafe impl Send for TaskPriorityQueue {}

impl TaskPriorityQueue {
    pub const fn new() -> Self {
        Self { head: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// First task in line, without removing it.
    pub fn peek(&self) -> Option<TaskPtr> {
        self.head
    }

    /// Insert `task` behind every queued task of equal or higher priority.
    ///
    /// # Safety
    ///
    /// Caller holds the owning sched lock; `task` must not currently be on
    /// any list.
    pub unsafe fn push(&mut self, task: TaskPtr) {
        // SAFETY: lock held per contract; list nodes are live tasks.
        unsafe {
            let priority = task.task().priority;
            task.task_mut().link = None;

            match self.head {
                None => self.head = Some(task),
                Some(head) if head.task().priority > priority => {
                    task.task_mut().link = Some(head);
                    self.head = Some(task);
                }
                Some(head) => {
                    let mut cursor = head;
                    while let Some(next) = cursor.task().link {
                        if next.task().priority > priority {
                            break;
                        }
                        cursor = next;
                    }
                    task.task_mut().link = cursor.task().link;
                    cursor.task_mut().link = Some(task);
                }
            }
        }
    }

    /// Remove and return the head.
    ///
    /// # Safety
    ///
    /// Caller holds the owning sched lock.
    pub unsafe fn pop(&mut self) -> Option<TaskPtr> {
        let head = self.head?;
        // SAFETY: lock held per contract.
        unsafe {
            self.head = head.task().link;
            head.task_mut().link = None;
        }
        Some(head)
    }

    /// Unlink a specific task. Returns whether it was queued here.
    ///
    /// # Safety
    ///
    /// Caller holds the owning sched lock.
    pub unsafe fn remove(&mut self, task: TaskPtr) -> bool {
        // SAFETY: lock held per contract.
        unsafe {
            match self.head {
                None => false,
                Some(head) if head == task => {
                    self.head = head.task().link;
                    task.task_mut().link = None;
                    true
                }
                Some(head) => {
                    let mut cursor = head;
                    while let Some(next) = cursor.task().link {
                        if next == task {
                            cursor.task_mut().link = next.task().link;
                            task.task_mut().link = None;
                            return true;
                        }
                        cursor = next;
                    }
                    false
                }
            }
        }
    }

    /// Queued task count.
    ///
    /// # Safety
    ///
    /// Caller holds the owning sched lock.
    pub unsafe fn len(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.head;
        while let Some(task) = cursor {
            n += 1;
            // SAFETY: lock held per contract.
            cursor = unsafe { task.task().link };
        }
        n
    }
}

impl Default for TaskPriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::task::tests::test_task;
    use crate::sched::task::{task_destroy, TaskClass};

    fn tids(queue: &mut TaskPriorityQueue) -> std::vec::Vec<u64> {
        let mut out = std::vec::Vec::new();
        // SAFETY: single-threaded test owns the queue and its tasks.
        unsafe {
            while let Some(task) = queue.pop() {
                out.push(task.task().tid);
                task_destroy(task);
            }
        }
        out
    }

    #[test]
    fn fifo_within_equal_priority() {
        let mut queue = TaskPriorityQueue::new();
        let a = test_task(TaskClass::Normal, 5);
        let b = test_task(TaskClass::Normal, 5);
        let c = test_task(TaskClass::Normal, 5);

        // SAFETY: single-threaded test.
        unsafe {
            queue.push(a);
            queue.push(b);
            queue.push(c);

            let (ta, tb, tc) = (a.task().tid, b.task().tid, c.task().tid);
            assert_eq!(tids(&mut queue), std::vec![ta, tb, tc]);
        }
    }

    #[test]
    fn lower_priority_number_jumps_ahead() {
        let mut queue = TaskPriorityQueue::new();
        let low = test_task(TaskClass::Normal, 10);
        let high = test_task(TaskClass::Normal, 1);
        let mid = test_task(TaskClass::Normal, 5);

        // SAFETY: single-threaded test.
        unsafe {
            queue.push(low);
            queue.push(high);
            queue.push(mid);

            let (tl, th, tm) = (low.task().tid, high.task().tid, mid.task().tid);
            assert_eq!(tids(&mut queue), std::vec![th, tm, tl]);
        }
    }

    #[test]
    fn remove_unlinks_middle_node() {
        let mut queue = TaskPriorityQueue::new();
        let a = test_task(TaskClass::Normal, 0);
        let b = test_task(TaskClass::Normal, 0);
        let c = test_task(TaskClass::Normal, 0);

        // SAFETY: single-threaded test.
        unsafe {
            queue.push(a);
            queue.push(b);
            queue.push(c);

            assert!(queue.remove(b));
            assert!(!queue.remove(b), "second removal must report absence");
            assert_eq!(queue.len(), 2);

            let (ta, tc) = (a.task().tid, c.task().tid);
            assert_eq!(tids(&mut queue), std::vec![ta, tc]);
            task_destroy(b);
        }
    }

    #[test]
    fn pop_from_empty_is_none() {
        let mut queue = TaskPriorityQueue::new();
        // SAFETY: single-threaded test.
        unsafe {
            assert!(queue.pop().is_none());
            assert_eq!(queue.len(), 0);
        }
    }
}
