//! Interrupt-saving spinlock
//!
//! Every kernel-path lock acquisition must save the interrupt flag state,
//! disable interrupts, and restore the saved state on release. This wraps
//! `spin::Mutex` with exactly that discipline; the plain mutex is never used
//! directly on paths an interrupt handler can also take.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::arch::{self, IrqFlags};

/// A `spin::Mutex` that disables local interrupts for the lifetime of the
/// guard, restoring the previously-saved flags on drop.
pub struct SpinLock<T> {
    inner: Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock, saving and disabling local interrupts first.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let flags = arch::local_irq_save();
        SpinLockGuard {
            guard: Some(self.inner.lock()),
            flags,
        }
    }

    /// Try to acquire without spinning. Interrupts are only disabled when
    /// the acquisition succeeds.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let flags = arch::local_irq_save();
        match self.inner.try_lock() {
            Some(guard) => Some(SpinLockGuard {
                guard: Some(guard),
                flags,
            }),
            None => {
                arch::local_irq_restore(flags);
                None
            }
        }
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Guard for [`SpinLock`]. Dropping it releases the mutex and then restores
/// the interrupt flags saved at acquisition.
pub struct SpinLockGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    flags: IrqFlags,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard present until drop")
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard present until drop")
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the mutex before re-enabling interrupts; the other order
        // would let an interrupt handler spin on a lock we still hold.
        drop(self.guard.take());
        arch::local_irq_restore(self.flags);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_guards_value() {
        let lock = SpinLock::new(41);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let _held = lock.lock();
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn try_lock_succeeds_after_release() {
        let lock = SpinLock::new(7);
        drop(lock.lock());
        let guard = lock.try_lock().expect("lock should be free after release");
        assert_eq!(*guard, 7);
    }
}
