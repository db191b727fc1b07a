//! IPC messages
//!
//! A message is owned by its sender for the whole exchange: queued on the
//! channel, referenced by the receiver while in flight, completed by the
//! reply, and finally released by the woken sender. Messages are slab
//! objects on bare metal; host unit tests draw them from the test heap.

use core::ptr::NonNull;

use crate::mm::PhysicalAddress;
use crate::sched::TaskPtr;

/// One in-flight IPC message.
pub struct IpcMessage {
    /// Token the receiver later replies with.
    pub cookie: u64,
    pub tag: u64,
    /// Physical page of the sender's payload buffer, or 0 for none.
    pub arg_buf_phys: PhysicalAddress,
    pub arg_buf_size: usize,
    /// The blocked sender.
    pub waiter: TaskPtr,
    pub reply: u64,
    /// Set on orderly delivery; stays false if the channel died first,
    /// which is how the sender learns its send failed.
    pub handled: bool,
}

/// Shareable pointer to a message. The sender's stack frame is the true
/// owner; queues and the in-flight table hold these aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePtr(NonNull<IpcMessage>);

// SAFETY: access is serialised by the channel queue locks and the
// in-flight table lock; the pointee outlives both (sender frees last).
unsafe impl Send for MessagePtr {}
unsafe impl Sync for MessagePtr {}

impl MessagePtr {
    pub fn as_ptr(&self) -> *mut IpcMessage {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// Caller must hold the lock of the structure currently referencing
    /// the message (queue or in-flight table), or be the owning sender
    /// after wake-up.
    pub unsafe fn message(&self) -> &IpcMessage {
        // SAFETY: per contract the pointee is alive and access serialised.
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    ///
    /// As [`MessagePtr::message`], exclusively.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn message_mut(&self) -> &mut IpcMessage {
        // SAFETY: per contract the caller's lock gives exclusive access.
        unsafe { &mut *self.0.as_ptr() }
    }
}

/// Allocate and initialise a message.
pub fn alloc_message(
    cookie: u64,
    tag: u64,
    arg_buf_phys: PhysicalAddress,
    arg_buf_size: usize,
    waiter: TaskPtr,
) -> Option<MessagePtr> {
    let init = IpcMessage {
        cookie,
        tag,
        arg_buf_phys,
        arg_buf_size,
        waiter,
        reply: 0,
        handled: false,
    };

    #[cfg(target_os = "none")]
    {
        let slot = crate::mm::slab::alloc_object::<IpcMessage>()?;
        // SAFETY: the slab handed us an exclusive, suitably-sized slot.
        unsafe { slot.as_ptr().write(init) };
        Some(MessagePtr(slot))
    }

    #[cfg(not(target_os = "none"))]
    {
        extern crate std;
        let raw = std::boxed::Box::into_raw(std::boxed::Box::new(init));
        NonNull::new(raw).map(MessagePtr)
    }
}

/// Release a message once the exchange is complete.
///
/// # Safety
///
/// `message` must have come from [`alloc_message`] and must no longer be
/// reachable from any queue or the in-flight table.
pub unsafe fn free_message(message: MessagePtr) {
    #[cfg(target_os = "none")]
    {
        // SAFETY: per contract this is the last reference to a slab slot.
        unsafe {
            core::ptr::drop_in_place(message.as_ptr());
            crate::mm::slab::free_object(NonNull::new_unchecked(message.as_ptr()));
        }
    }

    #[cfg(not(target_os = "none"))]
    {
        extern crate std;
        // SAFETY: per contract this is the last reference to a heap box.
        drop(unsafe { std::boxed::Box::from_raw(message.as_ptr()) });
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::slab::SLAB_OBJECT_SIZE;

    #[test]
    fn message_fits_one_slab_object() {
        assert!(core::mem::size_of::<IpcMessage>() <= SLAB_OBJECT_SIZE);
        assert!(core::mem::align_of::<IpcMessage>() <= SLAB_OBJECT_SIZE);
    }

    #[test]
    fn allocation_initialises_the_exchange_state() {
        let waiter = crate::sched::task::tests::test_task(crate::sched::TaskClass::Normal, 0);
        let msg = alloc_message(0xC00C1E, 7, PhysicalAddress::new(0), 0, waiter)
            .expect("message allocation");

        // SAFETY: freshly allocated, unshared.
        unsafe {
            assert_eq!(msg.message().cookie, 0xC00C1E);
            assert_eq!(msg.message().tag, 7);
            assert_eq!(msg.message().reply, 0);
            assert!(!msg.message().handled);
            free_message(msg);
            crate::sched::task::task_destroy(waiter);
        }
    }
}
