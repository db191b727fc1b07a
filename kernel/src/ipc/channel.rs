//! IPC message channels
//!
//! Cookie-addressed channels carrying synchronous send/reply exchanges and
//! blocking receives. A sender queues its message, wakes one waiting
//! receiver, and blocks until the receiver replies; receivers either drain
//! a queued message immediately or park on the channel's receiver list.
//! Payloads move page-granularly: the sender's buffer page is mapped into
//! the receiver's address space on delivery.
//!
//! Destruction removes the channel from the registry *first* (the atomic
//! point of death), then wakes every queued sender (whose `handled` flag
//! is still clear, so their sends report failure) and every parked
//! receiver (which re-look the channel up, find nothing, and return 0).

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::collections::VecDeque;
#[cfg(feature = "alloc")]
use alloc::sync::Arc;
#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use super::cookie;
use super::message::{alloc_message, free_message, MessagePtr};
use super::registry;
use crate::mm::page_table::PteFlags;
use crate::mm::{vmm, PhysicalAddress, VirtualAddress, PAGE_RELATIVE_MASK, PAGE_SIZE};
use crate::sched::{self, smp, TaskPtr, TaskState};
use crate::sync::SpinLock;

/// Largest payload a message can carry: one page.
pub const ARG_BUF_MAX: usize = PAGE_SIZE as usize;

/// One message channel.
pub struct IpcChannel {
    pub cookie: u64,
    /// Parked receivers, FIFO.
    #[cfg(feature = "alloc")]
    receivers: SpinLock<VecDeque<TaskPtr>>,
    /// Queued messages, FIFO.
    #[cfg(feature = "alloc")]
    queue: SpinLock<VecDeque<MessagePtr>>,
}

#[cfg(feature = "alloc")]
impl IpcChannel {
    fn new(cookie: u64) -> Self {
        Self {
            cookie,
            receivers: SpinLock::new(VecDeque::new()),
            queue: SpinLock::new(VecDeque::new()),
        }
    }

    pub(crate) fn queued_messages(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn waiting_receivers(&self) -> usize {
        self.receivers.lock().len()
    }

    fn remove_queued(&self, message: MessagePtr) -> bool {
        let mut queue = self.queue.lock();
        match queue.iter().position(|&m| m == message) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Wake a task on whichever CPU the round-robin hint picks. Before
/// tasking is up (early boot, unit harness) the state flip happens
/// directly.
#[cfg(feature = "alloc")]
fn wake_task_any_cpu(task: TaskPtr) {
    if smp::tasking_up() {
        smp::sched_unblock_on(task, smp::sched_find_target_cpu());
    } else {
        // SAFETY: no scheduler owns the task yet; nothing else runs.
        unsafe { task.task_mut().state = TaskState::Ready };
    }
}

/// Block the calling task and yield. A no-op before tasking is up, which
/// is also what lets the unit harness drive the send/recv protocol
/// without a live scheduler.
#[cfg(feature = "alloc")]
fn block_current_and_schedule(current: TaskPtr) {
    if !smp::tasking_up() {
        return;
    }

    let flags = smp::sched_lock_this_cpu();
    // SAFETY: we hold this CPU's sched lock.
    unsafe {
        let scheduler = smp::this_cpu()
            .expect("tasking is up, so this CPU is registered")
            .scheduler();
        scheduler.block(current);
        scheduler.schedule();
    }
    smp::sched_unlock_this_cpu(flags);
}

/// Create a channel, publish it under a fresh cookie, and charge it to the
/// calling process (when there is one). Returns the cookie, or 0 on
/// allocation failure.
#[cfg(feature = "alloc")]
pub fn channel_create() -> u64 {
    let cookie = cookie::generate();
    let channel = Arc::new(IpcChannel::new(cookie));
    registry::insert_channel(channel);

    if let Some(pid) = sched::task_current_pid() {
        crate::process::register_channel(pid, cookie);
    }

    cookie
}

/// Whether a channel cookie is live.
#[cfg(feature = "alloc")]
pub fn channel_exists(cookie: u64) -> bool {
    registry::channel_exists(cookie)
}

/// Queue a message on `channel` on behalf of `waiter` and wake one parked
/// receiver. The building block under [`channel_send`]'s blocking shell.
#[cfg(feature = "alloc")]
pub(crate) fn send_enqueue(
    channel: &IpcChannel,
    tag: u64,
    size: usize,
    buffer: u64,
    waiter: TaskPtr,
) -> Option<MessagePtr> {
    let size = size.min(ARG_BUF_MAX);

    let arg_buf_phys = if buffer != 0 {
        PhysicalAddress::new(vmm::virt_to_phys_page(VirtualAddress::new(buffer)))
    } else {
        PhysicalAddress::new(0)
    };

    let message = alloc_message(cookie::generate(), tag, arg_buf_phys, size, waiter)?;

    channel.queue.lock().push_back(message);

    // One receiver gets woken per message; the queue hands the message
    // over when that receiver (or any earlier one) runs.
    let receiver = channel.receivers.lock().pop_front();
    if let Some(receiver) = receiver {
        if smp::tasking_up() {
            let flags = smp::sched_lock_this_cpu();
            // SAFETY: we hold this CPU's sched lock.
            unsafe {
                smp::this_cpu()
                    .expect("tasking is up, so this CPU is registered")
                    .scheduler()
                    .unblock(receiver);
            }
            smp::sched_unlock_this_cpu(flags);
        } else {
            // SAFETY: no scheduler owns the task yet; nothing else runs.
            unsafe { receiver.task_mut().state = TaskState::Ready };
        }
    }

    Some(message)
}

/// Hand a dequeued message to the receiving side: move it into the
/// in-flight table, surface tag/size, and map the payload page into the
/// receiver's space at `buffer`. Returns the message cookie for the reply.
#[cfg(feature = "alloc")]
pub(crate) fn deliver(
    message: MessagePtr,
    buffer: u64,
    out_tag: Option<&mut u64>,
    out_size: Option<&mut usize>,
) -> u64 {
    registry::insert_in_flight(message);

    // SAFETY: the message was dequeued by this call chain and is not yet
    // visible to repliers beyond the in-flight table we just fed.
    let (message_cookie, tag, phys, size) = unsafe {
        let m = message.message();
        (m.cookie, m.tag, m.arg_buf_phys, m.arg_buf_size)
    };

    if let Some(out) = out_tag {
        *out = tag;
    }
    if let Some(out) = out_size {
        *out = size;
    }

    if buffer != 0 && phys.as_u64() != 0 && size != 0 {
        vmm::map_page(VirtualAddress::new(buffer), phys, PteFlags::user_rw());
    } else {
        // SAFETY: as above.
        unsafe { message.message_mut().arg_buf_phys = PhysicalAddress::new(0) };
    }

    message_cookie
}

/// Send on a channel: queue, wake a receiver, block until replied.
/// Returns the reply value, or 0 if the channel was unknown, the
/// arguments invalid, or the channel died before the message was handled.
#[cfg(feature = "alloc")]
pub fn channel_send(channel_cookie: u64, tag: u64, size: usize, buffer: u64) -> u64 {
    if buffer & PAGE_RELATIVE_MASK != 0 {
        return 0;
    }

    if size > ARG_BUF_MAX {
        return 0;
    }

    let Some(channel) = registry::lookup_channel(channel_cookie) else {
        return 0;
    };

    let Some(current) = sched::task_current() else {
        return 0;
    };

    let Some(message) = send_enqueue(&channel, tag, size, buffer, current) else {
        log::warn!("ipc: failed to allocate message for channel {:#x}", channel_cookie);
        return 0;
    };

    block_current_and_schedule(current);

    // Woken: either a reply completed the exchange, or the channel died.
    // SAFETY: the sender owns the message again once it is running.
    let (reply, handled) = unsafe {
        let m = message.message();
        (m.reply, m.handled)
    };

    if !handled {
        // Never delivered; pull it off the queue (if the channel survived)
        // before releasing it.
        channel.remove_queued(message);
    }

    // SAFETY: the message is off the queue and (if delivered) the reply
    // already cleared it from the in-flight table.
    unsafe { free_message(message) };

    if handled {
        reply
    } else {
        0
    }
}

/// Non-blocking half of receive: atomically check the queue while holding
/// the receiver list closed, either delivering a queued message or parking
/// `current` on the list.
#[cfg(feature = "alloc")]
pub(crate) fn recv_or_park(
    channel: &IpcChannel,
    current: TaskPtr,
    buffer: u64,
    out_tag: Option<&mut u64>,
    out_size: Option<&mut usize>,
) -> Option<u64> {
    let mut receivers = channel.receivers.lock();

    let queued = channel.queue.lock().pop_front();
    match queued {
        Some(message) => {
            drop(receivers);
            Some(deliver(message, buffer, out_tag, out_size))
        }
        None => {
            receivers.push_back(current);
            None
        }
    }
}

/// Receive on a channel: drain a queued message or block until one (or
/// destruction) arrives. Returns the message cookie for the later reply,
/// or 0 if the channel is unknown/destroyed or the buffer misaligned.
#[cfg(feature = "alloc")]
pub fn channel_recv(
    channel_cookie: u64,
    mut out_tag: Option<&mut u64>,
    mut out_size: Option<&mut usize>,
    buffer: u64,
) -> u64 {
    if buffer & PAGE_RELATIVE_MASK != 0 {
        return 0;
    }

    let Some(channel) = registry::lookup_channel(channel_cookie) else {
        return 0;
    };

    let Some(current) = sched::task_current() else {
        return 0;
    };

    if let Some(cookie) = recv_or_park(
        &channel,
        current,
        buffer,
        out_tag.as_deref_mut(),
        out_size.as_deref_mut(),
    ) {
        note_payload_mapping(current, buffer);
        return cookie;
    }

    block_current_and_schedule(current);

    // Woken: a channel this task was parked on either got a message or
    // died. Start from a fresh lookup; destruction removes the registry
    // entry before any receiver is woken.
    if registry::lookup_channel(channel_cookie).is_none() {
        return 0;
    }

    let queued = channel.queue.lock().pop_front();
    match queued {
        Some(message) => {
            // Orderly delivery: the sender must see the exchange as
            // handled even if it is woken by destruction later.
            // SAFETY: we hold the only live reference to the dequeued
            // message until it lands in the in-flight table.
            unsafe { message.message_mut().handled = true };
            let cookie = deliver(message, buffer, out_tag, out_size);
            note_payload_mapping(current, buffer);
            cookie
        }
        None => 0,
    }
}

/// Remember a payload mapping so the receiver's next syscall entry can
/// tear it down. The payload is borrowed, not owned, by the receiver.
#[cfg(feature = "alloc")]
fn note_payload_mapping(receiver: TaskPtr, buffer: u64) {
    if buffer == 0 {
        return;
    }

    // SAFETY: the receiver is the running task on this CPU.
    unsafe {
        receiver.task_mut().pending_payload_unmap = Some(VirtualAddress::new(buffer));
    }
}

/// Complete an exchange: resolve the in-flight message, store the reply,
/// and wake the sender. Returns the message cookie, or 0 for unknown
/// cookies.
#[cfg(feature = "alloc")]
pub fn channel_reply(message_cookie: u64, result: u64) -> u64 {
    let Some(message) = registry::take_in_flight(message_cookie) else {
        return 0;
    };

    // SAFETY: withdrawn from the in-flight table, so this path is the
    // only referee until the sender wakes.
    let waiter = unsafe {
        let m = message.message_mut();
        m.reply = result;
        m.handled = true;
        m.waiter
    };

    wake_task_any_cpu(waiter);

    message_cookie
}

/// Destroy a channel: withdraw it from the registry, then wake every
/// queued sender (their sends report 0) and every parked receiver (they
/// observe the channel gone and return 0).
#[cfg(feature = "alloc")]
pub fn channel_destroy(channel_cookie: u64) {
    let Some(channel) = registry::remove_channel(channel_cookie) else {
        log::warn!("ipc: destroy of unknown channel {:#x}", channel_cookie);
        return;
    };

    // Senders first. Their messages stay unhandled; each woken sender
    // reclaims its own message.
    let queued: Vec<MessagePtr> = channel.queue.lock().drain(..).collect();
    for message in queued {
        // SAFETY: the channel is unreachable, so the queue was this
        // message's only non-sender referee.
        let waiter = unsafe { message.message().waiter };
        wake_task_any_cpu(waiter);
    }

    // Then parked receivers; they re-look the cookie up and fail.
    let receivers: Vec<TaskPtr> = channel.receivers.lock().drain(..).collect();
    for receiver in receivers {
        wake_task_any_cpu(receiver);
    }

    if let Some(pid) = sched::task_current_pid() {
        crate::process::unregister_channel(pid, channel_cookie);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::task::tests::test_task;
    use crate::sched::TaskClass;

    #[test]
    fn create_publishes_a_live_cookie() {
        let cookie = channel_create();
        assert_ne!(cookie, 0);
        assert!(channel_exists(cookie));

        channel_destroy(cookie);
        assert!(!channel_exists(cookie));
    }

    #[test]
    fn full_exchange_send_recv_reply() {
        let cookie = channel_create();
        let channel = registry::lookup_channel(cookie).expect("channel");

        let sender = test_task(TaskClass::Normal, 0);
        // SAFETY: test-private task, off every list.
        unsafe { sender.task_mut().state = TaskState::Blocked };

        let message =
            send_enqueue(&channel, 7, 0, 0, sender).expect("message enqueued");
        assert_eq!(channel.queued_messages(), 1);

        // Receiver side: the queued message is delivered immediately.
        let receiver = test_task(TaskClass::Normal, 0);
        let mut tag = 0u64;
        let mut size = 0usize;
        let message_cookie = recv_or_park(
            &channel,
            receiver,
            0,
            Some(&mut tag),
            Some(&mut size),
        )
        .expect("queued message must deliver without parking");

        assert_eq!(tag, 7);
        assert_eq!(size, 0);
        assert_eq!(channel.queued_messages(), 0);

        // Reply completes the exchange and wakes the sender; a second
        // reply finds nothing in flight.
        assert_eq!(channel_reply(message_cookie, 0xCAFE), message_cookie);
        assert_eq!(channel_reply(message_cookie, 0xCAFE), 0);

        // SAFETY: test-private structures; the reply path has finished.
        unsafe {
            assert_eq!(sender.task().state, TaskState::Ready);
            assert_eq!(message.message().reply, 0xCAFE);
            assert!(message.message().handled);
            free_message(message);
        }

        channel_destroy(cookie);
    }

    #[test]
    fn reply_to_unknown_cookie_fails() {
        assert_eq!(channel_reply(0xDEAD_BEEF, 1), 0);
    }

    #[test]
    fn second_reply_to_same_message_fails() {
        let cookie = channel_create();
        let channel = registry::lookup_channel(cookie).expect("channel");

        let sender = test_task(TaskClass::Normal, 0);
        let message = send_enqueue(&channel, 1, 0, 0, sender).expect("message");
        let receiver = test_task(TaskClass::Normal, 0);

        let message_cookie =
            recv_or_park(&channel, receiver, 0, None, None).expect("delivery");

        assert_ne!(channel_reply(message_cookie, 1), 0);
        assert_eq!(
            channel_reply(message_cookie, 2),
            0,
            "a message completes exactly once"
        );

        // SAFETY: exchange complete; sender-owned message.
        unsafe { free_message(message) };
        channel_destroy(cookie);
    }

    #[test]
    fn recv_parks_when_queue_is_empty() {
        let cookie = channel_create();
        let channel = registry::lookup_channel(cookie).expect("channel");

        let receiver = test_task(TaskClass::Normal, 0);
        assert!(recv_or_park(&channel, receiver, 0, None, None).is_none());
        assert_eq!(channel.waiting_receivers(), 1);

        // A sender's enqueue wakes the parked receiver.
        let sender = test_task(TaskClass::Normal, 0);
        // SAFETY: test-private task.
        unsafe { receiver.task_mut().state = TaskState::Blocked };
        let message = send_enqueue(&channel, 9, 0, 0, sender).expect("message");

        // SAFETY: test-private task.
        unsafe {
            assert_eq!(receiver.task().state, TaskState::Ready);
        }
        assert_eq!(channel.waiting_receivers(), 0);

        // The woken receiver drains the queue.
        let queued = channel.queue.lock().pop_front().expect("queued message");
        assert_eq!(queued, message);
        // SAFETY: dequeued; this test is the only referee.
        unsafe { free_message(message) };

        channel_destroy(cookie);
    }

    #[test]
    fn destroy_wakes_parked_receivers_and_queued_senders() {
        let cookie = channel_create();
        let channel = registry::lookup_channel(cookie).expect("channel");

        let receiver = test_task(TaskClass::Normal, 0);
        assert!(recv_or_park(&channel, receiver, 0, None, None).is_none());
        // SAFETY: test-private task.
        unsafe { receiver.task_mut().state = TaskState::Blocked };

        let sender = test_task(TaskClass::Normal, 0);
        // SAFETY: test-private task.
        unsafe { sender.task_mut().state = TaskState::Blocked };
        let message = send_enqueue(&channel, 3, 0, 0, sender).expect("message");

        channel_destroy(cookie);

        // SAFETY: test-private tasks and message.
        unsafe {
            assert_eq!(receiver.task().state, TaskState::Ready);
            assert_eq!(sender.task().state, TaskState::Ready);
            assert!(
                !message.message().handled,
                "an undelivered message must stay unhandled"
            );
            free_message(message);
        }

        assert!(!channel_exists(cookie));
        assert_eq!(
            channel_send(cookie, 1, 0, 0),
            0,
            "sends after destroy fail immediately"
        );
    }

    #[test]
    fn destroying_twice_is_harmless() {
        let cookie = channel_create();
        channel_destroy(cookie);
        channel_destroy(cookie);
    }

    #[test]
    fn oversized_and_misaligned_sends_fail_fast() {
        let cookie = channel_create();
        assert_eq!(channel_send(cookie, 1, ARG_BUF_MAX + 1, 0), 0);
        assert_eq!(channel_send(cookie, 1, 16, 0x1234), 0);
        assert_eq!(channel_recv(cookie, None, None, 0x1234), 0);
        channel_destroy(cookie);
    }

    #[test]
    fn receivers_queue_fifo() {
        let cookie = channel_create();
        let channel = registry::lookup_channel(cookie).expect("channel");

        let first = test_task(TaskClass::Normal, 0);
        let second = test_task(TaskClass::Normal, 0);
        assert!(recv_or_park(&channel, first, 0, None, None).is_none());
        assert!(recv_or_park(&channel, second, 0, None, None).is_none());

        // SAFETY: test-private tasks.
        unsafe {
            first.task_mut().state = TaskState::Blocked;
            second.task_mut().state = TaskState::Blocked;
        }

        // One message wakes exactly the first receiver.
        let sender = test_task(TaskClass::Normal, 0);
        let message = send_enqueue(&channel, 1, 0, 0, sender).expect("message");

        // SAFETY: test-private tasks.
        unsafe {
            assert_eq!(first.task().state, TaskState::Ready);
            assert_eq!(second.task().state, TaskState::Blocked);
        }

        let queued = channel.queue.lock().pop_front().expect("message queued");
        // SAFETY: dequeued above; sole referee.
        unsafe { free_message(queued) };
        let _ = message;

        channel_destroy(cookie);
    }
}
