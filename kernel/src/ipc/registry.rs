//! IPC registries
//!
//! Two cookie-keyed tables: live channels and in-flight messages. Both are
//! internally locked; removal from the channel table is the atomic point
//! of channel destruction, and everything a blocked task does after waking
//! starts with a fresh lookup here.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::collections::BTreeMap;
#[cfg(feature = "alloc")]
use alloc::sync::Arc;

#[cfg(feature = "alloc")]
use lazy_static::lazy_static;

use super::channel::IpcChannel;
use super::message::MessagePtr;
#[cfg(feature = "alloc")]
use crate::sync::SpinLock;

#[cfg(feature = "alloc")]
lazy_static! {
    static ref CHANNELS: SpinLock<BTreeMap<u64, Arc<IpcChannel>>> =
        SpinLock::new(BTreeMap::new());
    static ref IN_FLIGHT: SpinLock<BTreeMap<u64, MessagePtr>> = SpinLock::new(BTreeMap::new());
}

/// Publish a channel under its cookie.
#[cfg(feature = "alloc")]
pub fn insert_channel(channel: Arc<IpcChannel>) {
    CHANNELS.lock().insert(channel.cookie, channel);
}

/// Look a channel up; the returned `Arc` keeps it alive across blocking.
#[cfg(feature = "alloc")]
pub fn lookup_channel(cookie: u64) -> Option<Arc<IpcChannel>> {
    CHANNELS.lock().get(&cookie).cloned()
}

/// Atomically withdraw a channel. Subsequent lookups fail, which is what
/// woken waiters key off.
#[cfg(feature = "alloc")]
pub fn remove_channel(cookie: u64) -> Option<Arc<IpcChannel>> {
    CHANNELS.lock().remove(&cookie)
}

/// Whether a channel cookie is currently live.
#[cfg(feature = "alloc")]
pub fn channel_exists(cookie: u64) -> bool {
    CHANNELS.lock().contains_key(&cookie)
}

/// Track a delivered-but-unreplied message under its cookie.
#[cfg(feature = "alloc")]
pub fn insert_in_flight(message: MessagePtr) {
    // SAFETY: the message was just dequeued under the channel queue lock
    // and is not yet visible to repliers.
    let cookie = unsafe { message.message().cookie };
    IN_FLIGHT.lock().insert(cookie, message);
}

/// Resolve a reply: withdraw the in-flight message, if known.
#[cfg(feature = "alloc")]
pub fn take_in_flight(cookie: u64) -> Option<MessagePtr> {
    IN_FLIGHT.lock().remove(&cookie)
}

/// Live in-flight message count (diagnostics and tests).
#[cfg(feature = "alloc")]
pub fn in_flight_count() -> usize {
    IN_FLIGHT.lock().len()
}
