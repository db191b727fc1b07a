//! Inter-process communication
//!
//! Cookie-addressed message channels: synchronous send/reply with
//! asynchronous, blocking receive. Built on the slab allocator for message
//! records, the scheduler for blocking and cross-CPU wakeups, and the VMM
//! for page-granular payload transfer.

pub mod channel;
pub mod cookie;
pub mod message;
pub mod registry;

#[cfg(feature = "alloc")]
pub use channel::{
    channel_create, channel_destroy, channel_exists, channel_recv, channel_reply, channel_send,
    IpcChannel, ARG_BUF_MAX,
};
pub use message::{IpcMessage, MessagePtr};
