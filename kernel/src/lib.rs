//! Anos kernel library
//!
//! The kernel core: physical and virtual memory management, the
//! fixed-block and slab allocators, the per-CPU prioritised scheduler,
//! cookie-addressed IPC channels, the page-fault handler, and the syscall
//! surface. Bare-metal targets build this no_std; the host target links
//! std and the system allocator so the unit-test suite runs under the
//! standard harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

#[cfg(feature = "alloc")]
extern crate alloc;

// Bare metal: the kernel heap behind the alloc collections (IPC registry,
// process table) is a linked-list allocator over a region carved out at
// boot.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// The global kernel heap.
#[cfg(target_os = "none")]
pub fn kernel_heap() -> &'static LockedHeap {
    &ALLOCATOR
}

// Host (unit tests / tooling): plain system allocator.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod error;
#[cfg(feature = "alloc")]
pub mod ipc;
pub mod logger;
pub mod mm;
#[cfg(feature = "alloc")]
pub mod process;
pub mod sched;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod serial;
pub mod sync;
#[cfg(feature = "alloc")]
pub mod syscall;

// Re-export the main seams for the boot crate and integration tests.
pub use error::MemError;
pub use mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
pub use sched::{Task, TaskClass, TaskState};

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap allocation failed: {:?}", layout);
}
