//! TLB shootdown
//!
//! Thin wrappers over the mapper that broadcast cross-CPU invalidation.
//! A mapping change is applied first, then a [`TlbShootdown`] work item is
//! enqueued to every CPU except the current one; each target invalidates
//! the range locally if its active root matches. Shootdowns are expensive;
//! callers that know the mapping is CPU-local should use the plain mapper.
//!
//! Completion is best-effort in this baseline: the initiator does not spin
//! on acknowledgements, and targets without an IPI path pick the work up
//! on their next timer tick.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::collections::VecDeque;

use super::page_table::PteFlags;
use super::{vmm, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::sync::SpinLock;

/// Upper bound on CPUs the work queues cover.
pub const MAX_CPUS: usize = crate::sched::smp::MAX_CPUS;

/// One cross-CPU invalidation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbShootdown {
    pub target_pid: u64,
    pub target_root: PhysicalAddress,
    pub start_vaddr: VirtualAddress,
    pub page_count: usize,
}

/// Inter-processor work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    TlbShootdown(TlbShootdown),
}

/// Per-CPU work queues.
pub struct IpwiQueues {
    #[cfg(feature = "alloc")]
    queues: [SpinLock<VecDeque<WorkItem>>; MAX_CPUS],
}

impl IpwiQueues {
    pub const fn new() -> Self {
        Self {
            #[cfg(feature = "alloc")]
            queues: [const { SpinLock::new(VecDeque::new()) }; MAX_CPUS],
        }
    }

    /// Enqueue `item` for every CPU in `0..cpu_count` except `current`,
    /// nudging each with a scheduling IPI.
    #[cfg(feature = "alloc")]
    pub fn enqueue_all_except(&self, cpu_count: u8, current: u8, item: WorkItem) {
        for cpu in 0..cpu_count.min(MAX_CPUS as u8) {
            if cpu == current {
                continue;
            }
            self.queues[cpu as usize].lock().push_back(item);
            crate::arch::send_schedule_ipi(cpu);
        }
    }

    /// Take the next pending item for `cpu`.
    #[cfg(feature = "alloc")]
    pub fn pop(&self, cpu: u8) -> Option<WorkItem> {
        self.queues[cpu as usize].lock().pop_front()
    }

    /// Pending items for `cpu`.
    #[cfg(feature = "alloc")]
    pub fn pending(&self, cpu: u8) -> usize {
        self.queues[cpu as usize].lock().len()
    }
}

impl Default for IpwiQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// The system work queues.
static IPWI: IpwiQueues = IpwiQueues::new();

/// Broadcast a shootdown for `page_count` pages at `start` in the space
/// rooted at `root`.
#[cfg(feature = "alloc")]
fn broadcast(target_pid: u64, root: PhysicalAddress, start: VirtualAddress, page_count: usize) {
    let cpu_count = crate::sched::smp::cpu_count();
    if cpu_count <= 1 {
        return;
    }

    IPWI.enqueue_all_except(
        cpu_count,
        crate::sched::smp::current_cpu_id(),
        WorkItem::TlbShootdown(TlbShootdown {
            target_pid,
            target_root: root,
            start_vaddr: start,
            page_count,
        }),
    );
}

#[cfg(not(feature = "alloc"))]
fn broadcast(_pid: u64, _root: PhysicalAddress, _start: VirtualAddress, _pages: usize) {}

/// Drain and apply this CPU's pending work items. Called from the timer
/// tick and the (optional) IPI vector.
pub fn handle_pending(cpu: u8) {
    #[cfg(feature = "alloc")]
    while let Some(item) = IPWI.pop(cpu) {
        match item {
            WorkItem::TlbShootdown(shootdown) => {
                if vmm::current_root() == shootdown.target_root {
                    for i in 0..shootdown.page_count {
                        crate::arch::invalidate_page(
                            shootdown.start_vaddr.as_u64() + (i as u64) * PAGE_SIZE,
                        );
                    }
                }
            }
        }
    }

    #[cfg(not(feature = "alloc"))]
    let _ = cpu;
}

/// Map a page in `root` and shoot the address down everywhere else.
pub fn map_page_in_root(
    target_pid: u64,
    root: PhysicalAddress,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PteFlags,
) -> bool {
    if !vmm::map_page_in_root(root, virt, phys, flags) {
        return false;
    }
    broadcast(target_pid, root, virt.page_base(), 1);
    true
}

/// Map a page in the active space and shoot it down everywhere else.
pub fn map_page(virt: VirtualAddress, phys: PhysicalAddress, flags: PteFlags) -> bool {
    map_page_in_root(0, vmm::current_root(), virt, phys, flags)
}

/// Unmap a page in `root` and shoot the address down everywhere else.
/// Returns the physical target or 0.
pub fn unmap_page_in_root(target_pid: u64, root: PhysicalAddress, virt: VirtualAddress) -> u64 {
    let phys = vmm::unmap_page_in_root(root, virt);
    if phys != 0 {
        broadcast(target_pid, root, virt.page_base(), 1);
    }
    phys
}

/// Unmap a page in the active space and shoot it down everywhere else.
pub fn unmap_page(virt: VirtualAddress) -> u64 {
    unmap_page_in_root(0, vmm::current_root(), virt)
}

/// Unmap a run of pages, one shootdown for the whole range.
pub fn unmap_pages_in_root(
    target_pid: u64,
    root: PhysicalAddress,
    virt: VirtualAddress,
    page_count: usize,
) -> u64 {
    let mut first = 0;
    for i in 0..page_count {
        let phys = vmm::unmap_page_in_root(
            root,
            VirtualAddress::new(virt.as_u64() + (i as u64) * PAGE_SIZE),
        );
        if i == 0 {
            first = phys;
        }
    }
    broadcast(target_pid, root, virt.page_base(), page_count);
    first
}
