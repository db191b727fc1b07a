//! Processes
//!
//! A process owns an address space (root table), its declared memory
//! regions, any IPC channels it created, and a count of physical pages
//! allocated on its behalf. PID 1 is the bootstrap system process. Tasks
//! reference their owner by PID; destruction assumes the process's tasks
//! are already blocked or terminated.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::collections::BTreeMap;
#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
#[cfg(feature = "alloc")]
use lazy_static::lazy_static;

use crate::mm::{pmm, PhysicalAddress, VirtualAddress};
use crate::sched::ProcessId;
#[cfg(feature = "alloc")]
use crate::sync::SpinLock;

/// Most regions a process may declare.
pub const MAX_PROCESS_REGIONS: usize = 16;

bitflags! {
    /// Attributes of a process memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXEC    = 1 << 2;
        /// Lazily backed on first access: zero page for reads, a fresh
        /// frame for writes.
        const AUTOMAP = 1 << 3;
    }
}

/// One declared region of a process address space.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpaceRegion {
    pub start: VirtualAddress,
    pub length: u64,
    pub flags: RegionFlags,
}

impl AddressSpaceRegion {
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.start.as_u64() + self.length
    }
}

/// Process record.
pub struct Process {
    pub pid: ProcessId,
    pub root_table: PhysicalAddress,
    #[cfg(feature = "alloc")]
    pub regions: Vec<AddressSpaceRegion>,
    /// IPC channel cookies this process created.
    #[cfg(feature = "alloc")]
    pub channels_owned: Vec<u64>,
    /// Physical pages allocated against this process.
    pub pages_allocated: u64,
}

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

#[cfg(feature = "alloc")]
lazy_static! {
    static ref PROCESS_TABLE: SpinLock<BTreeMap<ProcessId, Process>> =
        SpinLock::new(BTreeMap::new());
}

/// Create a process over an existing address space. The first process
/// created is PID 1, the bootstrap system process.
#[cfg(feature = "alloc")]
pub fn process_create(root_table: PhysicalAddress) -> ProcessId {
    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);

    let process = Process {
        pid,
        root_table,
        regions: Vec::new(),
        channels_owned: Vec::new(),
        pages_allocated: 0,
    };

    PROCESS_TABLE.lock().insert(pid, process);
    pid
}

/// Run `f` against a process record, if it exists.
#[cfg(feature = "alloc")]
pub fn with_process<R>(pid: ProcessId, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    PROCESS_TABLE.lock().get_mut(&pid).map(f)
}

/// Declare a region. Fails (false) on an unknown process or when the
/// region limit is exhausted.
#[cfg(feature = "alloc")]
pub fn add_region(pid: ProcessId, region: AddressSpaceRegion) -> bool {
    with_process(pid, |process| {
        if process.regions.len() == MAX_PROCESS_REGIONS {
            return false;
        }
        process.regions.push(region);
        true
    })
    .unwrap_or(false)
}

/// Whether `addr` falls inside one of the process's automap regions.
#[cfg(feature = "alloc")]
pub fn in_automap_region(pid: ProcessId, addr: VirtualAddress) -> bool {
    with_process(pid, |process| {
        process
            .regions
            .iter()
            .any(|region| region.flags.contains(RegionFlags::AUTOMAP) && region.contains(addr))
    })
    .unwrap_or(false)
}

/// Allocate a physical page against the process's quota. Returns the
/// PMM sentinel on failure; the count only moves on success.
#[cfg(feature = "alloc")]
pub fn process_page_alloc(pid: ProcessId) -> u64 {
    let page = pmm::page_alloc();
    if !pmm::is_alloc_failure(page) {
        with_process(pid, |process| process.pages_allocated += 1);
    }
    page
}

/// Return a page previously counted against the process.
#[cfg(feature = "alloc")]
pub fn process_page_free(pid: ProcessId, page: u64) {
    pmm::page_free(page);
    with_process(pid, |process| {
        process.pages_allocated = process.pages_allocated.saturating_sub(1);
    });
}

/// Record that the process created an IPC channel.
#[cfg(feature = "alloc")]
pub fn register_channel(pid: ProcessId, cookie: u64) {
    with_process(pid, |process| process.channels_owned.push(cookie));
}

/// Forget a channel (it was destroyed independently).
#[cfg(feature = "alloc")]
pub fn unregister_channel(pid: ProcessId, cookie: u64) {
    with_process(pid, |process| {
        process.channels_owned.retain(|&c| c != cookie);
    });
}

/// Tear a process down: destroy its channels and drop the record. The
/// process's tasks must already be blocked or terminated.
#[cfg(feature = "alloc")]
pub fn process_destroy(pid: ProcessId) {
    let channels = match PROCESS_TABLE.lock().remove(&pid) {
        Some(process) => process.channels_owned,
        None => {
            log::warn!("process: destroy of unknown pid {}", pid);
            return;
        }
    };

    for cookie in channels {
        crate::ipc::channel_destroy(cookie);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn pids_are_unique_and_records_retrievable() {
        let a = process_create(PhysicalAddress::new(0x1000));
        let b = process_create(PhysicalAddress::new(0x2000));
        assert!(b > a, "PIDs must be monotonically assigned");

        let root = with_process(a, |p| p.root_table).expect("process exists");
        assert_eq!(root, PhysicalAddress::new(0x1000));
    }

    #[test]
    fn automap_region_lookup() {
        let pid = process_create(PhysicalAddress::new(0x3000));

        assert!(add_region(
            pid,
            AddressSpaceRegion {
                start: VirtualAddress::new(0x40_0000),
                length: 0x10_000,
                flags: RegionFlags::READ | RegionFlags::WRITE | RegionFlags::AUTOMAP,
            }
        ));
        assert!(add_region(
            pid,
            AddressSpaceRegion {
                start: VirtualAddress::new(0x80_0000),
                length: 0x1000,
                flags: RegionFlags::READ,
            }
        ));

        assert!(in_automap_region(pid, VirtualAddress::new(0x40_8000)));
        assert!(!in_automap_region(
            pid,
            VirtualAddress::new(0x40_0000 + 0x10_000)
        ));
        assert!(
            !in_automap_region(pid, VirtualAddress::new(0x80_0000)),
            "non-automap regions don't count"
        );
        assert!(!in_automap_region(9999, VirtualAddress::new(0x40_8000)));
    }

    #[test]
    fn region_limit_is_enforced() {
        let pid = process_create(PhysicalAddress::new(0x4000));
        let region = AddressSpaceRegion {
            start: VirtualAddress::new(0x10_0000),
            length: 0x1000,
            flags: RegionFlags::READ,
        };

        for _ in 0..MAX_PROCESS_REGIONS {
            assert!(add_region(pid, region));
        }
        assert!(!add_region(pid, region), "region limit must cap out");
    }

    #[test]
    fn failed_page_alloc_does_not_count() {
        // The test PMM region is empty, so allocation fails.
        let pid = process_create(PhysicalAddress::new(0x5000));
        let page = process_page_alloc(pid);
        assert!(pmm::is_alloc_failure(page));
        assert_eq!(with_process(pid, |p| p.pages_allocated), Some(0));
    }

    #[test]
    fn channel_bookkeeping() {
        let pid = process_create(PhysicalAddress::new(0x6000));
        register_channel(pid, 0xAAAA);
        register_channel(pid, 0xBBBB);
        assert_eq!(
            with_process(pid, |p| p.channels_owned.clone()),
            Some(std::vec![0xAAAA, 0xBBBB])
        );

        unregister_channel(pid, 0xAAAA);
        assert_eq!(
            with_process(pid, |p| p.channels_owned.clone()),
            Some(std::vec![0xBBBB])
        );
    }

    #[test]
    fn destroying_unknown_process_is_a_no_op() {
        process_destroy(123_456);
    }
}
