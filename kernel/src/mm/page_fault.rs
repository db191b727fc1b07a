//! Page-fault handling
//!
//! Classifies faults into copy-on-write resolution, automap population,
//! or fatality, then applies the fix. Classification is pure
//! ([`resolve_fault`]) so the decision table is testable without an MMU;
//! the handler proper glues it to the mapper, the PMM, and the per-CPU
//! temporary page used for safe copies.

use bitflags::bitflags;

use super::page_table::{PageTableEntry, PteFlags};
use super::{pmm, refcount, vmm, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::arch;

use core::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    /// Page-fault error code (x86 layout; the riscv trap glue translates
    /// scause into the same bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u64 {
        const PRESENT     = 1 << 0;
        const WRITE       = 1 << 1;
        const USER        = 1 << 2;
        const RESERVED    = 1 << 3;
        const INSTRUCTION = 1 << 4;
    }
}

/// The shared kernel zero page, allocated once at mm bring-up.
static KERNEL_ZERO_PAGE: AtomicU64 = AtomicU64::new(0);

/// Install the shared zero page. The frame must be zeroed and permanently
/// resident.
pub fn set_zero_page(phys: PhysicalAddress) {
    KERNEL_ZERO_PAGE.store(phys.as_u64(), Ordering::Release);
}

/// The shared zero page's physical address.
pub fn zero_page() -> PhysicalAddress {
    PhysicalAddress::new(KERNEL_ZERO_PAGE.load(Ordering::Acquire))
}

/// What a fault resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// COW write, frame no longer shared: flip the mapping writable.
    CowFlipWritable { entry: PageTableEntry },
    /// COW write to a still-shared frame (or the zero page): copy into a
    /// fresh frame and remap writable.
    CowCopy { entry: PageTableEntry },
    /// First write into an automap region: fresh zeroed frame.
    AutomapFreshFrame,
    /// First read from an automap region: zero page, read-only COW.
    AutomapZeroPage,
    /// Nothing recoverable.
    Fatal,
}

/// The decision table. `leaf` is the present leaf PTE covering the fault
/// address (if any), `in_automap` whether the current process has an
/// automap region over it, and `shared_after_release` reports the frame's
/// remaining share count after dropping this mapping's reference.
pub fn resolve_fault(
    code: PageFaultCode,
    fault_addr: VirtualAddress,
    leaf: Option<PageTableEntry>,
    in_automap: bool,
    zero_page: PhysicalAddress,
    shared_after_release: impl FnOnce(PhysicalAddress) -> u32,
) -> FaultResolution {
    // COW only applies to pages mapped present in userspace; kernel-space
    // faults must fail fast.
    if fault_addr.is_user() {
        if let Some(entry) = leaf {
            if entry.is_present()
                && entry.flags().contains(PteFlags::COPY_ON_WRITE)
                && code.contains(PageFaultCode::WRITE)
            {
                let frame = entry.phys();
                if frame != zero_page && shared_after_release(frame) == 0 {
                    return FaultResolution::CowFlipWritable { entry };
                }
                return FaultResolution::CowCopy { entry };
            }
        }
    }

    if in_automap {
        if code.contains(PageFaultCode::WRITE) {
            return FaultResolution::AutomapFreshFrame;
        }
        return FaultResolution::AutomapZeroPage;
    }

    FaultResolution::Fatal
}

/// Scoped per-CPU temporary mapping, used to reach a destination frame
/// while copying under disabled interrupts. Releasing unmaps and
/// invalidates on every exit path.
pub struct TempPage {
    virt: VirtualAddress,
    saved_flags: arch::IrqFlags,
}

impl TempPage {
    /// Map `phys` at this CPU's temporary page. Interrupts stay disabled
    /// until the window is dropped.
    pub fn map(phys: PhysicalAddress) -> Self {
        let saved_flags = arch::local_irq_save();
        let cpu = crate::sched::smp::current_cpu_id();
        let virt = super::per_cpu_temp_page_addr(cpu);
        vmm::map_page(virt, phys, PteFlags::kernel_rw());
        Self { virt, saved_flags }
    }

    pub fn addr(&self) -> VirtualAddress {
        self.virt
    }
}

impl Drop for TempPage {
    fn drop(&mut self) {
        vmm::unmap_page(self.virt);
        arch::local_irq_restore(self.saved_flags);
    }
}

/// Copy the page at `src_virt` into the physical frame `dest_phys` via the
/// per-CPU temporary window.
fn copy_page_safely(src_virt: VirtualAddress, dest_phys: PhysicalAddress) {
    let window = TempPage::map(dest_phys);

    let src = src_virt.page_base().as_u64() as *const u64;
    let dest = window.addr().as_u64() as *mut u64;

    // SAFETY: src is the (mapped, faulting) page, dest the freshly-mapped
    // temp window; both are page-sized and disjoint.
    unsafe {
        for i in 0..(PAGE_SIZE as usize / 8) {
            dest.add(i).write(src.add(i).read());
        }
    }
}

/// Allocate a frame against the owning process's quota when there is one,
/// or from the bare PMM otherwise.
#[cfg(feature = "alloc")]
fn alloc_phys_appropriately(owner: Option<u64>) -> u64 {
    match owner {
        Some(pid) => crate::process::process_page_alloc(pid),
        None => pmm::page_alloc(),
    }
}

/// Page-fault handler used before tasking is up: everything is fatal.
pub fn early_page_fault_handler(code: u64, fault_addr: u64, origin_ip: u64) -> ! {
    panic!(
        "early page fault at {:#018x} (code {:#x}) from {:#018x}",
        fault_addr, code, origin_ip
    );
}

/// The full handler, installed once SMP and tasking are running.
#[cfg(feature = "alloc")]
pub fn page_fault_handler(code: PageFaultCode, fault_addr: VirtualAddress, origin_ip: u64) {
    let fault_page = fault_addr.page_base();
    let root = vmm::current_root();

    let leaf = {
        let mut access = vmm::DirectMapAccess;
        vmm::walk_to_entry(&mut access, root, fault_addr).map(|(entry, _)| entry)
    };

    let current_pid = crate::sched::task_current_pid();
    let in_automap = current_pid
        .map(|pid| crate::process::in_automap_region(pid, fault_addr))
        .unwrap_or(false);

    let resolution = resolve_fault(code, fault_addr, leaf, in_automap, zero_page(), |frame| {
        refcount::decrement(frame)
    });

    match resolution {
        FaultResolution::CowFlipWritable { entry } => {
            let flags = (entry.flags() - PteFlags::COPY_ON_WRITE) | PteFlags::WRITE;
            vmm::map_page(fault_page, entry.phys(), flags);
        }

        FaultResolution::CowCopy { entry } => {
            let phys = alloc_phys_appropriately(current_pid);
            if pmm::is_alloc_failure(phys) {
                panic!(
                    "out of memory resolving COW fault at {:#018x} from {:#018x}",
                    fault_addr.as_u64(),
                    origin_ip
                );
            }

            copy_page_safely(fault_page, PhysicalAddress::new(phys));

            let flags = (entry.flags() - PteFlags::COPY_ON_WRITE) | PteFlags::WRITE;
            vmm::map_page(fault_page, PhysicalAddress::new(phys), flags);
        }

        FaultResolution::AutomapFreshFrame => {
            let phys = alloc_phys_appropriately(current_pid);
            if pmm::is_alloc_failure(phys) {
                panic!(
                    "out of memory populating automap region at {:#018x} from {:#018x}",
                    fault_addr.as_u64(),
                    origin_ip
                );
            }

            vmm::map_page(fault_page, PhysicalAddress::new(phys), PteFlags::user_rw());

            let page = fault_page.as_u64() as *mut u64;
            // SAFETY: the page was just mapped writable at fault_page.
            unsafe {
                for i in 0..(PAGE_SIZE as usize / 8) {
                    page.add(i).write(0);
                }
            }
        }

        FaultResolution::AutomapZeroPage => {
            vmm::map_page(
                fault_page,
                zero_page(),
                PteFlags::user_ro() | PteFlags::COPY_ON_WRITE,
            );
        }

        FaultResolution::Fatal => {
            panic!(
                "unhandled page fault at {:#018x} (code {:#x}) from {:#018x}",
                fault_addr.as_u64(),
                code.bits(),
                origin_ip
            );
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    const ZERO_PAGE: PhysicalAddress = PhysicalAddress::new(0x9000);
    const USER_ADDR: VirtualAddress = VirtualAddress::new(0x40_0000);

    fn cow_leaf(phys: u64) -> PageTableEntry {
        PageTableEntry::new_leaf(
            PhysicalAddress::new(phys),
            PteFlags::user_ro() | PteFlags::COPY_ON_WRITE,
        )
    }

    #[test]
    fn cow_write_to_unshared_frame_flips_writable() {
        let entry = cow_leaf(0xA000);
        let resolution = resolve_fault(
            PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::USER,
            USER_ADDR,
            Some(entry),
            false,
            ZERO_PAGE,
            |_| 0,
        );
        assert_eq!(resolution, FaultResolution::CowFlipWritable { entry });
    }

    #[test]
    fn cow_write_to_shared_frame_copies() {
        let entry = cow_leaf(0xA000);
        let resolution = resolve_fault(
            PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::USER,
            USER_ADDR,
            Some(entry),
            false,
            ZERO_PAGE,
            |_| 3,
        );
        assert_eq!(resolution, FaultResolution::CowCopy { entry });
    }

    #[test]
    fn cow_write_to_zero_page_always_copies() {
        let entry = cow_leaf(ZERO_PAGE.as_u64());
        let resolution = resolve_fault(
            PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::USER,
            USER_ADDR,
            Some(entry),
            false,
            ZERO_PAGE,
            |_| panic!("zero page must not consult refcounts"),
        );
        assert_eq!(resolution, FaultResolution::CowCopy { entry });
    }

    #[test]
    fn cow_read_fault_is_not_cow_resolved() {
        let entry = cow_leaf(0xA000);
        let resolution = resolve_fault(
            PageFaultCode::PRESENT | PageFaultCode::USER,
            USER_ADDR,
            Some(entry),
            false,
            ZERO_PAGE,
            |_| 0,
        );
        assert_eq!(resolution, FaultResolution::Fatal);
    }

    #[test]
    fn kernel_space_cow_is_fatal() {
        let entry = cow_leaf(0xA000);
        let resolution = resolve_fault(
            PageFaultCode::PRESENT | PageFaultCode::WRITE,
            VirtualAddress::new(0xFFFF_FFFF_9000_0000),
            Some(entry),
            false,
            ZERO_PAGE,
            |_| 0,
        );
        assert_eq!(resolution, FaultResolution::Fatal);
    }

    #[test]
    fn automap_write_gets_fresh_frame() {
        let resolution = resolve_fault(
            PageFaultCode::WRITE | PageFaultCode::USER,
            USER_ADDR,
            None,
            true,
            ZERO_PAGE,
            |_| 0,
        );
        assert_eq!(resolution, FaultResolution::AutomapFreshFrame);
    }

    #[test]
    fn automap_read_gets_zero_page() {
        let resolution = resolve_fault(
            PageFaultCode::USER,
            USER_ADDR,
            None,
            true,
            ZERO_PAGE,
            |_| 0,
        );
        assert_eq!(resolution, FaultResolution::AutomapZeroPage);
    }

    #[test]
    fn unmapped_non_automap_fault_is_fatal() {
        let resolution = resolve_fault(
            PageFaultCode::WRITE | PageFaultCode::USER,
            USER_ADDR,
            None,
            false,
            ZERO_PAGE,
            |_| 0,
        );
        assert_eq!(resolution, FaultResolution::Fatal);
    }

    #[test]
    fn cow_write_falls_through_to_automap_when_shared_check_is_moot() {
        // A present, non-COW user page that still faults on write inside
        // an automap region resolves as an automap write.
        let entry = PageTableEntry::new_leaf(PhysicalAddress::new(0xB000), PteFlags::user_ro());
        let resolution = resolve_fault(
            PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::USER,
            USER_ADDR,
            Some(entry),
            true,
            ZERO_PAGE,
            |_| 0,
        );
        assert_eq!(resolution, FaultResolution::AutomapFreshFrame);
    }
}
