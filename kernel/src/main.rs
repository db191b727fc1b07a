//! Anos kernel binary
//!
//! Bootloader handoff and bring-up order for the kernel core. The boot
//! protocol itself (Limine-style) is external; this crate consumes the
//! handoff, stands the memory stack up bottom-to-top (PMM, direct map,
//! heap, vmalloc, FBA), then brings tasking online and parks in the idle
//! loop. Timer and interrupt wiring live in the platform layer.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_boot {
    use anos_kernel::arch::timer::{self, PeriodicTimer, DEFAULT_NANOS_PER_TICK};
    use anos_kernel::mm::bootinfo::{MemoryMapEntry, BOOT_INFO};
    use anos_kernel::mm::{
        self, direct_map, fba, page_fault, pmm, vmalloc, PhysicalAddress, VirtualAddress,
        PAGE_SIZE,
    };
    use anos_kernel::sched::{self, smp, TaskClass};
    use anos_kernel::{arch, logger, process, println};

    /// Boot tick source; the platform layer swaps in the calibrated
    /// LAPIC/HPET/CLINT wrapper once it is up.
    static BOOT_TIMER: PeriodicTimer = PeriodicTimer::new(DEFAULT_NANOS_PER_TICK);

    /// Physical memory below this is left alone (legacy areas).
    const MANAGED_BASE: u64 = 0x10_0000;

    /// Kernel heap: 4 MiB carved from the PMM, reached via the direct map.
    const HEAP_PAGES: u64 = 1024;

    /// FBA arena blocks (one bitmap page's worth).
    const FBA_BLOCKS: usize = 32768;

    /// Kernel stack blocks for the idle task.
    const IDLE_STACK_BLOCKS: usize = 2;

    extern "C" fn idle_thread() {
        loop {
            arch::idle_wait();
        }
    }

    /// Common bring-up once the boot protocol has been translated into
    /// [`MemoryMapEntry`] form.
    pub fn kernel_init(entries: &[MemoryMapEntry], hhdm_offset: u64, rsdp_phys: u64) -> ! {
        logger::init();
        println!("anos {} starting", env!("CARGO_PKG_VERSION"));

        {
            let mut info = BOOT_INFO.lock();
            info.set_memmap(entries);
            info.hhdm_offset = hhdm_offset;
            info.rsdp_phys = rsdp_phys;
            info.log_memmap();
        }

        // Physical allocator over the reclaimable map.
        pmm::init(entries, MANAGED_BASE, false);

        // Direct map, bootstrapped through the temporary windows.
        let root = PhysicalAddress::new(arch::read_page_table_root());
        // SAFETY: single-threaded BSP boot; the bootloader HHDM is intact
        // and root is the active table.
        unsafe {
            direct_map::init_direct_map(root, hhdm_offset, entries);
        }

        // Kernel heap for the alloc collections.
        let heap_phys = pmm::page_alloc_m(HEAP_PAGES);
        if pmm::is_alloc_failure(heap_phys) {
            panic!("insufficient physical memory for the kernel heap");
        }
        // SAFETY: the run was just allocated and the direct map covers it.
        unsafe {
            anos_kernel::kernel_heap().lock().init(
                mm::phys_to_virt(PhysicalAddress::new(heap_phys)).as_u64() as *mut u8,
                (HEAP_PAGES * PAGE_SIZE) as usize,
            );
        }

        // Kernel virtual ranges, then the FBA arena inside one.
        vmalloc::init();
        let arena = vmalloc::alloc(FBA_BLOCKS as u64);
        if arena == 0 {
            panic!("no kernel virtual space for the block arena");
        }
        if let Err(err) = fba::init(VirtualAddress::new(arena), FBA_BLOCKS) {
            panic!("block arena initialisation failed: {:?}", err);
        }

        // The shared zero page.
        let zero_phys = pmm::page_alloc();
        if pmm::is_alloc_failure(zero_phys) {
            panic!("insufficient physical memory for the zero page");
        }
        let zero_virt = mm::phys_to_virt(PhysicalAddress::new(zero_phys));
        // SAFETY: fresh frame, direct-mapped.
        unsafe {
            core::ptr::write_bytes(zero_virt.as_u64() as *mut u8, 0, PAGE_SIZE as usize);
        }
        page_fault::set_zero_page(PhysicalAddress::new(zero_phys));

        // The bootstrap system process.
        let pid = process::process_create(root);
        println!("bootstrap process is pid {}", pid);

        // The boot tick source backs sleep conversion and interrupt
        // acknowledgement until the platform timer driver registers.
        timer::register_timer(&BOOT_TIMER);

        // Bring this CPU's scheduler up with its permanent idle task.
        let cpu_state: &'static smp::PerCpuState = alloc::boxed::Box::leak(
            alloc::boxed::Box::new(smp::PerCpuState::new(0, arch::hardware_cpu_id())),
        );
        smp::register_cpu(cpu_state);

        let idle_stack = fba::alloc_blocks(IDLE_STACK_BLOCKS)
            .unwrap_or_else(|| panic!("no blocks for the idle stack"));
        let idle_stack_top = VirtualAddress::new(
            idle_stack.as_u64() + (IDLE_STACK_BLOCKS as u64) * PAGE_SIZE,
        );
        let idle_task = sched::task::task_create_kernel(
            pid,
            root,
            idle_stack_top,
            idle_thread as usize as u64,
            TaskClass::Idle,
        )
        .unwrap_or_else(|| panic!("idle task creation failed"));

        let flags = smp::sched_lock_this_cpu();
        // SAFETY: we hold this CPU's sched lock.
        unsafe {
            cpu_state.scheduler().set_idle(idle_task);
        }
        smp::sched_unlock_this_cpu(flags);

        println!("kernel core up; waiting for the platform timer");

        // The platform layer arms the timer and the first tick starts
        // dispatching; until then, idle in place.
        loop {
            arch::idle_wait();
        }
    }

    extern crate alloc;
}

// ---------------------------------------------------------------------------
// x86_64 entry: bootloader_api handoff.
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod entry {
    use anos_kernel::mm::bootinfo::{MemoryMapEntry, MemoryMapEntryType, MAX_MEMMAP_ENTRIES};
    use bootloader_api::config::Mapping;
    use bootloader_api::info::MemoryRegionKind;
    use bootloader_api::{entry_point, BootInfo, BootloaderConfig};

    pub static BOOT_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_entry, config = &BOOT_CONFIG);

    fn kernel_entry(boot_info: &'static mut BootInfo) -> ! {
        let mut entries = [MemoryMapEntry {
            base: 0,
            length: 0,
            entry_type: MemoryMapEntryType::Reserved,
        }; MAX_MEMMAP_ENTRIES];
        let mut count = 0;

        for region in boot_info.memory_regions.iter() {
            if count == MAX_MEMMAP_ENTRIES {
                break;
            }

            entries[count] = MemoryMapEntry {
                base: region.start,
                length: region.end - region.start,
                entry_type: match region.kind {
                    MemoryRegionKind::Usable => MemoryMapEntryType::Usable,
                    MemoryRegionKind::Bootloader => MemoryMapEntryType::BootloaderReclaimable,
                    _ => MemoryMapEntryType::Reserved,
                },
            };
            count += 1;
        }

        let hhdm_offset = boot_info
            .physical_memory_offset
            .into_option()
            .unwrap_or(0);
        let rsdp_phys = boot_info.rsdp_addr.into_option().unwrap_or(0);

        super::kernel_boot::kernel_init(&entries[..count], hhdm_offset, rsdp_phys)
    }
}

// ---------------------------------------------------------------------------
// riscv64 entry: the SBI/Limine shim hands over a translated memory map.
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod entry {
    /// The platform boot shim (outside the core) translates the Limine
    /// handoff and tail-calls in here with the real memory map.
    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        super::kernel_boot::kernel_init(&[], 0, 0)
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // Fatal path: report, then freeze. Secondary CPUs stop at their next
    // lock acquisition or timer tick; this CPU halts immediately.
    anos_kernel::println!("[KERNEL PANIC] {}", info);

    loop {
        anos_kernel::arch::idle_wait();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!("anos-kernel is a bare-metal binary; run the test suite or boot it under QEMU");
}
