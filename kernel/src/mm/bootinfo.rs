//! Bootloader handoff snapshot
//!
//! The bootloader hands over a memory map, the HHDM offset, the RSDP
//! pointer, a framebuffer descriptor, and any loaded modules. All of it
//! lives in bootloader-reclaimable memory, so the kernel copies what it
//! needs into these static structures before the PMM is allowed to hand
//! those areas out again.

use crate::sync::SpinLock;

/// Memory map entry classification (Limine-style).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMapEntryType {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    BootloaderReclaimable,
    ExecutableAndModules,
    Framebuffer,
}

/// One memory map entry.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub entry_type: MemoryMapEntryType,
}

/// Maximum memory map entries the static snapshot holds.
pub const MAX_MEMMAP_ENTRIES: usize = 128;

/// Maximum loaded modules tracked.
pub const MAX_MODULES: usize = 16;

/// Framebuffer descriptor as handed over by the bootloader.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramebufferInfo {
    pub phys_base: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u16,
}

/// A module loaded alongside the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleInfo {
    pub phys_base: u64,
    pub length: u64,
}

/// The validated boot handoff.
pub struct BootInfo {
    memmap: [Option<MemoryMapEntry>; MAX_MEMMAP_ENTRIES],
    memmap_len: usize,
    pub hhdm_offset: u64,
    pub rsdp_phys: u64,
    pub framebuffer: Option<FramebufferInfo>,
    modules: [ModuleInfo; MAX_MODULES],
    module_len: usize,
}

impl BootInfo {
    pub const fn empty() -> Self {
        Self {
            memmap: [None; MAX_MEMMAP_ENTRIES],
            memmap_len: 0,
            hhdm_offset: 0,
            rsdp_phys: 0,
            framebuffer: None,
            modules: [ModuleInfo {
                phys_base: 0,
                length: 0,
            }; MAX_MODULES],
            module_len: 0,
        }
    }

    /// Copy a bootloader memory map into the snapshot, dropping (with a
    /// warning) anything past capacity.
    pub fn set_memmap(&mut self, entries: &[MemoryMapEntry]) {
        self.memmap_len = 0;
        for entry in entries {
            if self.memmap_len == MAX_MEMMAP_ENTRIES {
                log::warn!("bootinfo: memory map truncated at {} entries", MAX_MEMMAP_ENTRIES);
                break;
            }
            self.memmap[self.memmap_len] = Some(*entry);
            self.memmap_len += 1;
        }
    }

    pub fn memmap(&self) -> impl Iterator<Item = &MemoryMapEntry> {
        self.memmap[..self.memmap_len].iter().flatten()
    }

    pub fn add_module(&mut self, module: ModuleInfo) {
        if self.module_len == MAX_MODULES {
            log::warn!("bootinfo: module list truncated at {} entries", MAX_MODULES);
            return;
        }
        self.modules[self.module_len] = module;
        self.module_len += 1;
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules[..self.module_len]
    }

    /// Dump the memory map through the logger.
    pub fn log_memmap(&self) {
        for entry in self.memmap() {
            log::info!(
                "memmap: {:#018x} + {:#x} {:?}",
                entry.base,
                entry.length,
                entry.entry_type
            );
        }
    }
}

/// Global boot handoff, populated once by the entry path.
pub static BOOT_INFO: SpinLock<BootInfo> = SpinLock::new(BootInfo::empty());

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn snapshot_copies_entries() {
        let mut info = BootInfo::empty();
        info.set_memmap(&[
            MemoryMapEntry {
                base: 0x1000,
                length: 0x1000,
                entry_type: MemoryMapEntryType::Usable,
            },
            MemoryMapEntry {
                base: 0x2000,
                length: 0x3000,
                entry_type: MemoryMapEntryType::AcpiNvs,
            },
        ]);

        let collected: std::vec::Vec<_> = info.memmap().collect();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[1].entry_type, MemoryMapEntryType::AcpiNvs);
    }

    #[test]
    fn module_list_capped() {
        let mut info = BootInfo::empty();
        for i in 0..(MAX_MODULES + 4) {
            info.add_module(ModuleInfo {
                phys_base: i as u64 * 0x1000,
                length: 0x1000,
            });
        }
        assert_eq!(info.modules().len(), MAX_MODULES);
    }
}
