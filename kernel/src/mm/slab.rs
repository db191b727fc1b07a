//! Slab allocator
//!
//! Carves 64-byte objects out of 4 KiB FBA blocks. Each block's first 64
//! bytes hold the slab header (`next` link plus a 256-bit bitmap); bit 0
//! covers the header slot itself and is never handed out. Slabs live on
//! exactly one of three lists: empty (header bit only), partial, or full
//! (all object bits set). Small kernel records (IPC messages, sleepers)
//! come from here.

use core::ptr::{self, NonNull};

use super::{fba, VirtualAddress, PAGE_ALIGN_MASK, PAGE_SIZE};
use crate::sync::SpinLock;

/// Size of every slab object.
pub const SLAB_OBJECT_SIZE: usize = 64;

/// Objects per slab, header slot included.
pub const OBJECTS_PER_SLAB: usize = (PAGE_SIZE as usize) / SLAB_OBJECT_SIZE;

/// In-block slab header. Occupies object slot 0.
#[repr(C, align(64))]
struct SlabHeader {
    next: *mut SlabHeader,
    /// 256-bit allocation bitmap; only the first word is live for 4 KiB
    /// slabs of 64-byte objects, the rest stays zero.
    bitmap: [u64; 4],
}

/// Where fresh slab blocks come from. The kernel uses [`FbaBlockSource`];
/// tests substitute host buffers.
pub trait BlockSource {
    fn alloc_block(&mut self) -> Option<VirtualAddress>;
}

/// The system FBA as block source.
pub struct FbaBlockSource;

impl BlockSource for FbaBlockSource {
    fn alloc_block(&mut self) -> Option<VirtualAddress> {
        fba::alloc_block()
    }
}

/// Slab state: the three lists. Empty slabs are retained for reuse rather
/// than returned to the FBA.
pub struct SlabAllocator {
    empty: *mut SlabHeader,
    partial: *mut SlabHeader,
    full: *mut SlabHeader,
}

// SAFETY: the raw list heads are only touched under the allocator's lock.
unsafe impl Send for SlabAllocator {}

impl SlabAllocator {
    pub const fn new() -> Self {
        Self {
            empty: ptr::null_mut(),
            partial: ptr::null_mut(),
            full: ptr::null_mut(),
        }
    }

    /// Allocate one 64-byte object.
    pub fn alloc(&mut self, source: &mut impl BlockSource) -> Option<NonNull<u8>> {
        let slab = if !self.partial.is_null() {
            self.partial
        } else if !self.empty.is_null() {
            let slab = Self::pop(&mut self.empty);
            Self::push(&mut self.partial, slab);
            slab
        } else {
            let block = source.alloc_block()?;
            let slab = block.as_u64() as *mut SlabHeader;
            // SAFETY: the FBA just handed us a writable, page-aligned
            // block; the header occupies its first object slot.
            unsafe {
                (*slab).next = ptr::null_mut();
                (*slab).bitmap = [1, 0, 0, 0];
            }
            Self::push(&mut self.partial, slab);
            slab
        };

        // SAFETY: slab points at a live block on one of our lists.
        let word = unsafe { (*slab).bitmap[0] };
        debug_assert_ne!(word, u64::MAX, "full slab on the partial list");

        let bit = word.trailing_ones() as usize;
        // SAFETY: as above; bit < 64 because word != MAX.
        unsafe {
            (*slab).bitmap[0] |= 1 << bit;
            if (*slab).bitmap[0] == u64::MAX {
                Self::remove(&mut self.partial, slab);
                Self::push(&mut self.full, slab);
            }
        }

        let addr = slab as u64 + (bit * SLAB_OBJECT_SIZE) as u64;
        NonNull::new(addr as *mut u8)
    }

    /// Free one object. Freeing the header slot of a slab is ignored.
    pub fn free(&mut self, obj: NonNull<u8>) {
        let addr = obj.as_ptr() as u64;
        let slab = (addr & PAGE_ALIGN_MASK) as *mut SlabHeader;
        let bit = ((addr & !PAGE_ALIGN_MASK) as usize) / SLAB_OBJECT_SIZE;

        if bit == 0 {
            return;
        }

        // SAFETY: obj came from alloc(), so its page base is a live slab.
        unsafe {
            let was_full = (*slab).bitmap[0] == u64::MAX;

            if (*slab).bitmap[0] & (1 << bit) == 0 {
                // Double free; leave the lists alone.
                return;
            }

            (*slab).bitmap[0] &= !(1 << bit);

            if was_full {
                Self::remove(&mut self.full, slab);
                Self::push(&mut self.partial, slab);
            } else if (*slab).bitmap[0] == 1 {
                Self::remove(&mut self.partial, slab);
                Self::push(&mut self.empty, slab);
            }
        }
    }

    fn push(list: &mut *mut SlabHeader, slab: *mut SlabHeader) {
        // SAFETY: slab is a live header; lists are lock-protected.
        unsafe {
            (*slab).next = *list;
        }
        *list = slab;
    }

    fn pop(list: &mut *mut SlabHeader) -> *mut SlabHeader {
        let slab = *list;
        // SAFETY: caller checked the list is non-empty.
        unsafe {
            *list = (*slab).next;
            (*slab).next = ptr::null_mut();
        }
        slab
    }

    fn remove(list: &mut *mut SlabHeader, slab: *mut SlabHeader) {
        if *list == slab {
            Self::pop(list);
            return;
        }

        let mut cursor = *list;
        // SAFETY: walking a lock-protected singly-linked list of live
        // headers.
        unsafe {
            while !cursor.is_null() {
                if (*cursor).next == slab {
                    (*cursor).next = (*slab).next;
                    (*slab).next = ptr::null_mut();
                    return;
                }
                cursor = (*cursor).next;
            }
        }
    }

    fn count_list(mut head: *mut SlabHeader) -> usize {
        let mut n = 0;
        // SAFETY: walking a lock-protected list of live headers.
        unsafe {
            while !head.is_null() {
                n += 1;
                head = (*head).next;
            }
        }
        n
    }

    pub fn empty_count(&self) -> usize {
        Self::count_list(self.empty)
    }

    pub fn partial_count(&self) -> usize {
        Self::count_list(self.partial)
    }

    pub fn full_count(&self) -> usize {
        Self::count_list(self.full)
    }
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The system slab allocator.
static SYSTEM_SLAB: SpinLock<SlabAllocator> = SpinLock::new(SlabAllocator::new());

/// Allocate one 64-byte object from the system slab.
pub fn alloc_block() -> Option<NonNull<u8>> {
    SYSTEM_SLAB.lock().alloc(&mut FbaBlockSource)
}

/// Free an object back to the system slab.
pub fn free_block(obj: NonNull<u8>) {
    SYSTEM_SLAB.lock().free(obj)
}

/// Allocate a typed slab object. `T` must fit one slot.
pub fn alloc_object<T>() -> Option<NonNull<T>> {
    const {
        assert!(core::mem::size_of::<T>() <= SLAB_OBJECT_SIZE);
        assert!(core::mem::align_of::<T>() <= SLAB_OBJECT_SIZE);
    }
    alloc_block().map(NonNull::cast)
}

/// Free a typed slab object. The object must have come from
/// [`alloc_object`] and must already have been dropped in place.
pub fn free_object<T>(obj: NonNull<T>) {
    free_block(obj.cast())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::fba::tests::PageArea;
    use std::vec::Vec;

    /// Hands out host pages as slab blocks.
    struct MockBlocks {
        areas: Vec<PageArea>,
        pub allocs: usize,
    }

    impl MockBlocks {
        fn new() -> Self {
            Self {
                areas: Vec::new(),
                allocs: 0,
            }
        }
    }

    impl BlockSource for MockBlocks {
        fn alloc_block(&mut self) -> Option<VirtualAddress> {
            let area = PageArea::new(1);
            let base = area.base();
            self.areas.push(area);
            self.allocs += 1;
            Some(base)
        }
    }

    fn bitmap0(obj: NonNull<u8>) -> u64 {
        let slab = (obj.as_ptr() as u64 & PAGE_ALIGN_MASK) as *const u64;
        // SAFETY: slab header starts at the block base; word 1 of the
        // header struct is bitmap[0].
        unsafe { *slab.add(1) }
    }

    #[test]
    fn first_alloc_pulls_a_block_and_skips_header() {
        let mut blocks = MockBlocks::new();
        let mut slab = SlabAllocator::new();

        let obj = slab.alloc(&mut blocks).expect("first object");
        assert_eq!(blocks.allocs, 1);
        assert_eq!(
            obj.as_ptr() as u64 & 0xFFF,
            64,
            "first object sits just past the header"
        );
        assert_eq!(bitmap0(obj), 0b11, "header + first object marked");
        assert_eq!(slab.partial_count(), 1);
    }

    #[test]
    fn objects_are_64_byte_spaced_and_distinct() {
        let mut blocks = MockBlocks::new();
        let mut slab = SlabAllocator::new();

        let a = slab.alloc(&mut blocks).expect("a");
        let b = slab.alloc(&mut blocks).expect("b");
        let c = slab.alloc(&mut blocks).expect("c");

        assert_eq!(b.as_ptr() as u64 - a.as_ptr() as u64, 64);
        assert_eq!(c.as_ptr() as u64 - b.as_ptr() as u64, 64);
        assert_eq!(blocks.allocs, 1, "all three come from one slab");
    }

    #[test]
    fn slab_fills_then_new_block_is_pulled() {
        let mut blocks = MockBlocks::new();
        let mut slab = SlabAllocator::new();

        // 63 allocatable objects per slab (slot 0 is the header).
        for _ in 0..(OBJECTS_PER_SLAB - 1) {
            slab.alloc(&mut blocks).expect("object within slab");
        }
        assert_eq!(blocks.allocs, 1);
        assert_eq!(slab.full_count(), 1);
        assert_eq!(slab.partial_count(), 0);

        let overflow = slab.alloc(&mut blocks).expect("object from second slab");
        assert_eq!(blocks.allocs, 2);
        assert_eq!(overflow.as_ptr() as u64 & 0xFFF, 64);
    }

    #[test]
    fn free_moves_full_slab_back_to_partial() {
        let mut blocks = MockBlocks::new();
        let mut slab = SlabAllocator::new();

        let mut objs = Vec::new();
        for _ in 0..(OBJECTS_PER_SLAB - 1) {
            objs.push(slab.alloc(&mut blocks).expect("object"));
        }
        assert_eq!(slab.full_count(), 1);

        slab.free(objs.pop().expect("last object"));
        assert_eq!(slab.full_count(), 0);
        assert_eq!(slab.partial_count(), 1);
    }

    #[test]
    fn freeing_everything_parks_slab_on_empty_list() {
        let mut blocks = MockBlocks::new();
        let mut slab = SlabAllocator::new();

        let a = slab.alloc(&mut blocks).expect("a");
        let b = slab.alloc(&mut blocks).expect("b");

        slab.free(a);
        slab.free(b);

        assert_eq!(slab.partial_count(), 0);
        assert_eq!(slab.empty_count(), 1);

        // Reuse must not pull a fresh block.
        let c = slab.alloc(&mut blocks).expect("c");
        assert_eq!(blocks.allocs, 1);
        assert_eq!(c.as_ptr() as u64 & 0xFFF, 64);
    }

    #[test]
    fn header_slot_free_is_ignored() {
        let mut blocks = MockBlocks::new();
        let mut slab = SlabAllocator::new();

        let obj = slab.alloc(&mut blocks).expect("object");
        let header = ((obj.as_ptr() as u64) & PAGE_ALIGN_MASK) as *mut u8;

        slab.free(NonNull::new(header).expect("header pointer"));
        assert_eq!(bitmap0(obj), 0b11, "header bit must survive");
    }

    #[test]
    fn double_free_is_ignored() {
        let mut blocks = MockBlocks::new();
        let mut slab = SlabAllocator::new();

        let a = slab.alloc(&mut blocks).expect("a");
        let _b = slab.alloc(&mut blocks).expect("b");

        slab.free(a);
        let after_first = bitmap0(_b);
        slab.free(a);
        assert_eq!(bitmap0(_b), after_first);
        assert_eq!(slab.partial_count(), 1);
    }

    #[test]
    fn object_addresses_decode_back_to_their_slab() {
        let mut blocks = MockBlocks::new();
        let mut slab = SlabAllocator::new();

        for _ in 0..10 {
            let obj = slab.alloc(&mut blocks).expect("object");
            let addr = obj.as_ptr() as u64;
            let bit = ((addr & 0xFFF) as usize) / SLAB_OBJECT_SIZE;
            assert!(bit > 0 && bit < OBJECTS_PER_SLAB);
            assert_ne!(bitmap0(obj) & (1 << bit), 0, "object's bit must be set");
        }
    }
}
