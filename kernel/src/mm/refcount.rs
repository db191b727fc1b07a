//! Shared-frame reference counts
//!
//! Tracks how many mappings share a physical frame. The copy-on-write
//! resolver decrements on a write fault: a count that reaches zero means
//! the faulting mapping is the last referee and the frame can simply be
//! flipped writable, no copy needed. Frames without an entry count as
//! unshared.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::collections::BTreeMap;

use super::PhysicalAddress;
use crate::sync::SpinLock;

#[cfg(feature = "alloc")]
static FRAME_REFCOUNTS: SpinLock<Option<BTreeMap<u64, u32>>> = SpinLock::new(None);

/// Record `extra` additional references to a shared frame.
#[cfg(feature = "alloc")]
pub fn increment(frame: PhysicalAddress, extra: u32) {
    let mut counts = FRAME_REFCOUNTS.lock();
    let map = counts.get_or_insert_with(BTreeMap::new);
    *map.entry(frame.page_base().as_u64()).or_insert(0) += extra;
}

/// Drop one reference; returns the remaining count. Frames never
/// registered report zero (unshared).
#[cfg(feature = "alloc")]
pub fn decrement(frame: PhysicalAddress) -> u32 {
    let mut counts = FRAME_REFCOUNTS.lock();
    let Some(map) = counts.as_mut() else {
        return 0;
    };

    let key = frame.page_base().as_u64();
    match map.get_mut(&key) {
        Some(count) => {
            *count = count.saturating_sub(1);
            let remaining = *count;
            if remaining == 0 {
                map.remove(&key);
            }
            remaining
        }
        None => 0,
    }
}

/// Current share count for a frame.
#[cfg(feature = "alloc")]
pub fn count(frame: PhysicalAddress) -> u32 {
    FRAME_REFCOUNTS
        .lock()
        .as_ref()
        .and_then(|map| map.get(&frame.page_base().as_u64()).copied())
        .unwrap_or(0)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn unknown_frame_decrements_to_zero() {
        assert_eq!(decrement(PhysicalAddress::new(0xDEAD_0000)), 0);
    }

    #[test]
    fn shared_frame_counts_down() {
        let frame = PhysicalAddress::new(0x7700_0000);
        increment(frame, 2);
        assert_eq!(count(frame), 2);
        assert_eq!(decrement(frame), 1);
        assert_eq!(decrement(frame), 0);
        assert_eq!(count(frame), 0);
    }

    #[test]
    fn sub_page_addresses_share_one_count() {
        let frame = PhysicalAddress::new(0x7710_0000);
        increment(frame, 1);
        assert_eq!(count(PhysicalAddress::new(0x7710_0123)), 1);
        assert_eq!(decrement(PhysicalAddress::new(0x7710_0FFF)), 0);
    }
}
