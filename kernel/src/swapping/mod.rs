//! Swap device.
//!
//! A fixed number of page-sized slots over an in-memory partition image,
//! allocated out of a bitmap. A slot is owned by exactly one page-table
//! entry from `swap_out` until `swap_in` or an explicit free.

use alloc::boxed::Box;
use alloc::vec;
use bitvec::prelude::*;
use log::trace;
use medulla_shared::mem::PAGE_FRAME_SIZE;
use spin::Mutex;

pub struct SwapDevice {
    inner: Mutex<SwapInner>,
}

struct SwapInner {
    area: Box<[u8]>,
    // bit set = slot in use
    slots: BitVec<u64, Lsb0>,
}

impl SwapDevice {
    pub fn new(slot_count: usize) -> SwapDevice {
        SwapDevice {
            inner: Mutex::new(SwapInner {
                area: vec![0u8; slot_count * PAGE_FRAME_SIZE].into_boxed_slice(),
                slots: bitvec![u64, Lsb0; 0; slot_count],
            }),
        }
    }

    /// Copy one page into a freshly allocated slot. Returns the slot index,
    /// or `None` if every slot is taken.
    pub fn swap_out(&self, page: &[u8; PAGE_FRAME_SIZE]) -> Option<usize> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.iter_zeros().next()?;
        inner.slots.set(slot, true);
        let base = slot * PAGE_FRAME_SIZE;
        inner.area[base..base + PAGE_FRAME_SIZE].copy_from_slice(page);
        trace!("swap: page out to slot {slot}");
        Some(slot)
    }

    /// Copy the contents of `slot` into `page` and release the slot.
    ///
    /// Panics if `slot` is not currently allocated.
    pub fn swap_in(&self, slot: usize, page: &mut [u8; PAGE_FRAME_SIZE]) {
        let mut inner = self.inner.lock();
        assert!(inner.slots[slot], "swap_in of free slot {slot}");
        let base = slot * PAGE_FRAME_SIZE;
        page.copy_from_slice(&inner.area[base..base + PAGE_FRAME_SIZE]);
        inner.slots.set(slot, false);
        trace!("swap: page in from slot {slot}");
    }

    /// Release `slot` without reading it (process teardown).
    ///
    /// Panics if `slot` is not currently allocated.
    pub fn free_slot(&self, slot: usize) {
        let mut inner = self.inner.lock();
        assert!(inner.slots[slot], "free of free slot {slot}");
        inner.slots.set(slot, false);
    }

    pub fn slots_in_use(&self) -> usize {
        self.inner.lock().slots.count_ones()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_in_round_trip() {
        let swap = SwapDevice::new(4);
        let mut page = [0u8; PAGE_FRAME_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let slot = swap.swap_out(&page).unwrap();
        assert_eq!(swap.slots_in_use(), 1);

        let mut back = [0u8; PAGE_FRAME_SIZE];
        swap.swap_in(slot, &mut back);
        assert_eq!(page[..], back[..]);
        // swap_in released the slot
        assert_eq!(swap.slots_in_use(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let swap = SwapDevice::new(2);
        let page = [0u8; PAGE_FRAME_SIZE];
        let a = swap.swap_out(&page).unwrap();
        let b = swap.swap_out(&page).unwrap();
        assert_ne!(a, b);
        assert!(swap.swap_out(&page).is_none());

        swap.free_slot(a);
        assert_eq!(swap.swap_out(&page), Some(a));
    }

    #[test]
    #[should_panic]
    fn test_swap_in_free_slot_panics() {
        let swap = SwapDevice::new(1);
        let mut page = [0u8; PAGE_FRAME_SIZE];
        swap.swap_in(0, &mut page);
    }
}
