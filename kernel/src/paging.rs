//! Per-process page directory.
//!
//! Maps page-aligned user virtual addresses to frames from the user pool and
//! tracks the accessed/dirty bits the MMU would maintain. Entries use the
//! 32-bit x86 PTE layout; the frame field holds the physical frame number,
//! and the kernel alias of a frame is `OFFSET + phys`.

use alloc::collections::BTreeMap;
use medulla_shared::bitfield;
use medulla_shared::mem::{is_page_aligned, is_user_vaddr, page_round_down, OFFSET};
use spin::Mutex;

bitfield!(
    PageTableEntry, u32
    { (u32, frame, 12, 31) }
    {
        (present, 0),
        (writable, 1),
        (user, 2),
        (accessed, 5),
        (dirty, 6),
    }
);

impl PageTableEntry {
    fn for_kpage(kpage: usize, writable: bool) -> Self {
        let frame = (kpage - OFFSET) >> 12;
        Self::default()
            .with_present(true)
            .with_writable(writable)
            .with_user(true)
            .with_frame(frame as u32)
    }

    fn kpage(&self) -> usize {
        OFFSET + ((self.frame() as usize) << 12)
    }
}

/// Outcome of an address translation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Translation {
    /// Mapped; carries the kernel alias of the backing frame.
    Frame(usize),
    /// No present mapping for the page.
    NotPresent,
    /// Present, but a write was attempted on a read-only mapping.
    ReadOnly,
}

pub struct PageDirectory {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Map `upage` to the frame aliased at `kpage`. Returns `false` if
    /// `upage` is already mapped.
    pub fn install(&self, upage: usize, kpage: usize, writable: bool) -> bool {
        debug_assert!(is_page_aligned(upage) && is_user_vaddr(upage));
        debug_assert!(is_page_aligned(kpage) && kpage >= OFFSET);
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage) {
            return false;
        }
        entries.insert(upage, PageTableEntry::for_kpage(kpage, writable));
        true
    }

    /// Remove the mapping for `upage`, so future accesses fault.
    pub fn clear(&self, upage: usize) {
        debug_assert!(is_page_aligned(upage));
        self.entries.lock().remove(&upage);
    }

    /// Kernel alias of the frame backing `upage`, if mapped.
    pub fn get_page(&self, upage: usize) -> Option<usize> {
        debug_assert!(is_page_aligned(upage));
        self.entries.lock().get(&upage).map(PageTableEntry::kpage)
    }

    pub fn is_dirty(&self, upage: usize) -> bool {
        self.entries
            .lock()
            .get(&upage)
            .is_some_and(|pte| pte.dirty())
    }

    pub fn is_accessed(&self, upage: usize) -> bool {
        self.entries
            .lock()
            .get(&upage)
            .is_some_and(|pte| pte.accessed())
    }

    pub fn set_dirty(&self, upage: usize, dirty: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&upage) {
            *pte = pte.with_dirty(dirty);
        }
    }

    pub fn set_accessed(&self, upage: usize, accessed: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&upage) {
            *pte = pte.with_accessed(accessed);
        }
    }

    /// Translate `vaddr` the way the MMU would for a user access, setting the
    /// accessed bit and, for writes, the dirty bit.
    pub fn translate(&self, vaddr: usize, write: bool) -> Translation {
        let upage = page_round_down(vaddr);
        let mut entries = self.entries.lock();
        let Some(pte) = entries.get_mut(&upage) else {
            return Translation::NotPresent;
        };
        if write && !pte.writable() {
            return Translation::ReadOnly;
        }
        *pte = pte.with_accessed(true);
        if write {
            *pte = pte.with_dirty(true);
        }
        Translation::Frame(pte.kpage())
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}
