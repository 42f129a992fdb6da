//! Frame table and eviction engine.
//!
//! System-wide accounting of user-pool frames. Allocation falls back to
//! enhanced second-chance replacement when the pool runs dry: any thread may
//! evict any other's frame, so the scan runs with the pin lock held and the
//! eviction lock (taken by every loader) keeps victims out of half-resident
//! states.

use crate::mem::fault::UserFault;
use crate::mem::spt::{write_back_locked, write_to_disk, PageKind, SptEntryRef};
use crate::mem::user_pool::PallocFlags;
use crate::system::System;
use crate::threading::process::Process;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use log::debug;
use medulla_shared::mem::PAGE_FRAME_SIZE;
use spin::Mutex;

/// One resident frame: where it lives, the entry it backs, and the process
/// whose page directory holds the mapping.
pub struct FrameTableEntry {
    kpage: usize,
    spte: SptEntryRef,
    owner: Arc<Process>,
}

/// All allocated user frames in FIFO insertion order.
pub struct FrameTable {
    list: Mutex<VecDeque<FrameTableEntry>>,
}

impl FrameTable {
    pub fn new() -> FrameTable {
        FrameTable {
            list: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    fn push(&self, fte: FrameTableEntry) {
        self.list.lock().push_back(fte);
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate a frame for `spte`, evicting if the pool is exhausted.
///
/// The caller must hold the system eviction lock (every loader does). The
/// only error is swap exhaustion while evicting, which kills the allocating
/// process rather than the system.
pub fn get_frame_for_page(
    system: &System,
    owner: &Arc<Process>,
    spte: &SptEntryRef,
    flags: PallocFlags,
) -> Result<usize, UserFault> {
    assert!(flags.contains(PallocFlags::USER));

    if let Some(kpage) = system.user_pool.palloc(flags) {
        system.frame_table.push(FrameTableEntry {
            kpage,
            spte: spte.clone(),
            owner: owner.clone(),
        });
        return Ok(kpage);
    }

    // Pool exhausted. Hold the pin lock so pinned-ness is stable across the
    // scan, then evict until an allocation succeeds.
    let _pin = system.pin_lock.lock();
    let mut table = system.frame_table.list.lock();
    loop {
        assert!(
            !table.is_empty(),
            "user pool exhausted with an empty frame table"
        );
        let victim = select_victim(&table).expect("every frame is pinned");
        let fte = table.remove(victim).expect("victim index in range");
        debug!(
            "evict: pid {} upage {:#x} frame {:#x}",
            fte.owner.pid,
            fte.spte.upage(),
            fte.kpage
        );
        if let Err(e) = evict(system, &fte) {
            table.push_back(fte);
            return Err(e);
        }
        if let Some(kpage) = system.user_pool.palloc(flags) {
            table.push_back(FrameTableEntry {
                kpage,
                spte: spte.clone(),
                owner: owner.clone(),
            });
            return Ok(kpage);
        }
    }
}

/// Drop the frame-table entry for `kpage` (if any) and return the frame to
/// the pool. Used by load failure paths and per-entry teardown; the caller
/// has already detached the hardware mapping.
pub fn free_frame(system: &System, kpage: usize) {
    let mut table = system.frame_table.list.lock();
    if let Some(index) = table.iter().position(|fte| fte.kpage == kpage) {
        table.remove(index);
    }
    drop(table);
    system.user_pool.pfree(kpage);
}

/// Enhanced second-chance victim selection over the FIFO frame list.
/// Pinned frames are never chosen. Returns an index into `table`.
fn select_victim(table: &VecDeque<FrameTableEntry>) -> Option<usize> {
    // Phase 1: take a clean un-accessed page, opportunistically cleaning
    // dirty file-backed pages along the way. A dirty anonymous page is fair
    // game; its dirty bit is discarded through swap anyway.
    for (index, fte) in table.iter().enumerate() {
        if fte.spte.pinned() {
            continue;
        }
        let upage = fte.spte.upage();
        let pd = &fte.owner.pagedir;
        let dirty = pd.is_dirty(upage);
        let accessed = pd.is_accessed(upage);
        let is_code = fte.spte.is_code();

        if !is_code && dirty {
            if write_to_disk(&fte.owner, &fte.spte) {
                pd.set_dirty(upage, false);
            }
            continue;
        }
        if !accessed {
            return Some(index);
        }
    }

    // Phase 2: second-chance sweep; clear accessed bits on everything we
    // pass over.
    for (index, fte) in table.iter().enumerate() {
        if fte.spte.pinned() {
            continue;
        }
        let upage = fte.spte.upage();
        let pd = &fte.owner.pagedir;
        let dirty = pd.is_dirty(upage);
        let accessed = pd.is_accessed(upage);
        let is_code = fte.spte.is_code();

        if !accessed && (!dirty || is_code) {
            return Some(index);
        }
        pd.set_accessed(upage, false);
    }

    // Phase 3: first unpinned frame in FIFO order.
    table.iter().position(|fte| !fte.spte.pinned())
}

/// Make `fte`'s page non-resident: write back or swap out its contents,
/// clear the hardware mapping, and free the frame. On swap exhaustion the
/// entry is left untouched and the caller reinstates it.
fn evict(system: &System, fte: &FrameTableEntry) -> Result<(), UserFault> {
    let upage = fte.spte.upage();
    let pd = &fte.owner.pagedir;
    let mut st = fte.spte.state.lock();
    debug_assert_eq!(st.frame, Some(fte.kpage), "frame table out of sync");

    if matches!(st.kind, PageKind::Mmap { .. }) {
        if pd.is_dirty(upage) && !write_back_locked(system, &st) {
            panic!("mmap write-back failed during eviction");
        }
    } else {
        // FILE pages are promoted to CODE on first eviction: a writable
        // page's dirty bytes cannot go back into the executable, so they
        // survive in swap. Anonymous pages always go to swap.
        let mut buf = [0u8; PAGE_FRAME_SIZE];
        system.user_pool.read_frame(fte.kpage, 0, &mut buf);
        let Some(slot) = system.swap.swap_out(&buf) else {
            return Err(UserFault::OutOfSwap);
        };
        st.kind = PageKind::Code {
            swap_slot: Some(slot),
        };
    }

    pd.clear(upage);
    st.frame = None;
    drop(st);
    system.user_pool.pfree(fte.kpage);
    Ok(())
}
