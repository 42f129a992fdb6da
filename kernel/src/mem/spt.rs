//! Supplemental page table.
//!
//! Per-process metadata for every user page the process may legally touch,
//! resident or not. Each entry names its backing store (an executable file
//! region, a memory-mapped file region, or anonymous swap) and, while
//! resident, the frame that holds it. The page-fault and syscall paths load
//! entries on demand; the eviction engine takes frames back.

use crate::fs::File;
use crate::mem::fault::UserFault;
use crate::mem::frame_table::{free_frame, get_frame_for_page};
use crate::mem::user_pool::PallocFlags;
use crate::system::System;
use crate::threading::process::Process;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, trace};
use medulla_shared::mem::{
    is_page_aligned, is_user_vaddr, page_round_down, MAX_STACK_SIZE, OFFSET, PAGE_FRAME_SIZE,
};
use spin::Mutex;

pub type SptEntryRef = Arc<SptEntry>;

/// What backs a page while it is not resident.
pub enum PageKind {
    /// Anonymous, swap-backed: stack, heap, and writable executable pages
    /// that have been evicted once. Reads as zero until first swapped out.
    Code { swap_slot: Option<usize> },
    /// Executable file region, loaded from `(file, ofs)`.
    File {
        file: File,
        ofs: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    },
    /// Memory-mapped file region; dirty pages are written back to the file.
    Mmap {
        file: File,
        ofs: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
}

pub(crate) struct PageState {
    pub(crate) kind: PageKind,
    /// Kernel alias of the backing frame. Present iff the page is resident.
    pub(crate) frame: Option<usize>,
}

pub struct SptEntry {
    upage: usize,
    /// Writers hold the system pin lock; the victim scanner reads this while
    /// excluding writers via that same lock.
    pinned: AtomicBool,
    pub(crate) state: Mutex<PageState>,
}

impl SptEntry {
    fn new(upage: usize, kind: PageKind) -> SptEntryRef {
        Arc::new(SptEntry {
            upage,
            pinned: AtomicBool::new(false),
            state: Mutex::new(PageState { kind, frame: None }),
        })
    }

    pub fn upage(&self) -> usize {
        self.upage
    }

    pub fn pinned(&self) -> bool {
        self.pinned.load(Ordering::Relaxed)
    }

    /// Caller must hold the system pin lock.
    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Relaxed);
    }

    pub fn is_resident(&self) -> bool {
        self.state.lock().frame.is_some()
    }

    pub(crate) fn is_code(&self) -> bool {
        matches!(self.state.lock().kind, PageKind::Code { .. })
    }

    /// True for a read-only executable page, which write validation refuses.
    pub fn is_read_only_file(&self) -> bool {
        matches!(
            self.state.lock().kind,
            PageKind::File {
                writable: false,
                ..
            }
        )
    }
}

/// Per-process map from user page to entry. Only the owning process's thread
/// touches the map itself; entry fields carry their own synchronization for
/// the eviction scanner.
pub struct Spt {
    entries: Mutex<BTreeMap<usize, SptEntryRef>>,
}

impl Spt {
    pub fn new() -> Spt {
        Spt {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Entry covering `uvaddr`, if any.
    pub fn lookup(&self, uvaddr: usize) -> Option<SptEntryRef> {
        let upage = page_round_down(uvaddr);
        self.entries.lock().get(&upage).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn insert(&self, spte: SptEntryRef) -> SptEntryRef {
        let prev = self.entries.lock().insert(spte.upage, spte.clone());
        debug_assert!(prev.is_none(), "duplicate SPT entry");
        spte
    }

    fn remove(&self, upage: usize) {
        self.entries.lock().remove(&upage);
    }

    fn all_entries(&self) -> Vec<SptEntryRef> {
        self.entries.lock().values().cloned().collect()
    }

    /// Register a new anonymous page. Not yet resident; reads as zero until
    /// loaded.
    pub fn create_code(&self, upage: usize) -> SptEntryRef {
        debug_assert!(is_page_aligned(upage));
        self.insert(SptEntry::new(upage, PageKind::Code { swap_slot: None }))
    }

    /// Register a run of file-backed pages starting at `upage`: `read_bytes`
    /// bytes from `(file, ofs)` followed by `zero_bytes` of zero fill, split
    /// into one entry per page so the evictor can operate page by page.
    pub fn create_file(
        &self,
        file: &File,
        mut ofs: usize,
        mut upage: usize,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) {
        assert!((read_bytes + zero_bytes) % PAGE_FRAME_SIZE == 0);
        assert!(is_page_aligned(upage));
        assert!(is_page_aligned(ofs));

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_FRAME_SIZE);
            let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

            self.insert(SptEntry::new(
                upage,
                PageKind::File {
                    file: file.clone(),
                    ofs,
                    read_bytes: page_read_bytes,
                    zero_bytes: page_zero_bytes,
                    writable,
                },
            ));

            ofs += page_read_bytes;
            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            upage += PAGE_FRAME_SIZE;
        }
    }

    /// Register `length` bytes of `file` mapped at `upage`, one entry per
    /// page. Fails without side effects if the length is zero or any target
    /// page already has an entry. Returns the first entry as the mapping
    /// handle.
    pub fn create_mmap(&self, file: &File, length: usize, upage: usize) -> Option<SptEntryRef> {
        debug_assert!(is_page_aligned(upage));
        if length == 0 {
            return None;
        }

        let mut created: Vec<usize> = Vec::new();
        let mut first = None;
        let mut ofs = 0;
        while ofs < length {
            let page = upage + ofs;
            if self.lookup(page).is_some() {
                // Roll back: the entries just created are not yet resident,
                // so dropping them from the map releases everything.
                for page in created {
                    self.remove(page);
                }
                return None;
            }
            let page_read_bytes = (length - ofs).min(PAGE_FRAME_SIZE);
            let spte = self.insert(SptEntry::new(
                page,
                PageKind::Mmap {
                    file: file.clone(),
                    ofs,
                    read_bytes: page_read_bytes,
                    zero_bytes: PAGE_FRAME_SIZE - page_read_bytes,
                },
            ));
            created.push(page);
            first.get_or_insert(spte);
            ofs += PAGE_FRAME_SIZE;
        }
        first
    }
}

impl Default for Spt {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a load gets its bytes, snapshotted out of the entry so no entry
/// lock is held across frame allocation.
enum Source {
    FileRegion {
        file: File,
        ofs: usize,
        read_bytes: usize,
    },
    SwapSlot(usize),
    ZeroFill,
}

/// Materialize `spte` into a fresh frame and install the mapping.
///
/// Serialized system-wide under the eviction lock so a loader cannot race
/// the victim scanner into a half-resident state. On failure the frame is
/// released and the entry stays non-resident.
pub fn install_load_page(process: &Arc<Process>, spte: &SptEntryRef) -> Result<(), UserFault> {
    let system = &process.system;
    let _evict = system.evict_lock.lock();

    let (source, writable) = {
        let st = spte.state.lock();
        debug_assert!(st.frame.is_none(), "loading a resident page");
        match &st.kind {
            PageKind::Code {
                swap_slot: Some(slot),
            } => (Source::SwapSlot(*slot), true),
            PageKind::Code { swap_slot: None } => (Source::ZeroFill, true),
            PageKind::File {
                file,
                ofs,
                read_bytes,
                writable,
                ..
            } => (
                Source::FileRegion {
                    file: file.clone(),
                    ofs: *ofs,
                    read_bytes: *read_bytes,
                },
                *writable,
            ),
            PageKind::Mmap {
                file,
                ofs,
                read_bytes,
                ..
            } => (
                Source::FileRegion {
                    file: file.clone(),
                    ofs: *ofs,
                    read_bytes: *read_bytes,
                },
                true,
            ),
        }
    };

    let flags = match source {
        Source::ZeroFill => PallocFlags::USER | PallocFlags::ZERO,
        _ => PallocFlags::USER,
    };
    let frame = get_frame_for_page(system, process, spte, flags)?;

    match source {
        Source::FileRegion {
            file,
            ofs,
            read_bytes,
        } => {
            let mut buf = [0u8; PAGE_FRAME_SIZE];
            if file.read_at(&mut buf[..read_bytes], ofs) != read_bytes {
                free_frame(system, frame);
                return Err(UserFault::LoadFailed);
            }
            // buf carries the zero tail
            system.user_pool.write_frame(frame, 0, &buf);
        }
        Source::SwapSlot(slot) => {
            let mut buf = [0u8; PAGE_FRAME_SIZE];
            system.swap.swap_in(slot, &mut buf);
            system.user_pool.write_frame(frame, 0, &buf);
            // The slot is gone; forget it before anything else can fail.
            if let PageKind::Code { swap_slot } = &mut spte.state.lock().kind {
                *swap_slot = None;
            }
        }
        Source::ZeroFill => {}
    }

    if !process.pagedir.install(spte.upage(), frame, writable) {
        free_frame(system, frame);
        return Err(UserFault::LoadFailed);
    }

    spte.state.lock().frame = Some(frame);
    trace!(
        "load: pid {} upage {:#x} -> frame {:#x}",
        process.pid,
        spte.upage(),
        frame
    );
    Ok(())
}

/// Create and load an anonymous page covering `uaddr`, refusing growth past
/// `MAX_STACK_SIZE` below the user ceiling. With `pinned`, the new page is
/// unevictable until the caller unpins it.
pub fn grow_stack(process: &Arc<Process>, uaddr: usize, pinned: bool) -> Result<(), UserFault> {
    debug_assert!(is_user_vaddr(uaddr));
    if OFFSET - uaddr > MAX_STACK_SIZE {
        return Err(UserFault::StackLimit);
    }

    let spte = process.spt.create_code(page_round_down(uaddr));
    {
        let _pin = process.system.pin_lock.lock();
        spte.set_pinned(pinned);
    }
    debug!(
        "stack: pid {} grows to {:#x}",
        process.pid,
        page_round_down(uaddr)
    );
    install_load_page(process, &spte)
}

/// Write a resident file-backed page's bytes to its file region. No-op
/// (and success) when the page directory reports the page clean.
pub fn write_to_disk(process: &Process, spte: &SptEntry) -> bool {
    if !process.pagedir.is_dirty(spte.upage()) {
        return true;
    }
    let st = spte.state.lock();
    write_back_locked(&process.system, &st)
}

/// Unconditional write-back from an already-locked entry. Returns success;
/// true for anonymous pages, which have nothing to write.
pub(crate) fn write_back_locked(system: &System, st: &PageState) -> bool {
    let Some(frame) = st.frame else {
        return false;
    };
    let (file, ofs, read_bytes) = match &st.kind {
        PageKind::File {
            file,
            ofs,
            read_bytes,
            ..
        }
        | PageKind::Mmap {
            file,
            ofs,
            read_bytes,
            ..
        } => (file, *ofs, *read_bytes),
        PageKind::Code { .. } => return true,
    };
    let mut buf = [0u8; PAGE_FRAME_SIZE];
    system.user_pool.read_frame(frame, 0, &mut buf);
    file.write_at(&buf[..read_bytes], ofs) == read_bytes
}

/// Release one entry: write back a dirty file-backed page, detach the
/// mapping, free the frame and any swap slot, and drop the entry from the
/// SPT. Write-back failure is discarded; the process is on its way out.
pub(crate) fn free_spte(process: &Arc<Process>, spte: &SptEntryRef) {
    let system = &process.system;
    // Serialize against the victim scanner, which may hold this entry.
    let _evict = system.evict_lock.lock();

    let (frame, slot) = {
        let mut st = spte.state.lock();
        if st.frame.is_some() {
            let file_backed_dirty = matches!(
                st.kind,
                PageKind::Mmap { .. }
                    | PageKind::File {
                        writable: true,
                        ..
                    }
            );
            if file_backed_dirty && process.pagedir.is_dirty(spte.upage()) {
                let _ = write_back_locked(system, &st);
            }
            process.pagedir.clear(spte.upage());
        }
        let slot = match &mut st.kind {
            PageKind::Code { swap_slot } => swap_slot.take(),
            _ => None,
        };
        (st.frame.take(), slot)
    };

    if let Some(kpage) = frame {
        free_frame(system, kpage);
    }
    if let Some(slot) = slot {
        system.swap.free_slot(slot);
    }
    process.spt.remove(spte.upage());
}

/// Unmap the run of mmap pages beginning at `first`, walking one page per
/// `PAGE_FRAME_SIZE` of the backing file's length and releasing every entry
/// that still maps that file.
pub fn destroy_mmap(process: &Arc<Process>, first: &SptEntryRef) {
    let (file, base) = {
        let st = first.state.lock();
        match &st.kind {
            PageKind::Mmap { file, .. } => (file.clone(), first.upage()),
            _ => return,
        }
    };

    let pages = file.len().div_ceil(PAGE_FRAME_SIZE);
    for i in 0..pages {
        let upage = base + i * PAGE_FRAME_SIZE;
        let Some(spte) = process.spt.lookup(upage) else {
            continue;
        };
        let same = matches!(
            &spte.state.lock().kind,
            PageKind::Mmap { file: f, .. } if f.same_file(&file)
        );
        if same {
            free_spte(process, &spte);
        }
    }
}

/// Free every entry of the process's SPT, releasing frames and swap slots.
pub fn destroy_spt(process: &Arc<Process>) {
    for spte in process.spt.all_entries() {
        free_spte(process, &spte);
    }
}
