//! Processes.
//!
//! A process owns its page directory, its supplemental page table, and a
//! registry of active memory mappings. The VM core is otherwise
//! process-agnostic: the frame table refers back here for page-directory
//! bits and mapping teardown during eviction.

use crate::fs::File;
use crate::mem::spt::{destroy_mmap, destroy_spt, Spt, SptEntryRef};
use crate::paging::PageDirectory;
use crate::system::System;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU16;
use log::debug;
use medulla_shared::mem::{is_page_aligned, is_user_vaddr, page_round_up};
use spin::Mutex;

pub type Pid = u16;
pub type AtomicPid = AtomicU16;
pub type MapId = u32;

struct MmapTable {
    next: MapId,
    map: BTreeMap<MapId, SptEntryRef>,
}

pub struct Process {
    pub pid: Pid,
    pub pagedir: PageDirectory,
    pub spt: Spt,
    mmaps: Mutex<MmapTable>,
    exit_code: Mutex<Option<i32>>,
    pub system: Arc<System>,
}

impl Process {
    pub fn new(system: &Arc<System>) -> Arc<Process> {
        Arc::new(Process {
            pid: system.allocate_pid(),
            pagedir: PageDirectory::new(),
            spt: Spt::new(),
            mmaps: Mutex::new(MmapTable {
                next: 0,
                map: BTreeMap::new(),
            }),
            exit_code: Mutex::new(None),
            system: system.clone(),
        })
    }

    /// Map `file` at `uaddr`. The file is reopened, so the mapping outlives
    /// the caller's descriptor. Fails on a null, unaligned, or non-user
    /// target, an empty file, or any overlap with existing entries.
    pub fn mmap(self: &Arc<Self>, file: &File, uaddr: usize) -> Option<MapId> {
        if uaddr == 0 || !is_page_aligned(uaddr) {
            return None;
        }
        let handle = file.reopen();
        let length = handle.len();
        let end = uaddr.checked_add(page_round_up(length))?;
        if !is_user_vaddr(uaddr) || end > medulla_shared::mem::OFFSET {
            return None;
        }

        let first = self.spt.create_mmap(&handle, length, uaddr)?;
        let mut mmaps = self.mmaps.lock();
        let id = mmaps.next;
        mmaps.next += 1;
        mmaps.map.insert(id, first);
        debug!("mmap: pid {} id {} at {:#x}, {} bytes", self.pid, id, uaddr, length);
        Some(id)
    }

    /// Unmap mapping `id`, writing dirty pages back to the file. Returns
    /// `false` for an unknown id.
    pub fn munmap(self: &Arc<Self>, id: MapId) -> bool {
        let Some(first) = self.mmaps.lock().map.remove(&id) else {
            return false;
        };
        destroy_mmap(self, &first);
        true
    }

    /// Terminate the process: release every mapping (with write-back), tear
    /// down the SPT, freeing frames and swap slots, and record `status`.
    pub fn exit(self: &Arc<Self>, status: i32) {
        let firsts: Vec<SptEntryRef> = {
            let mut mmaps = self.mmaps.lock();
            let firsts = mmaps.map.values().cloned().collect();
            mmaps.map.clear();
            firsts
        };
        for first in firsts {
            destroy_mmap(self, &first);
        }
        destroy_spt(self);
        *self.exit_code.lock() = Some(status);
        debug!("exit: pid {} status {}", self.pid, status);
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{File, Vnode};
    use crate::mem::fault::{read_user_byte, write_user_byte};
    use crate::mem::user::validate_user_range;
    use crate::test_util::{setup, CODE_BASE, STACK_ESP};
    use alloc::vec;
    use medulla_shared::mem::PAGE_FRAME_SIZE;

    // Mmap write-back: one dirtied byte lands in the file on unmap; length
    // and all other bytes are unchanged.
    #[test]
    fn test_mmap_write_back_on_unmap() {
        let (_system, process) = setup(4, 4);
        let contents = vec![0x11u8; 5000];
        let vnode = Vnode::new(contents.clone());
        let file = File::open(&vnode);

        let uaddr = CODE_BASE;
        let id = process.mmap(&file, uaddr).unwrap();
        assert_eq!(process.spt.len(), 2);

        write_user_byte(&process, uaddr + 3000, 0xAB, STACK_ESP).unwrap();
        assert!(process.munmap(id));
        assert!(process.spt.is_empty());

        assert_eq!(file.len(), 5000);
        let mut back = vec![0u8; 5000];
        assert_eq!(file.read_at(&mut back, 0), 5000);
        let mut expected = contents;
        expected[3000] = 0xAB;
        assert_eq!(back, expected);
    }

    #[test]
    fn test_mmap_contents_visible_and_clean_unmap_writes_nothing() {
        let (_system, process) = setup(4, 4);
        let vnode = Vnode::new((0..=255u8).cycle().take(4096).collect());
        let file = File::open(&vnode);

        let id = process.mmap(&file, CODE_BASE).unwrap();
        assert_eq!(read_user_byte(&process, CODE_BASE + 77, STACK_ESP).unwrap(), 77);
        assert!(process.munmap(id));

        let mut byte = [0u8];
        file.read_at(&mut byte, 77);
        assert_eq!(byte[0], 77);
    }

    #[test]
    fn test_mmap_screening() {
        let (_system, process) = setup(4, 4);
        let file = File::open(&Vnode::new(vec![1u8; 100]));
        assert!(process.mmap(&file, 0).is_none());
        assert!(process.mmap(&file, CODE_BASE + 1).is_none());
        // A run that would cross the user ceiling.
        let crossing = File::open(&Vnode::new(vec![1u8; 5000]));
        assert!(process
            .mmap(&crossing, medulla_shared::mem::OFFSET - PAGE_FRAME_SIZE)
            .is_none());
        let empty = File::open(&Vnode::new(vec![]));
        assert!(process.mmap(&empty, CODE_BASE).is_none());
        assert!(process.spt.is_empty());
    }

    #[test]
    fn test_munmap_unknown_id() {
        let (_system, process) = setup(4, 4);
        assert!(!process.munmap(7));
    }

    #[test]
    fn test_mapping_survives_closed_descriptor() {
        let (_system, process) = setup(4, 4);
        let vnode = Vnode::new(vec![42u8; 4096]);
        let id = {
            // Descriptor dropped right after the map call.
            let file = File::open(&vnode);
            process.mmap(&file, CODE_BASE).unwrap()
        };
        assert_eq!(read_user_byte(&process, CODE_BASE, STACK_ESP).unwrap(), 42);
        assert!(process.munmap(id));
    }

    // Exit releases every resource: frames back to the pool, swap slots
    // freed, frame table drained, dirty mappings written back.
    #[test]
    fn test_exit_releases_everything() {
        let (system, process) = setup(2, 8);

        let vnode = Vnode::new(vec![0u8; 4096]);
        let file = File::open(&vnode);
        process.mmap(&file, CODE_BASE).unwrap();
        write_user_byte(&process, CODE_BASE + 5, 0x77, STACK_ESP).unwrap();

        // Overcommit so some anonymous pages sit in swap at exit time.
        let anon = CODE_BASE + 16 * PAGE_FRAME_SIZE;
        for i in 0..3 {
            let addr = anon + i * PAGE_FRAME_SIZE;
            process.spt.create_code(addr);
            write_user_byte(&process, addr, i as u8, STACK_ESP).unwrap();
        }
        assert!(system.swap.slots_in_use() > 0);

        process.exit(-1);
        assert_eq!(process.exit_code(), Some(-1));
        assert!(process.spt.is_empty());
        assert_eq!(system.user_pool.frames_in_use(), 0);
        assert_eq!(system.swap.slots_in_use(), 0);
        assert!(system.frame_table.is_empty());

        // The dirty mmap byte made it to the file.
        let mut byte = [0u8];
        file.read_at(&mut byte, 5);
        assert_eq!(byte[0], 0x77);
    }

    // Two processes may hold the same user page independently.
    #[test]
    fn test_spt_keys_are_per_process() {
        let (_system, a) = setup(8, 4);
        let b = Process::new(&a.system);
        a.spt.create_code(CODE_BASE);
        b.spt.create_code(CODE_BASE);
        write_user_byte(&a, CODE_BASE, 1, STACK_ESP).unwrap();
        write_user_byte(&b, CODE_BASE, 2, STACK_ESP).unwrap();
        assert_eq!(read_user_byte(&a, CODE_BASE, STACK_ESP).unwrap(), 1);
        assert_eq!(read_user_byte(&b, CODE_BASE, STACK_ESP).unwrap(), 2);
    }

    #[test]
    fn test_pinned_syscall_buffer_then_exit() {
        let (system, process) = setup(2, 8);
        process.spt.create_code(CODE_BASE);
        validate_user_range(&process, STACK_ESP, CODE_BASE, 16).unwrap();
        // Exit with the page still pinned; teardown ignores pinning.
        process.exit(0);
        assert_eq!(system.user_pool.frames_in_use(), 0);
    }
}
