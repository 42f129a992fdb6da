//! The user frame pool.
//!
//! A fixed arena of page frames that user pages are mapped into, with a core
//! map tracking which frames are taken. Frames are identified by their
//! kernel virtual alias (`OFFSET + phys`); all content access goes through
//! the pool so nothing outside it touches the arena directly.

use alloc::boxed::Box;
use alloc::vec;
use bitflags::bitflags;
use bitvec::prelude::*;
use medulla_shared::mem::{is_page_aligned, OFFSET, PAGE_FRAME_SIZE};
use spin::Mutex;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PallocFlags: u8 {
        /// Allocate from the user pool.
        const USER = 1 << 0;
        /// Zero the frame before returning it.
        const ZERO = 1 << 1;
    }
}

pub struct UserPool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    arena: Box<[u8]>,
    // bit set = frame in use
    core_map: BitVec<u64, Lsb0>,
}

impl UserPool {
    pub fn new(frame_count: usize) -> UserPool {
        UserPool {
            inner: Mutex::new(PoolInner {
                arena: vec![0u8; frame_count * PAGE_FRAME_SIZE].into_boxed_slice(),
                core_map: bitvec![u64, Lsb0; 0; frame_count],
            }),
        }
    }

    /// Allocate one frame, returning its kernel alias. `USER` must be set;
    /// `ZERO` requests a zeroed frame. Returns `None` when the pool is full.
    pub fn palloc(&self, flags: PallocFlags) -> Option<usize> {
        assert!(flags.contains(PallocFlags::USER));
        let mut inner = self.inner.lock();
        let index = inner.core_map.iter_zeros().next()?;
        inner.core_map.set(index, true);
        if flags.contains(PallocFlags::ZERO) {
            let base = index * PAGE_FRAME_SIZE;
            inner.arena[base..base + PAGE_FRAME_SIZE].fill(0);
        }
        Some(OFFSET + index * PAGE_FRAME_SIZE)
    }

    /// Return a frame to the pool.
    ///
    /// Panics if `kpage` does not name an allocated frame.
    pub fn pfree(&self, kpage: usize) {
        let index = Self::index_of(kpage);
        let mut inner = self.inner.lock();
        assert!(inner.core_map[index], "pfree of free frame {kpage:#x}");
        inner.core_map.set(index, false);
    }

    /// Copy out of a frame, starting `ofs` bytes in.
    pub fn read_frame(&self, kpage: usize, ofs: usize, buf: &mut [u8]) {
        assert!(ofs + buf.len() <= PAGE_FRAME_SIZE);
        let base = Self::index_of(kpage) * PAGE_FRAME_SIZE + ofs;
        let inner = self.inner.lock();
        buf.copy_from_slice(&inner.arena[base..base + buf.len()]);
    }

    /// Copy into a frame, starting `ofs` bytes in.
    pub fn write_frame(&self, kpage: usize, ofs: usize, buf: &[u8]) {
        assert!(ofs + buf.len() <= PAGE_FRAME_SIZE);
        let base = Self::index_of(kpage) * PAGE_FRAME_SIZE + ofs;
        let mut inner = self.inner.lock();
        inner.arena[base..base + buf.len()].copy_from_slice(buf);
    }

    pub fn frame_count(&self) -> usize {
        self.inner.lock().core_map.len()
    }

    pub fn frames_in_use(&self) -> usize {
        self.inner.lock().core_map.count_ones()
    }

    fn index_of(kpage: usize) -> usize {
        assert!(is_page_aligned(kpage) && kpage >= OFFSET);
        (kpage - OFFSET) / PAGE_FRAME_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_palloc_pfree() {
        let pool = UserPool::new(2);
        let a = pool.palloc(PallocFlags::USER).unwrap();
        let b = pool.palloc(PallocFlags::USER).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.frames_in_use(), 2);
        assert_eq!(pool.palloc(PallocFlags::USER), None);

        pool.pfree(a);
        assert_eq!(pool.frames_in_use(), 1);
        assert_eq!(pool.palloc(PallocFlags::USER), Some(a));
    }

    #[test]
    fn test_zero_fill() {
        let pool = UserPool::new(1);
        let kpage = pool.palloc(PallocFlags::USER).unwrap();
        pool.write_frame(kpage, 0, &[0xFF; PAGE_FRAME_SIZE]);
        pool.pfree(kpage);

        let kpage = pool.palloc(PallocFlags::USER | PallocFlags::ZERO).unwrap();
        let mut buf = [1u8; PAGE_FRAME_SIZE];
        pool.read_frame(kpage, 0, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_frame_io_at_offset() {
        let pool = UserPool::new(1);
        let kpage = pool.palloc(PallocFlags::USER | PallocFlags::ZERO).unwrap();
        pool.write_frame(kpage, 100, &[1, 2, 3]);
        let mut buf = [0u8; 5];
        pool.read_frame(kpage, 99, &mut buf);
        assert_eq!(buf, [0, 1, 2, 3, 0]);
    }

    #[test]
    #[should_panic]
    fn test_double_free_panics() {
        let pool = UserPool::new(1);
        let kpage = pool.palloc(PallocFlags::USER).unwrap();
        pool.pfree(kpage);
        pool.pfree(kpage);
    }
}
