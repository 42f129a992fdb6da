//! In-memory file layer.
//!
//! Stands in for the block-backed filesystem: a [`Vnode`] holds the bytes of
//! one file, and a [`File`] is an open handle with its own position. Handles
//! on the same vnode share contents, so a mapping that reopens a file keeps
//! observing (and producing) the same data as the original descriptor.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use spin::Mutex;

pub struct Vnode {
    data: Mutex<Vec<u8>>,
}

impl Vnode {
    pub fn new(contents: Vec<u8>) -> Arc<Vnode> {
        Arc::new(Vnode {
            data: Mutex::new(contents),
        })
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn read_at(&self, buf: &mut [u8], ofs: usize) -> usize {
        let data = self.data.lock();
        if ofs >= data.len() {
            return 0;
        }
        let n = min(buf.len(), data.len() - ofs);
        buf[..n].copy_from_slice(&data[ofs..ofs + n]);
        n
    }

    // Writes never extend the file; bytes past the end are dropped.
    fn write_at(&self, buf: &[u8], ofs: usize) -> usize {
        let mut data = self.data.lock();
        if ofs >= data.len() {
            return 0;
        }
        let n = min(buf.len(), data.len() - ofs);
        data[ofs..ofs + n].copy_from_slice(&buf[..n]);
        n
    }
}

/// An open file: a shared vnode plus a private position.
pub struct File {
    vnode: Arc<Vnode>,
    pos: Mutex<usize>,
}

impl File {
    pub fn open(vnode: &Arc<Vnode>) -> File {
        File {
            vnode: vnode.clone(),
            pos: Mutex::new(0),
        }
    }

    /// New independent handle on the same file, positioned at the start.
    pub fn reopen(&self) -> File {
        File::open(&self.vnode)
    }

    pub fn len(&self) -> usize {
        self.vnode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read into `buf` starting at `ofs`, without moving the position.
    /// Returns the number of bytes read, short only at end of file.
    pub fn read_at(&self, buf: &mut [u8], ofs: usize) -> usize {
        self.vnode.read_at(buf, ofs)
    }

    /// Write `buf` at `ofs`, without moving the position. Returns the number
    /// of bytes written, short only when the write runs past end of file.
    pub fn write_at(&self, buf: &[u8], ofs: usize) -> usize {
        self.vnode.write_at(buf, ofs)
    }

    /// Read from the current position, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.vnode.read_at(buf, *pos);
        *pos += n;
        n
    }

    /// Write at the current position, advancing it.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.vnode.write_at(buf, *pos);
        *pos += n;
        n
    }

    pub fn seek(&self, pos: usize) {
        *self.pos.lock() = pos;
    }

    pub fn tell(&self) -> usize {
        *self.pos.lock()
    }

    /// Whether two handles refer to the same underlying file.
    pub fn same_file(&self, other: &File) -> bool {
        Arc::ptr_eq(&self.vnode, &other.vnode)
    }
}

impl Clone for File {
    fn clone(&self) -> Self {
        File {
            vnode: self.vnode.clone(),
            pos: Mutex::new(*self.pos.lock()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_read_at_clamps_to_len() {
        let file = File::open(&Vnode::new(vec![1, 2, 3, 4, 5]));
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 0), 5);
        assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(file.read_at(&mut buf, 3), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(file.read_at(&mut buf, 5), 0);
    }

    #[test]
    fn test_write_at_does_not_extend() {
        let file = File::open(&Vnode::new(vec![0u8; 4]));
        assert_eq!(file.write_at(&[9, 9, 9], 2), 2);
        assert_eq!(file.len(), 4);
        let mut buf = [0u8; 4];
        file.read_at(&mut buf, 0);
        assert_eq!(buf, [0, 0, 9, 9]);
    }

    #[test]
    fn test_reopen_shares_contents_with_independent_position() {
        let file = File::open(&Vnode::new(vec![7u8; 8]));
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf), 4);
        assert_eq!(file.tell(), 4);

        let other = file.reopen();
        assert_eq!(other.tell(), 0);
        assert!(other.same_file(&file));

        other.write_at(&[1], 0);
        file.read_at(&mut buf, 0);
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn test_seek_and_sequential_io() {
        let file = File::open(&Vnode::new(vec![0u8; 6]));
        file.seek(2);
        assert_eq!(file.write(&[5, 6]), 2);
        assert_eq!(file.tell(), 4);
        file.seek(0);
        let mut buf = [0u8; 6];
        assert_eq!(file.read(&mut buf), 6);
        assert_eq!(buf, [0, 0, 5, 6, 0, 0]);
    }
}
