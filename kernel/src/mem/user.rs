//! User-pointer validation and the syscall pinning protocol.
//!
//! Before a syscall body dereferences a user buffer, it validates the range:
//! every page gets its SPT entry pinned (so the evictor cannot take it
//! mid-syscall) and loaded if absent, with stack growth applied when the
//! address sits just below the saved user stack pointer. When the body is
//! done, it unpins the same range. The copy helpers are the only way kernel
//! code touches a pinned buffer's bytes.

use crate::mem::fault::UserFault;
use crate::mem::spt::{grow_stack, install_load_page, SptEntryRef};
use crate::threading::process::Process;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;
use medulla_shared::mem::{
    is_user_vaddr, page_offset, page_round_down, PAGE_FRAME_SIZE, STACK_HEURISTIC,
};

/// Addresses whose pages cover `[ptr, ptr + size)`: the first byte, the last
/// byte, and every interior page boundary.
fn range_addrs(ptr: usize, size: usize) -> Vec<usize> {
    let mut addrs = vec![ptr];
    if size > 1 {
        addrs.push(ptr + size - 1);
    }
    let mut i = PAGE_FRAME_SIZE;
    while i < size {
        addrs.push(ptr + i);
        i += PAGE_FRAME_SIZE;
    }
    addrs
}

fn pin(process: &Process, spte: &SptEntryRef, pinned: bool) {
    let _guard = process.system.pin_lock.lock();
    spte.set_pinned(pinned);
}

/// Validate one user address: pin its page and make it resident, growing the
/// stack when `uaddr` lies within [`STACK_HEURISTIC`] of `esp`.
fn valid_up(process: &Arc<Process>, esp: usize, uaddr: usize) -> Result<(), UserFault> {
    if uaddr == 0 || !is_user_vaddr(uaddr) {
        return Err(UserFault::BadPointer);
    }

    let upage = page_round_down(uaddr);
    if let Some(spte) = process.spt.lookup(uaddr) {
        pin(process, &spte, true);
        if process.pagedir.get_page(upage).is_none() {
            install_load_page(process, &spte)?;
        }
        return Ok(());
    }

    if process.pagedir.get_page(upage).is_some() {
        return Ok(());
    }
    if uaddr >= esp.saturating_sub(STACK_HEURISTIC) {
        return grow_stack(process, uaddr, true);
    }
    Err(UserFault::BadPointer)
}

/// Validate `[ptr, ptr + size)` for a syscall, pinning and loading every
/// page. `esp` is the user stack pointer captured at syscall entry. On
/// error the process must be terminated with status -1.
pub fn validate_user_range(
    process: &Arc<Process>,
    esp: usize,
    ptr: usize,
    size: usize,
) -> Result<(), UserFault> {
    if size == 0 {
        return Ok(());
    }
    if ptr.checked_add(size - 1).is_none() {
        return Err(UserFault::BadPointer);
    }
    for addr in range_addrs(ptr, size) {
        valid_up(process, esp, addr)?;
    }
    Ok(())
}

/// Additional check for buffers the kernel will write into: a page backed
/// by a read-only executable region terminates the process.
pub fn validate_user_write(process: &Arc<Process>, ptr: usize, size: usize) -> Result<(), UserFault> {
    if size == 0 {
        return Ok(());
    }
    for addr in range_addrs(ptr, size) {
        if let Some(spte) = process.spt.lookup(addr) {
            if spte.is_read_only_file() {
                return Err(UserFault::ReadOnly);
            }
        }
    }
    Ok(())
}

/// Validate a NUL-terminated user string starting at `ptr`, pinning every
/// page it touches. Returns the string length (excluding the NUL).
pub fn validate_user_string(
    process: &Arc<Process>,
    esp: usize,
    ptr: usize,
) -> Result<usize, UserFault> {
    valid_up(process, esp, ptr)?;
    let mut len = 0usize;
    loop {
        let addr = ptr.checked_add(len).ok_or(UserFault::BadPointer)?;
        if page_offset(addr) == 0 && len > 0 {
            valid_up(process, esp, addr)?;
        }
        let byte = kernel_read_byte(process, addr).ok_or(UserFault::BadPointer)?;
        if byte == 0 {
            return Ok(len);
        }
        len += 1;
    }
}

/// Unpin every page of `[ptr, ptr + size)`. Best-effort: pages that never
/// got an SPT entry are silently ignored.
pub fn unpin_range(process: &Arc<Process>, ptr: usize, size: usize) {
    if size == 0 {
        return;
    }
    let _guard = process.system.pin_lock.lock();
    for addr in range_addrs(ptr, size) {
        if let Some(spte) = process.spt.lookup(addr) {
            spte.set_pinned(false);
        }
    }
}

/// Unpin the pages of the NUL-terminated string at `ptr`, mirroring
/// [`validate_user_string`] (which also pins the NUL's page).
pub fn unpin_string(process: &Arc<Process>, ptr: usize) {
    let mut len = 0usize;
    while let Some(byte) = kernel_read_byte(process, ptr + len) {
        if byte == 0 {
            break;
        }
        len += 1;
    }
    unpin_range(process, ptr, len + 1);
}

/// Copy `len` bytes out of user memory. The range must be resident (the
/// caller validated and pinned it); returns `None` if any page is unmapped.
pub fn copy_from_user(process: &Arc<Process>, ptr: usize, len: usize) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut addr = ptr;
    while out.len() < len {
        let upage = page_round_down(addr);
        let kpage = process.pagedir.get_page(upage)?;
        let ofs = page_offset(addr);
        let n = min(PAGE_FRAME_SIZE - ofs, len - out.len());
        let mut chunk = vec![0u8; n];
        process.system.user_pool.read_frame(kpage, ofs, &mut chunk);
        out.extend_from_slice(&chunk);
        process.pagedir.set_accessed(upage, true);
        addr += n;
    }
    Some(out)
}

/// Copy `data` into user memory at `ptr`, marking the touched pages dirty
/// the way a user-mode store would. Returns `false` if any page is
/// unmapped.
pub fn copy_to_user(process: &Arc<Process>, ptr: usize, data: &[u8]) -> bool {
    let mut written = 0;
    while written < data.len() {
        let addr = ptr + written;
        let upage = page_round_down(addr);
        let Some(kpage) = process.pagedir.get_page(upage) else {
            return false;
        };
        let ofs = page_offset(addr);
        let n = min(PAGE_FRAME_SIZE - ofs, data.len() - written);
        process
            .system
            .user_pool
            .write_frame(kpage, ofs, &data[written..written + n]);
        process.pagedir.set_accessed(upage, true);
        process.pagedir.set_dirty(upage, true);
        written += n;
    }
    true
}

/// Read one byte through the kernel alias, without faulting or touching the
/// accessed bit. `None` if the page is not resident.
fn kernel_read_byte(process: &Process, vaddr: usize) -> Option<u8> {
    if !is_user_vaddr(vaddr) {
        return None;
    }
    let kpage = process.pagedir.get_page(page_round_down(vaddr))?;
    let mut byte = [0u8];
    process
        .system
        .user_pool
        .read_frame(kpage, page_offset(vaddr), &mut byte);
    Some(byte[0])
}
