//! Page-fault handling.
//!
//! Entry point for faults taken on user addresses, plus the user-access
//! helpers the trap path uses: a fault on a known page loads it lazily, a
//! fault just below the stack pointer grows the stack, anything else kills
//! the process.

use crate::mem::spt::{grow_stack, install_load_page};
use crate::paging::Translation;
use crate::threading::process::Process;
use alloc::sync::Arc;
use core::error::Error;
use core::fmt;
use log::debug;
use medulla_shared::mem::{is_user_vaddr, page_offset, page_round_down, STACK_HEURISTIC};

/// Why a user memory access was refused. Every variant terminates the
/// faulting process with exit status -1; none of them is a kernel error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserFault {
    /// Address outside user space, or no backing for it.
    BadPointer,
    /// Write to a read-only page.
    ReadOnly,
    /// Stack growth past `MAX_STACK_SIZE`.
    StackLimit,
    /// Backing store could not produce the page (short file read or a
    /// mapping conflict).
    LoadFailed,
    /// No free swap slot while evicting on this process's behalf.
    OutOfSwap,
}

impl fmt::Display for UserFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserFault::BadPointer => write!(f, "bad user pointer"),
            UserFault::ReadOnly => write!(f, "write to read-only page"),
            UserFault::StackLimit => write!(f, "stack growth limit exceeded"),
            UserFault::LoadFailed => write!(f, "page could not be loaded"),
            UserFault::OutOfSwap => write!(f, "out of swap slots"),
        }
    }
}

impl Error for UserFault {}

/// Handle a page fault at `fault_addr` with user stack pointer `esp`.
///
/// Returns `Ok` when the faulting access can be retried; `Err` means the
/// process must be terminated with status -1.
pub fn handle_fault(process: &Arc<Process>, fault_addr: usize, esp: usize) -> Result<(), UserFault> {
    if !is_user_vaddr(fault_addr) {
        return Err(UserFault::BadPointer);
    }

    if let Some(spte) = process.spt.lookup(fault_addr) {
        if process
            .pagedir
            .get_page(page_round_down(fault_addr))
            .is_some()
        {
            // Present but faulting: a protection violation, not demand paging.
            return Err(UserFault::ReadOnly);
        }
        return install_load_page(process, &spte);
    }

    if fault_addr >= esp.saturating_sub(STACK_HEURISTIC) {
        return grow_stack(process, fault_addr, false);
    }

    debug!(
        "fault: pid {} unresolvable access at {:#x}",
        process.pid, fault_addr
    );
    Err(UserFault::BadPointer)
}

/// One user-mode byte read at `vaddr`, faulting the page in as the MMU
/// would. `esp` is the user stack pointer at the access.
pub fn read_user_byte(process: &Arc<Process>, vaddr: usize, esp: usize) -> Result<u8, UserFault> {
    loop {
        match process.pagedir.translate(vaddr, false) {
            Translation::Frame(kpage) => {
                let mut byte = [0u8];
                process
                    .system
                    .user_pool
                    .read_frame(kpage, page_offset(vaddr), &mut byte);
                return Ok(byte[0]);
            }
            Translation::ReadOnly => unreachable!("reads cannot violate protection"),
            Translation::NotPresent => handle_fault(process, vaddr, esp)?,
        }
    }
}

/// One user-mode byte write at `vaddr`; see [`read_user_byte`].
pub fn write_user_byte(
    process: &Arc<Process>,
    vaddr: usize,
    value: u8,
    esp: usize,
) -> Result<(), UserFault> {
    loop {
        match process.pagedir.translate(vaddr, true) {
            Translation::Frame(kpage) => {
                process
                    .system
                    .user_pool
                    .write_frame(kpage, page_offset(vaddr), &[value]);
                return Ok(());
            }
            Translation::ReadOnly => return Err(UserFault::ReadOnly),
            Translation::NotPresent => handle_fault(process, vaddr, esp)?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{setup, CODE_BASE, STACK_ESP};
    use medulla_shared::mem::{MAX_STACK_SIZE, OFFSET, PAGE_FRAME_SIZE};

    // Stack growth: a write a few bytes below ESP faults in one zeroed
    // anonymous page; a write below the growth limit kills the process.
    #[test]
    fn test_stack_growth_heuristic() {
        let (_system, process) = setup(4, 4);
        let esp = 0xBFFF_FFF0;
        let addr = 0xBFFF_FFEC;
        write_user_byte(&process, addr, 0x42, esp).unwrap();

        let spte = process.spt.lookup(addr).unwrap();
        assert_eq!(spte.upage(), page_round_down(addr));
        assert!(spte.is_resident());
        assert_eq!(read_user_byte(&process, addr, esp).unwrap(), 0x42);
        // The rest of the page is zero fill.
        assert_eq!(read_user_byte(&process, addr + 1, esp).unwrap(), 0);

        // Far below this stack, the heuristic rejects outright.
        let too_deep = OFFSET - (MAX_STACK_SIZE + 1);
        assert_eq!(
            write_user_byte(&process, too_deep, 1, esp),
            Err(UserFault::BadPointer)
        );
        // Even when ESP itself is down there, growth past the limit is
        // refused.
        assert_eq!(
            write_user_byte(&process, too_deep, 1, too_deep + 4),
            Err(UserFault::StackLimit)
        );
    }

    #[test]
    fn test_fault_far_below_esp_is_fatal() {
        let (_system, process) = setup(4, 4);
        let esp = 0xBFFF_F000;
        // 33 bytes below ESP: outside the PUSHA window.
        assert_eq!(
            handle_fault(&process, esp - STACK_HEURISTIC - 1, esp),
            Err(UserFault::BadPointer)
        );
        // 32 bytes below: inside it.
        assert!(handle_fault(&process, esp - STACK_HEURISTIC, esp).is_ok());
    }

    #[test]
    fn test_fault_on_kernel_address_is_fatal() {
        let (_system, process) = setup(4, 4);
        assert_eq!(
            handle_fault(&process, OFFSET, STACK_ESP),
            Err(UserFault::BadPointer)
        );
        assert_eq!(
            handle_fault(&process, OFFSET + 123, STACK_ESP),
            Err(UserFault::BadPointer)
        );
    }

    #[test]
    fn test_write_to_read_only_file_page_is_fatal() {
        let (_system, process) = setup(4, 4);
        let file = crate::fs::File::open(&crate::fs::Vnode::new(alloc::vec![9u8; PAGE_FRAME_SIZE]));
        process
            .spt
            .create_file(&file, 0, CODE_BASE, PAGE_FRAME_SIZE, 0, false);

        assert_eq!(read_user_byte(&process, CODE_BASE, STACK_ESP).unwrap(), 9);
        assert_eq!(
            write_user_byte(&process, CODE_BASE, 1, STACK_ESP),
            Err(UserFault::ReadOnly)
        );
    }
}
