//! Shared fixtures for the in-crate tests.

use crate::system::System;
use crate::threading::process::Process;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Typical executable load address.
pub const CODE_BASE: usize = 0x0804_8000;

/// A user stack pointer near the ceiling, far from `CODE_BASE` so the stack
/// heuristic never fires on code addresses.
pub const STACK_ESP: usize = 0xBFFF_FFF0;

/// Fresh machine and one process on it.
pub fn setup(user_frames: usize, swap_slots: usize) -> (Arc<System>, Arc<Process>) {
    let system = System::new(user_frames, swap_slots);
    let process = Process::new(&system);
    (system, process)
}

/// Deterministic non-trivial file image.
pub fn exec_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
