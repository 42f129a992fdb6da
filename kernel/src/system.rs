//! Aggregated machine state for the VM core.
//!
//! One `System` is one machine: the user frame pool, the global frame
//! table, the swap device, and the two system-wide locks of the paging
//! protocol. Lock order is fixed: eviction lock, then pin lock, then frame
//! table, then per-entry state, then file locks.

use crate::mem::frame_table::FrameTable;
use crate::mem::user_pool::UserPool;
use crate::swapping::SwapDevice;
use crate::threading::process::{AtomicPid, Pid};
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use spin::Mutex;

pub struct System {
    pub user_pool: UserPool,
    pub frame_table: FrameTable,
    pub swap: SwapDevice,
    /// Protects the `pinned` flag of every SPT entry.
    pub pin_lock: Mutex<()>,
    /// Serializes page loads with each other and with eviction.
    pub evict_lock: Mutex<()>,
    next_pid: AtomicPid,
}

impl System {
    pub fn new(user_frames: usize, swap_slots: usize) -> Arc<System> {
        Arc::new(System {
            user_pool: UserPool::new(user_frames),
            frame_table: FrameTable::new(),
            swap: SwapDevice::new(swap_slots),
            pin_lock: Mutex::new(()),
            evict_lock: Mutex::new(()),
            next_pid: AtomicPid::new(1),
        })
    }

    pub fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid == 0 {
            panic!("PID overflow");
        }
        pid
    }
}

impl core::fmt::Debug for System {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "<System>")
    }
}
