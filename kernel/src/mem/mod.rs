//! User-process virtual memory: frame pool, supplemental page table,
//! eviction, and the fault/pin protocol.

pub mod fault;
pub mod frame_table;
pub mod spt;
pub mod user;
pub mod user_pool;

pub use self::fault::UserFault;
