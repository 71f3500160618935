//! Relocation planners: storage occupancy and host memory.

pub mod memory;
pub mod storage;
