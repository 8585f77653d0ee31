//! Storage collaborators for loess: the block device contract with
//! in-memory and file-backed implementations, the node cache contract with
//! a refcounting single-writer implementation, and RAII lease handles.

pub mod cache;
pub mod disk;
pub mod file;
pub mod lease;
mod replacer;

pub use cache::{Cache, NodeCache};
pub use disk::{Disk, MemDisk};
pub use file::FileDisk;
pub use lease::{Lease, ReleaseFn};
