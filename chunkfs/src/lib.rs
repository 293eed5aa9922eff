//! File I/O engine for a POSIX-like filesystem layered over a
//! distributed object store.
//!
//! A logical file is an inode identifier plus a byte range. Bytes live
//! in fixed-size chunk objects named after the inode, except for an
//! optional bounded prefix kept as a key/value entry on the parent
//! directory object (the inline buffer). Concurrent writers from
//! different clients coordinate through an advisory lease on the inode
//! object; the logical size is a monotonic xattr raised by a
//! compare-and-swap. All reads and writes run as batched async
//! operations with per-operation completion tracking.

pub mod fs;
pub mod pool;

#[cfg(test)]
mod io_tests;

pub use fs::errors::{FsError, FsResult};
pub use fs::file_io::{FileIO, ReadHandle, ReadInterval};
pub use fs::FileIoRegistry;
pub use pool::{MemoryPool, ObjectPool, PoolRef, StoreError};
